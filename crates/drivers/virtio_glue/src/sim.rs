//! 软件模拟的 VirtIO 块设备
//!
//! 存储是一段内存，扇区大小与块大小相同。只支持 split virtqueue，
//! 描述符链既可以是直接的，也可以是单个 indirect 描述符指向的表

use alloc::{sync::Arc, vec, vec::Vec};
use core::{
    mem::size_of,
    sync::atomic::{fence, Ordering},
};
use std::{thread, time::Duration};

use defines::error::{errno, KResult};
use klocks::SpinMutex;

use crate::{
    select_features, BlkConfig, DescFlags, Descriptor, DeviceStatus, DeviceType, Features,
    InterruptStatus, UsedElem, VirtioTransport,
};

const REQ_IN: u32 = 0;
const REQ_OUT: u32 = 1;
const STATUS_OK: u8 = 0;
const STATUS_IOERR: u8 = 1;
const STATUS_UNSUPP: u8 = 2;

/// 延迟完成时后台线程等待的时间
const DEFERRED_DELAY: Duration = Duration::from_millis(2);

#[derive(Clone, Copy)]
struct SimQueue {
    size: u16,
    desc: usize,
    used: usize,
    avail: usize,
    ready: bool,
}

struct SimState {
    device_type: DeviceType,
    storage: Vec<u8>,
    block_size: u32,
    offered: Features,
    accepted: Features,
    status: DeviceStatus,
    queue: Option<SimQueue>,
    last_avail: u16,
    interrupt_status: InterruptStatus,
    reported_sectors: Option<u64>,
    fail_next: Option<u8>,
    deferred: bool,
    completed: usize,
}

type IrqCallback = Arc<dyn Fn() + Send + Sync>;

struct SimInner {
    state: SpinMutex<SimState>,
    raise: SpinMutex<Option<IrqCallback>>,
}

/// 克隆出来的句柄指向同一个设备
#[derive(Clone)]
pub struct SimBlkDevice {
    inner: Arc<SimInner>,
}

impl SimBlkDevice {
    /// `sectors` 个 `block_size` 字节的扇区，提供驱动需要的全部 feature
    pub fn new(sectors: u64, block_size: u32) -> Self {
        let offered = Features::INDIRECT_DESC
            | Features::RING_RESET
            | Features::VERSION_1
            | Features::BLK_BLK_SIZE
            | Features::BLK_TOPOLOGY;
        Self {
            inner: Arc::new(SimInner {
                state: SpinMutex::new(SimState {
                    device_type: DeviceType::Block,
                    storage: vec![0; (sectors * block_size as u64) as usize],
                    block_size,
                    offered,
                    accepted: Features::empty(),
                    status: DeviceStatus::empty(),
                    queue: None,
                    last_avail: 0,
                    interrupt_status: InterruptStatus::empty(),
                    reported_sectors: None,
                    fail_next: None,
                    deferred: false,
                    completed: 0,
                }),
                raise: SpinMutex::new(None),
            }),
        }
    }

    /// 只保留 `mask` 中的 feature
    pub fn with_feature_mask(self, mask: Features) -> Self {
        self.inner.state.lock().offered &= mask;
        self
    }

    pub fn read_only(self) -> Self {
        self.inner.state.lock().offered |= Features::BLK_RO;
        self
    }

    pub fn with_device_type(self, device_type: DeviceType) -> Self {
        self.inner.state.lock().device_type = device_type;
        self
    }

    /// 配置空间里报告 `sectors` 个扇区，和实际存储无关
    pub fn with_reported_sectors(self, sectors: u64) -> Self {
        self.inner.state.lock().reported_sectors = Some(sectors);
        self
    }

    /// 请求由后台线程稍后完成，而不是在 notify 时立即完成
    pub fn set_deferred(&self, deferred: bool) {
        self.inner.state.lock().deferred = deferred;
    }

    /// 下一个请求以 `status` 失败，不读写存储
    pub fn fail_next(&self, status: u8) {
        self.inner.state.lock().fail_next = Some(status);
    }

    /// 设备完成请求后调用，相当于拉高中断线
    pub fn set_irq_callback(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.inner.raise.lock() = Some(Arc::new(f));
    }

    /// 只置上配置变更中断并拉高中断线
    pub fn raise_config_change(&self) {
        self.inner.state.lock().interrupt_status |= InterruptStatus::CONFIG_CHANGE;
        self.raise_irq();
    }

    pub fn storage(&self) -> Vec<u8> {
        self.inner.state.lock().storage.clone()
    }

    pub fn fill(&self, offset: usize, bytes: &[u8]) {
        self.inner.state.lock().storage[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// 已经完成的请求数
    pub fn completed(&self) -> usize {
        self.inner.state.lock().completed
    }

    pub fn accepted_features(&self) -> Features {
        self.inner.state.lock().accepted
    }

    fn process(&self) {
        let progressed = {
            let mut state = self.inner.state.lock();
            state.process_avail()
        };
        if progressed {
            self.raise_irq();
        }
    }

    // 不能持着设备锁回调，回调里可能会读中断状态
    fn raise_irq(&self) {
        let raise = self.inner.raise.lock().clone();
        if let Some(raise) = raise {
            raise();
        }
    }
}

impl SimState {
    fn process_avail(&mut self) -> bool {
        let Some(queue) = self.queue.filter(|q| q.ready) else {
            return false;
        };
        let size = queue.size as usize;
        // avail ring: flags, idx, ring[size]
        // used ring: flags, idx, ring[size] of {id, len}
        let avail_idx = (queue.avail + 2) as *const u16;
        let used_idx = (queue.used + 2) as *mut u16;
        let mut progressed = false;
        loop {
            fence(Ordering::SeqCst);
            let avail = unsafe { avail_idx.read_volatile() };
            if avail == self.last_avail {
                break;
            }
            let slot = queue.avail + 4 + 2 * (self.last_avail as usize % size);
            let head = unsafe { (slot as *const u16).read_volatile() };
            let written = self.execute(queue, head);

            let used = unsafe { used_idx.read_volatile() };
            let elem = queue.used + 4 + size_of::<UsedElem>() * (used as usize % size);
            unsafe {
                (elem as *mut UsedElem).write_volatile(UsedElem {
                    id: head as u32,
                    len: written,
                });
            }
            fence(Ordering::SeqCst);
            unsafe { used_idx.write_volatile(used.wrapping_add(1)) };

            self.last_avail = self.last_avail.wrapping_add(1);
            self.completed += 1;
            progressed = true;
        }
        if progressed {
            self.interrupt_status |= InterruptStatus::USED_BUFFER;
        }
        progressed
    }

    /// 执行一个请求，返回写入驱动内存的字节数
    fn execute(&mut self, queue: SimQueue, head: u16) -> u32 {
        let chain = read_chain(queue, head);
        let Some((status_desc, body)) = chain.split_last() else {
            return 0;
        };
        let Some((header, data)) = body.split_first() else {
            return 0;
        };
        let req_type = unsafe { (header.addr as *const u32).read_unaligned() };
        let sector = unsafe { (header.addr as *const u64).add(1).read_unaligned() };

        let mut written = 0;
        let status = match self.fail_next.take() {
            Some(status) => status,
            None => match req_type {
                REQ_IN | REQ_OUT => {
                    let mut offset = sector as usize * self.block_size as usize;
                    let mut status = STATUS_OK;
                    for d in data {
                        let len = d.len as usize;
                        if offset + len > self.storage.len() {
                            status = STATUS_IOERR;
                            break;
                        }
                        let storage = &mut self.storage[offset..offset + len];
                        if req_type == REQ_IN {
                            unsafe {
                                core::ptr::copy_nonoverlapping(
                                    storage.as_ptr(),
                                    d.addr as *mut u8,
                                    len,
                                );
                            }
                            written += d.len;
                        } else {
                            unsafe {
                                core::ptr::copy_nonoverlapping(
                                    d.addr as *const u8,
                                    storage.as_mut_ptr(),
                                    len,
                                );
                            }
                        }
                        offset += len;
                    }
                    status
                }
                _ => STATUS_UNSUPP,
            },
        };
        unsafe { (status_desc.addr as *mut u8).write_volatile(status) };
        written + 1
    }
}

/// 沿着 NEXT 收集描述符。头部是 INDIRECT 时改为遍历它指向的表
fn read_chain(queue: SimQueue, head: u16) -> Vec<Descriptor> {
    let read = |table: usize, i: u16| unsafe {
        (table as *const Descriptor).add(i as usize).read_volatile()
    };
    let first = read(queue.desc, head);
    let (table, limit, mut index) = if first.flags().contains(DescFlags::INDIRECT) {
        (first.addr as usize, first.len as usize / 16, 0)
    } else {
        (queue.desc, queue.size as usize, head)
    };
    let mut chain = Vec::new();
    while chain.len() < limit {
        let desc = read(table, index);
        chain.push(desc);
        if !desc.flags().contains(DescFlags::NEXT) {
            break;
        }
        index = desc.next;
    }
    chain
}

impl VirtioTransport for SimBlkDevice {
    fn device_type(&self) -> DeviceType {
        self.inner.state.lock().device_type
    }

    fn status(&self) -> DeviceStatus {
        self.inner.state.lock().status
    }

    fn set_status(&self, status: DeviceStatus) {
        let mut state = self.inner.state.lock();
        if status.is_empty() {
            state.accepted = Features::empty();
            state.queue = None;
            state.last_avail = 0;
            state.interrupt_status = InterruptStatus::empty();
        }
        state.status = status;
    }

    fn negotiate_features(&self, wanted: Features, needed: Features) -> KResult<Features> {
        let mut state = self.inner.state.lock();
        let accepted = select_features(state.offered, wanted, needed).ok_or(errno::UNSUPPORTED)?;
        state.accepted = accepted;
        state.status |= DeviceStatus::FEATURES_OK;
        Ok(accepted)
    }

    fn read_blk_config(&self) -> BlkConfig {
        let state = self.inner.state.lock();
        BlkConfig {
            capacity: state
                .reported_sectors
                .unwrap_or(state.storage.len() as u64 / state.block_size as u64),
            blk_size: state.block_size,
            seg_max: 1,
            ..BlkConfig::default()
        }
    }

    fn attach_queue(&self, _qid: u16, size: u16, desc: usize, used: usize, avail: usize) {
        let mut state = self.inner.state.lock();
        state.queue = Some(SimQueue {
            size,
            desc,
            used,
            avail,
            ready: false,
        });
        state.last_avail = 0;
    }

    fn enable_queue(&self, _qid: u16) {
        if let Some(queue) = &mut self.inner.state.lock().queue {
            queue.ready = true;
        }
    }

    fn reset_queue(&self, _qid: u16) {
        let mut state = self.inner.state.lock();
        state.queue = None;
        state.last_avail = 0;
    }

    fn notify_avail(&self, _qid: u16) {
        if self.inner.state.lock().deferred {
            let this = self.clone();
            thread::spawn(move || {
                thread::sleep(DEFERRED_DELAY);
                this.process();
            });
        } else {
            self.process();
        }
    }

    fn interrupt_status(&self) -> InterruptStatus {
        self.inner.state.lock().interrupt_status
    }

    fn ack_interrupt(&self, status: InterruptStatus) {
        self.inner.state.lock().interrupt_status &= !status;
    }
}

impl core::fmt::Debug for SimBlkDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SimBlkDevice")
            .field("capacity", &state.storage.len())
            .field("block_size", &state.block_size)
            .field("status", &state.status)
            .finish()
    }
}
