use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
};
use core::sync::atomic::{fence, AtomicU64, Ordering};

use defines::{
    config::{BLK_QUEUE_ID, BLK_QUEUE_SIZE, DEFAULT_BLOCK_SIZE, VIOBLK_IRQ_PRIO},
    error::{errno, KResult},
    ioctl::IoctlCmd,
};
use hal::{AKResult, Device, DeviceRegistry, Io, IrqControl, IrqHandler};
use klocks::{Completion, Once, SleepMutex, SpinMutex};
use virtio_glue::{DeviceStatus, DeviceType, Features, InterruptStatus, VirtioTransport};

use crate::{queue::RequestQueue, BlkReqType, BlkStatus};

/// 块设备在设备表中的名字
pub const BLK_DEVICE_NAME: &str = "blk";

/// 缺少任意一个都无法工作
const NEEDED_FEATURES: Features = Features::INDIRECT_DESC.union(Features::RING_RESET);
const WANTED_FEATURES: Features = Features::BLK_BLK_SIZE
    .union(Features::BLK_TOPOLOGY)
    .union(Features::BLK_RO);

struct Lifecycle {
    opened: bool,
    /// 关闭时重置了 virtqueue，设备已经忘掉了它的地址
    needs_reattach: bool,
}

/// 被事务锁保护的状态
struct BlkInner {
    /// 数据缓冲区中现在是哪一块
    cached_block: Option<u64>,
    /// 已经处理过的重置轮次
    epoch: u64,
}

pub struct VirtioBlk<T> {
    transport: T,
    irq: u32,
    intc: Arc<dyn IrqControl>,
    instno: Once<usize>,
    block_size: u32,
    /// 字节数
    capacity: u64,
    features: Features,
    pos: AtomicU64,
    lifecycle: SpinMutex<Lifecycle>,
    /// 每次关闭加一
    reset_epoch: AtomicU64,
    used_updated: Completion,
    queue: RequestQueue,
    inner: SleepMutex<BlkInner>,
}

impl<T: VirtioTransport + 'static> VirtioBlk<T> {
    /// 初始化设备，向中断控制器登记中断处理程序，并以 [`BLK_DEVICE_NAME`] 登记到设备表。
    ///
    /// 设备需已处于 `ACKNOWLEDGE` 状态。失败时不会登记任何东西
    pub fn attach(
        transport: T,
        irq: u32,
        intc: Arc<dyn IrqControl>,
        registry: &DeviceRegistry,
    ) -> KResult<Arc<Self>> {
        let device_type = transport.device_type();
        if device_type != DeviceType::Block {
            warn!("virtio device with irq {irq} is {device_type:?}, not a block device");
            return Err(errno::ENODEV);
        }
        transport.add_status(DeviceStatus::DRIVER);
        fence(Ordering::SeqCst);

        let features = match transport.negotiate_features(WANTED_FEATURES, NEEDED_FEATURES) {
            Ok(features) => features,
            Err(_) => {
                error!("virtio block device with irq {irq}: feature negotiation failed");
                transport.add_status(DeviceStatus::FAILED);
                return Err(errno::UNSUPPORTED);
            }
        };

        let config = transport.read_blk_config();
        let block_size = if features.contains(Features::BLK_BLK_SIZE) && config.blk_size != 0 {
            config.blk_size
        } else {
            DEFAULT_BLOCK_SIZE
        };
        debug!("virtio block device with irq {irq}: block size {block_size}");
        let Some(capacity) = config.capacity.checked_mul(u64::from(block_size)) else {
            error!(
                "virtio block device with irq {irq}: capacity of {} sectors overflows",
                config.capacity
            );
            transport.add_status(DeviceStatus::FAILED);
            return Err(errno::EINVAL);
        };

        let queue = RequestQueue::new(block_size);
        let blk = Arc::new(Self {
            transport,
            irq,
            intc,
            instno: Once::new(),
            block_size,
            capacity,
            features,
            pos: AtomicU64::new(0),
            lifecycle: SpinMutex::new(Lifecycle {
                opened: false,
                needs_reattach: false,
            }),
            reset_epoch: AtomicU64::new(0),
            used_updated: Completion::new(),
            queue,
            inner: SleepMutex::new(BlkInner {
                cached_block: None,
                epoch: 0,
            }),
        });

        let handler: Weak<dyn IrqHandler> = Arc::downgrade(&blk) as _;
        blk.intc.register_isr(irq, VIOBLK_IRQ_PRIO, handler);
        let instno = registry.register(BLK_DEVICE_NAME, Arc::clone(&blk) as _);
        blk.instno.call_once(|| instno);

        blk.attach_queue();
        blk.transport.add_status(DeviceStatus::DRIVER_OK);
        fence(Ordering::SeqCst);

        info!(
            "{BLK_DEVICE_NAME}{instno}: {} bytes, block size {block_size}{}",
            blk.capacity,
            if blk.is_read_only() { ", read-only" } else { "" },
        );
        Ok(blk)
    }
}

impl<T: VirtioTransport> VirtioBlk<T> {
    pub fn instno(&self) -> Option<usize> {
        self.instno.get().copied()
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn is_read_only(&self) -> bool {
        self.features.contains(Features::BLK_RO)
    }

    fn is_opened(&self) -> bool {
        self.lifecycle.lock().opened
    }

    fn attach_queue(&self) {
        self.transport.attach_queue(
            BLK_QUEUE_ID,
            BLK_QUEUE_SIZE,
            self.queue.desc_addr(),
            self.queue.used_addr(),
            self.queue.avail_addr(),
        );
    }

    fn open_device(&self) -> KResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.opened {
            return Err(errno::EBUSY);
        }
        if lifecycle.needs_reattach {
            self.attach_queue();
            lifecycle.needs_reattach = false;
        }
        self.transport.enable_queue(BLK_QUEUE_ID);
        self.intc.enable_irq(self.irq);
        lifecycle.opened = true;
        drop(lifecycle);
        info!("{BLK_DEVICE_NAME}{} opened", self.instno().unwrap_or(0));
        Ok(())
    }

    fn close_device(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if !lifecycle.opened {
            return;
        }
        self.transport.reset_queue(BLK_QUEUE_ID);
        self.intc.disable_irq(self.irq);
        lifecycle.opened = false;
        lifecycle.needs_reattach = true;
        self.reset_epoch.fetch_add(1, Ordering::SeqCst);
        drop(lifecycle);
        info!("{BLK_DEVICE_NAME}{} closed", self.instno().unwrap_or(0));
    }

    /// 关闭过的话，virtqueue 已被重置，下标归零，缓存作废
    fn sync_epoch(&self, inner: &mut BlkInner) {
        let epoch = self.reset_epoch.load(Ordering::SeqCst);
        if inner.epoch != epoch {
            self.queue.reset_rings();
            self.used_updated.reset();
            inner.cached_block = None;
            inner.epoch = epoch;
        }
    }

    /// 对第 `blkno` 块执行一次请求，写请求的数据需已在缓冲区中
    async fn transact(&self, inner: &mut BlkInner, op: BlkReqType, blkno: u64) -> KResult<()> {
        // 失败时缓冲区的内容不可信
        inner.cached_block = None;
        self.queue.prepare(op, blkno);
        self.used_updated.reset();
        let expected = self.queue.publish();
        self.transport.notify_avail(BLK_QUEUE_ID);

        while self.queue.used_idx() != expected {
            self.used_updated.wait().await;
        }

        match BlkStatus::try_from(self.queue.status()) {
            Ok(BlkStatus::Ok) => {
                inner.cached_block = Some(blkno);
                Ok(())
            }
            status => {
                warn!("{BLK_DEVICE_NAME}: {op:?} of block {blkno} failed: {status:?}");
                Err(errno::EIO)
            }
        }
    }

    /// 保证缓冲区中是第 `blkno` 块
    async fn load_block(&self, inner: &mut BlkInner, blkno: u64) -> KResult<()> {
        if inner.cached_block == Some(blkno) {
            return Ok(());
        }
        self.transact(inner, BlkReqType::In, blkno).await
    }

    async fn read_bytes(&self, buf: &mut [u8]) -> KResult<usize> {
        if !self.is_opened() {
            return Err(errno::EBADF);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock().await;
        self.sync_epoch(&mut inner);

        let block_size = self.block_size as u64;
        let mut pos = self.pos.load(Ordering::SeqCst);
        let len = usize::min(buf.len(), self.capacity.saturating_sub(pos) as usize);
        let mut nread = 0;
        while nread < len {
            let blkno = pos / block_size;
            let block_offset = (pos % block_size) as usize;
            let copy_len = usize::min(len - nread, self.block_size as usize - block_offset);
            self.load_block(&mut inner, blkno).await?;
            self.queue
                .data()
                .read_at(block_offset, &mut buf[nread..nread + copy_len]);
            nread += copy_len;
            pos += copy_len as u64;
            self.pos.store(pos, Ordering::SeqCst);
        }
        Ok(nread)
    }

    async fn write_bytes(&self, buf: &[u8]) -> KResult<usize> {
        if !self.is_opened() {
            return Err(errno::EBADF);
        }
        if self.is_read_only() {
            return Err(errno::EROFS);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock().await;
        self.sync_epoch(&mut inner);

        let block_size = self.block_size as u64;
        let mut pos = self.pos.load(Ordering::SeqCst);
        let len = usize::min(buf.len(), self.capacity.saturating_sub(pos) as usize);
        let mut nwrite = 0;
        while nwrite < len {
            let blkno = pos / block_size;
            let block_offset = (pos % block_size) as usize;
            let copy_len = usize::min(len - nwrite, self.block_size as usize - block_offset);
            // 不满一块时先读出整块再修改
            if copy_len != self.block_size as usize {
                self.load_block(&mut inner, blkno).await?;
            }
            self.queue
                .data()
                .write_at(block_offset, &buf[nwrite..nwrite + copy_len]);
            self.transact(&mut inner, BlkReqType::Out, blkno).await?;
            nwrite += copy_len;
            pos += copy_len as u64;
            self.pos.store(pos, Ordering::SeqCst);
        }
        Ok(nwrite)
    }
}

impl<T: VirtioTransport> IrqHandler for VirtioBlk<T> {
    fn handle_irq(&self, source: u32) {
        if source != self.irq {
            return;
        }
        let status = self.transport.interrupt_status();
        if status.is_empty() {
            return;
        }
        self.transport.ack_interrupt(status);
        if status.contains(InterruptStatus::USED_BUFFER) {
            self.used_updated.complete();
        }
    }
}

impl<T: VirtioTransport> Io for VirtioBlk<T> {
    fn close(&self) {
        self.close_device();
    }

    fn read<'a>(&'a self, buf: &'a mut [u8]) -> AKResult<'a, usize> {
        Box::pin(self.read_bytes(buf))
    }

    fn write<'a>(&'a self, buf: &'a [u8]) -> AKResult<'a, usize> {
        Box::pin(self.write_bytes(buf))
    }

    fn ioctl(&self, cmd: usize, arg: Option<&mut u64>) -> KResult<()> {
        let Ok(cmd) = IoctlCmd::try_from(cmd) else {
            return Err(errno::UNSUPPORTED);
        };
        let arg = arg.ok_or(errno::EINVAL)?;
        trace!("{BLK_DEVICE_NAME}: ioctl {cmd:?} {arg}");
        match cmd {
            IoctlCmd::GetLen => *arg = self.capacity,
            IoctlCmd::GetPos => *arg = self.pos.load(Ordering::SeqCst),
            IoctlCmd::SetPos => {
                if *arg > self.capacity {
                    return Err(errno::EINVAL);
                }
                self.pos.store(*arg, Ordering::SeqCst);
            }
            IoctlCmd::GetBlkSz => *arg = self.block_size as u64,
        }
        Ok(())
    }
}

impl<T: VirtioTransport + 'static> Device for VirtioBlk<T> {
    fn open(self: Arc<Self>) -> KResult<Arc<dyn Io>> {
        self.open_device()?;
        Ok(self)
    }
}
