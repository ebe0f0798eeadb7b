use core::{
    ptr::{addr_of, addr_of_mut},
    sync::atomic::{fence, Ordering},
};

use defines::config::BLK_QUEUE_SIZE;
use virtio_glue::{AvailRing, Descriptor, Dma, DmaBuffer, UsedRing};

use crate::{
    build_chain,
    request::{BlkReqHeader, BlkReqType, STATUS_PENDING},
    ChainAddrs,
};

const QSIZE: usize = BLK_QUEUE_SIZE as usize;

/// 一个块设备独占的 virtqueue 及请求用到的内存
///
/// 所有访问都是对裸指针的 volatile 读写，调用者负责保证同一时刻只有一个请求
pub(crate) struct RequestQueue {
    desc: Dma<[Descriptor; QSIZE]>,
    avail: Dma<AvailRing<QSIZE>>,
    used: Dma<UsedRing<QSIZE>>,
    header: Dma<BlkReqHeader>,
    status: Dma<u8>,
    data: DmaBuffer,
    block_size: u32,
}

impl RequestQueue {
    pub fn new(block_size: u32) -> Self {
        let queue = Self {
            desc: Dma::zeroed(),
            avail: Dma::zeroed(),
            used: Dma::zeroed(),
            header: Dma::zeroed(),
            status: Dma::zeroed(),
            data: DmaBuffer::new(block_size as usize),
            block_size,
        };
        queue.write_chain(BlkReqType::In);
        queue
    }

    pub fn desc_addr(&self) -> usize {
        self.desc.addr()
    }

    pub fn avail_addr(&self) -> usize {
        self.avail.addr()
    }

    pub fn used_addr(&self) -> usize {
        self.used.addr()
    }

    /// 数据缓冲区，大小为一个块
    pub fn data(&self) -> &DmaBuffer {
        &self.data
    }

    fn write_chain(&self, op: BlkReqType) {
        let chain = build_chain(
            op,
            &ChainAddrs {
                table: self.desc.addr(),
                header: self.header.addr(),
                data: self.data.addr(),
                status: self.status.addr(),
                block_size: self.block_size,
            },
        );
        unsafe { self.desc.as_ptr().write_volatile(chain) };
    }

    /// 填写请求头、按方向重建描述符链，并把状态字节置为哨兵值
    pub fn prepare(&self, op: BlkReqType, sector: u64) {
        unsafe {
            self.header
                .as_ptr()
                .write_volatile(BlkReqHeader::new(op, sector));
            self.status.as_ptr().write_volatile(STATUS_PENDING);
        }
        self.write_chain(op);
    }

    /// 把链头 0 放入 avail ring 并发布，返回请求完成时 used ring 应达到的下标
    pub fn publish(&self) -> u16 {
        let avail = self.avail.as_ptr();
        unsafe {
            let idx = addr_of!((*avail).idx).read_volatile();
            addr_of_mut!((*avail).ring[idx as usize % QSIZE]).write_volatile(0);
            fence(Ordering::SeqCst);
            let next = idx.wrapping_add(1);
            addr_of_mut!((*avail).idx).write_volatile(next);
            fence(Ordering::SeqCst);
            next
        }
    }

    pub fn used_idx(&self) -> u16 {
        fence(Ordering::SeqCst);
        unsafe { addr_of!((*self.used.as_ptr()).idx).read_volatile() }
    }

    pub fn status(&self) -> u8 {
        fence(Ordering::SeqCst);
        unsafe { self.status.as_ptr().read_volatile() }
    }

    /// virtqueue 重置后两边的下标都从 0 开始
    pub fn reset_rings(&self) {
        unsafe {
            addr_of_mut!((*self.avail.as_ptr()).idx).write_volatile(0);
            addr_of_mut!((*self.used.as_ptr()).idx).write_volatile(0);
        }
        fence(Ordering::SeqCst);
    }
}
