//! VirtIO 传输层
//!
//! [`VirtioTransport`] 是驱动看到的设备，[`MmioTransport`] 是它在 VirtIO-MMIO 上的实现。
//! 另外还有 virtqueue 的内存布局和 DMA 内存的分配

#![cfg_attr(not(any(test, feature = "sim")), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

mod mmio;
mod queue;
#[cfg(any(test, feature = "sim"))]
mod sim;

use bitflags::bitflags;
use defines::error::KResult;
use num_enum::FromPrimitive;

pub use mmio::MmioTransport;
pub use queue::{AvailRing, DescFlags, Descriptor, Dma, DmaBuffer, UsedElem, UsedRing};
#[cfg(any(test, feature = "sim"))]
pub use sim::SimBlkDevice;

/// Device ID，见 VirtIO 1.2 §5
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum DeviceType {
    Invalid = 0,
    Network = 1,
    Block = 2,
    Console = 3,
    EntropySource = 4,
    Gpu = 16,
    Input = 18,
    Socket = 19,
    #[num_enum(catch_all)]
    Other(u32),
}

bitflags! {
    /// Device Status Field，见 VirtIO 1.2 §2.1
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const NEEDS_RESET = 64;
        const FAILED = 128;
    }
}

bitflags! {
    /// 用到的 feature bits，通用的见 VirtIO 1.2 §6，块设备的见 §5.2.3
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Features: u64 {
        const BLK_RO = 1 << 5;
        const BLK_BLK_SIZE = 1 << 6;
        const BLK_TOPOLOGY = 1 << 10;
        const INDIRECT_DESC = 1 << 28;
        const VERSION_1 = 1 << 32;
        const RING_RESET = 1 << 40;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InterruptStatus: u32 {
        const USED_BUFFER = 1;
        const CONFIG_CHANGE = 2;
    }
}

/// 块设备的配置空间，见 VirtIO 1.2 §5.2.4
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlkConfig {
    /// 以扇区为单位
    pub capacity: u64,
    pub size_max: u32,
    pub seg_max: u32,
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
    pub blk_size: u32,
    pub physical_block_exp: u8,
    pub alignment_offset: u8,
    pub min_io_size: u16,
    pub opt_io_size: u32,
}

/// 从设备提供的 feature 中选出驱动接受的部分。缺少 `needed` 中的任何一位时返回 `None`
pub fn select_features(offered: Features, wanted: Features, needed: Features) -> Option<Features> {
    if !offered.contains(needed) {
        return None;
    }
    Some(offered & (wanted | needed | Features::VERSION_1))
}

/// 驱动眼中的 VirtIO 设备
pub trait VirtioTransport: Send + Sync {
    fn device_type(&self) -> DeviceType;

    fn status(&self) -> DeviceStatus;
    /// 写入空状态会重置设备
    fn set_status(&self, status: DeviceStatus);
    fn add_status(&self, status: DeviceStatus) {
        self.set_status(self.status() | status);
    }

    /// 协商 feature，成功后设备处于 `FEATURES_OK` 状态
    fn negotiate_features(&self, wanted: Features, needed: Features) -> KResult<Features>;

    fn read_blk_config(&self) -> BlkConfig;

    /// 告诉设备 virtqueue 的大小和三块内存的地址
    fn attach_queue(&self, qid: u16, size: u16, desc: usize, used: usize, avail: usize);
    fn enable_queue(&self, qid: u16);
    /// 重置后设备会忘掉 virtqueue 的地址，需要重新 `attach_queue`
    fn reset_queue(&self, qid: u16);

    fn notify_avail(&self, qid: u16);

    fn interrupt_status(&self) -> InterruptStatus;
    fn ack_interrupt(&self, status: InterruptStatus);
}
