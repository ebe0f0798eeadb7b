//! QEMU `virt` 平台相关的常量

/// PLIC 寄存器块的基址
pub const PLIC_BASE: usize = 0x0C00_0000;
/// PLIC 支持的中断源数量（含保留的 0 号）
pub const PLIC_SOURCE_COUNT: usize = 0x400;
/// 目前只支持单个 context，即 hart 0 的 M 态
pub const PLIC_CONTEXT: usize = 0;

/// 第一个 VirtIO MMIO 设备的地址
pub const VIRTIO_MMIO_BASE: usize = 0x1000_1000;
/// 相邻两个 VirtIO MMIO 设备的间隔
pub const VIRTIO_MMIO_STRIDE: usize = 0x1000;
/// QEMU `virt` 上 VirtIO MMIO 槽位的数量
pub const VIRTIO_MMIO_COUNT: usize = 8;
/// 第 `i` 个槽位使用 `VIRTIO_FIRST_IRQ + i` 号中断
pub const VIRTIO_FIRST_IRQ: u32 = 1;

/// 块设备中断源的优先级
pub const VIOBLK_IRQ_PRIO: u32 = 1;
/// 设备未提供块大小时使用的默认值
pub const DEFAULT_BLOCK_SIZE: u32 = 512;
/// 块设备只用一个 virtqueue
pub const BLK_QUEUE_ID: u16 = 0;
/// 一个请求用到的描述符数量，也就是队列的大小
pub const BLK_QUEUE_SIZE: u16 = 4;
