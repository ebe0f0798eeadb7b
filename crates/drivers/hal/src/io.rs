use alloc::sync::Arc;

use defines::error::KResult;
use futures::future::BoxFuture;

/// 异步的 `KResult`，trait 里的异步方法都返回它
pub type AKResult<'a, T> = BoxFuture<'a, KResult<T>>;

/// 打开后得到的字节流
///
/// 读写从当前位置开始，返回实际完成的字节数，到达设备末尾时返回的数量会变少
pub trait Io: Send + Sync {
    fn close(&self);
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> AKResult<'a, usize>;
    fn write<'a>(&'a self, buf: &'a [u8]) -> AKResult<'a, usize>;
    /// 命令码见 `defines::ioctl`。`arg` 同时作为输入和输出
    fn ioctl(&self, cmd: usize, arg: Option<&mut u64>) -> KResult<()>;
}

/// 登记在 [`DeviceRegistry`](crate::DeviceRegistry) 中的设备
pub trait Device: Send + Sync {
    fn open(self: Arc<Self>) -> KResult<Arc<dyn Io>>;
}
