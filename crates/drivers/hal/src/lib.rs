//! 驱动与内核其余部分之间的约定
//!
//! 字节流接口 [`Io`]、设备打开接口 [`Device`]、按名字登记设备的 [`DeviceRegistry`]，
//! 以及中断分发相关的 [`IrqHandler`] 和 [`IrqControl`]

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod io;
mod irq;
mod registry;

pub use io::{AKResult, Device, Io};
pub use irq::{IrqControl, IrqHandler};
pub use registry::{DeviceRegistry, DEVICES};
