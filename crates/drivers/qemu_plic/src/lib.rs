//! QEMU `virt` 平台的 PLIC 驱动
//!
//! 寄存器布局参考 RISC-V PLIC 规范，只使用一个 context（hart 0）。
//! 文档注释里的 §N 指的是该规范的章节

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

mod dispatch;
mod plic;
mod regs;
#[cfg(any(test, feature = "sim"))]
mod sim;

pub use dispatch::Interrupts;
pub use plic::Plic;
pub use regs::{
    claim_offset, enable_offset, pending_offset, priority_offset, threshold_offset, MmioPlic,
    PlicIo,
};
#[cfg(any(test, feature = "sim"))]
pub use sim::SimPlic;
