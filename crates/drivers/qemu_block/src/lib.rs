//! 基于中断的 VirtIO 块设备驱动
//!
//! 一次只有一个请求在队列中，每个请求是一条 indirect 描述符链：
//! 请求头、一个块的数据、状态字节

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

mod chain;
mod device;
mod queue;
mod request;

pub use chain::{build_chain, ChainAddrs};
pub use device::{VirtioBlk, BLK_DEVICE_NAME};
pub use request::{BlkReqHeader, BlkReqType, BlkStatus};
