//! 块设备请求的格式，见 VirtIO 1.2 §5.2.6

use bytemuck::{Pod, Zeroable};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive)]
pub enum BlkReqType {
    /// 设备到内存
    In = 0,
    /// 内存到设备
    Out = 1,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum BlkStatus {
    Ok = 0,
    IoErr = 1,
    Unsupported = 2,
}

/// 提交前写入状态字节，设备不会写出这个值
pub const STATUS_PENDING: u8 = 0xff;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BlkReqHeader {
    pub req_type: u32,
    pub reserved: u32,
    pub sector: u64,
}

impl BlkReqHeader {
    pub fn new(op: BlkReqType, sector: u64) -> Self {
        Self {
            req_type: op.into(),
            reserved: 0,
            sector,
        }
    }
}
