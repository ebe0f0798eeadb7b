//! 块设备（以及任何字节流）通用的 ioctl 命令
//!
//! 编号沿用内核文件系统侧的约定，文件和块设备共用同一套命令

use num_enum::TryFromPrimitive;

/// 字节流总长度（字节）
pub const IOCTL_GETLEN: usize = 1;
/// 当前读写位置
pub const IOCTL_GETPOS: usize = 2;
/// 设置读写位置，不允许超过总长度
pub const IOCTL_SETPOS: usize = 3;
/// 块大小
pub const IOCTL_GETBLKSZ: usize = 4;

#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum IoctlCmd {
    GetLen = 1,
    GetPos = 2,
    SetPos = 3,
    GetBlkSz = 4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes() {
        assert_eq!(IoctlCmd::try_from(IOCTL_GETLEN).ok(), Some(IoctlCmd::GetLen));
        assert_eq!(IoctlCmd::try_from(IOCTL_SETPOS).ok(), Some(IoctlCmd::SetPos));
        assert_eq!(IoctlCmd::try_from(IOCTL_GETBLKSZ).ok(), Some(IoctlCmd::GetBlkSz));
        assert!(IoctlCmd::try_from(0).is_err());
        assert!(IoctlCmd::try_from(5).is_err());
    }
}
