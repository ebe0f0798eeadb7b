use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error(core::ffi::c_int);

impl Error {
    #[inline]
    pub fn as_isize(self) -> isize {
        self.0 as isize
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(errno::error_info(self.as_isize()))
    }
}

pub type KResult<T = isize> = core::result::Result<T, Error>;

pub mod errno {
    macro_rules! declare_errno {
        ($($name:tt, $errno:literal, $desc:literal,)*) => {
            $(#[doc = $desc]
            pub const $name: super::Error = super::Error($errno);)*
            pub fn error_info(errno: isize) -> &'static str {
                match errno {
                    $($errno => ::core::concat!(stringify!($name), ", ", $desc),)*
                    _ => "Unknown error",
                }
            }
        };
    }

    #[rustfmt::skip]
    declare_errno!(
        UNSUPPORTED, -1024, "Do not support",

        EIO,            -5,     "I/O error.",
        EBADF,          -9,     "Bad file number.",
        EBUSY,          -16,    "Device or resource busy.",
        ENODEV,         -19,    "No such device.",
        EINVAL,         -22,    "Invalid argument.",
        EROFS,          -30,    "Read-only file system.",
    );
}
