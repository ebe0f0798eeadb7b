#![no_std]

use core::fmt::{Arguments, Result, Write};

use klocks::SpinNoIrqMutex;
use simple_logger::LogSink;

/// 绕过所有锁打印一个字符
#[inline]
fn putchar_raw(c: u8) {
    #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
    {
        #[allow(deprecated)]
        sbi_rt::legacy::console_putchar(c as usize);
    }
    // 宿主机上没有 SBI，直接丢弃
    #[cfg(not(any(target_arch = "riscv32", target_arch = "riscv64")))]
    let _ = c;
}

/// 标准输出
pub struct Stdout(());

impl Write for Stdout {
    fn write_str(&mut self, s: &str) -> Result {
        for &c in s.as_bytes() {
            putchar_raw(c);
        }
        Ok(())
    }
}

pub static STDOUT: SpinNoIrqMutex<Stdout> = SpinNoIrqMutex::new(Stdout(()));

/// 内核日志的输出端，整行在一次持锁内写完，不会和其他 hart 的输出交错
pub struct SbiConsole(());

pub static SBI_CONSOLE: SbiConsole = SbiConsole(());

impl LogSink for SbiConsole {
    fn write_args(&self, args: Arguments<'_>) {
        let _ = STDOUT.lock().write_fmt(args);
    }
}
