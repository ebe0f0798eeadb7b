use defines::config::PLIC_SOURCE_COUNT;

const U32_BITS: usize = u32::BITS as _;

/// See §4.
#[inline]
pub const fn priority_offset(source: usize) -> usize {
    4 * source
}

/// See §5.
#[inline]
pub const fn pending_offset(source: usize) -> usize {
    0x1000 + 4 * (source / U32_BITS)
}

/// See §6.
#[inline]
pub const fn enable_offset(context: usize, source: usize) -> usize {
    0x2000 + 0x80 * context + 4 * (source / U32_BITS)
}

/// See §7.
#[inline]
pub const fn threshold_offset(context: usize) -> usize {
    0x20_0000 + 0x1000 * context
}

/// See §8 and §9.
#[inline]
pub const fn claim_offset(context: usize) -> usize {
    0x20_0004 + 0x1000 * context
}

const _: () = assert!(enable_offset(1, 0) - enable_offset(0, 0) == PLIC_SOURCE_COUNT / 8);

/// 对 PLIC 寄存器的 32 位访问，`offset` 相对于寄存器块的基址
pub trait PlicIo: Send + Sync {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);
}

/// 真实硬件上的 PLIC 寄存器
pub struct MmioPlic {
    base: usize,
}

impl MmioPlic {
    /// # Safety
    ///
    /// `base` 必须是映射好的 PLIC 寄存器块，且不会被其他代码当作普通内存使用
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl PlicIo for MmioPlic {
    #[inline]
    fn read(&self, offset: usize) -> u32 {
        let ptr = (self.base + offset) as *const u32;
        unsafe { ptr.read_volatile() }
    }

    #[inline]
    fn write(&self, offset: usize, value: u32) {
        let ptr = (self.base + offset) as *mut u32;
        unsafe { ptr.write_volatile(value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_offsets() {
        assert_eq!(priority_offset(0), 0);
        assert_eq!(priority_offset(1), 0x4);
        assert_eq!(priority_offset(1023), 0xffc);

        assert_eq!(pending_offset(1), 0x1000);
        assert_eq!(pending_offset(31), 0x1000);
        assert_eq!(pending_offset(32), 0x1004);
        assert_eq!(pending_offset(1023), 0x107c);

        assert_eq!(enable_offset(0, 1), 0x2000);
        assert_eq!(enable_offset(0, 33), 0x2004);
        assert_eq!(enable_offset(1, 0), 0x2080);
        assert_eq!(enable_offset(2, 64), 0x2108);

        assert_eq!(threshold_offset(0), 0x20_0000);
        assert_eq!(threshold_offset(1), 0x20_1000);
        assert_eq!(claim_offset(0), 0x20_0004);
        assert_eq!(claim_offset(3), 0x20_3004);
    }

    #[test]
    fn mmio_uses_base_plus_offset() {
        let mut regs = [0u32; 4];
        let plic = unsafe { MmioPlic::new(regs.as_mut_ptr() as usize) };
        plic.write(priority_offset(2), 7);
        assert_eq!(plic.read(8), 7);
        assert_eq!(regs[2], 7);
    }
}
