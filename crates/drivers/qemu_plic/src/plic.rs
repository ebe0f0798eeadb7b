use defines::config::{PLIC_CONTEXT, PLIC_SOURCE_COUNT};

use crate::regs::{
    claim_offset, enable_offset, pending_offset, priority_offset, threshold_offset, PlicIo,
};

const U32_BITS: usize = u32::BITS as _;

/// 0 号源保留
fn is_valid_source(source: u32) -> bool {
    source != 0 && (source as usize) < PLIC_SOURCE_COUNT
}

/// PLIC 驱动
///
/// 低层接口可以指定 context，高层接口固定使用 [`PLIC_CONTEXT`]
pub struct Plic<R> {
    io: R,
}

impl<R: PlicIo> Plic<R> {
    pub const fn new(io: R) -> Self {
        Self { io }
    }

    pub fn io(&self) -> &R {
        &self.io
    }

    /// Sets priority for interrupt `source` to `value`.
    ///
    /// Write `0` to priority `value` effectively disables this interrupt `source`, for the priority
    /// value 0 is reserved for "never interrupt" by the PLIC specification.
    ///
    /// See §4.
    #[inline]
    pub fn set_priority(&self, source: usize, value: u32) {
        self.io.write(priority_offset(source), value);
    }

    /// Check if interrupt `source` is pending.
    ///
    /// See §5.
    #[inline]
    pub fn is_pending(&self, source: usize) -> bool {
        self.io.read(pending_offset(source)) & (1 << (source % U32_BITS)) != 0
    }

    /// Enable interrupt `source` in `context`.
    ///
    /// See §6.
    #[inline]
    pub fn enable(&self, source: usize, context: usize) {
        let offset = enable_offset(context, source);
        let word = self.io.read(offset);
        self.io.write(offset, word | (1 << (source % U32_BITS)));
    }

    /// Disable interrupt `source` in `context`.
    ///
    /// See §6.
    #[inline]
    pub fn disable(&self, source: usize, context: usize) {
        let offset = enable_offset(context, source);
        let word = self.io.read(offset);
        self.io.write(offset, word & !(1 << (source % U32_BITS)));
    }

    /// Set interrupt threshold for `context` to `value`.
    ///
    /// See §7.
    #[inline]
    pub fn set_threshold(&self, context: usize, value: u32) {
        self.io.write(threshold_offset(context), value);
    }

    /// Claim an interrupt in `context`, returning its source, or 0 if nothing is pending.
    ///
    /// It is always legal for a hart to perform a claim even if `EIP` is not set.
    ///
    /// See §8.
    #[inline]
    pub fn claim(&self, context: usize) -> u32 {
        self.io.read(claim_offset(context))
    }

    /// Mark that interrupt identified by `source` is completed in `context`.
    ///
    /// See §9.
    #[inline]
    pub fn complete(&self, context: usize, source: u32) {
        self.io.write(claim_offset(context), source);
    }

    /// 所有中断源优先级置 0（即屏蔽），并对 context 0 使能，阈值置 0。可以重复调用
    pub fn init(&self) {
        for source in 0..PLIC_SOURCE_COUNT {
            self.set_priority(source, 0);
            self.enable(source, PLIC_CONTEXT);
        }
        self.set_threshold(PLIC_CONTEXT, 0);
    }

    /// 以正数优先级打开中断源
    pub fn enable_irq(&self, source: u32, priority: u32) {
        if !is_valid_source(source) {
            warn!("enable_irq: source {source} out of range, ignored");
            return;
        }
        trace!("enable irq {source} with priority {priority}");
        debug_assert!(priority > 0, "priority 0 means never interrupt");
        self.set_priority(source as usize, priority);
    }

    pub fn disable_irq(&self, source: u32) {
        if source == 0 {
            debug!("disable_irq: source 0 is reserved, ignored");
            return;
        }
        if !is_valid_source(source) {
            warn!("disable_irq: source {source} out of range, ignored");
            return;
        }
        self.set_priority(source as usize, 0);
    }

    pub fn claim_irq(&self) -> u32 {
        let source = self.claim(PLIC_CONTEXT);
        trace!("claim irq {source}");
        source
    }

    pub fn close_irq(&self, source: u32) {
        trace!("close irq {source}");
        self.complete(PLIC_CONTEXT, source);
    }
}

#[cfg(test)]
mod tests {
    use defines::config::PLIC_SOURCE_COUNT;

    use super::Plic;
    use crate::{enable_offset, priority_offset, threshold_offset, PlicIo, SimPlic};

    fn plic() -> Plic<SimPlic> {
        let plic = Plic::new(SimPlic::new());
        plic.init();
        plic
    }

    #[test]
    fn init_state() {
        let plic = plic();
        assert_eq!(plic.io().read(priority_offset(1)), 0);
        assert_eq!(plic.io().read(enable_offset(0, 0)), u32::MAX);
        assert_eq!(plic.io().read(enable_offset(0, 1023)), u32::MAX);
        assert_eq!(plic.io().read(threshold_offset(0)), 0);
        // 可以重复初始化
        plic.enable_irq(3, 2);
        plic.init();
        assert_eq!(plic.io().read(priority_offset(3)), 0);
    }

    #[test]
    fn claim_discipline() {
        let plic = plic();
        assert_eq!(plic.claim_irq(), 0);

        plic.enable_irq(1, 1);
        plic.io().raise(1);
        assert!(plic.is_pending(1));
        assert_eq!(plic.claim_irq(), 1);
        assert!(!plic.is_pending(1));

        // 完成前不能再次 claim 同一个源
        plic.io().raise(1);
        assert_eq!(plic.claim_irq(), 0);

        plic.close_irq(1);
        assert_eq!(plic.claim_irq(), 1);
        plic.close_irq(1);
        assert_eq!(plic.claim_irq(), 0);
    }

    #[test]
    fn priority_zero_never_interrupts() {
        let plic = plic();
        plic.io().raise(5);
        assert_eq!(plic.claim_irq(), 0);
        plic.enable_irq(5, 1);
        assert_eq!(plic.claim_irq(), 5);
        plic.close_irq(5);

        plic.disable_irq(5);
        plic.io().raise(5);
        assert_eq!(plic.claim_irq(), 0);
        // 0 号源是保留的
        plic.disable_irq(0);
    }

    /// 只记录写操作
    #[derive(Default)]
    struct WriteLog(std::sync::Mutex<Vec<(usize, u32)>>);

    impl PlicIo for WriteLog {
        fn read(&self, _offset: usize) -> u32 {
            0
        }

        fn write(&self, offset: usize, value: u32) {
            self.0.lock().unwrap().push((offset, value));
        }
    }

    #[test]
    fn out_of_range_source_is_ignored() {
        let plic = Plic::new(WriteLog::default());
        let source = PLIC_SOURCE_COUNT as u32;
        plic.enable_irq(source, 1);
        plic.disable_irq(source);
        // priority_offset(2048) 就是 context 0 的第一个使能字
        assert_eq!(priority_offset(2048), enable_offset(0, 0));
        plic.enable_irq(2048, 1);
        plic.disable_irq(2048);
        plic.disable_irq(0);
        assert!(plic.io().0.lock().unwrap().is_empty());

        plic.enable_irq(source - 1, 1);
        assert_eq!(
            *plic.io().0.lock().unwrap(),
            [(priority_offset(PLIC_SOURCE_COUNT - 1), 1)]
        );
    }

    #[test]
    fn threshold_and_priority_ordering() {
        let plic = plic();
        plic.enable_irq(2, 1);
        plic.enable_irq(7, 3);
        plic.enable_irq(9, 3);
        plic.io().raise(2);
        plic.io().raise(7);
        plic.io().raise(9);

        plic.set_threshold(0, 1);
        // 同优先级时编号小的先
        assert_eq!(plic.claim_irq(), 7);
        assert_eq!(plic.claim_irq(), 9);
        // 优先级不超过阈值的不会被 claim
        assert_eq!(plic.claim_irq(), 0);

        plic.set_threshold(0, 0);
        assert_eq!(plic.claim_irq(), 2);
        for source in [2, 7, 9] {
            plic.close_irq(source);
        }
    }

    #[test]
    fn disabled_in_context() {
        let plic = plic();
        plic.enable_irq(40, 1);
        plic.disable(40, 0);
        plic.io().raise(40);
        assert_eq!(plic.claim_irq(), 0);
        plic.enable(40, 0);
        assert_eq!(plic.claim_irq(), 40);
        plic.close_irq(40);
    }
}
