use alloc::{collections::BTreeMap, sync::Weak};

use hal::{IrqControl, IrqHandler};
use klocks::SpinNoIrqMutex;

use crate::{Plic, PlicIo};

struct IsrEntry {
    priority: u32,
    handler: Weak<dyn IrqHandler>,
}

/// 外部中断分发器
///
/// 驱动通过 [`IrqControl`] 登记处理程序，陷入处理时调用 [`Interrupts::handle_external`]
pub struct Interrupts<R> {
    plic: Plic<R>,
    isr_table: SpinNoIrqMutex<BTreeMap<u32, IsrEntry>>,
}

impl<R: PlicIo> Interrupts<R> {
    pub const fn new(plic: Plic<R>) -> Self {
        Self {
            plic,
            isr_table: SpinNoIrqMutex::new(BTreeMap::new()),
        }
    }

    pub fn plic(&self) -> &Plic<R> {
        &self.plic
    }

    pub fn init(&self) {
        self.plic.init();
    }

    /// claim 一个中断并调用对应的处理程序，最后总会 complete。
    ///
    /// 没有待处理的中断时返回 `None`
    pub fn handle_external(&self) -> Option<u32> {
        let source = self.plic.claim_irq();
        if source == 0 {
            return None;
        }
        // 处理程序可能回调 `IrqControl`，不能持着表锁调用
        let handler = self
            .isr_table
            .lock()
            .get(&source)
            .and_then(|entry| entry.handler.upgrade());
        match handler {
            Some(handler) => handler.handle_irq(source),
            None => warn!("unexpected external interrupt from source {source}"),
        }
        self.plic.close_irq(source);
        Some(source)
    }
}

impl<R: PlicIo> IrqControl for Interrupts<R> {
    fn register_isr(&self, source: u32, priority: u32, handler: Weak<dyn IrqHandler>) {
        debug_assert!(source != 0);
        let old = self
            .isr_table
            .lock()
            .insert(source, IsrEntry { priority, handler });
        if old.is_some() {
            debug!("isr of source {source} replaced");
        }
    }

    fn enable_irq(&self, source: u32) {
        let priority = self.isr_table.lock().get(&source).map(|e| e.priority);
        match priority {
            Some(priority) => self.plic.enable_irq(source, priority),
            None => warn!("enable_irq: no isr registered for source {source}"),
        }
    }

    fn disable_irq(&self, source: u32) {
        self.plic.disable_irq(source);
    }
}
