use alloc::sync::Weak;

/// 中断处理程序。运行在中断上下文中，不能阻塞
pub trait IrqHandler: Send + Sync {
    fn handle_irq(&self, source: u32);
}

/// 中断控制器对驱动暴露的接口
pub trait IrqControl: Send + Sync {
    /// 登记中断处理程序和优先级，但不使能该中断源
    fn register_isr(&self, source: u32, priority: u32, handler: Weak<dyn IrqHandler>);
    /// 以登记时的优先级使能中断源
    fn enable_irq(&self, source: u32);
    fn disable_irq(&self, source: u32);
}
