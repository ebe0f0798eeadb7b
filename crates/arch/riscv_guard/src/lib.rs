#![no_std]

use core::marker::PhantomData;

use riscv::register::sstatus;

/// 在生命周期内关闭当前 hart 的 S 态中断，析构时恢复原状态
pub struct NoIrqGuard {
    before: bool,
    // 不允许 Guard 越过 .await
    _not_send: PhantomData<*const ()>,
}

impl NoIrqGuard {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let before = sstatus::read().sie();
        if before {
            unsafe {
                sstatus::clear_sie();
            }
        }
        Self {
            before,
            _not_send: PhantomData,
        }
    }
}

impl Drop for NoIrqGuard {
    fn drop(&mut self) {
        if self.before {
            unsafe {
                sstatus::set_sie();
            }
        }
    }
}
