//! 自旋锁，封装了一下 `spin::mutex::spin`
//!
//! 裁剪了一些不太需要的方法，添加 debug 模式下的死锁检测。
//! [`SpinNoIrqMutex`] 在持锁期间会关闭当前 hart 的中断，用于和中断处理程序共享的数据

use core::{
    marker::PhantomData,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

/// debug 模式下自旋超过这么多次就认为发生了死锁
#[cfg(debug_assertions)]
const DEADLOCK_SPINS: usize = 1 << 28;

/// 守卫不能被 `Send`，否则可能在别的 hart 上释放锁（或者开中断）
type NotSend = PhantomData<*const ()>;

#[inline(always)]
#[track_caller]
fn spin_until_unlocked(is_locked: impl Fn() -> bool) {
    #[cfg(debug_assertions)]
    let mut spins = 0usize;
    while is_locked() {
        core::hint::spin_loop();
        #[cfg(debug_assertions)]
        {
            spins += 1;
            if spins >= DEADLOCK_SPINS {
                panic!("deadlock detected");
            }
        }
    }
}

pub struct SpinMutex<T: ?Sized> {
    base: spin::mutex::SpinMutex<T>,
}

pub struct SpinMutexGuard<'a, T: ?Sized> {
    inner: spin::mutex::SpinMutexGuard<'a, T>,
    _not_send: NotSend,
}

// Same unsafe impls as `std::sync::Mutex`
unsafe impl<T: ?Sized + Send> Sync for SpinMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinMutex<T> {}

unsafe impl<T: ?Sized + Sync> Sync for SpinMutexGuard<'_, T> {}

impl<T> SpinMutex<T> {
    /// Creates a new [`SpinMutex`] wrapping the supplied data.
    #[inline(always)]
    pub const fn new(data: T) -> Self {
        Self {
            base: spin::mutex::SpinMutex::new(data),
        }
    }

    #[inline(always)]
    pub fn into_inner(self) -> T {
        self.base.into_inner()
    }
}

impl<T: ?Sized> SpinMutex<T> {
    /// Locks the [`SpinMutex`] and returns a guard that permits access to the
    /// inner data.
    ///
    /// The returned value may be dereferenced for data access
    /// and the lock will be dropped when the guard falls out of scope.
    #[inline]
    #[track_caller]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            spin_until_unlocked(|| self.base.is_locked());
        }
    }

    /// Try to lock this [`SpinMutex`], returning a lock guard if successful.
    #[inline(always)]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        self.base.try_lock().map(|inner| SpinMutexGuard {
            inner,
            _not_send: PhantomData,
        })
    }

    #[inline(always)]
    pub fn get_mut(&mut self) -> &mut T {
        self.base.get_mut()
    }
}

impl<T: ?Sized> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

pub struct SpinNoIrqMutex<T: ?Sized> {
    base: spin::mutex::SpinMutex<T>,
}

pub struct SpinNoIrqMutexGuard<'a, T: ?Sized> {
    // 要控制一下析构顺序，先释放锁再开中断
    spin_guard: ManuallyDrop<spin::mutex::SpinMutexGuard<'a, T>>,
    // 不是跑在 riscv 上（比如在宿主机上测试）时无法开关中断
    #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
    _no_irq_guard: riscv_guard::NoIrqGuard,
    _not_send: NotSend,
}

unsafe impl<T: ?Sized + Send> Send for SpinNoIrqMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinNoIrqMutex<T> {}

unsafe impl<T: ?Sized + Sync> Sync for SpinNoIrqMutexGuard<'_, T> {}

impl<T> SpinNoIrqMutex<T> {
    /// Creates a new [`SpinNoIrqMutex`] wrapping the supplied data.
    #[inline(always)]
    pub const fn new(data: T) -> Self {
        Self {
            base: spin::mutex::SpinMutex::new(data),
        }
    }
}

impl<T: ?Sized> SpinNoIrqMutex<T> {
    /// Locks the [`SpinNoIrqMutex`] and returns a guard that permits access to
    /// the inner data.
    ///
    /// Interrupts of the current hart stay disabled until the guard is dropped.
    #[inline]
    #[track_caller]
    pub fn lock(&self) -> SpinNoIrqMutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            spin_until_unlocked(|| self.base.is_locked());
        }
    }

    /// Try to lock this [`SpinNoIrqMutex`], returning a lock guard if successful.
    #[inline(always)]
    pub fn try_lock(&self) -> Option<SpinNoIrqMutexGuard<'_, T>> {
        // 先关中断再拿锁，拿不到锁时 guard 析构会恢复中断
        #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
        let _no_irq_guard = riscv_guard::NoIrqGuard::new();
        self.base.try_lock().map(|spin_guard| SpinNoIrqMutexGuard {
            spin_guard: ManuallyDrop::new(spin_guard),
            #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
            _no_irq_guard,
            _not_send: PhantomData,
        })
    }
}

impl<T: ?Sized> Deref for SpinNoIrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.spin_guard
    }
}

impl<T: ?Sized> DerefMut for SpinNoIrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.spin_guard
    }
}

impl<T: ?Sized> Drop for SpinNoIrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: 只会在这里 drop，而且之后再也不会被用到
        unsafe {
            ManuallyDrop::drop(&mut self.spin_guard);
        }
    }
}
