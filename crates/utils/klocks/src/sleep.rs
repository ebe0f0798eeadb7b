//! 基于 `event_listener` 和自旋锁的睡眠锁
//!
//! 拿不到锁时让出当前任务而不是自旋，因此适合保护一段会跨越 `.await` 的临界区，
//! 比如一次完整的块设备请求

use core::{
    fmt,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

use event_listener::{listener, Event};
use spin::mutex::SpinMutexGuard;

pub struct SleepMutex<T: ?Sized> {
    unlocked: Event,
    base: spin::mutex::SpinMutex<T>,
}

pub struct SleepMutexGuard<'a, T: ?Sized> {
    spin_guard: ManuallyDrop<SpinMutexGuard<'a, T>>,
    mutex: &'a SleepMutex<T>,
}

unsafe impl<T: ?Sized + Send> Send for SleepMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for SleepMutex<T> {}

// Guard 可以越过 .await，任务被迁移到别的 hart 上释放也没关系
unsafe impl<T: ?Sized + Send> Send for SleepMutexGuard<'_, T> {}
unsafe impl<T: ?Sized + Sync> Sync for SleepMutexGuard<'_, T> {}

impl<T> SleepMutex<T> {
    #[inline(always)]
    pub const fn new(data: T) -> Self {
        SleepMutex {
            unlocked: Event::new(),
            base: spin::mutex::SpinMutex::new(data),
        }
    }

    #[inline(always)]
    pub fn into_inner(self) -> T {
        self.base.into_inner()
    }
}

impl<T: ?Sized> SleepMutex<T> {
    /// 拿不到锁时挂起当前任务，直到持锁者释放
    pub async fn lock(&self) -> SleepMutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            listener!(self.unlocked => listener);
            // 建立监听之前锁可能已经被释放，再试一次才能睡眠
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            listener.await;
            // 可能被别的等待者抢先，失败了就重新监听
        }
    }

    #[inline(always)]
    pub fn try_lock(&self) -> Option<SleepMutexGuard<'_, T>> {
        self.base.try_lock().map(|spin_guard| SleepMutexGuard {
            spin_guard: ManuallyDrop::new(spin_guard),
            mutex: self,
        })
    }
}

impl<T: fmt::Debug> fmt::Debug for SleepMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "Mutex {{ data: ")
                .and_then(|()| (*guard).fmt(f))
                .and_then(|()| write!(f, "}}")),
            None => write!(f, "Mutex {{ <locked> }}"),
        }
    }
}

impl<'a, T: ?Sized + fmt::Debug> fmt::Debug for SleepMutexGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'a, T: ?Sized> Deref for SleepMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.spin_guard
    }
}

impl<'a, T: ?Sized> DerefMut for SleepMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.spin_guard
    }
}

impl<'a, T: ?Sized> Drop for SleepMutexGuard<'a, T> {
    fn drop(&mut self) {
        // SAFETY: 只会在这里 drop，而且之后再也不会被用到
        unsafe {
            ManuallyDrop::drop(&mut self.spin_guard);
        }
        self.mutex.unlocked.notify(1);
    }
}
