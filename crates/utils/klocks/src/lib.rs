#![cfg_attr(not(test), no_std)]

mod completion;
mod kspin;
mod sleep;

pub use completion::Completion;
pub use kspin::{SpinMutex, SpinMutexGuard, SpinNoIrqMutex, SpinNoIrqMutexGuard};
pub use sleep::{SleepMutex, SleepMutexGuard};
pub use spin::{Lazy, Once};
