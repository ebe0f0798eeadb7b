//! 单生产者单消费者的完成通知
//!
//! 中断处理程序调用 [`Completion::complete`]，等待方 `.await` [`Completion::wait`]。
//! 状态由关中断的自旋锁保护，所以中断处理程序里也可以安全地调用。

use core::{
    future::poll_fn,
    task::{Poll, Waker},
};

use crate::SpinNoIrqMutex;

struct State {
    done: bool,
    waker: Option<Waker>,
}

pub struct Completion {
    state: SpinNoIrqMutex<State>,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            state: SpinNoIrqMutex::new(State {
                done: false,
                waker: None,
            }),
        }
    }

    /// 标记完成并唤醒等待方（如果有）
    pub fn complete(&self) {
        let waker = {
            let mut state = self.state.lock();
            state.done = true;
            state.waker.take()
        };
        // 锁外唤醒
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// 清除完成标志和遗留的 waker
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.done = false;
        state.waker = None;
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().done
    }

    /// 等待一次 [`Completion::complete`]，返回时会消耗掉完成标志
    pub async fn wait(&self) {
        poll_fn(|cx| {
            let mut state = self.state.lock();
            if state.done {
                state.done = false;
                state.waker = None;
                Poll::Ready(())
            } else {
                match &mut state.waker {
                    Some(waker) if waker.will_wake(cx.waker()) => {}
                    slot => *slot = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
        })
        .await
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::Completion;

    #[test]
    fn complete_before_wait() {
        let c = Completion::new();
        c.complete();
        assert!(c.is_completed());
        smol::block_on(c.wait());
        assert!(!c.is_completed());
    }

    #[test]
    fn reset_clears_flag() {
        let c = Completion::new();
        c.complete();
        c.reset();
        assert!(!c.is_completed());
    }

    #[test]
    fn woken_from_other_thread() {
        let c = Arc::new(Completion::new());
        let c2 = Arc::clone(&c);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            c2.complete();
        });
        smol::block_on(c.wait());
        t.join().unwrap();
    }

    #[test]
    fn repeated_rounds() {
        let c = Arc::new(Completion::new());
        for _ in 0..50 {
            let c2 = Arc::clone(&c);
            let t = thread::spawn(move || c2.complete());
            smol::block_on(c.wait());
            t.join().unwrap();
        }
        assert!(!c.is_completed());
    }
}
