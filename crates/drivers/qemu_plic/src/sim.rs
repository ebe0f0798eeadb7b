//! 软件模拟的 PLIC，只模拟 context 0
//!
//! 模拟了网关的行为：一个源被 claim 之后、complete 之前，新的请求会被暂存，
//! complete 时才重新变为 pending

use alloc::sync::Arc;

use defines::config::{PLIC_CONTEXT, PLIC_SOURCE_COUNT};
use klocks::SpinMutex;

use crate::regs::{claim_offset, enable_offset, pending_offset, threshold_offset, PlicIo};

const WORDS: usize = PLIC_SOURCE_COUNT / u32::BITS as usize;

struct SimState {
    priority: [u32; PLIC_SOURCE_COUNT],
    pending: [u32; WORDS],
    enable: [u32; WORDS],
    threshold: u32,
    in_service: [bool; PLIC_SOURCE_COUNT],
    deferred: [bool; PLIC_SOURCE_COUNT],
}

impl SimState {
    fn bit(words: &[u32; WORDS], source: usize) -> bool {
        words[source / 32] & (1 << (source % 32)) != 0
    }

    fn set_bit(words: &mut [u32; WORDS], source: usize, on: bool) {
        if on {
            words[source / 32] |= 1 << (source % 32);
        } else {
            words[source / 32] &= !(1 << (source % 32));
        }
    }

    /// 优先级最高的可 claim 源，同优先级取编号小的
    fn best(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for source in 1..PLIC_SOURCE_COUNT {
            let prio = self.priority[source];
            if prio == 0
                || prio <= self.threshold
                || !Self::bit(&self.pending, source)
                || !Self::bit(&self.enable, source)
            {
                continue;
            }
            if best.map_or(true, |b| prio > self.priority[b]) {
                best = Some(source);
            }
        }
        best
    }

    fn claim(&mut self) -> u32 {
        match self.best() {
            Some(source) => {
                Self::set_bit(&mut self.pending, source, false);
                self.in_service[source] = true;
                source as u32
            }
            None => 0,
        }
    }

    fn complete(&mut self, source: usize) {
        if source == 0 || source >= PLIC_SOURCE_COUNT || !self.in_service[source] {
            return;
        }
        self.in_service[source] = false;
        if core::mem::take(&mut self.deferred[source]) {
            Self::set_bit(&mut self.pending, source, true);
        }
    }
}

/// 可以被多处共享的模拟 PLIC，克隆出来的句柄指向同一份状态
#[derive(Clone)]
pub struct SimPlic {
    state: Arc<SpinMutex<SimState>>,
}

impl SimPlic {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SpinMutex::new(SimState {
                priority: [0; PLIC_SOURCE_COUNT],
                pending: [0; WORDS],
                enable: [0; WORDS],
                threshold: 0,
                in_service: [false; PLIC_SOURCE_COUNT],
                deferred: [false; PLIC_SOURCE_COUNT],
            })),
        }
    }

    /// 设备发出中断请求
    pub fn raise(&self, source: u32) {
        let source = source as usize;
        assert!(source != 0 && source < PLIC_SOURCE_COUNT);
        let mut state = self.state.lock();
        if state.in_service[source] {
            state.deferred[source] = true;
        } else {
            SimState::set_bit(&mut state.pending, source, true);
        }
    }

    /// 源已被 claim 但尚未 complete
    pub fn is_in_service(&self, source: u32) -> bool {
        self.state.lock().in_service[source as usize]
    }
}

impl Default for SimPlic {
    fn default() -> Self {
        Self::new()
    }
}

impl PlicIo for SimPlic {
    fn read(&self, offset: usize) -> u32 {
        let mut state = self.state.lock();
        match offset {
            o if o < pending_offset(0) => state.priority[o / 4],
            o if o < pending_offset(0) + 4 * WORDS => state.pending[(o - pending_offset(0)) / 4],
            o if (enable_offset(PLIC_CONTEXT, 0)..enable_offset(PLIC_CONTEXT + 1, 0))
                .contains(&o) =>
            {
                state.enable[(o - enable_offset(PLIC_CONTEXT, 0)) / 4]
            }
            o if o == threshold_offset(PLIC_CONTEXT) => state.threshold,
            o if o == claim_offset(PLIC_CONTEXT) => state.claim(),
            _ => 0,
        }
    }

    fn write(&self, offset: usize, value: u32) {
        let mut state = self.state.lock();
        match offset {
            o if o < pending_offset(0) => state.priority[o / 4] = value,
            o if (enable_offset(PLIC_CONTEXT, 0)..enable_offset(PLIC_CONTEXT + 1, 0))
                .contains(&o) =>
            {
                state.enable[(o - enable_offset(PLIC_CONTEXT, 0)) / 4] = value;
            }
            o if o == threshold_offset(PLIC_CONTEXT) => state.threshold = value,
            o if o == claim_offset(PLIC_CONTEXT) => state.complete(value as usize),
            // pending 位只读，其余 context 不模拟
            _ => {}
        }
    }
}
