//! Control-plane state shared between a data handler's worker thread
//! and the GUI.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Acquisition state of a data handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Stop,
    Run,
}

/// The state/transition cell both sides poke at. Transitions always
/// pair a state store with raising `state_change_ordered`, in that
/// order; the worker consumes the flag and performs the transition work
/// on its own thread.
pub struct HandlerControl {
    state: AtomicU8,
    state_change_ordered: AtomicBool,
    done: Arc<AtomicBool>,
}

impl HandlerControl {
    pub fn new(done: Arc<AtomicBool>) -> Self {
        HandlerControl {
            state: AtomicU8::new(AcquisitionState::Stop as u8),
            state_change_ordered: AtomicBool::new(false),
            done,
        }
    }

    pub fn state(&self) -> AcquisitionState {
        if self.state.load(Ordering::Acquire) == AcquisitionState::Run as u8 {
            AcquisitionState::Run
        } else {
            AcquisitionState::Stop
        }
    }

    /// Orders a transition: stores the intended state, then raises the
    /// change flag.
    pub fn set_state(&self, state: AcquisitionState) {
        self.state.store(state as u8, Ordering::Release);
        self.state_change_ordered.store(true, Ordering::Release);
    }

    /// Worker-side: reverts the state without ordering another
    /// transition (e.g. a failed START falling back to STOP).
    pub(crate) fn force_state(&self, state: AcquisitionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Worker-side: consumes a pending transition order.
    pub(crate) fn take_state_change(&self) -> bool {
        self.state_change_ordered.swap(false, Ordering::AcqRel)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn done_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.done)
    }
}

/// Exponential moving average of the observed inter-sample period, for
/// display next to the requested sample frequency.
pub(crate) struct SamplingFilter {
    state: f64,
    primed: bool,
}

impl SamplingFilter {
    const ALPHA: f64 = 0.1;

    pub fn new() -> Self {
        SamplingFilter {
            state: 0.0,
            primed: false,
        }
    }

    pub fn filter(&mut self, sample: f64) -> f64 {
        if !self.primed {
            self.state = sample;
            self.primed = true;
        } else {
            self.state = Self::ALPHA * sample + (1.0 - Self::ALPHA) * self.state;
        }
        self.state
    }

    pub fn reset(&mut self) {
        self.state = 0.0;
        self.primed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_orders_are_consumed_once() {
        let control = HandlerControl::new(Arc::new(AtomicBool::new(false)));
        assert_eq!(control.state(), AcquisitionState::Stop);
        assert!(!control.take_state_change());

        control.set_state(AcquisitionState::Run);
        assert_eq!(control.state(), AcquisitionState::Run);
        assert!(control.take_state_change());
        assert!(!control.take_state_change());
    }

    #[test]
    fn filter_converges_on_constant_input() {
        let mut filter = SamplingFilter::new();
        let mut out = 0.0;
        for _ in 0..200 {
            out = filter.filter(0.01);
        }
        assert!((out - 0.01).abs() < 1e-9);
    }
}
