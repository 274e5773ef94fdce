// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::graph::UserContext;
use ::parking_lot::Mutex;
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Callback invoked for each armed variant of a timer.
pub type TimerHandler = Arc<dyn Fn(Option<&mut Box<dyn UserContext>>) + Send + Sync>;

/// One context a timer handler may be invoked with. The variant fires only while its arm flag is set; the flag is
/// cleared after each firing.
struct TimerVariant {
    context: Option<Box<dyn UserContext>>,
    armed: Arc<AtomicBool>,
}

struct TimerState {
    next_fire: Instant,
    variants: Vec<TimerVariant>,
}

pub(crate) struct TimerInner {
    period: Duration,
    handler: TimerHandler,
    state: Mutex<TimerState>,
    stopped: AtomicBool,
}

/// A periodic user callback dispatched from the scheduler tick. Firing accuracy is bounded by the schedule tick.
pub struct Timer {
    inner: Arc<TimerInner>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Timer {
    pub(crate) fn new(period: Duration, handler: TimerHandler) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                period,
                handler,
                state: Mutex::new(TimerState {
                    next_fire: Instant::now() + period,
                    variants: Vec::new(),
                }),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn share(&self) -> Arc<TimerInner> {
        self.inner.clone()
    }

    /// Adds a variant: a context the handler will be invoked with. Returns the arm flag; set it to let the next tick
    /// fire this variant.
    pub fn add_variant(&self, context: Option<Box<dyn UserContext>>) -> Arc<AtomicBool> {
        let armed: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        self.inner.state.lock().variants.push(TimerVariant {
            context,
            armed: armed.clone(),
        });
        armed
    }

    /// Removes the timer with all its variants from the scheduler.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
    }
}

impl TimerInner {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Fires every armed variant if the period elapsed, then clears their arm flags.
    pub(crate) fn fire_due(&self, now: Instant) {
        let mut state = self.state.lock();
        if now < state.next_fire {
            return;
        }
        state.next_fire = now + self.period;
        for variant in state.variants.iter_mut() {
            if variant.armed.swap(false, Ordering::AcqRel) {
                (self.handler)(variant.context.as_mut());
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Timer,
        TimerHandler,
    };
    use ::anyhow::Result;
    use ::std::{
        sync::{
            atomic::{
                AtomicBool,
                AtomicUsize,
                Ordering,
            },
            Arc,
        },
        time::{
            Duration,
            Instant,
        },
    };

    #[test]
    fn armed_variants_fire_once_per_arming() -> Result<()> {
        let fired: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let handler: TimerHandler = {
            let fired: Arc<AtomicUsize> = fired.clone();
            Arc::new(move |_ctx| {
                fired.fetch_add(1, Ordering::Relaxed);
            })
        };
        let timer: Timer = Timer::new(Duration::from_millis(0), handler);
        let armed: Arc<AtomicBool> = timer.add_variant(None);
        let inner = timer.share();

        // Unarmed: the tick passes without a firing.
        inner.fire_due(Instant::now() + Duration::from_millis(10));
        crate::ensure_eq!(fired.load(Ordering::Relaxed), 0);

        // Armed: fires exactly once and disarms itself.
        armed.store(true, Ordering::Relaxed);
        inner.fire_due(Instant::now() + Duration::from_millis(20));
        inner.fire_due(Instant::now() + Duration::from_millis(30));
        crate::ensure_eq!(fired.load(Ordering::Relaxed), 1);
        Ok(())
    }

    #[test]
    fn stop_marks_timer_for_removal() -> Result<()> {
        let handler: TimerHandler = Arc::new(|_ctx| ());
        let timer: Timer = Timer::new(Duration::from_millis(1), handler);
        crate::ensure_eq!(timer.share().is_stopped(), false);
        timer.stop();
        crate::ensure_eq!(timer.share().is_stopped(), true);
        Ok(())
    }
}
