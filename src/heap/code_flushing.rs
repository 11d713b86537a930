//! Policies for flushing the bytecode and baseline code of functions that have not run
//! for a while.
//!
//! Each shared function info carries a 16-bit age. The full marking visitor ages every
//! function that has flushable code, and treats the code of an old function as weak. The
//! age is reset to 0 by the interpreter and baseline prologues when the function runs.

use std::sync::atomic::{AtomicU16, Ordering};

use crate::util::options::{CodeFlushingTrigger, Options};

/// The saturated age.
pub const MAX_AGE: u16 = u16::MAX;

/// What may be flushed in this cycle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CodeFlushMode {
    pub flush_bytecode: bool,
    pub flush_baseline: bool,
    /// Treat every flushable function as old.
    pub stress: bool,
}

impl CodeFlushMode {
    pub fn from_options(options: &Options) -> Self {
        if options.stress_flush_code && !options.flush_bytecode && !options.flush_baseline_code {
            warn!("stress_flush_code needs a flushing mode enabled");
        }
        Self {
            flush_bytecode: options.flush_bytecode,
            flush_baseline: options.flush_baseline_code,
            stress: options.stress_flush_code,
        }
    }

    /// Nothing may be flushed, e.g. while the debugger needs all bytecode.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_flushing_disabled(&self) -> bool {
        !self.flush_bytecode && !self.flush_baseline
    }
}

/// Decides when a function's code is old. See [`CodeFlushingTrigger`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodeAgingPolicy {
    AgeCounter {
        old_age: u16,
    },
    Time {
        old_time: u16,
        /// Seconds since the previous full GC, added to the age of every unused function.
        increase: u16,
    },
    TabVisibility {
        in_background: bool,
    },
}

impl CodeAgingPolicy {
    /// `increase` is the number of seconds since the previous full GC, and `in_background`
    /// whether the isolate currently belongs to a background tab. Each is only used by the
    /// policy it applies to.
    pub fn from_options(options: &Options, increase: u16, in_background: bool) -> Self {
        match options.code_flushing_trigger {
            CodeFlushingTrigger::AgeCounter => CodeAgingPolicy::AgeCounter {
                old_age: options.bytecode_old_age,
            },
            CodeFlushingTrigger::Time => CodeAgingPolicy::Time {
                old_time: options.bytecode_old_time,
                increase,
            },
            CodeFlushingTrigger::TabVisibility => CodeAgingPolicy::TabVisibility { in_background },
        }
    }

    pub fn is_old(&self, age: &AtomicU16) -> bool {
        let age = age.load(Ordering::Relaxed);
        match *self {
            CodeAgingPolicy::AgeCounter { old_age } => age >= old_age,
            CodeAgingPolicy::Time { old_time, .. } => age >= old_time,
            CodeAgingPolicy::TabVisibility { in_background } => in_background || age == MAX_AGE,
        }
    }

    /// Age a function that was found with flushable code.
    pub fn make_older(&self, age: &AtomicU16) {
        match *self {
            CodeAgingPolicy::AgeCounter { old_age } => {
                let current = age.load(Ordering::Relaxed);
                if current < old_age {
                    // Losing the race to the prologue resetting the age is fine.
                    let _ = age.compare_exchange(
                        current,
                        current + 1,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    );
                }
                debug_assert!(age.load(Ordering::Relaxed) <= old_age);
            }
            CodeAgingPolicy::Time { increase, .. } => {
                if increase == 0 {
                    return;
                }
                // An age of 0 was reset by a prologue some time after the previous GC, so
                // the function only counts as unused since then.
                let _ = age.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                    Some(if current == 0 {
                        1
                    } else {
                        current.saturating_add(increase)
                    })
                });
            }
            CodeAgingPolicy::TabVisibility { .. } => {}
        }
    }
}

/// The code flushing configuration of one full marking cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CodeFlushing {
    pub mode: CodeFlushMode,
    pub policy: CodeAgingPolicy,
    /// Do not age functions, e.g. in a GC forced for testing.
    pub keep_ages_unchanged: bool,
}

impl CodeFlushing {
    pub fn new(options: &Options) -> Self {
        Self {
            mode: CodeFlushMode::from_options(options),
            policy: CodeAgingPolicy::from_options(options, 0, false),
            keep_ages_unchanged: false,
        }
    }

    pub fn with_policy(self, policy: CodeAgingPolicy) -> Self {
        Self { policy, ..self }
    }

    pub fn keep_ages_unchanged(self, keep: bool) -> Self {
        Self {
            keep_ages_unchanged: keep,
            ..self
        }
    }

    /// Should the code of a function with flushable code be treated as weak?
    pub fn should_flush_code(&self, age: &AtomicU16) -> bool {
        self.mode.stress || self.policy.is_old(age)
    }

    pub fn make_older(&self, age: &AtomicU16) {
        if !self.keep_ages_unchanged {
            self.policy.make_older(age);
        }
    }
}
