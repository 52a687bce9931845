//! Reduction mode negotiation.
//!
//! The compiler and the runtime agree on how per-thread partial results get
//! combined: the compiler reports (through its flags) whether it emitted an
//! atomic combining path, and the runtime answers with the mechanism to use —
//! `2` for atomic updates, `1` for a critical section around the combining
//! code. `LOMP_REDUCTION_STYLE` can force a mode; an illegal forcing warns
//! once and falls back.

use std::sync::OnceLock;

use tracing::{debug, trace};

use crate::errors::{fatal, warn_once, warning, RuntimeError};
use crate::locks::{self, CriticalSection};
use crate::team::Thread;

/// The mechanisms for combining reduction partial results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReductionMethod {
    Unknown,
    Atomic,
    CriticalSection,
    Tree,
}

impl ReductionMethod {
    fn name(self) -> &'static str {
        match self {
            ReductionMethod::Unknown => "unknown",
            ReductionMethod::Atomic => "atomic",
            ReductionMethod::CriticalSection => "critical",
            ReductionMethod::Tree => "tree",
        }
    }
}

/// What the compiler tells us about the reduction site.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReduceFlags {
    /// The compiler emitted an atomic combining path.
    pub atomic_available: bool,
}

static REDUCTION_NAMES: &[(&str, ReductionMethod)] = &[
    ("atomic", ReductionMethod::Atomic),
    ("critical", ReductionMethod::CriticalSection),
    ("tree", ReductionMethod::Tree),
];

static FORCED: OnceLock<ReductionMethod> = OnceLock::new();

fn forced_reduction() -> ReductionMethod {
    *FORCED.get_or_init(|| ReductionMethod::Unknown)
}

/// Parses `LOMP_REDUCTION_STYLE`; mostly for testing, this lets a user force
/// the reduction mechanism.
pub(crate) fn initialize_forced_reduction() {
    let forced = match crate::env::get_str("LOMP_REDUCTION_STYLE") {
        Some(requested) => match REDUCTION_NAMES
            .iter()
            .find(|(name, _)| *name == requested)
        {
            Some(&(name, method)) => {
                debug!(name, "reduction style forced");
                method
            }
            None => {
                warning(format_args!(
                    "unknown reduction (LOMP_REDUCTION_STYLE='{requested}') requested; \
                     using the default (letting compiled code choose)"
                ));
                ReductionMethod::Unknown
            }
        },
        None => ReductionMethod::Unknown,
    };
    let _ = FORCED.set(forced);
}

/// Chooses the reduction mechanism from the forced style and what the
/// compiled code supports.
fn choose_reduction(flags: ReduceFlags) -> ReductionMethod {
    match forced_reduction() {
        // Honour an atomic forcing only when the compiler generated the code.
        ReductionMethod::Atomic if flags.atomic_available => ReductionMethod::Atomic,
        // A critical section is always available.
        ReductionMethod::CriticalSection => ReductionMethod::CriticalSection,
        ReductionMethod::Unknown => {
            if flags.atomic_available {
                ReductionMethod::Atomic
            } else {
                ReductionMethod::CriticalSection
            }
        }
        forced => {
            warn_once!(
                "cannot use requested reduction '{}', using 'critical'",
                forced.name()
            );
            ReductionMethod::CriticalSection
        }
    }
}

/// Enters a reduction. Returns the §6 contract value the compiled code
/// switches on: 2 to use its atomic path, 1 to run the combining code inside
/// the critical section we just acquired.
pub(crate) fn enter_reduction(flags: ReduceFlags, lock: &CriticalSection) -> i32 {
    let thread = Thread::current();
    let method = choose_reduction(flags);
    thread.set_reduction(method);
    trace!(method = method.name(), "entering reduction");
    match method {
        ReductionMethod::Atomic => 2,
        ReductionMethod::CriticalSection => {
            locks::enter_critical(lock);
            1
        }
        ReductionMethod::Tree => fatal(
            RuntimeError::Assertion,
            format_args!("tree reduction is not implemented; callers must fall back"),
        ),
        ReductionMethod::Unknown => fatal(
            RuntimeError::Assertion,
            format_args!("no suitable reduction implementation"),
        ),
    }
}

/// Leaves a reduction: releases the critical section if one was taken, and
/// runs the closing barrier when the construct requires one.
pub(crate) fn leave_reduction(lock: &CriticalSection, need_barrier: bool) {
    let thread = Thread::current();
    let method = thread.reduction();
    trace!(method = method.name(), "leaving reduction");
    if method == ReductionMethod::CriticalSection {
        locks::exit_critical(lock);
    }
    if need_barrier {
        let team = thread.team();
        team.barrier().full_barrier(thread.local_id() as usize);
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_choice_follows_the_compiler() {
        // Without forcing, the compiler's atomic path wins when present.
        let _ = FORCED.set(ReductionMethod::Unknown);
        assert_eq!(
            choose_reduction(ReduceFlags {
                atomic_available: true
            }),
            ReductionMethod::Atomic
        );
        assert_eq!(
            choose_reduction(ReduceFlags {
                atomic_available: false
            }),
            ReductionMethod::CriticalSection
        );
    }

    #[test]
    fn reduction_names_cover_every_forcible_method() {
        for &(name, method) in REDUCTION_NAMES {
            assert_eq!(method.name(), name);
        }
    }
}
