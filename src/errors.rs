//! Fatal-error and warning machinery.
//!
//! Nothing in the runtime is caller-recoverable: every error writes a single
//! newline-terminated diagnostic to standard error and aborts the process.
//! Warnings for recoverable mismatches are printed once and execution
//! continues with a default.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::process::abort;

// -----------------------------------------------------------------------------
// Error kinds

/// The classes of fatal error the runtime can raise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeError {
    /// A fork was attempted while the team was already inside a parallel
    /// region.
    NestedParallel,
    /// An attempt was made to change the team size after the first region.
    UnsupportedChange,
    /// An unrecognized barrier name was configured.
    UnknownBarrier,
    /// An unrecognized lock name was configured.
    UnknownLock,
    /// An unrecognized schedule name was configured.
    UnknownSchedule,
    /// The requested team size exceeds a hard cap compiled into a data
    /// structure.
    TooManyThreads,
    /// `wake_up`/`check_in`/`check_out` was called on a distributed barrier.
    MisuseOfDistributedBarrier,
    /// An internal invariant was violated.
    Assertion,
}

impl RuntimeError {
    fn tag(self) -> &'static str {
        match self {
            RuntimeError::NestedParallel => "nested parallelism",
            RuntimeError::UnsupportedChange => "unsupported change",
            RuntimeError::UnknownBarrier => "unknown barrier",
            RuntimeError::UnknownLock => "unknown lock",
            RuntimeError::UnknownSchedule => "unknown schedule",
            RuntimeError::TooManyThreads => "too many threads",
            RuntimeError::MisuseOfDistributedBarrier => "misuse of distributed barrier",
            RuntimeError::Assertion => "assertion",
        }
    }
}

// -----------------------------------------------------------------------------
// Fatal errors

/// Writes one diagnostic line to stderr and aborts the process.
///
/// The whole message is formatted into a single buffer first so the write is
/// one call, keeping the line intact even when several threads fail at once.
#[cold]
pub fn fatal(kind: RuntimeError, args: fmt::Arguments<'_>) -> ! {
    let line = format!("lomp: fatal error ({}): {}", kind.tag(), args);
    eprintln!("{line}");
    abort();
}

/// Aborts on a violated internal invariant.
macro_rules! runtime_assert {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::errors::fatal(
                $crate::errors::RuntimeError::Assertion,
                format_args!($($arg)*),
            );
        }
    };
}
pub(crate) use runtime_assert;

// -----------------------------------------------------------------------------
// Warnings

/// Writes a single warning line to stderr.
pub fn warning(args: fmt::Arguments<'_>) {
    eprintln!("lomp: warning: {args}");
}

/// Emits the warning only on the first call for the given site flag.
pub fn warn_once_with(site: &AtomicBool, args: fmt::Arguments<'_>) {
    if site
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        warning(args);
    }
}

/// A warning that fires at most once per call site.
macro_rules! warn_once {
    ($($arg:tt)*) => {{
        static SITE: core::sync::atomic::AtomicBool =
            core::sync::atomic::AtomicBool::new(false);
        $crate::errors::warn_once_with(&SITE, format_args!($($arg)*))
    }};
}
pub(crate) use warn_once;

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warn_once_fires_once() {
        let site = AtomicBool::new(false);
        warn_once_with(&site, format_args!("first"));
        assert!(site.load(Ordering::Relaxed));
        // The second call is a no-op; nothing to assert beyond not panicking.
        warn_once_with(&site, format_args!("second"));
    }

    #[test]
    fn error_tags_are_distinct() {
        let kinds = [
            RuntimeError::NestedParallel,
            RuntimeError::UnsupportedChange,
            RuntimeError::UnknownBarrier,
            RuntimeError::UnknownLock,
            RuntimeError::UnknownSchedule,
            RuntimeError::TooManyThreads,
            RuntimeError::MisuseOfDistributedBarrier,
            RuntimeError::Assertion,
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(a.tag(), b.tag());
            }
        }
    }
}
