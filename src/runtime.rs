//! Runtime globals and one-shot initialization.
//!
//! The runtime initializes on first use: the first thread to enter becomes
//! thread 0 of the team. Initialization reads the environment, builds the
//! NUMA oracle and the team, resolves the configured lock and schedule, and
//! optionally reports the settings (`OMP_DISPLAY_ENV`).

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Once;

use tracing::debug;

use crate::env;
use crate::errors::{fatal, RuntimeError};
use crate::numa;
use crate::team::{Thread, ThreadTeam};

static INIT: Once = Once::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Team size requested through `set_num_threads` before initialization;
/// 0 means "not forced", letting `OMP_NUM_THREADS` or the hardware decide.
static REQUESTED_THREADS: AtomicUsize = AtomicUsize::new(0);

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Sets up the whole runtime. Called from `Thread::current` the first time
/// any entry point runs; the calling thread becomes thread 0.
pub(crate) fn initialize() {
    INIT.call_once(|| {
        install_logging();
        debug!("initializing runtime");

        numa::initialize();

        let mut requested = REQUESTED_THREADS.load(Ordering::Relaxed);
        if requested == 0 {
            // Only consult the environment when nothing was forced through
            // set_num_threads.
            requested = env::get_usize("OMP_NUM_THREADS").unwrap_or(0);
        }

        crate::reduction::initialize_forced_reduction();

        let team = ThreadTeam::create(requested);
        debug!(num_threads = team.num_threads(), "team ready");

        crate::locks::initialize_locks();
        crate::loops::initialize_loops(team);

        match env::get_str("OMP_DISPLAY_ENV").as_deref() {
            Some("true") | Some("1") => display_environment(false),
            Some("verbose") => display_environment(true),
            _ => {}
        }

        INITIALIZED.store(true, Ordering::Release);
    });
}

/// ICV mutation: request a team size. Changing the size after the team
/// exists is not supported.
pub(crate) fn set_num_threads(num_threads: usize) {
    if is_initialized() {
        let current = Thread::current().team().num_threads();
        if current != num_threads {
            fatal(
                RuntimeError::UnsupportedChange,
                format_args!(
                    "altering the number of threads is not implemented (changing from {current} to {num_threads})"
                ),
            );
        }
        return;
    }
    let previous = REQUESTED_THREADS.swap(num_threads, Ordering::Relaxed);
    if previous != 0 && previous != num_threads {
        fatal(
            RuntimeError::UnsupportedChange,
            format_args!(
                "altering the number of threads is not implemented (changing from {previous} to {num_threads})"
            ),
        );
    }
}

// -----------------------------------------------------------------------------
// Logging

/// `LOMP_DEBUG` ≥ 1 turns on DEBUG-level logging (≥ 2 TRACE); `LOMP_TRACE`
/// forces TRACE outright. The subscriber itself rides behind the `debug-log`
/// feature so release embedders carry only the `tracing` call sites.
fn install_logging() {
    let level = env::get_usize("LOMP_DEBUG").unwrap_or(0);
    let trace = env::get_usize("LOMP_TRACE").unwrap_or(0);
    if level == 0 && trace == 0 {
        return;
    }
    #[cfg(feature = "debug-log")]
    {
        let max_level = if trace > 0 || level >= 2 {
            tracing::Level::TRACE
        } else {
            tracing::Level::DEBUG
        };
        let _ = tracing_subscriber::fmt()
            .with_max_level(max_level)
            .with_writer(std::io::stderr)
            .compact()
            .try_init();
    }
    #[cfg(not(feature = "debug-log"))]
    crate::errors::warning(format_args!(
        "LOMP_DEBUG/LOMP_TRACE is set but this build does not include the debug-log feature"
    ));
}

// -----------------------------------------------------------------------------
// OMP_DISPLAY_ENV

fn display_variable(name: &str) {
    match env::get_str(name) {
        Some(value) => println!("  [host] {name}='{value}'"),
        None => println!("  [host] {name}: value is not defined"),
    }
}

fn display_environment(verbose: bool) {
    println!("OPENMP DISPLAY ENVIRONMENT");
    println!("  _OPENMP='{}'", 0);
    for name in ["OMP_NUM_THREADS", "OMP_SCHEDULE", "OMP_DISPLAY_ENV"] {
        display_variable(name);
    }
    if verbose {
        for name in [
            "LOMP_LOCK_KIND",
            "LOMP_BARRIER_KIND",
            "LOMP_REDUCTION_STYLE",
            "LOMP_DEBUG",
            "LOMP_TRACE",
        ] {
            display_variable(name);
        }
    }
    println!("OPENMP DISPLAY ENVIRONMENT END");
}
