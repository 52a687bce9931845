//! Test harness for whole-runtime scenarios.
//!
//! The runtime is a process-wide singleton whose thread 0 is the first
//! caller, so every scenario is funnelled through one dedicated OS thread.
//! Holding the submission lock for the duration of a job also serializes the
//! scenarios, which all share the one team.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, OnceLock};
use std::thread;

/// The team size every scenario in this binary runs with.
#[allow(dead_code)]
pub const TEAM_SIZE: usize = 8;

type Job = Box<dyn FnOnce() + Send>;

static SENDER: OnceLock<Mutex<Sender<Job>>> = OnceLock::new();

fn sender() -> &'static Mutex<Sender<Job>> {
    SENDER.get_or_init(|| {
        let (tx, rx) = channel::<Job>();
        thread::Builder::new()
            .name("runtime main".into())
            .spawn(move || {
                // Fix the team size before anything touches the runtime;
                // this thread becomes thread 0 on the first entry point.
                lomp::set_num_threads(TEAM_SIZE);
                for job in rx {
                    job();
                }
            })
            .expect("spawning the runtime thread");
        Mutex::new(tx)
    })
}

/// Runs `f` on the dedicated runtime thread (thread 0 of the team) and
/// returns its result. Panics inside `f` propagate to the caller without
/// killing the runtime thread.
pub fn on_runtime_thread<F, R>(f: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (done_tx, done_rx) = channel();
    let guard = sender().lock().unwrap();
    guard
        .send(Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f));
            let _ = done_tx.send(outcome);
        }))
        .expect("runtime thread is gone");
    let outcome = done_rx.recv().expect("runtime thread died");
    drop(guard);
    match outcome {
        Ok(result) => result,
        Err(payload) => resume_unwind(payload),
    }
}
