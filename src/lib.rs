//! A lightweight shared-memory parallel runtime.
//!
//! `lomp` provides the primitives a compiler's parallel-region lowering emits
//! calls into: a fixed team of worker threads, fork/join delivery of outlined
//! region bodies, a family of barrier algorithms, static and dynamic loop
//! scheduling (including work stealing), deferred tasks with taskwait and
//! taskgroup accounting, and mutual exclusion for critical sections.
//!
//! The runtime initializes on first use — the first thread to call any entry
//! point becomes thread 0 of the team — and the team then lives for the rest
//! of the process. Team size comes from `set_num_threads`, `OMP_NUM_THREADS`,
//! or the hardware, in that order of preference.
//!
//! # Example
//!
//! ```no_run
//! use lomp::{fork_shared, get_thread_num, get_num_threads};
//!
//! unsafe extern "C" fn body(_arg: *mut ()) {
//!     println!("hello from {}/{}", get_thread_num(), get_num_threads());
//! }
//!
//! fn main() {
//!     fork_shared(body, core::ptr::null_mut());
//! }
//! ```
//!
//! # Configuration
//!
//! Environment variables, read once at initialization: `OMP_NUM_THREADS`,
//! `OMP_SCHEDULE`, `OMP_DISPLAY_ENV`, `LOMP_BARRIER_KIND`, `LOMP_LOCK_KIND`,
//! `LOMP_REDUCTION_STYLE`, `LOMP_DEBUG`, and `LOMP_TRACE`. Errors are never
//! recoverable: the runtime writes one diagnostic line to stderr and aborts.

// -----------------------------------------------------------------------------
// Modules

mod api;
mod env;
mod errors;
mod invoke;
mod locks;
mod loops;
mod numa;
mod reduction;
mod runtime;
mod tasking;
mod team;
mod util;

pub mod barrier;

// -----------------------------------------------------------------------------
// Top-level exports

pub use api::barrier;
pub use api::critical;
pub use api::destroy_lock;
pub use api::dispatch_fini;
pub use api::dispatch_init;
pub use api::dispatch_next;
pub use api::end_critical;
pub use api::end_master;
pub use api::end_reduce;
pub use api::end_reduce_nowait;
pub use api::end_single;
pub use api::flush;
pub use api::for_static_fini;
pub use api::for_static_init;
pub use api::fork;
pub use api::fork_shared;
pub use api::get_max_threads;
pub use api::get_num_threads;
pub use api::get_schedule;
pub use api::get_thread_num;
pub use api::get_wtime;
pub use api::global_thread_num;
pub use api::in_parallel;
pub use api::init_lock;
pub use api::init_lock_with_hint;
pub use api::master_start;
pub use api::reduce;
pub use api::reduce_nowait;
pub use api::set_lock;
pub use api::set_num_threads;
pub use api::set_schedule;
pub use api::single_start;
pub use api::task;
pub use api::task_alloc;
pub use api::task_begin_if0;
pub use api::task_complete_if0;
pub use api::task_set_shared_thunk;
pub use api::taskgroup_begin;
pub use api::taskgroup_end;
pub use api::taskwait;
pub use api::test_lock;
pub use api::unset_lock;

pub use errors::RuntimeError;
pub use invoke::InvocationInfo;
pub use invoke::RegisterBody;
pub use invoke::SharedBody;
pub use invoke::MAX_BODY_ARGS;
pub use locks::CriticalSection;
pub use locks::LockHandle;
pub use loops::CanonicalLoop;
pub use loops::LoopVar;
pub use loops::Monotonicity;
pub use loops::RequestKind;
pub use loops::SchedKind;
pub use loops::ScheduleRequest;
pub use loops::StaticSchedule;
pub use loops::MAX_CONCURRENT_LOOPS;
pub use reduction::ReduceFlags;
pub use reduction::ReductionMethod;
pub use tasking::CompilerData;
pub use tasking::SharedTaskThunk;
pub use tasking::TaskClosure;
pub use tasking::TaskThunk;
pub use team::Thread;
pub use team::ThreadTeam;
pub use team::MAX_THREADS;
