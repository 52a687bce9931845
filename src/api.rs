//! The operation surface a compiler's parallel-region lowering calls into.
//!
//! These functions carry the behavioural contracts of the runtime; the
//! compiler-facing symbol names themselves are thin wrappers an embedder
//! provides on top. Everything here routes through the calling thread's team
//! identity, which is established on first use.

use core::sync::atomic::{fence, Ordering};

use crate::invoke::{RegisterBody, SharedBody};
use crate::locks::{self, CriticalSection, LockHandle};
use crate::loops::{self, LoopVar, CanonicalLoop, SchedKind, ScheduleRequest, StaticSchedule};
use crate::reduction::{self, ReduceFlags};
use crate::runtime;
use crate::tasking::{self, SharedTaskThunk, TaskClosure, TaskThunk};
use crate::team::{self, Thread};
use crate::util;

// -----------------------------------------------------------------------------
// Parallel regions

/// Forks a parallel region: delivers `body` plus its pointer arguments to
/// every team thread, runs it on the calling thread (thread 0) too, and
/// joins.
///
/// # Safety
///
/// `body` must accept `args.len()` pointer arguments after the two id
/// pointers, and the arguments must stay valid for the whole region.
pub unsafe fn fork(body: RegisterBody, args: &[*mut ()]) {
    unsafe { team::fork(body, args) };
}

/// Forks a region whose body takes a single opaque pointer.
pub fn fork_shared(body: SharedBody, arg: *mut ()) {
    team::fork_shared(body, arg);
}

// -----------------------------------------------------------------------------
// Barrier

/// A full barrier across the team; a task scheduling point.
pub fn barrier() {
    let thread = Thread::current();
    thread
        .team()
        .barrier()
        .full_barrier(thread.local_id() as usize);
}

/// Emits a sequentially consistent fence.
pub fn flush() {
    fence(Ordering::SeqCst);
}

// -----------------------------------------------------------------------------
// Static loops

/// Splits a statically scheduled loop for the calling thread. `plower` and
/// `pupper` carry the loop bounds in and this thread's bounds out; returns
/// whether the thread has any work.
pub fn for_static_init<T: LoopVar>(
    schedule: StaticSchedule,
    plast: &mut i32,
    plower: &mut T,
    pupper: &mut T,
    pstride: &mut T,
    incr: T,
    chunk: T,
) -> bool {
    let thread = Thread::current();
    let team = thread.team();
    let canonical = CanonicalLoop::new(*plower, *pupper, incr, chunk.to_wide().max(0) as u64);
    canonical.for_static_init(
        schedule,
        thread.local_id() as u64,
        team.num_threads() as u64,
        plast,
        plower,
        pupper,
        pstride,
    )
}

/// Nothing to do; each thread already knows when its static loop ends.
pub fn for_static_fini() {}

// -----------------------------------------------------------------------------
// Dynamic loops

/// Announces a dynamically scheduled loop and joins its descriptor.
pub fn dispatch_init<T: LoopVar>(schedule: ScheduleRequest, lb: T, ub: T, incr: T, chunk: T) {
    loops::dynamic_init(schedule, lb, ub, incr, chunk);
}

/// Fetches the calling thread's next chunk of the current dynamic loop.
/// Returns false (exactly once) when the thread's share is exhausted.
pub fn dispatch_next<T: LoopVar>(
    plast: &mut i32,
    plower: &mut T,
    pupper: &mut T,
    pstride: &mut T,
) -> bool {
    loops::dispatch_next(plast, plower, pupper, pstride)
}

/// Nothing to do; threads leave the loop through `dispatch_next` returning
/// false.
pub fn dispatch_fini() {}

// -----------------------------------------------------------------------------
// Tasks

/// Allocates and initializes a deferred-task descriptor. Returns the closure
/// pointer the compiler fills in and later submits.
pub fn task_alloc(closure_size: usize, shareds_size: usize, thunk: TaskThunk) -> *mut TaskClosure {
    let task = tasking::allocate_task(closure_size, shareds_size);
    tasking::initialize_task(task, closure_size, shareds_size, thunk);
    tasking::task_to_closure(task)
}

/// Switches a task to the single-pointer calling convention.
///
/// # Safety
///
/// `closure` must come from [`task_alloc`] and not yet be submitted.
pub unsafe fn task_set_shared_thunk(closure: *mut TaskClosure, thunk: SharedTaskThunk) {
    tasking::set_single_pointer_convention(tasking::closure_to_task(closure), thunk);
}

/// Submits a task for deferred execution (or runs it now when the pool is
/// full).
///
/// # Safety
///
/// `closure` must come from [`task_alloc`], fully initialized, and be
/// submitted exactly once.
pub unsafe fn task(closure: *mut TaskClosure) {
    let task = tasking::closure_to_task(closure);
    tasking::prepare_task(task);
    tasking::store_task(task);
}

/// Starts an undeferred (`if(0)`) task; the compiled code runs the body
/// inline between this and [`task_complete_if0`].
///
/// # Safety
///
/// As for [`task`]; must be paired with `task_complete_if0`.
pub unsafe fn task_begin_if0(closure: *mut TaskClosure) {
    tasking::prepare_task(tasking::closure_to_task(closure));
}

/// Finishes an undeferred task: completion bookkeeping plus descriptor
/// cleanup.
///
/// # Safety
///
/// `closure` must have been passed to [`task_begin_if0`] and its body must
/// have finished.
pub unsafe fn task_complete_if0(closure: *mut TaskClosure) {
    let task = tasking::closure_to_task(closure);
    tasking::complete_task(task);
    tasking::collect_task_chain(task);
}

/// Waits for all children of the current task, draining other tasks
/// meanwhile.
pub fn taskwait() {
    tasking::task_wait();
}

pub fn taskgroup_begin() {
    tasking::taskgroup_begin();
}

/// Waits for every task of the innermost group, then closes it.
pub fn taskgroup_end() {
    tasking::taskgroup_end();
}

// -----------------------------------------------------------------------------
// Single, master, critical

/// True in exactly the one thread that claims this dynamic instance of the
/// single construct.
pub fn single_start() -> bool {
    let thread = Thread::current();
    let seen = thread.fetch_and_incr_single_count();
    thread.team().try_increment_next_single(seen)
}

pub fn end_single() {}

/// True only on thread 0 of the team.
pub fn master_start() -> bool {
    get_thread_num() == 0
}

pub fn end_master() {}

/// Enters the critical section guarded by `section`, initializing its lock
/// on first use.
pub fn critical(section: &CriticalSection) {
    locks::enter_critical(section);
}

pub fn end_critical(section: &CriticalSection) {
    locks::exit_critical(section);
}

// -----------------------------------------------------------------------------
// Reductions

/// Negotiates the reduction mechanism for a construct that ends in a
/// barrier. Returns 2 (use the compiled atomic path) or 1 (combining code
/// runs inside the acquired critical section).
pub fn reduce(flags: ReduceFlags, lock: &CriticalSection) -> i32 {
    reduction::enter_reduction(flags, lock)
}

pub fn end_reduce(lock: &CriticalSection) {
    reduction::leave_reduction(lock, true);
}

/// The `nowait` variant: no closing barrier.
pub fn reduce_nowait(flags: ReduceFlags, lock: &CriticalSection) -> i32 {
    reduction::enter_reduction(flags, lock)
}

pub fn end_reduce_nowait(lock: &CriticalSection) {
    reduction::leave_reduction(lock, false);
}

// -----------------------------------------------------------------------------
// Locks

pub fn init_lock(lock: &LockHandle) {
    locks::init_lock(lock);
}

pub fn init_lock_with_hint(lock: &LockHandle, hint: u32) {
    locks::init_lock_with_hint(lock, hint);
}

pub fn destroy_lock(lock: &LockHandle) {
    locks::destroy_lock(lock);
}

pub fn set_lock(lock: &LockHandle) {
    locks::set_lock(lock);
}

pub fn unset_lock(lock: &LockHandle) {
    locks::unset_lock(lock);
}

pub fn test_lock(lock: &LockHandle) -> bool {
    locks::test_lock(lock)
}

// -----------------------------------------------------------------------------
// ICV inquiry

/// The calling thread's number within the team (0 outside a region).
pub fn get_thread_num() -> i32 {
    let thread = Thread::current();
    if thread.team().in_parallel() {
        thread.local_id()
    } else {
        0
    }
}

/// The team size inside a region, 1 outside.
pub fn get_num_threads() -> i32 {
    let team = Thread::current().team();
    if team.in_parallel() {
        team.num_threads() as i32
    } else {
        1
    }
}

pub fn get_max_threads() -> i32 {
    Thread::current().team().num_threads() as i32
}

pub fn in_parallel() -> bool {
    Thread::current().team().in_parallel()
}

/// Wall-clock seconds, as a double.
pub fn get_wtime() -> f64 {
    util::wtime()
}

/// The unique global identity of the calling thread; 0 before the runtime
/// exists or on a thread outside the team.
pub fn global_thread_num() -> i32 {
    if !runtime::is_initialized() || !Thread::is_registered() {
        return 0;
    }
    Thread::current().global_id()
}

// -----------------------------------------------------------------------------
// ICV mutation

/// Requests a team size; fatal after the first region if it differs from the
/// team that exists.
pub fn set_num_threads(num_threads: usize) {
    runtime::set_num_threads(num_threads);
}

/// Sets the `schedule(runtime)` schedule.
pub fn set_schedule(kind: SchedKind, chunk: u32) {
    loops::set_schedule_info(Thread::current().team(), kind, chunk);
}

/// Reads back exactly what `set_schedule` stored.
pub fn get_schedule() -> (SchedKind, u32) {
    loops::get_schedule_info(Thread::current().team())
}
