//! The thread team: persistent worker threads, per-thread state, and the
//! fork/join path.
//!
//! A team is built once, on first use, with the constructing thread as
//! thread 0 and the remaining workers spawned on fresh OS threads. Workers
//! pin themselves to the logical CPU matching their thread number where the
//! platform allows, register with the NUMA oracle, and then loop forever in
//! the fork/join barrier; nothing is torn down, process exit stops them.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::Builder as ThreadBuilder;

use crossbeam_utils::CachePadded;
use tracing::{debug, trace};

use crate::barrier::Barrier;
use crate::errors::{fatal, runtime_assert, warning, RuntimeError};
use crate::invoke::{InvocationInfo, RegisterBody, SharedBody};
use crate::loops::{ContiguousWork, DynamicLoop, IcvSchedule, MAX_CONCURRENT_LOOPS};
use crate::numa;
use crate::reduction::ReductionMethod;
use crate::tasking::{TaskDescriptor, Taskgroup, TaskPool};
use crate::util::Mlfsr32;

/// Hard cap on the team size; several barrier data structures are sized
/// around it.
pub const MAX_THREADS: usize = 256;

/// The machine's logical CPU count, used when no thread count is requested.
pub fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// -----------------------------------------------------------------------------
// Thread identity

thread_local! {
    static CURRENT_THREAD: Cell<*const Thread> = const { Cell::new(core::ptr::null()) };
}

/// One member of the team. Created on (and owned by) its OS thread; lives for
/// the rest of the process.
pub struct Thread {
    // Identity. Stored as i32 so the invoker can pass pointers to these
    // fields straight to outlined bodies.
    global_id: i32,
    local_id: i32,
    team: &'static ThreadTeam,
    /// The logical CPU this thread is pinned to, if pinning succeeded.
    core: Option<usize>,

    // Dynamic loop state, touched only by this thread.
    current_loop: Cell<*const DynamicLoop>,
    dynamic_loop_count: Cell<u32>,
    /// Next-chunk cursor for the static schedules under dynamic dispatch.
    next_loop_chunk: Cell<u64>,
    /// Stealable ranges, one per in-flight loop, indexed by the loop ring.
    work: [ContiguousWork; MAX_CONCURRENT_LOOPS],

    /// How many single constructs this thread has encountered.
    singles_seen: Cell<u64>,
    reduction: Cell<ReductionMethod>,
    random: Mlfsr32,

    // Tasking state.
    task_pool: TaskPool,
    current_task: Cell<*mut TaskDescriptor>,
    taskgroup: Cell<*mut Taskgroup>,
    /// Children of this thread's implicit task, for taskwait outside any
    /// explicit task.
    pub(crate) child_tasks: AtomicIsize,
}

// The Cell fields are owner-thread-only by construction (each thread touches
// only its own Thread through the thread-local pointer). Cross-thread access
// is limited to the work slots, the task pool, and the child-task counter,
// all of which synchronize internally.
unsafe impl Sync for Thread {}

impl Thread {
    /// Builds this OS thread's `Thread`, installs it in the team and the
    /// thread-local slot, and counts it as created. Runs on the thread being
    /// described, so first-touch allocation lands on the right NUMA node.
    fn create(team: &'static ThreadTeam, local_id: i32, global_id: i32) -> &'static Thread {
        let core = pin_to_core(local_id as usize);
        let thread: &'static Thread = Box::leak(Box::new(Thread {
            global_id,
            local_id,
            team,
            core,
            current_loop: Cell::new(core::ptr::null()),
            dynamic_loop_count: Cell::new(0),
            next_loop_chunk: Cell::new(0),
            work: core::array::from_fn(|_| ContiguousWork::new()),
            singles_seen: Cell::new(0),
            reduction: Cell::new(ReductionMethod::Unknown),
            random: Mlfsr32::new(),
            task_pool: TaskPool::new(),
            current_task: Cell::new(core::ptr::null_mut()),
            taskgroup: Cell::new(core::ptr::null_mut()),
            child_tasks: AtomicIsize::new(0),
        }));
        CURRENT_THREAD.with(|current| current.set(thread));
        team.install_thread(local_id as usize, thread);
        if let Some(core) = core {
            numa::register_thread(thread, core);
        }
        trace!(local_id, ?core, "thread created");
        team.count_created();
        thread
    }

    /// The calling thread's team identity. The first call in the process
    /// initializes the runtime, making the caller thread 0.
    pub fn current() -> &'static Thread {
        let ptr = CURRENT_THREAD.with(Cell::get);
        if !ptr.is_null() {
            // Installed by `create` on this very thread; never torn down.
            return unsafe { &*ptr };
        }
        crate::runtime::initialize();
        let ptr = CURRENT_THREAD.with(Cell::get);
        if ptr.is_null() {
            fatal(
                RuntimeError::Assertion,
                format_args!("runtime entered from a thread outside the team"),
            );
        }
        unsafe { &*ptr }
    }

    /// Whether this OS thread already belongs to a team.
    pub(crate) fn is_registered() -> bool {
        !CURRENT_THREAD.with(Cell::get).is_null()
    }

    pub fn local_id(&self) -> i32 {
        self.local_id
    }

    pub fn global_id(&self) -> i32 {
        self.global_id
    }

    pub fn team(&self) -> &'static ThreadTeam {
        self.team
    }

    pub(crate) fn core(&self) -> Option<usize> {
        self.core
    }

    // Dynamic loop accessors.

    pub(crate) fn current_loop(&self) -> Option<&'static DynamicLoop> {
        // Loops live in the team's ring, which is as long-lived as we are.
        unsafe { self.current_loop.get().as_ref() }
    }

    pub(crate) fn set_current_loop(&self, the_loop: &DynamicLoop) {
        self.current_loop.set(the_loop);
    }

    pub(crate) fn dynamic_loop_count(&self) -> u32 {
        self.dynamic_loop_count.get()
    }

    /// Leave the current dynamic loop: bump the loop ordinal and release our
    /// reference on the descriptor.
    pub(crate) fn end_dynamic_loop(&self) {
        let finished = self.dynamic_loop_count.get();
        self.dynamic_loop_count.set(finished + 1);
        trace!(
            me = self.local_id,
            finished,
            "releasing dynamic loop"
        );
        if let Some(the_loop) = self.current_loop() {
            the_loop.decrement_use();
        }
        self.current_loop.set(core::ptr::null());
    }

    pub(crate) fn next_loop_chunk(&self) -> u64 {
        self.next_loop_chunk.get()
    }

    pub(crate) fn set_next_loop_chunk(&self, chunk: u64) {
        self.next_loop_chunk.set(chunk);
    }

    pub(crate) fn work_at(&self, index: usize) -> &ContiguousWork {
        &self.work[index]
    }

    pub(crate) fn next_random(&self) -> u32 {
        self.random.next()
    }

    // Singles and reductions.

    pub(crate) fn fetch_and_incr_single_count(&self) -> u64 {
        let seen = self.singles_seen.get();
        self.singles_seen.set(seen + 1);
        seen
    }

    pub(crate) fn reduction(&self) -> ReductionMethod {
        self.reduction.get()
    }

    pub(crate) fn set_reduction(&self, method: ReductionMethod) {
        self.reduction.set(method);
    }

    // Tasking accessors.

    pub(crate) fn task_pool(&self) -> &TaskPool {
        &self.task_pool
    }

    pub(crate) fn current_task(&self) -> *mut TaskDescriptor {
        self.current_task.get()
    }

    pub(crate) fn set_current_task(&self, task: *mut TaskDescriptor) {
        self.current_task.set(task);
    }

    pub(crate) fn current_taskgroup(&self) -> *mut Taskgroup {
        self.taskgroup.get()
    }

    pub(crate) fn set_current_taskgroup(&self, taskgroup: *mut Taskgroup) {
        self.taskgroup.set(taskgroup);
    }

    /// Runs a region body on this thread, accounting it as the thread's
    /// implicit task.
    pub(crate) fn run(&self, info: &InvocationInfo) {
        self.team.active_tasks.fetch_add(1, Ordering::AcqRel);
        let gtid = &self.global_id as *const i32 as *mut i32;
        let ltid = &self.local_id as *const i32 as *mut i32;
        // The id pointers are handed out read-only by convention; the body
        // receives them as the compiler declared them.
        unsafe { info.run(gtid, ltid) };
        self.team.active_tasks.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Pins the calling thread to the logical CPU whose id equals its thread
/// number, where the platform permits.
fn pin_to_core(index: usize) -> Option<usize> {
    let cores = core_affinity::get_core_ids()?;
    let core = cores.get(index).copied()?;
    if core_affinity::set_for_current(core) {
        Some(core.id)
    } else {
        warning(format_args!("failed to pin thread {index} to a core"));
        None
    }
}

// -----------------------------------------------------------------------------
// The team

/// The process's one team of threads, plus everything they share: the
/// barrier, the dynamic-loop ring, the runtime-schedule ICV, and the
/// team-wide counters.
pub struct ThreadTeam {
    /// Filled in by each thread as it creates itself; read-only afterwards.
    threads: Vec<AtomicPtr<Thread>>,
    num_threads: usize,
    threads_created: AtomicU32,
    barrier: Barrier,
    /// Single-writer (thread 0) region flag.
    parallel: AtomicBool,
    runtime_schedule: Mutex<IcvSchedule>,
    loops: [DynamicLoop; MAX_CONCURRENT_LOOPS],
    /// Monotonic count of single constructs claimed team-wide. 64 bits so it
    /// cannot wrap in any realistic run.
    next_single: AtomicU64,
    /// Tasks (implicit and explicit) currently live in the team; the barrier
    /// drain spins on this.
    pub(crate) active_tasks: CachePadded<AtomicIsize>,
}

impl ThreadTeam {
    /// Builds the team: the caller becomes thread 0, workers 1..N spawn on
    /// fresh OS threads and detach. Returns once every thread has finished
    /// its own initialization — a plain counter handshake is enough, because
    /// until then no caller can reach the new threads through the team array.
    pub fn create(requested: usize) -> &'static ThreadTeam {
        let num_threads = if requested == 0 {
            hardware_concurrency()
        } else {
            requested
        };
        if num_threads > MAX_THREADS {
            fatal(
                RuntimeError::TooManyThreads,
                format_args!("requested {num_threads} threads; the cap is {MAX_THREADS}"),
            );
        }
        debug!(num_threads, "building thread team");

        let team: &'static ThreadTeam = Box::leak(Box::new(ThreadTeam {
            threads: (0..num_threads)
                .map(|_| AtomicPtr::new(core::ptr::null_mut()))
                .collect(),
            num_threads,
            threads_created: AtomicU32::new(0),
            barrier: Barrier::new(num_threads),
            parallel: AtomicBool::new(false),
            runtime_schedule: Mutex::new(IcvSchedule::default()),
            loops: core::array::from_fn(|_| DynamicLoop::new()),
            next_single: AtomicU64::new(0),
            active_tasks: CachePadded::new(AtomicIsize::new(0)),
        }));

        // The constructing thread is thread 0.
        Thread::create(team, 0, 0);

        for i in 1..num_threads {
            let spawned = ThreadBuilder::new()
                .name(format!("worker {i}"))
                .spawn(move || worker_main(team, i as i32));
            match spawned {
                // Dropping the handle detaches the worker; it never exits.
                Ok(_) => {}
                Err(error) => fatal(
                    RuntimeError::Assertion,
                    format_args!("failed to spawn worker {i}: {error}"),
                ),
            }
        }

        team.wait_for_creation();
        debug!("all team threads created");
        team
    }

    fn wait_for_creation(&self) {
        while self.threads_created.load(Ordering::Acquire) != self.num_threads as u32 {
            core::hint::spin_loop();
        }
    }

    fn install_thread(&self, local_id: usize, thread: &'static Thread) {
        self.threads[local_id].store(thread as *const Thread as *mut Thread, Ordering::Release);
    }

    fn count_created(&self) {
        self.threads_created.fetch_add(1, Ordering::Release);
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn thread(&self, local_id: usize) -> &'static Thread {
        let ptr = self.threads[local_id].load(Ordering::Acquire);
        runtime_assert!(!ptr.is_null(), "thread {local_id} not yet installed");
        unsafe { &*ptr }
    }

    pub fn in_parallel(&self) -> bool {
        self.parallel.load(Ordering::Relaxed)
    }

    fn enter_parallel(&self) {
        self.parallel.store(true, Ordering::Relaxed);
    }

    fn leave_parallel(&self) {
        self.parallel.store(false, Ordering::Relaxed);
    }

    pub(crate) fn barrier(&self) -> &Barrier {
        &self.barrier
    }

    pub(crate) fn loop_at(&self, index: usize) -> &DynamicLoop {
        &self.loops[index]
    }

    pub(crate) fn runtime_schedule(&self) -> IcvSchedule {
        *self.runtime_schedule.lock().unwrap()
    }

    pub(crate) fn set_runtime_schedule(&self, schedule: IcvSchedule) {
        *self.runtime_schedule.lock().unwrap() = schedule;
    }

    /// Claims the single construct numbered `seen` if nobody else has.
    /// Test-and-test-and-set to spare the cache line an RFO when losing.
    pub(crate) fn try_increment_next_single(&self, seen: u64) -> bool {
        self.next_single.load(Ordering::Acquire) == seen
            && self
                .next_single
                .compare_exchange(seen, seen + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}

// -----------------------------------------------------------------------------
// Worker main loop

/// Wait in the barrier for work, run it, check back in, forever.
fn worker_main(team: &'static ThreadTeam, local_id: i32) {
    let thread = Thread::create(team, local_id, local_id);
    team.wait_for_creation();
    trace!(local_id, "worker entering the fork/join barrier");
    let me = local_id as usize;
    loop {
        let work = team.barrier().check_out(false, me);
        runtime_assert!(
            !work.is_null(),
            "worker {me} woken without an invocation"
        );
        // The descriptor lives on the forking caller's stack until the join
        // barrier completes, which is after this thread checks in.
        thread.run(unsafe { &*work });
        team.barrier().check_in(me, true);
    }
}

// -----------------------------------------------------------------------------
// Fork

/// Dispatches a register-convention outlined body across the team, runs it on
/// thread 0 too, and joins.
///
/// # Safety
///
/// `body` must tolerate being called with `args.len()` pointer arguments
/// after the two id pointers, and each argument must stay valid for the
/// duration of the region.
pub unsafe fn fork(body: RegisterBody, args: &[*mut ()]) {
    let info = unsafe { InvocationInfo::for_outlined(body, args) };
    fork_invocation(&info);
}

/// Dispatches a single-pointer-convention body across the team.
pub fn fork_shared(body: SharedBody, arg: *mut ()) {
    let info = InvocationInfo::for_shared(body, arg);
    fork_invocation(&info);
}

fn fork_invocation(info: &InvocationInfo) {
    let me = Thread::current();
    let team = me.team();

    if team.in_parallel() {
        fatal(
            RuntimeError::NestedParallel,
            format_args!("nested parallelism is not supported"),
        );
    }
    runtime_assert!(
        me.local_id() == 0,
        "fork from thread {} of the team",
        me.local_id()
    );

    team.enter_parallel();
    trace!("fork: dispatching work to the team");

    // Hand the invocation to every waiting worker, run the body ourselves,
    // then collect the team. The check-in drains tasks until everything the
    // region created has completed.
    team.barrier().wake_up(0, info);
    me.run(info);
    team.barrier().check_in(0, true);

    trace!("fork: region complete");
    team.leave_parallel();
}
