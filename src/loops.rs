//! Loop scheduling: canonical loop reduction, static iteration splitting, and
//! the dynamic dispatch machinery (guided, monotonic-dynamic, and the
//! work-stealing nonmonotonic-dynamic schedule).
//!
//! A user loop `for (i = b; i op e; i += s)` (op ∈ {≤, ≥}) is reduced to a
//! chunk-indexed [`CanonicalLoop`]; all scheduling then deals in chunk
//! indices. Dynamic loops rent a [`DynamicLoop`] descriptor from the team's
//! ring, claimed by the first thread to arrive and released by the last to
//! leave, so `nowait` loops can overlap.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use tracing::{debug, trace};

use crate::errors::{fatal, runtime_assert, warning, RuntimeError};
use crate::team::{Thread, ThreadTeam};

/// The number of concurrently executing dynamic loops a team supports (more
/// than one because of `nowait`). Must be a power of two: descriptors are
/// found by masking the loop sequence number.
pub const MAX_CONCURRENT_LOOPS: usize = 16;
const _: () = assert!(MAX_CONCURRENT_LOOPS.is_power_of_two());

pub(crate) const LOOP_INDEX_MASK: usize = MAX_CONCURRENT_LOOPS - 1;

// -----------------------------------------------------------------------------
// Schedule kinds

/// The externally visible schedule kinds, as used by `set_schedule` /
/// `get_schedule` and `OMP_SCHEDULE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedKind {
    Static,
    Dynamic,
    Guided,
    Auto,
    /// Debug schedule: nonmonotonic stealing with all work initially on
    /// thread 0.
    Imbalanced,
}

/// A monotonicity modifier as it appears in schedule requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Monotonicity {
    #[default]
    Unspecified,
    Monotonic,
    Nonmonotonic,
}

/// What the compiler hands to `dispatch_init`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub kind: RequestKind,
    pub modifier: Monotonicity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Static,
    StaticChunked,
    Guided,
    Dynamic,
    Auto,
    Runtime,
    Imbalanced,
}

impl ScheduleRequest {
    pub fn new(kind: RequestKind) -> ScheduleRequest {
        ScheduleRequest {
            kind,
            modifier: Monotonicity::Unspecified,
        }
    }

    pub fn with_modifier(kind: RequestKind, modifier: Monotonicity) -> ScheduleRequest {
        ScheduleRequest { kind, modifier }
    }
}

/// The static schedules `for_static_init` understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaticSchedule {
    /// One contiguous block per thread.
    Blocked,
    /// Chunks handed out cyclically with stride N·scale.
    Chunked,
}

/// A fully resolved schedule, stored in the loop descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResolvedSchedule {
    Static,
    StaticChunked,
    Guided,
    Monotonic,
    Nonmonotonic,
    Imbalanced,
}

impl ResolvedSchedule {
    fn name(self) -> &'static str {
        match self {
            ResolvedSchedule::Static => "static",
            ResolvedSchedule::StaticChunked => "static_chunked",
            ResolvedSchedule::Guided => "guided",
            ResolvedSchedule::Monotonic => "monotonic:dynamic",
            ResolvedSchedule::Nonmonotonic => "nonmonotonic:dynamic",
            ResolvedSchedule::Imbalanced => "imbalanced",
        }
    }
}

// -----------------------------------------------------------------------------
// The schedule name table

/// The team's `schedule(runtime)` setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct IcvSchedule {
    pub kind: SchedKind,
    pub modifier: Monotonicity,
    pub chunk: u32,
}

impl Default for IcvSchedule {
    fn default() -> IcvSchedule {
        IcvSchedule {
            kind: SchedKind::Static,
            modifier: Monotonicity::Unspecified,
            chunk: 0,
        }
    }
}

/// One table drives `OMP_SCHEDULE` parsing, ICV round-trips, and diagnostics.
/// Plain `dynamic` is nonmonotonic when it comes from the user; monotonicity
/// on static schedules is accepted and ignored.
static SCHEDULE_NAMES: &[(&str, SchedKind, Monotonicity)] = &[
    ("static", SchedKind::Static, Monotonicity::Unspecified),
    ("monotonic:static", SchedKind::Static, Monotonicity::Monotonic),
    ("nonmonotonic:static", SchedKind::Static, Monotonicity::Nonmonotonic),
    ("auto", SchedKind::Auto, Monotonicity::Unspecified),
    ("guided", SchedKind::Guided, Monotonicity::Unspecified),
    ("monotonic:guided", SchedKind::Guided, Monotonicity::Monotonic),
    ("nonmonotonic:guided", SchedKind::Guided, Monotonicity::Nonmonotonic),
    ("dynamic", SchedKind::Dynamic, Monotonicity::Nonmonotonic),
    ("monotonic:dynamic", SchedKind::Dynamic, Monotonicity::Monotonic),
    ("nonmonotonic:dynamic", SchedKind::Dynamic, Monotonicity::Nonmonotonic),
    ("imbalanced", SchedKind::Imbalanced, Monotonicity::Unspecified),
];

fn lookup_schedule(candidate: &str) -> Option<(SchedKind, Monotonicity)> {
    SCHEDULE_NAMES
        .iter()
        .find(|(name, _, _)| *name == candidate)
        .map(|&(_, kind, modifier)| (kind, modifier))
}

/// Reads `OMP_SCHEDULE` and installs the result as the team's runtime
/// schedule. Unknown names warn and fall back to `static`.
pub(crate) fn initialize_loops(team: &ThreadTeam) {
    if let Some((name, chunk)) = crate::env::get_str_with_int("OMP_SCHEDULE") {
        let (kind, modifier) = lookup_schedule(&name).unwrap_or_else(|| {
            warning(format_args!(
                "'{name}' is not a schedule understood by the runtime; using schedule(static)"
            ));
            (SchedKind::Static, Monotonicity::Unspecified)
        });
        let chunk = chunk.unwrap_or(0);
        team.set_runtime_schedule(IcvSchedule {
            kind,
            modifier,
            chunk,
        });
        debug!(?kind, chunk, "runtime schedule set from OMP_SCHEDULE");
    }
}

/// ICV mutation: `set_schedule(kind, chunk)`. The user-facing `dynamic` is
/// nonmonotonic, matching the name table.
pub(crate) fn set_schedule_info(team: &ThreadTeam, kind: SchedKind, chunk: u32) {
    let modifier = match kind {
        SchedKind::Dynamic => Monotonicity::Nonmonotonic,
        _ => Monotonicity::Unspecified,
    };
    team.set_runtime_schedule(IcvSchedule {
        kind,
        modifier,
        chunk,
    });
}

/// ICV inquiry: `get_schedule`. Returns exactly what `set_schedule` stored.
pub(crate) fn get_schedule_info(team: &ThreadTeam) -> (SchedKind, u32) {
    let icv = team.runtime_schedule();
    (icv.kind, icv.chunk)
}

// -----------------------------------------------------------------------------
// Loop variables

/// The integer widths a loop variable may have. Arithmetic goes through
/// `i128` so one implementation covers signed and unsigned, narrow and wide,
/// with the loop variable's own wrapping behaviour on the way back.
pub trait LoopVar: Copy + PartialEq + core::fmt::Debug + Send + 'static {
    fn to_wide(self) -> i128;
    fn from_wide(value: i128) -> Self;
    fn payload(payload: &CanonicalPayload) -> &CanonicalLoop<Self>;
    fn make_payload(canonical: CanonicalLoop<Self>) -> CanonicalPayload;
}

/// The per-width canonical loop stored in a loop descriptor. Exactly one
/// variant is live per loop instance.
pub enum CanonicalPayload {
    None,
    I32(CanonicalLoop<i32>),
    U32(CanonicalLoop<u32>),
    I64(CanonicalLoop<i64>),
    U64(CanonicalLoop<u64>),
}

macro_rules! impl_loop_var {
    ($t:ty, $variant:ident) => {
        impl LoopVar for $t {
            fn to_wide(self) -> i128 {
                self as i128
            }

            fn from_wide(value: i128) -> Self {
                value as $t
            }

            fn payload(payload: &CanonicalPayload) -> &CanonicalLoop<Self> {
                match payload {
                    CanonicalPayload::$variant(canonical) => canonical,
                    _ => fatal(
                        RuntimeError::Assertion,
                        format_args!(
                            "loop variable width mismatch: wanted {}",
                            stringify!($t)
                        ),
                    ),
                }
            }

            fn make_payload(canonical: CanonicalLoop<Self>) -> CanonicalPayload {
                CanonicalPayload::$variant(canonical)
            }
        }
    };
}

impl_loop_var!(i32, I32);
impl_loop_var!(u32, U32);
impl_loop_var!(i64, I64);
impl_loop_var!(u64, U64);

// -----------------------------------------------------------------------------
// Canonical loops

/// The reduction of `for (i = b; i op e; i += s)` to chunk-indexed form.
/// Chunk k covers user values `b + k·scale .. b + (k+1)·scale − s`, clamped
/// to the original end in the last chunk, where `scale = chunk_size · s`.
pub struct CanonicalLoop<T: LoopVar> {
    base: T,
    end: T,
    incr: T,
    scale: T,
    count: u64,
}

impl<T: LoopVar> CanonicalLoop<T> {
    pub fn new(lb: T, ub: T, incr: T, chunk: u64) -> CanonicalLoop<T> {
        let chunk = chunk.max(1);
        let b = lb.to_wide();
        let e = ub.to_wide();
        let s = incr.to_wide();
        runtime_assert!(s != 0, "loop increment of zero");
        let trips = 1 + (e - b) / s;
        let iterations = if trips <= 0 { 0 } else { trips as u64 };
        CanonicalLoop {
            base: lb,
            end: ub,
            incr,
            scale: T::from_wide(s * chunk as i128),
            count: iterations.div_ceil(chunk),
        }
    }

    /// The number of chunks.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_last_chunk(&self, chunk: u64) -> bool {
        chunk == self.count - 1
    }

    /// The user-visible lower bound of a chunk.
    pub fn chunk_lower(&self, chunk: u64) -> T {
        T::from_wide(self.base.to_wide() + chunk as i128 * self.scale.to_wide())
    }

    /// The user-visible upper bound of a chunk, clamped to the loop end.
    pub fn chunk_upper(&self, chunk: u64) -> T {
        if self.is_last_chunk(chunk) {
            self.end
        } else {
            T::from_wide(
                self.chunk_lower(chunk).to_wide() + self.scale.to_wide() - self.incr.to_wide(),
            )
        }
    }

    /// The user-visible span of chunks `first ..= last`.
    pub fn stride(&self, first: u64, last: u64) -> T {
        T::from_wide(
            self.chunk_upper(last).to_wide() - self.chunk_lower(first).to_wide()
                + self.incr.to_wide(),
        )
    }

    /// Splits the iteration space for a compile-time static schedule, filling
    /// the compiler's lower/upper/stride/last slots. Returns whether this
    /// thread has any work.
    pub fn for_static_init(
        &self,
        schedule: StaticSchedule,
        me: u64,
        num_threads: u64,
        plast: &mut i32,
        plower: &mut T,
        pupper: &mut T,
        pstride: &mut T,
    ) -> bool {
        if self.count == 0 {
            *plast = 0;
            *pstride = self.incr;
            return false;
        }

        match schedule {
            StaticSchedule::Blocked => {
                let whole = self.count / num_threads;
                let leftover = self.count % num_threads;
                let (my_base, extras) = if me < leftover {
                    (me * (whole + 1), 1)
                } else {
                    (me * whole + leftover, 0)
                };
                // The highest thread executes the final chunk, unless there
                // are fewer chunks than threads, in which case the owner of
                // the final chunk does.
                *plast = if self.count < num_threads {
                    (me == self.count - 1) as i32
                } else {
                    (me == num_threads - 1) as i32
                };
                let my_chunks = whole + extras;
                *plower = self.chunk_lower(my_base);
                *pupper = if my_chunks > 0 {
                    self.chunk_upper(my_base + my_chunks - 1)
                } else {
                    // An empty descending range for threads with no work.
                    T::from_wide(self.chunk_lower(my_base).to_wide() - self.incr.to_wide())
                };
                *pstride = T::from_wide(self.count as i128 * self.scale.to_wide());
            }
            StaticSchedule::Chunked => {
                *pstride = T::from_wide(num_threads as i128 * self.scale.to_wide());
                *plower = self.chunk_lower(me);
                *pupper = T::from_wide(
                    self.chunk_lower(me).to_wide() + self.scale.to_wide() - self.incr.to_wide(),
                );
                *plast = (me == (self.count - 1) % num_threads) as i32;
            }
        }
        self.count > me
    }
}

// -----------------------------------------------------------------------------
// Stealable contiguous work

/// A contiguous range of chunk indices owned by one thread and stealable by
/// the rest. The `(base, end)` pair lives in a single 64-bit atomic (two
/// 32-bit halves), so the owner's pop is one `fetch_add` on the pair — the
/// returned value carries base and end together, which closes the
/// lost-last-iteration race between a popping owner and a stealing thief.
///
/// Bounds are half-open: `(n, n)` means empty, unlike the canonical form's
/// inclusive upper bound.
pub(crate) struct ContiguousWork {
    pair: CachePadded<AtomicU64>,
    stealing: AtomicBool,
    started: AtomicU64,
}

const fn pack(base: u32, end: u32) -> u64 {
    ((end as u64) << 32) | base as u64
}

const fn unpack(pair: u64) -> (u32, u32) {
    (pair as u32, (pair >> 32) as u32)
}

impl ContiguousWork {
    pub fn new() -> ContiguousWork {
        ContiguousWork {
            pair: CachePadded::new(AtomicU64::new(0)),
            stealing: AtomicBool::new(false),
            started: AtomicU64::new(0),
        }
    }

    pub fn assign(&self, base: u32, end: u32) {
        self.pair.store(pack(base, end), Ordering::Relaxed);
    }

    /// The static, maximal-chunk split used to seed a nonmonotonic loop.
    pub fn initialize_balanced(&self, count: u32, me: u32, num_threads: u32) {
        let whole = count / num_threads;
        let leftover = count % num_threads;
        let (base, end) = if me < leftover {
            let base = me * (whole + 1);
            (base, base + whole + 1)
        } else {
            let base = me * whole + leftover;
            (base, base + whole)
        };
        self.assign(base, end);
    }

    pub fn zero_started(&self) {
        self.started.store(0, Ordering::Release);
    }

    /// Owner's pop of the lowest remaining chunk. The unconditional add on
    /// the packed pair cannot carry into the end half: the base only moves
    /// when the pre-add value still had `base < end`.
    pub fn pop_base(&self) -> Option<u32> {
        let (base, end) = unpack(self.pair.load(Ordering::Acquire));
        if base >= end {
            return None;
        }
        let before = self.pair.fetch_add(1, Ordering::SeqCst);
        let (base, end) = unpack(before);
        if base >= end {
            // A thief took the last chunk while we were claiming it; the
            // overshoot leaves the range empty-and-invalid, which every
            // reader already treats as empty.
            return None;
        }
        Some(base)
    }

    /// Steals the upper half of the remaining work, rounding up so the last
    /// chunk is always stealable. Returns the stolen half-open range.
    pub fn try_steal(&self) -> Option<(u32, u32)> {
        let mut observed = self.pair.load(Ordering::Acquire);
        loop {
            let (base, end) = unpack(observed);
            if base >= end {
                return None;
            }
            let available = end - base;
            let new_end = end - (available + 1) / 2;
            match self.pair.compare_exchange_weak(
                observed,
                pack(base, new_end),
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some((new_end, end)),
                Err(current) => observed = current,
            }
        }
    }

    pub fn is_stealing(&self) -> bool {
        self.stealing.load(Ordering::Acquire)
    }

    pub fn set_stealing(&self) {
        self.stealing.store(true, Ordering::Release);
    }

    pub fn clear_stealing(&self) {
        self.stealing.store(false, Ordering::Release);
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Acquire)
    }

    /// Only the owning thread moves this, so plain load-and-store suffices.
    pub fn incr_started(&self) {
        self.started
            .store(self.started.load(Ordering::Relaxed) + 1, Ordering::Release);
    }
}

// -----------------------------------------------------------------------------
// Dynamic loop descriptors

/// One reusable dynamic-loop instance, rented from the team's ring.
///
/// Lifecycle: free (sequence = −1) → claimed by the first arriver (CAS to the
/// loop ordinal) → initialized → used by up to `thread_count` threads → each
/// leaver drops the refcount → the last leaver frees it.
pub(crate) struct DynamicLoop {
    refcount: CachePadded<AtomicU64>,
    sequence: AtomicI64,
    /// Shared next-chunk cursor for guided and monotonic-dynamic.
    next_iteration: AtomicU64,
    /// Set by the first stealer to observe that all iterations have started.
    finished: AtomicBool,
    inner: UnsafeCell<LoopInner>,
}

struct LoopInner {
    schedule: ResolvedSchedule,
    thread_count: u32,
    payload: CanonicalPayload,
}

// The inner state is written only by the claiming thread, before the release
// store of the refcount publishes it; all other access is read-only after an
// acquire load observes the publication.
unsafe impl Sync for DynamicLoop {}

impl DynamicLoop {
    pub fn new() -> DynamicLoop {
        DynamicLoop {
            refcount: CachePadded::new(AtomicU64::new(0)),
            sequence: AtomicI64::new(-1),
            next_iteration: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            inner: UnsafeCell::new(LoopInner {
                schedule: ResolvedSchedule::Static,
                thread_count: 0,
                payload: CanonicalPayload::None,
            }),
        }
    }

    fn loop_index(&self) -> usize {
        (self.sequence.load(Ordering::Relaxed) as u64 as usize) & LOOP_INDEX_MASK
    }

    fn is_uninitialized(&self, sequence: i64) -> bool {
        self.sequence.load(Ordering::Acquire) != sequence
            || self.refcount.load(Ordering::Acquire) == 0
    }

    fn claim(&self, sequence: i64) -> bool {
        self.sequence
            .compare_exchange(-1, sequence, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Leave the loop. The refcount counts threads that still have to leave,
    /// not threads currently inside, so the descriptor is only recycled once
    /// the whole team has been through.
    pub fn decrement_use(&self) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.sequence.store(-1, Ordering::Release);
            trace!("dynamic loop descriptor released");
        }
    }

    fn complete_initialization(&self, num_threads: u64) {
        self.finished.store(false, Ordering::Relaxed);
        self.refcount.store(num_threads, Ordering::Release);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// # Safety
    /// Only after this thread has observed the publication (claimed the
    /// descriptor itself, or spun until `is_uninitialized` went false).
    unsafe fn inner(&self) -> &LoopInner {
        unsafe { &*self.inner.get() }
    }

    /// # Safety
    /// Only the claiming thread, between `claim` and
    /// `complete_initialization`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn inner_mut(&self) -> &mut LoopInner {
        unsafe { &mut *self.inner.get() }
    }
}

// -----------------------------------------------------------------------------
// Schedule resolution

/// Turns the compiler's request into a concrete schedule plus chunk size,
/// consulting the team ICV for `schedule(runtime)`.
fn resolve_schedule(
    team: &ThreadTeam,
    request: ScheduleRequest,
    chunk: u64,
) -> (ResolvedSchedule, u64) {
    let mut kind = request.kind;
    let mut modifier = request.modifier;
    let mut chunk = chunk;

    if kind == RequestKind::Runtime {
        let icv = team.runtime_schedule();
        chunk = icv.chunk as u64;
        modifier = icv.modifier;
        kind = match icv.kind {
            SchedKind::Static if chunk == 0 => RequestKind::Static,
            SchedKind::Static => RequestKind::StaticChunked,
            SchedKind::Dynamic => RequestKind::Dynamic,
            SchedKind::Guided => RequestKind::Guided,
            SchedKind::Auto => RequestKind::Auto,
            SchedKind::Imbalanced => RequestKind::Imbalanced,
        };
    }

    // Auto maps to static when monotonicity is required, otherwise to the
    // stealing schedule.
    if kind == RequestKind::Auto {
        if modifier == Monotonicity::Monotonic {
            kind = if chunk == 0 {
                RequestKind::Static
            } else {
                RequestKind::StaticChunked
            };
        } else {
            kind = RequestKind::Dynamic;
            modifier = Monotonicity::Nonmonotonic;
        }
    }

    if chunk == 0 {
        chunk = 1;
    }

    // A single-thread team gets the blocked static schedule: semantically
    // identical, much cheaper to dispatch.
    if team.num_threads() == 1 {
        return (ResolvedSchedule::Static, chunk);
    }

    let resolved = match kind {
        RequestKind::Static => ResolvedSchedule::Static,
        RequestKind::StaticChunked => ResolvedSchedule::StaticChunked,
        RequestKind::Guided => ResolvedSchedule::Guided,
        RequestKind::Dynamic => match modifier {
            Monotonicity::Nonmonotonic => ResolvedSchedule::Nonmonotonic,
            _ => ResolvedSchedule::Monotonic,
        },
        RequestKind::Imbalanced => ResolvedSchedule::Imbalanced,
        RequestKind::Auto | RequestKind::Runtime => fatal(
            RuntimeError::Assertion,
            format_args!("schedule {kind:?} survived resolution"),
        ),
    };
    (resolved, chunk)
}

// -----------------------------------------------------------------------------
// Dynamic loop initialization

fn compute_dynamic_loop_params<T: LoopVar>(
    team: &ThreadTeam,
    the_loop: &DynamicLoop,
    request: ScheduleRequest,
    lb: T,
    ub: T,
    incr: T,
    chunk: u64,
) {
    let (mut schedule, chunk) = resolve_schedule(team, request, chunk);
    let canonical = CanonicalLoop::<T>::new(lb, ub, incr, chunk);
    let count = canonical.count();

    // The stealable range packs chunk indices into 32-bit halves; a loop too
    // large for that falls back to the monotonic shared cursor.
    if matches!(
        schedule,
        ResolvedSchedule::Nonmonotonic | ResolvedSchedule::Imbalanced
    ) && count >= u32::MAX as u64
    {
        debug!(count, "loop too large for stealing; using monotonic dynamic");
        schedule = ResolvedSchedule::Monotonic;
    }

    let num_threads = team.num_threads();
    // Publication happens via the refcount store in complete_initialization.
    let inner = unsafe { the_loop.inner_mut() };
    inner.schedule = schedule;
    inner.thread_count = num_threads as u32;
    inner.payload = T::make_payload(canonical);
    the_loop.next_iteration.store(0, Ordering::Relaxed);

    // Schedules with stealable per-thread state must have every thread's
    // slot ready before any thread enters the loop, or early arrivers would
    // steal from uninitialized ranges.
    match schedule {
        ResolvedSchedule::Imbalanced => {
            let index = the_loop.loop_index();
            for t in 0..num_threads {
                let work = team.thread(t).work_at(index);
                if t == 0 {
                    work.assign(0, count as u32);
                } else {
                    work.assign(0, 0);
                }
                work.zero_started();
            }
            trace!(index, "seeded imbalanced loop, all work on thread 0");
        }
        ResolvedSchedule::Nonmonotonic => {
            let index = the_loop.loop_index();
            for t in 0..num_threads {
                let work = team.thread(t).work_at(index);
                work.initialize_balanced(count as u32, t as u32, num_threads as u32);
                work.zero_started();
            }
            trace!(index, "seeded nonmonotonic loop with balanced ranges");
        }
        _ => {}
    }

    trace!(
        schedule = schedule.name(),
        count,
        chunk,
        "dynamic loop initialized"
    );
}

/// Joins (or creates) the dynamic loop this thread is about to run.
pub(crate) fn dynamic_init<T: LoopVar>(
    request: ScheduleRequest,
    lb: T,
    ub: T,
    incr: T,
    chunk: T,
) {
    let thread = Thread::current();
    let team = thread.team();
    let my_loop_count = thread.dynamic_loop_count();
    let the_loop = team.loop_at(my_loop_count as usize & LOOP_INDEX_MASK);
    let sequence = my_loop_count as i64;

    trace!(
        me = thread.local_id(),
        loop_count = my_loop_count,
        "dynamic loop init"
    );

    // The pointer is correct even before the descriptor is set up; nobody
    // looks through it until the publication check below passes.
    thread.set_current_loop(the_loop);

    // The first thread to claim the descriptor initializes it; the rest wait
    // for the publication. The claim stays inside the loop because the slot
    // may still be held by an earlier (nowait) loop, in which case it only
    // becomes claimable once that loop's last thread leaves.
    while the_loop.is_uninitialized(sequence) {
        if the_loop.claim(sequence) {
            let chunk = chunk.to_wide().max(0) as u64;
            compute_dynamic_loop_params::<T>(team, the_loop, request, lb, ub, incr, chunk);
            the_loop.complete_initialization(team.num_threads() as u64);
            break;
        }
        core::hint::spin_loop();
    }

    // Per-thread cursors for the static schedules, reread from the resolved
    // schedule (the request may have been `runtime` or `auto`).
    let schedule = unsafe { the_loop.inner() }.schedule;
    match schedule {
        ResolvedSchedule::Static => thread.set_next_loop_chunk(0),
        // Static cyclic starts at the chunk matching our thread number; each
        // dispatch call then strides by the team size.
        ResolvedSchedule::StaticChunked => {
            thread.set_next_loop_chunk(thread.local_id() as u64)
        }
        _ => {}
    }
}

// -----------------------------------------------------------------------------
// Dispatch

/// Hands this thread its next chunk, or ends its participation in the loop.
pub(crate) fn dispatch_next<T: LoopVar>(
    plast: &mut i32,
    plower: &mut T,
    pupper: &mut T,
    pstride: &mut T,
) -> bool {
    let thread = Thread::current();
    let Some(the_loop) = thread.current_loop() else {
        fatal(
            RuntimeError::Assertion,
            format_args!("dispatch_next outside any dynamic loop"),
        )
    };
    let inner = unsafe { the_loop.inner() };
    let have_iterations = match inner.schedule {
        ResolvedSchedule::Static => {
            dispatch_static::<T>(inner, thread, plast, plower, pupper, pstride)
        }
        ResolvedSchedule::StaticChunked => {
            dispatch_static_chunked::<T>(inner, thread, plast, plower, pupper, pstride)
        }
        ResolvedSchedule::Guided => {
            dispatch_guided::<T>(the_loop, inner, plast, plower, pupper, pstride)
        }
        ResolvedSchedule::Monotonic => {
            dispatch_monotonic::<T>(the_loop, inner, plast, plower, pupper, pstride)
        }
        ResolvedSchedule::Nonmonotonic | ResolvedSchedule::Imbalanced => {
            dispatch_nonmonotonic::<T>(the_loop, inner, thread, plast, plower, pupper, pstride)
        }
    };
    if have_iterations {
        true
    } else {
        thread.end_dynamic_loop();
        false
    }
}

fn fill_chunk<T: LoopVar>(
    canonical: &CanonicalLoop<T>,
    chunk: u64,
    plast: &mut i32,
    plower: &mut T,
    pupper: &mut T,
    pstride: &mut T,
) {
    *plower = canonical.chunk_lower(chunk);
    *pupper = canonical.chunk_upper(chunk);
    *pstride = canonical.stride(chunk, chunk);
    *plast = canonical.is_last_chunk(chunk) as i32;
}

/// Static blocked under the dynamic interface: the first call returns the
/// whole block, later calls report completion.
fn dispatch_static<T: LoopVar>(
    inner: &LoopInner,
    thread: &Thread,
    plast: &mut i32,
    plower: &mut T,
    pupper: &mut T,
    pstride: &mut T,
) -> bool {
    if thread.next_loop_chunk() == 0 {
        thread.set_next_loop_chunk(1);
        T::payload(&inner.payload).for_static_init(
            StaticSchedule::Blocked,
            thread.local_id() as u64,
            inner.thread_count as u64,
            plast,
            plower,
            pupper,
            pstride,
        )
    } else {
        false
    }
}

/// Static cyclic: each call hands out the thread's next chunk, striding by
/// the team size.
fn dispatch_static_chunked<T: LoopVar>(
    inner: &LoopInner,
    thread: &Thread,
    plast: &mut i32,
    plower: &mut T,
    pupper: &mut T,
    pstride: &mut T,
) -> bool {
    let canonical = T::payload(&inner.payload);
    let my_chunk = thread.next_loop_chunk();
    if my_chunk >= canonical.count() {
        return false;
    }
    *plower = canonical.chunk_lower(my_chunk);
    *pupper = canonical.chunk_upper(my_chunk);
    *pstride = T::from_wide(inner.thread_count as i128 * canonical.scale.to_wide());
    *plast = canonical.is_last_chunk(my_chunk) as i32;
    thread.set_next_loop_chunk(my_chunk + inner.thread_count as u64);
    true
}

/// Guided: claim about half of a fair share of what remains, always at
/// least one chunk.
fn dispatch_guided<T: LoopVar>(
    the_loop: &DynamicLoop,
    inner: &LoopInner,
    plast: &mut i32,
    plower: &mut T,
    pupper: &mut T,
    pstride: &mut T,
) -> bool {
    let canonical = T::payload(&inner.payload);
    let num_threads = inner.thread_count as u64;
    loop {
        let next = the_loop.next_iteration.load(Ordering::SeqCst);
        let remaining = canonical.count() - next;
        if remaining == 0 {
            return false;
        }
        let my_share = remaining.div_ceil(num_threads);
        let delta = (my_share + 1) / 2;
        if the_loop
            .next_iteration
            .compare_exchange(next, next + delta, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let last_chunk = next + delta - 1;
            *plower = canonical.chunk_lower(next);
            *pupper = canonical.chunk_upper(last_chunk);
            *pstride = canonical.stride(next, last_chunk);
            *plast = canonical.is_last_chunk(last_chunk) as i32;
            return true;
        }
        core::hint::spin_loop();
    }
}

/// Monotonic dynamic: one chunk per call off the shared cursor. The
/// compare-exchange (rather than an add) keeps the cursor from running past
/// the end of the iteration space.
fn dispatch_monotonic<T: LoopVar>(
    the_loop: &DynamicLoop,
    inner: &LoopInner,
    plast: &mut i32,
    plower: &mut T,
    pupper: &mut T,
    pstride: &mut T,
) -> bool {
    let canonical = T::payload(&inner.payload);
    loop {
        let next = the_loop.next_iteration.load(Ordering::SeqCst);
        if next == canonical.count() {
            return false;
        }
        if the_loop
            .next_iteration
            .compare_exchange(next, next + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            fill_chunk(canonical, next, plast, plower, pupper, pstride);
            return true;
        }
        core::hint::spin_loop();
    }
}

/// Nonmonotonic dynamic: pop locally; when dry, steal half of a random
/// victim's range. Termination is detected by summing every thread's
/// started-count during the sweep.
fn dispatch_nonmonotonic<T: LoopVar>(
    the_loop: &DynamicLoop,
    inner: &LoopInner,
    thread: &Thread,
    plast: &mut i32,
    plower: &mut T,
    pupper: &mut T,
    pstride: &mut T,
) -> bool {
    let canonical = T::payload(&inner.payload);
    let me = thread.local_id() as usize;
    let team = thread.team();
    let index = the_loop.loop_index();
    let my_work = thread.work_at(index);

    // Normal case, we hope: local work remains.
    if let Some(next) = my_work.pop_base() {
        my_work.incr_started();
        fill_chunk(canonical, next as u64, plast, plower, pupper, pstride);
        return true;
    }

    // Someone already observed that every iteration has started.
    if the_loop.is_finished() {
        return false;
    }

    let num_threads = inner.thread_count as usize;
    // Random starting victim; re-roll rather than skew towards a neighbour.
    let mut victim = thread.next_random() as usize % num_threads;
    while victim == me {
        victim = thread.next_random() as usize % num_threads;
    }

    let total = canonical.count();
    // Flag our own slot so nobody wastes a steal attempt on it.
    my_work.set_stealing();

    while !the_loop.is_finished() {
        let mut started = my_work.started();
        for i in 0..num_threads {
            let v = (victim + i) % num_threads;
            if v == me {
                continue;
            }
            let other = team.thread(v).work_at(index);
            started += other.started();
            runtime_assert!(
                started <= total,
                "started-iteration count {started} exceeds loop total {total}"
            );
            if started == total {
                // No more work anywhere; tell everyone.
                the_loop.set_finished();
                my_work.clear_stealing();
                return false;
            }
            if other.is_stealing() {
                continue;
            }
            if let Some((stolen_base, stolen_end)) = other.try_steal() {
                // Execute the lowest stolen chunk ourselves and own the rest,
                // where other threads can steal it back.
                my_work.incr_started();
                my_work.assign(stolen_base + 1, stolen_end);
                my_work.clear_stealing();
                trace!(me, victim = v, stolen_base, stolen_end, "stole iterations");
                fill_chunk(canonical, stolen_base as u64, plast, plower, pupper, pstride);
                return true;
            }
        }
        core::hint::spin_loop();
    }
    my_work.clear_stealing();
    false
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    #[test]
    fn canonical_counts() {
        assert_eq!(CanonicalLoop::<i32>::new(0, 19, 1, 1).count(), 20);
        assert_eq!(CanonicalLoop::<i32>::new(0, 19, 1, 4).count(), 5);
        assert_eq!(CanonicalLoop::<i32>::new(0, 19, 1, 6).count(), 4);
        assert_eq!(CanonicalLoop::<i32>::new(0, 18, 2, 1).count(), 10);
        assert_eq!(CanonicalLoop::<i32>::new(19, 0, -1, 1).count(), 20);
        assert_eq!(CanonicalLoop::<i32>::new(5, 4, 1, 1).count(), 0);
        assert_eq!(CanonicalLoop::<u64>::new(0, u32::MAX as u64, 1, 1).count(), 1 << 32);
    }

    #[test]
    fn canonical_chunk_bounds() {
        // for (i = 3; i <= 18; i += 2), chunk 3: scale 6.
        let canonical = CanonicalLoop::<i32>::new(3, 18, 2, 3);
        assert_eq!(canonical.count(), 3);
        assert_eq!(canonical.chunk_lower(0), 3);
        assert_eq!(canonical.chunk_upper(0), 7);
        assert_eq!(canonical.chunk_lower(1), 9);
        assert_eq!(canonical.chunk_upper(1), 13);
        assert_eq!(canonical.chunk_lower(2), 15);
        // Last chunk clamps to the loop end.
        assert_eq!(canonical.chunk_upper(2), 18);
        assert!(canonical.is_last_chunk(2));
        assert_eq!(canonical.stride(0, 0), 6);
    }

    #[test]
    fn canonical_descending() {
        let canonical = CanonicalLoop::<i64>::new(10, 1, -3, 1);
        assert_eq!(canonical.count(), 4);
        assert_eq!(canonical.chunk_lower(0), 10);
        assert_eq!(canonical.chunk_upper(0), 10);
        assert_eq!(canonical.chunk_lower(3), 1);
        assert_eq!(canonical.chunk_upper(3), 1);
    }

    #[test]
    fn static_blocked_splits_evenly() {
        let canonical = CanonicalLoop::<i32>::new(0, 19, 1, 1);
        let mut seen = Vec::new();
        for me in 0..4u64 {
            let (mut last, mut lb, mut ub, mut st) = (0, 0, 0, 0);
            assert!(canonical.for_static_init(
                StaticSchedule::Blocked,
                me,
                4,
                &mut last,
                &mut lb,
                &mut ub,
                &mut st
            ));
            assert_eq!(last != 0, me == 3);
            assert_eq!(st, 20);
            for i in lb..=ub {
                seen.push(i);
            }
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn static_blocked_more_threads_than_chunks() {
        // 3 chunks over 8 threads: threads 0..3 get one chunk each, the
        // last-iteration flag goes to thread 2, and threads 3..8 get nothing.
        let canonical = CanonicalLoop::<i32>::new(0, 2, 1, 1);
        for me in 0..8u64 {
            let (mut last, mut lb, mut ub, mut st) = (0, 0, 0, 0);
            let has_work = canonical.for_static_init(
                StaticSchedule::Blocked,
                me,
                8,
                &mut last,
                &mut lb,
                &mut ub,
                &mut st,
            );
            assert_eq!(has_work, me < 3);
            assert_eq!(last != 0, me == 2);
            if has_work {
                assert_eq!((lb, ub), (me as i32, me as i32));
            }
        }
    }

    #[test]
    fn static_cyclic_chunks() {
        // for (i = 0; i <= 18; i += 2) with chunk 5 over 3 threads:
        // 10 iterations, 2 chunks, stride 3·10 = 30.
        let canonical = CanonicalLoop::<i32>::new(0, 18, 2, 5);
        let (mut last, mut lb, mut ub, mut st) = (0, 0, 0, 0);
        assert!(canonical.for_static_init(
            StaticSchedule::Chunked,
            0,
            3,
            &mut last,
            &mut lb,
            &mut ub,
            &mut st
        ));
        assert_eq!((lb, ub, st), (0, 8, 30));
        assert_eq!(last, 0);
        // The final chunk is chunk 1, owned cyclically by thread 1.
        assert!(canonical.for_static_init(
            StaticSchedule::Chunked,
            1,
            3,
            &mut last,
            &mut lb,
            &mut ub,
            &mut st
        ));
        assert_eq!((lb, ub), (10, 18));
        assert_eq!(last, 1);
    }

    #[test]
    fn zero_trip_loop_reports_no_work() {
        let canonical = CanonicalLoop::<i32>::new(0, -1, 1, 1);
        let (mut last, mut lb, mut ub, mut st) = (1, 7, 7, 7);
        assert!(!canonical.for_static_init(
            StaticSchedule::Blocked,
            0,
            4,
            &mut last,
            &mut lb,
            &mut ub,
            &mut st
        ));
        assert_eq!(last, 0);
    }

    #[test]
    fn contiguous_pop_drains_in_order() {
        let work = ContiguousWork::new();
        work.assign(0, 5);
        for expected in 0..5 {
            assert_eq!(work.pop_base(), Some(expected));
        }
        assert_eq!(work.pop_base(), None);
        assert_eq!(work.pop_base(), None);
    }

    #[test]
    fn steal_takes_upper_half_rounded_up() {
        let work = ContiguousWork::new();
        work.assign(0, 5);
        assert_eq!(work.try_steal(), Some((2, 5)));
        assert_eq!(work.try_steal(), Some((1, 2)));
        assert_eq!(work.try_steal(), Some((0, 1)));
        assert_eq!(work.try_steal(), None);
    }

    #[test]
    fn steal_takes_the_last_iteration() {
        let work = ContiguousWork::new();
        work.assign(4, 5);
        assert_eq!(work.try_steal(), Some((4, 5)));
        assert_eq!(work.pop_base(), None);
    }

    #[test]
    fn balanced_initialization_covers_everything() {
        for (count, threads) in [(2000u32, 8u32), (7, 3), (5, 8), (1, 4)] {
            let works: Vec<ContiguousWork> = (0..threads).map(|_| ContiguousWork::new()).collect();
            let mut total = 0;
            let mut next_expected = 0;
            for (me, work) in works.iter().enumerate() {
                work.initialize_balanced(count, me as u32, threads);
                let (base, end) = unpack(work.pair.load(Ordering::Relaxed));
                assert_eq!(base, next_expected);
                next_expected = end;
                total += end - base;
            }
            assert_eq!(total, count);
        }
    }

    #[test]
    fn concurrent_pop_and_steal_lose_nothing() {
        const ITERATIONS: u32 = 10_000;
        let work = ContiguousWork::new();
        work.assign(0, ITERATIONS);
        let work = &work;
        let claimed: Vec<CachePadded<AtomicU32>> = (0..ITERATIONS as usize)
            .map(|_| CachePadded::new(AtomicU32::new(0)))
            .collect();
        let claimed = &claimed;
        thread::scope(|scope| {
            // The owner pops; three thieves steal whole ranges.
            scope.spawn(move || {
                while let Some(i) = work.pop_base() {
                    claimed[i as usize].fetch_add(1, Ordering::Relaxed);
                }
            });
            for _ in 0..3 {
                scope.spawn(move || {
                    loop {
                        match work.try_steal() {
                            Some((base, end)) => {
                                for i in base..end {
                                    claimed[i as usize].fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            None => break,
                        }
                    }
                });
            }
        });
        // The owner may still be mid-pop when thieves drain; every iteration
        // must be claimed exactly once regardless.
        for (i, slot) in claimed.iter().enumerate() {
            assert_eq!(slot.load(Ordering::Relaxed), 1, "iteration {i}");
        }
    }

    #[test]
    fn schedule_names_round_trip() {
        for &(name, kind, modifier) in SCHEDULE_NAMES {
            assert_eq!(lookup_schedule(name), Some((kind, modifier)));
        }
        assert_eq!(lookup_schedule("fastest"), None);
    }
}
