//! The barrier zoo.
//!
//! Every barrier presents the same interface ([`BarrierImpl`]): threads
//! announce arrival with `check_in`, the root releases everyone with
//! `wake_up`/`check_out`, and `full_barrier` composes the two. The fork path
//! rides on the same machinery: `wake_up` carries an [`InvocationInfo`]
//! pointer to every waiting worker.
//!
//! Centralized barriers are built by composition from two smaller pieces: a
//! [`CheckInCounter`] (how arrival is recorded and detected) and a
//! [`Broadcast`] (how release is signalled). The counter × broadcast matrix
//! plus the distributed dissemination barrier gives the full zoo, selectable
//! by name through `LOMP_BARRIER_KIND`.
//!
//! The task-scheduling hook is *not* part of the polymorphic surface: the
//! [`Barrier`] wrapper drains the tasking subsystem before dispatching to the
//! underlying implementation, so the algorithms below stay self-contained.

use core::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;

use crossbeam_utils::CachePadded;
use tracing::debug;

use crate::env;
use crate::errors::{fatal, RuntimeError};
use crate::invoke::InvocationInfo;
use crate::tasking;

// -----------------------------------------------------------------------------
// The polymorphic interface

/// The operations every barrier algorithm provides.
///
/// `check_in` returns `true` in exactly one thread of a centralizing barrier
/// (the root); that thread has seen every other thread arrive by the time the
/// call returns. `check_out` blocks non-roots until the root wakes them,
/// returning whatever payload the root broadcast (null for a plain barrier).
pub trait BarrierImpl: Send + Sync {
    /// Announces arrival. Returns whether this thread is the root.
    fn check_in(&self, me: usize) -> bool;

    /// Root broadcasts a payload (or null for a plain release).
    fn wake_up(&self, me: usize, info: *const InvocationInfo);

    /// Non-roots block until released; roots return immediately after
    /// broadcasting a null payload.
    fn check_out(&self, root: bool, me: usize) -> *const InvocationInfo;

    /// The obvious composition. Distributed barriers override this with their
    /// single-phase algorithm.
    fn full_barrier(&self, me: usize) {
        let root = self.check_in(me);
        self.check_out(root, me);
    }

    /// True for barriers without a single root; such barriers cannot deliver
    /// fork payloads.
    fn is_distributed(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str;
}

// -----------------------------------------------------------------------------
// The outer wrapper: task drain + dispatch

/// The team's barrier. The non-virtual outer `check_in` runs the tasking
/// drain (making barriers task scheduling points) before the underlying
/// algorithm sees the arrival.
pub struct Barrier {
    imp: Box<dyn BarrierImpl>,
}

impl Barrier {
    /// Builds the barrier selected by `LOMP_BARRIER_KIND` (or the default).
    pub fn new(num_threads: usize) -> Barrier {
        Barrier {
            imp: chosen_barrier().instantiate(num_threads),
        }
    }

    /// Checks in, first draining tasks until the team's active-task counter
    /// reaches the right sink: 0 for the fork/join barrier (every implicit
    /// task has retired by the time its thread checks in to the join), N for
    /// barriers inside a region (the N implicit tasks are still live).
    pub fn check_in(&self, me: usize, fork_barrier: bool) -> bool {
        tasking::task_execution_barrier(fork_barrier);
        self.imp.check_in(me)
    }

    pub fn wake_up(&self, me: usize, info: *const InvocationInfo) {
        self.imp.wake_up(me, info)
    }

    pub fn check_out(&self, root: bool, me: usize) -> *const InvocationInfo {
        self.imp.check_out(root, me)
    }

    /// A full barrier inside a parallel region; a task scheduling point.
    pub fn full_barrier(&self, me: usize) {
        if self.imp.is_distributed() {
            // Single-phase algorithm; drain explicitly since there is no
            // check-in to hang the drain on.
            tasking::task_execution_barrier(false);
            self.imp.full_barrier(me);
        } else {
            let root = self.check_in(me, false);
            self.imp.check_out(root, me);
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.imp.is_distributed()
    }

    pub fn name(&self) -> &'static str {
        self.imp.name()
    }
}

// -----------------------------------------------------------------------------
// Check-in counters

/// How a centralized barrier records and detects arrival.
///
/// `check_in` notes this thread's arrival and nominates the root candidate;
/// tree counters do their waiting inside `check_in`, flat counters leave it
/// to the root's `wait`.
pub trait CheckInCounter: Send + Sync + 'static {
    fn new(count: usize) -> Self
    where
        Self: Sized;
    fn check_in(&self, me: usize) -> bool;
    fn wait(&self);
    fn reset(&self);
}

/// A single shared fetch-add counter.
pub struct AtomicCounter {
    present: CachePadded<AtomicU32>,
    num: u32,
}

impl AtomicCounter {
    /// Tournament check-in for the dynamic tree: the arrival that finds the
    /// counter already at its target advances to the next round without
    /// incrementing; everyone else increments and loses.
    fn try_check_in(&self) -> bool {
        loop {
            let current = self.present.load(Ordering::Acquire);
            if current == self.num {
                return true;
            }
            if self
                .present
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return false;
            }
        }
    }
}

impl CheckInCounter for AtomicCounter {
    fn new(count: usize) -> AtomicCounter {
        AtomicCounter {
            present: CachePadded::new(AtomicU32::new(0)),
            num: count as u32,
        }
    }

    fn check_in(&self, me: usize) -> bool {
        self.present.fetch_add(1, Ordering::Release);
        me == 0
    }

    fn wait(&self) {
        while self.present.load(Ordering::Acquire) != self.num {
            core::hint::spin_loop();
        }
    }

    fn reset(&self) {
        self.present.store(0, Ordering::Release);
    }
}

/// A counter made of one flag byte per thread, packed eight to a word.
///
/// Arrival is a byte store rather than a read-modify-write, so check-in never
/// contends; the root polls whole words. Words the thread count does not fill
/// are pre-set so the polling loop can compare every word against all-ones.
pub struct FlagCounter {
    words: Vec<CachePadded<AtomicU64>>,
    last_mask: u64,
}

impl FlagCounter {
    fn filled_words(count: usize) -> (Vec<CachePadded<AtomicU64>>, u64) {
        let num_words = count.div_ceil(8).max(1);
        let mut last_mask = 0u64;
        for byte in (((count.max(1) - 1) & 7) + 1)..8 {
            last_mask |= 0xffu64 << (byte * 8);
        }
        let words = (0..num_words)
            .map(|w| {
                CachePadded::new(AtomicU64::new(if w == num_words - 1 { last_mask } else { 0 }))
            })
            .collect();
        (words, last_mask)
    }
}

impl CheckInCounter for FlagCounter {
    fn new(count: usize) -> FlagCounter {
        let (words, last_mask) = FlagCounter::filled_words(count);
        FlagCounter { words, last_mask }
    }

    fn check_in(&self, me: usize) -> bool {
        self.words[me / 8].fetch_or(0xffu64 << ((me % 8) * 8), Ordering::Release);
        me == 0
    }

    fn wait(&self) {
        for word in &self.words {
            while word.load(Ordering::Acquire) != u64::MAX {
                core::hint::spin_loop();
            }
        }
    }

    fn reset(&self) {
        let last = self.words.len() - 1;
        for word in &self.words[..last] {
            word.store(0, Ordering::Relaxed);
        }
        self.words[last].store(self.last_mask, Ordering::Release);
    }
}

// -----------------------------------------------------------------------------
// Tree check-in

/// A static fan-in tree: thread `i`'s children are threads `F·i+1 ..= F·i+F`.
/// Non-leaves wait for a counter of their children before checking in with
/// their parent. Parity alternates per barrier, so counters for barrier n+1
/// are reset while barrier n completes and no reset is needed in between.
pub struct FixedTreeCheckIn<C: CheckInCounter, const F: usize> {
    nodes: Vec<TreeNode>,
    sequence: Vec<CachePadded<AtomicU32>>,
    counters: [Vec<C>; 2],
}

struct TreeNode {
    parent: usize,
    position: usize,
    children: usize,
}

impl<C: CheckInCounter, const F: usize> CheckInCounter for FixedTreeCheckIn<C, F> {
    fn new(count: usize) -> Self {
        let mut nodes = Vec::with_capacity(count);
        for me in 0..count {
            let children = if F * me < count {
                if F * (me + 1) >= count {
                    count - me * F - 1
                } else {
                    F
                }
            } else {
                0
            };
            let (parent, position) = if me == 0 {
                (0, 0)
            } else {
                ((me + F - 1) / F - 1, (me - 1) % F)
            };
            nodes.push(TreeNode {
                parent,
                position,
                children,
            });
        }
        let counters = [
            nodes.iter().map(|n| C::new(n.children)).collect(),
            nodes.iter().map(|n| C::new(n.children)).collect(),
        ];
        FixedTreeCheckIn {
            nodes,
            sequence: (0..count)
                .map(|_| CachePadded::new(AtomicU32::new(0)))
                .collect(),
            counters,
        }
    }

    fn check_in(&self, me: usize) -> bool {
        let sequence = self.sequence[me].fetch_add(1, Ordering::Relaxed);
        let parity = (sequence & 1) as usize;
        let node = &self.nodes[me];
        if node.children > 0 {
            self.counters[1 - parity][me].reset();
            self.counters[parity][me].wait();
        }
        if me != 0 {
            self.counters[parity][node.parent].check_in(node.position);
        }
        me == 0
    }

    // The check-in waits for everything it needs; the root has seen the whole
    // tree by the time its call returns.
    fn wait(&self) {}
    fn reset(&self) {}
}

/// Tree depth bound; with fan-in 2 this covers 256 threads.
const MAX_TREE_ROUNDS: usize = 8;

/// A single-elimination tournament: each thread's path of courts is
/// precomputed, `try_check_in` decides who advances at each court, and the
/// winner of court zero is the root. Losers return at their round, so most
/// threads do a single atomic operation.
pub struct DynamicTreeCheckIn<const F: usize> {
    num_threads: usize,
    num_slots: usize,
    paths: Vec<CachePadded<ThreadPath>>,
    sequence: Vec<CachePadded<AtomicU32>>,
    counters: [Vec<AtomicCounter>; 2],
}

struct ThreadPath {
    positions: [usize; MAX_TREE_ROUNDS],
    rounds: usize,
}

fn power(base: usize, n: usize) -> usize {
    let mut value = 1;
    for _ in 0..n {
        value *= base;
    }
    value
}

fn ceiling_log(base: usize, value: usize) -> usize {
    if value == 1 {
        return 0;
    }
    let mut i = 1;
    let mut p = base;
    while p < value {
        i += 1;
        p *= base;
    }
    i
}

impl<const F: usize> DynamicTreeCheckIn<F> {
    fn path_for(thread: usize, depth: usize, bases: &[usize], num_threads: usize) -> ThreadPath {
        let mut positions = [0usize; MAX_TREE_ROUNDS];
        let mut round = 0;
        let mut t = thread;
        for d in (2..=depth).rev() {
            let slots = power(F, d - 1);
            // A first-round bye: no competitor shares the court.
            if d == depth && t < slots && t + slots >= num_threads {
                continue;
            }
            let my_position = t % slots;
            positions[round] = bases[d - 1] + my_position;
            round += 1;
            t = my_position;
        }
        // Everyone can end up playing the final on court zero.
        positions[round] = 0;
        ThreadPath {
            positions,
            rounds: round + 1,
        }
    }
}

impl<const F: usize> CheckInCounter for DynamicTreeCheckIn<F> {
    fn new(count: usize) -> Self {
        if count == 1 {
            return DynamicTreeCheckIn {
                num_threads: 1,
                num_slots: 0,
                paths: Vec::new(),
                sequence: Vec::new(),
                counters: [Vec::new(), Vec::new()],
            };
        }

        let depth = ceiling_log(F, count);
        if depth > MAX_TREE_ROUNDS {
            fatal(
                RuntimeError::TooManyThreads,
                format_args!(
                    "dynamic tree barrier of fan-in {F} supports at most {} threads, asked for {count}",
                    power(F, MAX_TREE_ROUNDS)
                ),
            );
        }

        let mut bases = [0usize; MAX_TREE_ROUNDS];
        let mut p = 1;
        for d in 1..depth {
            bases[d] = bases[d - 1] + p;
            p *= F;
        }
        let first_round_base = bases[depth - 1];
        let num_slots = first_round_base + count.min(power(F, depth - 1));

        let paths: Vec<CachePadded<ThreadPath>> = (0..count)
            .map(|t| CachePadded::new(Self::path_for(t, depth, &bases, count)))
            .collect();

        // Above the leaves the tree is dense: every court waits for F − 1
        // losers, and the last arrival advances. Leaf courts may be emptier.
        let mut targets = vec![F - 1; num_slots];
        let mut leaf_counts = vec![0usize; num_slots - first_round_base];
        for path in &paths {
            let first = path.positions[0];
            if first >= first_round_base {
                leaf_counts[first - first_round_base] += 1;
            }
        }
        for (i, &occupants) in leaf_counts.iter().enumerate() {
            if occupants == 0 {
                break;
            }
            targets[first_round_base + i] = occupants - 1;
        }

        DynamicTreeCheckIn {
            num_threads: count,
            num_slots,
            paths,
            sequence: (0..count)
                .map(|_| CachePadded::new(AtomicU32::new(0)))
                .collect(),
            counters: [
                targets.iter().map(|&t| AtomicCounter::new(t)).collect(),
                targets.iter().map(|&t| AtomicCounter::new(t)).collect(),
            ],
        }
    }

    fn check_in(&self, me: usize) -> bool {
        if self.num_threads == 1 {
            return true;
        }
        let sequence = self.sequence[me].fetch_add(1, Ordering::Relaxed);
        let parity = (sequence & 1) as usize;
        // No geometric relationship; each thread just resets one counter of
        // the other parity to spread the work.
        if me < self.num_slots {
            self.counters[1 - parity][me].reset();
        }
        let path = &self.paths[me];
        for round in 0..path.rounds {
            let position = path.positions[round];
            if !self.counters[parity][position].try_check_in() {
                return false;
            }
            // Winning the final on court zero makes us the root.
            if position == 0 {
                return true;
            }
        }
        fatal(
            RuntimeError::Assertion,
            format_args!("dynamic tree check-in ran off the end of thread {me}'s path"),
        )
    }

    fn wait(&self) {}
    fn reset(&self) {}
}

// -----------------------------------------------------------------------------
// Broadcasts

/// How a centralized barrier releases its waiters and hands them the payload.
pub trait Broadcast: Send + Sync + 'static {
    fn new(count: usize) -> Self
    where
        Self: Sized;
    fn wake_up(&self, me: usize, info: *const InvocationInfo);
    fn wait(&self, me: usize) -> *const InvocationInfo;
}

struct FlagLine {
    flag: AtomicU32,
    payload: AtomicPtr<InvocationInfo>,
}

impl FlagLine {
    fn new(flag: u32) -> FlagLine {
        FlagLine {
            flag: AtomicU32::new(flag),
            payload: AtomicPtr::new(core::ptr::null_mut()),
        }
    }
}

/// One shared flag line that every waiter polls. The payload rides in the
/// same line, so waiters pull both with one cache miss. Alternating flag
/// values mean no reset between barriers.
pub struct NaiveBroadcast {
    line: CachePadded<FlagLine>,
    next_values: Vec<CachePadded<AtomicU32>>,
}

impl Broadcast for NaiveBroadcast {
    fn new(count: usize) -> NaiveBroadcast {
        NaiveBroadcast {
            // Start the flag at a value nobody looks for.
            line: CachePadded::new(FlagLine::new(!0)),
            next_values: (0..count)
                .map(|_| CachePadded::new(AtomicU32::new(0)))
                .collect(),
        }
    }

    fn wake_up(&self, me: usize, info: *const InvocationInfo) {
        let next = self.next_values[me].load(Ordering::Relaxed);
        self.line.payload.store(info.cast_mut(), Ordering::Relaxed);
        // Publish: the payload store above must be visible first.
        self.line.flag.store(next, Ordering::Release);
        self.next_values[me].store(!next, Ordering::Relaxed);
    }

    fn wait(&self, me: usize) -> *const InvocationInfo {
        let expected = self.next_values[me].load(Ordering::Relaxed);
        while self.line.flag.load(Ordering::Acquire) != expected {
            core::hint::spin_loop();
        }
        // Flip the value this thread looks for next time.
        self.next_values[me].store(!expected, Ordering::Relaxed);
        self.line.payload.load(Ordering::Relaxed)
    }
}

/// A limited-broadcast-width release: `K` threads share each flag line, so
/// the root performs ⌈N/K⌉ stores and each waiter shares its polled line with
/// `K − 1` neighbours. With `K = 1` each thread owns its line outright and
/// resets its own flag, so the sense never alternates.
pub struct LbwBroadcast<const K: usize> {
    lines: Vec<CachePadded<FlagLine>>,
    next_values: Vec<CachePadded<AtomicU32>>,
}

impl<const K: usize> Broadcast for LbwBroadcast<K> {
    fn new(count: usize) -> LbwBroadcast<K> {
        LbwBroadcast {
            lines: (0..count.div_ceil(K))
                .map(|_| CachePadded::new(FlagLine::new(0)))
                .collect(),
            next_values: if K == 1 {
                Vec::new()
            } else {
                (0..count)
                    .map(|_| CachePadded::new(AtomicU32::new(!0)))
                    .collect()
            },
        }
    }

    fn wake_up(&self, me: usize, info: *const InvocationInfo) {
        let next_value = if K == 1 {
            !0
        } else {
            // All threads flip in lockstep, so any slot shows the phase.
            self.next_values[0].load(Ordering::Relaxed)
        };
        if !info.is_null() {
            for line in &self.lines {
                // Payload travels in the flag's line so it gets pulled with it.
                line.payload.store(info.cast_mut(), Ordering::Relaxed);
                line.flag.store(next_value, Ordering::Release);
            }
        } else {
            // One store fence, then relaxed stores so they can all be in
            // flight together.
            fence(Ordering::Release);
            for line in &self.lines {
                line.flag.store(next_value, Ordering::Relaxed);
            }
        }
        if K != 1 {
            self.next_values[me].store(!next_value, Ordering::Relaxed);
        }
    }

    fn wait(&self, me: usize) -> *const InvocationInfo {
        let expected = if K == 1 {
            !0
        } else {
            self.next_values[me].load(Ordering::Relaxed)
        };
        let line = &self.lines[me / K];
        while line.flag.load(Ordering::Acquire) != expected {
            core::hint::spin_loop();
        }
        if K == 1 {
            line.flag.store(0, Ordering::Relaxed);
        } else {
            self.next_values[me].store(!expected, Ordering::Relaxed);
        }
        line.payload.load(Ordering::Relaxed)
    }
}

// -----------------------------------------------------------------------------
// The centralized composition

/// A centralized barrier assembled from a check-in counter and a broadcast.
/// This produces the whole counter × broadcast matrix without any barrier
/// having to know how the other half works.
pub struct CentralizedBarrier<C: CheckInCounter, B: Broadcast> {
    checked_in: C,
    broadcast: B,
    name: &'static str,
}

impl<C: CheckInCounter, B: Broadcast> CentralizedBarrier<C, B> {
    pub fn new(num_threads: usize, name: &'static str) -> Self {
        CentralizedBarrier {
            checked_in: C::new(num_threads),
            broadcast: B::new(num_threads),
            name,
        }
    }
}

impl<C: CheckInCounter, B: Broadcast> BarrierImpl for CentralizedBarrier<C, B> {
    fn check_in(&self, me: usize) -> bool {
        if self.checked_in.check_in(me) {
            // Root: wait for everyone, then reset. The reset is safe because
            // the others are blocked in check-out, which releases through a
            // different path.
            self.checked_in.wait();
            self.checked_in.reset();
            true
        } else {
            false
        }
    }

    fn wake_up(&self, me: usize, info: *const InvocationInfo) {
        self.broadcast.wake_up(me, info);
    }

    fn check_out(&self, root: bool, me: usize) -> *const InvocationInfo {
        if root {
            self.wake_up(me, core::ptr::null());
            core::ptr::null()
        } else {
            self.broadcast.wait(me)
        }
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

// -----------------------------------------------------------------------------
// The dissemination barrier

/// log₂N rounds of pairwise signalling with no root: in round r, thread `me`
/// signals `(me + 2^r) mod N` and waits for its own round-r partner.
/// Parity and sense derived from a per-thread entry count remove any reset.
pub struct DisseminationBarrier {
    num_rounds: usize,
    flags: Vec<CachePadded<RoundFlags>>,
    state: Vec<CachePadded<ThreadState>>,
}

struct RoundFlags {
    flags: [[AtomicBool; MAX_TREE_ROUNDS]; 2],
}

struct ThreadState {
    entry_count: AtomicU32,
    neighbours: [usize; MAX_TREE_ROUNDS],
}

impl DisseminationBarrier {
    pub fn new(num_threads: usize) -> DisseminationBarrier {
        let num_rounds = ceiling_log(2, num_threads);
        if num_rounds > MAX_TREE_ROUNDS {
            fatal(
                RuntimeError::TooManyThreads,
                format_args!(
                    "dissemination barrier supports at most {} threads, asked for {num_threads}",
                    1usize << MAX_TREE_ROUNDS
                ),
            );
        }
        let flags = (0..num_threads)
            .map(|_| {
                CachePadded::new(RoundFlags {
                    flags: [
                        core::array::from_fn(|_| AtomicBool::new(false)),
                        core::array::from_fn(|_| AtomicBool::new(false)),
                    ],
                })
            })
            .collect();
        let state = (0..num_threads)
            .map(|me| {
                let mut neighbours = [0usize; MAX_TREE_ROUNDS];
                for (round, neighbour) in neighbours.iter_mut().enumerate().take(num_rounds) {
                    *neighbour = (me + (1 << round)) % num_threads;
                }
                CachePadded::new(ThreadState {
                    entry_count: AtomicU32::new(0),
                    neighbours,
                })
            })
            .collect();
        DisseminationBarrier {
            num_rounds,
            flags,
            state,
        }
    }
}

impl BarrierImpl for DisseminationBarrier {
    fn full_barrier(&self, me: usize) {
        let state = &self.state[me];
        let entry = state.entry_count.fetch_add(1, Ordering::Relaxed);
        let parity = (entry & 1) as usize;
        let sense = entry & 2 == 0;
        for round in 0..self.num_rounds {
            let neighbour = state.neighbours[round];
            // Tell our round partner we are here, then wait for whoever
            // should be telling us.
            self.flags[neighbour].flags[parity][round].store(sense, Ordering::Release);
            while self.flags[me].flags[parity][round].load(Ordering::Acquire) != sense {
                core::hint::spin_loop();
            }
        }
    }

    fn is_distributed(&self) -> bool {
        true
    }

    fn check_in(&self, _me: usize) -> bool {
        fatal(
            RuntimeError::MisuseOfDistributedBarrier,
            format_args!("check_in called on the single-phase {} barrier", self.name()),
        )
    }

    fn wake_up(&self, _me: usize, _info: *const InvocationInfo) {
        fatal(
            RuntimeError::MisuseOfDistributedBarrier,
            format_args!("wake_up called on the single-phase {} barrier", self.name()),
        )
    }

    fn check_out(&self, _root: bool, _me: usize) -> *const InvocationInfo {
        fatal(
            RuntimeError::MisuseOfDistributedBarrier,
            format_args!("check_out called on the single-phase {} barrier", self.name()),
        )
    }

    fn name(&self) -> &'static str {
        "Dissemination"
    }
}

// -----------------------------------------------------------------------------
// The registry

/// A named barrier and how to build it.
pub struct BarrierDescription {
    pub name: &'static str,
    pub full_name: &'static str,
    factory: fn(usize) -> Box<dyn BarrierImpl>,
}

impl BarrierDescription {
    pub fn instantiate(&self, num_threads: usize) -> Box<dyn BarrierImpl> {
        (self.factory)(num_threads)
    }
}

macro_rules! centralized_entry {
    ($name:literal, $full:literal, $counter:ty, $broadcast:ty) => {
        BarrierDescription {
            name: $name,
            full_name: $full,
            factory: |n| Box::new(CentralizedBarrier::<$counter, $broadcast>::new(n, $name)),
        }
    };
}

#[rustfmt::skip]
static AVAILABLE_BARRIERS: &[BarrierDescription] = &[
    centralized_entry!("AtomicNaive", "Atomic counter; Naive broadcast", AtomicCounter, NaiveBroadcast),
    centralized_entry!("FlagNaive", "Flag counter; Naive broadcast", FlagCounter, NaiveBroadcast),
    centralized_entry!("AtomicLBW1", "Atomic counter; LBW 1 broadcast", AtomicCounter, LbwBroadcast<1>),
    centralized_entry!("AtomicLBW2", "Atomic counter; LBW 2 broadcast", AtomicCounter, LbwBroadcast<2>),
    centralized_entry!("AtomicLBW4", "Atomic counter; LBW 4 broadcast", AtomicCounter, LbwBroadcast<4>),
    centralized_entry!("AtomicLBW8", "Atomic counter; LBW 8 broadcast", AtomicCounter, LbwBroadcast<8>),
    centralized_entry!("FlagLBW1", "Flag counter; LBW 1 broadcast", FlagCounter, LbwBroadcast<1>),
    centralized_entry!("FlagLBW2", "Flag counter; LBW 2 broadcast", FlagCounter, LbwBroadcast<2>),
    centralized_entry!("FlagLBW4", "Flag counter; LBW 4 broadcast", FlagCounter, LbwBroadcast<4>),
    centralized_entry!("FlagLBW8", "Flag counter; LBW 8 broadcast", FlagCounter, LbwBroadcast<8>),
    centralized_entry!("FT2AtomicNaive", "FixedTree(2) Atomic; Naive broadcast", FixedTreeCheckIn<AtomicCounter, 2>, NaiveBroadcast),
    centralized_entry!("FT4AtomicNaive", "FixedTree(4) Atomic; Naive broadcast", FixedTreeCheckIn<AtomicCounter, 4>, NaiveBroadcast),
    centralized_entry!("FT8AtomicNaive", "FixedTree(8) Atomic; Naive broadcast", FixedTreeCheckIn<AtomicCounter, 8>, NaiveBroadcast),
    centralized_entry!("FT16AtomicNaive", "FixedTree(16) Atomic; Naive broadcast", FixedTreeCheckIn<AtomicCounter, 16>, NaiveBroadcast),
    centralized_entry!("FT2FlagNaive", "FixedTree(2) Flag; Naive broadcast", FixedTreeCheckIn<FlagCounter, 2>, NaiveBroadcast),
    centralized_entry!("FT4FlagNaive", "FixedTree(4) Flag; Naive broadcast", FixedTreeCheckIn<FlagCounter, 4>, NaiveBroadcast),
    centralized_entry!("FT8FlagNaive", "FixedTree(8) Flag; Naive broadcast", FixedTreeCheckIn<FlagCounter, 8>, NaiveBroadcast),
    centralized_entry!("FT16FlagNaive", "FixedTree(16) Flag; Naive broadcast", FixedTreeCheckIn<FlagCounter, 16>, NaiveBroadcast),
    centralized_entry!("FT2AtomicLBW4", "FixedTree(2) Atomic; LBW 4 broadcast", FixedTreeCheckIn<AtomicCounter, 2>, LbwBroadcast<4>),
    centralized_entry!("FT4AtomicLBW4", "FixedTree(4) Atomic; LBW 4 broadcast", FixedTreeCheckIn<AtomicCounter, 4>, LbwBroadcast<4>),
    centralized_entry!("FT8AtomicLBW4", "FixedTree(8) Atomic; LBW 4 broadcast", FixedTreeCheckIn<AtomicCounter, 8>, LbwBroadcast<4>),
    centralized_entry!("FT16AtomicLBW4", "FixedTree(16) Atomic; LBW 4 broadcast", FixedTreeCheckIn<AtomicCounter, 16>, LbwBroadcast<4>),
    centralized_entry!("FT2FlagLBW4", "FixedTree(2) Flag; LBW 4 broadcast", FixedTreeCheckIn<FlagCounter, 2>, LbwBroadcast<4>),
    centralized_entry!("FT4FlagLBW4", "FixedTree(4) Flag; LBW 4 broadcast", FixedTreeCheckIn<FlagCounter, 4>, LbwBroadcast<4>),
    centralized_entry!("FT8FlagLBW4", "FixedTree(8) Flag; LBW 4 broadcast", FixedTreeCheckIn<FlagCounter, 8>, LbwBroadcast<4>),
    centralized_entry!("FT16FlagLBW4", "FixedTree(16) Flag; LBW 4 broadcast", FixedTreeCheckIn<FlagCounter, 16>, LbwBroadcast<4>),
    centralized_entry!("DT2Naive", "DynamicTree(2); Naive broadcast", DynamicTreeCheckIn<2>, NaiveBroadcast),
    centralized_entry!("DT4Naive", "DynamicTree(4); Naive broadcast", DynamicTreeCheckIn<4>, NaiveBroadcast),
    centralized_entry!("DT8Naive", "DynamicTree(8); Naive broadcast", DynamicTreeCheckIn<8>, NaiveBroadcast),
    centralized_entry!("DT16Naive", "DynamicTree(16); Naive broadcast", DynamicTreeCheckIn<16>, NaiveBroadcast),
    centralized_entry!("DT2LBW4", "DynamicTree(2); LBW 4 broadcast", DynamicTreeCheckIn<2>, LbwBroadcast<4>),
    centralized_entry!("DT4LBW4", "DynamicTree(4); LBW 4 broadcast", DynamicTreeCheckIn<4>, LbwBroadcast<4>),
    centralized_entry!("DT8LBW4", "DynamicTree(8); LBW 4 broadcast", DynamicTreeCheckIn<8>, LbwBroadcast<4>),
    centralized_entry!("DT16LBW4", "DynamicTree(16); LBW 4 broadcast", DynamicTreeCheckIn<16>, LbwBroadcast<4>),
    BarrierDescription {
        name: "Dissemination",
        full_name: "Dissemination",
        factory: |n| Box::new(DisseminationBarrier::new(n)),
    },
];

/// Fixed tree of fan-in 16 with flag counters and an LBW-4 broadcast; a
/// reasonable default across machine scales.
const DEFAULT_BARRIER: &str = "FT16FlagLBW4";

pub fn find_barrier(name: &str) -> Option<&'static BarrierDescription> {
    AVAILABLE_BARRIERS.iter().find(|b| b.name == name)
}

pub fn all_barriers() -> &'static [BarrierDescription] {
    AVAILABLE_BARRIERS
}

fn print_barriers() {
    eprintln!("lomp: available barriers are:");
    for chunk in AVAILABLE_BARRIERS.chunks(8) {
        let names: Vec<&str> = chunk.iter().map(|b| b.name).collect();
        eprintln!("  {}", names.join(", "));
    }
}

/// Resolves `LOMP_BARRIER_KIND` once; later teams reuse the choice.
fn chosen_barrier() -> &'static BarrierDescription {
    static CHOICE: OnceLock<&'static BarrierDescription> = OnceLock::new();
    CHOICE.get_or_init(|| {
        let requested = env::get_str("LOMP_BARRIER_KIND");
        let name = requested.as_deref().unwrap_or(DEFAULT_BARRIER);
        let Some(description) = find_barrier(name) else {
            print_barriers();
            fatal(
                RuntimeError::UnknownBarrier,
                format_args!("cannot find barrier '{name}'"),
            );
        };
        if requested.is_some() {
            eprintln!(
                "lomp: using user selected barrier {} [{}]",
                description.name, description.full_name
            );
        }
        debug!(
            name = description.name,
            full_name = description.full_name,
            "barrier selected"
        );
        description
    })
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn atomic_counter_roots_and_resets() {
        let counter = AtomicCounter::new(3);
        assert!(counter.check_in(0));
        assert!(!counter.check_in(1));
        assert!(!counter.check_in(2));
        counter.wait(); // All three are in; must not block.
        counter.reset();
        assert_eq!(counter.present.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn atomic_counter_tournament() {
        // Target 2: the first two arrivals lose, the third advances.
        let counter = AtomicCounter::new(2);
        assert!(!counter.try_check_in());
        assert!(!counter.try_check_in());
        assert!(counter.try_check_in());
        // Advancing does not consume the count; later stragglers would also
        // see it, but parity-ganged resets prevent that in real use.
        assert!(counter.try_check_in());
    }

    #[test]
    fn flag_counter_fills_exactly() {
        for count in [1, 3, 8, 9, 17, 64] {
            let counter = FlagCounter::new(count);
            for me in 0..count {
                assert_eq!(counter.check_in(me), me == 0);
            }
            counter.wait(); // Must not block once everyone is in.
            counter.reset();
            if count > 1 {
                // After reset the words are clear again apart from the mask.
                assert_ne!(
                    counter.words[0].load(Ordering::Relaxed),
                    u64::MAX,
                    "count {count}"
                );
            }
        }
    }

    #[test]
    fn fixed_tree_shapes() {
        let tree = FixedTreeCheckIn::<AtomicCounter, 2>::new(5);
        // Thread 0's children are 1 and 2; thread 1's are 3 and 4.
        assert_eq!(tree.nodes[0].children, 2);
        assert_eq!(tree.nodes[1].children, 2);
        assert_eq!(tree.nodes[2].children, 0);
        assert_eq!(tree.nodes[3].parent, 1);
        assert_eq!(tree.nodes[4].parent, 1);
    }

    #[test]
    fn registry_has_default_and_rejects_unknown() {
        assert!(find_barrier(DEFAULT_BARRIER).is_some());
        assert!(find_barrier("NoSuchBarrier").is_none());
    }

    fn run_full_barriers(description: &BarrierDescription, threads: usize, repeats: usize) {
        let barrier = description.instantiate(threads);
        let barrier = &*barrier;
        // Each thread writes its slot then checks that, after the barrier,
        // every slot shows the round just completed.
        let slots: Vec<CachePadded<AtomicU32>> = (0..threads)
            .map(|_| CachePadded::new(AtomicU32::new(0)))
            .collect();
        let slots = &slots;
        thread::scope(|scope| {
            for me in 0..threads {
                scope.spawn(move || {
                    for round in 1..=repeats {
                        slots[me].store(round as u32, Ordering::Release);
                        barrier.full_barrier(me);
                        for slot in slots {
                            assert!(slot.load(Ordering::Acquire) >= round as u32);
                        }
                        barrier.full_barrier(me);
                    }
                });
            }
        });
    }

    #[test]
    fn full_barrier_synchronizes_across_kinds() {
        // The full sweep lives in the integration suite; cover one of each
        // family here.
        for name in ["AtomicNaive", "FlagLBW1", "FT2FlagLBW4", "DT2Naive", "Dissemination"] {
            let description = find_barrier(name).unwrap();
            for threads in [1, 2, 3, 4] {
                run_full_barriers(description, threads, 20);
            }
        }
    }
}
