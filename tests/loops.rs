//! Dynamic loop scheduling, end to end: every schedule must dispatch the
//! iteration space exactly once, whatever the interleaving.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};

use common::on_runtime_thread;
use lomp::{Monotonicity, RequestKind, SchedKind, ScheduleRequest};

const SPACE: usize = 1200;
static CLAIMS: [AtomicU32; SPACE] = [const { AtomicU32::new(0) }; SPACE];

fn reset_claims() {
    for claim in &CLAIMS {
        claim.store(0, Ordering::Relaxed);
    }
}

fn assert_claims_complete(count: usize, label: &str) {
    for (i, claim) in CLAIMS.iter().enumerate().take(count) {
        assert_eq!(claim.load(Ordering::Relaxed), 1, "{label}: iteration {i}");
    }
}

/// The request each region body should dispatch with, parked in a static so
/// the extern "C" bodies can read it.
static REQUEST_KIND: AtomicU32 = AtomicU32::new(0);
static REQUEST_MODIFIER: AtomicU32 = AtomicU32::new(0);
static REQUEST_CHUNK: AtomicU32 = AtomicU32::new(1);

fn set_request(kind: RequestKind, modifier: Monotonicity, chunk: u32) {
    REQUEST_KIND.store(
        match kind {
            RequestKind::Static => 0,
            RequestKind::StaticChunked => 1,
            RequestKind::Guided => 2,
            RequestKind::Dynamic => 3,
            RequestKind::Auto => 4,
            RequestKind::Runtime => 5,
            RequestKind::Imbalanced => 6,
        },
        Ordering::Relaxed,
    );
    REQUEST_MODIFIER.store(
        match modifier {
            Monotonicity::Unspecified => 0,
            Monotonicity::Monotonic => 1,
            Monotonicity::Nonmonotonic => 2,
        },
        Ordering::Relaxed,
    );
    REQUEST_CHUNK.store(chunk, Ordering::Relaxed);
}

fn current_request() -> (ScheduleRequest, u32) {
    let kind = match REQUEST_KIND.load(Ordering::Relaxed) {
        0 => RequestKind::Static,
        1 => RequestKind::StaticChunked,
        2 => RequestKind::Guided,
        3 => RequestKind::Dynamic,
        4 => RequestKind::Auto,
        5 => RequestKind::Runtime,
        _ => RequestKind::Imbalanced,
    };
    let modifier = match REQUEST_MODIFIER.load(Ordering::Relaxed) {
        1 => Monotonicity::Monotonic,
        2 => Monotonicity::Nonmonotonic,
        _ => Monotonicity::Unspecified,
    };
    (
        ScheduleRequest::with_modifier(kind, modifier),
        REQUEST_CHUNK.load(Ordering::Relaxed),
    )
}

unsafe extern "C" fn dispatch_space_body(_arg: *mut ()) {
    let (request, chunk) = current_request();
    lomp::dispatch_init::<u32>(request, 0, SPACE as u32 - 1, 1, chunk);
    let (mut last, mut lb, mut ub, mut st) = (0, 0u32, 0u32, 0u32);
    while lomp::dispatch_next::<u32>(&mut last, &mut lb, &mut ub, &mut st) {
        let mut i = lb;
        while i <= ub {
            CLAIMS[i as usize].fetch_add(1, Ordering::Relaxed);
            i += 1;
        }
    }
}

fn run_dispatch_space(kind: RequestKind, modifier: Monotonicity, chunk: u32, label: &str) {
    reset_claims();
    set_request(kind, modifier, chunk);
    lomp::fork_shared(dispatch_space_body, core::ptr::null_mut());
    assert_claims_complete(SPACE, label);
}

#[test]
fn every_dynamic_schedule_is_complete() {
    on_runtime_thread(|| {
        run_dispatch_space(RequestKind::Static, Monotonicity::Unspecified, 1, "static");
        run_dispatch_space(
            RequestKind::StaticChunked,
            Monotonicity::Unspecified,
            3,
            "static_chunked",
        );
        run_dispatch_space(RequestKind::Guided, Monotonicity::Unspecified, 1, "guided");
        run_dispatch_space(
            RequestKind::Dynamic,
            Monotonicity::Monotonic,
            2,
            "monotonic dynamic",
        );
        run_dispatch_space(
            RequestKind::Dynamic,
            Monotonicity::Nonmonotonic,
            1,
            "nonmonotonic dynamic",
        );
        run_dispatch_space(RequestKind::Auto, Monotonicity::Unspecified, 1, "auto");
        run_dispatch_space(
            RequestKind::Imbalanced,
            Monotonicity::Unspecified,
            1,
            "imbalanced",
        );
    });
}

#[test]
fn runtime_schedule_follows_the_icv() {
    on_runtime_thread(|| {
        for (kind, chunk) in [
            (SchedKind::Static, 0),
            (SchedKind::Static, 5),
            (SchedKind::Dynamic, 2),
            (SchedKind::Guided, 1),
            (SchedKind::Imbalanced, 1),
        ] {
            lomp::set_schedule(kind, chunk);
            run_dispatch_space(
                RequestKind::Runtime,
                Monotonicity::Unspecified,
                0,
                "runtime icv",
            );
        }
        lomp::set_schedule(SchedKind::Static, 0);
    });
}

// -----------------------------------------------------------------------------
// Several loop-variable widths through the same machinery

static WIDE_CLAIMS: [AtomicU32; 64] = [const { AtomicU32::new(0) }; 64];

unsafe extern "C" fn wide_var_body(_arg: *mut ()) {
    // A 64-bit loop variable with an offset base and stride 3:
    // for (i = 1_000_000_000_000; i <= 1_000_000_000_189; i += 3)
    let base = 1_000_000_000_000i64;
    lomp::dispatch_init::<i64>(
        ScheduleRequest::with_modifier(RequestKind::Dynamic, Monotonicity::Nonmonotonic),
        base,
        base + 189,
        3,
        1,
    );
    let (mut last, mut lb, mut ub, mut st) = (0, 0i64, 0i64, 0i64);
    while lomp::dispatch_next::<i64>(&mut last, &mut lb, &mut ub, &mut st) {
        let mut i = lb;
        while i <= ub {
            WIDE_CLAIMS[((i - base) / 3) as usize].fetch_add(1, Ordering::Relaxed);
            i += 3;
        }
    }
}

#[test]
fn wide_strided_loops_dispatch_exactly() {
    on_runtime_thread(|| {
        for claim in &WIDE_CLAIMS {
            claim.store(0, Ordering::Relaxed);
        }
        lomp::fork_shared(wide_var_body, core::ptr::null_mut());
        for (i, claim) in WIDE_CLAIMS.iter().enumerate() {
            assert_eq!(claim.load(Ordering::Relaxed), 1, "iteration {i}");
        }
    });
}

// -----------------------------------------------------------------------------
// Nowait-style loop overlap exercises the descriptor ring

static OVERLAP_CLAIMS_A: [AtomicU32; 200] = [const { AtomicU32::new(0) }; 200];
static OVERLAP_CLAIMS_B: [AtomicU32; 200] = [const { AtomicU32::new(0) }; 200];

unsafe extern "C" fn overlapping_loops_body(_arg: *mut ()) {
    // Two back-to-back dynamic loops with no barrier between them: fast
    // threads run ahead into the second while stragglers finish the first,
    // so two ring descriptors are live at once.
    for claims in [&OVERLAP_CLAIMS_A, &OVERLAP_CLAIMS_B] {
        lomp::dispatch_init::<u32>(
            ScheduleRequest::with_modifier(RequestKind::Dynamic, Monotonicity::Monotonic),
            0,
            199,
            1,
            1,
        );
        let (mut last, mut lb, mut ub, mut st) = (0, 0u32, 0u32, 0u32);
        while lomp::dispatch_next::<u32>(&mut last, &mut lb, &mut ub, &mut st) {
            let mut i = lb;
            while i <= ub {
                claims[i as usize].fetch_add(1, Ordering::Relaxed);
                i += 1;
            }
        }
    }
}

#[test]
fn nowait_loops_overlap_without_mixing() {
    on_runtime_thread(|| {
        for claims in [&OVERLAP_CLAIMS_A, &OVERLAP_CLAIMS_B] {
            for claim in claims.iter() {
                claim.store(0, Ordering::Relaxed);
            }
        }
        lomp::fork_shared(overlapping_loops_body, core::ptr::null_mut());
        for (label, claims) in [("first", &OVERLAP_CLAIMS_A), ("second", &OVERLAP_CLAIMS_B)] {
            for (i, claim) in claims.iter().enumerate() {
                assert_eq!(claim.load(Ordering::Relaxed), 1, "{label} loop, iteration {i}");
            }
        }
    });
}
