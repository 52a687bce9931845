//! Locks and critical sections.
//!
//! Every user-visible lock is a process-wide heap object behind an opaque
//! handle. The implementation used for critical sections (and for the lock
//! API) is chosen once by name from `LOMP_LOCK_KIND`; the standard choice is
//! an ordinary process mutex.
//!
//! Critical-section locks are created lazily: the first thread through a
//! critical construct allocates the lock under one global mutex, with a
//! double-checked fast path for everyone after.

use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};

use crossbeam_utils::CachePadded;
use tracing::debug;

use crate::env;
use crate::errors::{fatal, RuntimeError};
use crate::util::RandomExponentialBackoff;

// -----------------------------------------------------------------------------
// Lock implementations

/// The interface every lock implementation provides. This matches the
/// standard lockable shape, so implementations compose with guard-style
/// wrappers if callers want them.
trait LockImpl: Send + Sync {
    fn lock(&self);
    fn unlock(&self);
    fn try_lock(&self) -> bool;
    fn name(&self) -> &'static str;
}

/// The standard lock: a process mutex with explicit lock/unlock pairing
/// (the guard-free shape the lock API needs), built from a mutex-protected
/// flag and a condvar. Waiters block in the kernel, the only place in the
/// runtime that does.
struct MutexLock {
    locked: Mutex<bool>,
    available: Condvar,
}

impl MutexLock {
    fn new() -> MutexLock {
        MutexLock {
            locked: Mutex::new(false),
            available: Condvar::new(),
        }
    }
}

impl LockImpl for MutexLock {
    fn lock(&self) {
        let mut locked = self.locked.lock().unwrap();
        while *locked {
            locked = self.available.wait(locked).unwrap();
        }
        *locked = true;
    }

    fn unlock(&self) {
        *self.locked.lock().unwrap() = false;
        self.available.notify_one();
    }

    fn try_lock(&self) -> bool {
        let mut locked = self.locked.lock().unwrap();
        if *locked {
            false
        } else {
            *locked = true;
            true
        }
    }

    fn name(&self) -> &'static str {
        "mutex"
    }
}

/// A test-and-test-and-set spin lock with randomized exponential backoff.
/// Reads the line shared before attempting the exchange, so a held lock is
/// polled without write traffic; the backoff spreads out the retries when
/// the lock is contended.
struct TtasLock {
    locked: CachePadded<AtomicBool>,
}

impl TtasLock {
    fn new() -> TtasLock {
        TtasLock {
            locked: CachePadded::new(AtomicBool::new(false)),
        }
    }
}

impl LockImpl for TtasLock {
    fn lock(&self) {
        loop {
            if self.try_lock() {
                return;
            }
            let mut backoff = RandomExponentialBackoff::new();
            while self.locked.load(Ordering::Relaxed) {
                backoff.sleep();
            }
        }
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn name(&self) -> &'static str {
        "ttas"
    }
}

// -----------------------------------------------------------------------------
// The lock registry

/// The heap object every handle and critical section points at. Concrete so
/// it can sit behind a thin `AtomicPtr`.
pub struct LockObject {
    imp: Box<dyn LockImpl>,
}

impl LockObject {
    pub(crate) fn lock(&self) {
        self.imp.lock();
    }

    pub(crate) fn unlock(&self) {
        self.imp.unlock();
    }

    pub(crate) fn try_lock(&self) -> bool {
        self.imp.try_lock()
    }
}

struct LockDescription {
    name: &'static str,
    factory: fn() -> Box<dyn LockImpl>,
}

static AVAILABLE_LOCKS: &[LockDescription] = &[
    LockDescription {
        name: "mutex",
        factory: || Box::new(MutexLock::new()),
    },
    LockDescription {
        name: "ttas",
        factory: || Box::new(TtasLock::new()),
    },
];

const DEFAULT_LOCK: &str = "mutex";

fn chosen_lock() -> &'static LockDescription {
    static CHOICE: OnceLock<&'static LockDescription> = OnceLock::new();
    CHOICE.get_or_init(|| {
        let requested = env::get_str("LOMP_LOCK_KIND");
        let name = requested.as_deref().unwrap_or(DEFAULT_LOCK);
        let Some(description) = AVAILABLE_LOCKS.iter().find(|l| l.name == name) else {
            let names: Vec<&str> = AVAILABLE_LOCKS.iter().map(|l| l.name).collect();
            eprintln!("lomp: available locks are: {}", names.join(", "));
            fatal(
                RuntimeError::UnknownLock,
                format_args!("cannot find lock '{name}'"),
            );
        };
        debug!(name = description.name, "lock kind selected");
        description
    })
}

/// Resolves `LOMP_LOCK_KIND` during runtime initialization so a bad value
/// fails at startup, not at first use.
pub(crate) fn initialize_locks() {
    let _ = chosen_lock();
}

fn new_lock_object() -> *mut LockObject {
    Box::into_raw(Box::new(LockObject {
        imp: (chosen_lock().factory)(),
    }))
}

// -----------------------------------------------------------------------------
// The lock API

/// An opaque handle to a heap-allocated lock, the shape the lock operations
/// traffic in. A handle starts unset; `init_lock` fills it.
#[repr(transparent)]
pub struct LockHandle(AtomicPtr<LockObject>);

// Handles are shared across the team by design; the object behind them
// synchronizes internally.
unsafe impl Send for LockHandle {}
unsafe impl Sync for LockHandle {}

impl LockHandle {
    pub const fn new() -> LockHandle {
        LockHandle(AtomicPtr::new(core::ptr::null_mut()))
    }

    fn object(&self) -> &LockObject {
        let ptr = self.0.load(Ordering::Acquire);
        if ptr.is_null() {
            fatal(
                RuntimeError::Assertion,
                format_args!("operation on an uninitialized lock"),
            );
        }
        unsafe { &*ptr }
    }
}

impl Default for LockHandle {
    fn default() -> LockHandle {
        LockHandle::new()
    }
}

pub fn init_lock(lock: &LockHandle) {
    let object = new_lock_object();
    let previous = lock.0.swap(object, Ordering::AcqRel);
    if !previous.is_null() {
        // Re-initialization leaks nothing: put the old object back together.
        drop(unsafe { Box::from_raw(previous) });
    }
}

/// The hint is deliberately ignored; hinted locks map to the standard
/// implementation.
pub fn init_lock_with_hint(lock: &LockHandle, _hint: u32) {
    init_lock(lock);
}

pub fn destroy_lock(lock: &LockHandle) {
    let object = lock.0.swap(core::ptr::null_mut(), Ordering::AcqRel);
    if !object.is_null() {
        drop(unsafe { Box::from_raw(object) });
    }
}

pub fn set_lock(lock: &LockHandle) {
    lock.object().lock();
}

pub fn unset_lock(lock: &LockHandle) {
    lock.object().unlock();
}

pub fn test_lock(lock: &LockHandle) -> bool {
    lock.object().try_lock()
}

// -----------------------------------------------------------------------------
// Critical sections

/// The lock cell behind one critical construct. The compiler materializes
/// one per construct; the runtime fills it lazily on first entry.
pub struct CriticalSection {
    lock: AtomicPtr<LockObject>,
}

impl CriticalSection {
    pub const fn new() -> CriticalSection {
        CriticalSection {
            lock: AtomicPtr::new(core::ptr::null_mut()),
        }
    }
}

impl Default for CriticalSection {
    fn default() -> CriticalSection {
        CriticalSection::new()
    }
}

/// Serializes only the one-time creation of each critical lock.
static CRITICAL_INIT: Mutex<()> = Mutex::new(());

pub(crate) fn enter_critical(section: &CriticalSection) {
    let mut object = section.lock.load(Ordering::Acquire);
    if object.is_null() {
        let _guard = CRITICAL_INIT.lock().unwrap();
        // Double-checked: someone may have beaten us to the allocation.
        object = section.lock.load(Ordering::Acquire);
        if object.is_null() {
            object = new_lock_object();
            section.lock.store(object, Ordering::Release);
        }
    }
    unsafe { &*object }.lock();
}

pub(crate) fn exit_critical(section: &CriticalSection) {
    let object = section.lock.load(Ordering::Acquire);
    if object.is_null() {
        fatal(
            RuntimeError::Assertion,
            format_args!("leaving a critical section that was never entered"),
        );
    }
    unsafe { &*object }.unlock();
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    #[test]
    fn mutex_lock_cycles_cleanly() {
        let lock = MutexLock::new();
        for _ in 0..100 {
            lock.lock();
            lock.unlock();
        }
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn ttas_lock_excludes() {
        let lock = TtasLock::new();
        lock.lock();
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn handle_init_destroy_is_externally_idempotent() {
        let handle = LockHandle::new();
        init_lock(&handle);
        set_lock(&handle);
        unset_lock(&handle);
        destroy_lock(&handle);
        // A second init/destroy cycle behaves identically.
        init_lock(&handle);
        assert!(test_lock(&handle));
        unset_lock(&handle);
        destroy_lock(&handle);
    }

    #[test]
    fn lock_excludes_across_threads() {
        let handle = LockHandle::new();
        init_lock(&handle);
        let handle = &handle;
        let in_section = AtomicU32::new(0);
        let violations = AtomicU32::new(0);
        let in_section = &in_section;
        let violations = &violations;
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(move || {
                    for _ in 0..100 {
                        set_lock(handle);
                        if in_section.fetch_add(1, Ordering::SeqCst) != 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        in_section.fetch_sub(1, Ordering::SeqCst);
                        unset_lock(handle);
                    }
                });
            }
        });
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        destroy_lock(&handle);
    }

    #[test]
    fn critical_section_initializes_once() {
        let section = CriticalSection::new();
        let section = &section;
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(move || {
                    for _ in 0..50 {
                        enter_critical(section);
                        exit_critical(section);
                    }
                });
            }
        });
        assert!(!section.lock.load(Ordering::Acquire).is_null());
    }
}
