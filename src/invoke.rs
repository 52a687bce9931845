//! Delivery of compiler-outlined region bodies to the team.
//!
//! An [`InvocationInfo`] packages a body pointer and its argument list so the
//! barrier can hand one reference to every worker. Bodies come in two calling
//! conventions:
//!
//! - **register convention** — the body expects two id pointers (global and
//!   local thread number) followed by up to [`MAX_BODY_ARGS`] opaque pointer
//!   arguments, each passed as a real parameter;
//! - **single-pointer convention** — the body expects one opaque pointer.
//!
//! Calling a function through a pointer whose declared arity varies at
//! runtime cannot be expressed in safe Rust, so this module confines the hack:
//! the caller's argument count selects a concrete signature from a finite set
//! and the body pointer is transmuted to it. Real compilers cap outlined-body
//! arity well below our limit, and a body declared with fewer arguments than
//! we pass simply ignores the extras.
//!
//! An `InvocationInfo` is only valid while the fork that built it is still on
//! the caller's stack; the join barrier completes before the fork returns, so
//! workers never observe a dead one.

use core::ptr;

use crate::errors::{fatal, runtime_assert, RuntimeError};

// -----------------------------------------------------------------------------
// Body signatures

/// The largest number of user pointer arguments deliverable to a
/// register-convention body (the two id pointers come on top of these).
pub const MAX_BODY_ARGS: usize = 14;

/// A register-convention outlined body. The declared type carries only the
/// two fixed id parameters; the invoker transmutes to the full arity before
/// the call.
pub type RegisterBody = unsafe extern "C" fn(*mut i32, *mut i32);

/// A single-pointer-convention outlined body.
pub type SharedBody = unsafe extern "C" fn(*mut ());

// -----------------------------------------------------------------------------
// Invocation info

#[derive(Clone, Copy)]
enum Convention {
    /// Body plus a cursor into the caller's argument list.
    Register {
        body: RegisterBody,
        args: *const *mut (),
        argc: usize,
    },
    /// Body plus the single pointer it receives.
    SinglePointer { body: SharedBody, arg: *mut () },
}

/// A tagged descriptor over an outlined body, shared with every worker for
/// the duration of one fork.
pub struct InvocationInfo {
    convention: Convention,
}

// The raw pointers inside refer to the forking caller's stack, which outlives
// every reader (the join barrier completes before fork returns).
unsafe impl Send for InvocationInfo {}
unsafe impl Sync for InvocationInfo {}

impl InvocationInfo {
    /// Packages a register-convention body with its argument list.
    ///
    /// # Safety
    ///
    /// `args` must stay valid until the fork's join barrier has completed,
    /// and `body` must tolerate being called with `args.len()` pointer
    /// arguments after the two id pointers.
    pub unsafe fn for_outlined(body: RegisterBody, args: &[*mut ()]) -> InvocationInfo {
        runtime_assert!(
            args.len() <= MAX_BODY_ARGS,
            "outlined body takes {} arguments; the limit is {}",
            args.len(),
            MAX_BODY_ARGS
        );
        InvocationInfo {
            convention: Convention::Register {
                body,
                args: args.as_ptr(),
                argc: args.len(),
            },
        }
    }

    /// Packages a single-pointer-convention body.
    pub fn for_shared(body: SharedBody, arg: *mut ()) -> InvocationInfo {
        InvocationInfo {
            convention: Convention::SinglePointer { body, arg },
        }
    }

    /// Runs the body on the calling thread, passing the thread's id storage.
    ///
    /// # Safety
    ///
    /// The `InvocationInfo` must still be alive (see the module docs), and the
    /// id pointers must point at the calling thread's id fields.
    pub unsafe fn run(&self, gtid: *mut i32, ltid: *mut i32) {
        match self.convention {
            Convention::Register { body, args, argc } => {
                // Snapshot the argument list before the call; the descriptor
                // itself references the forking caller's storage.
                let mut a = [ptr::null_mut::<()>(); MAX_BODY_ARGS];
                for i in 0..argc {
                    a[i] = unsafe { *args.add(i) };
                }
                unsafe { call_register_body(body, gtid, ltid, &a, argc) };
            }
            Convention::SinglePointer { body, arg } => unsafe { body(arg) },
        }
    }
}

// -----------------------------------------------------------------------------
// The arity shim

/// Calls `body` as if it were declared with `2 + argc` pointer parameters.
///
/// # Safety
///
/// `body` must really be a function of `extern "C"` ABI accepting at least
/// `2 + n` pointer arguments, where `n` is the arity it was outlined with and
/// `n <= argc` holds. Extra trailing arguments are ignored by the callee.
unsafe fn call_register_body(
    body: RegisterBody,
    gtid: *mut i32,
    ltid: *mut i32,
    a: &[*mut (); MAX_BODY_ARGS],
    argc: usize,
) {
    use core::mem::transmute;

    type P = *mut ();
    type G = *mut i32;

    // One concrete signature per supported arity. The transmutes are sound
    // because `extern "C" fn` pointers of pointer-only parameters share a
    // representation; which one matches the callee is the caller's contract.
    unsafe {
        match argc {
            0 => body(gtid, ltid),
            1 => transmute::<RegisterBody, unsafe extern "C" fn(G, G, P)>(body)(gtid, ltid, a[0]),
            2 => transmute::<RegisterBody, unsafe extern "C" fn(G, G, P, P)>(body)(
                gtid, ltid, a[0], a[1],
            ),
            3 => transmute::<RegisterBody, unsafe extern "C" fn(G, G, P, P, P)>(body)(
                gtid, ltid, a[0], a[1], a[2],
            ),
            4 => transmute::<RegisterBody, unsafe extern "C" fn(G, G, P, P, P, P)>(body)(
                gtid, ltid, a[0], a[1], a[2], a[3],
            ),
            5 => transmute::<RegisterBody, unsafe extern "C" fn(G, G, P, P, P, P, P)>(body)(
                gtid, ltid, a[0], a[1], a[2], a[3], a[4],
            ),
            6 => transmute::<RegisterBody, unsafe extern "C" fn(G, G, P, P, P, P, P, P)>(body)(
                gtid, ltid, a[0], a[1], a[2], a[3], a[4], a[5],
            ),
            7 => transmute::<RegisterBody, unsafe extern "C" fn(G, G, P, P, P, P, P, P, P)>(body)(
                gtid, ltid, a[0], a[1], a[2], a[3], a[4], a[5], a[6],
            ),
            8 => transmute::<RegisterBody, unsafe extern "C" fn(G, G, P, P, P, P, P, P, P, P)>(
                body,
            )(gtid, ltid, a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7]),
            9 => transmute::<RegisterBody, unsafe extern "C" fn(G, G, P, P, P, P, P, P, P, P, P)>(
                body,
            )(
                gtid, ltid, a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7], a[8],
            ),
            10 => transmute::<
                RegisterBody,
                unsafe extern "C" fn(G, G, P, P, P, P, P, P, P, P, P, P),
            >(body)(
                gtid, ltid, a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7], a[8], a[9],
            ),
            11 => transmute::<
                RegisterBody,
                unsafe extern "C" fn(G, G, P, P, P, P, P, P, P, P, P, P, P),
            >(body)(
                gtid, ltid, a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7], a[8], a[9], a[10],
            ),
            12 => transmute::<
                RegisterBody,
                unsafe extern "C" fn(G, G, P, P, P, P, P, P, P, P, P, P, P, P),
            >(body)(
                gtid, ltid, a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7], a[8], a[9], a[10],
                a[11],
            ),
            13 => transmute::<
                RegisterBody,
                unsafe extern "C" fn(G, G, P, P, P, P, P, P, P, P, P, P, P, P, P),
            >(body)(
                gtid, ltid, a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7], a[8], a[9], a[10],
                a[11], a[12],
            ),
            14 => transmute::<
                RegisterBody,
                unsafe extern "C" fn(G, G, P, P, P, P, P, P, P, P, P, P, P, P, P, P),
            >(body)(
                gtid, ltid, a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7], a[8], a[9], a[10],
                a[11], a[12], a[13],
            ),
            n => fatal(
                RuntimeError::Assertion,
                format_args!("unsupported outlined-body arity {n}"),
            ),
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use core::mem::transmute;

    thread_local! {
        static SEEN: Cell<(i32, i32, usize)> = const { Cell::new((0, 0, 0)) };
    }

    unsafe extern "C" fn body0(gtid: *mut i32, ltid: *mut i32) {
        SEEN.with(|s| s.set((unsafe { *gtid }, unsafe { *ltid }, 0)));
    }

    unsafe extern "C" fn body3(
        gtid: *mut i32,
        ltid: *mut i32,
        a: *mut (),
        b: *mut (),
        c: *mut (),
    ) {
        let sum = a as usize + b as usize + c as usize;
        SEEN.with(|s| s.set((unsafe { *gtid }, unsafe { *ltid }, sum)));
    }

    type Body3 = unsafe extern "C" fn(*mut i32, *mut i32, *mut (), *mut (), *mut ());

    #[test]
    fn zero_argument_body_receives_ids() {
        let mut gtid = 7;
        let mut ltid = 3;
        let info = unsafe { InvocationInfo::for_outlined(body0, &[]) };
        unsafe { info.run(&mut gtid, &mut ltid) };
        assert_eq!(SEEN.with(Cell::get), (7, 3, 0));
    }

    #[test]
    fn arguments_arrive_in_order() {
        let mut gtid = 1;
        let mut ltid = 0;
        let args = [10usize as *mut (), 20usize as *mut (), 30usize as *mut ()];
        let body = unsafe { transmute::<Body3, RegisterBody>(body3 as Body3) };
        let info = unsafe { InvocationInfo::for_outlined(body, &args) };
        unsafe { info.run(&mut gtid, &mut ltid) };
        assert_eq!(SEEN.with(Cell::get), (1, 0, 60));
    }

    #[test]
    fn extra_trailing_arguments_are_ignored() {
        // The callee is declared with three arguments but we deliver five;
        // the extras must be invisible to it.
        let mut gtid = 2;
        let mut ltid = 1;
        let args = [
            1usize as *mut (),
            2usize as *mut (),
            4usize as *mut (),
            0xdead as *mut (),
            0xbeef as *mut (),
        ];
        let body = unsafe { transmute::<Body3, RegisterBody>(body3 as Body3) };
        let info = unsafe { InvocationInfo::for_outlined(body, &args[..5]) };
        unsafe { info.run(&mut gtid, &mut ltid) };
        assert_eq!(SEEN.with(Cell::get), (2, 1, 7));
    }

    #[test]
    fn single_pointer_body_receives_its_argument() {
        unsafe extern "C" fn shared(arg: *mut ()) {
            let value = unsafe { &mut *(arg as *mut usize) };
            *value += 1;
        }
        let mut value = 41usize;
        let info = InvocationInfo::for_shared(shared, &mut value as *mut usize as *mut ());
        let mut id = 0;
        unsafe { info.run(&mut id, &mut id) };
        assert_eq!(value, 42);
    }
}
