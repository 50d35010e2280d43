//! Panic recovery utilities, in the style of rayon.
//!
//! Task panics are the runtime's exception mechanism: a panicking task is
//! caught at its final suspend, the payload is parked in the parent frame,
//! and `join` re-raises it on the winner's thread.

use core::any::Any;
use core::fmt;
use core::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::panic::resume_unwind;
use std::process::abort;

/// A captured panic payload.
pub type Payload = Box<dyn Any + Send>;

/// Executes `f` and captures any panic, translating that panic into an
/// `Err` result. The assumption is that any panic will be propagated
/// later with `resume_unwinding`, and hence `f` can be treated as
/// exception safe.
#[inline(always)]
pub fn halt_unwinding<F, R>(func: F) -> Result<R, Payload>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(func))
}

#[cold]
pub fn resume_unwinding(payload: Payload) -> ! {
    resume_unwind(payload)
}

/// Aborts the program when dropped.
pub struct AbortOnDrop;

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        eprintln!("weft: detected unexpected panic; aborting");
        abort();
    }
}

// -----------------------------------------------------------------------------
// Substitute payload

/// A substitute payload raised by the `sync` and `eager` awaiter variants when
/// a sibling's panic is pending but cannot yet be touched.
///
/// Once a frame has been stolen, only the frame's exclusive owner at a join
/// point may read the panic cell. The eager variants therefore re-raise this
/// marker instead; reaching the `join` will surface the real payload.
#[derive(Debug)]
pub struct PanicBeforeJoin;

impl fmt::Display for PanicBeforeJoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a sibling task panicked; the payload surfaces at the join")
    }
}

/// Re-raises the substitute [`PanicBeforeJoin`] payload.
#[cold]
pub fn raise_substitute() -> ! {
    resume_unwind(Box::new(PanicBeforeJoin))
}
