//! Structural self-checks for distributed layouts and block views.
//!
//! Checks run under `debug_assertions`, or in release builds when the
//! `strict-invariants` or `check-invariants` feature is enabled.

use crate::ga_error::GaError;

/// A layout or view that can verify its own structure.
pub trait DebugInvariants {
    /// Panic with the first violation, if checks are compiled in. Used after
    /// assembly and before handing out a column block.
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "layout check");
    }

    /// First violated invariant as an `Err`, without panicking.
    fn validate_invariants(&self) -> Result<(), GaError>;
}

/// Evaluate `$expr` (a `Result<(), GaError>`) when checks are compiled in
/// and panic with the given label on `Err`.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $($ctx:tt)*) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants", feature = "check-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("[ga-sparse invariants] ", $($ctx)*, ": {}"), e);
        }
    };
}
