//! Crate-level error types.
//!
//! Per the error handling design: only resource exhaustion is a recoverable
//! condition with a typed `Result`. Violated preconditions (bad offsets,
//! negative lengths, device failures) are programming errors and panic
//! instead of being represented here.

use thiserror::Error;

/// The one recoverable failure mode this crate surfaces: the free map ran
/// out of sectors while servicing an allocation request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("free map exhausted: no {requested} contiguous free sector(s) available")]
    OutOfSectors { requested: usize },
}

pub type FsResult<T> = Result<T, FsError>;
