//! Error type for the crate's few fallible entry points.
//!
//! Almost everything in this crate is infallible by design: setters have no
//! error path (contract violations are assertions, per the error handling
//! notes on [`crate::pipeline`]), and the mutation protocol has no partial
//! failure mode to report. The handful of operations that *can* fail without
//! violating a caller contract — chiefly registering a back-end into a
//! fixed-capacity slot table — return this type.

use thiserror::Error;

/// Failure modes a caller can recover from.
#[derive(Error, Debug)]
pub enum Error {
    /// The fixed-size back-end hook table for the given kind is full.
    #[error("no free back-end slot for {kind:?} (capacity {capacity})")]
    BackendSlotExhausted {
        /// Which hook table was full.
        kind: crate::backend::BackendKind,
        /// The table's fixed capacity.
        capacity: usize,
    },
}

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
