//! The interface consumed from the journal.
//!
//! The journal — the log of geometry batches referencing a pipeline's
//! exact state — lives outside this crate. This crate only needs to flush
//! it before honoring a mutation on a pipeline the journal still
//! references, bracketed by [`crate::pipeline::Pipeline::journal_ref`] and
//! [`crate::pipeline::Pipeline::journal_unref`].

/// A flushable journal collaborator.
pub trait Journal {
    /// Flush all pending geometry, releasing any pipeline references it
    /// was holding for deferred submission.
    fn flush(&mut self);
}

/// A journal that does nothing; the default when no journal is wired up.
#[derive(Debug, Default)]
pub struct NullJournal;

impl Journal for NullJournal {
    fn flush(&mut self) {}
}
