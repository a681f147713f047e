//! The hook table consumed by fragment/vertex/program back-ends.
//!
//! Back-ends — the code generators that turn pipeline state into actual
//! shader source — are out of scope for this crate; it only defines the
//! interface they implement and a fixed-capacity slot table to register
//! them in, mirroring the original's small, fixed enumeration of back-end
//! kinds rather than an unbounded `Vec` of trait objects.

use crate::color::Color;
use crate::layer::LayerId;
use crate::pipeline::PipelineId;

/// Opaque bitmask describing which state groups changed. The core never
/// interprets these bits itself; back-ends define their own meaning.
pub type ChangeMask = u32;

/// Which hook table a back-end registers into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Fragment,
    Vertex,
}

/// Fixed capacity of each back-end's hook table, mirroring the small
/// hardcoded back-end counts upstream.
pub const MAX_BACKENDS_PER_KIND: usize = 4;

/// A currently-selected back-end id, or the sentinel meaning re-selection
/// is required on the next flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendId {
    Undefined,
    Fixed(u8),
}

impl BackendId {
    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        matches!(self, BackendId::Fixed(_))
    }
}

/// Hooks a back-end implements to track pipeline and layer state changes.
///
/// Every method is a notification, not a request: the core has already
/// decided to proceed with the change by the time these fire. A back-end
/// signals that it can no longer vouch for its previously-selected variant
/// by returning `false` from `pipeline_pre_change_notify`, which resets the
/// pipeline's back-end id to [`BackendId::Undefined`].
pub trait PipelineBackend {
    /// Invoked once per pipeline-level mutation, before the mutation lands.
    /// `new_color` is populated only when the change is a `COLOR` change.
    fn pipeline_pre_change_notify(
        &self,
        pipeline: PipelineId,
        change_mask: ChangeMask,
        new_color: Option<Color>,
    ) -> bool;

    /// Invoked after a pipeline has been reparented.
    fn pipeline_set_parent_notify(&self, pipeline: PipelineId);

    /// Invoked once per layer-level mutation.
    fn layer_pre_change_notify(
        &self,
        owner: PipelineId,
        layer: LayerId,
        change_mask: ChangeMask,
    ) -> bool;
}

/// A fixed-capacity registry of back-ends for one kind (fragment or
/// vertex). Registration fails once the table is full rather than growing
/// without bound.
#[derive(Default)]
pub struct BackendRegistry {
    slots: Vec<Box<dyn PipelineBackend>>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Register a back-end, returning its assigned slot id.
    pub fn register(
        &mut self,
        kind: BackendKind,
        backend: Box<dyn PipelineBackend>,
    ) -> crate::error::Result<u8> {
        if self.slots.len() >= MAX_BACKENDS_PER_KIND {
            return Err(crate::error::Error::BackendSlotExhausted {
                kind,
                capacity: MAX_BACKENDS_PER_KIND,
            });
        }
        let id = self.slots.len() as u8;
        self.slots.push(backend);
        Ok(id)
    }

    #[must_use]
    pub fn get(&self, id: u8) -> Option<&dyn PipelineBackend> {
        self.slots.get(id as usize).map(std::convert::AsRef::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn PipelineBackend> {
        self.slots.iter().map(std::convert::AsRef::as_ref)
    }
}
