//! The owning collection: both arenas, the back-end hook tables, the
//! journal, and the small set of default templates every pipeline and
//! layer ultimately derives from.
//!
//! Nearly every free function in [`crate::pipeline`] and [`crate::layer`]
//! takes `&mut Context` rather than the individual arenas, because the
//! copy-on-write protocol routinely needs the pipeline arena, the layer
//! arena and the back-end registries all at once; bundling them here is
//! the direct equivalent of a scene graph's single owning `World`/`Scene`
//! struct.

use log::debug;

use crate::backend::BackendRegistry;
use crate::journal::{Journal, NullJournal};
use crate::layer::{Layer, LayerArena, LayerId};
use crate::pipeline::{Pipeline, PipelineArena, PipelineId};

/// Owns every pipeline and layer node plus the collaborators the mutation
/// protocol calls out to.
pub struct Context {
    pub(crate) pipelines: PipelineArena,
    pub(crate) layers: LayerArena,

    pub(crate) fragend_backends: BackendRegistry,
    pub(crate) vertend_backends: BackendRegistry,
    pub(crate) journal: Box<dyn Journal>,

    /// Root default pipeline: authority for every sparse group, strong
    /// parent of every pipeline created via `pipeline::new`.
    pub default_pipeline: PipelineId,
    /// Root default layer (unit 0): authority for every sparse layer
    /// group, template for the first layer added to any pipeline.
    pub default_layer_0: LayerId,
    /// Template for layers added at a unit other than 0.
    pub default_layer_n: LayerId,
}

impl Context {
    /// A fresh context: the default pipeline and the two default layer
    /// templates, with empty back-end registries and a no-op journal.
    #[must_use]
    pub fn new() -> Self {
        let mut pipelines = PipelineArena::default();
        let mut layers = LayerArena::default();

        let default_layer_0 = Layer::new_root(&mut layers, 0, 0);
        let default_layer_n = Layer::new_root(&mut layers, 0, 1);
        let default_pipeline = Pipeline::new_root(&mut pipelines);

        debug!("context initialized: default pipeline and layer templates created");

        Self {
            pipelines,
            layers,
            fragend_backends: BackendRegistry::new(),
            vertend_backends: BackendRegistry::new(),
            journal: Box::new(NullJournal),
            default_pipeline,
            default_layer_0,
            default_layer_n,
        }
    }

    #[must_use]
    pub fn pipelines(&self) -> &PipelineArena {
        &self.pipelines
    }

    #[must_use]
    pub fn layers(&self) -> &LayerArena {
        &self.layers
    }

    /// Swaps in a different journal collaborator (the default is a no-op).
    pub fn set_journal(&mut self, journal: Box<dyn Journal>) {
        self.journal = journal;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
