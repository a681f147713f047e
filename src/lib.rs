#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::ref_as_ptr)]

//! A sparse, copy-on-write pipeline/layer state tree for retained-mode
//! rasterization state, modeled on the authority-resolution and
//! copy-on-write design used by GPU pipeline-state caches in established
//! scene graph engines.
//!
//! [`pipeline`] and [`layer`] hold the two node trees; [`node`] is the
//! generic substrate both build on; [`context`] owns the arenas and the
//! collaborators ([`backend`], [`journal`], [`texture`]) the mutation
//! protocol calls out to.

pub mod backend;
pub mod color;
pub mod context;
pub mod error;
pub mod journal;
pub mod layer;
pub mod node;
pub mod pipeline;
pub mod texture;

pub use backend::{BackendId, BackendKind, BackendRegistry, ChangeMask, PipelineBackend};
pub use color::Color;
pub use context::Context;
pub use error::{Error, Result};
pub use journal::{Journal, NullJournal};
pub use layer::{Layer, LayerArena, LayerDiff, LayerId};
pub use node::{GraphNode, NodeLink};
pub use pipeline::{Pipeline, PipelineArena, PipelineDiff, PipelineId};
pub use texture::{GlHandle, PrePaintFlags, Texture};
