//! Texture-unit layer nodes.
//!
//! A layer describes one texture unit's worth of state: which texture is
//! bound, how it is filtered and wrapped, and how it combines with the
//! fragment accumulated so far. Layers form their own sparse tree, using
//! the same [`crate::node`] substrate as pipelines, and are addressed by
//! clients through a stable logical [`Layer::index`] that survives
//! reparenting — distinct from [`Layer::unit_index`], their position in
//! the effective, unit-sorted array resolved by the owning pipeline.

use std::rc::Rc;

use bitflags::bitflags;
use glam::Mat4;
use slotmap::{SlotMap, new_key_type};

use crate::color::Color;
use crate::node::{self, GraphNode, NodeLink};
use crate::pipeline::PipelineId;
use crate::texture::Texture;

new_key_type! {
    /// Arena key for a layer node.
    pub struct LayerId;
}

pub type LayerArena = SlotMap<LayerId, Layer>;

bitflags! {
    /// Sparse layer state groups. A set bit means this node is the
    /// authority for that group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LayerDiff: u32 {
        const UNIT                = 1 << 0;
        const TEXTURE_TARGET      = 1 << 1;
        const TEXTURE_DATA        = 1 << 2;
        const FILTERS             = 1 << 3;
        const WRAP_MODES          = 1 << 4;
        const COMBINE             = 1 << 5;
        const COMBINE_CONSTANT    = 1 << 6;
        const USER_MATRIX         = 1 << 7;
        const POINT_SPRITE_COORDS = 1 << 8;
    }
}

impl LayerDiff {
    /// Groups whose representation does not fit in a machine word and so
    /// live in [`LayerBigState`] rather than directly on [`Layer`].
    pub const NEEDS_BIG_STATE: LayerDiff =
        LayerDiff::COMBINE
            .union(LayerDiff::COMBINE_CONSTANT)
            .union(LayerDiff::USER_MATRIX)
            .union(LayerDiff::POINT_SPRITE_COORDS);

    pub const ALL_SPARSE: LayerDiff = LayerDiff::all();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureTarget {
    Texture2D,
    TextureRectangle,
    Texture3D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
    NearestMipmapNearest,
    LinearMipmapNearest,
    NearestMipmapLinear,
    LinearMipmapLinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WrapMode {
    #[default]
    Automatic,
    Repeat,
    ClampToEdge,
    MirroredRepeat,
}

impl WrapMode {
    /// `spec`'s open question: automatic and clamp-to-edge compare equal
    /// because the journal treats them identically downstream.
    #[must_use]
    pub fn equal(self, other: WrapMode) -> bool {
        fn normalize(w: WrapMode) -> WrapMode {
            match w {
                WrapMode::Automatic => WrapMode::ClampToEdge,
                other => other,
            }
        }
        normalize(self) == normalize(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CombineOp {
    Replace,
    Modulate,
    Add,
    AddSigned,
    Interpolate,
    Subtract,
    DotRgb,
    DotRgba,
}

/// A texture-combine function. Full blend-string parsing is out of scope;
/// this captures just enough to drive structural comparison, hashing and
/// the blend-enable predicate's "does any layer combine non-trivially"
/// check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CombineFunction {
    pub rgb_op: CombineOp,
    pub alpha_op: CombineOp,
}

impl CombineFunction {
    /// The implicit default: modulate the accumulated color by this
    /// layer's texture.
    pub const MODULATE: CombineFunction = CombineFunction {
        rgb_op: CombineOp::Modulate,
        alpha_op: CombineOp::Modulate,
    };

    #[must_use]
    pub fn is_default(&self) -> bool {
        *self == Self::MODULATE
    }
}

impl Default for CombineFunction {
    fn default() -> Self {
        Self::MODULATE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PointSpriteCoords {
    pub enabled: bool,
}

/// The heap-allocated record for layer state groups larger than a word.
#[derive(Debug, Clone)]
pub struct LayerBigState {
    pub combine: CombineFunction,
    pub combine_constant: Color,
    pub user_matrix: Mat4,
    pub point_sprite_coords: PointSpriteCoords,
}

impl Default for LayerBigState {
    fn default() -> Self {
        Self {
            combine: CombineFunction::default(),
            combine_constant: Color::new(0, 0, 0, 0),
            user_matrix: Mat4::IDENTITY,
            point_sprite_coords: PointSpriteCoords::default(),
        }
    }
}

/// A single texture unit's state, sparse relative to its parent layer.
#[derive(Debug)]
pub struct Layer {
    link: NodeLink<LayerId>,
    pub(crate) differences: LayerDiff,
    pub(crate) big_state: Option<Box<LayerBigState>>,

    /// Stable logical index clients address this layer by; not sparse,
    /// copied verbatim whenever the layer is copied.
    pub index: u32,

    // Inline scalars, each gated by its own sparse bit.
    pub(crate) unit_index: u32,
    pub(crate) texture_target: TextureTarget,
    pub(crate) texture: Option<Rc<dyn Texture>>,
    pub(crate) min_filter: Filter,
    pub(crate) mag_filter: Filter,
    pub(crate) wrap_modes: [WrapMode; 3],

    /// The single pipeline whose `layer_differences` holds this layer, if
    /// any (invariant: at most one).
    pub(crate) owner: Option<PipelineId>,
}

impl Layer {
    fn blank(index: u32) -> Self {
        Self {
            link: NodeLink::new(),
            differences: LayerDiff::empty(),
            big_state: None,
            index,
            unit_index: 0,
            texture_target: TextureTarget::Texture2D,
            texture: None,
            min_filter: Filter::Linear,
            mag_filter: Filter::Linear,
            wrap_modes: [WrapMode::Automatic; 3],
            owner: None,
        }
    }

    /// Constructs the root default layer (unit 0), authoritative for
    /// every sparse group.
    pub(crate) fn new_root(arena: &mut LayerArena, index: u32, unit_index: u32) -> LayerId {
        let mut layer = Self::blank(index);
        layer.differences = LayerDiff::ALL_SPARSE;
        layer.big_state = Some(Box::new(LayerBigState::default()));
        layer.unit_index = unit_index;
        arena.insert(layer)
    }

    #[must_use]
    pub fn link(&self) -> &NodeLink<LayerId> {
        &self.link
    }

    #[must_use]
    pub fn owner(&self) -> Option<PipelineId> {
        self.owner
    }
}

impl GraphNode<LayerId> for Layer {
    type Aux = ();

    fn link(&self) -> &NodeLink<LayerId> {
        &self.link
    }

    fn link_mut(&mut self) -> &mut NodeLink<LayerId> {
        &mut self.link
    }
}

/// Creates a strong child copy of `src`, with a blank `differences` mask
/// and no owner — the layer-tree analogue of [`crate::pipeline::copy`].
pub fn copy(arena: &mut LayerArena, src: LayerId) -> LayerId {
    let index = arena[src].index;
    let new = arena.insert(Layer::blank(index));
    node::set_parent(arena, new, src, true, &mut ());
    new
}

/// Walks parents from `id` until the authority for `group` is found.
#[must_use]
pub fn authority(arena: &LayerArena, id: LayerId, group: LayerDiff) -> LayerId {
    let mut current = id;
    loop {
        let node = &arena[current];
        if node.differences.contains(group) {
            return current;
        }
        current = node.link.parent().expect("layer chain must terminate at a root authority");
    }
}

/// The resolved position (unit) this layer occupies, via the `UNIT`
/// authority.
#[must_use]
pub fn unit_index(arena: &LayerArena, id: LayerId) -> u32 {
    arena[authority(arena, id, LayerDiff::UNIT)].unit_index
}

#[must_use]
pub fn texture_target(arena: &LayerArena, id: LayerId) -> TextureTarget {
    arena[authority(arena, id, LayerDiff::TEXTURE_TARGET)].texture_target
}

#[must_use]
pub fn texture(arena: &LayerArena, id: LayerId) -> Option<Rc<dyn Texture>> {
    arena[authority(arena, id, LayerDiff::TEXTURE_DATA)].texture.clone()
}

#[must_use]
pub fn filters(arena: &LayerArena, id: LayerId) -> (Filter, Filter) {
    let n = &arena[authority(arena, id, LayerDiff::FILTERS)];
    (n.min_filter, n.mag_filter)
}

#[must_use]
pub fn wrap_modes(arena: &LayerArena, id: LayerId) -> [WrapMode; 3] {
    arena[authority(arena, id, LayerDiff::WRAP_MODES)].wrap_modes
}

#[must_use]
pub fn combine(arena: &LayerArena, id: LayerId) -> CombineFunction {
    arena[authority(arena, id, LayerDiff::COMBINE)]
        .big_state
        .as_ref()
        .expect("combine authority must carry big_state")
        .combine
}

#[must_use]
pub fn combine_constant(arena: &LayerArena, id: LayerId) -> Color {
    arena[authority(arena, id, LayerDiff::COMBINE_CONSTANT)]
        .big_state
        .as_ref()
        .expect("combine-constant authority must carry big_state")
        .combine_constant
}

#[must_use]
pub fn user_matrix(arena: &LayerArena, id: LayerId) -> Mat4 {
    arena[authority(arena, id, LayerDiff::USER_MATRIX)]
        .big_state
        .as_ref()
        .expect("user-matrix authority must carry big_state")
        .user_matrix
}

/// True if `id`'s effective combine function is anything but the default
/// modulate-by-texture, or if its effective texture itself carries alpha
/// — the per-layer half of the blend-enable predicate.
#[must_use]
pub fn may_produce_alpha(arena: &LayerArena, id: LayerId) -> bool {
    if !combine(arena, id).is_default() {
        return true;
    }
    texture(arena, id).is_some_and(|t| t.has_alpha())
}

/// The ancestor list of `id`, leaf-first, used by [`compare_ancestors`].
fn ancestors(arena: &LayerArena, id: LayerId) -> Vec<LayerId> {
    let mut out = vec![id];
    let mut current = id;
    while let Some(p) = arena[current].link.parent() {
        out.push(p);
        current = p;
    }
    out
}

/// The union of `differences` from each of `a` and `b` up to (excluding)
/// their lowest common ancestor. The layer-tree analogue of
/// `Pipeline::compare_differences`.
#[must_use]
pub fn compare_ancestors(arena: &LayerArena, a: LayerId, b: LayerId) -> LayerDiff {
    if a == b {
        return LayerDiff::empty();
    }
    let chain_a = ancestors(arena, a);
    let chain_b = ancestors(arena, b);
    let mut ia = chain_a.len();
    let mut ib = chain_b.len();
    while ia > 0 && ib > 0 && chain_a[ia - 1] == chain_b[ib - 1] {
        ia -= 1;
        ib -= 1;
    }
    let mut mask = LayerDiff::empty();
    for &node in &chain_a[..ia] {
        mask |= arena[node].differences;
    }
    for &node in &chain_b[..ib] {
        mask |= arena[node].differences;
    }
    mask
}

/// Structural equality of two layers modulo `mask`.
#[must_use]
pub fn equal(arena: &LayerArena, a: LayerId, b: LayerId, mask: LayerDiff) -> bool {
    if a == b {
        return true;
    }
    let diff = compare_ancestors(arena, a, b) & mask;
    for group in diff.iter() {
        let authority_a = authority(arena, a, group);
        let authority_b = authority(arena, b, group);
        let matches = match group {
            LayerDiff::UNIT => arena[authority_a].unit_index == arena[authority_b].unit_index,
            LayerDiff::TEXTURE_TARGET => {
                arena[authority_a].texture_target == arena[authority_b].texture_target
            }
            LayerDiff::TEXTURE_DATA => {
                let ta = arena[authority_a].texture.as_ref().map(|t| t.gl_handle());
                let tb = arena[authority_b].texture.as_ref().map(|t| t.gl_handle());
                ta == tb
            }
            LayerDiff::FILTERS => {
                arena[authority_a].min_filter == arena[authority_b].min_filter
                    && arena[authority_a].mag_filter == arena[authority_b].mag_filter
            }
            LayerDiff::WRAP_MODES => {
                let wa = arena[authority_a].wrap_modes;
                let wb = arena[authority_b].wrap_modes;
                wa.iter().zip(wb.iter()).all(|(x, y)| x.equal(*y))
            }
            LayerDiff::COMBINE => combine(arena, authority_a) == combine(arena, authority_b),
            LayerDiff::COMBINE_CONSTANT => {
                let fa = combine(arena, authority_a);
                if !matches!(
                    fa.rgb_op,
                    CombineOp::Interpolate | CombineOp::AddSigned
                ) {
                    true
                } else {
                    combine_constant(arena, authority_a) == combine_constant(arena, authority_b)
                }
            }
            LayerDiff::USER_MATRIX => user_matrix(arena, authority_a) == user_matrix(arena, authority_b),
            LayerDiff::POINT_SPRITE_COORDS => {
                arena[authority_a]
                    .big_state
                    .as_ref()
                    .map(|b| b.point_sprite_coords)
                    == arena[authority_b].big_state.as_ref().map(|b| b.point_sprite_coords)
            }
            _ => true,
        };
        if !matches {
            return false;
        }
    }
    true
}

/// Structural hash compatible with [`equal`].
#[must_use]
pub fn hash(arena: &LayerArena, id: LayerId, mask: LayerDiff, hasher: &mut rustc_hash::FxHasher) {
    use std::hash::Hash;
    let mut remaining = mask;
    let mut current = id;
    while !remaining.is_empty() {
        let node = &arena[current];
        let here = node.differences & remaining;
        for group in here.iter() {
            match group {
                LayerDiff::UNIT => node.unit_index.hash(hasher),
                LayerDiff::TEXTURE_TARGET => node.texture_target.hash(hasher),
                LayerDiff::TEXTURE_DATA => node.texture.as_ref().map(|t| t.gl_handle()).hash(hasher),
                LayerDiff::FILTERS => {
                    node.min_filter.hash(hasher);
                    node.mag_filter.hash(hasher);
                }
                LayerDiff::WRAP_MODES => {
                    for w in node.wrap_modes {
                        (w == WrapMode::Automatic || w == WrapMode::ClampToEdge).hash(hasher);
                        if !matches!(w, WrapMode::Automatic | WrapMode::ClampToEdge) {
                            w.hash(hasher);
                        }
                    }
                }
                LayerDiff::COMBINE => {
                    if let Some(b) = &node.big_state {
                        b.combine.hash(hasher);
                    }
                }
                LayerDiff::COMBINE_CONSTANT => {
                    if let Some(b) = &node.big_state {
                        if matches!(b.combine.rgb_op, CombineOp::Interpolate | CombineOp::AddSigned) {
                            b.combine_constant.hash(hasher);
                        }
                    }
                }
                LayerDiff::USER_MATRIX => {
                    if let Some(b) = &node.big_state {
                        bytemuck_hash_mat4(&b.user_matrix, hasher);
                    }
                }
                LayerDiff::POINT_SPRITE_COORDS => {
                    if let Some(b) = &node.big_state {
                        b.point_sprite_coords.enabled.hash(hasher);
                    }
                }
                _ => {}
            }
        }
        remaining -= here;
        if remaining.is_empty() {
            break;
        }
        current = node.link.parent().expect("layer chain must terminate at a root authority");
    }
}

fn bytemuck_hash_mat4(m: &Mat4, hasher: &mut rustc_hash::FxHasher) {
    use std::hash::Hash;
    for col in m.to_cols_array() {
        col.to_bits().hash(hasher);
    }
}
