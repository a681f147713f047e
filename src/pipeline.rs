//! Pipeline nodes: rasterization state plus the layers bound to it.
//!
//! This is the heart of the crate. A pipeline is a node in a sparse tree —
//! it stores only the state groups it is the *authority* for, resolving
//! everything else by walking toward the root — combined with the
//! copy-on-write protocol that lets a pipeline look mutable to its owner
//! while every other pipeline that shares its ancestry stays unaffected.
//!
//! Free functions here, not methods, because almost everything needs
//! simultaneous access to the pipeline arena and the layer arena (a
//! pipeline's `layer_differences` are nodes in a different tree); bundling
//! both into [`crate::context::Context`] and passing it through keeps the
//! borrow checker happy without resorting to `Rc<RefCell<_>>`.

use std::rc::Rc;

use bitflags::bitflags;
use glam::Mat4;
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;

use crate::backend::BackendId;
use crate::color::Color;
use crate::context::Context;
use crate::layer::{self, CombineFunction, Filter, LayerDiff, LayerId, PointSpriteCoords, TextureTarget, WrapMode};
use crate::node::{self, GraphNode, NodeLink};
use crate::texture::Texture;

new_key_type! {
    /// Arena key for a pipeline node.
    pub struct PipelineId;
}

pub type PipelineArena = SlotMap<PipelineId, Pipeline>;

bitflags! {
    /// Sparse pipeline state groups. A set bit means this node is the
    /// authority for that group. `REAL_BLEND_ENABLE` is not itself
    /// authority-resolved (see [`Pipeline::real_blend_enable`]); the bit
    /// exists only so change notifications can say "blend enable flipped".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineDiff: u32 {
        const COLOR               = 1 << 0;
        const BLEND_ENABLE        = 1 << 1;
        const BLEND               = 1 << 2;
        const ALPHA_FUNC          = 1 << 3;
        const ALPHA_FUNC_REFERENCE = 1 << 4;
        const LIGHTING            = 1 << 5;
        const DEPTH               = 1 << 6;
        const FOG                 = 1 << 7;
        const CULL_FACE           = 1 << 8;
        const POINT_SIZE          = 1 << 9;
        const LOGIC_OPS           = 1 << 10;
        const USER_SHADER         = 1 << 11;
        const LAYERS              = 1 << 12;
        const REAL_BLEND_ENABLE   = 1 << 13;
    }
}

impl PipelineDiff {
    /// Groups sharing the single lazily-allocated `big_state` record.
    pub const NEEDS_BIG_STATE: PipelineDiff = PipelineDiff::LIGHTING
        .union(PipelineDiff::BLEND)
        .union(PipelineDiff::DEPTH)
        .union(PipelineDiff::FOG)
        .union(PipelineDiff::CULL_FACE)
        .union(PipelineDiff::LOGIC_OPS)
        .union(PipelineDiff::USER_SHADER)
        .union(PipelineDiff::POINT_SIZE);

    /// Groups whose payload is more than one field, requiring the whole
    /// group to be copied on takeover rather than a single scalar.
    pub const MULTI_PROPERTY: PipelineDiff = PipelineDiff::NEEDS_BIG_STATE.union(PipelineDiff::LAYERS);

    /// Groups whose change can flip [`Pipeline::real_blend_enable`].
    pub const AFFECTS_BLENDING: PipelineDiff = PipelineDiff::BLEND_ENABLE
        .union(PipelineDiff::BLEND)
        .union(PipelineDiff::COLOR)
        .union(PipelineDiff::USER_SHADER)
        .union(PipelineDiff::LAYERS);

    pub const ALL_SPARSE: PipelineDiff = PipelineDiff::all().difference(PipelineDiff::REAL_BLEND_ENABLE);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendEnableState {
    Enabled,
    Disabled,
    Automatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendEquation {
    Add,
    Subtract,
    ReverseSubtract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    DstColor,
    OneMinusDstColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub rgb_equation: BlendEquation,
    pub alpha_equation: BlendEquation,
    pub rgb_src_factor: BlendFactor,
    pub rgb_dst_factor: BlendFactor,
    pub alpha_src_factor: BlendFactor,
    pub alpha_dst_factor: BlendFactor,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            rgb_equation: BlendEquation::Add,
            alpha_equation: BlendEquation::Add,
            rgb_src_factor: BlendFactor::One,
            rgb_dst_factor: BlendFactor::OneMinusSrcAlpha,
            alpha_src_factor: BlendFactor::One,
            alpha_dst_factor: BlendFactor::OneMinusSrcAlpha,
        }
    }
}

impl BlendState {
    /// `ADD` for both equations and `(ONE, ONE_MINUS_SRC_ALPHA)` for both
    /// RGB and alpha factors — the non-blending-forcing default.
    #[must_use]
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LightingState {
    pub ambient: Color,
    pub diffuse: Color,
    pub specular: Color,
    pub shininess_bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepthFunc {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub test_enabled: bool,
    pub writing_enabled: bool,
    pub compare_func: DepthFunc,
    pub range_near_bits: u32,
    pub range_far_bits: u32,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test_enabled: false,
            writing_enabled: true,
            compare_func: DepthFunc::Less,
            range_near_bits: 0.0_f32.to_bits(),
            range_far_bits: 1.0_f32.to_bits(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FogMode {
    Linear,
    Exponential,
    ExponentialSquared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FogState {
    pub enabled: bool,
    pub mode: FogMode,
    pub color: Color,
    pub density_bits: u32,
    pub start_bits: u32,
    pub end_bits: u32,
}

impl Default for FogState {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: FogMode::Linear,
            color: Color::WHITE,
            density_bits: 1.0_f32.to_bits(),
            start_bits: 0.0_f32.to_bits(),
            end_bits: 1.0_f32.to_bits(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullFaceMode {
    #[default]
    None,
    Front,
    Back,
    FrontAndBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LogicOp {
    #[default]
    Copy,
    Xor,
    Clear,
    Set,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlphaFunc {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

/// Opaque handle to an externally-managed shader program. The shader
/// compilation/linking machinery itself is out of scope.
pub type UserShaderId = u64;

/// The single heap record backing every pipeline state group whose
/// payload doesn't fit in a word, allocated lazily the first time any of
/// them is needed.
#[derive(Debug, Clone, Default)]
pub struct PipelineBigState {
    pub blend: BlendState,
    pub lighting: LightingState,
    pub depth: DepthState,
    pub fog: FogState,
    pub cull_face: CullFaceMode,
    pub logic_op: LogicOp,
    pub user_shader: Option<UserShaderId>,
    pub point_size_bits: u32,
}

impl PipelineBigState {
    fn point_size(&self) -> f32 {
        f32::from_bits(self.point_size_bits)
    }
}

impl Default for DepthFunc {
    fn default() -> Self {
        DepthFunc::Less
    }
}

/// A rasterization-state node: a sparse set of state groups, an ordered
/// set of texture layers resolved through ancestors, and the bookkeeping
/// the copy-on-write protocol needs.
#[derive(Debug)]
pub struct Pipeline {
    link: NodeLink<PipelineId>,
    pub(crate) differences: PipelineDiff,
    pub(crate) big_state: Option<Box<PipelineBigState>>,

    pub(crate) color: Color,
    pub(crate) blend_enable: BlendEnableState,
    pub(crate) real_blend_enable: bool,
    pub(crate) alpha_func: AlphaFunc,
    pub(crate) alpha_reference_bits: u32,
    pub(crate) n_layers: u32,

    pub(crate) layer_differences: SmallVec<[LayerId; 4]>,
    layers_cache: Vec<LayerId>,
    layers_cache_dirty: bool,

    journal_ref_count: u32,
    destroy_callback: Option<Box<dyn FnMut(PipelineId)>>,
    pub age: u64,
    pub fragend: BackendId,
    pub vertend: BackendId,
    pub breadcrumb: Option<&'static str>,
}

impl Pipeline {
    fn blank() -> Self {
        Self {
            link: NodeLink::new(),
            differences: PipelineDiff::empty(),
            big_state: None,
            color: Color::WHITE,
            blend_enable: BlendEnableState::Automatic,
            real_blend_enable: false,
            alpha_func: AlphaFunc::Always,
            alpha_reference_bits: 0.0_f32.to_bits(),
            n_layers: 0,
            layer_differences: SmallVec::new(),
            layers_cache: Vec::new(),
            layers_cache_dirty: true,
            journal_ref_count: 0,
            destroy_callback: None,
            age: 0,
            fragend: BackendId::Undefined,
            vertend: BackendId::Undefined,
            breadcrumb: None,
        }
    }

    pub(crate) fn new_root(arena: &mut PipelineArena) -> PipelineId {
        let mut pipeline = Self::blank();
        pipeline.differences = PipelineDiff::ALL_SPARSE;
        pipeline.big_state = Some(Box::new(PipelineBigState::default()));
        arena.insert(pipeline)
    }

    #[must_use]
    pub fn link(&self) -> &NodeLink<PipelineId> {
        &self.link
    }

    #[must_use]
    pub fn is_layers_authority_complete(&self) -> bool {
        self.differences.contains(PipelineDiff::LAYERS) && self.n_layers as usize == self.layer_differences.len()
    }
}

impl GraphNode<PipelineId> for Pipeline {
    type Aux = crate::layer::LayerArena;

    fn link(&self) -> &NodeLink<PipelineId> {
        &self.link
    }

    fn link_mut(&mut self) -> &mut NodeLink<PipelineId> {
        &mut self.link
    }

    fn on_weak_destroy(&mut self, id: PipelineId, _layers: &mut Self::Aux) {
        if let Some(mut cb) = self.destroy_callback.take() {
            cb(id);
        }
    }

    fn on_teardown(&mut self, _id: PipelineId, layers: &mut Self::Aux) {
        for layer in self.layer_differences.drain(..) {
            node::unreference(layers, layer, &mut ());
        }
        self.layers_cache.clear();
    }
}

// ---------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------

/// A fresh strong child of `ctx.default_pipeline`, inheriting all state.
pub fn new(ctx: &mut Context) -> PipelineId {
    copy(ctx, ctx.default_pipeline)
}

/// A strong child of `src`, inheriting all state. Promotes any weak
/// ancestors of `src` for the new copy's lifetime.
pub fn copy(ctx: &mut Context, src: PipelineId) -> PipelineId {
    let real_blend_enable = ctx.pipelines[src].real_blend_enable;
    let fragend = ctx.pipelines[src].fragend;
    let vertend = ctx.pipelines[src].vertend;
    let id = ctx.pipelines.insert(Pipeline::blank());
    {
        let p = &mut ctx.pipelines[id];
        p.real_blend_enable = real_blend_enable;
        p.fragend = fragend;
        p.vertend = vertend;
    }
    set_parent(ctx, id, src, true);
    promote_weak_ancestors(ctx, id);
    id
}

/// A weak child of `src`; `on_destroy` fires when the core forcibly tears
/// this pipeline down because a weak edge doesn't keep it alive.
pub fn weak_copy(
    ctx: &mut Context,
    src: PipelineId,
    on_destroy: Box<dyn FnMut(PipelineId)>,
) -> PipelineId {
    let id = ctx.pipelines.insert(Pipeline::blank());
    ctx.pipelines[id].destroy_callback = Some(on_destroy);
    set_parent(ctx, id, src, false);
    id
}

fn set_parent(ctx: &mut Context, id: PipelineId, parent: PipelineId, strong: bool) {
    node::set_parent(&mut ctx.pipelines, id, parent, strong, &mut ctx.layers);
}

/// Acquires a reference on `id`.
pub fn reference(ctx: &mut Context, id: PipelineId) {
    node::reference(&mut ctx.pipelines, id);
}

/// Releases a reference on `id`, tearing it down if it was the last one.
/// If this is the last reference, reverts any weak-ancestor promotion
/// performed when `id` was created, before the ancestor chain becomes
/// unreachable through `id` itself.
pub fn unreference(ctx: &mut Context, id: PipelineId) {
    if ctx.pipelines[id].link.ref_count() == 1 {
        revert_weak_ancestors(ctx, id);
    }
    node::unreference(&mut ctx.pipelines, id, &mut ctx.layers);
}

// ---------------------------------------------------------------------
// Weak-ancestor promotion
// ---------------------------------------------------------------------

/// Walks up through any contiguous chain of weak ancestors starting at
/// `id`'s parent and takes one extra strong reference on each such
/// ancestor's own parent, keeping the chain alive for as long as `id`
/// exists. The symmetric release happens in [`revert_weak_ancestors`].
fn promote_weak_ancestors(ctx: &mut Context, id: PipelineId) {
    let Some(mut current) = ctx.pipelines[id].link.parent() else {
        return;
    };
    while ctx.pipelines[current].link.is_weak() {
        let Some(grandparent) = ctx.pipelines[current].link.parent() else {
            break;
        };
        node::reference(&mut ctx.pipelines, grandparent);
        current = grandparent;
    }
}

fn revert_weak_ancestors(ctx: &mut Context, id: PipelineId) {
    let Some(mut current) = ctx.pipelines[id].link.parent() else {
        return;
    };
    while ctx.pipelines.get(current).is_some_and(|p| p.link.is_weak()) {
        let Some(grandparent) = ctx.pipelines[current].link.parent() else {
            break;
        };
        node::unreference(&mut ctx.pipelines, grandparent, &mut ctx.layers);
        current = grandparent;
    }
}

// ---------------------------------------------------------------------
// Authority resolution
// ---------------------------------------------------------------------

/// Walks parents from `id` until the authority for `group` is found.
#[must_use]
pub fn authority(ctx: &Context, id: PipelineId, group: PipelineDiff) -> PipelineId {
    let mut current = id;
    loop {
        if ctx.pipelines[current].differences.contains(group) {
            return current;
        }
        current = ctx.pipelines[current]
            .link
            .parent()
            .expect("pipeline chain must terminate at a root authority");
    }
}

/// Resolves authorities for every bit in `mask` in a single upward walk,
/// recording the authority for each bit the first time it is found.
fn authorities_for(ctx: &Context, id: PipelineId, mask: PipelineDiff) -> Vec<(PipelineDiff, PipelineId)> {
    let mut remaining = mask;
    let mut out = Vec::new();
    let mut current = id;
    loop {
        let here = ctx.pipelines[current].differences & remaining;
        for bit in here.iter() {
            out.push((bit, current));
        }
        remaining -= here;
        if remaining.is_empty() {
            break;
        }
        current = ctx.pipelines[current]
            .link
            .parent()
            .expect("pipeline chain must terminate at a root authority");
    }
    out
}

// ---------------------------------------------------------------------
// Effective-layer resolution
// ---------------------------------------------------------------------

/// Rebuilds (if dirty) and returns the dense, unit-sorted array of
/// effective layers for `id`'s `LAYERS` authority.
pub fn layers_cache(ctx: &mut Context, id: PipelineId) -> &[LayerId] {
    let authority_id = authority(ctx, id, PipelineDiff::LAYERS);
    if !ctx.pipelines[authority_id].layers_cache_dirty {
        return &ctx.pipelines[authority_id].layers_cache;
    }
    let n = ctx.pipelines[authority_id].n_layers as usize;
    let mut slots: Vec<Option<LayerId>> = vec![None; n];
    let mut filled = 0usize;
    let mut current = authority_id;
    loop {
        if ctx.pipelines[current].differences.contains(PipelineDiff::LAYERS) {
            let owned: SmallVec<[LayerId; 4]> = ctx.pipelines[current].layer_differences.clone();
            for l in owned {
                let u = layer::unit_index(&ctx.layers, l) as usize;
                if u < n && slots[u].is_none() {
                    slots[u] = Some(l);
                    filled += 1;
                }
            }
        }
        if filled == n {
            break;
        }
        match ctx.pipelines[current].link.parent() {
            Some(p) => current = p,
            None => break,
        }
    }
    let resolved: Vec<LayerId> = slots.into_iter().flatten().collect();
    let authority_node = &mut ctx.pipelines[authority_id];
    authority_node.layers_cache = resolved;
    authority_node.layers_cache_dirty = false;
    &ctx.pipelines[authority_id].layers_cache
}

/// Invalidates `id`'s layer cache and every descendant's, stopping at any
/// descendant that is already dirty.
fn invalidate_layer_caches_recursively(ctx: &mut Context, id: PipelineId) {
    if ctx.pipelines[id].layers_cache_dirty {
        return;
    }
    ctx.pipelines[id].layers_cache_dirty = true;
    let children = node::children_snapshot(&ctx.pipelines, id);
    for child in children {
        invalidate_layer_caches_recursively(ctx, child);
    }
}

/// Invokes `f` with `(pipeline, layer_index)` for each effective layer in
/// unit order. The list of indices is snapshotted up front so `f` may add
/// or remove layers during the walk.
pub fn foreach_layer(ctx: &mut Context, id: PipelineId, mut f: impl FnMut(&mut Context, PipelineId, u32)) {
    let layers: Vec<LayerId> = layers_cache(ctx, id).to_vec();
    let indices: Vec<u32> = layers.iter().map(|&l| ctx.layers[l].index).collect();
    for index in indices {
        f(ctx, id, index);
    }
}

// ---------------------------------------------------------------------
// Blend-enable derivation
// ---------------------------------------------------------------------

/// Recomputes `real_blend_enable` and fires a `REAL_BLEND_ENABLE`
/// sub-change through the mutation protocol if it flipped.
fn update_real_blend_enable(ctx: &mut Context, id: PipelineId) {
    let new_value = derive_blend_enable(ctx, id);
    if ctx.pipelines[id].real_blend_enable != new_value {
        for backend in ctx.fragend_backends.iter() {
            backend.pipeline_pre_change_notify(id, PipelineDiff::REAL_BLEND_ENABLE.bits(), None);
        }
        ctx.pipelines[id].real_blend_enable = new_value;
    }
}

fn derive_blend_enable(ctx: &mut Context, id: PipelineId) -> bool {
    let enable_authority = authority(ctx, id, PipelineDiff::BLEND_ENABLE);
    match ctx.pipelines[enable_authority].blend_enable {
        BlendEnableState::Enabled => return true,
        BlendEnableState::Disabled => return false,
        BlendEnableState::Automatic => {}
    }

    let blend_authority = authority(ctx, id, PipelineDiff::BLEND);
    let blend = ctx.pipelines[blend_authority]
        .big_state
        .as_ref()
        .expect("blend authority must carry big_state")
        .blend;
    if !blend.is_default() {
        return true;
    }

    let color_authority = authority(ctx, id, PipelineDiff::COLOR);
    if !ctx.pipelines[color_authority].color.is_opaque() {
        return true;
    }

    let shader_authority = authority(ctx, id, PipelineDiff::USER_SHADER);
    if ctx.pipelines[shader_authority]
        .big_state
        .as_ref()
        .expect("user-shader authority must carry big_state")
        .user_shader
        .is_some()
    {
        return true;
    }

    let layers = layers_cache(ctx, id).to_vec();
    layers.iter().any(|&l| layer::may_produce_alpha(&ctx.layers, l))
}

// ---------------------------------------------------------------------
// Copy-on-write mutation protocol
// ---------------------------------------------------------------------

/// Runs steps 1-4 of the mutation protocol ahead of writing a new value
/// for `group` on `id`. After this returns, `id` has no strong children
/// and is safe to mutate directly.
fn pre_change_notify(ctx: &mut Context, id: PipelineId, group: PipelineDiff, new_color: Option<Color>, from_layer_change: bool) {
    // 1. Journal flush, with the color/no-blend-flip exception.
    if ctx.pipelines[id].journal_ref_count > 0 {
        let skip = group == PipelineDiff::COLOR && !would_flip_blend_enable(ctx, id, new_color);
        if !skip {
            ctx.journal.flush();
        }
    }

    // 2. Back-end invalidation.
    if ctx.pipelines[id].fragend.is_fixed() {
        ctx.pipelines[id].fragend = BackendId::Undefined;
    }
    if ctx.pipelines[id].vertend.is_fixed() {
        ctx.pipelines[id].vertend = BackendId::Undefined;
    }
    if !from_layer_change {
        let mut refused = false;
        for backend in ctx.fragend_backends.iter() {
            if !backend.pipeline_pre_change_notify(id, group.bits(), new_color) {
                refused = true;
            }
        }
        for backend in ctx.vertend_backends.iter() {
            if !backend.pipeline_pre_change_notify(id, group.bits(), new_color) {
                refused = true;
            }
        }
        if refused {
            ctx.pipelines[id].fragend = BackendId::Undefined;
            ctx.pipelines[id].vertend = BackendId::Undefined;
        }
    }

    // 3. Destroy weak children.
    node::destroy_weak_children(&mut ctx.pipelines, id, &mut ctx.layers);

    // 4. Copy-on-write if strong children remain: `np`, a strong copy of
    // `id`'s own parent, takes over every group `id` is currently the
    // authority for (so `np` is observationally equal to `id`) and
    // inherits `id`'s remaining children. `id` itself keeps its identity
    // and parent, now free of children to mutate directly.
    if node::has_strong_children(&ctx.pipelines, id) {
        let parent = ctx.pipelines[id]
            .link
            .parent()
            .expect("a pipeline with children always has a parent to copy from");
        let np = copy(ctx, parent);
        let differences = ctx.pipelines[id].differences;
        for group in differences.iter() {
            take_over_group(ctx, np, id, group);
            ctx.pipelines[np].differences.insert(group);
            if group == PipelineDiff::LAYERS {
                // `take_over_group` leaves a sparse-takeover authority with
                // no layers of its own; `np` must instead present the exact
                // layers `id` already owns. A layer can't have more than one
                // owner, so `np` can't simply take a reference on `id`'s
                // layers — each has to be derived into its own copy, owned
                // by `np` instead.
                let owned = ctx.pipelines[id].layer_differences.clone();
                for &l in &owned {
                    let c = layer::copy(&mut ctx.layers, l);
                    add_layer_difference(ctx, np, c);
                }
            }
        }
        let children = node::children_snapshot(&ctx.pipelines, id);
        for child in children {
            let strong = ctx.pipelines[child].link.has_parent_reference();
            set_parent(ctx, child, np, strong);
            for backend in ctx.fragend_backends.iter() {
                backend.pipeline_set_parent_notify(child);
            }
        }
        unreference(ctx, np);
    }
}

fn would_flip_blend_enable(ctx: &mut Context, id: PipelineId, new_color: Option<Color>) -> bool {
    let Some(new_color) = new_color else { return true };
    if !PipelineDiff::AFFECTS_BLENDING.contains(PipelineDiff::COLOR) {
        return false;
    }
    let current = ctx.pipelines[id].real_blend_enable;
    let was = ctx.pipelines[id].color;
    ctx.pipelines[id].color = new_color;
    let would_be = derive_blend_enable(ctx, id);
    ctx.pipelines[id].color = was;
    would_be != current
}

/// If `group` is not already in `id.differences`, copies the whole
/// group's current values from the current authority into `id` before the
/// caller overwrites it with a new value — step 6 of the protocol.
fn take_over_group(ctx: &mut Context, id: PipelineId, from: PipelineId, group: PipelineDiff) {
    if ctx.pipelines[id].differences.contains(group) {
        return;
    }
    ensure_big_state(ctx, id, group);
    match group {
        PipelineDiff::COLOR => ctx.pipelines[id].color = ctx.pipelines[from].color,
        PipelineDiff::BLEND_ENABLE => ctx.pipelines[id].blend_enable = ctx.pipelines[from].blend_enable,
        PipelineDiff::ALPHA_FUNC => ctx.pipelines[id].alpha_func = ctx.pipelines[from].alpha_func,
        PipelineDiff::ALPHA_FUNC_REFERENCE => {
            ctx.pipelines[id].alpha_reference_bits = ctx.pipelines[from].alpha_reference_bits;
        }
        PipelineDiff::LAYERS => {
            // `id` becomes one more link in the chain of LAYERS authorities
            // contributing to the effective set (see `layers_cache`); it
            // starts out owning none of `from`'s layer differences itself.
            ctx.pipelines[id].n_layers = ctx.pipelines[from].n_layers;
        }
        _ if PipelineDiff::NEEDS_BIG_STATE.contains(group) => {
            let src = ctx.pipelines[from]
                .big_state
                .as_ref()
                .expect("authority of a big-state group must carry big_state")
                .clone();
            let dst = ctx.pipelines[id].big_state.as_mut().expect("big_state just ensured");
            match group {
                PipelineDiff::LIGHTING => dst.lighting = src.lighting,
                PipelineDiff::BLEND => dst.blend = src.blend,
                PipelineDiff::DEPTH => dst.depth = src.depth,
                PipelineDiff::FOG => dst.fog = src.fog,
                PipelineDiff::CULL_FACE => dst.cull_face = src.cull_face,
                PipelineDiff::LOGIC_OPS => dst.logic_op = src.logic_op,
                PipelineDiff::USER_SHADER => dst.user_shader = src.user_shader,
                PipelineDiff::POINT_SIZE => dst.point_size_bits = src.point_size_bits,
                _ => unreachable!("non-big-state bit under NEEDS_BIG_STATE mask"),
            }
        }
        _ => {}
    }
}

fn ensure_big_state(ctx: &mut Context, id: PipelineId, group: PipelineDiff) {
    if PipelineDiff::NEEDS_BIG_STATE.intersects(group) && ctx.pipelines[id].big_state.is_none() {
        ctx.pipelines[id].big_state = Some(Box::new(PipelineBigState::default()));
    }
}

/// The shared tail of every setter: after writing a new value for `group`
/// on an authority `id`, revert authority if the new value now matches
/// the parent's, then prune redundant ancestry either way.
fn update_authority(ctx: &mut Context, id: PipelineId, group: PipelineDiff) {
    if let Some(parent) = ctx.pipelines[id].link.parent() {
        if group_value_equal(ctx, id, parent, group) {
            ctx.pipelines[id].differences.remove(group);
        }
    }
    prune_redundant_ancestry(ctx, id);
}

fn group_value_equal(ctx: &Context, id: PipelineId, parent: PipelineId, group: PipelineDiff) -> bool {
    let parent_authority = authority(ctx, parent, group);
    let a = &ctx.pipelines[id];
    let b = &ctx.pipelines[parent_authority];
    match group {
        PipelineDiff::COLOR => a.color == b.color,
        PipelineDiff::BLEND_ENABLE => a.blend_enable == b.blend_enable,
        PipelineDiff::ALPHA_FUNC => a.alpha_func == b.alpha_func,
        PipelineDiff::ALPHA_FUNC_REFERENCE => a.alpha_reference_bits == b.alpha_reference_bits,
        PipelineDiff::LAYERS => a.n_layers == b.n_layers && a.layer_differences.is_empty(),
        _ if PipelineDiff::NEEDS_BIG_STATE.contains(group) => {
            let (Some(abs), Some(bbs)) = (&a.big_state, &b.big_state) else {
                return false;
            };
            match group {
                PipelineDiff::LIGHTING => abs.lighting == bbs.lighting,
                PipelineDiff::BLEND => abs.blend == bbs.blend,
                PipelineDiff::DEPTH => abs.depth == bbs.depth,
                PipelineDiff::FOG => abs.fog == bbs.fog,
                PipelineDiff::CULL_FACE => abs.cull_face == bbs.cull_face,
                PipelineDiff::LOGIC_OPS => abs.logic_op == bbs.logic_op,
                PipelineDiff::USER_SHADER => abs.user_shader == bbs.user_shader,
                PipelineDiff::POINT_SIZE => abs.point_size_bits == bbs.point_size_bits,
                _ => false,
            }
        }
        _ => false,
    }
}

/// Walks upward past ancestors `id` no longer differs from, reparenting
/// `id` directly onto the first ancestor it still needs. Refuses to move
/// at all if `id` is a `LAYERS` authority that still depends on an
/// ancestor for some of its layers.
fn prune_redundant_ancestry(ctx: &mut Context, id: PipelineId) {
    if ctx.pipelines[id].differences.contains(PipelineDiff::LAYERS)
        && !ctx.pipelines[id].is_layers_authority_complete()
    {
        return;
    }
    let self_differences = ctx.pipelines[id].differences;
    let mut new_parent = ctx.pipelines[id].link.parent();
    loop {
        let Some(candidate) = new_parent else { break };
        let Some(grandparent) = ctx.pipelines[candidate].link.parent() else {
            break;
        };
        if (ctx.pipelines[candidate].differences | self_differences) != self_differences {
            break;
        }
        new_parent = Some(grandparent);
    }
    if let Some(np) = new_parent {
        if Some(np) != ctx.pipelines[id].link.parent() {
            let strong = ctx.pipelines[id].link.has_parent_reference();
            set_parent(ctx, id, np, strong);
        }
    }
}

// ---------------------------------------------------------------------
// Structural comparison & hashing
// ---------------------------------------------------------------------

/// Flags controlling how strict per-group comparison is. Currently only
/// affects nothing of its own; reserved for callers layering stricter or
/// looser fragment-equality semantics on top of the group comparators.
pub type CompareFlags = u32;

fn ancestors(ctx: &Context, id: PipelineId) -> Vec<PipelineId> {
    let mut out = vec![id];
    let mut current = id;
    while let Some(p) = ctx.pipelines[current].link.parent() {
        out.push(p);
        current = p;
    }
    out
}

/// The union of `differences` from each of `a` and `b` up to (excluding)
/// their lowest common ancestor.
#[must_use]
pub fn compare_differences(ctx: &Context, a: PipelineId, b: PipelineId) -> PipelineDiff {
    if a == b {
        return PipelineDiff::empty();
    }
    let chain_a = ancestors(ctx, a);
    let chain_b = ancestors(ctx, b);
    let mut ia = chain_a.len();
    let mut ib = chain_b.len();
    while ia > 0 && ib > 0 && chain_a[ia - 1] == chain_b[ib - 1] {
        ia -= 1;
        ib -= 1;
    }
    let mut mask = PipelineDiff::empty();
    for &node in &chain_a[..ia] {
        mask |= ctx.pipelines[node].differences;
    }
    for &node in &chain_b[..ib] {
        mask |= ctx.pipelines[node].differences;
    }
    mask
}

/// Structural equality of two pipelines modulo `state_mask` (pipeline
/// groups) and `layer_state_mask` (per-layer groups). `_flags` is
/// forwarded to nothing yet; reserved for stricter/looser comparators.
#[must_use]
pub fn equal(
    ctx: &mut Context,
    a: PipelineId,
    b: PipelineId,
    state_mask: PipelineDiff,
    layer_state_mask: LayerDiff,
    _flags: CompareFlags,
) -> bool {
    if a == b {
        return true;
    }
    if ctx.pipelines[a].real_blend_enable != ctx.pipelines[b].real_blend_enable {
        return false;
    }

    let diff = compare_differences(ctx, a, b) & state_mask;
    for group in diff.iter() {
        let authority_a = authority(ctx, a, group);
        let authority_b = authority(ctx, b, group);
        let matches = match group {
            PipelineDiff::COLOR => ctx.pipelines[authority_a].color == ctx.pipelines[authority_b].color,
            PipelineDiff::BLEND_ENABLE => {
                ctx.pipelines[authority_a].blend_enable == ctx.pipelines[authority_b].blend_enable
            }
            PipelineDiff::ALPHA_FUNC => {
                ctx.pipelines[authority_a].alpha_func == ctx.pipelines[authority_b].alpha_func
            }
            PipelineDiff::ALPHA_FUNC_REFERENCE => {
                ctx.pipelines[authority_a].alpha_reference_bits
                    == ctx.pipelines[authority_b].alpha_reference_bits
            }
            PipelineDiff::LAYERS => {
                let layers_a = layers_cache(ctx, authority_a).to_vec();
                let layers_b = layers_cache(ctx, authority_b).to_vec();
                layers_a.len() == layers_b.len()
                    && layers_a
                        .iter()
                        .zip(layers_b.iter())
                        .all(|(&la, &lb)| layer::equal(&ctx.layers, la, lb, layer_state_mask))
            }
            _ if PipelineDiff::NEEDS_BIG_STATE.contains(group) => {
                let (Some(abs), Some(bbs)) =
                    (&ctx.pipelines[authority_a].big_state, &ctx.pipelines[authority_b].big_state)
                else {
                    return false;
                };
                match group {
                    PipelineDiff::LIGHTING => abs.lighting == bbs.lighting,
                    PipelineDiff::BLEND => abs.blend == bbs.blend,
                    PipelineDiff::DEPTH => abs.depth == bbs.depth,
                    PipelineDiff::FOG => abs.fog == bbs.fog,
                    PipelineDiff::CULL_FACE => abs.cull_face == bbs.cull_face,
                    PipelineDiff::LOGIC_OPS => abs.logic_op == bbs.logic_op,
                    PipelineDiff::USER_SHADER => abs.user_shader == bbs.user_shader,
                    PipelineDiff::POINT_SIZE => abs.point_size_bits == bbs.point_size_bits,
                    _ => true,
                }
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
pub fn hash(
    ctx: &mut Context,
    id: PipelineId,
    state_mask: PipelineDiff,
    layer_state_mask: LayerDiff,
    hasher: &mut rustc_hash::FxHasher,
) {
    use std::hash::Hash;
    ctx.pipelines[id].real_blend_enable.hash(hasher);

    for (group, authority_id) in authorities_for(ctx, id, state_mask) {
        let node = &ctx.pipelines[authority_id];
        match group {
            PipelineDiff::COLOR => node.color.hash(hasher),
            PipelineDiff::BLEND_ENABLE => node.blend_enable.hash(hasher),
            PipelineDiff::ALPHA_FUNC => node.alpha_func.hash(hasher),
            PipelineDiff::ALPHA_FUNC_REFERENCE => node.alpha_reference_bits.hash(hasher),
            PipelineDiff::LAYERS => {
                let n = node.n_layers;
                n.hash(hasher);
                let layers = layers_cache(ctx, authority_id).to_vec();
                for l in layers {
                    layer::hash(&ctx.layers, l, layer_state_mask, hasher);
                }
            }
            _ if PipelineDiff::NEEDS_BIG_STATE.contains(group) => {
                if let Some(b) = &node.big_state {
                    match group {
                        PipelineDiff::LIGHTING => b.lighting.hash(hasher),
                        PipelineDiff::BLEND => b.blend.hash(hasher),
                        PipelineDiff::DEPTH => b.depth.hash(hasher),
                        PipelineDiff::FOG => b.fog.hash(hasher),
                        PipelineDiff::CULL_FACE => b.cull_face.hash(hasher),
                        PipelineDiff::LOGIC_OPS => b.logic_op.hash(hasher),
                        PipelineDiff::USER_SHADER => b.user_shader.hash(hasher),
                        PipelineDiff::POINT_SIZE => b.point_size_bits.hash(hasher),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------
// Getters
// ---------------------------------------------------------------------

#[must_use]
pub fn get_color(ctx: &Context, id: PipelineId) -> Color {
    ctx.pipelines[authority(ctx, id, PipelineDiff::COLOR)].color
}

#[must_use]
pub fn get_blend_enable(ctx: &Context, id: PipelineId) -> BlendEnableState {
    ctx.pipelines[authority(ctx, id, PipelineDiff::BLEND_ENABLE)].blend_enable
}

#[must_use]
pub fn real_blend_enable(ctx: &Context, id: PipelineId) -> bool {
    ctx.pipelines[id].real_blend_enable
}

#[must_use]
pub fn get_blend(ctx: &Context, id: PipelineId) -> BlendState {
    ctx.pipelines[authority(ctx, id, PipelineDiff::BLEND)]
        .big_state
        .as_ref()
        .expect("blend authority must carry big_state")
        .blend
}

#[must_use]
pub fn get_point_size(ctx: &Context, id: PipelineId) -> f32 {
    ctx.pipelines[authority(ctx, id, PipelineDiff::POINT_SIZE)]
        .big_state
        .as_ref()
        .expect("point-size authority must carry big_state")
        .point_size()
}

#[must_use]
pub fn get_n_layers(ctx: &Context, id: PipelineId) -> u32 {
    ctx.pipelines[authority(ctx, id, PipelineDiff::LAYERS)].n_layers
}

#[must_use]
pub fn get_lighting(ctx: &Context, id: PipelineId) -> LightingState {
    ctx.pipelines[authority(ctx, id, PipelineDiff::LIGHTING)]
        .big_state
        .as_ref()
        .expect("lighting authority must carry big_state")
        .lighting
}

#[must_use]
pub fn get_depth(ctx: &Context, id: PipelineId) -> DepthState {
    ctx.pipelines[authority(ctx, id, PipelineDiff::DEPTH)]
        .big_state
        .as_ref()
        .expect("depth authority must carry big_state")
        .depth
}

#[must_use]
pub fn get_fog(ctx: &Context, id: PipelineId) -> FogState {
    ctx.pipelines[authority(ctx, id, PipelineDiff::FOG)]
        .big_state
        .as_ref()
        .expect("fog authority must carry big_state")
        .fog
}

#[must_use]
pub fn get_cull_face(ctx: &Context, id: PipelineId) -> CullFaceMode {
    ctx.pipelines[authority(ctx, id, PipelineDiff::CULL_FACE)]
        .big_state
        .as_ref()
        .expect("cull-face authority must carry big_state")
        .cull_face
}

#[must_use]
pub fn get_logic_op(ctx: &Context, id: PipelineId) -> LogicOp {
    ctx.pipelines[authority(ctx, id, PipelineDiff::LOGIC_OPS)]
        .big_state
        .as_ref()
        .expect("logic-op authority must carry big_state")
        .logic_op
}

#[must_use]
pub fn get_user_shader(ctx: &Context, id: PipelineId) -> Option<UserShaderId> {
    ctx.pipelines[authority(ctx, id, PipelineDiff::USER_SHADER)]
        .big_state
        .as_ref()
        .expect("user-shader authority must carry big_state")
        .user_shader
}

// ---------------------------------------------------------------------
// Setters
// ---------------------------------------------------------------------

pub fn set_color(ctx: &mut Context, id: PipelineId, color: Color) {
    pre_change_notify(ctx, id, PipelineDiff::COLOR, Some(color), false);
    take_over_group(ctx, id, authority(ctx, id, PipelineDiff::COLOR), PipelineDiff::COLOR);
    ctx.pipelines[id].differences.insert(PipelineDiff::COLOR);
    ctx.pipelines[id].color = color;
    ctx.pipelines[id].age += 1;
    update_authority(ctx, id, PipelineDiff::COLOR);
    update_real_blend_enable(ctx, id);
}

pub fn set_blend_enable(ctx: &mut Context, id: PipelineId, value: BlendEnableState) {
    pre_change_notify(ctx, id, PipelineDiff::BLEND_ENABLE, None, false);
    ctx.pipelines[id].differences.insert(PipelineDiff::BLEND_ENABLE);
    ctx.pipelines[id].blend_enable = value;
    ctx.pipelines[id].age += 1;
    update_authority(ctx, id, PipelineDiff::BLEND_ENABLE);
    update_real_blend_enable(ctx, id);
}

pub fn set_blend(ctx: &mut Context, id: PipelineId, blend: BlendState) {
    pre_change_notify(ctx, id, PipelineDiff::BLEND, None, false);
    take_over_group(ctx, id, authority(ctx, id, PipelineDiff::BLEND), PipelineDiff::BLEND);
    ctx.pipelines[id].differences.insert(PipelineDiff::BLEND);
    ctx.pipelines[id].big_state.as_mut().expect("big_state ensured").blend = blend;
    ctx.pipelines[id].age += 1;
    update_authority(ctx, id, PipelineDiff::BLEND);
    update_real_blend_enable(ctx, id);
}

pub fn set_alpha_func(ctx: &mut Context, id: PipelineId, func: AlphaFunc) {
    pre_change_notify(ctx, id, PipelineDiff::ALPHA_FUNC, None, false);
    ctx.pipelines[id].differences.insert(PipelineDiff::ALPHA_FUNC);
    ctx.pipelines[id].alpha_func = func;
    ctx.pipelines[id].age += 1;
    update_authority(ctx, id, PipelineDiff::ALPHA_FUNC);
}

pub fn set_alpha_reference(ctx: &mut Context, id: PipelineId, reference: f32) {
    pre_change_notify(ctx, id, PipelineDiff::ALPHA_FUNC_REFERENCE, None, false);
    ctx.pipelines[id].differences.insert(PipelineDiff::ALPHA_FUNC_REFERENCE);
    ctx.pipelines[id].alpha_reference_bits = reference.to_bits();
    ctx.pipelines[id].age += 1;
    update_authority(ctx, id, PipelineDiff::ALPHA_FUNC_REFERENCE);
}

pub fn set_point_size(ctx: &mut Context, id: PipelineId, size: f32) {
    pre_change_notify(ctx, id, PipelineDiff::POINT_SIZE, None, false);
    take_over_group(ctx, id, authority(ctx, id, PipelineDiff::POINT_SIZE), PipelineDiff::POINT_SIZE);
    ctx.pipelines[id].differences.insert(PipelineDiff::POINT_SIZE);
    ctx.pipelines[id].big_state.as_mut().expect("big_state ensured").point_size_bits = size.to_bits();
    ctx.pipelines[id].age += 1;
    update_authority(ctx, id, PipelineDiff::POINT_SIZE);
}

pub fn set_user_shader(ctx: &mut Context, id: PipelineId, shader: Option<UserShaderId>) {
    pre_change_notify(ctx, id, PipelineDiff::USER_SHADER, None, false);
    take_over_group(ctx, id, authority(ctx, id, PipelineDiff::USER_SHADER), PipelineDiff::USER_SHADER);
    ctx.pipelines[id].differences.insert(PipelineDiff::USER_SHADER);
    ctx.pipelines[id].big_state.as_mut().expect("big_state ensured").user_shader = shader;
    ctx.pipelines[id].age += 1;
    update_authority(ctx, id, PipelineDiff::USER_SHADER);
    update_real_blend_enable(ctx, id);
}

pub fn set_lighting(ctx: &mut Context, id: PipelineId, lighting: LightingState) {
    pre_change_notify(ctx, id, PipelineDiff::LIGHTING, None, false);
    take_over_group(ctx, id, authority(ctx, id, PipelineDiff::LIGHTING), PipelineDiff::LIGHTING);
    ctx.pipelines[id].differences.insert(PipelineDiff::LIGHTING);
    ctx.pipelines[id].big_state.as_mut().expect("big_state ensured").lighting = lighting;
    ctx.pipelines[id].age += 1;
    update_authority(ctx, id, PipelineDiff::LIGHTING);
}

pub fn set_depth(ctx: &mut Context, id: PipelineId, depth: DepthState) {
    pre_change_notify(ctx, id, PipelineDiff::DEPTH, None, false);
    take_over_group(ctx, id, authority(ctx, id, PipelineDiff::DEPTH), PipelineDiff::DEPTH);
    ctx.pipelines[id].differences.insert(PipelineDiff::DEPTH);
    ctx.pipelines[id].big_state.as_mut().expect("big_state ensured").depth = depth;
    ctx.pipelines[id].age += 1;
    update_authority(ctx, id, PipelineDiff::DEPTH);
}

pub fn set_fog(ctx: &mut Context, id: PipelineId, fog: FogState) {
    pre_change_notify(ctx, id, PipelineDiff::FOG, None, false);
    take_over_group(ctx, id, authority(ctx, id, PipelineDiff::FOG), PipelineDiff::FOG);
    ctx.pipelines[id].differences.insert(PipelineDiff::FOG);
    ctx.pipelines[id].big_state.as_mut().expect("big_state ensured").fog = fog;
    ctx.pipelines[id].age += 1;
    update_authority(ctx, id, PipelineDiff::FOG);
}

pub fn set_cull_face(ctx: &mut Context, id: PipelineId, cull_face: CullFaceMode) {
    pre_change_notify(ctx, id, PipelineDiff::CULL_FACE, None, false);
    take_over_group(ctx, id, authority(ctx, id, PipelineDiff::CULL_FACE), PipelineDiff::CULL_FACE);
    ctx.pipelines[id].differences.insert(PipelineDiff::CULL_FACE);
    ctx.pipelines[id].big_state.as_mut().expect("big_state ensured").cull_face = cull_face;
    ctx.pipelines[id].age += 1;
    update_authority(ctx, id, PipelineDiff::CULL_FACE);
}

pub fn set_logic_op(ctx: &mut Context, id: PipelineId, logic_op: LogicOp) {
    pre_change_notify(ctx, id, PipelineDiff::LOGIC_OPS, None, false);
    take_over_group(ctx, id, authority(ctx, id, PipelineDiff::LOGIC_OPS), PipelineDiff::LOGIC_OPS);
    ctx.pipelines[id].differences.insert(PipelineDiff::LOGIC_OPS);
    ctx.pipelines[id].big_state.as_mut().expect("big_state ensured").logic_op = logic_op;
    ctx.pipelines[id].age += 1;
    update_authority(ctx, id, PipelineDiff::LOGIC_OPS);
}

// ---------------------------------------------------------------------
// journal bracketing
// ---------------------------------------------------------------------

pub fn journal_ref(ctx: &mut Context, id: PipelineId) {
    ctx.pipelines[id].journal_ref_count += 1;
}

pub fn journal_unref(ctx: &mut Context, id: PipelineId) {
    debug_assert!(ctx.pipelines[id].journal_ref_count > 0);
    ctx.pipelines[id].journal_ref_count -= 1;
}

// ---------------------------------------------------------------------
// Layer operations (§4.6)
// ---------------------------------------------------------------------

/// Finds the layer at logical `index`, creating it from the appropriate
/// default template if it doesn't exist yet.
pub fn get_layer(ctx: &mut Context, id: PipelineId, index: u32) -> LayerId {
    let authority_id = authority(ctx, id, PipelineDiff::LAYERS);
    let cache = layers_cache(ctx, authority_id).to_vec();
    if let Some(existing) = cache.iter().find(|&&l| ctx.layers[l].index == index) {
        return *existing;
    }

    let mut unit = 0usize;
    for &l in &cache {
        if ctx.layers[l].index < index {
            unit += 1;
        } else {
            break;
        }
    }
    let template = if unit == 0 { ctx.default_layer_0 } else { ctx.default_layer_n };
    let new_layer = layer::copy(&mut ctx.layers, template);
    ctx.layers[new_layer].index = index;
    set_layer_unit_index(ctx, new_layer, unit as u32);

    pre_change_notify(ctx, id, PipelineDiff::LAYERS, None, false);
    take_over_group(ctx, id, authority(ctx, id, PipelineDiff::LAYERS), PipelineDiff::LAYERS);
    for &l in &cache {
        let li_unit = layer::unit_index(&ctx.layers, l);
        if li_unit >= unit as u32 {
            // `l` may still be owned by an ancestor and shared with other
            // pipelines; ensure_layer_mutable derives a copy owned by `id`
            // before its unit index is bumped in place.
            let shifted = ensure_layer_mutable(ctx, id, l);
            set_layer_unit_index(ctx, shifted, li_unit + 1);
        }
    }
    ctx.pipelines[id].n_layers += 1;
    add_layer_difference(ctx, id, new_layer);
    ctx.pipelines[id].differences.insert(PipelineDiff::LAYERS);
    invalidate_layer_caches_recursively(ctx, id);
    ctx.pipelines[id].age += 1;
    update_real_blend_enable(ctx, id);
    new_layer
}

/// Removes the layer at logical `index`.
pub fn remove_layer(ctx: &mut Context, id: PipelineId, index: u32) {
    let authority_id = authority(ctx, id, PipelineDiff::LAYERS);
    let cache = layers_cache(ctx, authority_id).to_vec();
    let Some(pos) = cache.iter().position(|&l| ctx.layers[l].index == index) else {
        return;
    };
    let removed = cache[pos];
    let removed_unit = layer::unit_index(&ctx.layers, removed);

    pre_change_notify(ctx, id, PipelineDiff::LAYERS, None, false);
    take_over_group(ctx, id, authority(ctx, id, PipelineDiff::LAYERS), PipelineDiff::LAYERS);
    for &l in &cache {
        let li_unit = layer::unit_index(&ctx.layers, l);
        if li_unit > removed_unit {
            let shifted = ensure_layer_mutable(ctx, id, l);
            set_layer_unit_index(ctx, shifted, li_unit - 1);
        }
    }
    if let Some(owner) = ctx.layers[removed].owner {
        if owner == id {
            remove_layer_difference(ctx, id, removed);
        }
    }
    ctx.pipelines[id].n_layers -= 1;
    ctx.pipelines[id].differences.insert(PipelineDiff::LAYERS);
    invalidate_layer_caches_recursively(ctx, id);
    ctx.pipelines[id].age += 1;
    update_authority(ctx, id, PipelineDiff::LAYERS);
    update_real_blend_enable(ctx, id);
}

/// Clamps `id`'s effective layer count to `n`, dropping any owned layer
/// differences beyond the `n`-th remaining index.
pub fn prune_to_n_layers(ctx: &mut Context, id: PipelineId, n: u32) {
    let authority_id = authority(ctx, id, PipelineDiff::LAYERS);
    if ctx.pipelines[authority_id].n_layers <= n {
        return;
    }
    let cache = layers_cache(ctx, authority_id).to_vec();

    pre_change_notify(ctx, id, PipelineDiff::LAYERS, None, false);
    take_over_group(ctx, id, authority(ctx, id, PipelineDiff::LAYERS), PipelineDiff::LAYERS);
    for &l in cache.iter().skip(n as usize) {
        if ctx.layers[l].owner == Some(id) {
            remove_layer_difference(ctx, id, l);
        }
    }
    ctx.pipelines[id].n_layers = n;
    ctx.pipelines[id].differences.insert(PipelineDiff::LAYERS);
    invalidate_layer_caches_recursively(ctx, id);
    ctx.pipelines[id].age += 1;
    update_authority(ctx, id, PipelineDiff::LAYERS);
    update_real_blend_enable(ctx, id);
}

/// Forces `layer` to be its own `UNIT` authority with the given value.
/// Callers must pass a layer already known to be uniquely owned and
/// child-free — either a freshly-copied leaf or the result of
/// `ensure_layer_mutable` — since this never forks off a copy-on-write
/// branch itself.
fn set_layer_unit_index(ctx: &mut Context, layer: LayerId, unit: u32) {
    ctx.layers[layer].unit_index = unit;
    ctx.layers[layer].differences.insert(LayerDiff::UNIT);
}

fn add_layer_difference(ctx: &mut Context, owner: PipelineId, layer: LayerId) {
    debug_assert!(ctx.layers[layer].owner.is_none());
    ctx.layers[layer].owner = Some(owner);
    ctx.pipelines[owner].layer_differences.push(layer);
}

fn remove_layer_difference(ctx: &mut Context, owner: PipelineId, layer: LayerId) {
    debug_assert_eq!(ctx.layers[layer].owner, Some(owner));
    ctx.layers[layer].owner = None;
    ctx.pipelines[owner].layer_differences.retain(|&l| l != layer);
    node::unreference(&mut ctx.layers, layer, &mut ());
}

/// Ensures `layer` is uniquely owned by `required_owner` and free to
/// mutate, copying it first if it has dependents of its own or a
/// different owner. Returns the (possibly new) layer id to write to.
pub fn ensure_layer_mutable(ctx: &mut Context, required_owner: PipelineId, layer: LayerId) -> LayerId {
    let has_children = !ctx.layers[layer].link().children().is_empty();
    let owner = ctx.layers[layer].owner;
    if !has_children && owner.is_none() {
        return layer;
    }

    pre_change_notify(ctx, required_owner, PipelineDiff::LAYERS, None, true);

    if has_children || owner != Some(required_owner) {
        let new_layer = layer::copy(&mut ctx.layers, layer);
        ctx.layers[new_layer].index = ctx.layers[layer].index;
        if owner == Some(required_owner) {
            remove_layer_difference(ctx, required_owner, layer);
        }
        add_layer_difference(ctx, required_owner, new_layer);
        for backend in ctx.fragend_backends.iter() {
            backend.layer_pre_change_notify(required_owner, new_layer, LayerDiff::all().bits());
        }
        invalidate_layer_caches_recursively(ctx, required_owner);
        return new_layer;
    }
    for backend in ctx.fragend_backends.iter() {
        backend.layer_pre_change_notify(required_owner, layer, LayerDiff::all().bits());
    }
    layer
}

fn ensure_layer_big_state(ctx: &mut Context, layer: LayerId) {
    if ctx.layers[layer].big_state.is_none() {
        ctx.layers[layer].big_state = Some(Box::new(layer::LayerBigState::default()));
    }
}

/// Sets the texture bound to `layer`, copying `layer` first if it is
/// shared. Returns the (possibly new) layer id, which callers must use for
/// any further mutation.
pub fn set_layer_texture(ctx: &mut Context, owner: PipelineId, layer: LayerId, texture: Option<Rc<dyn Texture>>) -> LayerId {
    let layer = ensure_layer_mutable(ctx, owner, layer);
    ctx.layers[layer].differences.insert(LayerDiff::TEXTURE_DATA);
    ctx.layers[layer].texture = texture;
    update_real_blend_enable(ctx, owner);
    layer
}

pub fn set_layer_texture_target(ctx: &mut Context, owner: PipelineId, layer: LayerId, target: TextureTarget) -> LayerId {
    let layer = ensure_layer_mutable(ctx, owner, layer);
    ctx.layers[layer].differences.insert(LayerDiff::TEXTURE_TARGET);
    ctx.layers[layer].texture_target = target;
    layer
}

pub fn set_layer_filters(ctx: &mut Context, owner: PipelineId, layer: LayerId, min: Filter, mag: Filter) -> LayerId {
    let layer = ensure_layer_mutable(ctx, owner, layer);
    ctx.layers[layer].differences.insert(LayerDiff::FILTERS);
    ctx.layers[layer].min_filter = min;
    ctx.layers[layer].mag_filter = mag;
    layer
}

pub fn set_layer_wrap_modes(ctx: &mut Context, owner: PipelineId, layer: LayerId, modes: [WrapMode; 3]) -> LayerId {
    let layer = ensure_layer_mutable(ctx, owner, layer);
    ctx.layers[layer].differences.insert(LayerDiff::WRAP_MODES);
    ctx.layers[layer].wrap_modes = modes;
    layer
}

pub fn set_layer_combine(ctx: &mut Context, owner: PipelineId, layer: LayerId, combine: CombineFunction) -> LayerId {
    let layer = ensure_layer_mutable(ctx, owner, layer);
    ensure_layer_big_state(ctx, layer);
    ctx.layers[layer].differences.insert(LayerDiff::COMBINE);
    ctx.layers[layer].big_state.as_mut().expect("big_state ensured").combine = combine;
    update_real_blend_enable(ctx, owner);
    layer
}

/// Only meaningful when the effective combine function's rgb op is
/// `Interpolate` or `AddSigned`; harmless to set otherwise, matching the
/// way combine-constant is conditionally hashed and compared.
pub fn set_layer_combine_constant(ctx: &mut Context, owner: PipelineId, layer: LayerId, constant: Color) -> LayerId {
    let layer = ensure_layer_mutable(ctx, owner, layer);
    ensure_layer_big_state(ctx, layer);
    ctx.layers[layer].differences.insert(LayerDiff::COMBINE_CONSTANT);
    ctx.layers[layer].big_state.as_mut().expect("big_state ensured").combine_constant = constant;
    layer
}

pub fn set_layer_user_matrix(ctx: &mut Context, owner: PipelineId, layer: LayerId, matrix: Mat4) -> LayerId {
    let layer = ensure_layer_mutable(ctx, owner, layer);
    ensure_layer_big_state(ctx, layer);
    ctx.layers[layer].differences.insert(LayerDiff::USER_MATRIX);
    ctx.layers[layer].big_state.as_mut().expect("big_state ensured").user_matrix = matrix;
    layer
}

pub fn set_layer_point_sprite_coords(ctx: &mut Context, owner: PipelineId, layer: LayerId, coords: PointSpriteCoords) -> LayerId {
    let layer = ensure_layer_mutable(ctx, owner, layer);
    ensure_layer_big_state(ctx, layer);
    ctx.layers[layer].differences.insert(LayerDiff::POINT_SPRITE_COORDS);
    ctx.layers[layer].big_state.as_mut().expect("big_state ensured").point_sprite_coords = coords;
    layer
}
