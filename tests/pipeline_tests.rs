//! Pipeline Integration Tests
//!
//! Tests for:
//! - Blend-enable derivation from color, layers and user shaders
//! - Copy-on-write isolation between a pipeline and its copies
//! - Layer insertion shifting existing unit indices
//! - Redundant-ancestry pruning after a mutation reverts to the default
//! - Weak-copy destruction when the pipeline it shadows mutates
//! - Structural equality and hashing under a state mask

use std::cell::Cell;
use std::hash::Hasher;
use std::rc::Rc;

use pipeline_graph::{Color, Context, PipelineDiff};
use pipeline_graph::{layer, pipeline};

fn new_ctx() -> Context {
    Context::new()
}

#[test]
fn blend_automatic_becomes_enabled_on_translucent_color() {
    let mut ctx = new_ctx();
    let p = pipeline::new(&mut ctx);

    assert_eq!(pipeline::get_color(&ctx, p), Color::WHITE);
    assert!(!pipeline::real_blend_enable(&ctx, p));

    pipeline::set_color(&mut ctx, p, Color::new(255, 255, 255, 0x80));
    assert!(pipeline::real_blend_enable(&ctx, p));

    // A freshly-created, default-opaque layer (no texture, default
    // combine) doesn't change the picture either way.
    pipeline::get_layer(&mut ctx, p, 0);
    assert!(pipeline::real_blend_enable(&ctx, p));

    pipeline::set_color(&mut ctx, p, Color::WHITE);
    assert!(!pipeline::real_blend_enable(&ctx, p));
}

#[test]
fn copy_on_write_isolates_a_pipeline_from_its_copy() {
    let mut ctx = new_ctx();
    let p = pipeline::new(&mut ctx);
    let c = pipeline::copy(&mut ctx, p);
    let c_parent_before = ctx.pipelines()[c].link().parent();
    assert_eq!(c_parent_before, Some(p));

    pipeline::set_color(&mut ctx, p, Color::new(255, 0, 0, 255));

    assert_eq!(pipeline::get_color(&ctx, c), Color::WHITE);
    assert_eq!(pipeline::get_color(&ctx, p), Color::new(255, 0, 0, 255));

    // `p` kept mutating in place; the snapshot `c` depended on was forked
    // off as a brand new node, so `c`'s parent moved off `p` entirely.
    let c_parent_after = ctx.pipelines()[c].link().parent();
    assert_ne!(c_parent_after, Some(p));
}

#[test]
fn inserting_a_layer_shifts_unit_indices_of_higher_ones() {
    let mut ctx = new_ctx();
    let p = pipeline::new(&mut ctx);

    pipeline::get_layer(&mut ctx, p, 5);
    pipeline::get_layer(&mut ctx, p, 10);

    let l10 = pipeline::get_layer(&mut ctx, p, 10);
    assert_eq!(layer::unit_index(ctx.layers(), l10), 1);

    let l7 = pipeline::get_layer(&mut ctx, p, 7);
    assert_eq!(layer::unit_index(ctx.layers(), l7), 1);
    assert_eq!(layer::unit_index(ctx.layers(), l10), 2);

    let mut indices = Vec::new();
    pipeline::foreach_layer(&mut ctx, p, |_ctx, _p, index| indices.push(index));
    assert_eq!(indices, vec![5, 7, 10]);

    let mut units = Vec::new();
    for &index in &indices {
        let l = pipeline::get_layer(&mut ctx, p, index);
        units.push(layer::unit_index(ctx.layers(), l));
    }
    assert_eq!(units, vec![0, 1, 2]);
    assert_eq!(pipeline::get_n_layers(&ctx, p), 3);
}

#[test]
fn setting_color_back_to_the_default_prunes_redundant_ancestry() {
    let mut ctx = new_ctx();
    let default_pipeline = ctx.default_pipeline;

    // root is an empty-differences snapshot between the default pipeline
    // and child; child's color mutation reparents it past root once root
    // no longer contributes anything child doesn't already own.
    let root = pipeline::new(&mut ctx);
    let child = pipeline::copy(&mut ctx, root);

    pipeline::set_color(&mut ctx, child, Color::new(255, 0, 0, 255));
    assert_eq!(ctx.pipelines()[child].link().parent(), Some(default_pipeline));

    pipeline::set_color(&mut ctx, child, Color::WHITE);

    assert_eq!(pipeline::get_color(&ctx, child), Color::WHITE);
    assert_eq!(ctx.pipelines()[child].link().parent(), Some(default_pipeline));
}

#[test]
fn mutating_a_pipeline_destroys_its_weak_copies() {
    let mut ctx = new_ctx();
    let p = pipeline::new(&mut ctx);

    let fired = Rc::new(Cell::new(0u32));
    let fired_clone = fired.clone();
    let wc = pipeline::weak_copy(&mut ctx, p, Box::new(move |_id| fired_clone.set(fired_clone.get() + 1)));
    assert_eq!(ctx.pipelines()[wc].link().parent(), Some(p));

    pipeline::set_color(&mut ctx, p, Color::new(0, 0, 0, 255));

    assert_eq!(fired.get(), 1);
    assert!(ctx.pipelines()[wc].link().parent().is_none());
}

#[test]
fn equality_respects_the_state_mask() {
    let mut ctx = new_ctx();
    let p0 = pipeline::new(&mut ctx);
    let p1 = pipeline::new(&mut ctx);
    pipeline::set_point_size(&mut ctx, p1, 4.0);

    let full_mask = PipelineDiff::ALL_SPARSE;
    let without_point_size = PipelineDiff::ALL_SPARSE.difference(PipelineDiff::POINT_SIZE);
    let layer_mask = layer::LayerDiff::ALL_SPARSE;

    assert!(!pipeline::equal(&mut ctx, p0, p1, full_mask, layer_mask, 0));
    assert!(pipeline::equal(&mut ctx, p0, p1, without_point_size, layer_mask, 0));

    let mut h0 = rustc_hash::FxHasher::default();
    let mut h1 = rustc_hash::FxHasher::default();
    pipeline::hash(&mut ctx, p0, without_point_size, layer_mask, &mut h0);
    pipeline::hash(&mut ctx, p1, without_point_size, layer_mask, &mut h1);
    assert_eq!(h0.finish(), h1.finish());
}

#[test]
fn add_then_remove_layer_restores_layer_count() {
    let mut ctx = new_ctx();
    let p = pipeline::new(&mut ctx);

    pipeline::get_layer(&mut ctx, p, 0);
    assert_eq!(pipeline::get_n_layers(&ctx, p), 1);

    pipeline::remove_layer(&mut ctx, p, 0);
    assert_eq!(pipeline::get_n_layers(&ctx, p), 0);
}
