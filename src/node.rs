//! The generic tree-node substrate shared by the pipeline tree and the
//! layer tree.
//!
//! Both trees are structurally identical — a parent link, an intrusive
//! child list, a reference count and a strong/weak edge flag — and differ
//! only in payload. Rather than model that with a common base type reached
//! through runtime polymorphism, [`NodeLink`] is a plain field embedded in
//! each payload type, keyed by the arena's own `slotmap` key type, and the
//! [`GraphNode`] trait exposes it to the free functions below. Child links
//! are slotmap keys rather than pointers, so reparenting during
//! copy-on-write is an index rewrite, not a pointer-stability concern.
//!
//! A node that needs cross-arena cleanup when it is finally torn down (a
//! pipeline releasing the layers it owns, say) gets that through
//! [`GraphNode::Aux`]: an auxiliary value — typically a `&mut` borrow of
//! the other arena — threaded through every call that might cascade into a
//! removal.

use slotmap::{Key, SlotMap};
use smallvec::SmallVec;

/// Parent/child linkage and reference-count bookkeeping for one node.
#[derive(Debug)]
pub struct NodeLink<K: Key> {
    parent: Option<K>,
    children: Vec<K>,
    ref_count: u32,
    /// Whether the edge to `parent` is strong (counts toward its refcount).
    has_parent_reference: bool,
}

impl<K: Key> NodeLink<K> {
    /// A fresh, unparented link with one reference — the one returned to
    /// whoever constructs the node.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parent: None,
            children: Vec::new(),
            ref_count: 1,
            has_parent_reference: false,
        }
    }

    #[must_use]
    pub fn parent(&self) -> Option<K> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[K] {
        &self.children
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    #[must_use]
    pub fn has_parent_reference(&self) -> bool {
        self.has_parent_reference
    }

    /// This node's own edge to its parent is weak. Note this is not the
    /// same as *effectively* weak — see [`effective_is_weak`].
    #[must_use]
    pub fn is_weak(&self) -> bool {
        self.parent.is_some() && !self.has_parent_reference
    }
}

impl<K: Key> Default for NodeLink<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> Clone for NodeLink<K> {
    fn clone(&self) -> Self {
        Self {
            parent: self.parent,
            children: self.children.clone(),
            ref_count: self.ref_count,
            has_parent_reference: self.has_parent_reference,
        }
    }
}

/// A payload type stored in a `slotmap` arena, participating in the shared
/// parent/child/refcount protocol.
pub trait GraphNode<K: Key>: Sized {
    /// Extra state threaded through teardown, for cleanup that reaches
    /// outside this node's own arena (e.g. a pipeline unreferencing the
    /// layers in its `layer_differences`). Use `()` if none is needed.
    type Aux;

    fn link(&self) -> &NodeLink<K>;
    fn link_mut(&mut self) -> &mut NodeLink<K>;

    /// The core has decided to forcibly destroy this node because it is a
    /// weak child of a node that is mutating or freeing. Its own reference
    /// count is untouched; this is the caller's cue to drop whatever
    /// reference it is separately holding. `id` is this node's own key, for
    /// hooks that need to report which node was destroyed.
    fn on_weak_destroy(&mut self, _id: K, _aux: &mut Self::Aux) {}

    /// This node's reference count has just reached zero. Called after its
    /// weak children have been torn down and before it is removed from the
    /// arena and its (strong) parent reference released.
    fn on_teardown(&mut self, _id: K, _aux: &mut Self::Aux) {}
}

/// Unconditionally acquires a reference on `id`.
pub fn reference<K: Key, T: GraphNode<K>>(arena: &mut SlotMap<K, T>, id: K) {
    if let Some(node) = arena.get_mut(id) {
        node.link_mut().ref_count += 1;
    }
}

/// Releases a reference on `id`, tearing it down if that was the last one.
pub fn unreference<K: Key, T: GraphNode<K>>(arena: &mut SlotMap<K, T>, id: K, aux: &mut T::Aux) {
    let reached_zero = {
        let Some(node) = arena.get_mut(id) else {
            return;
        };
        let link = node.link_mut();
        debug_assert!(link.ref_count > 0, "unreference on a node with no references");
        link.ref_count -= 1;
        link.ref_count == 0
    };
    if reached_zero {
        teardown(arena, id, aux);
    }
}

/// True if any child of `id` holds a strong edge to it.
#[must_use]
pub fn has_strong_children<K: Key, T: GraphNode<K>>(arena: &SlotMap<K, T>, id: K) -> bool {
    let Some(node) = arena.get(id) else {
        return false;
    };
    node.link()
        .children
        .iter()
        .any(|&c| arena.get(c).is_some_and(|cn| cn.link().has_parent_reference()))
}

/// A node is *effectively* weak — safe to destroy rather than copy-on-write
/// around — only if its own edge is weak *and* none of its children force
/// it to remain, i.e. it has no strong children either.
#[must_use]
pub fn effective_is_weak<K: Key, T: GraphNode<K>>(arena: &SlotMap<K, T>, id: K) -> bool {
    arena.get(id).is_some_and(|n| n.link().is_weak()) && !has_strong_children(arena, id)
}

/// A point-in-time copy of `id`'s children, safe to iterate while the
/// callback mutates the tree.
#[must_use]
pub fn children_snapshot<K: Key, T: GraphNode<K>>(arena: &SlotMap<K, T>, id: K) -> SmallVec<[K; 4]> {
    arena
        .get(id)
        .map(|n| n.link().children.iter().copied().collect())
        .unwrap_or_default()
}

/// Invokes `f` once per child of `id`, safe against `f` adding or removing
/// children of `id` during the walk.
pub fn foreach_child<K: Key, T: GraphNode<K>>(arena: &SlotMap<K, T>, id: K, mut f: impl FnMut(K)) {
    for child in children_snapshot(arena, id) {
        f(child);
    }
}

/// Detaches `id` from its current parent, if any, releasing the reference
/// that edge held if it was strong (which may in turn tear down the
/// parent).
pub fn unparent<K: Key, T: GraphNode<K>>(arena: &mut SlotMap<K, T>, id: K, aux: &mut T::Aux) {
    let Some(parent) = arena.get(id).and_then(|n| n.link().parent) else {
        return;
    };
    if let Some(p) = arena.get_mut(parent) {
        p.link_mut().children.retain(|&c| c != id);
    }
    let was_strong = arena.get(id).is_some_and(|n| n.link().has_parent_reference());
    if let Some(node) = arena.get_mut(id) {
        let link = node.link_mut();
        link.parent = None;
        link.has_parent_reference = false;
    }
    if was_strong {
        unreference(arena, parent, aux);
    }
}

/// The set-parent protocol: acquire a reference on the new parent before
/// releasing the old one, so a parent that is only transitively kept alive
/// through the node being relinked never gets dropped mid-operation.
pub fn set_parent<K: Key, T: GraphNode<K>>(
    arena: &mut SlotMap<K, T>,
    id: K,
    new_parent: K,
    strong: bool,
    aux: &mut T::Aux,
) {
    reference(arena, new_parent);
    unparent(arena, id, aux);
    if let Some(p) = arena.get_mut(new_parent) {
        p.link_mut().children.push(id);
    }
    if let Some(node) = arena.get_mut(id) {
        let link = node.link_mut();
        link.parent = Some(new_parent);
        link.has_parent_reference = strong;
    }
    if !strong {
        unreference(arena, new_parent, aux);
    }
}

/// Forcibly tears down every weak child of `id`, recursing into each
/// child's own weak children first (a weak child of a weak child is
/// destroyed before its parent). Does not touch `id` itself.
pub fn destroy_weak_children<K: Key, T: GraphNode<K>>(arena: &mut SlotMap<K, T>, id: K, aux: &mut T::Aux) {
    let weak_children: SmallVec<[K; 4]> = children_snapshot(arena, id)
        .into_iter()
        .filter(|&c| arena.get(c).is_some_and(|n| n.link().is_weak()))
        .collect();
    for child in weak_children {
        destroy_weak_children(arena, child, aux);
        if let Some(node) = arena.get_mut(child) {
            node.on_weak_destroy(child, aux);
        }
        if let Some(p) = arena.get_mut(id) {
            p.link_mut().children.retain(|&c| c != child);
        }
        if let Some(node) = arena.get_mut(child) {
            node.link_mut().parent = None;
        }
    }
}

fn teardown<K: Key, T: GraphNode<K>>(arena: &mut SlotMap<K, T>, id: K, aux: &mut T::Aux) {
    destroy_weak_children(arena, id, aux);
    debug_assert!(
        !has_strong_children(arena, id),
        "destroying a node that still has strong children"
    );
    if let Some(node) = arena.get_mut(id) {
        node.on_teardown(id, aux);
    }
    let parent = arena.get(id).and_then(|n| n.link().parent);
    let was_strong = arena.get(id).is_some_and(|n| n.link().has_parent_reference());
    arena.remove(id);
    if let Some(p) = parent {
        if let Some(pn) = arena.get_mut(p) {
            pn.link_mut().children.retain(|&c| c != id);
        }
        if was_strong {
            unreference(arena, p, aux);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::new_key_type;

    new_key_type! { struct TestKey; }

    #[derive(Default)]
    struct TestNode {
        link: NodeLink<TestKey>,
        destroyed: Vec<TestKey>,
    }

    impl GraphNode<TestKey> for TestNode {
        type Aux = Vec<TestKey>;

        fn link(&self) -> &NodeLink<TestKey> {
            &self.link
        }

        fn link_mut(&mut self) -> &mut NodeLink<TestKey> {
            &mut self.link
        }

        fn on_weak_destroy(&mut self, id: TestKey, aux: &mut Self::Aux) {
            aux.push(id);
        }

        fn on_teardown(&mut self, id: TestKey, aux: &mut Self::Aux) {
            aux.push(id);
        }
    }

    #[test]
    fn new_node_starts_with_one_reference_and_no_parent() {
        let node = TestNode::default();
        assert_eq!(node.link().ref_count(), 1);
        assert!(node.link().parent().is_none());
        assert!(!node.link().is_weak());
    }

    #[test]
    fn strong_set_parent_then_unreference_tears_down_child_first() {
        let mut arena: SlotMap<TestKey, TestNode> = SlotMap::with_key();
        let mut log = Vec::new();
        let parent = arena.insert(TestNode::default());
        let child = arena.insert(TestNode::default());

        set_parent(&mut arena, child, parent, true, &mut log);
        assert_eq!(arena[parent].link().ref_count(), 2);

        unreference(&mut arena, child, &mut log);
        assert!(arena.get(child).is_none());
        assert_eq!(log, vec![child]);

        unreference(&mut arena, parent, &mut log);
        assert!(arena.get(parent).is_none());
    }

    #[test]
    fn releasing_the_last_strong_child_releases_the_parents_reference() {
        let mut arena: SlotMap<TestKey, TestNode> = SlotMap::with_key();
        let mut log = Vec::new();
        let parent = arena.insert(TestNode::default());
        let child = arena.insert(TestNode::default());
        set_parent(&mut arena, child, parent, true, &mut log);

        // The caller's own reference plus the child's strong edge keep
        // parent alive at 2; dropping the child must release both.
        unreference(&mut arena, parent, &mut log);
        assert!(arena.get(parent).is_some(), "still held by child's strong edge");

        unreference(&mut arena, child, &mut log);
        assert!(arena.get(parent).is_none());
    }

    #[test]
    fn weak_child_does_not_hold_its_parent_alive() {
        let mut arena: SlotMap<TestKey, TestNode> = SlotMap::with_key();
        let mut log = Vec::new();
        let parent = arena.insert(TestNode::default());
        let child = arena.insert(TestNode::default());
        set_parent(&mut arena, child, parent, false, &mut log);

        assert_eq!(arena[parent].link().ref_count(), 1);
        assert!(arena[child].link().is_weak());

        // Tearing down the parent forcibly notifies its weak child (the
        // child's own reference count is untouched — it is up to whoever
        // is separately holding that reference to drop it on notice).
        unreference(&mut arena, parent, &mut log);
        assert!(arena.get(parent).is_none());
        assert_eq!(log, vec![child]);
        assert!(arena.get(child).is_some(), "weak-destroy only notifies, it doesn't remove");
        assert!(arena[child].link().parent().is_none());

        unreference(&mut arena, child, &mut log);
        assert!(arena.get(child).is_none());
    }

    #[test]
    fn effective_is_weak_is_false_while_a_strong_child_remains() {
        let mut arena: SlotMap<TestKey, TestNode> = SlotMap::with_key();
        let mut log = Vec::new();
        let root = arena.insert(TestNode::default());
        let mid = arena.insert(TestNode::default());
        let leaf = arena.insert(TestNode::default());
        set_parent(&mut arena, mid, root, false, &mut log);
        set_parent(&mut arena, leaf, mid, true, &mut log);

        assert!(arena[mid].link().is_weak());
        assert!(!effective_is_weak(&arena, mid));

        unreference(&mut arena, leaf, &mut log);
        assert!(effective_is_weak(&arena, mid));
    }

    #[test]
    fn children_snapshot_is_stable_across_mutation() {
        let mut arena: SlotMap<TestKey, TestNode> = SlotMap::with_key();
        let mut log = Vec::new();
        let root = arena.insert(TestNode::default());
        let a = arena.insert(TestNode::default());
        let b = arena.insert(TestNode::default());
        set_parent(&mut arena, a, root, true, &mut log);
        set_parent(&mut arena, b, root, true, &mut log);

        let snapshot = children_snapshot(&arena, root);
        assert_eq!(snapshot.len(), 2);
        for child in snapshot {
            unreference(&mut arena, child, &mut log);
        }
        assert!(arena[root].link().children().is_empty());
    }
}
