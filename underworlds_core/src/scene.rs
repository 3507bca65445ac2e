//! The Scene Store - authoritative node table of one world.
//!
//! Maintains the hierarchy invariant: every non-root node has exactly one
//! existing parent, appears in that parent's `children` set and nowhere
//! else, and reaches the root by following parent links. Every committed
//! mutation returns the ordered change records to broadcast.

use crate::error::{Result, UwdsError};
use crate::types::{Change, Node, NodeId};
use nalgebra::Matrix4;
use std::collections::HashMap;
use underworlds_env::{InvalidationKind, InvalidationTarget, Timestamp};

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    New,
    Updated,
}

/// Node table of one world.
#[derive(Debug, Clone)]
pub struct Scene {
    root: NodeId,
    nodes: HashMap<NodeId, Node>,
    /// Last assigned `last_update`, kept strictly increasing
    last_stamp: Timestamp,
}

impl Scene {
    /// Creates a scene holding only its root node.
    pub fn new(root: NodeId, now: Timestamp) -> Self {
        let mut node = Node::root(root.clone());
        node.last_update = now;

        let mut nodes = HashMap::new();
        nodes.insert(root.clone(), node);

        Self {
            root,
            nodes,
            last_stamp: now,
        }
    }

    pub fn root_id(&self) -> &NodeId {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &NodeId) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| UwdsError::not_found(format!("node {}", id)))
    }

    /// All node ids, root first.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut others: Vec<NodeId> = self
            .nodes
            .keys()
            .filter(|id| **id != self.root)
            .cloned()
            .collect();
        others.sort();

        let mut ids = Vec::with_capacity(self.nodes.len());
        ids.push(self.root.clone());
        ids.extend(others);
        ids
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_by_name(&self, name: &str) -> Vec<&Node> {
        self.nodes.values().filter(|n| n.name == name).collect()
    }

    /// Inserts or replaces a node.
    ///
    /// # Records
    /// * new node: `NEW[id]`, `UPDATE[parent]`
    /// * known node: `UPDATE[id]`, then `UPDATE[new parent]`, `UPDATE[old parent]`
    ///   when the parent changed
    ///
    /// # Errors
    /// `InvalidArgument` for an empty id, an unknown parent, a self-parent,
    /// a parent that is one of the node's descendants, or a reparented root.
    /// Nothing is modified on error.
    pub fn upsert(&mut self, mut node: Node, now: Timestamp) -> Result<(Upsert, Vec<Change>)> {
        if node.id.is_empty() {
            return Err(UwdsError::invalid("node id must not be empty"));
        }
        if node.id == self.root {
            return self.update_root(node, now);
        }

        let parent = node.parent.clone().unwrap_or_else(|| self.root.clone());
        if parent == node.id {
            return Err(UwdsError::invalid(format!("node {} cannot parent itself", node.id)));
        }
        if !self.nodes.contains_key(&parent) {
            return Err(UwdsError::invalid(format!(
                "node {} references unknown parent {}",
                node.id, parent
            )));
        }

        let existing = self
            .nodes
            .get(&node.id)
            .map(|n| (n.parent.clone(), n.children.clone()));

        if existing.is_some() && self.is_ancestor(&node.id, &parent) {
            return Err(UwdsError::invalid(format!(
                "reparenting {} under {} would create a cycle",
                node.id, parent
            )));
        }

        let stamp = self.stamp(now);
        let id = node.id.clone();
        node.parent = Some(parent.clone());
        node.last_update = stamp;

        match existing {
            None => {
                node.children.clear();
                self.nodes.insert(id.clone(), node);
                self.attach(&parent, &id, stamp);

                Ok((
                    Upsert::New,
                    vec![
                        Change::scene(InvalidationKind::New, &id),
                        Change::scene(InvalidationKind::Update, &parent),
                    ],
                ))
            }
            Some((old_parent, children)) => {
                node.children = children;
                self.nodes.insert(id.clone(), node);

                let mut changes = vec![Change::scene(InvalidationKind::Update, &id)];
                if old_parent.as_ref() != Some(&parent) {
                    self.attach(&parent, &id, stamp);
                    changes.push(Change::scene(InvalidationKind::Update, &parent));

                    if let Some(old) = old_parent {
                        self.detach(&old, &id, stamp);
                        changes.push(Change::scene(InvalidationKind::Update, &old));
                    }
                }
                Ok((Upsert::Updated, changes))
            }
        }
    }

    fn update_root(&mut self, node: Node, now: Timestamp) -> Result<(Upsert, Vec<Change>)> {
        if node.parent.is_some() {
            return Err(UwdsError::invalid("the root node cannot be reparented"));
        }

        let stamp = self.stamp(now);
        let root = self
            .nodes
            .get_mut(&self.root)
            .ok_or_else(|| UwdsError::not_found("root node"))?;
        root.name = node.name;
        root.node_type = node.node_type;
        root.transform = node.transform;
        root.properties = node.properties;
        root.last_update = stamp;

        Ok((
            Upsert::Updated,
            vec![Change::scene(InvalidationKind::Update, &self.root)],
        ))
    }

    /// Removes a node, reparenting its children to the root.
    ///
    /// # Records
    /// `UPDATE` for each reparented child, `UPDATE[root]` if any child moved,
    /// `UPDATE[former parent]`, then `DELETE[id]`. A leaf yields exactly two.
    pub fn delete(&mut self, id: &NodeId, now: Timestamp) -> Result<Vec<Change>> {
        if *id == self.root {
            return Err(UwdsError::invalid("the root node cannot be deleted"));
        }
        let node = self
            .nodes
            .remove(id)
            .ok_or_else(|| UwdsError::not_found(format!("node {}", id)))?;

        let stamp = self.stamp(now);
        let root = self.root.clone();
        let mut changes = Vec::with_capacity(node.children.len() + 3);

        for child in &node.children {
            if let Some(c) = self.nodes.get_mut(child) {
                c.parent = Some(root.clone());
                c.last_update = stamp;
            }
            self.attach(&root, child, stamp);
            changes.push(Change::scene(InvalidationKind::Update, child));
        }

        let mut touched: Vec<NodeId> = Vec::with_capacity(2);
        if !node.children.is_empty() {
            touched.push(root);
        }
        if let Some(parent) = node.parent {
            self.detach(&parent, id, stamp);
            if !touched.contains(&parent) {
                touched.push(parent);
            }
        }
        changes.extend(
            touched
                .iter()
                .map(|p| Change::scene(InvalidationKind::Update, p)),
        );
        changes.push(Change::scene(InvalidationKind::Delete, id));

        Ok(changes)
    }

    /// Replaces this scene's content with a copy of `source`, keeping this
    /// scene's root id.
    pub fn copy_from(&mut self, source: &Scene, now: Timestamp) -> Vec<Change> {
        let stamp = self.stamp(now);

        let mut fresh = HashMap::with_capacity(source.nodes.len());
        for node in source.nodes.values() {
            let mut copy = node.clone();
            if copy.id == source.root {
                copy.id = self.root.clone();
                copy.parent = None;
            } else if copy.parent.as_ref() == Some(&source.root) {
                copy.parent = Some(self.root.clone());
            }
            copy.last_update = stamp;
            fresh.insert(copy.id.clone(), copy);
        }

        let mut deleted: Vec<String> = self
            .nodes
            .keys()
            .filter(|id| !fresh.contains_key(*id))
            .map(|id| id.0.clone())
            .collect();
        let mut created: Vec<String> = fresh
            .keys()
            .filter(|id| !self.nodes.contains_key(*id))
            .map(|id| id.0.clone())
            .collect();
        let mut updated: Vec<String> = fresh
            .keys()
            .filter(|id| self.nodes.contains_key(*id))
            .map(|id| id.0.clone())
            .collect();
        deleted.sort();
        created.sort();
        updated.sort();

        self.nodes = fresh;

        [
            (InvalidationKind::Delete, deleted),
            (InvalidationKind::New, created),
            (InvalidationKind::Update, updated),
        ]
        .into_iter()
        .filter(|(_, ids)| !ids.is_empty())
        .map(|(kind, ids)| Change {
            target: InvalidationTarget::Scene,
            kind,
            ids,
        })
        .collect()
    }

    /// Transform of `id` relative to the world frame.
    pub fn world_transform(&self, id: &NodeId) -> Result<Matrix4<f64>> {
        let mut node = self.get(id)?;
        let mut transform = node.transform;
        while let Some(parent) = node.parent.as_ref() {
            node = self.get(parent)?;
            transform = node.transform * transform;
        }
        Ok(transform)
    }

    /// Checks the hierarchy invariant, returning a description of the first
    /// violation.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let root = self
            .nodes
            .get(&self.root)
            .ok_or_else(|| "missing root".to_string())?;
        if root.parent.is_some() {
            return Err("root has a parent".to_string());
        }

        for node in self.nodes.values() {
            for child in &node.children {
                let c = self
                    .nodes
                    .get(child)
                    .ok_or_else(|| format!("{} lists missing child {}", node.id, child))?;
                if c.parent.as_ref() != Some(&node.id) {
                    return Err(format!("{} lists {} which has another parent", node.id, child));
                }
            }

            if node.id == self.root {
                continue;
            }
            let parent = node
                .parent
                .as_ref()
                .ok_or_else(|| format!("{} has no parent", node.id))?;
            let p = self
                .nodes
                .get(parent)
                .ok_or_else(|| format!("{} has dangling parent {}", node.id, parent))?;
            if !p.children.contains(&node.id) {
                return Err(format!("{} missing from children of {}", node.id, parent));
            }

            let mut hops = 0;
            let mut current = &node.id;
            while *current != self.root {
                current = self
                    .nodes
                    .get(current)
                    .and_then(|n| n.parent.as_ref())
                    .ok_or_else(|| format!("{} does not reach root", node.id))?;
                hops += 1;
                if hops > self.nodes.len() {
                    return Err(format!("cycle through {}", node.id));
                }
            }
        }
        Ok(())
    }

    /// Whether `ancestor` is `node` or lies on its parent chain.
    fn is_ancestor(&self, ancestor: &NodeId, node: &NodeId) -> bool {
        let mut current = Some(node);
        let mut hops = 0;
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.nodes.len() {
                return false;
            }
            current = self.nodes.get(id).and_then(|n| n.parent.as_ref());
        }
        false
    }

    fn attach(&mut self, parent: &NodeId, child: &NodeId, stamp: Timestamp) {
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.insert(child.clone());
            p.last_update = stamp;
        }
    }

    fn detach(&mut self, parent: &NodeId, child: &NodeId, stamp: Timestamp) {
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.remove(child);
            p.last_update = stamp;
        }
    }

    fn stamp(&mut self, now: Timestamp) -> Timestamp {
        self.last_stamp = now.after(self.last_stamp);
        self.last_stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeType, ROOT_NAME};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use proptest::prelude::*;

    fn scene() -> Scene {
        Scene::new(NodeId::new("root-id"), Timestamp(1_000))
    }

    fn node(id: &str) -> Node {
        Node::with_id(NodeId::new(id), id, NodeType::Entity)
    }

    fn kinds(changes: &[Change]) -> Vec<(InvalidationKind, Vec<String>)> {
        changes.iter().map(|c| (c.kind, c.ids.clone())).collect()
    }

    #[test]
    fn test_new_scene_has_root() {
        let scene = scene();
        let root = scene.get(scene.root_id()).unwrap();
        assert_eq!(root.name, ROOT_NAME);
        assert_eq!(root.node_type, NodeType::Entity);
        assert!(root.parent.is_none());
        assert_eq!(scene.len(), 1);
        assert!(scene.validate().is_ok());
    }

    #[test]
    fn test_create_defaults_parent_to_root() {
        let mut scene = scene();
        let (outcome, changes) = scene.upsert(node("a"), Timestamp(2_000)).unwrap();

        assert_eq!(outcome, Upsert::New);
        assert_eq!(
            kinds(&changes),
            vec![
                (InvalidationKind::New, vec!["a".to_string()]),
                (InvalidationKind::Update, vec!["root-id".to_string()]),
            ]
        );
        let a = scene.get(&NodeId::new("a")).unwrap();
        assert_eq!(a.parent, Some(NodeId::new("root-id")));
        assert!(scene.get(scene.root_id()).unwrap().children.contains(&a.id));
    }

    #[test]
    fn test_client_supplied_children_are_ignored() {
        let mut scene = scene();
        let mut a = node("a");
        a.children.insert(NodeId::new("ghost"));
        scene.upsert(a, Timestamp(2_000)).unwrap();

        assert!(scene.get(&NodeId::new("a")).unwrap().children.is_empty());
        assert!(scene.validate().is_ok());
    }

    #[test]
    fn test_reparent_reports_both_parents() {
        let mut scene = scene();
        scene.upsert(node("p1"), Timestamp(2_000)).unwrap();
        scene.upsert(node("p2"), Timestamp(2_000)).unwrap();
        scene
            .upsert(node("c").with_parent(NodeId::new("p1")), Timestamp(2_000))
            .unwrap();

        let (outcome, changes) = scene
            .upsert(node("c").with_parent(NodeId::new("p2")), Timestamp(3_000))
            .unwrap();
        assert_eq!(outcome, Upsert::Updated);
        assert_eq!(
            kinds(&changes),
            vec![
                (InvalidationKind::Update, vec!["c".to_string()]),
                (InvalidationKind::Update, vec!["p2".to_string()]),
                (InvalidationKind::Update, vec!["p1".to_string()]),
            ]
        );
        assert!(scene.get(&NodeId::new("p1")).unwrap().children.is_empty());
        assert!(scene
            .get(&NodeId::new("p2"))
            .unwrap()
            .children
            .contains(&NodeId::new("c")));
        assert!(scene.validate().is_ok());
    }

    #[test]
    fn test_upsert_idempotence() {
        let mut scene = scene();
        scene.upsert(node("a"), Timestamp(2_000)).unwrap();
        let before = scene.get(&NodeId::new("a")).unwrap().clone();

        // Same wall-clock instant: the stamp must still move forward.
        let (outcome, changes) = scene.upsert(node("a"), Timestamp(2_000)).unwrap();
        let after = scene.get(&NodeId::new("a")).unwrap();

        assert_eq!(outcome, Upsert::Updated);
        assert_eq!(
            kinds(&changes),
            vec![(InvalidationKind::Update, vec!["a".to_string()])]
        );
        assert!(after.last_update > before.last_update);
        assert_eq!(after.parent, before.parent);
        assert_eq!(after.children, before.children);
        assert_eq!(scene.len(), 2);
    }

    #[test]
    fn test_delete_reparents_children_to_root() {
        let mut scene = scene();
        scene.upsert(node("p"), Timestamp(2_000)).unwrap();
        scene
            .upsert(node("c1").with_parent(NodeId::new("p")), Timestamp(2_000))
            .unwrap();
        scene
            .upsert(node("c2").with_parent(NodeId::new("p")), Timestamp(2_000))
            .unwrap();

        let changes = scene.delete(&NodeId::new("p"), Timestamp(3_000)).unwrap();

        let root = NodeId::new("root-id");
        assert_eq!(scene.get(&NodeId::new("c1")).unwrap().parent, Some(root.clone()));
        assert_eq!(scene.get(&NodeId::new("c2")).unwrap().parent, Some(root.clone()));
        assert!(scene.get(&NodeId::new("p")).is_err());
        assert_eq!(
            kinds(&changes),
            vec![
                (InvalidationKind::Update, vec!["c1".to_string()]),
                (InvalidationKind::Update, vec!["c2".to_string()]),
                (InvalidationKind::Update, vec!["root-id".to_string()]),
                (InvalidationKind::Delete, vec!["p".to_string()]),
            ]
        );
        assert!(scene.validate().is_ok());
    }

    #[test]
    fn test_delete_leaf_yields_two_records() {
        let mut scene = scene();
        scene.upsert(node("p"), Timestamp(2_000)).unwrap();
        scene
            .upsert(node("n").with_parent(NodeId::new("p")), Timestamp(2_000))
            .unwrap();

        let changes = scene.delete(&NodeId::new("n"), Timestamp(3_000)).unwrap();
        assert_eq!(
            kinds(&changes),
            vec![
                (InvalidationKind::Update, vec!["p".to_string()]),
                (InvalidationKind::Delete, vec!["n".to_string()]),
            ]
        );
    }

    #[test]
    fn test_rejections_leave_scene_untouched() {
        let mut scene = scene();
        scene.upsert(node("a"), Timestamp(2_000)).unwrap();
        scene
            .upsert(node("b").with_parent(NodeId::new("a")), Timestamp(2_000))
            .unwrap();

        let cycle = scene.upsert(node("a").with_parent(NodeId::new("b")), Timestamp(3_000));
        assert!(matches!(cycle, Err(UwdsError::InvalidArgument(_))));

        let own = scene.upsert(node("a").with_parent(NodeId::new("a")), Timestamp(3_000));
        assert!(matches!(own, Err(UwdsError::InvalidArgument(_))));

        let dangling = scene.upsert(node("x").with_parent(NodeId::new("nope")), Timestamp(3_000));
        assert!(matches!(dangling, Err(UwdsError::InvalidArgument(_))));

        let empty = scene.upsert(node(""), Timestamp(3_000));
        assert!(matches!(empty, Err(UwdsError::InvalidArgument(_))));

        let root = scene.root_id().clone();
        assert!(matches!(
            scene.delete(&root, Timestamp(3_000)),
            Err(UwdsError::InvalidArgument(_))
        ));
        assert!(matches!(
            scene.delete(&NodeId::new("nope"), Timestamp(3_000)),
            Err(UwdsError::NotFound(_))
        ));

        assert_eq!(scene.len(), 3);
        assert!(scene.validate().is_ok());
    }

    #[test]
    fn test_root_cannot_be_reparented() {
        let mut scene = scene();
        scene.upsert(node("a"), Timestamp(2_000)).unwrap();
        let root = scene.root_id().clone();

        let mut moved = Node::root(root.clone());
        moved.parent = Some(NodeId::new("a"));
        assert!(scene.upsert(moved, Timestamp(3_000)).is_err());

        let mut renamed = Node::root(root.clone());
        renamed.translate(Vector3::new(0.0, 0.0, 1.0));
        let (outcome, changes) = scene.upsert(renamed, Timestamp(3_000)).unwrap();
        assert_eq!(outcome, Upsert::Updated);
        assert_eq!(changes.len(), 1);
        assert!(scene.get(&root).unwrap().children.contains(&NodeId::new("a")));
    }

    #[test]
    fn test_world_transform_walks_parents() {
        let mut scene = scene();
        let mut table = node("table");
        table.translate(Vector3::new(1.0, 2.0, 0.0));
        scene.upsert(table, Timestamp(2_000)).unwrap();

        let mut cup = node("cup").with_parent(NodeId::new("table"));
        cup.translate(Vector3::new(0.0, 0.0, 0.75));
        scene.upsert(cup, Timestamp(2_000)).unwrap();

        let m = scene.world_transform(&NodeId::new("cup")).unwrap();
        assert_relative_eq!(m[(0, 3)], 1.0);
        assert_relative_eq!(m[(1, 3)], 2.0);
        assert_relative_eq!(m[(2, 3)], 0.75);
    }

    #[test]
    fn test_copy_from_replaces_content() {
        let mut source = scene();
        source.upsert(node("a"), Timestamp(2_000)).unwrap();
        source
            .upsert(node("b").with_parent(NodeId::new("a")), Timestamp(2_000))
            .unwrap();

        let mut target = Scene::new(NodeId::new("other-root"), Timestamp(1_000));
        target.upsert(node("stale"), Timestamp(1_500)).unwrap();

        let changes = target.copy_from(&source, Timestamp(3_000));

        assert_eq!(target.len(), 3);
        assert!(!target.contains(&NodeId::new("stale")));
        assert_eq!(
            target.get(&NodeId::new("a")).unwrap().parent,
            Some(NodeId::new("other-root"))
        );
        assert!(target.validate().is_ok());
        assert_eq!(
            kinds(&changes),
            vec![
                (InvalidationKind::Delete, vec!["stale".to_string()]),
                (InvalidationKind::New, vec!["a".to_string(), "b".to_string()]),
                (InvalidationKind::Update, vec!["other-root".to_string()]),
            ]
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Create { parent: usize },
        Reparent { node: usize, parent: usize },
        Delete { node: usize },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<usize>().prop_map(|parent| Op::Create { parent }),
            (any::<usize>(), any::<usize>()).prop_map(|(node, parent)| Op::Reparent { node, parent }),
            any::<usize>().prop_map(|node| Op::Delete { node }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn test_hierarchy_invariant_holds(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let mut scene = scene();
            let mut next = 0u64;

            for (step, op) in ops.into_iter().enumerate() {
                let ids = scene.ids();
                let pick = |i: usize| ids[i % ids.len()].clone();
                let now = Timestamp(2_000 + step as u64);

                // Rejected operations are fine; the invariant must hold regardless.
                let _ = match op {
                    Op::Create { parent } => {
                        next += 1;
                        let n = node(&format!("n{}", next)).with_parent(pick(parent));
                        scene.upsert(n, now).map(|_| ())
                    }
                    Op::Reparent { node: n, parent } => {
                        let id = pick(n);
                        let mut moved = scene.get(&id).unwrap().clone();
                        if id != *scene.root_id() {
                            moved.parent = Some(pick(parent));
                        }
                        scene.upsert(moved, now).map(|_| ())
                    }
                    Op::Delete { node: n } => scene.delete(&pick(n), now).map(|_| ()),
                };

                prop_assert!(scene.validate().is_ok(), "{:?}", scene.validate());
                prop_assert!(scene.get(scene.root_id()).unwrap().parent.is_none());
            }
        }
    }
}
