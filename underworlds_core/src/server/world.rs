//! A world: one scene plus one timeline, under a single writer lock.

use crate::scene::Scene;
use crate::timeline::Timeline;
use crate::types::{Change, NodeId};
use underworlds_env::{Invalidation, Timestamp};

#[derive(Debug, Clone)]
pub struct World {
    pub name: String,
    pub scene: Scene,
    pub timeline: Timeline,
}

impl World {
    pub fn new(name: impl Into<String>, root: NodeId, now: Timestamp) -> Self {
        Self {
            name: name.into(),
            scene: Scene::new(root, now),
            timeline: Timeline::new(now),
        }
    }

    /// Nodes plus situations.
    pub fn size(&self) -> usize {
        self.scene.len() + self.timeline.len()
    }

    /// Addresses a committed change to this world.
    pub fn invalidation(&self, change: Change) -> Invalidation {
        Invalidation::new(self.name.as_str(), change.target, change.kind, change.ids)
    }

    /// Replaces this world's content with a copy of `source`'s.
    pub fn copy_from(&mut self, source: &World, now: Timestamp) -> Vec<Change> {
        let mut changes = self.scene.copy_from(&source.scene, now);
        changes.extend(self.timeline.copy_from(&source.timeline, now));
        changes
    }
}
