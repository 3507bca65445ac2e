//! The Timeline Store - situations and events of one world.

use crate::error::{Result, UwdsError};
use crate::types::{Change, Situation, SituationId};
use std::collections::BTreeMap;
use underworlds_env::{InvalidationKind, InvalidationTarget, Timestamp};

/// Situation table of one world.
#[derive(Debug, Clone)]
pub struct Timeline {
    /// Creation time of the world
    origin: Timestamp,
    situations: BTreeMap<SituationId, Situation>,
    last_stamp: Timestamp,
}

impl Timeline {
    pub fn new(origin: Timestamp) -> Self {
        Self {
            origin,
            situations: BTreeMap::new(),
            last_stamp: origin,
        }
    }

    pub fn origin(&self) -> Timestamp {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.situations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.situations.is_empty()
    }

    pub fn get(&self, id: &SituationId) -> Result<&Situation> {
        self.situations
            .get(id)
            .ok_or_else(|| UwdsError::not_found(format!("situation {}", id)))
    }

    pub fn ids(&self) -> Vec<SituationId> {
        self.situations.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<Situation> {
        self.situations.values().cloned().collect()
    }

    pub fn list_active(&self) -> Vec<Situation> {
        self.situations
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    /// Starts a situation or records an event. A known id is replaced.
    pub fn start_or_event(&mut self, mut situation: Situation, now: Timestamp) -> Result<Change> {
        if situation.id.is_empty() {
            return Err(UwdsError::invalid("situation id must not be empty"));
        }
        if let Some(end) = situation.end {
            if end < situation.start {
                return Err(UwdsError::invalid(format!(
                    "situation {} ends before it starts",
                    situation.id
                )));
            }
        }

        situation.last_update = self.stamp(now);
        let id = situation.id.clone();
        let kind = match self.situations.insert(id.clone(), situation) {
            None => InvalidationKind::New,
            Some(_) => InvalidationKind::Update,
        };
        Ok(Change::timeline(kind, &id))
    }

    /// Ends an active situation at `at`.
    ///
    /// # Errors
    /// `NotFound` if the situation does not exist or has already ended.
    pub fn end(&mut self, id: &SituationId, at: Timestamp, now: Timestamp) -> Result<Change> {
        let active = self
            .situations
            .get(id)
            .map(|s| s.is_active())
            .unwrap_or(false);
        if !active {
            return Err(UwdsError::not_found(format!("active situation {}", id)));
        }

        let stamp = self.stamp(now);
        if let Some(situation) = self.situations.get_mut(id) {
            situation.end = Some(at.max(situation.start));
            situation.last_update = stamp;
        }
        Ok(Change::timeline(InvalidationKind::Update, id))
    }

    pub fn delete(&mut self, id: &SituationId) -> Result<Change> {
        self.situations
            .remove(id)
            .ok_or_else(|| UwdsError::not_found(format!("situation {}", id)))?;
        Ok(Change::timeline(InvalidationKind::Delete, id))
    }

    /// Replaces every situation with a copy of `source`'s. The origin is kept.
    pub fn copy_from(&mut self, source: &Timeline, now: Timestamp) -> Vec<Change> {
        let stamp = self.stamp(now);

        let deleted: Vec<String> = self
            .situations
            .keys()
            .filter(|id| !source.situations.contains_key(*id))
            .map(|id| id.0.clone())
            .collect();
        let (updated, created): (Vec<String>, Vec<String>) = source
            .situations
            .keys()
            .map(|id| id.0.clone())
            .partition(|id| self.situations.contains_key(&SituationId::new(id.as_str())));

        self.situations = source
            .situations
            .iter()
            .map(|(id, s)| {
                let mut copy = s.clone();
                copy.last_update = stamp;
                (id.clone(), copy)
            })
            .collect();

        [
            (InvalidationKind::Delete, deleted),
            (InvalidationKind::New, created),
            (InvalidationKind::Update, updated),
        ]
        .into_iter()
        .filter(|(_, ids)| !ids.is_empty())
        .map(|(kind, ids)| Change {
            target: InvalidationTarget::Timeline,
            kind,
            ids,
        })
        .collect()
    }

    fn stamp(&mut self, now: Timestamp) -> Timestamp {
        self.last_stamp = now.after(self.last_stamp);
        self.last_stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_then_end() {
        let mut timeline = Timeline::new(Timestamp(100));
        let situation = Situation::new("holding", Timestamp(150));
        let id = situation.id.clone();

        let change = timeline.start_or_event(situation, Timestamp(150)).unwrap();
        assert_eq!(change.kind, InvalidationKind::New);
        assert_eq!(timeline.list_active().len(), 1);

        let change = timeline.end(&id, Timestamp(200), Timestamp(200)).unwrap();
        assert_eq!(change.kind, InvalidationKind::Update);
        assert!(timeline.list_active().is_empty());
        assert_eq!(timeline.get(&id).unwrap().end, Some(Timestamp(200)));
    }

    #[test]
    fn test_event_is_immediately_inactive() {
        let mut timeline = Timeline::new(Timestamp(100));
        let event = Situation::event("modelload", Timestamp(120));
        timeline.start_or_event(event, Timestamp(120)).unwrap();

        assert_eq!(timeline.len(), 1);
        assert!(timeline.list_active().is_empty());
    }

    #[test]
    fn test_end_twice_is_not_found() {
        let mut timeline = Timeline::new(Timestamp(100));
        let situation = Situation::new("holding", Timestamp(150));
        let id = situation.id.clone();
        timeline.start_or_event(situation, Timestamp(150)).unwrap();

        timeline.end(&id, Timestamp(160), Timestamp(160)).unwrap();
        assert!(matches!(
            timeline.end(&id, Timestamp(170), Timestamp(170)),
            Err(UwdsError::NotFound(_))
        ));
        assert!(matches!(
            timeline.end(&SituationId::new("nope"), Timestamp(170), Timestamp(170)),
            Err(UwdsError::NotFound(_))
        ));
    }

    #[test]
    fn test_restart_is_update() {
        let mut timeline = Timeline::new(Timestamp(100));
        let situation = Situation::new("holding", Timestamp(150));
        timeline.start_or_event(situation.clone(), Timestamp(150)).unwrap();
        let change = timeline.start_or_event(situation, Timestamp(150)).unwrap();
        assert_eq!(change.kind, InvalidationKind::Update);
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn test_delete_and_invalid_input() {
        let mut timeline = Timeline::new(Timestamp(100));
        let situation = Situation::new("holding", Timestamp(150));
        let id = situation.id.clone();
        timeline.start_or_event(situation, Timestamp(150)).unwrap();

        assert_eq!(timeline.delete(&id).unwrap().kind, InvalidationKind::Delete);
        assert!(timeline.delete(&id).is_err());

        let backwards = Situation {
            end: Some(Timestamp(10)),
            ..Situation::new("bad", Timestamp(50))
        };
        assert!(matches!(
            timeline.start_or_event(backwards, Timestamp(160)),
            Err(UwdsError::InvalidArgument(_))
        ));
        let empty = Situation::new("bad", Timestamp(50)).with_id(SituationId::new(""));
        assert!(timeline.start_or_event(empty, Timestamp(160)).is_err());
    }

    #[test]
    fn test_copy_keeps_origin() {
        let mut source = Timeline::new(Timestamp(100));
        source
            .start_or_event(Situation::new("a", Timestamp(110)), Timestamp(110))
            .unwrap();

        let mut target = Timeline::new(Timestamp(500));
        let stale = Situation::new("stale", Timestamp(510));
        target.start_or_event(stale, Timestamp(510)).unwrap();

        let changes = target.copy_from(&source, Timestamp(600));
        assert_eq!(target.origin(), Timestamp(500));
        assert_eq!(target.len(), 1);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].kind, InvalidationKind::Delete);
        assert_eq!(changes[1].kind, InvalidationKind::New);
    }
}
