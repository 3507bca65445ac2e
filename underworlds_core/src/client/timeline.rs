//! Client-side mirror of a world's timeline.
//!
//! Unlike nodes, situations are mirrored eagerly: every NEW/UPDATE record is
//! fetched by the listener, then change callbacks fire.

use crate::api::UnderworldsApi;
use crate::client::call;
use crate::config::ClientConfig;
use crate::error::{Result, UwdsError};
use crate::types::{Situation, SituationId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use underworlds_env::{ClientId, Invalidation, InvalidationKind, Timestamp};

type ChangeCallback = Arc<dyn Fn(&Situation) + Send + Sync>;

#[derive(Default)]
struct TimelineState {
    origin: Timestamp,
    situations: BTreeMap<SituationId, Situation>,
    /// Deletions seen before the snapshot was merged
    graveyard: HashSet<SituationId>,
}

pub struct TimelineProxy {
    api: Arc<dyn UnderworldsApi>,
    client: ClientId,
    world: String,
    config: ClientConfig,
    state: Mutex<TimelineState>,
    callbacks: Mutex<Vec<ChangeCallback>>,
    changed: Notify,
}

impl TimelineProxy {
    pub(crate) fn new(
        api: Arc<dyn UnderworldsApi>,
        client: ClientId,
        world: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        Self {
            api,
            client,
            world: world.into(),
            config,
            state: Mutex::new(TimelineState::default()),
            callbacks: Mutex::new(Vec::new()),
            changed: Notify::new(),
        }
    }

    pub(crate) async fn bootstrap(&self) -> Result<()> {
        let rpc = self.config.rpc_timeout();
        let origin = call(rpc, self.api.timeline_origin(self.client, &self.world)).await?;
        let ids = call(rpc, self.api.situation_ids(self.client, &self.world)).await?;
        self.state.lock().origin = origin;

        for id in ids {
            match self.fetch(&id).await {
                Ok(situation) => {
                    let mut st = self.state.lock();
                    if !st.graveyard.contains(&id) {
                        st.situations.entry(id).or_insert(situation);
                    }
                }
                Err(UwdsError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Applies a timeline invalidation. Called by the world's listener task.
    pub(crate) async fn on_invalidation(&self, record: &Invalidation) {
        for raw in &record.ids {
            let id = SituationId::new(raw.as_str());
            match record.kind {
                InvalidationKind::New | InvalidationKind::Update => {
                    match self.fetch(&id).await {
                        Ok(situation) => {
                            self.state
                                .lock()
                                .situations
                                .insert(id, situation.clone());
                            let callbacks = self.callbacks.lock().clone();
                            for cb in callbacks {
                                cb(&situation);
                            }
                        }
                        Err(e) => debug!("Skipping situation {}: {}", id, e),
                    }
                }
                InvalidationKind::Delete => {
                    let mut st = self.state.lock();
                    if st.situations.remove(&id).is_none() {
                        st.graveyard.insert(id);
                    }
                }
                InvalidationKind::Nop => {}
            }
        }
        self.changed.notify_waiters();
    }

    /// Creation time of the world.
    pub fn origin(&self) -> Timestamp {
        self.state.lock().origin
    }

    pub fn len(&self) -> usize {
        self.state.lock().situations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &SituationId) -> Option<Situation> {
        self.state.lock().situations.get(id).cloned()
    }

    pub fn situations(&self) -> Vec<Situation> {
        self.state.lock().situations.values().cloned().collect()
    }

    /// Situations that have started and not ended.
    pub fn active(&self) -> Vec<Situation> {
        self.state
            .lock()
            .situations
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    /// Asserts that a situation has started.
    pub async fn start(&self, situation: Situation) -> Result<()> {
        call(
            self.config.rpc_timeout(),
            self.api.put_situations(self.client, &self.world, vec![situation]),
        )
        .await
    }

    /// Asserts an instantaneous event; the end is forced to the start.
    pub async fn event(&self, mut event: Situation) -> Result<()> {
        event.end = Some(event.start);
        self.start(event).await
    }

    /// Asserts the end of a situation.
    pub async fn end(&self, id: &SituationId) -> Result<()> {
        call(
            self.config.rpc_timeout(),
            self.api.end_situation(self.client, &self.world, id),
        )
        .await
    }

    pub async fn remove(&self, id: &SituationId) -> Result<()> {
        call(
            self.config.rpc_timeout(),
            self.api.delete_situations(self.client, &self.world, vec![id.clone()]),
        )
        .await
    }

    /// Registers a callback run (on the listener task) for every new or
    /// updated situation.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(&Situation) + Send + Sync + 'static,
    {
        self.callbacks.lock().push(Arc::new(callback));
    }

    /// Waits for the next timeline change. Returns false on timeout.
    pub async fn wait_for_changes(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.changed.notified())
            .await
            .is_ok()
    }

    async fn fetch(&self, id: &SituationId) -> Result<Situation> {
        call(
            self.config.rpc_timeout(),
            self.api.get_situation(self.client, &self.world, id),
        )
        .await
    }
}
