//! Local change capture: junction resolution, debounce, loop suppression.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info};

use w3sync_core::{LocalId, Row};

use crate::context::SyncContext;
use crate::error::EngineError;
use crate::inflight::InFlight;
use crate::local::row_id;
use crate::outbound::{ChangeRequest, OutboundHandler};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A write observed on a local table.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub row: Row,
}

impl LocalEvent {
    pub fn new(table: impl Into<String>, kind: ChangeKind, row: Row) -> Self {
        Self {
            table: table.into(),
            kind,
            row,
        }
    }
}

/// A many-to-many link table whose rows stand for a change to their parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JunctionRule {
    pub table: String,
    pub parent_table: String,
    pub parent_id_field: String,
}

impl JunctionRule {
    pub fn new(
        table: impl Into<String>,
        parent_table: impl Into<String>,
        parent_id_field: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            parent_table: parent_table.into(),
            parent_id_field: parent_id_field.into(),
        }
    }
}

#[derive(Debug)]
struct PendingEntry<V> {
    deadline: Instant,
    value: V,
}

#[derive(Debug, PartialEq)]
pub enum Due<V> {
    Ready(V),
    Wait(Instant),
    Gone,
}

/// Keyed coalescing queue. Each push replaces the pending value for its key
/// and moves the key's deadline to `now + window`.
#[derive(Debug)]
pub struct DebounceQueue<K, V> {
    window: Duration,
    pending: HashMap<K, PendingEntry<V>>,
}

impl<K: Eq + Hash, V> DebounceQueue<K, V> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Returns true when the key had nothing pending, i.e. the caller has to
    /// schedule a timer for it.
    pub fn push(&mut self, key: K, value: V, now: Instant) -> bool {
        let deadline = now + self.window;
        match self.pending.get_mut(&key) {
            Some(entry) => {
                entry.deadline = deadline;
                entry.value = value;
                false
            }
            None => {
                self.pending.insert(key, PendingEntry { deadline, value });
                true
            }
        }
    }

    pub fn poll(&mut self, key: &K, now: Instant) -> Due<V> {
        match self.pending.get(key) {
            None => Due::Gone,
            Some(entry) if entry.deadline > now => Due::Wait(entry.deadline),
            Some(_) => match self.pending.remove(key) {
                Some(entry) => Due::Ready(entry.value),
                None => Due::Gone,
            },
        }
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

type ChangeKey = (String, LocalId);

#[derive(Debug, Clone)]
enum PendingChange {
    Snapshot(Row),
    /// Reload the row from the local store when the window closes.
    Reload,
}

struct WatcherInner {
    ctx: Arc<SyncContext>,
    outbound: Arc<OutboundHandler>,
    junctions: HashMap<String, JunctionRule>,
    queue: Mutex<DebounceQueue<ChangeKey, PendingChange>>,
    timers: InFlight,
}

#[derive(Clone)]
pub struct ChangeWatcher {
    inner: Arc<WatcherInner>,
}

impl ChangeWatcher {
    pub fn new(
        ctx: Arc<SyncContext>,
        outbound: Arc<OutboundHandler>,
        debounce: Duration,
        junctions: impl IntoIterator<Item = JunctionRule>,
    ) -> Self {
        let junctions = junctions
            .into_iter()
            .map(|rule| (rule.table.clone(), rule))
            .collect();
        Self {
            inner: Arc::new(WatcherInner {
                ctx,
                outbound,
                junctions,
                queue: Mutex::new(DebounceQueue::new(debounce)),
                timers: InFlight::default(),
            }),
        }
    }

    /// Records a local write. Syncing happens later on a background task;
    /// this never waits on the vault.
    pub fn notify(&self, event: LocalEvent) -> Result<(), EngineError> {
        let inner = &self.inner;

        if let Some(rule) = inner.junctions.get(&event.table) {
            let Some(parent_id) = parent_id(&event.row, &rule.parent_id_field) else {
                debug!(
                    table = %event.table,
                    field = %rule.parent_id_field,
                    "junction row without parent id"
                );
                return Ok(());
            };
            if inner.ctx.registry.by_table(&rule.parent_table).is_none() {
                return Ok(());
            }
            debug!(
                table = %event.table,
                parent_table = %rule.parent_table,
                %parent_id,
                "junction change resolved to parent"
            );
            self.schedule((rule.parent_table.clone(), parent_id), PendingChange::Reload);
            return Ok(());
        }

        if inner.ctx.registry.by_table(&event.table).is_none() {
            return Ok(());
        }
        let Some(local_id) = row_id(&event.row) else {
            debug!(table = %event.table, "event row has no id");
            return Ok(());
        };

        match event.kind {
            ChangeKind::Delete => {
                inner.queue().cancel(&(event.table.clone(), local_id.clone()));
                let tombstoned = inner
                    .ctx
                    .store
                    .tombstone(&local_id, &event.table, inner.ctx.now_ms())?;
                if tombstoned {
                    info!(table = %event.table, %local_id, "mapping tombstoned");
                }
            }
            ChangeKind::Insert | ChangeKind::Update => {
                self.schedule((event.table, local_id), PendingChange::Snapshot(event.row));
            }
        }
        Ok(())
    }

    fn schedule(&self, key: ChangeKey, change: PendingChange) {
        let is_new = self.inner.queue().push(key.clone(), change, Instant::now());
        if !is_new {
            debug!(table = %key.0, local_id = %key.1, "change coalesced");
            return;
        }
        self.inner.timers.start();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_timer(key).await;
            inner.timers.finish();
        });
    }

    pub fn pending(&self) -> usize {
        self.inner.queue().len()
    }

    /// Waits until every scheduled change has fired.
    pub async fn flush(&self) {
        self.inner.timers.wait_idle().await;
    }
}

fn parent_id(row: &Row, field: &str) -> Option<LocalId> {
    match w3sync_core::path::lookup_in(row, field)? {
        Value::String(s) if !s.is_empty() => Some(LocalId::new(s)),
        Value::Number(n) => Some(LocalId::new(n.to_string())),
        _ => None,
    }
}

impl WatcherInner {
    fn queue(&self) -> MutexGuard<'_, DebounceQueue<ChangeKey, PendingChange>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_timer(&self, key: ChangeKey) {
        loop {
            let polled = self.queue().poll(&key, Instant::now());
            match polled {
                Due::Wait(deadline) => sleep_until(deadline).await,
                Due::Ready(change) => {
                    let (table, local_id) = key;
                    if let Err(err) = self.fire(&table, &local_id, change).await {
                        error!(%table, %local_id, error = %err, "outbound sync failed");
                    }
                    return;
                }
                Due::Gone => return,
            }
        }
    }

    async fn fire(
        &self,
        table: &str,
        local_id: &LocalId,
        change: PendingChange,
    ) -> Result<(), EngineError> {
        let locks = &self.ctx.locks;
        if locks.contains(local_id) {
            debug!(%table, %local_id, "local id locked, change suppressed");
            return Ok(());
        }
        if let Some(global_id) = self.ctx.store.get_global_id(local_id, table)? {
            if locks.contains(&global_id) {
                debug!(%table, %local_id, %global_id, "global id locked, change suppressed");
                return Ok(());
            }
        }

        let row = match change {
            PendingChange::Snapshot(row) => row,
            PendingChange::Reload => {
                let fetched = self
                    .ctx
                    .local
                    .fetch(table, local_id)
                    .await
                    .map_err(EngineError::LocalStore)?;
                match fetched {
                    Some(row) => row,
                    None => {
                        debug!(%table, %local_id, "parent row gone before sync");
                        return Ok(());
                    }
                }
            }
        };

        self.outbound
            .handle_change(ChangeRequest::new(table, row))
            .await?;
        Ok(())
    }
}
