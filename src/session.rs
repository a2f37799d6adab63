//! Session coordinator.
//!
//! One worker thread owns every mutation of the torrent cache, the tag index
//! and the permission reconciler. Remote refreshes, outbound calls and
//! authorization results are serialized through its command channel; readers
//! share the cache behind a lock that the worker holds for a whole merge, so a
//! reader sees either the state before an update or after it.

use std::{
    collections::HashSet,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    thread,
    time::Duration,
};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use crate::{
    cache::{DeltaOutcome, TorrentCache},
    config::SessionConfig,
    diff::{compute_effects, effects_for_delta, ListEffects},
    dispatch::{self, BulkAction, DispatchPlan, DispatchRefusal, OutboundCall},
    model::{TorrentDelta, TorrentId, TorrentRecord},
    permissions::{
        AuthorizationOutcome, BeginOutcome, DocumentTreeResolver, Fingerprint,
        PermissionReconciler, PersistedPending, ReconciliationResult, TreeResolver,
    },
    rpc::{FetchScope, RemoteRpc, TorrentList},
    tags::{DisplayEntry, TagIndex},
};

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ListChanged {
        effects: ListEffects,
        outcome: DeltaOutcome,
    },
    TagsChanged(Vec<DisplayEntry>),
    CallCompleted {
        method: &'static str,
    },
    CallFailed {
        method: &'static str,
        reason: String,
    },
    RefreshFailed(String),
    Warning(String),
    Reconciled(ReconciliationResult),
}

enum SessionCommand {
    Refresh,
    Execute(Vec<OutboundCall>),
    SetFilterActive(bool),
    BeginAuthorization {
        id: TorrentId,
        reply: Sender<BeginOutcome>,
    },
    CompleteAuthorization {
        fingerprint: Fingerprint,
        outcome: AuthorizationOutcome,
    },
    PersistPending {
        reply: Sender<PersistedPending>,
    },
    RestorePending(PersistedPending),
    Shutdown,
}

pub struct Session {
    profile: String,
    cache: Arc<RwLock<TorrentCache>>,
    tags: Arc<RwLock<TagIndex>>,
    commands: Sender<SessionCommand>,
    events: Receiver<SessionEvent>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Session {
    pub fn spawn<C>(client: C, config: SessionConfig) -> Self
    where
        C: RemoteRpc + 'static,
    {
        Self::spawn_with_resolver(client, config, DocumentTreeResolver)
    }

    pub fn spawn_with_resolver<C, R>(client: C, config: SessionConfig, resolver: R) -> Self
    where
        C: RemoteRpc + 'static,
        R: TreeResolver + Send + 'static,
    {
        let cache = Arc::new(RwLock::new(TorrentCache::new()));
        let tags = Arc::new(RwLock::new(TagIndex::new()));
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();

        let worker = Worker {
            client,
            cache: Arc::clone(&cache),
            tags: Arc::clone(&tags),
            reconciler: PermissionReconciler::new(resolver),
            events: event_tx,
            filter_active: false,
            seen_snapshot: false,
        };
        let poll_interval = config.poll_interval;
        let handle = thread::spawn(move || worker.run(command_rx, poll_interval));
        info!("session for profile {} started", config.profile);

        Self {
            profile: config.profile,
            cache,
            tags,
            commands: command_tx,
            events: event_rx,
            worker: Some(handle),
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    pub fn refresh(&self) {
        self.send(SessionCommand::Refresh);
    }

    pub fn set_filter_active(&self, active: bool) {
        self.send(SessionCommand::SetFilterActive(active));
    }

    pub fn snapshot(&self) -> Vec<TorrentRecord> {
        read(&self.cache).snapshot_all()
    }

    pub fn torrent(&self, id: TorrentId) -> Option<TorrentRecord> {
        read(&self.cache).get(id).cloned()
    }

    pub fn count(&self) -> usize {
        read(&self.cache).count()
    }

    pub fn tag_entries(&self) -> Vec<DisplayEntry> {
        read(&self.tags).project()
    }

    /// Plans `action` against the current cache and queues its calls.
    pub fn dispatch(
        &self,
        action: BulkAction,
        ids: &[TorrentId],
    ) -> Result<DispatchPlan, DispatchRefusal> {
        let plan = dispatch::dispatch(action, ids, &read(&self.cache))?;
        if !plan.calls.is_empty() {
            self.send(SessionCommand::Execute(plan.calls.clone()));
        }
        Ok(plan)
    }

    pub fn confirm_remove(
        &self,
        ids: &[TorrentId],
        delete_local_data: bool,
    ) -> Result<(), DispatchRefusal> {
        let call = dispatch::confirm_remove(ids, delete_local_data)?;
        self.send(SessionCommand::Execute(vec![call]));
        Ok(())
    }

    pub fn relocate(
        &self,
        id: TorrentId,
        location: &str,
        move_data: bool,
    ) -> Result<(), DispatchRefusal> {
        let call = dispatch::relocate(id, location, move_data)?;
        self.send(SessionCommand::Execute(vec![call]));
        Ok(())
    }

    /// Starts an authorization request for `id`; a stopped worker reads as
    /// nothing to do.
    pub fn begin_authorization(&self, id: TorrentId) -> BeginOutcome {
        let (reply, response) = bounded(1);
        self.send(SessionCommand::BeginAuthorization { id, reply });
        response.recv().unwrap_or(BeginOutcome::NoActionNeeded)
    }

    pub fn authorization_result(&self, fingerprint: Fingerprint, outcome: AuthorizationOutcome) {
        self.send(SessionCommand::CompleteAuthorization {
            fingerprint,
            outcome,
        });
    }

    pub fn persist_pending(&self) -> PersistedPending {
        let (reply, response) = bounded(1);
        self.send(SessionCommand::PersistPending { reply });
        response.recv().unwrap_or_default()
    }

    pub fn restore_pending(&self, persisted: PersistedPending) {
        self.send(SessionCommand::RestorePending(persisted));
    }

    fn send(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            warn!("session worker for {} is gone", self.profile);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
        if let Some(handle) = self.worker.take() {
            handle.join().ok();
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

struct Worker<C, R> {
    client: C,
    cache: Arc<RwLock<TorrentCache>>,
    tags: Arc<RwLock<TagIndex>>,
    reconciler: PermissionReconciler<R>,
    events: Sender<SessionEvent>,
    filter_active: bool,
    seen_snapshot: bool,
}

impl<C, R> Worker<C, R>
where
    C: RemoteRpc,
    R: TreeResolver,
{
    fn run(mut self, rx: Receiver<SessionCommand>, poll_interval: Duration) {
        let poll_enabled = poll_interval > Duration::ZERO;
        if !poll_enabled {
            while let Ok(cmd) = rx.recv() {
                if !self.handle_command(cmd) {
                    break;
                }
            }
            return;
        }
        loop {
            match rx.recv_timeout(poll_interval) {
                Ok(cmd) => {
                    if !self.handle_command(cmd) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => self.refresh(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Refresh => self.refresh(),
            SessionCommand::Execute(calls) => self.execute(calls),
            SessionCommand::SetFilterActive(active) => self.filter_active = active,
            SessionCommand::BeginAuthorization { id, reply } => {
                let outcome = self.reconciler.begin_request(id, &mut write(&self.cache));
                let _ = reply.send(outcome);
            }
            SessionCommand::CompleteAuthorization {
                fingerprint,
                outcome,
            } => self.complete_authorization(&fingerprint, outcome),
            SessionCommand::PersistPending { reply } => {
                let _ = reply.send(self.reconciler.persist());
            }
            SessionCommand::RestorePending(persisted) => {
                self.reconciler.restore(&persisted, &read(&self.cache));
            }
            SessionCommand::Shutdown => {
                self.reconciler.cancel_all();
                return false;
            }
        }
        true
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn refresh(&mut self) {
        let scope = if self.seen_snapshot {
            FetchScope::RecentlyActive
        } else {
            FetchScope::All
        };
        match self.client.fetch_torrents(scope) {
            Ok(list) => self.apply_list(list, scope),
            Err(err) => {
                warn!("torrent refresh failed: {err}");
                self.emit(SessionEvent::RefreshFailed(err.to_string()));
            }
        }
        match self.client.fetch_tags() {
            Ok(tags) => {
                let entries = {
                    let mut index = write(&self.tags);
                    index.replace(tags);
                    index.project()
                };
                self.emit(SessionEvent::TagsChanged(entries));
            }
            // Plain Transmission daemons have no tag support.
            Err(err) => debug!("tag refresh failed: {err}"),
        }
    }

    fn apply_list(&mut self, list: TorrentList, scope: FetchScope) {
        let first_snapshot = !self.seen_snapshot;
        self.seen_snapshot = true;

        let outcome = {
            let mut cache = write(&self.cache);
            let mut removed = list.removed;
            if scope == FetchScope::All {
                let listed: HashSet<TorrentId> =
                    list.torrents.iter().filter_map(|patch| patch.id).collect();
                removed.extend(
                    cache
                        .iter()
                        .map(|torrent| torrent.id)
                        .filter(|id| !listed.contains(id)),
                );
            }
            let delta = TorrentDelta {
                added: list.torrents,
                removed,
                updated: Vec::new(),
            };
            let outcome = cache.apply_delta(delta);
            self.reconciler.prune(&cache);
            outcome
        };

        if !first_snapshot && outcome.added == 0 && outcome.removed == 0 && outcome.updated == 0 {
            return;
        }
        let effects = effects_for_delta(&outcome, self.filter_active, first_snapshot);
        self.emit(SessionEvent::ListChanged { effects, outcome });
    }

    fn execute(&mut self, calls: Vec<OutboundCall>) {
        let mut any_succeeded = false;
        for call in calls {
            match self.client.execute(&call) {
                Ok(_) => {
                    any_succeeded = true;
                    if let Some(id) = call.evict_on_success {
                        self.evict(id);
                    }
                    self.emit(SessionEvent::CallCompleted {
                        method: call.method,
                    });
                }
                Err(err) => {
                    warn!("{} failed: {err}", call.method);
                    self.emit(SessionEvent::CallFailed {
                        method: call.method,
                        reason: err.to_string(),
                    });
                }
            }
        }
        if any_succeeded {
            self.refresh();
        }
    }

    fn evict(&mut self, id: TorrentId) {
        let outcome = {
            let mut cache = write(&self.cache);
            let previous_count = cache.count();
            if !cache.remove_from_cache(id) {
                return;
            }
            self.reconciler.prune(&cache);
            DeltaOutcome {
                previous_count,
                count: cache.count(),
                removed: 1,
                ..DeltaOutcome::default()
            }
        };
        debug!("evicted torrent {id} from cache");
        let effects = compute_effects(
            outcome.previous_count,
            outcome.count,
            0,
            1,
            self.filter_active,
        );
        self.emit(SessionEvent::ListChanged { effects, outcome });
    }

    fn complete_authorization(&mut self, fingerprint: &Fingerprint, outcome: AuthorizationOutcome) {
        if !self.reconciler.is_pending(fingerprint) {
            debug!("late authorization result for {} ignored", fingerprint.root);
            return;
        }
        let result = self
            .reconciler
            .complete(fingerprint, outcome, &mut write(&self.cache));
        for warning in &result.warnings {
            warn!("{warning}");
            self.emit(SessionEvent::Warning(warning.clone()));
        }
        let calls = result.calls();
        self.emit(SessionEvent::Reconciled(result));
        if calls.is_empty() {
            self.refresh();
        } else {
            self.execute(calls);
        }
    }
}
