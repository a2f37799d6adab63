use std::collections::HashMap;

use log::{debug, warn};

use crate::model::{TorrentDelta, TorrentId, TorrentRecord};

/// Counts describing what one `apply_delta` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaOutcome {
    pub previous_count: usize,
    pub count: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Records dropped because they were malformed.
    pub dropped: usize,
}

impl DeltaOutcome {
    pub fn non_empty(&self) -> bool {
        self.count > 0
    }
}

/// Last known state of every torrent, keyed by id.
///
/// Only server deltas change the record contents, apart from the two local
/// authorization markers (`needs_auth` clearing and `recheck_auth`).
#[derive(Debug, Default, Clone)]
pub struct TorrentCache {
    torrents: HashMap<TorrentId, TorrentRecord>,
}

impl TorrentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_delta(&mut self, delta: TorrentDelta) -> DeltaOutcome {
        let mut outcome = DeltaOutcome {
            previous_count: self.torrents.len(),
            ..DeltaOutcome::default()
        };

        for patch in delta.added {
            let Some(id) = patch.id else {
                outcome.dropped += 1;
                continue;
            };
            match self.torrents.get_mut(&id) {
                Some(existing) => {
                    patch.apply_to(existing);
                    outcome.updated += 1;
                }
                None => {
                    let mut record = TorrentRecord::new(id);
                    patch.apply_to(&mut record);
                    self.torrents.insert(id, record);
                    outcome.added += 1;
                }
            }
        }

        for patch in delta.updated {
            let Some(record) = patch.id.and_then(|id| self.torrents.get_mut(&id)) else {
                outcome.dropped += 1;
                continue;
            };
            patch.apply_to(record);
            outcome.updated += 1;
        }

        for id in delta.removed {
            if self.torrents.remove(&id).is_some() {
                outcome.removed += 1;
            }
        }

        outcome.count = self.torrents.len();
        if outcome.dropped > 0 {
            warn!(
                "dropped {} malformed torrent record(s) from delta",
                outcome.dropped
            );
        }
        debug!("applied torrent delta: {:?}", outcome);
        outcome
    }

    pub fn get(&self, id: TorrentId) -> Option<&TorrentRecord> {
        self.torrents.get(&id)
    }

    /// Copy of every cached record, ordered by id.
    pub fn snapshot_all(&self) -> Vec<TorrentRecord> {
        let mut records: Vec<TorrentRecord> = self.torrents.values().cloned().collect();
        records.sort_by_key(|record| record.id);
        records
    }

    pub fn count(&self) -> usize {
        self.torrents.len()
    }

    /// Evicts a torrent the server may never report as removed (magnets).
    pub fn remove_from_cache(&mut self, id: TorrentId) -> bool {
        self.torrents.remove(&id).is_some()
    }

    pub fn clear_needs_auth(&mut self, id: TorrentId) {
        if let Some(record) = self.torrents.get_mut(&id) {
            record.needs_auth = false;
        }
    }

    pub fn mark_recheck_auth(&mut self, id: TorrentId) {
        if let Some(record) = self.torrents.get_mut(&id) {
            record.recheck_auth = true;
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &TorrentRecord> {
        self.torrents.values()
    }
}
