//! Storage-authorization bookkeeping.
//!
//! Torrents whose download directory needs a user grant are batched by
//! [`Fingerprint`] so one prompt covers every torrent sharing a directory,
//! and one grant is reconciled back onto all of them.

use std::{collections::HashMap, path::Path};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    cache::TorrentCache,
    dispatch::{self, OutboundCall},
    model::{ErrorStat, TorrentId, TorrentRecord},
};

const CONTENT_SCHEME: &str = "content://";
const TREE_SEGMENT: &str = "/tree/";
const PROMPT_NAME_LIMIT: usize = 4;

pub fn is_content_path(path: &str) -> bool {
    path.starts_with(CONTENT_SCHEME)
}

/// Reduces a document URI to its tree identity
/// (`content://auth/tree/<id>/document/..` becomes `content://auth/tree/<id>`).
pub fn strip_tree_uri(uri: &str) -> String {
    if let Some(idx) = uri.find(TREE_SEGMENT) {
        let head = idx + TREE_SEGMENT.len();
        let rest = &uri[head..];
        let id_end = rest.find('/').unwrap_or(rest.len());
        return format!("{}{}", &uri[..head], &rest[..id_end]);
    }
    trim_trailing_slash(uri).to_string()
}

/// Maps a download directory to the tree URI a grant would have to cover.
pub trait TreeResolver {
    fn tree_uri(&self, path: &str) -> Option<String>;
}

/// Content references resolve to their tree root (or to themselves when they
/// carry no tree segment); absolute filesystem paths to a `file://` URI.
/// Anything else is unresolvable.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentTreeResolver;

impl TreeResolver for DocumentTreeResolver {
    fn tree_uri(&self, path: &str) -> Option<String> {
        if is_content_path(path) {
            return Some(strip_tree_uri(path));
        }
        if !path.starts_with('/') {
            return None;
        }
        Some(format!("file://{}", trim_trailing_slash(path)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub content: bool,
    pub root: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptSpec {
    pub fingerprint: Fingerprint,
    pub ids: Vec<TorrentId>,
    /// Up to four torrent names for display.
    pub names: Vec<String>,
    /// Torrents covered but not named.
    pub more: usize,
}

impl PromptSpec {
    pub fn root(&self) -> &str {
        &self.fingerprint.root
    }

    pub fn summary(&self) -> String {
        let mut text = self.names.join("\n");
        if self.more > 0 {
            text.push_str(&format!("\n+{} more", self.more));
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    Prompt(PromptSpec),
    /// A prompt for this fingerprint is already outstanding.
    AlreadyPending(Fingerprint),
    NoActionNeeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    Granted(String),
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub id: TorrentId,
    pub new_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub to_start: Vec<TorrentId>,
    pub to_relocate: Vec<Relocation>,
    pub to_recheck: Vec<TorrentId>,
    pub warnings: Vec<String>,
}

impl ReconciliationResult {
    /// Follow-up remote calls: one batched start plus one move per relocation.
    pub fn calls(&self) -> Vec<OutboundCall> {
        let mut calls = Vec::new();
        for relocation in &self.to_relocate {
            if let Ok(call) = dispatch::relocate(relocation.id, &relocation.new_path, true) {
                calls.push(call);
            }
        }
        if !self.to_start.is_empty() {
            calls.push(dispatch::start_call(&self.to_start));
        }
        calls
    }
}

/// Pending-authorization ids in the form a host persists across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistedPending {
    pub ids: Vec<TorrentId>,
}

pub struct PermissionReconciler<R = DocumentTreeResolver> {
    resolver: R,
    pending: HashMap<Fingerprint, Vec<TorrentId>>,
}

impl Default for PermissionReconciler<DocumentTreeResolver> {
    fn default() -> Self {
        Self::new(DocumentTreeResolver)
    }
}

impl<R: TreeResolver> PermissionReconciler<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            pending: HashMap::new(),
        }
    }

    pub fn begin_request(&mut self, id: TorrentId, cache: &mut TorrentCache) -> BeginOutcome {
        let Some(torrent) = cache.get(id) else {
            return BeginOutcome::NoActionNeeded;
        };
        if !torrent.needs_auth {
            return BeginOutcome::NoActionNeeded;
        }
        let name = torrent.name.clone();
        let Some(fingerprint) = self.fingerprint_of(torrent) else {
            // Nothing to ask for; leaving it unauthorized is harmless.
            debug!("no tree uri for torrent {id}; clearing needs-auth");
            cache.clear_needs_auth(id);
            return BeginOutcome::NoActionNeeded;
        };

        if let Some(ids) = self.pending.get_mut(&fingerprint) {
            if !ids.contains(&id) {
                ids.push(id);
            }
            return BeginOutcome::AlreadyPending(fingerprint);
        }

        let mut ids = vec![id];
        let mut names = vec![name];
        for other in cache.snapshot_all() {
            if other.id == id || !other.needs_auth {
                continue;
            }
            if self.fingerprint_of(&other).as_ref() != Some(&fingerprint) {
                continue;
            }
            ids.push(other.id);
            if names.len() < PROMPT_NAME_LIMIT {
                names.push(other.name);
            }
        }
        let more = ids.len() - names.len();
        debug!(
            "requesting authorization for {} covering {} torrent(s)",
            fingerprint.root,
            ids.len()
        );
        self.pending.insert(fingerprint.clone(), ids.clone());
        BeginOutcome::Prompt(PromptSpec {
            fingerprint,
            ids,
            names,
            more,
        })
    }

    /// Applies one authorization result. Results for a fingerprint that is
    /// no longer pending are ignored.
    pub fn complete(
        &mut self,
        fingerprint: &Fingerprint,
        outcome: AuthorizationOutcome,
        cache: &mut TorrentCache,
    ) -> ReconciliationResult {
        match outcome {
            AuthorizationOutcome::Granted(uri) => self.resolve_grant(fingerprint, &uri, cache),
            AuthorizationOutcome::Denied => {
                self.deny(fingerprint);
                ReconciliationResult::default()
            }
        }
    }

    pub fn resolve_grant(
        &mut self,
        fingerprint: &Fingerprint,
        granted: &str,
        cache: &mut TorrentCache,
    ) -> ReconciliationResult {
        let mut result = ReconciliationResult::default();
        let Some(ids) = self.pending.remove(fingerprint) else {
            debug!("ignoring grant for {}: nothing pending", fingerprint.root);
            return result;
        };
        let authed = strip_tree_uri(granted);
        let mut warned = false;

        for id in ids {
            let Some(torrent) = cache.get(id).cloned() else {
                continue;
            };
            if is_content_path(&torrent.download_dir) {
                if !warned {
                    let wanted = self.resolver.tree_uri(&torrent.download_dir);
                    if wanted.as_deref() != Some(authed.as_str()) {
                        result.warnings.push(wrong_path_warning(&authed, wanted.as_deref()));
                        warned = true;
                    }
                }
                cache.mark_recheck_auth(id);
                result.to_recheck.push(id);
                if torrent.is_stopped() && torrent.error == ErrorStat::LocalError {
                    result.to_start.push(id);
                }
                continue;
            }

            let (new_path, compare_dir) = relocation_target(&torrent, &authed);
            let wanted = compare_dir.and_then(|dir| self.resolver.tree_uri(&dir));
            if wanted.as_deref() != Some(authed.as_str()) {
                warn!(
                    "grant {} does not cover {} for torrent {}",
                    authed, torrent.download_dir, id
                );
                if !warned {
                    result.warnings.push(wrong_path_warning(&authed, wanted.as_deref()));
                    warned = true;
                }
                continue;
            }
            debug!("torrent {id} moving to {new_path}");
            result.to_relocate.push(Relocation { id, new_path });
        }
        result
    }

    pub fn deny(&mut self, fingerprint: &Fingerprint) -> Vec<TorrentId> {
        self.pending.remove(fingerprint).unwrap_or_default()
    }

    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    pub fn is_pending(&self, fingerprint: &Fingerprint) -> bool {
        self.pending.contains_key(fingerprint)
    }

    pub fn pending_ids(&self) -> Vec<TorrentId> {
        let mut ids: Vec<TorrentId> = self.pending.values().flatten().copied().collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn persist(&self) -> PersistedPending {
        PersistedPending {
            ids: self.pending_ids(),
        }
    }

    /// Rebuilds pending sets from persisted ids, regrouping each id still
    /// needing authorization under its own fingerprint.
    pub fn restore(&mut self, persisted: &PersistedPending, cache: &TorrentCache) {
        for &id in &persisted.ids {
            let Some(torrent) = cache.get(id).filter(|t| t.needs_auth) else {
                continue;
            };
            let Some(fingerprint) = self.fingerprint_of(torrent) else {
                continue;
            };
            let ids = self.pending.entry(fingerprint).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }

    /// Drops pending ids whose torrents vanished or no longer need auth.
    pub fn prune(&mut self, cache: &TorrentCache) {
        for ids in self.pending.values_mut() {
            ids.retain(|id| cache.get(*id).map(|t| t.needs_auth).unwrap_or(false));
        }
        self.pending.retain(|_, ids| !ids.is_empty());
    }

    pub fn fingerprint_of(&self, torrent: &TorrentRecord) -> Option<Fingerprint> {
        let content = is_content_path(&torrent.download_dir);
        let dir = if content || torrent.is_simple() {
            Some(torrent.download_dir.clone())
        } else {
            parent_dir(&torrent.download_dir)
        }?;
        let root = self.resolver.tree_uri(&dir)?;
        Some(Fingerprint { content, root })
    }
}

// Simple torrents move to the granted uri itself; others keep their last
// path segment under it and compare on the parent.
fn relocation_target(torrent: &TorrentRecord, authed: &str) -> (String, Option<String>) {
    if torrent.is_simple() {
        return (authed.to_string(), Some(torrent.download_dir.clone()));
    }
    let path = Path::new(&torrent.download_dir);
    let leaf = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    (
        format!("{}/{}", trim_trailing_slash(authed), leaf),
        parent_dir(&torrent.download_dir),
    )
}

fn parent_dir(path: &str) -> Option<String> {
    Path::new(path)
        .parent()
        .and_then(|parent| parent.to_str())
        .filter(|parent| !parent.is_empty())
        .map(str::to_string)
}

fn trim_trailing_slash(value: &str) -> &str {
    let trimmed = value.trim_end_matches('/');
    if trimmed.is_empty() {
        value
    } else {
        trimmed
    }
}

fn wrong_path_warning(authed: &str, wanted: Option<&str>) -> String {
    format!(
        "Authorized {} but {} was requested",
        authed,
        wanted.unwrap_or("an unknown location")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TorrentDelta, TorrentPatch};

    fn needs_auth(id: TorrentId, dir: &str, file_count: i64) -> TorrentPatch {
        let mut patch = TorrentPatch::with_id(id);
        patch.name = Some(format!("torrent {id}"));
        patch.download_dir = Some(dir.to_string());
        patch.needs_auth = Some(true);
        patch.file_count = Some(file_count);
        patch.status = Some(0);
        patch
    }

    fn cache_with(patches: Vec<TorrentPatch>) -> TorrentCache {
        let mut cache = TorrentCache::new();
        cache.apply_delta(TorrentDelta {
            added: patches,
            ..TorrentDelta::default()
        });
        cache
    }

    fn prompt(outcome: BeginOutcome) -> PromptSpec {
        match outcome {
            BeginOutcome::Prompt(spec) => spec,
            other => panic!("expected prompt, got {other:?}"),
        }
    }

    #[test]
    fn strips_document_part_of_tree_uri() {
        assert_eq!(
            strip_tree_uri("content://auth/tree/primary%3ADL/document/primary%3ADL%2Fx"),
            "content://auth/tree/primary%3ADL"
        );
        assert_eq!(strip_tree_uri("file:///data/"), "file:///data");
    }

    #[test]
    fn resolver_handles_both_path_kinds() {
        let resolver = DocumentTreeResolver;
        assert_eq!(
            resolver.tree_uri("content://auth/tree/a/document/b").as_deref(),
            Some("content://auth/tree/a")
        );
        assert_eq!(
            resolver.tree_uri("content://auth/document/b/").as_deref(),
            Some("content://auth/document/b")
        );
        assert_eq!(resolver.tree_uri("/srv/dl/").as_deref(), Some("file:///srv/dl"));
        assert_eq!(resolver.tree_uri("relative/dir"), None);
    }

    #[test]
    fn shared_directory_yields_one_prompt() {
        let mut cache = cache_with(vec![
            needs_auth(1, "/srv/dl/one", 3),
            needs_auth(2, "/srv/dl/two", 2),
            needs_auth(3, "/other/three", 2),
        ]);
        let mut reconciler = PermissionReconciler::default();

        let spec = prompt(reconciler.begin_request(1, &mut cache));
        assert_eq!(spec.ids, vec![1, 2]);
        assert_eq!(spec.root(), "file:///srv/dl");
        assert_eq!(spec.more, 0);

        assert_eq!(
            reconciler.begin_request(2, &mut cache),
            BeginOutcome::AlreadyPending(spec.fingerprint.clone())
        );
        assert_eq!(reconciler.pending_ids(), vec![1, 2]);
    }

    #[test]
    fn prompt_names_are_capped() {
        let patches = (1..=6)
            .map(|id| needs_auth(id, &format!("/srv/dl/t{id}"), 2))
            .collect();
        let mut cache = cache_with(patches);
        let mut reconciler = PermissionReconciler::default();
        let spec = prompt(reconciler.begin_request(3, &mut cache));
        assert_eq!(spec.ids.len(), 6);
        assert_eq!(spec.names.len(), 4);
        assert_eq!(spec.names[0], "torrent 3");
        assert_eq!(spec.more, 2);
        assert!(spec.summary().ends_with("+2 more"));
    }

    #[test]
    fn unresolvable_dir_clears_flag() {
        let mut cache = cache_with(vec![needs_auth(1, "relative/dir", 1)]);
        let mut reconciler = PermissionReconciler::default();
        assert_eq!(
            reconciler.begin_request(1, &mut cache),
            BeginOutcome::NoActionNeeded
        );
        assert!(!cache.get(1).unwrap().needs_auth);
        assert!(reconciler.pending_ids().is_empty());
    }

    #[test]
    fn content_grant_starts_locally_errored_torrent() {
        let mut patch = needs_auth(5, "content://x/tree/y", 2);
        patch.error = Some(3);
        let mut cache = cache_with(vec![patch]);
        let mut reconciler = PermissionReconciler::default();
        let spec = prompt(reconciler.begin_request(5, &mut cache));

        let result = reconciler.resolve_grant(
            &spec.fingerprint,
            "content://x/tree/y/document/y",
            &mut cache,
        );
        assert_eq!(result.to_start, vec![5]);
        assert_eq!(result.to_recheck, vec![5]);
        assert!(result.warnings.is_empty());
        assert!(cache.get(5).unwrap().recheck_auth);
        assert!(!reconciler.is_pending(&spec.fingerprint));
    }

    #[test]
    fn plain_content_reference_is_authorized_and_started() {
        let mut patch = needs_auth(5, "content://x/y", 2);
        patch.error = Some(3);
        let mut cache = cache_with(vec![patch]);
        let mut reconciler = PermissionReconciler::default();

        let spec = prompt(reconciler.begin_request(5, &mut cache));
        assert_eq!(spec.root(), "content://x/y");
        assert!(spec.fingerprint.content);

        let result = reconciler.resolve_grant(&spec.fingerprint, "content://x/y", &mut cache);
        assert_eq!(result.to_start, vec![5]);
        assert!(result.warnings.is_empty());
        assert_eq!(result.calls(), vec![dispatch::start_call(&[5])]);
    }

    #[test]
    fn content_mismatch_warns_once_but_rechecks_all() {
        let mut errored = needs_auth(2, "content://x/tree/y/document/b", 2);
        errored.error = Some(3);
        let mut cache = cache_with(vec![
            needs_auth(1, "content://x/tree/y/document/a", 2),
            errored,
            needs_auth(3, "content://x/tree/y/document/c", 2),
        ]);
        let mut reconciler = PermissionReconciler::default();
        let spec = prompt(reconciler.begin_request(1, &mut cache));
        assert_eq!(spec.ids, vec![1, 2, 3]);

        let result =
            reconciler.resolve_grant(&spec.fingerprint, "content://other/tree/z", &mut cache);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.to_recheck, vec![1, 2, 3]);
        assert_eq!(result.to_start, vec![2]);
        assert!(result.to_relocate.is_empty());
        assert!((1..=3).all(|id| cache.get(id).unwrap().recheck_auth));
    }

    #[test]
    fn single_mismatch_yields_single_warning() {
        let mut cache = cache_with(vec![
            needs_auth(1, "/srv/dl/a", 2),
            needs_auth(2, "/srv/dl/b", 2),
            needs_auth(3, "/srv/dl/c", 2),
        ]);
        let mut reconciler = PermissionReconciler::default();
        let spec = prompt(reconciler.begin_request(1, &mut cache));

        let result = reconciler.resolve_grant(&spec.fingerprint, "file:///elsewhere", &mut cache);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.to_relocate.is_empty());
    }

    #[test]
    fn matching_grant_relocates_every_torrent() {
        let mut cache = cache_with(vec![
            needs_auth(1, "/srv/dl/a", 2),
            needs_auth(2, "/srv/dl/b", 4),
        ]);
        let mut reconciler = PermissionReconciler::default();
        let spec = prompt(reconciler.begin_request(2, &mut cache));

        let result = reconciler.resolve_grant(&spec.fingerprint, "file:///srv/dl/", &mut cache);
        assert!(result.warnings.is_empty());
        assert_eq!(
            result.to_relocate,
            vec![
                Relocation {
                    id: 2,
                    new_path: "file:///srv/dl/b".to_string()
                },
                Relocation {
                    id: 1,
                    new_path: "file:///srv/dl/a".to_string()
                },
            ]
        );
        let calls = result.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].method, dispatch::METHOD_SET_LOCATION);
    }

    #[test]
    fn simple_torrent_moves_to_granted_uri() {
        let mut cache = cache_with(vec![needs_auth(1, "/srv/single", 1)]);
        let mut reconciler = PermissionReconciler::default();
        let spec = prompt(reconciler.begin_request(1, &mut cache));
        let result = reconciler.resolve_grant(&spec.fingerprint, "file:///srv/single", &mut cache);
        assert_eq!(
            result.to_relocate,
            vec![Relocation {
                id: 1,
                new_path: "file:///srv/single".to_string()
            }]
        );
    }

    #[test]
    fn denial_clears_pending_and_late_grant_is_no_op() {
        let mut cache = cache_with(vec![needs_auth(1, "/srv/dl/a", 2)]);
        let mut reconciler = PermissionReconciler::default();
        let spec = prompt(reconciler.begin_request(1, &mut cache));

        let result =
            reconciler.complete(&spec.fingerprint, AuthorizationOutcome::Denied, &mut cache);
        assert_eq!(result, ReconciliationResult::default());
        assert!(cache.get(1).unwrap().needs_auth);

        let late = reconciler.resolve_grant(&spec.fingerprint, "file:///srv/dl", &mut cache);
        assert_eq!(late, ReconciliationResult::default());

        // A later need starts fresh.
        assert!(matches!(
            reconciler.begin_request(1, &mut cache),
            BeginOutcome::Prompt(_)
        ));
    }

    #[test]
    fn persisted_ids_round_trip_through_restore() {
        let mut cache = cache_with(vec![
            needs_auth(1, "/srv/dl/a", 2),
            needs_auth(2, "/srv/dl/b", 2),
        ]);
        let mut reconciler = PermissionReconciler::default();
        reconciler.begin_request(1, &mut cache);
        let json = serde_json::to_string(&reconciler.persist()).unwrap();
        assert_eq!(json, "[1,2]");

        let persisted: PersistedPending = serde_json::from_str("[1,2,77]").unwrap();
        let mut restored = PermissionReconciler::default();
        restored.restore(&persisted, &cache);
        assert_eq!(restored.pending_ids(), vec![1, 2]);
    }

    #[test]
    fn prune_drops_ids_that_no_longer_need_auth() {
        let mut cache = cache_with(vec![
            needs_auth(1, "/srv/dl/a", 2),
            needs_auth(2, "/srv/dl/b", 2),
        ]);
        let mut reconciler = PermissionReconciler::default();
        let spec = prompt(reconciler.begin_request(1, &mut cache));

        let mut cleared = TorrentPatch::with_id(1);
        cleared.needs_auth = Some(false);
        cache.apply_delta(TorrentDelta {
            updated: vec![cleared],
            removed: vec![2],
            ..TorrentDelta::default()
        });
        reconciler.prune(&cache);
        assert!(!reconciler.is_pending(&spec.fingerprint));
    }
}
