use log::info;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    cache::TorrentCache,
    model::{TorrentId, TorrentRecord},
};

pub const METHOD_START: &str = "torrent-start";
pub const METHOD_START_NOW: &str = "torrent-start-now";
pub const METHOD_STOP: &str = "torrent-stop";
pub const METHOD_VERIFY: &str = "torrent-verify";
pub const METHOD_REMOVE: &str = "torrent-remove";
pub const METHOD_SET: &str = "torrent-set";
pub const METHOD_SET_LOCATION: &str = "torrent-set-location";
pub const METHOD_QUEUE_TOP: &str = "queue-move-top";
pub const METHOD_QUEUE_UP: &str = "queue-move-up";
pub const METHOD_QUEUE_DOWN: &str = "queue-move-down";
pub const METHOD_QUEUE_BOTTOM: &str = "queue-move-bottom";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAction {
    Start,
    ForceStart,
    Stop,
    /// Stops the selection if any of it runs, otherwise starts it.
    StartStop,
    Sequential,
    Verify,
    Remove,
    MoveTop,
    MoveUp,
    MoveDown,
    MoveBottom,
    Relocate,
}

impl BulkAction {
    pub fn label(self) -> &'static str {
        match self {
            BulkAction::Start => "start",
            BulkAction::ForceStart => "force-start",
            BulkAction::Stop => "stop",
            BulkAction::StartStop => "start-stop",
            BulkAction::Sequential => "sequential",
            BulkAction::Verify => "verify",
            BulkAction::Remove => "remove",
            BulkAction::MoveTop => "move-top",
            BulkAction::MoveUp => "move-up",
            BulkAction::MoveDown => "move-down",
            BulkAction::MoveBottom => "move-bottom",
            BulkAction::Relocate => "relocate",
        }
    }

    /// Actions that mean nothing until a torrent has its metadata.
    fn needs_metadata(self) -> bool {
        matches!(
            self,
            BulkAction::ForceStart
                | BulkAction::Sequential
                | BulkAction::MoveTop
                | BulkAction::MoveUp
                | BulkAction::MoveDown
                | BulkAction::MoveBottom
                | BulkAction::Relocate
        )
    }
}

/// One remote call for the RPC collaborator to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCall {
    pub method: &'static str,
    pub arguments: Value,
    /// Torrent to evict from the cache once this call succeeds.
    pub evict_on_success: Option<TorrentId>,
}

impl OutboundCall {
    pub fn new(method: &'static str, arguments: Value) -> Self {
        Self {
            method,
            arguments,
            evict_on_success: None,
        }
    }

    fn with_ids(method: &'static str, ids: &[TorrentId]) -> Self {
        Self::new(method, json!({ "ids": ids }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPlan {
    pub action: BulkAction,
    pub calls: Vec<OutboundCall>,
    /// Non-magnet removals awaiting user confirmation.
    pub needs_confirmation: Vec<TorrentId>,
    /// New value computed for toggle actions.
    pub toggle: Option<bool>,
    /// Torrent awaiting a relocation destination.
    pub needs_destination: Option<TorrentId>,
}

impl DispatchPlan {
    fn new(action: BulkAction) -> Self {
        Self {
            action,
            calls: Vec::new(),
            needs_confirmation: Vec::new(),
            toggle: None,
            needs_destination: None,
        }
    }

    fn single(action: BulkAction, call: OutboundCall) -> Self {
        let mut plan = Self::new(action);
        plan.calls.push(call);
        plan
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchRefusal {
    #[error("no torrents selected")]
    EmptySelection,
    #[error("{action} supports a single torrent only")]
    UnsupportedForMultiple { action: &'static str },
    #[error("relocation target is empty")]
    EmptyLocation,
    #[error("{action} is unavailable for magnet placeholders")]
    MagnetOnly { action: &'static str },
}

pub fn dispatch(
    action: BulkAction,
    ids: &[TorrentId],
    cache: &TorrentCache,
) -> Result<DispatchPlan, DispatchRefusal> {
    if ids.is_empty() {
        return Err(DispatchRefusal::EmptySelection);
    }
    if action.needs_metadata() && all_magnets(ids, cache) {
        return Err(DispatchRefusal::MagnetOnly {
            action: action.label(),
        });
    }
    info!("dispatching {} for {} torrent(s)", action.label(), ids.len());

    let plan = match action {
        BulkAction::Start => DispatchPlan::single(action, start_call(ids)),
        BulkAction::Stop => DispatchPlan::single(action, OutboundCall::with_ids(METHOD_STOP, ids)),
        BulkAction::Verify => {
            DispatchPlan::single(action, OutboundCall::with_ids(METHOD_VERIFY, ids))
        }
        BulkAction::StartStop => {
            let any_running = ids
                .iter()
                .filter_map(|id| cache.get(*id))
                .any(|torrent| !torrent.is_stopped());
            let call = if any_running {
                OutboundCall::with_ids(METHOD_STOP, ids)
            } else {
                start_call(ids)
            };
            DispatchPlan::single(action, call)
        }
        BulkAction::ForceStart => {
            let force = !all_set(ids, cache, |t| t.is_forced);
            let method = if force { METHOD_START_NOW } else { METHOD_START };
            let mut plan = DispatchPlan::single(action, OutboundCall::with_ids(method, ids));
            plan.toggle = Some(force);
            plan
        }
        BulkAction::Sequential => {
            let sequential = !all_set(ids, cache, |t| t.is_sequential);
            let call = OutboundCall::new(
                METHOD_SET,
                json!({ "ids": ids, "sequential": sequential }),
            );
            let mut plan = DispatchPlan::single(action, call);
            plan.toggle = Some(sequential);
            plan
        }
        BulkAction::MoveTop => queue_move(action, METHOD_QUEUE_TOP, ids),
        BulkAction::MoveUp => queue_move(action, METHOD_QUEUE_UP, ids),
        BulkAction::MoveDown => queue_move(action, METHOD_QUEUE_DOWN, ids),
        BulkAction::MoveBottom => queue_move(action, METHOD_QUEUE_BOTTOM, ids),
        BulkAction::Remove => plan_remove(ids, cache),
        BulkAction::Relocate => {
            if ids.len() > 1 {
                return Err(DispatchRefusal::UnsupportedForMultiple {
                    action: action.label(),
                });
            }
            let mut plan = DispatchPlan::new(action);
            plan.needs_destination = Some(ids[0]);
            plan
        }
    };
    Ok(plan)
}

/// Second phase of a non-magnet removal, once the user confirmed it.
pub fn confirm_remove(
    ids: &[TorrentId],
    delete_local_data: bool,
) -> Result<OutboundCall, DispatchRefusal> {
    if ids.is_empty() {
        return Err(DispatchRefusal::EmptySelection);
    }
    Ok(OutboundCall::new(
        METHOD_REMOVE,
        json!({ "ids": ids, "delete-local-data": delete_local_data }),
    ))
}

pub fn relocate(
    id: TorrentId,
    location: &str,
    move_data: bool,
) -> Result<OutboundCall, DispatchRefusal> {
    let location = location.trim();
    if location.is_empty() {
        return Err(DispatchRefusal::EmptyLocation);
    }
    Ok(OutboundCall::new(
        METHOD_SET_LOCATION,
        json!({ "ids": [id], "location": location, "move": move_data }),
    ))
}

pub fn start_call(ids: &[TorrentId]) -> OutboundCall {
    OutboundCall::with_ids(METHOD_START, ids)
}

fn queue_move(action: BulkAction, method: &'static str, ids: &[TorrentId]) -> DispatchPlan {
    DispatchPlan::single(action, OutboundCall::with_ids(method, ids))
}

// Uncached ids read as unset.
fn all_set<F>(ids: &[TorrentId], cache: &TorrentCache, flag: F) -> bool
where
    F: Fn(&TorrentRecord) -> bool,
{
    ids.iter()
        .all(|id| cache.get(*id).map(&flag).unwrap_or(false))
}

// Uncached ids are not magnets.
fn all_magnets(ids: &[TorrentId], cache: &TorrentCache) -> bool {
    ids.iter()
        .all(|id| cache.get(*id).map(|t| t.is_magnet).unwrap_or(false))
}

fn plan_remove(ids: &[TorrentId], cache: &TorrentCache) -> DispatchPlan {
    let mut plan = DispatchPlan::new(BulkAction::Remove);
    for &id in ids {
        let is_magnet = cache.get(id).map(|t| t.is_magnet).unwrap_or(false);
        if is_magnet {
            let mut call = OutboundCall::new(
                METHOD_REMOVE,
                json!({ "ids": [id], "delete-local-data": true }),
            );
            // Magnet removals are not reliably reported back by the server.
            call.evict_on_success = Some(id);
            plan.calls.push(call);
        } else {
            plan.needs_confirmation.push(id);
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TorrentDelta, TorrentPatch};

    fn cache_with(patches: Vec<TorrentPatch>) -> TorrentCache {
        let mut cache = TorrentCache::new();
        cache.apply_delta(TorrentDelta {
            added: patches,
            ..TorrentDelta::default()
        });
        cache
    }

    fn torrent(id: TorrentId) -> TorrentPatch {
        let mut patch = TorrentPatch::with_id(id);
        patch.name = Some(format!("torrent {id}"));
        patch.status = Some(0);
        patch
    }

    fn magnet(id: TorrentId) -> TorrentPatch {
        let mut patch = torrent(id);
        patch.is_magnet = Some(true);
        patch
    }

    fn forced(id: TorrentId, value: bool) -> TorrentPatch {
        let mut patch = torrent(id);
        patch.is_forced = Some(value);
        patch
    }

    #[test]
    fn empty_selection_is_refused() {
        let cache = TorrentCache::new();
        for action in [BulkAction::Start, BulkAction::Remove, BulkAction::MoveTop] {
            assert_eq!(
                dispatch(action, &[], &cache),
                Err(DispatchRefusal::EmptySelection)
            );
        }
        assert_eq!(confirm_remove(&[], false), Err(DispatchRefusal::EmptySelection));
    }

    #[test]
    fn all_magnet_removal_needs_no_confirmation() {
        let cache = cache_with(vec![magnet(1), magnet(2)]);
        let plan = dispatch(BulkAction::Remove, &[1, 2], &cache).unwrap();
        assert!(plan.needs_confirmation.is_empty());
        assert_eq!(plan.calls.len(), 2);
        assert_eq!(plan.calls[0].arguments["ids"], json!([1]));
        assert_eq!(plan.calls[0].evict_on_success, Some(1));
        assert_eq!(plan.calls[1].evict_on_success, Some(2));
    }

    #[test]
    fn mixed_removal_routes_non_magnets_to_confirmation() {
        let cache = cache_with(vec![magnet(1), torrent(2), torrent(3)]);
        let plan = dispatch(BulkAction::Remove, &[1, 2, 3], &cache).unwrap();
        assert_eq!(plan.needs_confirmation, vec![2, 3]);
        assert_eq!(plan.calls.len(), 1);
        assert_eq!(plan.calls[0].arguments["ids"], json!([1]));

        let confirmed = confirm_remove(&plan.needs_confirmation, false).unwrap();
        assert_eq!(confirmed.method, METHOD_REMOVE);
        assert_eq!(confirmed.arguments["delete-local-data"], json!(false));
        assert_eq!(confirmed.evict_on_success, None);
    }

    #[test]
    fn force_start_toggles_on_aggregate_state() {
        let cache = cache_with(vec![forced(1, true), forced(2, false)]);
        let plan = dispatch(BulkAction::ForceStart, &[1, 2], &cache).unwrap();
        assert_eq!(plan.toggle, Some(true));
        assert_eq!(plan.calls[0].method, METHOD_START_NOW);
        assert_eq!(plan.calls[0].arguments["ids"], json!([1, 2]));

        let cache = cache_with(vec![forced(1, true), forced(2, true)]);
        let plan = dispatch(BulkAction::ForceStart, &[1, 2], &cache).unwrap();
        assert_eq!(plan.toggle, Some(false));
        assert_eq!(plan.calls[0].method, METHOD_START);
    }

    #[test]
    fn sequential_sends_new_scalar_in_one_call() {
        let mut first = torrent(1);
        first.sequential = Some(true);
        let cache = cache_with(vec![first, torrent(2)]);
        let plan = dispatch(BulkAction::Sequential, &[1, 2], &cache).unwrap();
        assert_eq!(plan.calls.len(), 1);
        assert_eq!(plan.calls[0].method, METHOD_SET);
        assert_eq!(plan.calls[0].arguments["sequential"], json!(true));
    }

    #[test]
    fn queue_moves_preserve_caller_order() {
        let cache = TorrentCache::new();
        let plan = dispatch(BulkAction::MoveBottom, &[9, 3, 5], &cache).unwrap();
        assert_eq!(plan.calls[0].method, METHOD_QUEUE_BOTTOM);
        assert_eq!(plan.calls[0].arguments["ids"], json!([9, 3, 5]));
        let plan = dispatch(BulkAction::MoveUp, &[2], &cache).unwrap();
        assert_eq!(plan.calls[0].method, METHOD_QUEUE_UP);
    }

    #[test]
    fn relocate_is_single_torrent_only() {
        let cache = cache_with(vec![torrent(1), torrent(2)]);
        assert_eq!(
            dispatch(BulkAction::Relocate, &[1, 2], &cache),
            Err(DispatchRefusal::UnsupportedForMultiple { action: "relocate" })
        );
        let plan = dispatch(BulkAction::Relocate, &[1], &cache).unwrap();
        assert!(plan.calls.is_empty());
        assert_eq!(plan.needs_destination, Some(1));

        let call = relocate(1, " /srv/new ", true).unwrap();
        assert_eq!(call.method, METHOD_SET_LOCATION);
        assert_eq!(call.arguments["location"], json!("/srv/new"));
        assert_eq!(relocate(1, "  ", true), Err(DispatchRefusal::EmptyLocation));
    }

    #[test]
    fn start_stop_stops_when_anything_runs() {
        let mut running = torrent(2);
        running.status = Some(4);
        let cache = cache_with(vec![torrent(1), running]);
        let plan = dispatch(BulkAction::StartStop, &[1, 2], &cache).unwrap();
        assert_eq!(plan.calls[0].method, METHOD_STOP);

        let plan = dispatch(BulkAction::StartStop, &[1], &cache).unwrap();
        assert_eq!(plan.calls[0].method, METHOD_START);
    }

    #[test]
    fn plain_actions_pass_ids_through() {
        let cache = TorrentCache::new();
        for (action, method) in [
            (BulkAction::Start, METHOD_START),
            (BulkAction::Stop, METHOD_STOP),
            (BulkAction::Verify, METHOD_VERIFY),
        ] {
            let plan = dispatch(action, &[4, 1], &cache).unwrap();
            assert_eq!(plan.calls, vec![OutboundCall::with_ids(method, &[4, 1])]);
        }
    }

    #[test]
    fn magnet_only_selection_refuses_metadata_actions() {
        let cache = cache_with(vec![magnet(1), magnet(2), torrent(3)]);
        for action in [
            BulkAction::ForceStart,
            BulkAction::Sequential,
            BulkAction::MoveTop,
            BulkAction::MoveDown,
            BulkAction::Relocate,
        ] {
            assert_eq!(
                dispatch(action, &[1], &cache),
                Err(DispatchRefusal::MagnetOnly {
                    action: action.label()
                })
            );
        }
        assert_eq!(
            dispatch(BulkAction::ForceStart, &[1, 2], &cache),
            Err(DispatchRefusal::MagnetOnly {
                action: "force-start"
            })
        );
        assert!(dispatch(BulkAction::Start, &[1], &cache).is_ok());
        assert!(dispatch(BulkAction::Verify, &[1, 2], &cache).is_ok());
    }

    #[test]
    fn mixed_selection_keeps_metadata_actions() {
        let cache = cache_with(vec![magnet(1), torrent(2)]);
        let plan = dispatch(BulkAction::ForceStart, &[1, 2], &cache).unwrap();
        assert_eq!(plan.toggle, Some(true));
        assert_eq!(plan.calls[0].arguments["ids"], json!([1, 2]));
        let plan = dispatch(BulkAction::MoveTop, &[1, 2], &cache).unwrap();
        assert_eq!(plan.calls[0].method, METHOD_QUEUE_TOP);
    }
}
