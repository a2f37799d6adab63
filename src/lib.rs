//! Session-scoped coordinator for a remote BitTorrent client.
//!
//! Holds the last known torrent and tag state reported by the remote peer,
//! turns bulk user actions into remote calls, and reconciles storage
//! authorization grants across torrents that share a directory.

pub mod cache;
pub mod config;
pub mod diff;
pub mod dispatch;
pub mod model;
pub mod permissions;
pub mod rpc;
pub mod session;
pub mod tags;

pub use cache::{DeltaOutcome, TorrentCache};
pub use diff::{compute_effects, EmptyNotice, ListEffects};
pub use dispatch::{dispatch, BulkAction, DispatchPlan, DispatchRefusal, OutboundCall};
pub use model::{TagRecord, TorrentDelta, TorrentId, TorrentPatch, TorrentRecord};
pub use permissions::{
    AuthorizationOutcome, BeginOutcome, Fingerprint, PermissionReconciler, PromptSpec,
    ReconciliationResult,
};
pub use session::{Session, SessionEvent};
pub use tags::{project, DisplayEntry, TagIndex};
