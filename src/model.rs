use serde::Deserialize;
use serde_with::{serde_as, NoneAsEmptyString};

pub type TorrentId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentStatus {
    Stopped,
    CheckWait,
    Checking,
    DownloadWait,
    Downloading,
    SeedWait,
    Seeding,
    Unknown(i64),
}

impl TorrentStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => TorrentStatus::Stopped,
            1 => TorrentStatus::CheckWait,
            2 => TorrentStatus::Checking,
            3 => TorrentStatus::DownloadWait,
            4 => TorrentStatus::Downloading,
            5 => TorrentStatus::SeedWait,
            6 => TorrentStatus::Seeding,
            other => TorrentStatus::Unknown(other),
        }
    }

    pub fn label(self) -> String {
        match self {
            TorrentStatus::Stopped => "stopped".to_string(),
            TorrentStatus::CheckWait => "check-wait".to_string(),
            TorrentStatus::Checking => "checking".to_string(),
            TorrentStatus::DownloadWait => "download-wait".to_string(),
            TorrentStatus::Downloading => "downloading".to_string(),
            TorrentStatus::SeedWait => "seed-wait".to_string(),
            TorrentStatus::Seeding => "seeding".to_string(),
            TorrentStatus::Unknown(code) => format!("status-{code}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStat {
    Ok,
    TrackerWarning,
    TrackerError,
    LocalError,
    Unknown(i64),
}

impl ErrorStat {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => ErrorStat::Ok,
            1 => ErrorStat::TrackerWarning,
            2 => ErrorStat::TrackerError,
            3 => ErrorStat::LocalError,
            other => ErrorStat::Unknown(other),
        }
    }
}

/// Last known state of one torrent on the remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentRecord {
    pub id: TorrentId,
    pub name: String,
    /// Filesystem path or `content://` document reference.
    pub download_dir: String,
    pub status: TorrentStatus,
    pub error: ErrorStat,
    pub error_string: Option<String>,
    pub is_magnet: bool,
    pub is_forced: bool,
    pub is_sequential: bool,
    pub needs_auth: bool,
    /// Set locally once an authorization grant covered this torrent.
    pub recheck_auth: bool,
    pub queue_position: i64,
    pub file_count: i64,
}

impl TorrentRecord {
    pub fn new(id: TorrentId) -> Self {
        Self {
            id,
            name: String::new(),
            download_dir: String::new(),
            status: TorrentStatus::Stopped,
            error: ErrorStat::Ok,
            error_string: None,
            is_magnet: false,
            is_forced: false,
            is_sequential: false,
            needs_auth: false,
            recheck_auth: false,
            queue_position: 0,
            file_count: 0,
        }
    }

    /// Single-file torrent: its download dir holds the file directly.
    pub fn is_simple(&self) -> bool {
        self.file_count == 1
    }

    pub fn is_stopped(&self) -> bool {
        self.status == TorrentStatus::Stopped
    }
}

/// Partial torrent fields as delivered by `torrent-get`. Absent fields leave
/// the cached value untouched.
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TorrentPatch {
    #[serde(default)]
    pub id: Option<TorrentId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "downloadDir")]
    pub download_dir: Option<String>,
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub error: Option<i64>,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default, alias = "errorString")]
    pub error_string: Option<String>,
    #[serde(default, alias = "isMagnet")]
    pub is_magnet: Option<bool>,
    #[serde(default, alias = "metadataPercentComplete")]
    pub metadata_percent_complete: Option<f64>,
    #[serde(default, alias = "isForced")]
    pub is_forced: Option<bool>,
    #[serde(default)]
    pub sequential: Option<bool>,
    #[serde(default, alias = "needsAuth")]
    pub needs_auth: Option<bool>,
    #[serde(default, alias = "queuePosition")]
    pub queue_position: Option<i64>,
    #[serde(default, alias = "fileCount")]
    pub file_count: Option<i64>,
}

impl TorrentPatch {
    pub fn with_id(id: TorrentId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn apply_to(&self, record: &mut TorrentRecord) {
        if let Some(name) = &self.name {
            record.name = name.clone();
        }
        if let Some(dir) = &self.download_dir {
            record.download_dir = dir.clone();
        }
        if let Some(status) = self.status {
            record.status = TorrentStatus::from_code(status);
        }
        if let Some(error) = self.error {
            record.error = ErrorStat::from_code(error);
            if record.error == ErrorStat::Ok {
                record.error_string = None;
            }
        }
        if self.error_string.is_some() {
            record.error_string = self.error_string.clone();
        }
        match (self.is_magnet, self.metadata_percent_complete) {
            (Some(flag), _) => record.is_magnet = flag,
            (None, Some(percent)) => record.is_magnet = percent < 1.0,
            (None, None) => {}
        }
        if let Some(forced) = self.is_forced {
            record.is_forced = forced;
        }
        if let Some(sequential) = self.sequential {
            record.is_sequential = sequential;
        }
        if let Some(needs_auth) = self.needs_auth {
            record.needs_auth = needs_auth;
            if !needs_auth {
                record.recheck_auth = false;
            }
        }
        if let Some(position) = self.queue_position {
            record.queue_position = position;
        }
        if let Some(count) = self.file_count {
            record.file_count = count;
        }
    }
}

/// One server-sourced change set for the torrent cache.
#[derive(Debug, Clone, Default)]
pub struct TorrentDelta {
    /// Full or partial records; unknown ids are inserted.
    pub added: Vec<TorrentPatch>,
    pub removed: Vec<TorrentId>,
    /// Partial records for torrents that must already be cached.
    pub updated: Vec<TorrentPatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Category,
    /// User tag, optionally grouped.
    Manual,
    Other(i64),
}

impl TagKind {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => TagKind::Category,
            3 => TagKind::Manual,
            other => TagKind::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagRecord {
    pub uid: i64,
    pub name: String,
    pub kind: TagKind,
    pub group: Option<String>,
    pub count: i64,
}
