use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use anyhow::Result;
use log::{debug, warn};
use reqwest::{blocking::Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    config::RpcConfig,
    dispatch::OutboundCall,
    model::{TagKind, TagRecord, TorrentId, TorrentPatch},
};

pub const TORRENT_FIELDS: &[&str] = &[
    "id",
    "name",
    "downloadDir",
    "status",
    "error",
    "errorString",
    "isForced",
    "sequential",
    "needsAuth",
    "queuePosition",
    "fileCount",
    "metadataPercentComplete",
];

#[derive(Debug, Error)]
pub enum TransmissionError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("authentication failed")]
    Authentication,
    #[error("session negotiation failed")]
    Session,
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("response parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type RpcResult<T> = std::result::Result<T, TransmissionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchScope {
    All,
    RecentlyActive,
}

/// Torrents reported by one `torrent-get`.
#[derive(Debug, Clone, Default)]
pub struct TorrentList {
    pub torrents: Vec<TorrentPatch>,
    /// Only reported for `RecentlyActive` fetches.
    pub removed: Vec<TorrentId>,
}

/// The remote control protocol as seen by a session.
pub trait RemoteRpc: Send {
    fn execute(&self, call: &OutboundCall) -> RpcResult<Value>;
    fn fetch_torrents(&self, scope: FetchScope) -> RpcResult<TorrentList>;
    fn fetch_tags(&self) -> RpcResult<Vec<TagRecord>>;
}

pub struct TransmissionClient {
    http: Client,
    endpoint: String,
    auth: Option<(String, Option<String>)>,
    session_id: Mutex<Option<String>>,
    counter: AtomicU64,
}

impl TransmissionClient {
    pub fn new(config: RpcConfig) -> Result<Self> {
        let endpoint = config.endpoint();
        let RpcConfig {
            username,
            password,
            timeout,
            verify_ssl,
            user_agent,
            ..
        } = config;
        let mut builder = Client::builder().timeout(timeout).user_agent(user_agent);
        if !verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build()?;
        let auth = username.map(|user| (user, password));
        Ok(Self {
            http,
            endpoint,
            auth,
            session_id: Mutex::new(None),
            counter: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn call<T>(&self, method: &str, arguments: Option<Value>) -> RpcResult<T>
    where
        T: DeserializeOwned,
    {
        let value = self.call_raw(method, arguments)?;
        serde_json::from_value(value).map_err(TransmissionError::from)
    }

    fn call_raw(&self, method: &str, arguments: Option<Value>) -> RpcResult<Value> {
        let payload = RpcRequest {
            method,
            arguments,
            tag: self.counter.fetch_add(1, Ordering::Relaxed),
        };
        debug!("rpc {} (tag {})", payload.method, payload.tag);
        loop {
            let mut request = self
                .http
                .post(&self.endpoint)
                .header("Content-Type", "application/json")
                .json(&payload);
            if let Some((user, pass)) = &self.auth {
                request = request.basic_auth(user, pass.as_ref());
            }
            let session_header = match self.session_id.lock() {
                Ok(guard) => (*guard).clone(),
                Err(_) => None,
            };
            if let Some(session) = session_header {
                request = request.header("X-Transmission-Session-Id", session);
            }
            let response = request.send()?;
            match response.status() {
                StatusCode::CONFLICT => {
                    if let Some(id) = response.headers().get("X-Transmission-Session-Id") {
                        let value = id
                            .to_str()
                            .map_err(|_| TransmissionError::Session)?
                            .to_string();
                        if let Ok(mut guard) = self.session_id.lock() {
                            *guard = Some(value);
                        }
                        continue;
                    }
                    return Err(TransmissionError::Session);
                }
                StatusCode::UNAUTHORIZED => return Err(TransmissionError::Authentication),
                status if !status.is_success() => {
                    return Err(TransmissionError::HttpStatus(status));
                }
                _ => {
                    let body: RpcResponse = response.json()?;
                    if body.result != "success" {
                        return Err(TransmissionError::Rpc(body.result));
                    }
                    return Ok(body.arguments.unwrap_or(Value::Null));
                }
            }
        }
    }
}

impl RemoteRpc for TransmissionClient {
    fn execute(&self, call: &OutboundCall) -> RpcResult<Value> {
        self.call_raw(call.method, Some(call.arguments.clone()))
    }

    fn fetch_torrents(&self, scope: FetchScope) -> RpcResult<TorrentList> {
        let args = match scope {
            FetchScope::All => json!({ "fields": TORRENT_FIELDS }),
            FetchScope::RecentlyActive => json!({
                "ids": "recently-active",
                "fields": TORRENT_FIELDS,
            }),
        };
        let response: TorrentGetResponse = self.call("torrent-get", Some(args))?;
        Ok(response.into())
    }

    fn fetch_tags(&self) -> RpcResult<Vec<TagRecord>> {
        let response: TagListResponse = self.call("tags-get-list", None)?;
        Ok(decode_lenient::<TagWire>(response.tags, "tag")
            .into_iter()
            .map(TagRecord::from)
            .collect())
    }
}

/// Decodes each entry on its own so one bad record does not sink the list.
fn decode_lenient<T>(values: Vec<Value>, kind: &str) -> Vec<T>
where
    T: DeserializeOwned,
{
    let total = values.len();
    let decoded: Vec<T> = values
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect();
    if decoded.len() < total {
        warn!(
            "skipped {} undecodable {} record(s)",
            total - decoded.len(),
            kind
        );
    }
    decoded
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
    tag: u64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    arguments: Option<Value>,
    result: String,
}

#[derive(Debug, Deserialize)]
struct TorrentGetResponse {
    #[serde(default)]
    torrents: Vec<Value>,
    #[serde(default)]
    removed: Vec<Value>,
}

impl From<TorrentGetResponse> for TorrentList {
    fn from(response: TorrentGetResponse) -> Self {
        TorrentList {
            torrents: decode_lenient(response.torrents, "torrent"),
            removed: response.removed.iter().filter_map(Value::as_i64).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TagListResponse {
    #[serde(default)]
    tags: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TagWire {
    uid: i64,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "type")]
    kind: i64,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    count: i64,
}

impl From<TagWire> for TagRecord {
    fn from(wire: TagWire) -> Self {
        TagRecord {
            uid: wire.uid,
            name: wire.name,
            kind: TagKind::from_code(wire.kind),
            group: wire.group.filter(|group| !group.is_empty()),
            count: wire.count,
        }
    }
}
