use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use dirs::config_dir;
use log::LevelFilter;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub rpc: RpcConfig,
    pub session: SessionConfig,
    pub log_level: LevelFilter,
}

/// Per-session settings handed to the coordinator at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Label of the remote profile this session talks to.
    pub profile: String,
    /// Zero disables periodic refreshes.
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            poll_interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub verify_ssl: bool,
    pub user_agent: String,
    pub url: Option<String>,
}

impl RpcConfig {
    pub fn endpoint(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let mut path = self.path.clone();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, path)
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Remote torrent session controller", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
    #[arg(long, global = true)]
    pub profile: Option<String>,
    #[arg(long, global = true)]
    pub url: Option<String>,
    #[arg(long, global = true)]
    pub host: Option<String>,
    #[arg(long, global = true)]
    pub port: Option<u16>,
    #[arg(long, global = true)]
    pub path: Option<String>,
    #[arg(long, global = true)]
    pub username: Option<String>,
    #[arg(long, global = true)]
    pub password: Option<String>,
    #[arg(long, global = true)]
    pub timeout: Option<f64>,
    #[arg(long, global = true)]
    pub poll_interval: Option<f64>,
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub tls: bool,
    #[arg(long = "no-tls", global = true, action = ArgAction::SetTrue)]
    pub no_tls: bool,
    #[arg(long, global = true)]
    pub insecure: bool,
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the cached torrent list.
    List,
    /// Print the side tag list.
    Tags,
    /// Keep polling and report list changes.
    Watch,
    /// Ask for storage authorization covering a torrent's directory.
    Authorize { id: i64 },
    Start { ids: Vec<i64> },
    ForceStart { ids: Vec<i64> },
    Stop { ids: Vec<i64> },
    StartStop { ids: Vec<i64> },
    Sequential { ids: Vec<i64> },
    Verify { ids: Vec<i64> },
    Remove {
        ids: Vec<i64>,
        /// Confirm removal of non-magnet torrents.
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        delete_data: bool,
    },
    MoveTop { ids: Vec<i64> },
    MoveUp { ids: Vec<i64> },
    MoveDown { ids: Vec<i64> },
    MoveBottom { ids: Vec<i64> },
    Relocate {
        id: i64,
        #[arg(long)]
        to: Option<String>,
        /// Leave data where it is and only point the torrent at the new location.
        #[arg(long)]
        no_move: bool,
    },
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    rpc: Option<FileRpcConfig>,
    profile: Option<String>,
    poll_interval: Option<f64>,
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileRpcConfig {
    url: Option<String>,
    scheme: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    username: Option<String>,
    password: Option<String>,
    timeout: Option<f64>,
    tls: Option<bool>,
    verify_ssl: Option<bool>,
    user_agent: Option<String>,
}

pub fn build_config(cli: &Cli) -> Result<AppConfig> {
    let file_config = load_file_config(cli.config.as_deref())?;
    let rpc_file = file_config.as_ref().and_then(|cfg| cfg.rpc.as_ref());

    let url = cli
        .url
        .clone()
        .or_else(|| env::var("TRANSMISSION_URL").ok())
        .or_else(|| rpc_file.and_then(|cfg| cfg.url.clone()));

    let host = cli
        .host
        .clone()
        .or_else(|| env::var("TRANSMISSION_HOST").ok())
        .or_else(|| rpc_file.and_then(|cfg| cfg.host.clone()))
        .unwrap_or_else(|| "localhost".to_string());

    let port = cli
        .port
        .or_else(|| env_var_parse("TRANSMISSION_PORT"))
        .or_else(|| rpc_file.and_then(|cfg| cfg.port))
        .unwrap_or(9091);

    let path = cli
        .path
        .clone()
        .or_else(|| env::var("TRANSMISSION_RPC_PATH").ok())
        .or_else(|| rpc_file.and_then(|cfg| cfg.path.clone()))
        .unwrap_or_else(|| "/transmission/rpc".to_string());

    let username = cli
        .username
        .clone()
        .or_else(|| env::var("TRANSMISSION_USERNAME").ok())
        .or_else(|| rpc_file.and_then(|cfg| cfg.username.clone()));

    let password = cli
        .password
        .clone()
        .or_else(|| env::var("TRANSMISSION_PASSWORD").ok())
        .or_else(|| rpc_file.and_then(|cfg| cfg.password.clone()));

    let timeout_secs = cli
        .timeout
        .or_else(|| env_float("TRANSMISSION_TIMEOUT"))
        .or_else(|| rpc_file.and_then(|cfg| cfg.timeout))
        .unwrap_or(10.0);

    if timeout_secs <= 0.0 {
        anyhow::bail!("timeout must be positive");
    }

    let poll_secs = cli
        .poll_interval
        .or_else(|| env_float("TRANSMISSION_POLL_INTERVAL"))
        .or_else(|| file_config.as_ref().and_then(|cfg| cfg.poll_interval))
        .unwrap_or(3.0);

    if poll_secs < 0.0 {
        anyhow::bail!("poll interval cannot be negative");
    }

    let (scheme, verify_ssl) = transport(
        cli,
        rpc_file,
        env_bool("TRANSMISSION_TLS"),
        env_bool("TRANSMISSION_VERIFY_SSL"),
    );

    let user_agent = env::var("TRANSMISSION_USER_AGENT")
        .ok()
        .or_else(|| rpc_file.and_then(|cfg| cfg.user_agent.clone()))
        .unwrap_or_else(|| "transmission-session".to_string());

    let log_level_str = cli
        .log_level
        .clone()
        .or_else(|| env::var("TRANSMISSION_LOG_LEVEL").ok())
        .or_else(|| file_config.as_ref().and_then(|cfg| cfg.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let log_level = LevelFilter::from_str(&log_level_str).unwrap_or(LevelFilter::Info);

    let profile = cli
        .profile
        .clone()
        .or_else(|| env::var("TRANSMISSION_PROFILE").ok())
        .or_else(|| file_config.as_ref().and_then(|cfg| cfg.profile.clone()))
        .unwrap_or_else(|| SessionConfig::default().profile);

    Ok(AppConfig {
        rpc: RpcConfig {
            scheme,
            host,
            port,
            path,
            username,
            password,
            timeout: Duration::from_secs_f64(timeout_secs),
            verify_ssl,
            user_agent,
            url,
        },
        session: SessionConfig {
            profile,
            poll_interval: Duration::from_secs_f64(poll_secs.max(0.0)),
        },
        log_level,
    })
}

/// Scheme and certificate checking. Flags beat env, env beats the file, and
/// an explicit `scheme` in the file beats the TLS switch.
fn transport(
    cli: &Cli,
    rpc_file: Option<&FileRpcConfig>,
    tls_env: Option<bool>,
    verify_env: Option<bool>,
) -> (String, bool) {
    let tls_flag = match (cli.tls, cli.no_tls) {
        (true, _) => Some(true),
        (false, true) => Some(false),
        (false, false) => None,
    };
    let use_tls = tls_flag
        .or(tls_env)
        .or_else(|| rpc_file.and_then(|cfg| cfg.tls))
        .unwrap_or(false);
    let scheme = rpc_file
        .and_then(|cfg| cfg.scheme.clone())
        .unwrap_or_else(|| if use_tls { "https" } else { "http" }.to_string());

    let verify_ssl = !cli.insecure
        && verify_env
            .or_else(|| rpc_file.and_then(|cfg| cfg.verify_ssl))
            .unwrap_or(true);
    (scheme, verify_ssl)
}

fn load_file_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    if let Some(path) = path {
        return read_file_config(path);
    }

    if let Ok(env_path) = env::var("TRANSMISSION_SESSION_CONFIG") {
        return read_file_config(Path::new(&env_path));
    }

    if let Some(dir) = config_dir() {
        return read_file_config(&dir.join("transmission-session").join("config.toml"));
    }

    Ok(None)
}

fn read_file_config(path: &Path) -> Result<Option<FileConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let parsed: FileConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(Some(parsed))
}

fn env_var_parse<T>(name: &str) -> Option<T>
where
    T: FromStr,
{
    env::var(name).ok().and_then(|value| value.parse().ok())
}

fn env_float(name: &str) -> Option<f64> {
    env_var_parse(name)
}

fn env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .and_then(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}
