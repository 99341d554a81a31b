use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::domain::target::{
    Credentials, ExecMethod, RecoverAction, RemoteEndpoint, Secret, Target, DEFAULT_SSH_PORT,
};

pub const DEFAULT_LOG_LEVEL: &str = "INFO";
pub const DEFAULT_INTERVAL_SEC: u64 = 60;
pub const DEFAULT_TIMEOUT_SEC: u64 = 20;
pub const DEFAULT_TICK_MS: u64 = 1_000;
pub const DEFAULT_MAX_PARALLEL_PROBES: usize = 8;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub log_destination: Option<PathBuf>,
    pub log_level: String,
    pub audit_path: Option<PathBuf>,
    pub status_bind: Option<SocketAddr>,
    pub tick: Duration,
    pub max_parallel_probes: usize,
    pub default_timeout: Duration,
    pub targets: Vec<Target>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("no targets defined in configuration")]
    NoTargets,
    #[error("target '{target}' missing service name")]
    MissingService { target: String },
    #[error("invalid method '{method}' for target '{target}' (expected local or remote)")]
    InvalidMethod { target: String, method: String },
    #[error("remote target '{target}' missing host")]
    MissingHost { target: String },
    #[error("target '{target}' interval_sec must be >= 1")]
    InvalidInterval { target: String },
    #[error("target '{target}' timeout_sec must be >= 1")]
    InvalidTimeout { target: String },
    #[error("target '{target}' credentials need both user and secret")]
    IncompleteCredentials { target: String },
    #[error("{setting} must be >= 1")]
    InvalidSetting { setting: &'static str },
    #[error("invalid status bind address '{0}'")]
    InvalidSocket(String),
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default, alias = "log_file")]
    log_destination: Option<String>,
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    audit_path: Option<String>,
    #[serde(default)]
    status_bind: Option<String>,
    #[serde(default)]
    tick_ms: Option<u64>,
    #[serde(default)]
    max_parallel_probes: Option<usize>,
    #[serde(default)]
    default_timeout_sec: Option<u64>,
    #[serde(default)]
    targets: Vec<RawTarget>,
}

#[derive(Debug, Deserialize)]
struct RawTarget {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default = "default_true")]
    active: bool,
    #[serde(default = "default_interval")]
    interval_sec: u64,
    #[serde(default)]
    timeout_sec: Option<u64>,
    #[serde(default = "default_true")]
    recover_on_down: bool,
    #[serde(default)]
    recover_action: Option<String>,
    #[serde(default)]
    use_sudo: bool,
    #[serde(default, alias = "ssh")]
    remote: Option<RawRemote>,
    #[serde(default)]
    credentials: Option<RawCredentials>,
}

#[derive(Debug, Deserialize)]
struct RawRemote {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawCredentials {
    #[serde(default)]
    user: Option<String>,
    #[serde(default, alias = "password")]
    secret: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SEC
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl MonitorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(contents)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }

        let tick_ms = raw.tick_ms.unwrap_or(DEFAULT_TICK_MS);
        if tick_ms == 0 {
            return Err(ConfigError::InvalidSetting { setting: "tick_ms" });
        }

        let max_parallel_probes = raw
            .max_parallel_probes
            .unwrap_or(DEFAULT_MAX_PARALLEL_PROBES);
        if max_parallel_probes == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "max_parallel_probes",
            });
        }

        let default_timeout_sec = raw.default_timeout_sec.unwrap_or(DEFAULT_TIMEOUT_SEC);
        if default_timeout_sec == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "default_timeout_sec",
            });
        }

        let status_bind = non_empty(raw.status_bind)
            .map(|value| parse_socket(&value))
            .transpose()?;

        let targets = raw
            .targets
            .into_iter()
            .map(RawTarget::into_target)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            log_destination: non_empty(raw.log_destination).map(PathBuf::from),
            log_level: non_empty(raw.log_level).unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            audit_path: non_empty(raw.audit_path).map(PathBuf::from),
            status_bind,
            tick: Duration::from_millis(tick_ms),
            max_parallel_probes,
            default_timeout: Duration::from_secs(default_timeout_sec),
            targets,
        })
    }

    pub fn active_targets(&self) -> usize {
        self.targets.iter().filter(|target| target.active).count()
    }
}

pub fn parse_socket(value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .trim()
        .parse::<SocketAddr>()
        .map_err(|_| ConfigError::InvalidSocket(value.to_string()))
}

impl RawTarget {
    fn into_target(self) -> Result<Target, ConfigError> {
        let service = non_empty(self.service).unwrap_or_default();
        let host = non_empty(self.host);
        let name = non_empty(self.name).unwrap_or_else(|| {
            format!(
                "{}-{}",
                host.as_deref().unwrap_or("local"),
                if service.is_empty() { "unknown" } else { service.as_str() }
            )
        });

        if service.is_empty() {
            return Err(ConfigError::MissingService { target: name });
        }

        let method_key = self
            .method
            .as_deref()
            .map(|method| method.trim().to_ascii_lowercase());
        let method = match method_key.as_deref() {
            None | Some("local") => ExecMethod::Local,
            Some("remote") | Some("ssh") => {
                let Some(host) = host else {
                    return Err(ConfigError::MissingHost { target: name });
                };
                let remote = self.remote.unwrap_or(RawRemote {
                    user: None,
                    port: None,
                });
                ExecMethod::Remote(RemoteEndpoint {
                    host,
                    user: non_empty(remote.user),
                    port: remote.port.unwrap_or(DEFAULT_SSH_PORT),
                })
            }
            Some(_) => {
                return Err(ConfigError::InvalidMethod {
                    target: name,
                    method: self.method.unwrap_or_default(),
                })
            }
        };

        if self.interval_sec < 1 {
            return Err(ConfigError::InvalidInterval { target: name });
        }

        if self.timeout_sec == Some(0) {
            return Err(ConfigError::InvalidTimeout { target: name });
        }

        let credentials = match self.credentials {
            None => None,
            Some(raw) => match (non_empty(raw.user), raw.secret.filter(|s| !s.is_empty())) {
                (None, None) => None,
                (Some(user), Some(secret)) => Some(Credentials {
                    user,
                    secret: Secret::new(secret),
                }),
                _ => return Err(ConfigError::IncompleteCredentials { target: name }),
            },
        };

        Ok(Target {
            name,
            service,
            method,
            active: self.active,
            interval: Duration::from_secs(self.interval_sec),
            timeout: self.timeout_sec.map(Duration::from_secs),
            recover_on_down: self.recover_on_down,
            recover_action: RecoverAction::from_config(self.recover_action.as_deref().unwrap_or("start")),
            use_sudo: self.use_sudo,
            credentials,
        })
    }
}

/// Example document printed by `--print-example`.
pub const EXAMPLE_CONFIG: &str = r#"{
  "log_destination": "logs/service_monitor.log",
  "log_level": "INFO",
  "audit_path": "logs/audit.jsonl",
  "status_bind": "127.0.0.1:9105",
  "targets": [
    {
      "name": "local-prometheus",
      "service": "prometheus.service",
      "method": "local",
      "active": true,
      "interval_sec": 30,
      "recover_on_down": true,
      "recover_action": "restart",
      "use_sudo": false
    },
    {
      "name": "remote-mysql",
      "service": "mysql.service",
      "method": "remote",
      "host": "10.10.0.15",
      "active": true,
      "interval_sec": 60,
      "timeout_sec": 20,
      "remote": { "user": "svcctl", "port": 22 },
      "recover_on_down": true,
      "recover_action": "restart",
      "use_sudo": true
    }
  ]
}
"#;
