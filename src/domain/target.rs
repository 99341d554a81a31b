//! Monitored target definitions
//!
//! A `Target` is built once by the config loader and shared read-only with the
//! scheduler and checker for the whole run.

use std::{fmt, time::Duration};

use serde::Serialize;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const LOCAL_HOST: &str = "localhost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoverAction {
    Start,
    Restart,
}

impl RecoverAction {
    /// Anything other than `restart` falls back to `start`.
    pub fn from_config(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("restart") {
            Self::Restart
        } else {
            Self::Start
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for RecoverAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub host: String,
    pub user: Option<String>,
    pub port: u16,
}

impl RemoteEndpoint {
    /// `user@host`, or the bare host when no remote user is configured.
    pub fn destination(&self) -> String {
        match self.user.as_deref() {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecMethod {
    Local,
    Remote(RemoteEndpoint),
}

impl ExecMethod {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote(_) => "remote",
        }
    }
}

/// Secret material that must never reach logs or process arguments.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub secret: Secret,
}

#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub service: String,
    pub method: ExecMethod,
    pub active: bool,
    pub interval: Duration,
    pub timeout: Option<Duration>,
    pub recover_on_down: bool,
    pub recover_action: RecoverAction,
    pub use_sudo: bool,
    pub credentials: Option<Credentials>,
}

impl Target {
    pub fn host(&self) -> &str {
        match &self.method {
            ExecMethod::Local => LOCAL_HOST,
            ExecMethod::Remote(remote) => &remote.host,
        }
    }

    pub fn method_label(&self) -> &'static str {
        self.method.label()
    }

    #[cfg(test)]
    pub(crate) fn local(name: &str, service: &str) -> Self {
        Self {
            name: name.to_string(),
            service: service.to_string(),
            method: ExecMethod::Local,
            active: true,
            interval: Duration::from_secs(60),
            timeout: None,
            recover_on_down: true,
            recover_action: RecoverAction::Start,
            use_sudo: false,
            credentials: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn remote(name: &str, service: &str, host: &str, user: Option<&str>) -> Self {
        Self {
            method: ExecMethod::Remote(RemoteEndpoint {
                host: host.to_string(),
                user: user.map(str::to_string),
                port: DEFAULT_SSH_PORT,
            }),
            ..Self::local(name, service)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_recover_action_falls_back_to_start() {
        assert_eq!(RecoverAction::from_config("restart"), RecoverAction::Restart);
        assert_eq!(RecoverAction::from_config(" ReStart "), RecoverAction::Restart);
        assert_eq!(RecoverAction::from_config("reload"), RecoverAction::Start);
        assert_eq!(RecoverAction::from_config(""), RecoverAction::Start);
    }

    #[test]
    fn secret_is_redacted_in_debug_output() {
        let credentials = Credentials {
            user: "svc".to_string(),
            secret: Secret::new("hunter2"),
        };
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("Secret(***)"));
    }

    #[test]
    fn remote_destination_includes_user_when_present() {
        let with_user = Target::remote("db", "mysql", "10.0.0.5", Some("svcctl"));
        let without_user = Target::remote("db", "mysql", "10.0.0.5", None);

        match (&with_user.method, &without_user.method) {
            (ExecMethod::Remote(a), ExecMethod::Remote(b)) => {
                assert_eq!(a.destination(), "svcctl@10.0.0.5");
                assert_eq!(b.destination(), "10.0.0.5");
            }
            _ => panic!("expected remote targets"),
        }
        assert_eq!(with_user.host(), "10.0.0.5");
        assert_eq!(Target::local("web", "nginx").host(), LOCAL_HOST);
    }
}
