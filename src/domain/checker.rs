//! Status probes and remediation for a single target
//!
//! Every operation runs exactly one external command per attempt through a
//! `CommandRunner`, bounded by the target timeout. Failures are folded into the
//! returned result values instead of being propagated.

use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    domain::target::{ExecMethod, Target},
    errors::{ProbeError, RemediationError},
    systemd_client::{self, CommandError, CommandOutput, CommandRunner, Invocation},
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// `systemctl is-active` exit code for a unit that is known but not running.
pub const EXIT_INACTIVE: i32 = 3;

pub const UNKNOWN_STATUS: &str = "unknown";

static PERMISSION_DENIED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)permission|access denied|not permitted|authentication is required|interactive authentication required")
        .expect("permission pattern")
});

/// Outcome of a conclusive probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    Running { token: String },
    Stopped { token: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusResult {
    pub is_active: bool,
    pub status: String,
    pub error: Option<String>,
}

impl StatusResult {
    fn from_probe(outcome: Result<UnitState, ProbeError>, stdout_hint: Option<String>) -> Self {
        match outcome {
            Ok(UnitState::Running { token }) => Self {
                is_active: true,
                status: token,
                error: None,
            },
            Ok(UnitState::Stopped { token }) => Self {
                is_active: false,
                status: token,
                error: None,
            },
            Err(err) => Self {
                is_active: false,
                status: stdout_hint.unwrap_or_else(|| UNKNOWN_STATUS.to_string()),
                error: Some(err.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Privilege {
    None,
    Sudo,
    SwitchUser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub privilege: Privilege,
}

impl ActionResult {
    fn from_command(result: Result<CommandOutput, CommandError>, privilege: Privilege) -> Self {
        match result {
            Ok(output) => {
                let return_code = output.code.unwrap_or(-1);
                Self {
                    success: return_code == 0,
                    return_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    privilege,
                }
            }
            Err(err) => Self {
                success: false,
                return_code: -1,
                stdout: String::new(),
                stderr: err.to_string(),
                privilege,
            },
        }
    }

    pub fn error(&self) -> Option<RemediationError> {
        if self.success {
            return None;
        }

        let detail = if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            self.stderr.clone()
        };

        Some(if self.return_code < 0 {
            RemediationError::Command(detail)
        } else {
            RemediationError::NonZeroExit {
                code: self.return_code,
                detail,
            }
        })
    }

    fn permission_denied(&self) -> bool {
        PERMISSION_DENIED.is_match(&self.stderr) || PERMISSION_DENIED.is_match(&self.stdout)
    }
}

pub struct ServiceChecker {
    runner: Arc<dyn CommandRunner>,
    default_timeout: Duration,
}

impl ServiceChecker {
    pub fn new(runner: Arc<dyn CommandRunner>, default_timeout: Duration) -> Self {
        Self {
            runner,
            default_timeout,
        }
    }

    fn timeout_for(&self, target: &Target) -> Duration {
        target.timeout.unwrap_or(self.default_timeout)
    }

    fn wrap(&self, target: &Target, argv: Vec<String>) -> Invocation {
        let timeout = self.timeout_for(target);
        match &target.method {
            ExecMethod::Local => systemd_client::local(argv, timeout),
            ExecMethod::Remote(remote) => systemd_client::over_ssh(remote, &argv, timeout),
        }
    }

    pub async fn check_status(&self, target: &Target) -> StatusResult {
        let invocation = self.wrap(target, systemd_client::is_active_argv(&target.service));
        let result = self.runner.run(&invocation).await;
        let hint = result
            .as_ref()
            .ok()
            .and_then(|output| first_token(&output.stdout));

        StatusResult::from_probe(classify(result), hint)
    }

    pub async fn remediate(&self, target: &Target) -> ActionResult {
        let action = systemd_client::action_argv(target.recover_action, &target.service);
        let timeout = self.timeout_for(target);

        let remote = match &target.method {
            ExecMethod::Local => None,
            ExecMethod::Remote(remote) => Some(remote),
        };

        if let Some(remote) = remote {
            let (argv, privilege) = if target.use_sudo {
                (systemd_client::with_sudo(action), Privilege::Sudo)
            } else {
                (action, Privilege::None)
            };
            let invocation = systemd_client::over_ssh(remote, &argv, timeout);
            return self.execute(&invocation, privilege).await;
        }

        if let Some(credentials) = target.credentials.as_ref() {
            debug!(target_name = %target.name, user = %credentials.user, "running action as alternate user");
            let invocation =
                systemd_client::switch_user(&action, &credentials.user, &credentials.secret, timeout);
            return self.execute(&invocation, Privilege::SwitchUser).await;
        }

        let unelevated = self
            .execute(&systemd_client::local(action.clone(), timeout), Privilege::None)
            .await;
        if unelevated.success || !target.use_sudo || !unelevated.permission_denied() {
            return unelevated;
        }

        info!(target_name = %target.name, "permission denied, retrying with sudo");
        self.execute(
            &systemd_client::local(systemd_client::with_sudo(action), timeout),
            Privilege::Sudo,
        )
        .await
    }

    async fn execute(&self, invocation: &Invocation, privilege: Privilege) -> ActionResult {
        ActionResult::from_command(self.runner.run(invocation).await, privilege)
    }
}

/// Three-way reading of the `is-active` exit code.
pub fn classify(result: Result<CommandOutput, CommandError>) -> Result<UnitState, ProbeError> {
    let output = result?;
    let token = first_token(&output.stdout).unwrap_or_else(|| UNKNOWN_STATUS.to_string());

    match output.code {
        Some(0) => Ok(UnitState::Running { token }),
        Some(EXIT_INACTIVE) => Ok(UnitState::Stopped { token }),
        Some(code) => Err(ProbeError::Inconclusive {
            code,
            detail: first_non_empty(&output.stderr, &output.stdout, code),
        }),
        None => Err(ProbeError::Terminated {
            detail: first_non_empty(&output.stderr, &output.stdout, -1),
        }),
    }
}

fn first_token(text: &str) -> Option<String> {
    text.split_whitespace().next().map(str::to_string)
}

fn first_non_empty(stderr: &str, stdout: &str, code: i32) -> String {
    [stderr, stdout]
        .into_iter()
        .find(|text| !text.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("exit code {code}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::target::{Credentials, RecoverAction, Secret},
        systemd_client::testing::{exit, timeout, ScriptedRunner},
    };

    fn checker(runner: Arc<ScriptedRunner>) -> ServiceChecker {
        ServiceChecker::new(runner, DEFAULT_TIMEOUT)
    }

    #[tokio::test]
    async fn exit_zero_is_active() {
        let runner = Arc::new(ScriptedRunner::new(|_| exit(0, "active", "")));
        let status = checker(runner.clone())
            .check_status(&Target::local("web", "nginx"))
            .await;

        assert_eq!(
            status,
            StatusResult {
                is_active: true,
                status: "active".to_string(),
                error: None,
            }
        );
        assert_eq!(runner.calls()[0].argv(), vec!["systemctl", "is-active", "--", "nginx"]);
    }

    #[tokio::test]
    async fn exit_three_is_confirmed_down() {
        let runner = Arc::new(ScriptedRunner::new(|_| exit(3, "failed", "")));
        let status = checker(runner)
            .check_status(&Target::local("web", "nginx"))
            .await;

        assert!(!status.is_active);
        assert_eq!(status.status, "failed");
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn other_exit_codes_are_inconclusive() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            exit(4, "", "Failed to connect to bus: No such file or directory")
        }));
        let status = checker(runner)
            .check_status(&Target::local("web", "nginx"))
            .await;

        assert!(!status.is_active);
        assert_eq!(status.status, UNKNOWN_STATUS);
        let error = status.error.expect("inconclusive probes carry an error");
        assert!(error.contains("exit code 4"));
        assert!(error.contains("Failed to connect to bus"));
    }

    #[tokio::test]
    async fn remote_timeout_becomes_error_status() {
        let runner = Arc::new(ScriptedRunner::new(|_| timeout("ssh", 20)));
        let status = checker(runner.clone())
            .check_status(&Target::remote("db", "mysql", "10.10.0.15", Some("svcctl")))
            .await;

        assert!(!status.is_active);
        assert_eq!(status.status, UNKNOWN_STATUS);
        assert!(status.error.expect("error populated").contains("timed out"));
        assert_eq!(runner.calls()[0].program, "ssh");
    }

    #[tokio::test]
    async fn target_timeout_overrides_default() {
        let runner = Arc::new(ScriptedRunner::new(|_| exit(0, "active", "")));
        let mut target = Target::local("web", "nginx");
        target.timeout = Some(Duration::from_secs(3));

        checker(runner.clone()).check_status(&target).await;
        assert_eq!(runner.calls()[0].timeout, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn permission_denied_is_retried_once_with_sudo() {
        let runner = Arc::new(ScriptedRunner::new(|invocation| {
            if invocation.program == "sudo" {
                exit(0, "", "")
            } else {
                exit(4, "", "Failed to restart nginx.service: Access denied")
            }
        }));
        let mut target = Target::local("web", "nginx");
        target.use_sudo = true;
        target.recover_action = RecoverAction::Restart;

        let result = checker(runner.clone()).remediate(&target).await;

        assert!(result.success);
        assert_eq!(result.privilege, Privilege::Sudo);
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].argv(), vec!["systemctl", "restart", "--", "nginx"]);
        assert_eq!(
            calls[1].argv(),
            vec!["sudo", "-n", "systemctl", "restart", "--", "nginx"]
        );
    }

    #[tokio::test]
    async fn sudo_retry_failure_is_final() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            exit(1, "", "Interactive authentication required.")
        }));
        let mut target = Target::local("web", "nginx");
        target.use_sudo = true;

        let result = checker(runner.clone()).remediate(&target).await;

        assert!(!result.success);
        assert_eq!(result.privilege, Privilege::Sudo);
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn non_permission_failure_is_not_retried() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            exit(5, "", "Unit nginx.service not found.")
        }));
        let mut target = Target::local("web", "nginx");
        target.use_sudo = true;

        let result = checker(runner.clone()).remediate(&target).await;

        assert!(!result.success);
        assert_eq!(result.return_code, 5);
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(
            result.error().expect("failure detail").to_string(),
            "rc=5 Unit nginx.service not found."
        );
    }

    #[tokio::test]
    async fn permission_failure_without_use_sudo_is_final() {
        let runner = Arc::new(ScriptedRunner::new(|_| exit(4, "", "Access denied")));
        let target = Target::local("web", "nginx");

        let result = checker(runner.clone()).remediate(&target).await;

        assert!(!result.success);
        assert_eq!(result.privilege, Privilege::None);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn credentials_take_precedence_and_stay_off_the_command_line() {
        let runner = Arc::new(ScriptedRunner::new(|_| exit(1, "", "Authentication failure")));
        let mut target = Target::local("web", "nginx");
        target.use_sudo = true;
        target.credentials = Some(Credentials {
            user: "operator".to_string(),
            secret: Secret::new("pa55"),
        });

        let result = checker(runner.clone()).remediate(&target).await;

        assert!(!result.success);
        assert_eq!(result.privilege, Privilege::SwitchUser);
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "su");
        assert_eq!(calls[0].stdin.as_ref().map(Secret::expose), Some("pa55"));
        assert!(calls[0].args.iter().all(|arg| !arg.contains("pa55")));
    }

    #[tokio::test]
    async fn remote_remediation_uses_static_sudo_choice() {
        let runner = Arc::new(ScriptedRunner::new(|_| exit(1, "", "Access denied")));
        let mut target = Target::remote("db", "mysql", "10.10.0.15", Some("svcctl"));
        target.recover_action = RecoverAction::Restart;

        let unprefixed = checker(runner.clone()).remediate(&target).await;
        target.use_sudo = true;
        let prefixed = checker(runner.clone()).remediate(&target).await;

        assert!(!unprefixed.success);
        assert!(!prefixed.success);
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0].args.last().map(String::as_str),
            Some("systemctl restart -- mysql")
        );
        assert_eq!(
            calls[1].args.last().map(String::as_str),
            Some("sudo -n systemctl restart -- mysql")
        );
    }

    #[tokio::test]
    async fn command_failure_yields_negative_return_code() {
        let runner = Arc::new(ScriptedRunner::new(|_| timeout("systemctl", 20)));
        let result = checker(runner).remediate(&Target::local("web", "nginx")).await;

        assert!(!result.success);
        assert_eq!(result.return_code, -1);
        assert!(result.stderr.contains("timed out"));
        assert!(matches!(result.error(), Some(RemediationError::Command(_))));
    }
}
