//! Tick-driven scheduling of target cycles
//!
//! Every tick the scheduler walks the schedule, dispatches each due target as
//! its own task (bounded by a semaphore) and collects finished cycles. A
//! target's schedule entry is only advanced when it is dispatched, and a
//! target is never dispatched while its previous cycle is still running.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    audit::{AuditSink, LifecycleEvent, LifecycleRecord, RemediationRecord, StatusRecord},
    domain::{
        checker::{ActionResult, ServiceChecker, StatusResult},
        target::Target,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Healthy,
    DownNoRecovery,
    Inconclusive,
    Remediated,
    RemediationFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub dispatched: usize,
    pub skipped: usize,
    pub healthy: usize,
    pub down_no_recovery: usize,
    pub inconclusive: usize,
    pub remediated: usize,
    pub remediation_failed: usize,
    pub unexpected: usize,
}

impl RunSummary {
    fn count(&mut self, outcome: CycleOutcome) {
        match outcome {
            CycleOutcome::Healthy => self.healthy += 1,
            CycleOutcome::DownNoRecovery => self.down_no_recovery += 1,
            CycleOutcome::Inconclusive => self.inconclusive += 1,
            CycleOutcome::Remediated => self.remediated += 1,
            CycleOutcome::RemediationFailed => self.remediation_failed += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub target_name: String,
    pub next_due: Instant,
    in_flight: bool,
}

impl ScheduleEntry {
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub tick: Duration,
    pub max_parallel_probes: usize,
}

/// Probe, report, and remediate one target.
pub struct Monitor {
    checker: Arc<ServiceChecker>,
    sink: Arc<dyn AuditSink>,
}

impl Monitor {
    pub fn new(checker: Arc<ServiceChecker>, sink: Arc<dyn AuditSink>) -> Self {
        Self { checker, sink }
    }

    pub async fn monitor_target(&self, target: &Target) -> CycleOutcome {
        let status = self.checker.check_status(target).await;
        self.report_status(target, &status).await;

        if status.is_active {
            return CycleOutcome::Healthy;
        }

        if !target.recover_on_down {
            warn!("[{}] Service not active but recovery is disabled", target.name);
            return CycleOutcome::DownNoRecovery;
        }

        if let Some(error) = status.error.as_deref() {
            warn!(
                "[{}] Cannot remediate due to status check error: {}",
                target.name, error
            );
            return CycleOutcome::Inconclusive;
        }

        warn!(
            "[{}] Service '{}' is not active (status={}). Attempting {}...",
            target.name, target.service, status.status, target.recover_action
        );

        let action = self.checker.remediate(target).await;
        self.report_remediation(target, &action).await;

        if action.success {
            CycleOutcome::Remediated
        } else {
            CycleOutcome::RemediationFailed
        }
    }

    async fn report_status(&self, target: &Target, status: &StatusResult) {
        let mut metadata = Map::new();
        metadata.insert("method".to_string(), json!(target.method_label()));
        metadata.insert(
            "timeout_sec".to_string(),
            json!(target.timeout.map(|timeout| timeout.as_secs())),
        );
        metadata.insert("interval_sec".to_string(), json!(target.interval.as_secs()));

        let record = StatusRecord {
            timestamp: Utc::now(),
            target_name: target.name.clone(),
            service: target.service.clone(),
            status: status.status.clone(),
            is_active: status.is_active,
            host: target.host().to_string(),
            method: target.method_label().to_string(),
            metadata,
            error: status.error.clone(),
        };

        if let Err(err) = self.sink.record_status(&record).await {
            warn!(target_name = %target.name, error = %err, "failed to record status");
        }
    }

    async fn report_remediation(&self, target: &Target, action: &ActionResult) {
        let mut metadata = Map::new();
        metadata.insert("return_code".to_string(), json!(action.return_code));
        metadata.insert("stdout".to_string(), json!(action.stdout));
        metadata.insert("stderr".to_string(), json!(action.stderr));
        metadata.insert("use_sudo".to_string(), json!(target.use_sudo));
        metadata.insert("privilege".to_string(), json!(action.privilege));
        metadata.insert("method".to_string(), json!(target.method_label()));

        let record = RemediationRecord {
            timestamp: Utc::now(),
            target_name: target.name.clone(),
            service: target.service.clone(),
            action: target.recover_action.to_string(),
            success: action.success,
            host: target.host().to_string(),
            method: target.method_label().to_string(),
            metadata,
            error_detail: action.error().map(|err| err.to_string()),
        };

        if let Err(err) = self.sink.record_remediation(&record).await {
            warn!(target_name = %target.name, error = %err, "failed to record remediation");
        }
    }
}

type Joined = (usize, Result<CycleOutcome, JoinError>);

/// Stand-in deadline for intervals too long to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn next_due_after(now: Instant, interval: Duration) -> Instant {
    now.checked_add(interval)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

pub struct Scheduler {
    targets: Vec<Arc<Target>>,
    entries: Vec<ScheduleEntry>,
    monitor: Arc<Monitor>,
    sink: Arc<dyn AuditSink>,
    limiter: Arc<Semaphore>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(
        targets: Vec<Target>,
        checker: Arc<ServiceChecker>,
        sink: Arc<dyn AuditSink>,
        options: SchedulerOptions,
    ) -> Self {
        let now = Instant::now();
        let entries = targets
            .iter()
            .map(|target| ScheduleEntry {
                target_name: target.name.clone(),
                next_due: now,
                in_flight: false,
            })
            .collect();

        Self {
            targets: targets.into_iter().map(Arc::new).collect(),
            entries,
            monitor: Arc::new(Monitor::new(checker, sink.clone())),
            sink,
            limiter: Arc::new(Semaphore::new(options.max_parallel_probes.max(1))),
            tick: options.tick,
        }
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// One cycle per active target, regardless of intervals.
    pub async fn run_once(&mut self) -> RunSummary {
        self.record_lifecycle(LifecycleEvent::Start, self.start_detail("once"))
            .await;

        let mut summary = RunSummary::default();
        let mut tasks = JoinSet::new();
        for index in 0..self.targets.len() {
            if !self.targets[index].active {
                info!("[{}] skip=target_disabled", self.targets[index].name);
                summary.skipped += 1;
                continue;
            }
            self.dispatch(index, &mut tasks, &mut summary);
        }

        while let Some(joined) = tasks.join_next().await {
            self.settle(joined, &mut summary);
        }

        self.record_lifecycle(
            LifecycleEvent::Stop,
            json!({ "reason": "run_once_complete", "summary": summary }),
        )
        .await;
        summary
    }

    /// Ticks until `shutdown` resolves, then waits for in-flight cycles.
    pub async fn run_continuous<F>(&mut self, shutdown: F) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        self.record_lifecycle(LifecycleEvent::Start, self.start_detail("continuous"))
            .await;

        let mut summary = RunSummary::default();
        let mut tasks: JoinSet<Joined> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.settle(joined, &mut summary);
                }
                _ = ticker.tick() => {
                    for index in self.due(Instant::now(), &mut summary) {
                        self.dispatch(index, &mut tasks, &mut summary);
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "shutdown requested, waiting for in-flight checks");
        while let Some(joined) = tasks.join_next().await {
            self.settle(joined, &mut summary);
        }

        self.record_lifecycle(
            LifecycleEvent::Stop,
            json!({ "reason": "shutdown_signal", "summary": summary }),
        )
        .await;
        summary
    }

    /// Targets due at `now`; their entries move to `now + interval`.
    fn due(&mut self, now: Instant, summary: &mut RunSummary) -> Vec<usize> {
        let mut due = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            let target = &self.targets[index];
            if !target.active {
                debug!("[{}] skip=target_disabled", target.name);
                summary.skipped += 1;
                continue;
            }
            if entry.in_flight || now < entry.next_due {
                continue;
            }
            entry.next_due = next_due_after(now, target.interval);
            due.push(index);
        }
        due
    }

    fn dispatch(&mut self, index: usize, tasks: &mut JoinSet<Joined>, summary: &mut RunSummary) {
        self.entries[index].in_flight = true;
        summary.dispatched += 1;

        let target = self.targets[index].clone();
        let monitor = self.monitor.clone();
        let limiter = self.limiter.clone();

        // The inner task isolates panics so the outer one can always report
        // which target it belonged to.
        tasks.spawn(async move {
            let cycle = tokio::spawn(async move {
                let _permit = limiter.acquire_owned().await.ok();
                monitor.monitor_target(&target).await
            });
            (index, cycle.await)
        });
    }

    fn settle(&mut self, joined: Result<Joined, JoinError>, summary: &mut RunSummary) {
        match joined {
            Ok((index, result)) => {
                self.entries[index].in_flight = false;
                match result {
                    Ok(outcome) => summary.count(outcome),
                    Err(err) => {
                        summary.unexpected += 1;
                        error!(
                            "[{}] Unexpected error during monitoring: {}",
                            self.targets[index].name, err
                        );
                    }
                }
            }
            Err(err) => {
                summary.unexpected += 1;
                error!(error = %err, "monitoring task failed");
            }
        }
    }

    fn start_detail(&self, mode: &str) -> Value {
        let targets: Vec<Value> = self
            .targets
            .iter()
            .map(|target| {
                json!({
                    "name": target.name,
                    "service": target.service,
                    "interval": target.interval.as_secs(),
                    "active": target.active,
                })
            })
            .collect();

        json!({
            "mode": mode,
            "target_count": self.targets.len(),
            "tick_ms": u64::try_from(self.tick.as_millis()).unwrap_or(u64::MAX),
            "targets": targets,
        })
    }

    async fn record_lifecycle(&self, event: LifecycleEvent, detail: Value) {
        let record = LifecycleRecord {
            timestamp: Utc::now(),
            event,
            detail,
        };
        if let Err(err) = self.sink.record_lifecycle(&record).await {
            warn!(error = %err, "failed to record lifecycle event");
        }
    }
}
