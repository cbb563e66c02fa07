//! Periodic metric sampling over the active session

pub mod probes;

use crate::config::MonitorSettings;
use crate::error::{AppError, AppResult};
use crate::events::{CoreEvent, EventSink, StatusNotice};
use crate::logging::notice_text;
use crate::ssh::{CommandExecutor, SessionRef};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One tick of metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringSample {
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub disk_read_rate: f64,
    pub disk_write_rate: f64,
    pub gpu_percent: f64,
    pub uptime_text: String,
    pub timestamp: DateTime<Utc>,
}

/// Sent once when a probe round fails and the loop gives up
#[derive(Debug)]
pub struct MonitorFailure {
    pub error: AppError,
}

/// Run every probe in order. Returns `None` once cancelled, including when
/// a command fails because disconnect closed its channel.
pub fn sample_once(
    exec: &CommandExecutor,
    session: &SessionRef,
    gpu_probe: bool,
    token: &CancellationToken,
) -> AppResult<Option<MonitoringSample>> {
    macro_rules! probe {
        ($e:expr) => {{
            if token.is_cancelled() {
                return Ok(None);
            }
            match $e {
                Ok(value) => value,
                Err(_) if token.is_cancelled() => return Ok(None),
                Err(e) => return Err(e),
            }
        }};
    }

    let cpu_percent = probe!(probes::cpu_percent(exec, session));
    let mem_percent = probe!(probes::memory_percent(exec, session));
    let (disk_read_rate, disk_write_rate) = probe!(probes::disk_io(exec, session));
    let gpu_percent = if gpu_probe {
        probe!(probes::gpu_percent(exec, session, token))
    } else {
        0.0
    };
    let uptime_text = probe!(probes::uptime_text(exec, session, token));

    Ok(Some(MonitoringSample {
        cpu_percent,
        mem_percent,
        disk_read_rate,
        disk_write_rate,
        gpu_percent,
        uptime_text,
        timestamp: Utc::now(),
    }))
}

/// Handle to a running loop
pub struct MonitorHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait up to `grace` for the current round to notice.
    /// Returns the task if it is still stuck in a remote command.
    pub async fn stop(mut self, grace: Duration) -> Option<JoinHandle<()>> {
        self.token.cancel();
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(_) => None,
            Err(_) => {
                tracing::warn!("Monitoring round still running after cancel");
                Some(self.task)
            }
        }
    }
}

/// Start sampling. A failed round ends the loop and reports on `failures`.
pub fn spawn(
    exec: CommandExecutor,
    session: SessionRef,
    settings: &MonitorSettings,
    events: EventSink,
    failures: mpsc::UnboundedSender<MonitorFailure>,
) -> MonitorHandle {
    let token = CancellationToken::new();
    let interval = settings.interval();
    let gpu_probe = settings.gpu_probe;
    let loop_token = token.clone();

    let task = tokio::spawn(async move {
        tracing::info!(interval_ms = interval.as_millis() as u64, "Monitoring started");
        loop {
            if loop_token.is_cancelled() {
                break;
            }

            let round = {
                let exec = exec.clone();
                let session = session.clone();
                let token = loop_token.clone();
                tokio::task::spawn_blocking(move || sample_once(&exec, &session, gpu_probe, &token))
                    .await
                    .map_err(AppError::from)
                    .and_then(|r| r)
            };

            match round {
                Ok(Some(sample)) => events.emit(CoreEvent::Sample(sample)),
                Ok(None) => break,
                Err(_) if loop_token.is_cancelled() => break,
                Err(error) => {
                    tracing::error!(error = %error, "Monitoring round failed");
                    events.status(StatusNotice::MonitorError {
                        message: notice_text(&error.to_string()),
                    });
                    let _ = failures.send(MonitorFailure { error });
                    break;
                }
            }

            tokio::select! {
                biased;
                _ = loop_token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("Monitoring stopped");
    });

    MonitorHandle { token, task }
}
