use crate::config::{AppSettings, MonitorSettings, ServerProfile};
use crate::error::{AppError, AppResult};
use crate::events::{DisconnectReason, EventSink, StatusNotice};
use crate::logging::notice_text;
use crate::monitor::{self, MonitorHandle};
use crate::ssh::executor::CommandExecutor;
use crate::ssh::registry::ChannelRegistry;
use crate::ssh::transport::{AuthMethod, HostTarget, SessionRef, SshSession, SshTransport};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long disconnect waits for a monitoring round before closing its channels
const MONITOR_STOP_GRACE: Duration = Duration::from_secs(5);

/// Channel sweeps made for a monitor task that outlives its grace period
const MONITOR_REAP_SWEEPS: u32 = 3;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub connect_timeout: Duration,
    pub auto_start_monitoring: bool,
    pub monitor: MonitorSettings,
    pub background_timeout: Duration,
    pub monitor_stop_grace: Duration,
}

impl ManagerOptions {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            connect_timeout: settings.ssh.connect_timeout(),
            auto_start_monitoring: settings.ssh.auto_start_monitoring,
            monitor: settings.monitor.clone(),
            background_timeout: settings.lifecycle.background_timeout(),
            monitor_stop_grace: MONITOR_STOP_GRACE,
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_settings(&AppSettings::default())
    }
}

/// Jump session plus the loopback forward that reaches the target
struct Tunnel {
    session: Arc<dyn SshSession>,
    host: String,
    local_port: u16,
}

impl Tunnel {
    /// Forward first, then the session. Both are attempted.
    fn release(&self) {
        if let Err(e) = self.session.cancel_forward(self.local_port) {
            tracing::warn!(local_port = self.local_port, error = %e, "Failed to remove port forward");
        }
        if let Err(e) = self.session.disconnect() {
            tracing::warn!(host = %self.host, error = %e, "Failed to disconnect jump session");
        }
    }
}

struct Connection {
    generation: u64,
    target: HostTarget,
    primary: Arc<dyn SshSession>,
    tunnel: Option<Tunnel>,
    monitor: Option<MonitorHandle>,
}

/// Snapshot of the live connection for the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub via: Option<String>,
    pub forward_port: Option<u16>,
    pub monitoring: bool,
}

/// Owns the primary session and the optional jump session, and every
/// channel opened against them. Lifecycle operations are serialized.
pub struct ConnectionManager {
    transport: Arc<dyn SshTransport>,
    executor: CommandExecutor,
    events: EventSink,
    options: ManagerOptions,
    op_lock: tokio::sync::Mutex<()>,
    state: RwLock<Option<Connection>>,
    background: Mutex<Option<CancellationToken>>,
    generation: AtomicU64,
    this: Weak<Self>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn SshTransport>,
        options: ManagerOptions,
        events: EventSink,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            transport,
            executor: CommandExecutor::new(ChannelRegistry::new()),
            events,
            options,
            op_lock: tokio::sync::Mutex::new(()),
            state: RwLock::new(None),
            background: Mutex::new(None),
            generation: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn registry(&self) -> &ChannelRegistry {
        self.executor.registry()
    }

    /// Borrowed view of the primary session, if any
    pub fn session(&self) -> Option<SessionRef> {
        self.state
            .read()
            .as_ref()
            .map(|c| SessionRef::new(c.primary.clone()))
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .read()
            .as_ref()
            .is_some_and(|c| c.primary.is_connected())
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.state.read().as_ref().map(|c| ConnectionInfo {
            host: c.target.host.clone(),
            port: c.target.port,
            username: c.target.username.clone(),
            via: c.tunnel.as_ref().map(|t| t.host.clone()),
            forward_port: c.tunnel.as_ref().map(|t| t.local_port),
            monitoring: c.monitor.as_ref().is_some_and(|m| !m.is_finished()),
        })
    }

    /// Connect to `profile`, through its jump host when it has one.
    /// An existing connection is torn down first.
    pub async fn connect(&self, profile: &ServerProfile) -> AppResult<SessionRef> {
        profile.validate()?;
        let _op = self.op_lock.lock().await;

        if self.state.read().is_some() {
            self.disconnect_locked(DisconnectReason::Replaced).await;
        }

        self.events.status(StatusNotice::Connecting {
            host: profile.host.clone(),
            port: profile.port,
            via: profile.jump_host.as_ref().map(|j| j.host.clone()),
        });

        let (primary, tunnel) = match self.establish(profile).await {
            Ok(hops) => hops,
            Err(e) => {
                tracing::error!(host = %profile.host, port = profile.port, error = %e, "Connect failed");
                self.events.status(StatusNotice::ConnectFailed {
                    message: notice_text(&e.to_string()),
                });
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = SessionRef::new(primary.clone());
        let monitor = self
            .options
            .auto_start_monitoring
            .then(|| self.start_monitor(generation, session.clone()));

        *self.state.write() = Some(Connection {
            generation,
            target: profile.target(),
            primary,
            tunnel,
            monitor,
        });

        tracing::info!(host = %profile.host, port = profile.port, generation, "Connected");
        self.events.status(StatusNotice::Connected {
            host: profile.host.clone(),
            port: profile.port,
        });
        Ok(session)
    }

    async fn establish(
        &self,
        profile: &ServerProfile,
    ) -> AppResult<(Arc<dyn SshSession>, Option<Tunnel>)> {
        let target_auth = profile.auth_method()?;

        let Some(jump) = profile.jump_host.as_deref() else {
            let primary = self.open_hop(profile.target(), target_auth).await?;
            return Ok((primary, None));
        };

        let jump_auth = jump.auth_method()?;
        let jump_session = self.open_hop(jump.target(), jump_auth).await?;

        let forward = {
            let session = jump_session.clone();
            let host = profile.host.clone();
            let port = profile.port;
            tokio::task::spawn_blocking(move || session.forward_local(&host, port))
                .await
                .map_err(AppError::from)
                .and_then(|r| r)
        };
        let local_port = match forward {
            Ok(port) => port,
            Err(e) => {
                tracing::warn!(jump = %jump.host, error = %e, "Port forward failed, releasing jump session");
                let session = jump_session.clone();
                let _ = tokio::task::spawn_blocking(move || session.disconnect()).await;
                return Err(e);
            }
        };

        let tunnel = Tunnel {
            session: jump_session,
            host: jump.host.clone(),
            local_port,
        };
        tracing::debug!(jump = %tunnel.host, local_port, "Tunnel ready");

        let via = profile.target().redirected("127.0.0.1", local_port);
        match self.open_hop(via, target_auth).await {
            Ok(primary) => Ok((primary, Some(tunnel))),
            Err(e) => {
                let _ = tokio::task::spawn_blocking(move || tunnel.release()).await;
                Err(e)
            }
        }
    }

    /// One authenticated session under the hard connect deadline
    async fn open_hop(
        &self,
        target: HostTarget,
        auth: AuthMethod,
    ) -> AppResult<Arc<dyn SshSession>> {
        let timeout = self.options.connect_timeout;
        let host = target.host.clone();
        let port = target.port;
        let transport = self.transport.clone();

        let mut task =
            tokio::task::spawn_blocking(move || transport.connect(&target, &auth, timeout));

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => joined?,
            Err(_) => {
                tracing::warn!(host = %host, port, "Connect deadline exceeded");
                // The blocking attempt may still succeed; do not leak it
                tokio::spawn(async move {
                    if let Ok(Ok(late)) = task.await {
                        let _ = tokio::task::spawn_blocking(move || late.disconnect()).await;
                    }
                });
                Err(AppError::ConnectTimeout { host, port })
            }
        }
    }

    fn start_monitor(&self, generation: u64, session: SessionRef) -> MonitorHandle {
        let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();
        let handle = monitor::spawn(
            self.executor.clone(),
            session,
            &self.options.monitor,
            self.events.clone(),
            fail_tx,
        );

        let this = self.this.clone();
        tokio::spawn(async move {
            if let Some(failure) = fail_rx.recv().await {
                tracing::warn!(error = %failure.error, "Monitoring failed, disconnecting");
                if let Some(manager) = this.upgrade() {
                    manager
                        .disconnect_generation(generation, DisconnectReason::MonitorFailure)
                        .await;
                }
            }
        });

        handle
    }

    /// Start the monitoring loop on the current connection if it is not running
    pub async fn start_monitoring(&self) -> AppResult<()> {
        let _op = self.op_lock.lock().await;
        let mut state = self.state.write();
        let conn = state.as_mut().ok_or(AppError::SessionDisconnected)?;
        if conn.monitor.as_ref().is_some_and(|m| !m.is_finished()) {
            return Ok(());
        }
        conn.monitor = Some(self.start_monitor(
            conn.generation,
            SessionRef::new(conn.primary.clone()),
        ));
        Ok(())
    }

    pub async fn stop_monitoring(&self) {
        let _op = self.op_lock.lock().await;
        let handle = self.state.write().as_mut().and_then(|c| c.monitor.take());
        if let Some(handle) = handle {
            // Cancelled, so the round ends after its current command
            if handle.stop(self.options.monitor_stop_grace).await.is_some() {
                tracing::warn!("Monitoring round left to finish in the background");
            }
        }
    }

    /// Manual disconnect. Idempotent and never fails.
    pub async fn disconnect(&self) {
        self.disconnect_with(DisconnectReason::Manual).await;
    }

    pub async fn disconnect_with(&self, reason: DisconnectReason) {
        let _op = self.op_lock.lock().await;
        self.disconnect_locked(reason).await;
    }

    /// Only tears down if `generation` is still the live connection
    async fn disconnect_generation(&self, generation: u64, reason: DisconnectReason) {
        let _op = self.op_lock.lock().await;
        let current = self.state.read().as_ref().map(|c| c.generation);
        if current == Some(generation) {
            self.disconnect_locked(reason).await;
        }
    }

    /// Caller holds `op_lock`
    async fn disconnect_locked(&self, reason: DisconnectReason) -> bool {
        let Some(mut conn) = self.state.write().take() else {
            return false;
        };
        tracing::info!(host = %conn.target.host, ?reason, "Disconnecting");

        // Cancel before draining so no new probe channels appear
        let straggler = match conn.monitor.take() {
            Some(handle) => handle.stop(self.options.monitor_stop_grace).await,
            None => None,
        };

        self.sweep_channels();
        if let Some(task) = straggler {
            self.reap_monitor(task).await;
        }

        let primary = conn.primary;
        let tunnel = conn.tunnel;
        let host = conn.target.host;
        let teardown = tokio::task::spawn_blocking(move || {
            if let Err(e) = primary.disconnect() {
                tracing::warn!(host = %host, error = %e, "Failed to disconnect session");
            }
            if let Some(tunnel) = tunnel {
                tunnel.release();
            }
        })
        .await;
        if let Err(e) = teardown {
            tracing::error!(error = %e, "Session teardown task failed");
        }

        // Channels opened by holders of an old SessionRef during teardown
        self.registry().close_all();

        self.events.status(StatusNotice::Disconnected { reason });
        true
    }

    fn sweep_channels(&self) {
        let failures = self.registry().close_all();
        if !failures.is_empty() {
            tracing::warn!(count = failures.len(), "Some channels failed to close");
        }
    }

    /// Wait for a cancelled monitor task stuck in a remote command. Channels
    /// are swept again after each grace period. Abandoned after the last one.
    async fn reap_monitor(&self, mut task: JoinHandle<()>) {
        for sweep in 1..=MONITOR_REAP_SWEEPS {
            if tokio::time::timeout(self.options.monitor_stop_grace, &mut task)
                .await
                .is_ok()
            {
                return;
            }
            if sweep < MONITOR_REAP_SWEEPS {
                self.sweep_channels();
            }
        }
        tracing::warn!("Monitoring task did not stop, abandoning it");
        task.abort();
    }

    /// Host app went to background: disconnect after the configured delay
    /// unless `entered_foreground` comes first. Call from within the runtime.
    pub fn entered_background(&self) {
        let mut slot = self.background.lock();
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());

        let delay = self.options.background_timeout;
        let this = self.this.clone();
        tracing::debug!(delay_secs = delay.as_secs(), "Background disconnect timer started");

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let Some(manager) = this.upgrade() else { return };
                    if manager.claim_background_timer(&token) {
                        tracing::info!("Still in background, disconnecting");
                        manager.disconnect_with(DisconnectReason::BackgroundTimeout).await;
                    }
                }
            }
        });
    }

    pub fn entered_foreground(&self) {
        if let Some(token) = self.background.lock().take() {
            token.cancel();
            tracing::debug!("Background disconnect timer cancelled");
        }
    }

    fn claim_background_timer(&self, token: &CancellationToken) -> bool {
        let mut slot = self.background.lock();
        if token.is_cancelled() {
            return false;
        }
        slot.take();
        true
    }

    /// Process teardown
    pub async fn shutdown(&self) {
        self.entered_foreground();
        self.disconnect().await;
    }
}
