use crate::config::{self, AppSettings, ProfileManager};
use crate::error::{AppError, AppResult};
use crate::events::EventSink;
use crate::monitor::probes::{self, ProcessInfo};
use crate::scan::{self, ScanRun, Scanner};
use crate::ssh::{ConnectionInfo, ConnectionManager, ManagerOptions, Ssh2Transport, SshTransport};
use crate::terminal::TerminalSession;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Global application state
pub struct AppState {
    pub settings: Arc<RwLock<AppSettings>>,
    pub profiles: Arc<RwLock<ProfileManager>>,
    pub connections: Arc<ConnectionManager>,
    pub terminal: Arc<TerminalSession>,
    pub scanner: Arc<Scanner>,
}

impl AppState {
    /// Load settings and profiles from the config dir and connect through libssh2
    pub fn new(events: EventSink) -> AppResult<Self> {
        let config_dir = config::get_config_dir()?;
        std::fs::create_dir_all(&config_dir)?;
        tracing::info!("sshmon config dir: {:?}", config_dir);

        let settings = AppSettings::load(&config_dir)?;
        let profiles = ProfileManager::open(&config::get_store_dir()?)?;
        let transport = Arc::new(Ssh2Transport::new(settings.ssh.keepalive_interval));

        Ok(Self::with_parts(settings, profiles, transport, events))
    }

    pub fn with_parts(
        settings: AppSettings,
        profiles: ProfileManager,
        transport: Arc<dyn SshTransport>,
        events: EventSink,
    ) -> Self {
        let connections = ConnectionManager::new(
            transport,
            ManagerOptions::from_settings(&settings),
            events.clone(),
        );
        // Shares the manager's registry so disconnect reaches terminal channels
        let terminal = TerminalSession::new(
            connections.executor().clone(),
            settings.terminal.clone(),
            events.clone(),
        );
        let scanner = Scanner::new(settings.scan.clone(), events);

        Self {
            settings: Arc::new(RwLock::new(settings)),
            profiles: Arc::new(RwLock::new(profiles)),
            connections,
            terminal: Arc::new(terminal),
            scanner: Arc::new(scanner),
        }
    }

    pub async fn connect_profile(&self, id: &str) -> AppResult<ConnectionInfo> {
        let profile = self
            .profiles
            .read()
            .get(id)
            .ok_or_else(|| AppError::ProfileNotFound(id.to_string()))?;

        self.connections.connect(&profile).await?;
        self.connections
            .connection_info()
            .ok_or(AppError::SessionDisconnected)
    }

    pub async fn disconnect(&self) {
        self.connections.disconnect().await;
    }

    /// Stream `command` in the interactive terminal
    pub async fn run_command(&self, command: &str) -> AppResult<JoinHandle<()>> {
        let session = self.connections.session();
        self.terminal.run(session.as_ref(), command).await
    }

    pub async fn run_captured(&self, command: &str) -> AppResult<String> {
        let session = self.connections.session();
        self.terminal.run_captured(session.as_ref(), command).await
    }

    /// Top processes by CPU on the connected host
    pub async fn process_list(&self) -> AppResult<Vec<ProcessInfo>> {
        let session = self
            .connections
            .session()
            .ok_or(AppError::SessionDisconnected)?;
        let executor = self.connections.executor().clone();
        tokio::task::spawn_blocking(move || probes::process_list(&executor, &session)).await?
    }

    /// Scan the /24 of this machine's outward-facing address
    pub fn start_scan(&self) -> AppResult<ScanRun> {
        let local = scan::local_ipv4()?;
        Ok(self.scanner.start(local))
    }

    pub fn cancel_scan(&self) {
        self.scanner.cancel();
    }

    pub fn entered_background(&self) {
        self.connections.entered_background();
    }

    pub fn entered_foreground(&self) {
        self.connections.entered_foreground();
    }

    pub async fn shutdown(&self) {
        self.scanner.cancel();
        self.connections.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryStore, ServerProfile};
    use crate::error::AppResult;
    use crate::ssh::ExecRequest;
    use crate::testing::{FakeChannel, FakeTransport};

    fn state(transport: Arc<FakeTransport>) -> (AppState, String) {
        let mut settings = AppSettings::default();
        settings.ssh.auto_start_monitoring = false;

        let mut profiles = ProfileManager::load(Arc::new(MemoryStore::default())).unwrap();
        let profile = ServerProfile::new("10.0.0.8", 22, "ops").with_password("secret");
        let id = profile.id.clone();
        profiles.add(profile).unwrap();

        (
            AppState::with_parts(settings, profiles, transport, EventSink::disabled()),
            id,
        )
    }

    #[tokio::test]
    async fn test_connect_profile_and_run_captured() {
        let transport = FakeTransport::new();
        transport.set_responder(Arc::new(|req: &ExecRequest| -> AppResult<Arc<FakeChannel>> {
            Ok(FakeChannel::with_output(&format!("ran {}\n", req.command)))
        }));
        let (state, id) = state(transport.clone());

        let info = state.connect_profile(&id).await.unwrap();
        assert_eq!(info.host, "10.0.0.8");
        assert_eq!(info.via, None);

        assert_eq!(state.run_captured("hostname").await.unwrap(), "ran hostname");

        state.shutdown().await;
        assert_eq!(transport.live_sessions(), 0);
        assert!(matches!(state.run_captured("hostname").await, Err(AppError::SessionDisconnected)));
    }

    #[tokio::test]
    async fn test_unknown_profile() {
        let (state, _) = state(FakeTransport::new());
        assert!(matches!(
            state.connect_profile("missing").await,
            Err(AppError::ProfileNotFound(_))
        ));
        assert!(matches!(state.process_list().await, Err(AppError::SessionDisconnected)));
    }

    #[tokio::test]
    async fn test_disconnect_ends_running_terminal_command() {
        let transport = FakeTransport::new();
        let channel = FakeChannel::hanging("");
        let shared = channel.clone();
        transport.set_responder(Arc::new(move |_: &ExecRequest| -> AppResult<Arc<FakeChannel>> {
            Ok(shared.clone())
        }));
        let (state, id) = state(transport);
        state.connect_profile(&id).await.unwrap();

        let handle = state.run_command("tail -f app.log").await.unwrap();
        state.disconnect().await;
        handle.await.unwrap();

        assert_eq!(channel.close_calls(), 1);
        assert!(state.connections.registry().is_empty());
    }
}
