use crate::error::AppResult;
use crate::ssh::keys::PrivateKey;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Where to connect and as whom
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl HostTarget {
    /// Same user, different endpoint
    pub fn redirected(&self, host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: self.username.clone(),
        }
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Credentials for one hop
#[derive(Clone)]
pub enum AuthMethod {
    PrivateKey {
        key: PrivateKey,
        passphrase: Option<String>,
    },
    Password(String),
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::PrivateKey { key, .. } => {
                write!(f, "PrivateKey({})", key.kind())
            }
            AuthMethod::Password(_) => write!(f, "Password([REDACTED])"),
        }
    }
}

/// An exec channel request; `pty` carries the terminal type when one is wanted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: String,
    pub pty: Option<String>,
}

impl ExecRequest {
    pub fn plain(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            pty: None,
        }
    }

    pub fn with_pty(command: impl Into<String>, term: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            pty: Some(term.into()),
        }
    }
}

/// Opens authenticated sessions. Blocking; call from a blocking thread.
pub trait SshTransport: Send + Sync {
    fn connect(
        &self,
        target: &HostTarget,
        auth: &AuthMethod,
        timeout: Duration,
    ) -> AppResult<Arc<dyn SshSession>>;
}

/// An authenticated transport to one host
pub trait SshSession: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Open an exec channel. The command is not sent until `start`.
    fn open_exec(&self, request: &ExecRequest) -> AppResult<Arc<dyn RemoteChannel>>;

    /// Listen on a loopback port that tunnels to `remote_host:remote_port`.
    /// Returns the assigned local port.
    fn forward_local(&self, remote_host: &str, remote_port: u16) -> AppResult<u16>;

    fn cancel_forward(&self, local_port: u16) -> AppResult<()>;

    fn disconnect(&self) -> AppResult<()>;
}

/// One multiplexed exec unit. Reads never block: `Ok(0)` means nothing yet.
pub trait RemoteChannel: Send + Sync {
    fn start(&self) -> AppResult<()>;
    fn read_output(&self, buf: &mut [u8]) -> AppResult<usize>;
    fn read_error(&self, buf: &mut [u8]) -> AppResult<usize>;
    fn write_input(&self, data: &[u8]) -> AppResult<()>;
    fn is_closed(&self) -> bool;
    fn send_signal(&self, signal: &str) -> AppResult<()>;
    fn close(&self) -> AppResult<()>;
}

/// Borrowed view of a session owned by the connection manager.
/// Holders can open channels but cannot tear the session down.
#[derive(Clone)]
pub struct SessionRef(Arc<dyn SshSession>);

impl SessionRef {
    pub(crate) fn new(session: Arc<dyn SshSession>) -> Self {
        Self(session)
    }

    pub fn is_connected(&self) -> bool {
        self.0.is_connected()
    }

    pub fn open_exec(&self, request: &ExecRequest) -> AppResult<Arc<dyn RemoteChannel>> {
        self.0.open_exec(request)
    }
}

impl fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRef")
            .field("connected", &self.is_connected())
            .finish()
    }
}
