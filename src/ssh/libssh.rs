use crate::error::{AppError, AppResult};
use crate::ssh::forward::LocalForward;
use crate::ssh::keys::TempKeyFile;
use crate::ssh::transport::{
    AuthMethod, ExecRequest, HostTarget, RemoteChannel, SshSession, SshTransport,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use ssh2::{Channel, ErrorCode, HostKeyType, Session};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// libssh2 error codes
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_FILE: i32 = -16;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

const EAGAIN_BACKOFF: Duration = Duration::from_millis(4);
const EAGAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Repeat a libssh2 call while the non-blocking session reports EAGAIN
pub(crate) fn retry_eagain<T>(mut op: impl FnMut() -> Result<T, ssh2::Error>) -> Result<T, ssh2::Error> {
    let started = Instant::now();
    loop {
        match op() {
            Err(e) if e.code() == ErrorCode::Session(LIBSSH2_ERROR_EAGAIN) => {
                if started.elapsed() > EAGAIN_DEADLINE {
                    return Err(e);
                }
                thread::sleep(EAGAIN_BACKOFF);
            }
            other => return other,
        }
    }
}

fn is_link_lost(err: &ssh2::Error) -> bool {
    matches!(
        err.code(),
        ErrorCode::Session(LIBSSH2_ERROR_SOCKET_SEND)
            | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_DISCONNECT)
            | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_RECV)
    )
}

/// Compute SHA256 fingerprint of a key
fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    let result = hasher.finalize();

    // Format as SHA256:base64
    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, result);
    format!("SHA256:{}", b64.trim_end_matches('='))
}

fn host_key_type_name(key_type: HostKeyType) -> &'static str {
    match key_type {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        _ => "unknown",
    }
}

/// Production transport on libssh2
pub struct Ssh2Transport {
    keepalive_interval: u32,
}

impl Ssh2Transport {
    pub fn new(keepalive_interval: u32) -> Self {
        Self { keepalive_interval }
    }

    fn open_tcp(target: &HostTarget, timeout: Duration) -> AppResult<TcpStream> {
        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|e| AppError::Connection(format!("Failed to resolve {}: {}", target.host, e)))?
            .next()
            .ok_or_else(|| AppError::Connection(format!("No address for {}", target.host)))?;

        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => AppError::ConnectTimeout {
                host: target.host.clone(),
                port: target.port,
            },
            _ => AppError::Connection(format!("TCP connect to {} failed: {}", addr, e)),
        })?;

        // Disable Nagle's algorithm for better latency
        tcp.set_nodelay(true)?;
        Ok(tcp)
    }

    fn authenticate(session: &Session, target: &HostTarget, auth: &AuthMethod) -> AppResult<()> {
        match auth {
            AuthMethod::PrivateKey { key, passphrase } => {
                let key_file = TempKeyFile::write(key)?;
                let result = session.userauth_pubkey_file(
                    &target.username,
                    None,
                    key_file.path(),
                    passphrase.as_deref(),
                );
                // Always delete the temp key file
                drop(key_file);

                result.map_err(|e| {
                    let msg = e.to_string().to_lowercase();
                    if e.code() == ErrorCode::Session(LIBSSH2_ERROR_FILE)
                        || msg.contains("parse")
                        || msg.contains("unsupported")
                    {
                        AppError::UnsupportedKeyFormat(
                            "Key could not be read. Ensure it is in PEM or OpenSSH format.".to_string(),
                        )
                    } else if msg.contains("passphrase") || msg.contains("decrypt") {
                        AppError::AuthenticationFailed("Invalid passphrase for private key".to_string())
                    } else {
                        AppError::AuthenticationFailed("Private key not accepted by server".to_string())
                    }
                })?;
            }
            AuthMethod::Password(password) => {
                session
                    .userauth_password(&target.username, password)
                    .map_err(|_| AppError::AuthenticationFailed("Password authentication failed".to_string()))?;
            }
        }

        if !session.authenticated() {
            return Err(AppError::AuthenticationFailed("Authentication failed".to_string()));
        }
        Ok(())
    }
}

impl SshTransport for Ssh2Transport {
    fn connect(
        &self,
        target: &HostTarget,
        auth: &AuthMethod,
        timeout: Duration,
    ) -> AppResult<Arc<dyn SshSession>> {
        // Log connection attempt (no secrets!)
        tracing::info!(host = %target.host, port = target.port, user = %target.username, "Connecting");

        let tcp = Self::open_tcp(target, timeout)?;

        let mut session = Session::new()
            .map_err(|e| AppError::Connection(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session.set_keepalive(true, self.keepalive_interval);

        session.handshake().map_err(|e| {
            if e.code() == ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) {
                AppError::ConnectTimeout {
                    host: target.host.clone(),
                    port: target.port,
                }
            } else {
                AppError::Connection(format!("SSH handshake failed: {}", e))
            }
        })?;

        if let Some((key, key_type)) = session.host_key() {
            tracing::info!(
                host = %target.host,
                key_type = host_key_type_name(key_type),
                fingerprint = %compute_sha256_fingerprint(key),
                "Server host key"
            );
        }

        Self::authenticate(&session, target, auth)?;
        tracing::info!(host = %target.host, port = target.port, "SSH authentication successful");

        // Everything after auth is polled
        session.set_blocking(false);

        Ok(Arc::new(Ssh2Session {
            label: target.to_string(),
            session,
            connected: AtomicBool::new(true),
            forwards: Mutex::new(HashMap::new()),
        }))
    }
}

pub struct Ssh2Session {
    label: String,
    session: Session,
    connected: AtomicBool,
    forwards: Mutex<HashMap<u16, LocalForward>>,
}

impl Ssh2Session {
    fn check(&self, err: ssh2::Error, what: &str) -> AppError {
        if is_link_lost(&err) {
            self.connected.store(false, Ordering::SeqCst);
            tracing::warn!(session = %self.label, error = %err, "SSH link lost");
            return AppError::SessionDisconnected;
        }
        AppError::Channel(format!("{}: {}", what, err))
    }
}

impl SshSession for Ssh2Session {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn open_exec(&self, request: &ExecRequest) -> AppResult<Arc<dyn RemoteChannel>> {
        if !self.is_connected() {
            return Err(AppError::SessionDisconnected);
        }

        let mut channel = retry_eagain(|| self.session.channel_session())
            .map_err(|e| self.check(e, "Failed to open channel"))?;

        if let Some(term) = &request.pty {
            retry_eagain(|| channel.request_pty(term, None, None))
                .map_err(|e| self.check(e, "Failed to request PTY"))?;
        }

        Ok(Arc::new(Ssh2Channel {
            channel: Mutex::new(channel),
            command: request.command.clone(),
            pty: request.pty.is_some(),
            closed: AtomicBool::new(false),
        }))
    }

    fn forward_local(&self, remote_host: &str, remote_port: u16) -> AppResult<u16> {
        if !self.is_connected() {
            return Err(AppError::SessionDisconnected);
        }
        let forward = LocalForward::start(self.session.clone(), remote_host, remote_port)?;
        let port = forward.local_port();
        self.forwards.lock().insert(port, forward);
        Ok(port)
    }

    fn cancel_forward(&self, local_port: u16) -> AppResult<()> {
        let forward = self.forwards.lock().remove(&local_port);
        match forward {
            Some(mut forward) => {
                forward.stop();
                Ok(())
            }
            None => Err(AppError::PortForwardFailed(format!(
                "No forward on local port {}",
                local_port
            ))),
        }
    }

    fn disconnect(&self) -> AppResult<()> {
        let forwards: Vec<_> = self.forwards.lock().drain().collect();
        for (_, mut forward) in forwards {
            forward.stop();
        }

        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        retry_eagain(|| self.session.disconnect(None, "Bye", None))
            .map_err(|e| AppError::Connection(format!("Disconnect failed: {}", e)))?;
        tracing::info!(session = %self.label, "SSH session disconnected");
        Ok(())
    }
}

pub struct Ssh2Channel {
    channel: Mutex<Channel>,
    command: String,
    pty: bool,
    closed: AtomicBool,
}

fn read_nonblocking(reader: &mut impl Read, buf: &mut [u8]) -> AppResult<usize> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(AppError::Channel(format!("Read failed: {}", e))),
        }
    }
}

impl RemoteChannel for Ssh2Channel {
    fn start(&self) -> AppResult<()> {
        let mut channel = self.channel.lock();
        retry_eagain(|| channel.exec(&self.command))
            .map_err(|e| AppError::Channel(format!("Failed to exec command: {}", e)))
    }

    fn read_output(&self, buf: &mut [u8]) -> AppResult<usize> {
        read_nonblocking(&mut *self.channel.lock(), buf)
    }

    fn read_error(&self, buf: &mut [u8]) -> AppResult<usize> {
        read_nonblocking(&mut self.channel.lock().stderr(), buf)
    }

    fn write_input(&self, data: &[u8]) -> AppResult<()> {
        let mut channel = self.channel.lock();
        let mut rest = data;
        while !rest.is_empty() {
            match channel.write(rest) {
                Ok(n) => rest = &rest[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(EAGAIN_BACKOFF),
                Err(e) => return Err(AppError::Channel(format!("Write failed: {}", e))),
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.channel.lock().eof()
    }

    fn send_signal(&self, signal: &str) -> AppResult<()> {
        if self.pty && signal == "INT" {
            // The pty line discipline turns ^C into SIGINT
            self.write_input(b"\x03")?;
        }
        let mut channel = self.channel.lock();
        if let Err(e) = retry_eagain(|| channel.process_startup("signal", Some(signal))) {
            tracing::debug!(signal, error = %e, "Signal request refused by server");
        }
        Ok(())
    }

    fn close(&self) -> AppResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut channel = self.channel.lock();
        retry_eagain(|| channel.close())
            .map_err(|e| AppError::Channel(format!("Failed to close channel: {}", e)))
    }
}
