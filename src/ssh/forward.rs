use crate::error::{AppError, AppResult};
use crate::ssh::libssh::retry_eagain;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const PUMP_IDLE: Duration = Duration::from_millis(2);
const PUMP_BUF_BYTES: usize = 32 * 1024;

/// Loopback listener whose connections are carried to `remote_host:remote_port`
/// over `direct-tcpip` channels on the tunnel session
pub struct LocalForward {
    local_port: u16,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl LocalForward {
    pub fn start(session: ssh2::Session, remote_host: &str, remote_port: u16) -> AppResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|e| AppError::PortForwardFailed(format!("Failed to bind local port: {}", e)))?;
        let local_port = listener.local_addr()?.port();
        listener
            .set_nonblocking(true)
            .map_err(|e| AppError::PortForwardFailed(format!("Failed to set non-blocking: {}", e)))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let remote_host = remote_host.to_string();
        let flag = shutdown.clone();

        let accept_thread = thread::Builder::new()
            .name(format!("fwd-{}", local_port))
            .spawn(move || accept_loop(listener, session, remote_host, remote_port, flag))?;

        tracing::info!(local_port, remote_port, "Local port forward started");

        Ok(Self {
            local_port,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Stop accepting and tell every pump to finish
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                tracing::warn!(local_port = self.local_port, "Forward accept thread panicked");
            }
            tracing::info!(local_port = self.local_port, "Local port forward stopped");
        }
    }
}

impl Drop for LocalForward {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    session: ssh2::Session,
    remote_host: String,
    remote_port: u16,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "Accepted forwarded connection");
                let session = session.clone();
                let remote_host = remote_host.clone();
                let shutdown = shutdown.clone();
                thread::spawn(move || {
                    if let Err(e) = pump(stream, peer, &session, &remote_host, remote_port, &shutdown) {
                        tracing::warn!(%peer, error = %e, "Forwarded connection failed");
                    }
                });
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed on forward listener");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn pump(
    mut local: TcpStream,
    peer: SocketAddr,
    session: &ssh2::Session,
    remote_host: &str,
    remote_port: u16,
    shutdown: &AtomicBool,
) -> AppResult<()> {
    let mut channel = retry_eagain(|| {
        session.channel_direct_tcpip(remote_host, remote_port, Some(("127.0.0.1", peer.port())))
    })
    .map_err(|e| AppError::PortForwardFailed(format!("direct-tcpip open failed: {}", e)))?;

    // Closed on every exit path, including relay errors
    let relayed = relay(&mut local, &mut channel, shutdown);
    report_close(peer, retry_eagain(|| channel.close()));
    tracing::debug!(%peer, "Forwarded connection closed");
    relayed
}

fn relay(local: &mut TcpStream, channel: &mut ssh2::Channel, shutdown: &AtomicBool) -> AppResult<()> {
    local.set_nonblocking(true)?;
    local.set_nodelay(true)?;

    let mut buf = vec![0u8; PUMP_BUF_BYTES];
    while !shutdown.load(Ordering::SeqCst) {
        let mut idle = true;

        match local.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                write_fully(channel, &buf[..n], shutdown)?;
                idle = false;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        match channel.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                write_fully(local, &buf[..n], shutdown)?;
                idle = false;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(AppError::PortForwardFailed(format!("Tunnel read failed: {}", e))),
        }

        if channel.eof() {
            break;
        }
        if idle {
            thread::sleep(PUMP_IDLE);
        }
    }
    Ok(())
}

/// Close failures only matter for diagnostics. Returns true on a clean close.
fn report_close<E: std::fmt::Display>(peer: SocketAddr, closed: Result<(), E>) -> bool {
    match closed {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "Forwarded channel close failed");
            false
        }
    }
}

/// `write_all` for non-blocking writers
fn write_fully<W: Write>(writer: &mut W, mut data: &[u8], shutdown: &AtomicBool) -> AppResult<()> {
    while !data.is_empty() {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        match writer.write(data) {
            Ok(0) => thread::sleep(PUMP_IDLE),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(PUMP_IDLE),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    loop {
        match writer.flush() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(PUMP_IDLE),
            Err(e) => return Err(e.into()),
        }
    }
}
