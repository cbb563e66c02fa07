//! Scripted SSH doubles shared by unit tests.

use crate::error::{AppError, AppResult};
use crate::ssh::transport::{
    AuthMethod, ExecRequest, HostTarget, RemoteChannel, SessionRef, SshSession, SshTransport,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct FakeChannel {
    output: Mutex<VecDeque<u8>>,
    error: Mutex<VecDeque<u8>>,
    /// Closes by itself once started and stdout is drained
    auto_close: bool,
    started: AtomicBool,
    closed: AtomicBool,
    fail_close: AtomicBool,
    fail_reads: AtomicBool,
    close_calls: AtomicUsize,
    signals: Mutex<Vec<String>>,
    input: Mutex<Vec<u8>>,
}

impl FakeChannel {
    fn build(output: &str, auto_close: bool) -> Arc<Self> {
        Arc::new(Self {
            output: Mutex::new(output.bytes().collect()),
            error: Mutex::new(VecDeque::new()),
            auto_close,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            signals: Mutex::new(Vec::new()),
            input: Mutex::new(Vec::new()),
        })
    }

    pub fn with_output(output: &str) -> Arc<Self> {
        Self::build(output, true)
    }

    /// Stays open until closed or interrupted
    pub fn hanging(output: &str) -> Arc<Self> {
        Self::build(output, false)
    }

    pub fn set_stderr(&self, text: &str) {
        *self.error.lock() = text.bytes().collect();
    }

    pub fn push_output(&self, text: &str) {
        self.output.lock().extend(text.bytes());
    }

    pub fn finish(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn signals(&self) -> Vec<String> {
        self.signals.lock().clone()
    }

    pub fn input(&self) -> Vec<u8> {
        self.input.lock().clone()
    }

    fn read_from(queue: &Mutex<VecDeque<u8>>, buf: &mut [u8]) -> usize {
        let mut queue = queue.lock();
        let n = buf.len().min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

impl RemoteChannel for FakeChannel {
    fn start(&self) -> AppResult<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn read_output(&self, buf: &mut [u8]) -> AppResult<usize> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(AppError::Channel("scripted read failure".into()));
        }
        Ok(Self::read_from(&self.output, buf))
    }

    fn read_error(&self, buf: &mut [u8]) -> AppResult<usize> {
        Ok(Self::read_from(&self.error, buf))
    }

    fn write_input(&self, data: &[u8]) -> AppResult<()> {
        self.input.lock().extend_from_slice(data);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || (self.auto_close
                && self.started.load(Ordering::SeqCst)
                && self.output.lock().is_empty())
    }

    fn send_signal(&self, signal: &str) -> AppResult<()> {
        self.signals.lock().push(signal.to_string());
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> AppResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(AppError::Channel("scripted close failure".into()));
        }
        Ok(())
    }
}

pub type Responder = Arc<dyn Fn(&ExecRequest) -> AppResult<Arc<FakeChannel>> + Send + Sync>;

pub struct FakeSession {
    host: String,
    connected: AtomicBool,
    disconnect_calls: AtomicUsize,
    forwards: Mutex<HashSet<u16>>,
    next_port: AtomicU16,
    fail_forward: AtomicBool,
    commands: Mutex<Vec<String>>,
    responder: Mutex<Responder>,
}

impl FakeSession {
    pub fn new(host: &str) -> Arc<Self> {
        Arc::new(Self {
            host: host.to_string(),
            connected: AtomicBool::new(true),
            disconnect_calls: AtomicUsize::new(0),
            forwards: Mutex::new(HashSet::new()),
            next_port: AtomicU16::new(40000),
            fail_forward: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
            responder: Mutex::new(Arc::new(
                |_: &ExecRequest| -> AppResult<Arc<FakeChannel>> { Ok(FakeChannel::with_output("")) },
            )),
        })
    }

    pub fn session_ref(self: &Arc<Self>) -> SessionRef {
        SessionRef::new(self.clone())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock() = responder;
    }

    /// Every exec gets this same channel
    pub fn respond_with_channel(&self, channel: Arc<FakeChannel>) {
        self.set_responder(Arc::new(
            move |_: &ExecRequest| -> AppResult<Arc<FakeChannel>> { Ok(channel.clone()) },
        ));
    }

    pub fn disconnect_now(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn forward_count(&self) -> usize {
        self.forwards.lock().len()
    }

    pub fn opened_commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

impl SshSession for FakeSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn open_exec(&self, request: &ExecRequest) -> AppResult<Arc<dyn RemoteChannel>> {
        if !self.is_connected() {
            return Err(AppError::SessionDisconnected);
        }
        self.commands.lock().push(request.command.clone());
        let responder = self.responder.lock().clone();
        let channel: Arc<dyn RemoteChannel> = responder(request)?;
        Ok(channel)
    }

    fn forward_local(&self, remote_host: &str, remote_port: u16) -> AppResult<u16> {
        if self.fail_forward.load(Ordering::SeqCst) {
            return Err(AppError::PortForwardFailed(format!(
                "scripted failure for {}:{}",
                remote_host, remote_port
            )));
        }
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        self.forwards.lock().insert(port);
        Ok(port)
    }

    fn cancel_forward(&self, local_port: u16) -> AppResult<()> {
        self.forwards.lock().remove(&local_port);
        Ok(())
    }

    fn disconnect(&self) -> AppResult<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out `FakeSession`s and remembers them
#[derive(Default)]
pub struct FakeTransport {
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    connects: Mutex<Vec<HostTarget>>,
    failures: Mutex<HashMap<String, fn() -> AppError>>,
    forward_failures: Mutex<HashSet<String>>,
    responder: Mutex<Option<Responder>>,
    connect_delay: Mutex<Option<Duration>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connecting to `host` fails with the given error
    pub fn fail_host(&self, host: &str, error: fn() -> AppError) {
        self.failures.lock().insert(host.to_string(), error);
    }

    pub fn fail_forward_on(&self, host: &str) {
        self.forward_failures.lock().insert(host.to_string());
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock() = Some(responder);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().clone()
    }

    pub fn connects(&self) -> Vec<HostTarget> {
        self.connects.lock().clone()
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().iter().filter(|s| s.is_connected()).count()
    }

    pub fn open_forwards(&self) -> usize {
        self.sessions.lock().iter().map(|s| s.forward_count()).sum()
    }
}

impl SshTransport for FakeTransport {
    fn connect(
        &self,
        target: &HostTarget,
        _auth: &AuthMethod,
        _timeout: Duration,
    ) -> AppResult<Arc<dyn SshSession>> {
        self.connects.lock().push(target.clone());
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let Some(error) = self.failures.lock().get(&target.host) {
            return Err(error());
        }

        let session = FakeSession::new(&target.host);
        if self.forward_failures.lock().contains(&target.host) {
            session.fail_forward.store(true, Ordering::SeqCst);
        }
        if let Some(responder) = self.responder.lock().clone() {
            session.set_responder(responder);
        }
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}
