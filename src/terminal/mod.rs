//! Interactive terminal: one streaming pty command at a time, plus a
//! one-shot captured mode for dialog-style use.

pub mod buffer;
pub mod history;

pub use buffer::OutputBuffer;
pub use history::CommandHistory;

use crate::config::TerminalSettings;
use crate::error::{AppError, AppResult};
use crate::events::{EventSink, TerminalStream};
use crate::ssh::{ChannelLease, CommandExecutor, ExecRequest, RemoteChannel, SessionRef};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::task::JoinHandle;

const READ_POLL: Duration = Duration::from_millis(10);
const OFFLINE_MESSAGE: &str = "Not connected to server\n";
const INTERRUPT_MARKER: &str = "^C\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Idle,
    Running,
}

enum Slot {
    Idle,
    /// Channel is being opened; counts as running for new submissions
    Starting,
    Running(Arc<dyn RemoteChannel>),
}

struct Shared {
    buffer: Mutex<OutputBuffer>,
    slot: Mutex<Slot>,
    events: EventSink,
}

impl Shared {
    fn append(&self, stream: TerminalStream, text: impl Into<String>) {
        let text = text.into();
        self.buffer.lock().push(&text);
        self.events.terminal(stream, text);
    }

    fn set_idle(&self) {
        *self.slot.lock() = Slot::Idle;
    }
}

pub struct TerminalSession {
    shared: Arc<Shared>,
    executor: CommandExecutor,
    settings: TerminalSettings,
    history: Mutex<CommandHistory>,
}

impl TerminalSession {
    pub fn new(executor: CommandExecutor, settings: TerminalSettings, events: EventSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer: Mutex::new(OutputBuffer::new(settings.max_buffer_chars)),
                slot: Mutex::new(Slot::Idle),
                events,
            }),
            executor,
            settings,
            history: Mutex::new(CommandHistory::new()),
        }
    }

    pub fn state(&self) -> TerminalState {
        match *self.shared.slot.lock() {
            Slot::Idle => TerminalState::Idle,
            Slot::Starting | Slot::Running(_) => TerminalState::Running,
        }
    }

    /// Start `command` on a pty channel and stream its output.
    ///
    /// Returns once the channel is running; the handle completes when the
    /// command has finished (EOF, interrupt or forced close) and the
    /// session is idle again.
    pub async fn run(&self, session: Option<&SessionRef>, command: &str) -> AppResult<JoinHandle<()>> {
        let command = command.trim();
        if command.is_empty() {
            return Err(AppError::Channel("Empty command".to_string()));
        }
        self.history.lock().push(command);

        let session = match session.filter(|s| s.is_connected()) {
            Some(session) => session.clone(),
            None => {
                self.shared.append(TerminalStream::Error, OFFLINE_MESSAGE);
                return Err(AppError::SessionDisconnected);
            }
        };

        {
            let mut slot = self.shared.slot.lock();
            if !matches!(*slot, Slot::Idle) {
                return Err(AppError::TerminalBusy);
            }
            *slot = Slot::Starting;
        }

        self.shared.append(TerminalStream::Prompt, format!("$ {}\n", command));

        let registry = self.executor.registry().clone();
        let request = ExecRequest::with_pty(command, self.settings.pty_type.clone());
        let opened = tokio::task::spawn_blocking(move || -> AppResult<ChannelLease> {
            let channel = session.open_exec(&request)?;
            let lease = registry.lease(channel);
            lease.channel().start()?;
            Ok(lease)
        })
        .await
        .map_err(AppError::from)
        .and_then(|result| result);

        let lease = match opened {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!("Failed to start terminal command: {}", e);
                self.shared.set_idle();
                self.shared.append(TerminalStream::Error, format!("Error: {}\n", e));
                return Err(e);
            }
        };

        tracing::debug!(channel = %lease.id(), "Terminal command started");
        *self.shared.slot.lock() = Slot::Running(lease.channel().clone());

        let shared = self.shared.clone();
        let chunk_bytes = self.settings.read_chunk_bytes.max(1);
        Ok(tokio::task::spawn_blocking(move || {
            pump(&shared, &lease, chunk_bytes);
            tracing::debug!(channel = %lease.id(), "Terminal command finished");
            drop(lease);
            shared.set_idle();
        }))
    }

    /// Send an interrupt to the running command. Returns false when idle.
    /// Does not wait for the channel to close.
    pub fn interrupt(&self) -> AppResult<bool> {
        let channel = match &*self.shared.slot.lock() {
            Slot::Running(channel) => channel.clone(),
            _ => return Ok(false),
        };
        channel.send_signal("INT")?;
        self.shared.append(TerminalStream::Notice, INTERRUPT_MARKER);
        Ok(true)
    }

    /// Write keyboard input to the running command
    pub fn send_input(&self, data: &str) -> AppResult<()> {
        let channel = match &*self.shared.slot.lock() {
            Slot::Running(channel) => channel.clone(),
            _ => return Err(AppError::Channel("No command is running".to_string())),
        };
        channel.write_input(data.as_bytes())
    }

    /// Run `command` to completion without a pty and append its captured
    /// output. Independent of the streaming slot.
    pub async fn run_captured(&self, session: Option<&SessionRef>, command: &str) -> AppResult<String> {
        let command = command.trim();
        if command.is_empty() {
            return Err(AppError::Channel("Empty command".to_string()));
        }
        let session = match session.filter(|s| s.is_connected()) {
            Some(session) => session.clone(),
            None => {
                self.shared.append(TerminalStream::Error, OFFLINE_MESSAGE);
                return Err(AppError::SessionDisconnected);
            }
        };

        self.shared.append(TerminalStream::Prompt, format!("$ {}\n", command));

        let executor = self.executor.clone();
        let owned = command.to_string();
        let result = tokio::task::spawn_blocking(move || executor.execute_full(Some(&session), &owned))
            .await
            .map_err(AppError::from)
            .and_then(|result| result);

        match result {
            Ok(output) => {
                if !output.stdout.is_empty() {
                    self.shared.append(TerminalStream::Output, format!("{}\n", output.stdout));
                }
                if !output.stderr.is_empty() {
                    self.shared.append(TerminalStream::Error, format!("Error: {}\n", output.stderr));
                }
                Ok(output.stdout)
            }
            Err(e) => {
                self.shared.append(TerminalStream::Error, format!("Error: {}\n", e));
                Err(e)
            }
        }
    }

    pub fn buffer_text(&self) -> String {
        self.shared.buffer.lock().as_str().to_string()
    }

    pub fn clear_buffer(&self) {
        self.shared.buffer.lock().clear();
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().entries().to_vec()
    }

    pub fn history_previous(&self, current_input: &str) -> Option<String> {
        self.history.lock().previous(current_input).map(str::to_string)
    }

    pub fn history_next(&self) -> Option<String> {
        self.history.lock().next().map(str::to_string)
    }
}

/// Forward stdout chunks until the channel closes, then stderr
fn pump(shared: &Shared, lease: &ChannelLease, chunk_bytes: usize) {
    let channel = lease.channel();
    let mut buf = vec![0u8; chunk_bytes];
    let mut decoder = Utf8Carry::default();

    loop {
        match channel.read_output(&mut buf) {
            Ok(0) => {
                if channel.is_closed() {
                    break;
                }
                thread::sleep(READ_POLL);
            }
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() {
                    shared.append(TerminalStream::Output, text);
                }
            }
            Err(e) => {
                // A forced close surfaces as a read error; only report real ones
                if !channel.is_closed() {
                    shared.append(TerminalStream::Error, format!("Error: {}\n", e));
                }
                break;
            }
        }
    }

    // Output that raced the close
    while let Ok(n) = channel.read_output(&mut buf) {
        if n == 0 {
            break;
        }
        let text = decoder.decode(&buf[..n]);
        if !text.is_empty() {
            shared.append(TerminalStream::Output, text);
        }
    }
    let tail = decoder.finish();
    if !tail.is_empty() {
        shared.append(TerminalStream::Output, tail);
    }

    let mut stderr = Vec::new();
    while let Ok(n) = channel.read_error(&mut buf) {
        if n == 0 {
            break;
        }
        stderr.extend_from_slice(&buf[..n]);
    }
    if !stderr.is_empty() {
        shared.append(TerminalStream::Error, String::from_utf8_lossy(&stderr).into_owned());
    }
}

/// Decodes a byte stream chunk by chunk, holding back a multi-byte
/// sequence split across reads.
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let len = self.pending.len();

        let mut split = len;
        for back in 1..=len.min(3) {
            let byte = self.pending[len - back];
            if byte & 0xC0 == 0x80 {
                continue;
            }
            let needed = match byte {
                b if b >= 0xF0 => 4,
                b if b >= 0xE0 => 3,
                b if b >= 0xC0 => 2,
                _ => 1,
            };
            if needed > back {
                split = len - back;
            }
            break;
        }

        let rest = self.pending.split_off(split);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CoreEvent, TerminalChunk};
    use crate::ssh::ChannelRegistry;
    use crate::testing::{FakeChannel, FakeSession};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn terminal(settings: TerminalSettings) -> (TerminalSession, UnboundedReceiver<CoreEvent>) {
        let (events, rx) = EventSink::channel();
        let executor = CommandExecutor::new(ChannelRegistry::new()).with_poll_interval(Duration::from_millis(1));
        (TerminalSession::new(executor, settings, events), rx)
    }

    fn chunks(rx: &mut UnboundedReceiver<CoreEvent>) -> Vec<TerminalChunk> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let CoreEvent::Terminal(chunk) = event {
                out.push(chunk);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_run_streams_output_then_stderr() {
        let settings = TerminalSettings {
            read_chunk_bytes: 4,
            ..TerminalSettings::default()
        };
        let (term, mut rx) = terminal(settings);
        let session = FakeSession::new("host");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        session.set_responder(Arc::new(move |req: &ExecRequest| -> AppResult<Arc<FakeChannel>> {
            seen.lock().push(req.clone());
            let channel = FakeChannel::with_output("line one\nline two\n");
            channel.set_stderr("oops\n");
            Ok(channel)
        }));

        let handle = term.run(Some(&session.session_ref()), "  cat log ").await.unwrap();
        handle.await.unwrap();

        assert_eq!(term.state(), TerminalState::Idle);
        assert_eq!(requests.lock()[0].pty.as_deref(), Some("xterm"));
        assert_eq!(requests.lock()[0].command, "cat log");
        assert_eq!(term.buffer_text(), "$ cat log\nline one\nline two\noops\n");
        assert_eq!(term.history(), vec!["cat log".to_string()]);

        let chunks = chunks(&mut rx);
        assert_eq!(chunks[0], TerminalChunk::new(TerminalStream::Prompt, "$ cat log\n"));
        // 4-byte reads arrive as separate output chunks
        let outputs = chunks.iter().filter(|c| c.stream == TerminalStream::Output).count();
        assert!(outputs > 1);
        assert_eq!(chunks.last().unwrap(), &TerminalChunk::new(TerminalStream::Error, "oops\n"));
        assert!(term.executor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_second_run_rejected_until_interrupted() {
        let (term, mut rx) = terminal(TerminalSettings::default());
        let session = FakeSession::new("host");
        let channel = FakeChannel::hanging("tailing...\n");
        session.respond_with_channel(channel.clone());
        let sref = session.session_ref();

        let handle = term.run(Some(&sref), "tail -f /var/log/syslog").await.unwrap();
        assert_eq!(term.state(), TerminalState::Running);
        assert!(matches!(term.run(Some(&sref), "ls").await, Err(AppError::TerminalBusy)));
        assert_eq!(session.opened_commands().len(), 1);

        term.send_input("q").unwrap();
        assert_eq!(channel.input(), b"q".to_vec());

        for _ in 0..500 {
            if term.buffer_text().contains("tailing...") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(term.interrupt().unwrap());
        handle.await.unwrap();

        assert_eq!(channel.signals(), vec!["INT".to_string()]);
        assert_eq!(term.state(), TerminalState::Idle);
        assert!(term.buffer_text().ends_with("^C\n"));
        let marker = chunks(&mut rx).into_iter().last().unwrap();
        assert_eq!(marker.stream, TerminalStream::Notice);
        assert_eq!(marker.text, "^C\n");
        assert!(!term.interrupt().unwrap());
        assert!(term.executor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_forced_close_ends_run() {
        let (term, _rx) = terminal(TerminalSettings::default());
        let session = FakeSession::new("host");
        let channel = FakeChannel::hanging("");
        session.respond_with_channel(channel.clone());

        let handle = term.run(Some(&session.session_ref()), "top").await.unwrap();
        channel.push_output("frame\n");
        let closed = term.executor.registry().close_all();
        assert!(closed.is_empty());
        handle.await.unwrap();

        assert_eq!(term.state(), TerminalState::Idle);
        assert!(!term.buffer_text().contains("Error"));
    }

    #[tokio::test]
    async fn test_offline_submission() {
        let (term, mut rx) = terminal(TerminalSettings::default());
        assert!(matches!(term.run(None, "ls").await, Err(AppError::SessionDisconnected)));

        let session = FakeSession::new("host");
        session.disconnect_now();
        assert!(matches!(
            term.run(Some(&session.session_ref()), "ls").await,
            Err(AppError::SessionDisconnected)
        ));

        assert_eq!(term.buffer_text(), "Not connected to server\nNot connected to server\n");
        assert_eq!(chunks(&mut rx)[0].stream, TerminalStream::Error);
        assert_eq!(term.history().len(), 2);
        assert_eq!(term.state(), TerminalState::Idle);
    }

    #[tokio::test]
    async fn test_open_failure_returns_to_idle() {
        let (term, _rx) = terminal(TerminalSettings::default());
        let session = FakeSession::new("host");
        session.set_responder(Arc::new(|_: &ExecRequest| -> AppResult<Arc<FakeChannel>> {
            Err(AppError::Channel("channel open refused".into()))
        }));

        assert!(term.run(Some(&session.session_ref()), "ls").await.is_err());
        assert_eq!(term.state(), TerminalState::Idle);
        assert!(term.buffer_text().contains("Error: "));
    }

    #[tokio::test]
    async fn test_run_captured_shows_stdout_and_stderr() {
        let (term, _rx) = terminal(TerminalSettings::default());
        let session = FakeSession::new("host");
        let channel = FakeChannel::with_output("Filesystem 10G\n");
        channel.set_stderr("df: /mnt: Permission denied\n");
        session.respond_with_channel(channel);

        let out = term.run_captured(Some(&session.session_ref()), "df -h").await.unwrap();
        assert_eq!(out, "Filesystem 10G");
        assert_eq!(
            term.buffer_text(),
            "$ df -h\nFilesystem 10G\nError: df: /mnt: Permission denied\n"
        );
        assert_eq!(term.state(), TerminalState::Idle);
    }

    #[test]
    fn test_utf8_split_across_reads() {
        let mut decoder = Utf8Carry::default();
        let bytes = "né日🙂".as_bytes();
        let mut text = String::new();
        for chunk in bytes.chunks(1) {
            text.push_str(&decoder.decode(chunk));
        }
        text.push_str(&decoder.finish());
        assert_eq!(text, "né日🙂");

        assert_eq!(decoder.decode(&[b'a', 0xE6]), "a");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_history_navigation_through_session() {
        let (term, _rx) = terminal(TerminalSettings::default());
        term.history.lock().push("uptime");
        term.history.lock().push("free -m");

        assert_eq!(term.history_previous("draft").as_deref(), Some("free -m"));
        assert_eq!(term.history_previous("").as_deref(), Some("uptime"));
        assert_eq!(term.history_next().as_deref(), Some("free -m"));
        assert_eq!(term.history_next().as_deref(), Some("draft"));
    }
}
