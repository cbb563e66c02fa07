use crate::error::{AppError, AppResult};
use crate::ssh::registry::ChannelRegistry;
use crate::ssh::transport::{ExecRequest, SessionRef};
use std::thread;
use std::time::Duration;

const READ_BUF_BYTES: usize = 4096;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Trimmed output of one finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs one remote command to completion and returns its trimmed stdout.
/// There is no per-command timeout: a command that never exits blocks
/// until the channel is closed from outside (disconnect does that).
#[derive(Clone)]
pub struct CommandExecutor {
    registry: ChannelRegistry,
    poll_interval: Duration,
}

impl CommandExecutor {
    pub fn new(registry: ChannelRegistry) -> Self {
        Self {
            registry,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Blocking; call from a blocking thread
    pub fn execute(&self, session: Option<&SessionRef>, command: &str) -> AppResult<String> {
        self.execute_full(session, command).map(|out| out.stdout)
    }

    /// Like `execute`, also collecting stderr once the channel has closed
    pub fn execute_full(&self, session: Option<&SessionRef>, command: &str) -> AppResult<CommandOutput> {
        let session = session
            .filter(|s| s.is_connected())
            .ok_or(AppError::SessionDisconnected)?;

        let channel = session.open_exec(&ExecRequest::plain(command))?;
        // Unregisters and closes on every exit path below
        let lease = self.registry.lease(channel);
        tracing::trace!(channel = %lease.id(), "Executing remote command");

        lease.channel().start()?;

        let mut stdout = Vec::new();
        let mut buf = [0u8; READ_BUF_BYTES];
        loop {
            drain(|b| lease.channel().read_output(b), &mut buf, &mut stdout)?;
            if lease.channel().is_closed() {
                drain(|b| lease.channel().read_output(b), &mut buf, &mut stdout)?;
                break;
            }
            if !session.is_connected() {
                return Err(AppError::SessionDisconnected);
            }
            thread::sleep(self.poll_interval);
        }

        let mut stderr = Vec::new();
        drain(|b| lease.channel().read_error(b), &mut buf, &mut stderr)?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        })
    }
}

fn drain(
    mut read: impl FnMut(&mut [u8]) -> AppResult<usize>,
    buf: &mut [u8],
    out: &mut Vec<u8>,
) -> AppResult<()> {
    loop {
        let n = read(buf)?;
        if n == 0 {
            return Ok(());
        }
        out.extend_from_slice(&buf[..n]);
    }
}
