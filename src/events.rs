use crate::monitor::MonitoringSample;
use crate::scan::ScanResult;
use serde::Serialize;
use tokio::sync::mpsc;

/// Why a connection went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Manual,
    MonitorFailure,
    BackgroundTimeout,
    Replaced,
}

/// Transient status notification for the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusNotice {
    Connecting {
        host: String,
        port: u16,
        via: Option<String>,
    },
    Connected {
        host: String,
        port: u16,
    },
    ConnectFailed {
        message: String,
    },
    Disconnected {
        reason: DisconnectReason,
    },
    MonitorError {
        message: String,
    },
    ScanStarted {
        subnet: String,
    },
    ScanFinished {
        found: usize,
        cancelled: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStream {
    Prompt,
    Output,
    Error,
    /// Locally generated markers, such as the `^C` echo on interrupt
    Notice,
}

/// A piece of terminal text tagged with the stream it came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalChunk {
    pub stream: TerminalStream,
    pub text: String,
}

impl TerminalChunk {
    pub fn new(stream: TerminalStream, text: impl Into<String>) -> Self {
        Self {
            stream,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CoreEvent {
    Status(StatusNotice),
    Sample(MonitoringSample),
    ScanResult(ScanResult),
    Terminal(TerminalChunk),
}

/// Push-only handle to the UI context. Cloning is cheap.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<CoreEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: CoreEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::trace!("Event receiver dropped");
            }
        }
    }

    pub fn status(&self, notice: StatusNotice) {
        self.emit(CoreEvent::Status(notice));
    }

    pub fn terminal(&self, stream: TerminalStream, text: impl Into<String>) {
        self.emit(CoreEvent::Terminal(TerminalChunk::new(stream, text)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_shape() {
        let event = CoreEvent::Status(StatusNotice::Disconnected {
            reason: DisconnectReason::MonitorFailure,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["payload"]["kind"], "disconnected");
        assert_eq!(json["payload"]["reason"], "monitor_failure");
    }

    #[test]
    fn test_disabled_sink_and_dropped_receiver_are_silent() {
        EventSink::disabled().terminal(TerminalStream::Output, "x");

        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.status(StatusNotice::ScanFinished {
            found: 0,
            cancelled: false,
        });
    }
}
