//! LAN host discovery.
//!
//! Sweeps the local /24 for hosts answering on one of the configured ports.
//! Probes run in fixed-size batches; cancellation is checked between
//! batches, so in-flight probes of the current batch always complete.

use crate::config::ScanSettings;
use crate::error::{AppError, AppResult};
use crate::events::{CoreEvent, EventSink, StatusNotice};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Echo port used by the reachability fallback
const ECHO_PORT: u16 = 7;

const REVERSE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// A discovered live host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub ip_address: String,
    pub hostname: String,
}

impl ScanResult {
    /// Falls back to the address text when no name resolved
    fn new(ip: Ipv4Addr, hostname: Option<String>) -> Self {
        let ip_address = ip.to_string();
        Self {
            hostname: hostname.unwrap_or_else(|| ip_address.clone()),
            ip_address,
        }
    }
}

#[async_trait]
pub trait Prober: Send + Sync {
    /// True when `addr:port` accepts a connection within `timeout`
    async fn probe(&self, addr: Ipv4Addr, port: u16, timeout: Duration) -> bool;

    /// Last-resort liveness check when no port answered
    async fn reachable(&self, _addr: Ipv4Addr, _timeout: Duration) -> bool {
        false
    }

    /// Reverse DNS name of a live host
    async fn hostname(&self, _addr: Ipv4Addr) -> Option<String> {
        None
    }
}

/// Plain TCP connect probe
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, addr: Ipv4Addr, port: u16, timeout: Duration) -> bool {
        let target = SocketAddr::new(IpAddr::V4(addr), port);
        matches!(tokio::time::timeout(timeout, TcpStream::connect(target)).await, Ok(Ok(_)))
    }

    async fn reachable(&self, addr: Ipv4Addr, timeout: Duration) -> bool {
        // An active refusal still proves something is there
        let target = SocketAddr::new(IpAddr::V4(addr), ECHO_PORT);
        match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => e.kind() == ErrorKind::ConnectionRefused,
            Err(_) => false,
        }
    }

    async fn hostname(&self, addr: Ipv4Addr) -> Option<String> {
        let ip = IpAddr::V4(addr);
        let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip));
        match tokio::time::timeout(REVERSE_LOOKUP_TIMEOUT, lookup).await {
            Ok(Ok(Ok(name))) if !name.is_empty() => Some(name),
            Ok(Ok(Err(e))) => {
                tracing::trace!(ip = %addr, error = %e, "Reverse lookup failed");
                None
            }
            _ => None,
        }
    }
}

/// A running scan: results arrive on `results` as they are found
pub struct ScanRun {
    pub results: mpsc::UnboundedReceiver<ScanResult>,
    pub task: JoinHandle<AppResult<usize>>,
    token: CancellationToken,
}

impl ScanRun {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

pub struct Scanner {
    prober: Arc<dyn Prober>,
    settings: ScanSettings,
    events: EventSink,
    current: Mutex<Option<CancellationToken>>,
}

impl Scanner {
    pub fn new(settings: ScanSettings, events: EventSink) -> Self {
        Self::with_prober(Arc::new(TcpProber), settings, events)
    }

    pub fn with_prober(prober: Arc<dyn Prober>, settings: ScanSettings, events: EventSink) -> Self {
        Self {
            prober,
            settings,
            events,
            current: Mutex::new(None),
        }
    }

    /// Start scanning the /24 around `local`, cancelling any scan in progress
    pub fn start(self: &Arc<Self>, local: Ipv4Addr) -> ScanRun {
        let token = CancellationToken::new();
        if let Some(previous) = self.current.lock().replace(token.clone()) {
            previous.cancel();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let scanner = self.clone();
        let run_token = token.clone();
        let task = tokio::spawn(async move { scanner.scan(local, &run_token, &tx).await });

        ScanRun {
            results: rx,
            task,
            token,
        }
    }

    /// Cancel the scan started last, if any
    pub fn cancel(&self) {
        if let Some(token) = self.current.lock().take() {
            token.cancel();
        }
    }

    /// Sweep hosts 1..=254 of `local`'s /24, sending each live host once.
    /// Returns the number found, or `ScanCancelled` if stopped early.
    pub async fn scan(
        &self,
        local: Ipv4Addr,
        token: &CancellationToken,
        results: &mpsc::UnboundedSender<ScanResult>,
    ) -> AppResult<usize> {
        let subnet = subnet_label(local);
        let ports = self.settings.candidate_ports();
        let timeout = self.settings.probe_timeout();
        let batch_size = self.settings.effective_batch_size();

        tracing::info!(subnet = %subnet, ports = ?ports, batch_size, "Starting host scan");
        self.events.status(StatusNotice::ScanStarted { subnet: subnet.clone() });

        let mut found = HashSet::new();
        let mut cancelled = false;

        for batch in subnet_hosts(local).chunks(batch_size) {
            if token.is_cancelled() {
                cancelled = true;
                break;
            }

            let alive = join_all(batch.iter().map(|ip| self.probe_host(*ip, &ports, timeout))).await;

            for (ip, is_alive) in batch.iter().zip(alive) {
                if !is_alive || !found.insert(*ip) {
                    continue;
                }
                let hostname = self.prober.hostname(*ip).await;
                tracing::debug!(ip = %ip, hostname = ?hostname, "Host alive");
                let result = ScanResult::new(*ip, hostname);
                self.events.emit(CoreEvent::ScanResult(result.clone()));
                if results.send(result).is_err() {
                    tracing::trace!("Scan result receiver dropped");
                }
            }
        }

        let count = found.len();
        self.events.status(StatusNotice::ScanFinished {
            found: count,
            cancelled,
        });

        if cancelled {
            tracing::info!(subnet = %subnet, found = count, "Host scan cancelled");
            Err(AppError::ScanCancelled)
        } else {
            tracing::info!(subnet = %subnet, found = count, "Host scan finished");
            Ok(count)
        }
    }

    async fn probe_host(&self, ip: Ipv4Addr, ports: &[u16], timeout: Duration) -> bool {
        for port in ports {
            if self.prober.probe(ip, *port, timeout).await {
                return true;
            }
        }
        self.settings.reachability_fallback && self.prober.reachable(ip, timeout).await
    }
}

/// Hosts 1..=254 sharing the first three octets of `local`
pub fn subnet_hosts(local: Ipv4Addr) -> Vec<Ipv4Addr> {
    let [a, b, c, _] = local.octets();
    (1..=254).map(|d| Ipv4Addr::new(a, b, c, d)).collect()
}

fn subnet_label(local: Ipv4Addr) -> String {
    let [a, b, c, _] = local.octets();
    format!("{}.{}.{}.0/24", a, b, c)
}

/// Address of the interface that routes outward. No packets are sent.
pub fn local_ipv4() -> AppResult<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket
        .connect("8.8.8.8:80")
        .map_err(|e| AppError::Connection(format!("No route to determine local address: {}", e)))?;

    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        IpAddr::V4(_) => Err(AppError::Connection("No local IPv4 address".to_string())),
        IpAddr::V6(_) => Err(AppError::Connection("IPv6 is not supported for scanning".to_string())),
    }
}
