use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
    #[serde(default)]
    pub terminal: TerminalSettings,
    #[serde(default)]
    pub scan: ScanSettings,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    /// Hard deadline per hop (TCP connect + handshake + auth)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u32,
    /// Start the monitoring loop as soon as a connection is up
    #[serde(default = "default_true")]
    pub auto_start_monitoring: bool,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive() -> u32 {
    20
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval: default_keepalive(),
            auto_start_monitoring: true,
        }
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_true")]
    pub gpu_probe: bool,
}

fn default_interval_ms() -> u64 {
    200
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            gpu_probe: true,
        }
    }
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.clamp(100, 5000))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSettings {
    #[serde(default = "default_background_disconnect")]
    pub background_disconnect_secs: u64,
}

fn default_background_disconnect() -> u64 {
    60
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            background_disconnect_secs: default_background_disconnect(),
        }
    }
}

impl LifecycleSettings {
    pub fn background_timeout(&self) -> Duration {
        Duration::from_secs(self.background_disconnect_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSettings {
    #[serde(default = "default_max_buffer_chars")]
    pub max_buffer_chars: usize,
    #[serde(default = "default_read_chunk")]
    pub read_chunk_bytes: usize,
    #[serde(default = "default_pty_type")]
    pub pty_type: String,
}

fn default_max_buffer_chars() -> usize {
    1_000_000
}

fn default_read_chunk() -> usize {
    1024
}

fn default_pty_type() -> String {
    "xterm".to_string()
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            max_buffer_chars: default_max_buffer_chars(),
            read_chunk_bytes: default_read_chunk(),
            pty_type: default_pty_type(),
        }
    }
}

/// Probed on every host unless `ports` is overridden
pub const DEFAULT_SCAN_PORTS: [u16; 4] = [22, 80, 443, 8080];

/// Ports probed in addition to `ports` when `extended_ports` is on
pub const EXTENDED_SCAN_PORTS: [u16; 3] = [2222, 3389, 5900];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    #[serde(default = "default_scan_ports")]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub extended_ports: bool,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Count a host as alive when it actively refuses the echo port
    #[serde(default)]
    pub reachability_fallback: bool,
}

fn default_scan_ports() -> Vec<u16> {
    DEFAULT_SCAN_PORTS.to_vec()
}

fn default_probe_timeout() -> u64 {
    300
}

fn default_batch_size() -> usize {
    16
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            ports: default_scan_ports(),
            extended_ports: false,
            probe_timeout_ms: default_probe_timeout(),
            batch_size: default_batch_size(),
            reachability_fallback: false,
        }
    }
}

impl ScanSettings {
    /// Candidate ports in probe order, without duplicates
    pub fn candidate_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = Vec::new();
        let extra = if self.extended_ports {
            &EXTENDED_SCAN_PORTS[..]
        } else {
            &[]
        };
        for port in self.ports.iter().chain(extra.iter()) {
            if *port != 0 && !ports.contains(port) {
                ports.push(*port);
            }
        }
        if ports.is_empty() {
            ports = default_scan_ports();
        }
        ports
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, 64)
    }
}

impl AppSettings {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let settings: AppSettings = toml::from_str(&content)?;
            Ok(settings)
        } else {
            let settings = AppSettings::default();
            settings.save(config_dir)?;
            Ok(settings)
        }
    }

    pub fn save(&self, config_dir: &Path) -> AppResult<()> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings::load(dir.path()).unwrap();
        assert!(dir.path().join("config.toml").exists());
        assert_eq!(settings.ssh.connect_timeout_secs, 30);
        assert_eq!(settings.lifecycle.background_disconnect_secs, 60);
        assert_eq!(settings.terminal.max_buffer_chars, 1_000_000);
    }

    #[test]
    fn test_default_scan_ports() {
        let scan = ScanSettings::default();
        assert_eq!(scan.candidate_ports(), vec![22, 80, 443, 8080]);

        let empty = ScanSettings {
            ports: Vec::new(),
            ..ScanSettings::default()
        };
        assert_eq!(empty.candidate_ports(), vec![22, 80, 443, 8080]);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[monitor]\ninterval_ms = 500\n\n[scan]\nextended_ports = true\n",
        )
        .unwrap();

        let settings = AppSettings::load(dir.path()).unwrap();
        assert_eq!(settings.monitor.interval(), Duration::from_millis(500));
        assert!(settings.monitor.gpu_probe);
        assert_eq!(settings.scan.candidate_ports(), vec![22, 80, 443, 8080, 2222, 3389, 5900]);
    }

    #[test]
    fn test_clamped_values() {
        let monitor = MonitorSettings {
            interval_ms: 5,
            gpu_probe: false,
        };
        assert_eq!(monitor.interval(), Duration::from_millis(100));

        let scan = ScanSettings {
            ports: vec![0, 22, 22],
            batch_size: 1000,
            ..ScanSettings::default()
        };
        assert_eq!(scan.candidate_ports(), vec![22]);
        assert_eq!(scan.effective_batch_size(), 64);
    }
}
