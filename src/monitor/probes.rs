//! Remote shell pipelines that sample one metric each, and their parsers.
//!
//! Numeric parsing is lenient: anything unparsable reads as 0. Errors from
//! the command executor itself are passed through to the caller.

use crate::error::{AppError, AppResult};
use crate::ssh::{CommandExecutor, SessionRef};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub const CPU_COMMAND: &str =
    r#"top -bn1 | grep "Cpu(s)" | sed "s/.*, *\([0-9.]*\)%* id.*/\1/" | awk '{print 100 - $1}'"#;

pub const MEMORY_COMMAND: &str = r#"free | grep Mem | awk '{print $3/$2 * 100.0}'"#;

/// Blocks read/written per second (vmstat bi/bo) over one second
pub const DISK_IO_COMMAND: &str = r#"vmstat 1 2 | tail -n 1 | awk '{print $9, $10}'"#;

pub const NVIDIA_CHECK_COMMAND: &str = "which nvidia-smi";
pub const NVIDIA_QUERY_COMMAND: &str =
    "nvidia-smi --query-gpu=utilization.gpu,memory.used,memory.total --format=csv,noheader,nounits";
pub const INTEL_CHECK_COMMAND: &str = "which intel_gpu_top";
pub const INTEL_QUERY_COMMAND: &str =
    r#"intel_gpu_top -s 1 -o - | head -n 2 | tail -n 1 | awk '{print $2}'"#;

/// "<uptime>\nLoad Average: <1m, 5m, 15m> , Users: <n>"
pub const UPTIME_COMMAND: &str = r#"uptime | sed 's/.*up\s*//' | sed 's/,\s*[0-9]* user.*$//' | awk '{printf "%s\nLoad Average: ", $0}' && uptime | grep -o 'load average:.*' | sed 's/load average: //' | tr '\n' ' ' && uptime | grep -o '[0-9]* user' | awk '{printf ", Users: %s", $1}'"#;

/// Used/total over real filesystems, scaled to one unit, e.g. "12.30G/100.00G (12.3%)"
pub const DISK_USAGE_COMMAND: &str = r#"df | awk '!/^(tmpfs|devtmpfs|udev|\/dev\/loop)/ && !seen[$1]++ { total+=$2; used+=$3 } END { units[0]="K"; units[1]="M"; units[2]="G"; units[3]="T"; units[4]="P"; units[5]="E"; units[6]="Z"; units[7]="Y"; i=0; t=total; u=used; while (t >= 1024 && i < 7) { t/=1024; u/=1024; i++ } if (t > 0) printf "%.2f%s/%.2f%s (%.1f%%)", u, units[i], t, units[i], (u/t)*100 }'"#;

/// Top 20 processes by CPU, with the header line
pub const PROCESS_COMMAND: &str = "ps aux --sort=-%cpu | head -n 21";

pub fn parse_float_or_zero(text: &str) -> f64 {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// `bi bo` pair; missing or bad fields read as 0
pub fn parse_disk_io(text: &str) -> (f64, f64) {
    let mut parts = text.split_whitespace();
    let read = parts.next().map_or(0.0, parse_float_or_zero);
    let write = parts.next().map_or(0.0, parse_float_or_zero);
    (read, write)
}

/// `util, used, total`: utilization if present, else memory used/total
pub fn parse_nvidia(text: &str) -> f64 {
    // First GPU only
    let line = text.lines().next().unwrap_or_default();
    let values: Vec<&str> = line.split(',').map(str::trim).collect();
    if values.len() != 3 {
        return 0.0;
    }
    if let Ok(util) = values[0].parse::<f64>() {
        return util;
    }
    let used = values[1].parse::<f64>().unwrap_or(0.0);
    let total = values[2].parse::<f64>().unwrap_or(1.0);
    if total > 0.0 {
        used / total * 100.0
    } else {
        0.0
    }
}

pub fn cpu_percent(exec: &CommandExecutor, session: &SessionRef) -> AppResult<f64> {
    Ok(parse_float_or_zero(&exec.execute(Some(session), CPU_COMMAND)?))
}

pub fn memory_percent(exec: &CommandExecutor, session: &SessionRef) -> AppResult<f64> {
    Ok(parse_float_or_zero(&exec.execute(Some(session), MEMORY_COMMAND)?))
}

pub fn disk_io(exec: &CommandExecutor, session: &SessionRef) -> AppResult<(f64, f64)> {
    Ok(parse_disk_io(&exec.execute(Some(session), DISK_IO_COMMAND)?))
}

/// One step of a multi-command pipeline. Nothing is opened once `token` fires.
fn step(
    exec: &CommandExecutor,
    session: &SessionRef,
    token: &CancellationToken,
    command: &str,
) -> AppResult<String> {
    if token.is_cancelled() {
        return Err(AppError::SessionDisconnected);
    }
    exec.execute(Some(session), command)
}

/// NVIDIA first, then Intel, else 0
pub fn gpu_percent(
    exec: &CommandExecutor,
    session: &SessionRef,
    token: &CancellationToken,
) -> AppResult<f64> {
    if !step(exec, session, token, NVIDIA_CHECK_COMMAND)?.is_empty() {
        return Ok(parse_nvidia(&step(exec, session, token, NVIDIA_QUERY_COMMAND)?));
    }
    if !step(exec, session, token, INTEL_CHECK_COMMAND)?.is_empty() {
        return Ok(parse_float_or_zero(&step(exec, session, token, INTEL_QUERY_COMMAND)?));
    }
    Ok(0.0)
}

pub fn uptime_text(
    exec: &CommandExecutor,
    session: &SessionRef,
    token: &CancellationToken,
) -> AppResult<String> {
    let uptime = step(exec, session, token, UPTIME_COMMAND)?;
    let disk = step(exec, session, token, DISK_USAGE_COMMAND)?;
    Ok(format!("{}\nDisk: {}", uptime, disk))
}

/// One row of `ps aux`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub pid: String,
    pub cpu: String,
    pub mem: String,
    pub command: String,
}

pub fn parse_process_list(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let field = |i: usize| parts.get(i).copied().unwrap_or_default().to_string();
            ProcessInfo {
                pid: field(1),
                cpu: field(2),
                mem: field(3),
                command: parts.iter().skip(10).copied().collect::<Vec<_>>().join(" "),
            }
        })
        .collect()
}

pub fn process_list(exec: &CommandExecutor, session: &SessionRef) -> AppResult<Vec<ProcessInfo>> {
    Ok(parse_process_list(&exec.execute(Some(session), PROCESS_COMMAND)?))
}
