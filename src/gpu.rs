//! GPU telemetry collection
//!
//! Queries nvidia-smi for per-device utilization and memory figures. Hosts
//! without nvidia-smi (or without GPUs) report an empty list rather than an
//! error, so the health endpoint stays usable on CPU-only machines.

use serde::Serialize;
use tokio::process::Command;

/// Utilization snapshot for one GPU
#[derive(Debug, Clone, Serialize)]
pub struct GpuStat {
    pub index: u32,
    pub utilization_pct: u32,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
}

/// Collect a telemetry snapshot for every visible GPU
pub async fn collect() -> Vec<GpuStat> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,utilization.gpu,memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            parse_csv(&stdout)
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(stderr = %stderr, "nvidia-smi failed, reporting no GPUs");
            Vec::new()
        }
        Err(e) => {
            tracing::debug!(error = %e, "nvidia-smi not available, reporting no GPUs");
            Vec::new()
        }
    }
}

fn parse_csv(stdout: &str) -> Vec<GpuStat> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            Some(GpuStat {
                index: fields.next()?.parse().ok()?,
                utilization_pct: fields.next()?.parse().ok()?,
                memory_used_mib: fields.next()?.parse().ok()?,
                memory_total_mib: fields.next()?.parse().ok()?,
            })
        })
        .collect()
}
