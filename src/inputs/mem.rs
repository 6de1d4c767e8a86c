//! A sample input reporting this process's memory usage as gauges.

use async_trait::async_trait;

use crate::accumulator::{fields, Accumulator};
use crate::input::Input;

/// A process memory snapshot, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemStats {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
}

type Sampler = Box<dyn FnMut() -> anyhow::Result<MemStats> + Send + Sync>;

/// Reports `mem.resident_bytes` / `mem.virtual_bytes` gauges for this
/// process.
///
/// The sampling function is pluggable via [`MemInput::with_sampler`] so
/// tests can inject a deterministic [`MemStats`] source instead of
/// depending on the OS.
pub struct MemInput {
    sampler: Sampler,
}

impl MemInput {
    pub fn new() -> Self {
        MemInput {
            sampler: Box::new(read_self_status),
        }
    }

    pub fn with_sampler<F>(sampler: F) -> Self
    where
        F: FnMut() -> anyhow::Result<MemStats> + Send + Sync + 'static,
    {
        MemInput {
            sampler: Box::new(sampler),
        }
    }
}

impl Default for MemInput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Input for MemInput {
    fn sample_config(&self) -> &str {
        "[[inputs.mem]]\n"
    }

    fn description(&self) -> &str {
        "reports this process's resident and virtual memory size"
    }

    async fn gather(&mut self, acc: &Accumulator<'_>) -> anyhow::Result<()> {
        match (self.sampler)() {
            Ok(stats) => {
                acc.add_gauge(
                    "mem",
                    fields(vec![
                        ("resident_bytes", stats.resident_bytes),
                        ("virtual_bytes", stats.virtual_bytes),
                    ]),
                    Vec::<(&str, &str)>::new(),
                    None,
                )
                .await;
            }
            Err(e) => acc.add_error(e),
        }
        Ok(())
    }
}

/// Reads `VmRSS`/`VmSize` from `/proc/self/status` on Linux. Other
/// platforms report zeroed stats; a real deployment targeting them would
/// reach for a crate like `sysinfo` instead.
fn read_self_status() -> anyhow::Result<MemStats> {
    #[cfg(target_os = "linux")]
    {
        let text = std::fs::read_to_string("/proc/self/status")?;
        let mut stats = MemStats::default();
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                stats.resident_bytes = parse_kb_field(rest)? * 1024;
            } else if let Some(rest) = line.strip_prefix("VmSize:") {
                stats.virtual_bytes = parse_kb_field(rest)? * 1024;
            }
        }
        Ok(stats)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(MemStats::default())
    }
}

#[cfg(target_os = "linux")]
fn parse_kb_field(rest: &str) -> anyhow::Result<u64> {
    let first = rest
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow::anyhow!("malformed /proc/self/status line"))?;
    Ok(first.parse()?)
}
