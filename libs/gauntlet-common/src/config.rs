// Per-invocation resource ceilings shared by every runtime backend
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Wall-clock ceiling for one test-case invocation
    pub timeout_ms: u64,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    pub pids_limit: i64,
    pub max_source_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            pids_limit: 64,
            max_source_bytes: 64 * 1024,
        }
    }
}

impl SandboxLimits {
    pub fn memory_limit_bytes(&self) -> i64 {
        (self.memory_limit_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit as f64 * 1_000_000_000.0) as i64
    }
}
