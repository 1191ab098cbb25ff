// Grader configuration for the Gauntlet worker
use anyhow::{bail, Context, Result};
use gauntlet_common::config::SandboxLimits;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_CONFIG_PATH: &str = "config/gauntlet.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Docker,
    Process,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Docker => write!(f, "docker"),
            Backend::Process => write!(f, "process"),
        }
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Backend::Docker),
            "process" => Ok(Backend::Process),
            other => bail!("Invalid backend: {} (valid options: docker, process)", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    pub backend: Backend,
    pub image: String,
    pub python_bin: String,
    pub limits: SandboxLimits,
    pub float_tolerance: Option<f64>,
    /// Parent directory for process-backend run directories
    pub work_dir: Option<PathBuf>,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Docker,
            image: "python:3.12-slim".to_string(),
            python_bin: "python3".to_string(),
            limits: SandboxLimits::default(),
            float_tolerance: None,
            work_dir: None,
        }
    }
}

impl GraderConfig {
    /// Load configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config: GraderConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or the default path; a missing default file means defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Apply `GAUNTLET_BACKEND` / `GAUNTLET_IMAGE`
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(backend) = std::env::var("GAUNTLET_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Ok(image) = std::env::var("GAUNTLET_IMAGE") {
            self.image = image;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.limits.timeout_ms == 0 {
            bail!("limits.timeout_ms must be greater than zero");
        }
        if self.limits.memory_limit_mb == 0 {
            bail!("limits.memory_limit_mb must be greater than zero");
        }
        if let Some(tol) = self.float_tolerance {
            if !tol.is_finite() || tol < 0.0 {
                bail!("float_tolerance must be a non-negative finite number");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"backend": "process", "limits": {{"timeout_ms": 750}}, "float_tolerance": 1e-6}}"#).unwrap();

        let config = GraderConfig::load(file.path()).unwrap();
        assert_eq!(config.backend, Backend::Process);
        assert_eq!(config.limits.timeout_ms, 750);
        assert_eq!(config.limits.memory_limit_mb, 256);
        assert_eq!(config.image, "python:3.12-slim");
        assert_eq!(config.float_tolerance, Some(1e-6));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"limits": {{"timeout_ms": 0}}}}"#).unwrap();
        assert!(GraderConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        assert!(GraderConfig::load_or_default(Some(Path::new("/nonexistent/gauntlet.json"))).is_err());
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("Docker".parse::<Backend>().unwrap(), Backend::Docker);
        assert_eq!("process".parse::<Backend>().unwrap(), Backend::Process);
        assert!("k8s".parse::<Backend>().is_err());
    }
}
