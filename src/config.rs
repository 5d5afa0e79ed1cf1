//! Job configuration.
//!
//! A `JobConfig` is built from a TOML file or defaults and threaded
//! explicitly through the master, agents, and workers; there is no
//! process-wide configuration singleton.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Static configuration for one training job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Job tag; namespaces profile files under `base_dir`.
    pub tag: String,
    pub base_dir: PathBuf,
    /// Hostfile path (`<ip> slots=<n> port=<p>` per line).
    pub hostfile: PathBuf,
    /// Training script the master distributes to agents.
    pub script: PathBuf,
    pub script_args: Vec<String>,
    /// GPUs per node; all nodes are assumed homogeneous.
    pub gpus_per_node: usize,
    /// Global microbatch count per optimizer step, split across pipelines.
    pub global_microbatches: usize,
    /// Candidate node counts to plan templates for. Empty means
    /// 1..=hostfile length.
    pub candidate_node_counts: Vec<usize>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            tag: "default".into(),
            base_dir: PathBuf::from("/tmp/oobleck"),
            hostfile: PathBuf::from("hostfile"),
            script: PathBuf::from("train.py"),
            script_args: Vec::new(),
            gpus_per_node: 1,
            global_microbatches: 24,
            candidate_node_counts: Vec::new(),
        }
    }
}

impl JobConfig {
    pub fn from_toml(path: &Path) -> Result<Self, ConfigError> {
        Ok(toml::from_str(&std::fs::read_to_string(path)?)?)
    }

    /// Profile CSV path for this job: `<base_dir>/profiles/<tag>.csv`.
    pub fn profile_path(&self) -> PathBuf {
        self.base_dir.join("profiles").join(format!("{}.csv", self.tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = JobConfig::default();
        assert_eq!(config.gpus_per_node, 1);
        assert!(config.candidate_node_counts.is_empty());
    }

    #[test]
    fn toml_roundtrip_with_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(
            &path,
            "tag = \"gpt2-test\"\ngpus_per_node = 4\nglobal_microbatches = 48\n",
        )
        .unwrap();

        let config = JobConfig::from_toml(&path).unwrap();
        assert_eq!(config.tag, "gpt2-test");
        assert_eq!(config.gpus_per_node, 4);
        assert_eq!(config.global_microbatches, 48);
        // Unspecified fields keep their defaults.
        assert_eq!(config.script, PathBuf::from("train.py"));
        assert!(config.profile_path().ends_with("profiles/gpt2-test.csv"));
    }

    #[test]
    fn malformed_toml_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(&path, "tag = [not toml").unwrap();
        assert!(matches!(
            JobConfig::from_toml(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
