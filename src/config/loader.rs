/// Configuration loading from a JSON file
use crate::config::types::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// One allowlist rule as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistEntryConfig {
    pub name: String,
    /// Exact tool executable path
    #[serde(default)]
    pub executable_path: Option<String>,
    /// Regex over the tool executable path; used when `executable_path` is absent
    #[serde(default)]
    pub executable_path_regex: Option<String>,
    /// Regex over the accessed path; empty matches every path
    #[serde(default)]
    pub path_regex: String,
    #[serde(default)]
    pub allows_caching: bool,
}

/// Engine-wide sandbox configuration, read once per build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfiguration {
    pub allowlist: Vec<AllowlistEntryConfig>,
    pub fail_unexpected_file_accesses: bool,
    /// Track `NtCreateFile`/`ZwCreateFile` accesses as violations
    pub monitor_nt_create_file: bool,
    /// Allowlisted-but-uncacheable matches are errors in distributed builds
    pub distributed_build: bool,
    pub default_timeout_ms: u64,
    pub warning_timeout_ms: u64,
    pub nested_process_termination_timeout_ms: u64,
    pub max_output_in_memory_bytes: usize,
    pub message_count_semaphore_timeout_ms: u64,
}

impl Default for SandboxConfiguration {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            fail_unexpected_file_accesses: false,
            monitor_nt_create_file: false,
            distributed_build: false,
            default_timeout_ms: 10 * 60 * 1000,
            warning_timeout_ms: 5 * 60 * 1000,
            nested_process_termination_timeout_ms: 30 * 1000,
            max_output_in_memory_bytes: 16 * 1024,
            message_count_semaphore_timeout_ms: 5 * 1000,
        }
    }
}

impl SandboxConfiguration {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SandboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn warning_timeout(&self) -> Duration {
        Duration::from_millis(self.warning_timeout_ms)
    }

    pub fn nested_process_termination_timeout(&self) -> Duration {
        Duration::from_millis(self.nested_process_termination_timeout_ms)
    }

    pub fn message_count_semaphore_timeout(&self) -> Duration {
        Duration::from_millis(self.message_count_semaphore_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn empty_object_yields_defaults() {
        let config = SandboxConfiguration::from_json_str("{}").unwrap();
        assert_eq!(config, SandboxConfiguration::default());
        assert_eq!(config.default_timeout(), Duration::from_secs(600));
        assert_eq!(config.nested_process_termination_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_output_in_memory_bytes, 16 * 1024);
    }

    #[test]
    fn loads_allowlist_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "allowlist": [
                    {{"name": "mspdbsrv", "executable_path_regex": ".*mspdbsrv", "path_regex": ".*\\.pdb", "allows_caching": true}},
                    {{"name": "any-tmp", "executable_path": "/usr/bin/cc"}}
                ],
                "distributed_build": true,
                "default_timeout_ms": 1500
            }}"#
        )
        .unwrap();

        let config = SandboxConfiguration::load_from_file(file.path()).unwrap();
        assert_eq!(config.allowlist.len(), 2);
        assert!(config.allowlist[0].allows_caching);
        assert_eq!(config.allowlist[1].path_regex, "");
        assert_eq!(config.allowlist[1].executable_path.as_deref(), Some("/usr/bin/cc"));
        assert!(config.distributed_build);
        assert_eq!(config.default_timeout(), Duration::from_millis(1500));
        assert_eq!(config.warning_timeout_ms, 5 * 60 * 1000);
    }

    #[test]
    fn malformed_json_is_config_error() {
        let err = SandboxConfiguration::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
        let err = SandboxConfiguration::load_from_file("/nonexistent/pipbox.json").unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }
}
