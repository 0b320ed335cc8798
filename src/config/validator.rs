// Eager configuration contract checks.
// Misconfiguration fails fast with every problem listed, never silently tolerated.

use crate::config::loader::SandboxConfiguration;
use crate::config::types::{Result, SandboxError};
use regex::Regex;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Allowlisting and fail-on-unexpected-access are mutually exclusive.
pub fn validate_reporting_config(
    allowlist_len: usize,
    fail_unexpected_file_accesses: bool,
) -> Result<()> {
    if allowlist_len > 0 && fail_unexpected_file_accesses {
        return Err(SandboxError::Config(format!(
            "a non-empty allowlist ({} entries) cannot be combined with fail_unexpected_file_accesses",
            allowlist_len
        )));
    }
    Ok(())
}

/// Validate a loaded configuration; any error is fatal.
pub fn validate_config(config: &SandboxConfiguration) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    if let Err(SandboxError::Config(message)) =
        validate_reporting_config(config.allowlist.len(), config.fail_unexpected_file_accesses)
    {
        result.add_error(message);
    }

    validate_allowlist(config, &mut result);
    validate_timeouts(config, &mut result);

    if config.max_output_in_memory_bytes == 0 {
        result.add_error("max_output_in_memory_bytes cannot be zero".to_string());
    }

    if !result.is_valid() {
        return Err(SandboxError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    for warning in &result.warnings {
        log::warn!("{}", warning);
    }
    Ok(result)
}

fn validate_allowlist(config: &SandboxConfiguration, result: &mut ValidationResult) {
    for entry in &config.allowlist {
        if entry.name.trim().is_empty() {
            result.add_error("allowlist entry has an empty name".to_string());
        }
        match (&entry.executable_path, &entry.executable_path_regex) {
            (None, None) => result.add_error(format!(
                "allowlist entry '{}' needs executable_path or executable_path_regex",
                entry.name
            )),
            (Some(_), Some(_)) => result.add_warning(format!(
                "allowlist entry '{}' sets both executable_path and executable_path_regex; the exact path wins",
                entry.name
            )),
            _ => {}
        }
        for (field, pattern) in [
            ("executable_path_regex", entry.executable_path_regex.as_deref()),
            ("path_regex", Some(entry.path_regex.as_str())),
        ] {
            if let Some(pattern) = pattern {
                if let Err(e) = Regex::new(pattern) {
                    result.add_error(format!(
                        "allowlist entry '{}' has invalid {}: {}",
                        entry.name, field, e
                    ));
                }
            }
        }
    }
}

fn validate_timeouts(config: &SandboxConfiguration, result: &mut ValidationResult) {
    if config.default_timeout_ms == 0 {
        result.add_error("default_timeout_ms cannot be zero".to_string());
    }
    if config.warning_timeout_ms > config.default_timeout_ms {
        result.add_warning(format!(
            "warning_timeout_ms {} exceeds default_timeout_ms {}; the warning never fires",
            config.warning_timeout_ms, config.default_timeout_ms
        ));
    }
    if config.message_count_semaphore_timeout_ms == 0 {
        result.add_error("message_count_semaphore_timeout_ms cannot be zero".to_string());
    }
}
