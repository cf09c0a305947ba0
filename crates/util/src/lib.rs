//! Shared helpers for the Corral workspace: configuration loading, the shell
//! boundary, the CI handoff file and small text utilities.

use std::path::PathBuf;

use dirs_next::home_dir;
use once_cell::sync::Lazy;
use regex::Regex;

pub mod async_runtime;
pub mod config;
pub mod handoff;
pub mod http;
pub mod shell;

pub use async_runtime::block_on_future;
pub use config::{AwsSettings, ConfigError, CorralConfig, DockerMachineSettings, RancherSettings, Timeouts};
pub use handoff::{HandoffError, HandoffStore};
pub use shell::{CommandRunner, ShellCommand, ShellError, ShellOutput, SystemRunner};

static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(authorization: )([\w\-\.=:/+]+)",
        r"(?i)([A-Z0-9_]*?(KEY|TOKEN|SECRET|PASSWORD)=)([^\s]+)",
        r"(?i)(--amazonec2-(?:access|secret)-key[ =])([^\s]+)",
        r"(/v1/scripts/)([A-Za-z0-9:]+)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Redacts values that look like secrets in a string.
///
/// Covers authorization headers, `*_KEY=`/`*_TOKEN=` style assignments,
/// docker-machine credential flags and Rancher registration URLs.
pub fn redact_sensitive(input: &str) -> String {
    let mut redacted = input.to_string();
    for re in SENSITIVE_PATTERNS.iter() {
        redacted = re
            .replace_all(&redacted, |caps: &regex::Captures| {
                let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                format!("{}<redacted>", prefix)
            })
            .to_string();
    }
    redacted
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    let trimmed = path.trim();
    if trimmed == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = trimmed.strip_prefix("~/") {
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    PathBuf::from(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_credentials_in_command_lines() {
        let line = "AWS_SECRET_ACCESS_KEY=abc123 docker-machine create --amazonec2-access-key AKIAXYZ node";
        let redacted = redact_sensitive(line);
        assert!(!redacted.contains("abc123"));
        assert!(!redacted.contains("AKIAXYZ"));
        assert!(redacted.contains("AWS_SECRET_ACCESS_KEY=<redacted>"));
    }

    #[test]
    fn redacts_registration_url_token() {
        let command = "sudo docker run rancher/agent:v1.2.2 http://10.0.0.5:8080/v1/scripts/ABCD1234:1514764800000:xyz";
        let redacted = redact_sensitive(command);
        assert!(redacted.ends_with("/v1/scripts/<redacted>"));
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(redact_sensitive("docker-machine ip server0"), "docker-machine ip server0");
    }

    #[test]
    fn expand_tilde_keeps_absolute_paths() {
        assert_eq!(expand_tilde("/workdir/.docker/machine"), PathBuf::from("/workdir/.docker/machine"));
    }
}
