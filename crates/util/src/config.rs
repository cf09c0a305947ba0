//! Process configuration built once from the environment.
//!
//! Every variable is read a single time into an immutable [`CorralConfig`]
//! that is passed by reference to each component. Values that other tools
//! expect under different names (docker-machine's `AMAZONEC2_*` variables)
//! are derived on demand and handed to child processes explicitly; the
//! process environment is never mutated.

use std::{env, path::PathBuf, time::Duration};

use corral_types::{InstanceSpec, NodeName, NodeRole, RetryPolicy};
use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

use crate::expand_tilde;

/// Default agent count when `RANCHER_AGENT_COUNT` is unset.
pub const DEFAULT_AGENT_COUNT: u32 = 3;
/// Port the `rancher/server` container publishes.
pub const DEFAULT_RANCHER_PORT: u16 = 8080;
/// Default docker-machine storage directory.
pub const DEFAULT_STORAGE_PATH: &str = "~/.docker/machine";

/// Error surfaced when the environment does not describe a usable configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("the following environment variables are required: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("environment variable {name} has an invalid value '{value}': {reason}")]
    Invalid { name: String, value: String, reason: String },
}

/// Records every missing variable instead of stopping at the first one.
struct EnvReader<F> {
    lookup: F,
    missing: Vec<String>,
    invalid: Option<ConfigError>,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn new(lookup: F) -> Self {
        Self {
            lookup,
            missing: Vec::new(),
            invalid: None,
        }
    }

    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name).map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
    }

    fn required(&mut self, name: &str) -> String {
        match self.optional(name) {
            Some(value) => value,
            None => {
                debug!(variable = name, "missing required environment variable");
                self.missing.push(name.to_string());
                String::new()
            }
        }
    }

    fn parsed<T: std::str::FromStr>(&mut self, name: &str, default: T) -> T
    where
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.optional(name) else {
            return default;
        };
        match raw.parse::<T>() {
            Ok(value) => value,
            Err(error) => {
                self.invalid.get_or_insert(ConfigError::Invalid {
                    name: name.to_string(),
                    value: raw,
                    reason: error.to_string(),
                });
                default
            }
        }
    }

    fn seconds(&mut self, name: &str, default: Duration) -> Duration {
        Duration::from_secs(self.parsed(name, default.as_secs()))
    }

    fn finish<T>(self, value: T) -> Result<T, ConfigError> {
        if !self.missing.is_empty() {
            return Err(ConfigError::Missing(self.missing));
        }
        match self.invalid {
            Some(error) => Err(error),
            None => Ok(value),
        }
    }
}

/// AWS account, placement and instance settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsSettings {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub instance_type: String,
    pub ami: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub security_group: String,
    pub zone: String,
    /// Name prefix shared by every node of one CI run; may be empty.
    pub prefix: String,
    pub tags: IndexMap<String, String>,
    pub ssh_user: Option<String>,
}

impl AwsSettings {
    fn read<F: Fn(&str) -> Option<String>>(reader: &mut EnvReader<F>) -> Self {
        let tags = reader.optional("AWS_TAGS").map(|raw| parse_tags(&raw)).unwrap_or_default();
        Self {
            access_key_id: reader.required("AWS_ACCESS_KEY_ID"),
            secret_access_key: reader.required("AWS_SECRET_ACCESS_KEY"),
            region: reader.required("AWS_DEFAULT_REGION"),
            instance_type: reader.required("AWS_INSTANCE_TYPE"),
            ami: reader.required("AWS_AMI"),
            vpc_id: reader.required("AWS_VPC_ID"),
            subnet_id: reader.required("AWS_SUBNET_ID"),
            security_group: reader.required("AWS_SECURITY_GROUP"),
            zone: reader.required("AWS_ZONE"),
            prefix: reader.optional("AWS_PREFIX").unwrap_or_default(),
            tags,
            ssh_user: reader.optional("AWS_SSH_USER"),
        }
    }

    /// Instance description used for every node of the cluster.
    pub fn instance_spec(&self) -> InstanceSpec {
        InstanceSpec {
            instance_type: self.instance_type.clone(),
            ami: self.ami.clone(),
            region: self.region.clone(),
            zone: self.zone.clone(),
            vpc_id: self.vpc_id.clone(),
            subnet_id: self.subnet_id.clone(),
            security_group: self.security_group.clone(),
            tags: self.tags.clone(),
            ssh_user: self.ssh_user.clone(),
            root_size_gb: None,
        }
    }

    /// The `AMAZONEC2_*` variables docker-machine's EC2 driver reads.
    ///
    /// Pass these to the child process; they are not written to this
    /// process's environment.
    pub fn docker_machine_env(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("AMAZONEC2_ACCESS_KEY".to_string(), self.access_key_id.clone()),
            ("AMAZONEC2_SECRET_KEY".to_string(), self.secret_access_key.clone()),
            ("AMAZONEC2_REGION".to_string(), self.region.clone()),
            ("AMAZONEC2_INSTANCE_TYPE".to_string(), self.instance_type.clone()),
            ("AMAZONEC2_AMI".to_string(), self.ami.clone()),
            ("AMAZONEC2_VPC_ID".to_string(), self.vpc_id.clone()),
            ("AMAZONEC2_SUBNET_ID".to_string(), self.subnet_id.clone()),
            ("AMAZONEC2_SECURITY_GROUP".to_string(), self.security_group.clone()),
            ("AMAZONEC2_ZONE".to_string(), zone_letter(&self.zone)),
        ];
        if !self.tags.is_empty() {
            pairs.push(("AMAZONEC2_TAGS".to_string(), format_tags(&self.tags)));
        }
        if let Some(user) = &self.ssh_user {
            pairs.push(("AMAZONEC2_SSH_USER".to_string(), user.clone()));
        }
        pairs
    }
}

/// Rancher product version and node operating systems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RancherSettings {
    pub version: String,
    pub server_os: String,
    pub agent_os: String,
    pub agent_count: u32,
    pub port: u16,
    /// API key pair for an access-controlled server.
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl RancherSettings {
    fn read<F: Fn(&str) -> Option<String>>(reader: &mut EnvReader<F>) -> Self {
        Self {
            version: reader.required("RANCHER_VERSION"),
            server_os: reader.required("RANCHER_SERVER_OPERATINGSYSTEM"),
            agent_os: reader.required("RANCHER_AGENT_OPERATINGSYSTEM"),
            agent_count: reader.parsed("RANCHER_AGENT_COUNT", DEFAULT_AGENT_COUNT),
            port: reader.parsed("RANCHER_SERVER_PORT", DEFAULT_RANCHER_PORT),
            access_key: reader.optional("RANCHER_ACCESS_KEY"),
            secret_key: reader.optional("RANCHER_SECRET_KEY"),
        }
    }
}

/// Where and how docker-machine is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerMachineSettings {
    pub bin: String,
    pub storage_path: PathBuf,
}

impl Default for DockerMachineSettings {
    fn default() -> Self {
        Self {
            bin: "docker-machine".to_string(),
            storage_path: expand_tilde(DEFAULT_STORAGE_PATH),
        }
    }
}

impl DockerMachineSettings {
    fn read<F: Fn(&str) -> Option<String>>(reader: &mut EnvReader<F>) -> Self {
        let defaults = Self::default();
        Self {
            bin: reader.optional("DOCKER_MACHINE_BIN").unwrap_or(defaults.bin),
            storage_path: reader
                .optional("DOCKER_MACHINE_STORAGE_PATH")
                .map(|path| expand_tilde(&path))
                .unwrap_or(defaults.storage_path),
        }
    }
}

/// Bounds for the waiting steps of a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Wait for a freshly created node to report `running`.
    pub machine_ready: Duration,
    /// Wait for the Rancher API to answer.
    pub server_ready: Duration,
    /// Wait for every agent to report `active`.
    pub agents_active: Duration,
    /// Pause between polling ticks.
    pub poll_interval: Duration,
    /// Attempts for remote commands (ssh, registration).
    pub command_attempts: u32,
    /// Pause between remote command attempts.
    pub command_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            machine_ready: Duration::from_secs(600),
            server_ready: Duration::from_secs(600),
            agents_active: Duration::from_secs(900),
            poll_interval: Duration::from_secs(10),
            command_attempts: 10,
            command_delay: Duration::from_secs(30),
        }
    }
}

impl Timeouts {
    fn read<F: Fn(&str) -> Option<String>>(reader: &mut EnvReader<F>) -> Self {
        let defaults = Self::default();
        Self {
            machine_ready: reader.seconds("CORRAL_MACHINE_READY_TIMEOUT_SECS", defaults.machine_ready),
            server_ready: reader.seconds("CORRAL_SERVER_READY_TIMEOUT_SECS", defaults.server_ready),
            agents_active: reader.seconds("CORRAL_AGENTS_ACTIVE_TIMEOUT_SECS", defaults.agents_active),
            poll_interval: reader.seconds("CORRAL_POLL_INTERVAL_SECS", defaults.poll_interval),
            command_attempts: reader.parsed("CORRAL_COMMAND_ATTEMPTS", defaults.command_attempts),
            command_delay: reader.seconds("CORRAL_COMMAND_DELAY_SECS", defaults.command_delay),
        }
    }

    pub fn machine_ready_policy(&self) -> RetryPolicy {
        RetryPolicy::deadline(self.machine_ready).with_step_delay(self.poll_interval)
    }

    pub fn server_ready_policy(&self) -> RetryPolicy {
        RetryPolicy::deadline(self.server_ready).with_step_delay(self.poll_interval)
    }

    pub fn agents_active_policy(&self) -> RetryPolicy {
        RetryPolicy::deadline(self.agents_active).with_step_delay(self.poll_interval)
    }

    pub fn command_policy(&self) -> RetryPolicy {
        RetryPolicy::attempts(self.command_attempts).with_step_delay(self.command_delay)
    }
}

/// Complete configuration of one task run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorralConfig {
    pub aws: AwsSettings,
    pub rancher: RancherSettings,
    pub docker_machine: DockerMachineSettings,
    pub timeouts: Timeouts,
    pub debug: bool,
}

impl CorralConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut reader = EnvReader::new(lookup);
        let aws = AwsSettings::read(&mut reader);
        let rancher = RancherSettings::read(&mut reader);
        let docker_machine = DockerMachineSettings::read(&mut reader);
        let timeouts = Timeouts::read(&mut reader);
        let debug = debug_enabled(reader.optional("DEBUG").as_deref());
        reader.finish(Self {
            aws,
            rancher,
            docker_machine,
            timeouts,
            debug,
        })
    }

    pub fn server_name(&self) -> NodeName {
        NodeName::new(&self.aws.prefix, &self.rancher.version, &self.rancher.server_os, NodeRole::Server, 0)
    }

    pub fn agent_name(&self, index: u32) -> NodeName {
        NodeName::new(&self.aws.prefix, &self.rancher.version, &self.rancher.agent_os, NodeRole::Agent, index)
    }
}

/// `DEBUG` counts as enabled when set to anything other than `false`.
pub fn debug_enabled(raw: Option<&str>) -> bool {
    raw.is_some_and(|value| !value.trim().eq_ignore_ascii_case("false"))
}

/// Parse docker-machine's `key1,value1,key2,value2` tag syntax.
pub fn parse_tags(raw: &str) -> IndexMap<String, String> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    parts
        .chunks(2)
        .filter(|pair| !pair[0].is_empty())
        .map(|pair| (pair[0].to_string(), pair.get(1).copied().unwrap_or_default().to_string()))
        .collect()
}

pub fn format_tags(tags: &IndexMap<String, String>) -> String {
    tags.iter()
        .flat_map(|(key, value)| [key.as_str(), value.as_str()])
        .collect::<Vec<_>>()
        .join(",")
}

/// docker-machine wants the availability zone letter, not `us-west-2a`.
fn zone_letter(zone: &str) -> String {
    zone.chars()
        .last()
        .filter(|letter| letter.is_ascii_alphabetic())
        .map(|letter| letter.to_string())
        .unwrap_or_else(|| zone.to_string())
}
