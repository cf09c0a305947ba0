//! Rancher server and agent orchestration.
//!
//! Composes the node [`Lifecycle`], remote execution over the provider and
//! the Rancher API into the provisioning steps a CI pipeline runs:
//! bring up the server, configure it, register agents, and tear it all
//! down again.

use std::collections::HashSet;

use corral_api::{RancherClient, READINESS_SCHEMA, model::Host};
use corral_types::{AttemptError, Observation};
use corral_util::{
    CorralConfig, HandoffStore, block_on_future,
    handoff::{AGENT_COUNT_KEY, PROJECT_ID_KEY, SERVER_ADDRESS_KEY},
};
use tracing::{info, warn};

use crate::{ComputeProvider, CorralError, Lifecycle, RemoteExec, Teardown, retry, wait_for_count, wait_for_flag};

/// Synchronous view of the Rancher API calls the orchestration needs.
pub trait RancherApi {
    fn schema_ready(&self) -> Result<Observation, AttemptError>;
    fn api_host(&self) -> Result<Option<String>, AttemptError>;
    fn set_api_host(&self, value: &str) -> Result<(), AttemptError>;
    fn default_project_id(&self) -> Result<String, AttemptError>;
    fn create_registration_token(&self, project_id: &str) -> Result<(), AttemptError>;
    fn registration_command(&self, project_id: &str) -> Result<Option<String>, AttemptError>;
    fn hosts(&self, project_id: &str) -> Result<Vec<Host>, AttemptError>;
    fn deactivate_host(&self, project_id: &str, host_id: &str) -> Result<(), AttemptError>;
    fn delete_host(&self, project_id: &str, host_id: &str) -> Result<(), AttemptError>;
}

impl RancherApi for RancherClient {
    fn schema_ready(&self) -> Result<Observation, AttemptError> {
        let client = self.clone();
        block_on_future(async move { client.probe_schema(READINESS_SCHEMA).await })
    }

    fn api_host(&self) -> Result<Option<String>, AttemptError> {
        let client = self.clone();
        block_on_future(async move { client.api_host().await })
    }

    fn set_api_host(&self, value: &str) -> Result<(), AttemptError> {
        let client = self.clone();
        let value = value.to_string();
        block_on_future(async move { client.set_api_host(&value).await })
    }

    fn default_project_id(&self) -> Result<String, AttemptError> {
        let client = self.clone();
        block_on_future(async move { client.default_project_id().await })
    }

    fn create_registration_token(&self, project_id: &str) -> Result<(), AttemptError> {
        let client = self.clone();
        let project_id = project_id.to_string();
        block_on_future(async move { client.create_registration_token(&project_id).await })
    }

    fn registration_command(&self, project_id: &str) -> Result<Option<String>, AttemptError> {
        let client = self.clone();
        let project_id = project_id.to_string();
        block_on_future(async move { client.registration_command(&project_id).await })
    }

    fn hosts(&self, project_id: &str) -> Result<Vec<Host>, AttemptError> {
        let client = self.clone();
        let project_id = project_id.to_string();
        block_on_future(async move { client.hosts(&project_id).await })
    }

    fn deactivate_host(&self, project_id: &str, host_id: &str) -> Result<(), AttemptError> {
        let client = self.clone();
        let (project_id, host_id) = (project_id.to_string(), host_id.to_string());
        block_on_future(async move { client.deactivate_host(&project_id, &host_id).await })
    }

    fn delete_host(&self, project_id: &str, host_id: &str) -> Result<(), AttemptError> {
        let client = self.clone();
        let (project_id, host_id) = (project_id.to_string(), host_id.to_string());
        block_on_future(async move { client.delete_host(&project_id, &host_id).await })
    }
}

/// Project id and agent registration command of a configured server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRegistration {
    pub project_id: String,
    pub command: String,
}

/// The Rancher control-plane node.
pub struct RancherServer<'a, P> {
    config: &'a CorralConfig,
    lifecycle: &'a Lifecycle<P>,
    handoff: &'a HandoffStore,
}

impl<'a, P: ComputeProvider + RemoteExec> RancherServer<'a, P> {
    pub fn new(config: &'a CorralConfig, lifecycle: &'a Lifecycle<P>, handoff: &'a HandoffStore) -> Self {
        Self {
            config,
            lifecycle,
            handoff,
        }
    }

    pub fn name(&self) -> String {
        self.config.server_name().to_string()
    }

    /// Container start command; leaves an existing `rancher_server_<version>`
    /// container alone.
    pub fn container_command(&self) -> String {
        let version = &self.config.rancher.version;
        let port = self.config.rancher.port;
        format!(
            "sudo docker inspect rancher_server_{version} >/dev/null 2>&1 || \
             sudo docker run -d --name rancher_server_{version} -p {port}:8080 --restart=always rancher/server:{version}"
        )
    }

    /// Bring up the server node and the `rancher/server` container.
    ///
    /// A server node that is already running is reused. Returns the node's
    /// address, which is also written to the handoff file. Call
    /// [`wait_until_ready`](Self::wait_until_ready) once an API client for
    /// that address exists.
    pub fn provision(&self) -> Result<String, CorralError> {
        let name = self.name();
        let spec = self.config.aws.instance_spec();
        match self.lifecycle.ensure(&name, &spec) {
            Ok(_) => {}
            Err(CorralError::AlreadyExists { state, .. }) => {
                info!(node = %name, %state, "server node already exists; reusing it");
            }
            Err(error) => return Err(error),
        }

        let policy = self.config.timeouts.command_policy();
        let address = retry(&format!("resolve address of {name}"), &policy, || self.lifecycle.provider().address(&name))?;
        info!(node = %name, %address, version = %self.config.rancher.version, "starting rancher/server container");
        let command = self.container_command();
        retry(&format!("start rancher/server on {name}"), &policy, || {
            self.lifecycle.provider().exec(&name, &command)
        })?;

        self.handoff.record(SERVER_ADDRESS_KEY, address.clone())?;
        Ok(address)
    }

    /// Poll the readiness schema until the API answers 200.
    pub fn wait_until_ready(&self, api: &impl RancherApi) -> Result<(), CorralError> {
        let policy = self.config.timeouts.server_ready_policy();
        wait_for_flag("rancher/server API", &policy, || {
            api.schema_ready().map(|observation| matches!(observation, Observation::Flag(true)))
        })
    }

    /// Point the server at its own address and obtain an agent registration
    /// command for the default project.
    pub fn configure(&self, api: &impl RancherApi, address: &str) -> Result<ServerRegistration, CorralError> {
        let policy = self.config.timeouts.command_policy();
        let api_host = format!("http://{}:{}", address, self.config.rancher.port);
        let current = retry("read api.host", &policy, || api.api_host())?;
        if current.as_deref() == Some(api_host.as_str()) {
            info!(%api_host, "api.host already configured");
        } else {
            retry("set api.host", &policy, || api.set_api_host(&api_host))?;
            info!(%api_host, "configured api.host");
        }
        self.registration(api)
    }

    /// Project id and registration command, creating a registration token
    /// when the project has none yet.
    pub fn registration(&self, api: &impl RancherApi) -> Result<ServerRegistration, CorralError> {
        let policy = self.config.timeouts.command_policy();
        let project_id = match self.handoff.get(PROJECT_ID_KEY) {
            Some(project_id) => project_id,
            None => retry("find default project", &policy, || api.default_project_id())?,
        };
        info!(project = %project_id, "using project");

        let mut command = retry("read registration command", &policy, || api.registration_command(&project_id))?;
        if command.is_none() {
            retry("create registration token", &policy, || api.create_registration_token(&project_id))?;
            wait_for_flag("agent registration command", &self.config.timeouts.server_ready_policy(), || {
                command = api.registration_command(&project_id)?;
                Ok(command.is_some())
            })?;
        }
        let command = command.ok_or_else(|| CorralError::ProvisioningFailed {
            name: self.name(),
            detail: "registration command disappeared after it was reported".to_string(),
        })?;

        self.handoff.record(PROJECT_ID_KEY, project_id.clone())?;
        Ok(ServerRegistration { project_id, command })
    }

    /// Remove the server node and the facts recorded about it. The handoff
    /// keys are cleared even when the teardown is incomplete.
    pub fn deprovision(&self, missing_ok: bool) -> Result<Teardown, CorralError> {
        let teardown = self.lifecycle.deprovision(&self.name(), missing_ok);
        self.handoff.forget(SERVER_ADDRESS_KEY)?;
        self.handoff.forget(PROJECT_ID_KEY)?;
        teardown
    }
}

/// The worker nodes registered with a server.
pub struct RancherAgents<'a, P> {
    config: &'a CorralConfig,
    lifecycle: &'a Lifecycle<P>,
    handoff: &'a HandoffStore,
}

impl<'a, P: ComputeProvider + RemoteExec> RancherAgents<'a, P> {
    pub fn new(config: &'a CorralConfig, lifecycle: &'a Lifecycle<P>, handoff: &'a HandoffStore) -> Self {
        Self {
            config,
            lifecycle,
            handoff,
        }
    }

    /// Highest agent count any `provision` recorded, if one did.
    pub fn recorded_count(&self) -> Option<u32> {
        self.handoff.get(AGENT_COUNT_KEY).and_then(|count| count.parse().ok())
    }

    /// How many agent names a teardown walks: an explicit count, otherwise
    /// the larger of the recorded and configured counts.
    pub fn teardown_count(&self, count: Option<u32>) -> u32 {
        count.unwrap_or_else(|| {
            self.recorded_count()
                .unwrap_or_default()
                .max(self.config.rancher.agent_count)
        })
    }

    pub fn names(&self, count: u32) -> Vec<String> {
        (0..count).map(|index| self.config.agent_name(index).to_string()).collect()
    }

    /// Create `count` agent nodes, register the ones the server does not
    /// know yet, then wait until `count` hosts are active.
    pub fn provision(&self, api: &impl RancherApi, registration: &ServerRegistration, count: u32) -> Result<u64, CorralError> {
        let policy = self.config.timeouts.command_policy();
        let spec = self.config.aws.instance_spec();
        let project_id = registration.project_id.as_str();
        let registered: HashSet<String> = retry("list hosts", &policy, || api.hosts(project_id))?
            .into_iter()
            .filter_map(|host| host.hostname)
            .collect();
        let recorded = self.recorded_count().unwrap_or_default().max(count);
        self.handoff.record(AGENT_COUNT_KEY, recorded.to_string())?;

        for name in self.names(count) {
            match self.lifecycle.ensure(&name, &spec) {
                Ok(_) => {}
                Err(CorralError::AlreadyExists { state, .. }) => {
                    info!(node = %name, %state, "agent node already exists");
                }
                Err(error) => return Err(error),
            }
            if registered.contains(&name) {
                info!(node = %name, "agent already registered");
                continue;
            }
            info!(node = %name, "registering agent");
            retry(&format!("register {name}"), &policy, || self.lifecycle.provider().exec(&name, &registration.command))?;
        }

        wait_for_count("active agents", &self.config.timeouts.agents_active_policy(), u64::from(count), || {
            let hosts = api.hosts(project_id)?;
            Ok(hosts.iter().filter(|host| host.is_active()).count() as u64)
        })
    }

    /// Remove every registered host from the server, then every agent node.
    ///
    /// `connect` builds an API client for the server address. When the
    /// server node is gone the API step is skipped (with `missing_ok`) and
    /// only the agent nodes are removed. `count` overrides how many agent
    /// names are walked (see [`teardown_count`](Self::teardown_count)).
    /// Every step runs even if an earlier one failed.
    pub fn deprovision<A, C>(&self, connect: C, count: Option<u32>, missing_ok: bool) -> Result<(), CorralError>
    where
        A: RancherApi,
        C: FnOnce(&str) -> Result<A, CorralError>,
    {
        let server = self.config.server_name().to_string();
        let mut failures = Vec::new();

        match self.lifecycle.find(&server)? {
            Some(_) => {
                if let Err(error) = self.remove_hosts(&server, connect) {
                    warn!(error = %error, "could not remove hosts from the server; continuing");
                    failures.push(error.to_string());
                }
            }
            None if missing_ok => {
                info!(node = %server, "server node is absent; skipping host removal");
            }
            None => return Err(CorralError::NotFound { name: server }),
        }

        for name in self.names(self.teardown_count(count)) {
            match self.lifecycle.deprovision(&name, true) {
                Ok(_) => {}
                Err(CorralError::TeardownIncomplete { failures: node_failures, .. }) => failures.extend(node_failures),
                Err(error) => failures.push(format!("{name}: {error}")),
            }
        }

        if failures.is_empty() {
            self.handoff.forget(AGENT_COUNT_KEY)?;
            Ok(())
        } else {
            Err(CorralError::TeardownIncomplete {
                name: "rancher agents".to_string(),
                failures,
            })
        }
    }

    fn remove_hosts<A, C>(&self, server: &str, connect: C) -> Result<(), CorralError>
    where
        A: RancherApi,
        C: FnOnce(&str) -> Result<A, CorralError>,
    {
        let policy = self.config.timeouts.command_policy();
        let address = retry(&format!("resolve address of {server}"), &policy, || {
            self.lifecycle.provider().address(server)
        })?;
        let api = connect(&address)?;
        let project_id = retry("find default project", &policy, || api.default_project_id())?;
        let hosts = retry("list hosts", &policy, || api.hosts(&project_id))?;

        let mut failures = Vec::new();
        for host in hosts {
            info!(host = %host.id, hostname = ?host.hostname, "removing host from server");
            let removed = retry(&format!("deactivate host {}", host.id), &policy, || {
                api.deactivate_host(&project_id, &host.id)
            })
            .and_then(|_| retry(&format!("delete host {}", host.id), &policy, || api.delete_host(&project_id, &host.id)));
            if let Err(error) = removed {
                failures.push(error.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CorralError::TeardownIncomplete {
                name: server.to_string(),
                failures,
            })
        }
    }
}
