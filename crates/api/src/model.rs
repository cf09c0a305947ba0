//! Response shapes of the Rancher `v2-beta` API that the client reads.

use serde::{Deserialize, Serialize};

/// Rancher's `{"type": "collection", "data": [...]}` envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Collection<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub agent_state: Option<String>,
}

impl Host {
    /// A host counts once the server reports it `active`; an agent that
    /// reconnects shows `agentState: reconnecting` while still `active`.
    pub fn is_active(&self) -> bool {
        self.state == "active" && self.agent_state.as_deref().is_none_or(|agent_state| agent_state == "active")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationToken {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub registration_url: Option<String>,
}

impl RegistrationToken {
    /// The `docker run rancher/agent ...` command, once the token is active.
    pub fn usable_command(self) -> Option<String> {
        if self.state != "active" {
            return None;
        }
        self.command.filter(|command| !command.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reconnecting_agents_are_not_active() {
        let host: Host = serde_json::from_value(json!({
            "id": "1h1",
            "state": "active",
            "agentState": "reconnecting"
        }))
        .unwrap();
        assert!(!host.is_active());

        let host: Host = serde_json::from_value(json!({"id": "1h2", "state": "active"})).unwrap();
        assert!(host.is_active());
    }

    #[test]
    fn pending_tokens_have_no_command() {
        let pending: RegistrationToken = serde_json::from_value(json!({
            "state": "registering",
            "command": "sudo docker run rancher/agent"
        }))
        .unwrap();
        assert!(pending.usable_command().is_none());

        let active: RegistrationToken = serde_json::from_value(json!({
            "state": "active",
            "command": "sudo docker run rancher/agent",
            "registrationUrl": "http://10.0.0.5:8080/v1/scripts/abc"
        }))
        .unwrap();
        assert_eq!(active.usable_command().as_deref(), Some("sudo docker run rancher/agent"));
    }

    #[test]
    fn collection_defaults_to_empty() {
        let collection: Collection<Project> = serde_json::from_value(json!({"type": "collection"})).unwrap();
        assert!(collection.data.is_empty());

        let hosts: Collection<Host> = serde_json::from_value(json!({"type": "collection"})).unwrap();
        assert!(hosts.data.is_empty());
        let tokens: Collection<RegistrationToken> = serde_json::from_value(json!({"data": []})).unwrap();
        assert!(tokens.data.is_empty());
    }
}
