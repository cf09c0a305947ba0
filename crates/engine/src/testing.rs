//! In-memory collaborators for engine tests.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
};

use corral_types::{AttemptError, InstanceRecord, InstanceSpec, InstanceState};
use indexmap::IndexMap;

use crate::{ComputeProvider, RemoteExec};

/// Compute provider backed by a map; new nodes report `running` on the
/// first state check after creation.
#[derive(Default)]
pub(crate) struct FakeProvider {
    nodes: RefCell<HashMap<String, InstanceRecord>>,
    calls: RefCell<Vec<&'static str>>,
    create_transient_failures: Cell<u32>,
    create_rejection: RefCell<Option<String>>,
    terminate_rejection: RefCell<Option<String>>,
    exec_transient_failures: Cell<u32>,
    boot_state: RefCell<Option<InstanceState>>,
    pub executed: RefCell<Vec<(String, String)>>,
}

impl FakeProvider {
    pub fn insert(&self, record: InstanceRecord) {
        self.nodes.borrow_mut().insert(record.name.clone(), record);
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls.borrow().iter().filter(|call| **call == operation).count()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.borrow().values().filter(|record| !record.state.is_gone()).count()
    }

    pub fn state_of(&self, name: &str) -> Option<InstanceState> {
        self.nodes.borrow().get(name).map(|record| record.state.clone())
    }

    /// The next `times` creates make the node, then report a transient error.
    pub fn fail_create_after_creating(&self, times: u32) {
        self.create_transient_failures.set(times);
    }

    pub fn reject_create(&self, message: &str) {
        *self.create_rejection.borrow_mut() = Some(message.to_string());
    }

    pub fn reject_terminate(&self, message: &str) {
        *self.terminate_rejection.borrow_mut() = Some(message.to_string());
    }

    /// Booting nodes end up in `state` instead of `running`.
    pub fn boot_into(&self, state: InstanceState) {
        *self.boot_state.borrow_mut() = Some(state);
    }

    pub fn fail_exec(&self, times: u32) {
        self.exec_transient_failures.set(times);
    }

    fn record(&self, operation: &'static str) {
        self.calls.borrow_mut().push(operation);
    }

    fn missing(name: &str) -> AttemptError {
        AttemptError::not_found(format!("Host does not exist: \"{name}\""))
    }
}

impl ComputeProvider for FakeProvider {
    fn find(&self, name: &str) -> Result<Option<InstanceRecord>, AttemptError> {
        self.record("find");
        Ok(self.nodes.borrow().get(name).cloned())
    }

    fn create(&self, name: &str, spec: &InstanceSpec) -> Result<InstanceRecord, AttemptError> {
        self.record("create");
        if let Some(message) = self.create_rejection.borrow().clone() {
            return Err(AttemptError::fatal(message));
        }
        let mut record = InstanceRecord::new(name, InstanceState::Pending);
        record.tagged = !spec.tags.is_empty();
        self.insert(record.clone());
        let remaining = self.create_transient_failures.get();
        if remaining > 0 {
            self.create_transient_failures.set(remaining - 1);
            return Err(AttemptError::transient("Error creating machine: connection reset"));
        }
        Ok(record)
    }

    fn tag(&self, name: &str, _tags: &IndexMap<String, String>) -> Result<(), AttemptError> {
        self.record("tag");
        match self.nodes.borrow_mut().get_mut(name) {
            Some(record) => {
                record.tagged = true;
                Ok(())
            }
            None => Err(Self::missing(name)),
        }
    }

    fn start(&self, name: &str) -> Result<(), AttemptError> {
        self.record("start");
        match self.nodes.borrow_mut().get_mut(name) {
            Some(record) => {
                record.state = InstanceState::Pending;
                Ok(())
            }
            None => Err(Self::missing(name)),
        }
    }

    fn state(&self, name: &str) -> Result<InstanceState, AttemptError> {
        self.record("state");
        match self.nodes.borrow_mut().get_mut(name) {
            Some(record) => {
                let observed = record.state.clone();
                if observed == InstanceState::Pending {
                    record.state = self.boot_state.borrow().clone().unwrap_or(InstanceState::Running);
                    if record.state != InstanceState::Running {
                        return Ok(record.state.clone());
                    }
                }
                Ok(observed)
            }
            None => Err(Self::missing(name)),
        }
    }

    fn address(&self, name: &str) -> Result<String, AttemptError> {
        self.record("address");
        let nodes = self.nodes.borrow();
        match nodes.get(name) {
            Some(_) => Ok(format!("10.0.0.{}", nodes.len())),
            None => Err(Self::missing(name)),
        }
    }

    fn terminate(&self, name: &str) -> Result<(), AttemptError> {
        self.record("terminate");
        if let Some(message) = self.terminate_rejection.borrow().clone() {
            return Err(AttemptError::fatal(message));
        }
        match self.nodes.borrow_mut().get_mut(name) {
            Some(record) => {
                record.state = InstanceState::Terminated;
                Ok(())
            }
            None => Err(Self::missing(name)),
        }
    }

    fn release_credentials(&self, _name: &str) -> Result<(), AttemptError> {
        self.record("release_credentials");
        Ok(())
    }
}

impl RemoteExec for FakeProvider {
    fn exec(&self, name: &str, command: &str) -> Result<String, AttemptError> {
        self.record("exec");
        let remaining = self.exec_transient_failures.get();
        if remaining > 0 {
            self.exec_transient_failures.set(remaining - 1);
            return Err(AttemptError::transient("ssh: connect to host port 22: Connection refused"));
        }
        self.executed.borrow_mut().push((name.to_string(), command.to_string()));
        Ok(String::new())
    }
}
