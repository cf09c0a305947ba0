//! docker-machine backed [`ComputeProvider`].
//!
//! Every call shells out to `docker-machine -s <storage> ...` with the
//! derived `AMAZONEC2_*` variables set on the child process only. Exit
//! failures are classified here, once: a missing host is
//! [`FailureKind::NotFound`], AWS authorization/quota/parameter errors are
//! fatal and everything else is assumed transient.

use std::{fs, io};

use corral_types::{AttemptError, FailureKind, InstanceRecord, InstanceSpec, InstanceState};
use corral_util::{
    AwsSettings, CommandRunner, DockerMachineSettings, ShellCommand, ShellError, ShellOutput, SystemRunner,
    config::format_tags,
};
use indexmap::IndexMap;
use tracing::{debug, info};

use crate::{ComputeProvider, RemoteExec};

const MISSING_HOST_MARKER: &str = "Host does not exist";

const FATAL_MARKERS: &[&str] = &[
    "AuthFailure",
    "UnauthorizedOperation",
    "InstanceLimitExceeded",
    "InvalidAMIID",
    "InvalidParameter",
    "InvalidSubnetID",
    "InvalidGroup",
    "OptInRequired",
    "already exists",
];

/// Decide how a failed docker-machine invocation should be treated.
pub fn classify_failure(error: &ShellError) -> FailureKind {
    let stderr = error.stderr();
    if stderr.contains(MISSING_HOST_MARKER) {
        FailureKind::NotFound
    } else if FATAL_MARKERS.iter().any(|marker| stderr.contains(marker)) {
        FailureKind::Fatal
    } else {
        FailureKind::Transient
    }
}

pub struct DockerMachine<R = SystemRunner> {
    settings: DockerMachineSettings,
    driver_env: Vec<(String, String)>,
    runner: R,
}

impl DockerMachine<SystemRunner> {
    pub fn new(settings: DockerMachineSettings, aws: &AwsSettings) -> Self {
        Self::with_runner(settings, aws.docker_machine_env(), SystemRunner)
    }
}

impl<R: CommandRunner> DockerMachine<R> {
    pub fn with_runner(settings: DockerMachineSettings, driver_env: Vec<(String, String)>, runner: R) -> Self {
        Self {
            settings,
            driver_env,
            runner,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Build `docker-machine -s <storage> <args...>`.
    pub fn command<I, S>(&self, args: I) -> ShellCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ShellCommand::new(&self.settings.bin)
            .arg("-s")
            .arg(self.settings.storage_path.to_string_lossy())
            .args(args)
            .envs(self.driver_env.iter().cloned())
    }

    fn run<I, S>(&self, args: I) -> Result<ShellOutput, AttemptError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner
            .run(&self.command(args))
            .map_err(|error| error.into_attempt(classify_failure))
    }

    /// `docker-machine create` arguments for the EC2 driver.
    ///
    /// The security group is passed explicitly even though the environment
    /// carries it; the driver otherwise falls back to its own default group.
    fn create_args(name: &str, spec: &InstanceSpec) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--driver".to_string(),
            "amazonec2".to_string(),
            "--amazonec2-security-group".to_string(),
            spec.security_group.clone(),
        ];
        if !spec.tags.is_empty() {
            args.push("--amazonec2-tags".to_string());
            args.push(format_tags(&spec.tags));
        }
        if let Some(size) = spec.root_size_gb {
            args.push("--amazonec2-root-size".to_string());
            args.push(size.to_string());
        }
        if let Some(user) = &spec.ssh_user {
            args.push("--amazonec2-ssh-user".to_string());
            args.push(user.clone());
        }
        args.push(name.to_string());
        args
    }
}

impl<R: CommandRunner> ComputeProvider for DockerMachine<R> {
    fn find(&self, name: &str) -> Result<Option<InstanceRecord>, AttemptError> {
        match self.run(["status", name]) {
            Ok(output) => Ok(Some(InstanceRecord::new(name, InstanceState::parse(output.text())))),
            Err(error) if error.kind == FailureKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn create(&self, name: &str, spec: &InstanceSpec) -> Result<InstanceRecord, AttemptError> {
        info!(node = name, instance_type = %spec.instance_type, "creating docker-machine node");
        self.run(Self::create_args(name, spec))?;
        let mut record = InstanceRecord::new(name, InstanceState::Pending);
        record.tagged = !spec.tags.is_empty();
        Ok(record)
    }

    /// The EC2 driver only tags at creation time; this confirms the node
    /// exists so a later tag request cannot silently target nothing.
    fn tag(&self, name: &str, tags: &IndexMap<String, String>) -> Result<(), AttemptError> {
        match self.find(name)? {
            Some(_) => {
                debug!(node = name, tags = %format_tags(tags), "tags are applied at creation by the amazonec2 driver");
                Ok(())
            }
            None => Err(AttemptError::not_found(format!("Host does not exist: \"{name}\""))),
        }
    }

    fn start(&self, name: &str) -> Result<(), AttemptError> {
        self.run(["start", name]).map(|_| ())
    }

    fn state(&self, name: &str) -> Result<InstanceState, AttemptError> {
        self.run(["status", name])
            .map(|output| InstanceState::parse(output.text()))
    }

    fn address(&self, name: &str) -> Result<String, AttemptError> {
        let output = self.run(["ip", name])?;
        let address = output.text();
        if address.is_empty() {
            return Err(AttemptError::transient(format!("docker-machine reported no address for {name}")));
        }
        Ok(address.to_string())
    }

    fn terminate(&self, name: &str) -> Result<(), AttemptError> {
        self.run(["rm", "-f", "-y", name]).map(|_| ())
    }

    fn release_credentials(&self, name: &str) -> Result<(), AttemptError> {
        let machine_dir = self.settings.storage_path.join("machines").join(name);
        match fs::remove_dir_all(&machine_dir) {
            Ok(()) => {
                debug!(node = name, path = %machine_dir.display(), "removed machine credentials");
                Ok(())
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(AttemptError::transient(format!(
                "could not remove {}: {error}",
                machine_dir.display()
            ))),
        }
    }
}

impl<R: CommandRunner> RemoteExec for DockerMachine<R> {
    fn exec(&self, name: &str, command: &str) -> Result<String, AttemptError> {
        let output = self.run(["ssh", name, "--", command])?;
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::VecDeque, path::PathBuf};

    use super::*;

    /// Replays canned results and records every command it was given.
    #[derive(Default)]
    struct ScriptedRunner {
        replies: RefCell<VecDeque<Result<ShellOutput, ShellError>>>,
        seen: RefCell<Vec<ShellCommand>>,
    }

    impl ScriptedRunner {
        fn reply(self, stdout: &str) -> Self {
            self.replies.borrow_mut().push_back(Ok(ShellOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }));
            self
        }

        fn fail(self, stderr: &str) -> Self {
            self.replies.borrow_mut().push_back(Err(ShellError::Exit {
                command: "docker-machine".into(),
                code: Some(1),
                stdout: String::new(),
                stderr: stderr.to_string(),
            }));
            self
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, command: &ShellCommand) -> Result<ShellOutput, ShellError> {
            self.seen.borrow_mut().push(command.clone());
            self.replies.borrow_mut().pop_front().unwrap_or_else(|| {
                Ok(ShellOutput {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            })
        }
    }

    fn machine(runner: ScriptedRunner, storage: PathBuf) -> DockerMachine<ScriptedRunner> {
        let settings = DockerMachineSettings {
            bin: "docker-machine".into(),
            storage_path: storage,
        };
        let env = vec![("AMAZONEC2_REGION".to_string(), "us-west-2".to_string())];
        DockerMachine::with_runner(settings, env, runner)
    }

    #[test]
    fn missing_host_is_absent_not_an_error() {
        let dm = machine(ScriptedRunner::default().fail("Host does not exist: \"x\""), "/tmp/dm".into());
        assert_eq!(dm.find("x").unwrap(), None);

        let seen = dm.runner().seen.borrow();
        let args = &seen[0].args;
        assert_eq!(args, &["-s", "/tmp/dm", "status", "x"]);
    }

    #[test]
    fn status_output_is_parsed_into_state() {
        let dm = machine(ScriptedRunner::default().reply("Stopped\n"), "/tmp/dm".into());
        let record = dm.find("node").unwrap().unwrap();
        assert_eq!(record.state, InstanceState::Stopped);
    }

    #[test]
    fn create_passes_tags_and_security_group_with_driver_env() {
        let dm = machine(ScriptedRunner::default(), "/tmp/dm".into());
        let spec = InstanceSpec {
            security_group: "ci-sg".into(),
            tags: IndexMap::from([("owner".to_string(), "ci".to_string())]),
            ..InstanceSpec::default()
        };
        let record = dm.create("node", &spec).unwrap();
        assert!(record.tagged);

        let seen = dm.runner().seen.borrow();
        let command = &seen[0];
        assert!(command.args.windows(2).any(|pair| pair == ["--amazonec2-security-group", "ci-sg"]));
        assert!(command.args.windows(2).any(|pair| pair == ["--amazonec2-tags", "owner,ci"]));
        assert_eq!(command.args.last().map(String::as_str), Some("node"));
        assert!(command.envs.iter().any(|(key, _)| key == "AMAZONEC2_REGION"));
    }

    #[test]
    fn quota_errors_are_fatal() {
        let dm = machine(
            ScriptedRunner::default().fail("Error creating machine: InstanceLimitExceeded"),
            "/tmp/dm".into(),
        );
        let error = dm.create("node", &InstanceSpec::default()).unwrap_err();
        assert_eq!(error.kind, FailureKind::Fatal);
    }

    #[test]
    fn network_errors_are_transient() {
        let dm = machine(ScriptedRunner::default().fail("ssh: handshake failed: EOF"), "/tmp/dm".into());
        let error = dm.exec("node", "true").unwrap_err();
        assert_eq!(error.kind, FailureKind::Transient);
    }

    #[test]
    fn release_credentials_removes_the_machine_directory_once() {
        let storage = tempfile::tempdir().unwrap();
        let machine_dir = storage.path().join("machines").join("node");
        fs::create_dir_all(&machine_dir).unwrap();
        fs::write(machine_dir.join("id_rsa"), "key").unwrap();

        let dm = machine(ScriptedRunner::default(), storage.path().to_path_buf());
        dm.release_credentials("node").unwrap();
        assert!(!machine_dir.exists());
        dm.release_credentials("node").unwrap();
    }

    #[test]
    fn ssh_runs_the_remote_command_after_a_separator() {
        let dm = machine(ScriptedRunner::default().reply("ok\n"), "/tmp/dm".into());
        let output = dm.exec("node", "sudo docker ps").unwrap();
        assert_eq!(output, "ok\n");
        let seen = dm.runner().seen.borrow();
        let args = &seen[0].args;
        assert_eq!(&args[2..], &["ssh", "node", "--", "sudo docker ps"]);
    }
}
