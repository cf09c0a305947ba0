//! `puppet apply` of a manifest against a freshly prepared module path.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use corral_util::{CommandRunner, ShellCommand, ShellError, ShellOutput, SystemRunner};
use tracing::{debug, info};

use crate::CorralError;

pub const DEFAULT_WORK_DIR: &str = "/tmp/puppet";
pub const DEFAULT_SOURCE_DIR: &str = "lib/puppet";

/// `puppet apply --detailed-exitcodes` reports 2 when changes were applied.
const CHANGES_APPLIED: i32 = 2;

pub struct PuppetApply<R = SystemRunner> {
    runner: R,
    /// Scratch directory rebuilt before every apply.
    work_dir: PathBuf,
    /// Holds an optional `Puppetfile` and local module directories.
    source_dir: PathBuf,
    debug: bool,
}

impl PuppetApply<SystemRunner> {
    pub fn new(source_dir: impl Into<PathBuf>, debug: bool) -> Self {
        Self::with_runner(SystemRunner, DEFAULT_WORK_DIR, source_dir, debug)
    }
}

impl<R: CommandRunner> PuppetApply<R> {
    pub fn with_runner(runner: R, work_dir: impl Into<PathBuf>, source_dir: impl Into<PathBuf>, debug: bool) -> Self {
        Self {
            runner,
            work_dir: work_dir.into(),
            source_dir: source_dir.into(),
            debug,
        }
    }

    pub fn modulepath(&self) -> PathBuf {
        self.work_dir.join("modules")
    }

    pub fn apply_command(&self, manifest: &Path) -> ShellCommand {
        let mut command = ShellCommand::new("puppet")
            .args(["apply", "--detailed-exitcodes", "--modulepath"])
            .arg(self.modulepath().to_string_lossy())
            .success_code(CHANGES_APPLIED);
        if self.debug {
            command = command.arg("--debug");
        }
        command.arg(manifest.to_string_lossy())
    }

    /// Rebuild the work directory: install `Puppetfile` modules with
    /// librarian-puppet, then copy the local modules next to them.
    pub fn prepare(&self) -> Result<(), CorralError> {
        match fs::remove_dir_all(&self.work_dir) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(io_failure("clear", &self.work_dir, error)),
        }
        let modulepath = self.modulepath();
        fs::create_dir_all(&modulepath).map_err(|error| io_failure("create", &modulepath, error))?;

        let puppetfile = self.source_dir.join("Puppetfile");
        if puppetfile.is_file() {
            let target = self.work_dir.join("Puppetfile");
            fs::copy(&puppetfile, &target).map_err(|error| io_failure("copy", &puppetfile, error))?;
            let install = ShellCommand::new("librarian-puppet")
                .args(["install", "--no-verbose", "--path"])
                .arg(modulepath.to_string_lossy())
                .current_dir(&self.work_dir);
            self.run(&install)?;
        }

        let entries = fs::read_dir(&self.source_dir).map_err(|error| io_failure("read", &self.source_dir, error))?;
        for entry in entries {
            let entry = entry.map_err(|error| io_failure("read", &self.source_dir, error))?;
            let path = entry.path();
            if path.is_dir() {
                let target = modulepath.join(entry.file_name());
                debug!(module = %path.display(), "copying local module");
                copy_dir(&path, &target).map_err(|error| io_failure("copy", &path, error))?;
            }
        }
        Ok(())
    }

    /// Prepare the module path and apply `manifest`.
    pub fn apply(&self, manifest: &Path) -> Result<ShellOutput, CorralError> {
        self.prepare()?;
        let command = self.apply_command(manifest);
        info!(manifest = %manifest.display(), "applying puppet manifest");
        let output = self.run(&command)?;
        if output.exit_code == CHANGES_APPLIED {
            info!(manifest = %manifest.display(), "puppet applied changes");
        }
        Ok(output)
    }

    fn run(&self, command: &ShellCommand) -> Result<ShellOutput, CorralError> {
        self.runner.run(command).map_err(|error: ShellError| CorralError::Command {
            command: command.display(),
            diagnostic: error.diagnostic(),
        })
    }
}

fn io_failure(action: &str, path: &Path, error: io::Error) -> CorralError {
    CorralError::Command {
        command: format!("{action} {}", path.display()),
        diagnostic: error.to_string(),
    }
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
