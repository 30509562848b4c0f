//! `dmsetup` backend

use tracing::debug;

use crate::error::{ControlError, ControlErrorKind};
use crate::process::{CommandSpec, ProcessRunner, SystemRunner};
use crate::table::Table;

use super::ControlPlane;

/// Drives the `dmsetup` tool
///
/// Tables are passed on stdin. Device nodes live under `/dev/mapper`.
#[derive(Debug, Clone)]
pub struct DmSetup<R = SystemRunner> {
    runner: R,
    program: String,
    dev_dir: String,
}

impl DmSetup<SystemRunner> {
    pub fn new() -> Self {
        Self::with_runner(SystemRunner)
    }
}

impl Default for DmSetup<SystemRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: ProcessRunner> DmSetup<R> {
    pub fn with_runner(runner: R) -> Self {
        Self {
            runner,
            program: "dmsetup".to_string(),
            dev_dir: "/dev/mapper".to_string(),
        }
    }

    /// Path of the dmsetup binary
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Directory holding device nodes
    pub fn dev_dir(mut self, dir: impl Into<String>) -> Self {
        self.dev_dir = dir.into();
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn run(&self, command: CommandSpec, failure: ControlErrorKind) -> Result<String, ControlError> {
        debug!(command = %command, "dmsetup");
        let output = self
            .runner
            .run(&command)
            .map_err(|e| ControlError::failed(e.to_string()))?;

        if output.success {
            return Ok(output.stdout);
        }

        let stderr = output.stderr.trim().to_string();
        Err(ControlError::new(classify(&stderr, failure), stderr))
    }

    fn command(&self, op: &str, name: &str) -> CommandSpec {
        CommandSpec::new(self.program.clone()).args([op, name])
    }
}

fn classify(stderr: &str, default: ControlErrorKind) -> ControlErrorKind {
    if stderr.contains("No such device") || stderr.contains("not found") {
        ControlErrorKind::NotFound
    } else if stderr.contains("Device or resource busy") {
        ControlErrorKind::Failed
    } else {
        default
    }
}

fn table_input(table: &Table) -> String {
    let mut input = table.to_string();
    input.push('\n');
    input
}

impl<R: ProcessRunner> ControlPlane for DmSetup<R> {
    fn create(&self, name: &str, table: &Table) -> Result<String, ControlError> {
        let command = self.command("create", name).stdin(table_input(table));
        self.run(command, ControlErrorKind::Rejected)?;
        Ok(format!("{}/{}", self.dev_dir, name))
    }

    fn remove(&self, name: &str) -> Result<(), ControlError> {
        self.run(self.command("remove", name), ControlErrorKind::Failed)
            .map(drop)
    }

    fn suspend(&self, name: &str) -> Result<(), ControlError> {
        self.run(self.command("suspend", name), ControlErrorKind::Failed)
            .map(drop)
    }

    fn resume(&self, name: &str) -> Result<(), ControlError> {
        self.run(self.command("resume", name), ControlErrorKind::Failed)
            .map(drop)
    }

    fn load(&self, name: &str, table: &Table) -> Result<(), ControlError> {
        let command = self.command("load", name).stdin(table_input(table));
        self.run(command, ControlErrorKind::Rejected).map(drop)
    }

    fn status(&self, name: &str) -> Result<String, ControlError> {
        let out = self.run(self.command("status", name), ControlErrorKind::Failed)?;
        Ok(out.trim_end().to_string())
    }

    fn message(&self, name: &str, sector: u64, message: &str) -> Result<String, ControlError> {
        let command = self
            .command("message", name)
            .arg(sector.to_string())
            .args(message.split_whitespace());
        let out = self.run(command, ControlErrorKind::Rejected)?;
        Ok(out.trim_end().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;
    use crate::process::ProcessOutput;
    use crate::table::{LinearTarget, Target};
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct Scripted {
        seen: Mutex<Vec<CommandSpec>>,
        replies: Mutex<Vec<ProcessOutput>>,
    }

    impl ProcessRunner for Scripted {
        fn run(&self, command: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
            self.seen.lock().push(command.clone());
            let mut replies = self.replies.lock();
            Ok(if replies.is_empty() {
                ProcessOutput::ok("")
            } else {
                replies.remove(0)
            })
        }
    }

    fn linear() -> Table {
        Table::new(Target::from_params(100, &LinearTarget::new("/dev/sdb", 0)).unwrap())
    }

    #[test]
    fn test_create_passes_table_on_stdin() {
        let dm = DmSetup::with_runner(Scripted::default());
        let path = dm.create("test-md", &linear()).unwrap();
        assert_eq!(path, "/dev/mapper/test-md");

        let seen = dm.runner().seen.lock();
        assert_eq!(seen[0].to_string(), "dmsetup create test-md");
        assert_eq!(seen[0].stdin.as_deref(), Some("0 100 linear /dev/sdb 0\n"));
    }

    #[test]
    fn test_message_arguments() {
        let dm = DmSetup::with_runner(Scripted::default()).program("/sbin/dmsetup");
        dm.message("clone", 0, "hydration_threshold 256").unwrap();
        let seen = dm.runner().seen.lock();
        assert_eq!(
            seen[0].to_string(),
            "/sbin/dmsetup message clone 0 hydration_threshold 256"
        );
    }

    #[test]
    fn test_error_classification() {
        let runner = Scripted::default();
        runner.replies.lock().extend([
            ProcessOutput::failed(1, "device-mapper: reload ioctl on clone failed: Invalid argument"),
            ProcessOutput::failed(1, "Device clone not found"),
            ProcessOutput::failed(1, "device-mapper: remove ioctl failed: Device or resource busy"),
        ]);
        let dm = DmSetup::with_runner(runner);

        assert_eq!(
            dm.create("clone", &linear()).unwrap_err().kind,
            ControlErrorKind::Rejected
        );
        assert_eq!(
            dm.status("clone").unwrap_err().kind,
            ControlErrorKind::NotFound
        );
        assert_eq!(
            dm.remove("clone").unwrap_err().kind,
            ControlErrorKind::Failed
        );
    }

    #[test]
    fn test_status_trimmed() {
        let runner = Scripted::default();
        runner
            .replies
            .lock()
            .push(ProcessOutput::ok("0 8 clone 8 1/2 8 0/1 0 0 0 rw\n"));
        let dm = DmSetup::with_runner(runner);
        assert_eq!(dm.status("c").unwrap(), "0 8 clone 8 1/2 8 0/1 0 0 0 rw");
    }
}
