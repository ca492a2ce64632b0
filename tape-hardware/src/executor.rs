// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running external commands with a hard wall-clock deadline.
//!
//! Every physical action on a tape library is an external process (`mtx`,
//! `mt`, `dd`).  The [`Executor`] trait is the seam between the command
//! wrappers and the operating system: in production it is a
//! [`HostExecutor`], under test a [`FakeExecutor`].

use crate::error::ExecutionError;

use async_trait::async_trait;
use itertools::Itertools;
use slog::{debug, error, info, Logger};
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Output};
use std::str::from_utf8;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A program and its arguments, as observed by an executor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Input {
    pub program: String,
    pub args: Vec<String>,
}

impl Input {
    pub fn new<P: AsRef<str>, S: AsRef<str>>(program: P, args: Vec<S>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: args.into_iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    /// Short-hand for a whitespace-separated command line.
    pub fn shell<S: AsRef<str>>(input: S) -> Self {
        let mut words = input.as_ref().split_whitespace();
        let program = words.next().unwrap_or_default();
        Self::new(program, words.collect())
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

impl From<&Command> for Input {
    fn from(command: &Command) -> Self {
        Self {
            program: command.get_program().to_string_lossy().to_string(),
            args: command
                .get_args()
                .map(|s| s.to_string_lossy().to_string())
                .collect(),
        }
    }
}

/// Convenience constructors for canned process output.
pub trait OutputExt: Sized {
    fn success() -> Self;
    fn failure() -> Self;
    /// Output of a process that exited with `code`.
    fn exited(code: i32) -> Self;
    /// Output of a process killed by `signal`, which has no exit code.
    fn killed(signal: i32) -> Self;
    fn set_stdout<S: AsRef<str>>(self, stdout: S) -> Self;
    fn set_stderr<S: AsRef<str>>(self, stderr: S) -> Self;
}

impl OutputExt for Output {
    fn success() -> Self {
        Self::exited(0)
    }

    fn failure() -> Self {
        Self::exited(1)
    }

    fn exited(code: i32) -> Self {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: vec![],
            stderr: vec![],
        }
    }

    fn killed(signal: i32) -> Self {
        Output {
            status: ExitStatus::from_raw(signal & 0x7f),
            stdout: vec![],
            stderr: vec![],
        }
    }

    fn set_stdout<S: AsRef<str>>(mut self, stdout: S) -> Self {
        self.stdout = stdout.as_ref().as_bytes().to_vec();
        self
    }

    fn set_stderr<S: AsRef<str>>(mut self, stderr: S) -> Self {
        self.stderr = stderr.as_ref().as_bytes().to_vec();
        self
    }
}

fn to_space_separated_string<T, I>(iter: T) -> String
where
    T: IntoIterator<Item = I>,
    I: std::fmt::Debug,
{
    Itertools::intersperse(
        iter.into_iter().map(|arg| format!("{arg:?}")),
        " ".into(),
    )
    .collect::<String>()
}

fn log_input(log: &Logger, id: u64, command: &Command) {
    info!(
        log,
        "running command via executor"; "id" => id, "command" => %Input::from(command)
    );
    debug!(
        log,
        "running command via executor"; "id" => id, "envs" => %to_space_separated_string(command.get_envs())
    );
}

fn log_output(log: &Logger, id: u64, output: &Output) {
    info!(
        log,
        "finished running command via executor";
        "id" => id,
        "result" => if output.status.success() { "OK" } else { "ERROR" },
        "status" => output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    if !output.stdout.is_empty() {
        debug!(
            log,
            "finished command stdout";
            "id" => id,
            "stdout" => from_utf8(&output.stdout).unwrap_or("<Not valid UTF-8>"),
        );
    }
    if !output.stderr.is_empty() {
        debug!(
            log,
            "finished command stderr";
            "id" => id,
            "stderr" => from_utf8(&output.stderr).unwrap_or("<Not valid UTF-8>"),
        );
    }
}

/// Describes the commonly-used "safe-to-reference" type describing the
/// Executor as a trait object.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Describes an "executor", which can run commands and return a response.
///
/// A command that runs to completion is never an error, whatever its exit
/// status: interpreting the status is up to the caller.  Errors are reserved
/// for commands that could not be started or did not finish in time.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executes a task, waiting at most `timeout` for it to complete.
    async fn execute(
        &self,
        command: &mut tokio::process::Command,
        timeout: Duration,
    ) -> Result<Output, ExecutionError>;
}

/// Handler called to produce the output of a faked command.
pub type WaitFn = dyn FnMut(Input) -> Output + Send + Sync;
pub type BoxedWaitFn = Box<WaitFn>;

/// An executor which can expect certain inputs, and respond with specific outputs.
pub struct FakeExecutor {
    log: Logger,
    counter: AtomicU64,
    wait_handler: Mutex<BoxedWaitFn>,
}

impl FakeExecutor {
    pub fn new(log: Logger) -> Arc<FakeExecutor> {
        Arc::new(Self {
            log,
            counter: AtomicU64::new(0),
            wait_handler: Mutex::new(Box::new(|_input| Output::success())),
        })
    }

    /// Set the request handler to an arbitrary function.
    pub fn set_wait_handler(&self, f: BoxedWaitFn) {
        *self.wait_handler.lock().unwrap() = f;
    }

    /// Perform some type coercion to access a commonly-used trait object.
    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    // The handler runs synchronously; the caller controls what it returns.
    async fn execute(
        &self,
        command: &mut tokio::process::Command,
        _timeout: Duration,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let command = command.as_std();
        log_input(&self.log, id, command);
        let output = self.wait_handler.lock().unwrap()(Input::from(command));
        log_output(&self.log, id, &output);
        Ok(output)
    }
}

pub struct HostExecutor {
    log: slog::Logger,
    counter: std::sync::atomic::AtomicU64,
}

impl HostExecutor {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self { log, counter: AtomicU64::new(0) })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }

    fn prepare(&self, command: &Command) -> u64 {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, command);
        id
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute(
        &self,
        command: &mut tokio::process::Command,
        timeout: Duration,
    ) -> Result<Output, ExecutionError> {
        let id = self.prepare(command.as_std());
        // Dropping the output future on timeout must take the child with it.
        command.kill_on_drop(true);
        let output = match tokio::time::timeout(timeout, command.output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                error!(self.log, "Could not start program asynchronously!"; "id" => id);
                return Err(ExecutionError::ExecutionStart {
                    command: Input::from(command.as_std()).to_string(),
                    err,
                });
            }
            Err(_) => {
                error!(
                    self.log,
                    "command timed out";
                    "id" => id,
                    "timeout" => ?timeout,
                );
                return Err(ExecutionError::Timeout {
                    command: Input::from(command.as_std()).to_string(),
                    timeout,
                });
            }
        };
        log_output(&self.log, id, &output);
        Ok(output)
    }
}

type DynamicHandler = Box<dyn FnMut(Input) -> Output + Send + Sync>;

enum HandledCommand {
    Static { input: Input, output: Output },
    Dynamic { handler: DynamicHandler },
}

/// A handler that may be used for setting inputs/outputs to the executor
/// when these commands are known ahead-of-time.
///
/// See: [Self::register] for integration with a [FakeExecutor].
pub struct StaticHandler {
    expected: Vec<HandledCommand>,
    index: usize,
}

impl StaticHandler {
    pub fn new() -> Self {
        Self { expected: Vec::new(), index: 0 }
    }

    /// Convenience function to register the handler with a [FakeExecutor].
    pub fn register(mut self, executor: &FakeExecutor) {
        executor.set_wait_handler(Box::new(move |input| -> Output {
            self.execute(input)
        }));
    }

    /// Expects a static "input" to exactly produce some "output".
    pub fn expect(&mut self, input: Input, output: Output) {
        self.expected.push(HandledCommand::Static { input, output });
    }

    /// A helper for [Self::expect] which quietly succeeds.
    pub fn expect_ok<S: AsRef<str>>(&mut self, input: S) {
        self.expect(Input::shell(input), Output::success())
    }

    /// A helper for [Self::expect] which quietly fails.
    pub fn expect_fail<S: AsRef<str>>(&mut self, input: S) {
        self.expect(Input::shell(input), Output::failure())
    }

    /// Expects a dynamic handler to be invoked to dynamically
    /// determine the output of this call.
    pub fn expect_dynamic(&mut self, handler: DynamicHandler) {
        self.expected.push(HandledCommand::Dynamic { handler });
    }

    fn execute(&mut self, observed_input: Input) -> Output {
        let expected = &mut self
            .expected
            .get_mut(self.index)
            .unwrap_or_else(|| panic!("Unexpected command: {observed_input}"));
        self.index += 1;

        match expected {
            HandledCommand::Static { input, output } => {
                assert_eq!(&observed_input, input, "Unexpected input command");
                output.clone()
            }
            HandledCommand::Dynamic { ref mut handler } => {
                handler(observed_input)
            }
        }
    }
}

impl Default for StaticHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StaticHandler {
    fn drop(&mut self) {
        let expected = self.expected.len();
        let actual = self.index;
        if actual < expected {
            let next = &self.expected[actual];
            let tip = match next {
                HandledCommand::Static { input, .. } => input.to_string(),
                HandledCommand::Dynamic { .. } => {
                    "<dynamic handler>".to_string()
                }
            };
            let errmsg = format!("Only saw {actual} calls, expected {expected}\nNext would have been: {tip}");
            if !std::thread::panicking() {
                panic!("{errmsg}");
            } else {
                eprintln!("{errmsg}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use tape_test_utils::dev::test_setup_log;

    #[tokio::test]
    async fn test_host_executor_nonzero_exit_is_not_an_error() {
        let logctx =
            test_setup_log("test_host_executor_nonzero_exit_is_not_an_error");
        let executor = HostExecutor::new(logctx.log.clone()).as_executor();

        let mut command = tokio::process::Command::new("sh");
        command.args(["-c", "echo out; echo err >&2; exit 3"]);
        let output =
            executor.execute(&mut command, Duration::from_secs(10)).await.unwrap();
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_host_executor_timeout() {
        let logctx = test_setup_log("test_host_executor_timeout");
        let executor = HostExecutor::new(logctx.log.clone()).as_executor();

        let mut command = tokio::process::Command::new("sleep");
        command.arg("30");
        let start = std::time::Instant::now();
        let error = executor
            .execute(&mut command, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_matches!(error, ExecutionError::Timeout { .. });
        assert!(start.elapsed() < Duration::from_secs(10));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_host_executor_cannot_start() {
        let logctx = test_setup_log("test_host_executor_cannot_start");
        let executor = HostExecutor::new(logctx.log.clone()).as_executor();

        let mut command =
            tokio::process::Command::new("/nonexistent/tape-tool");
        let error = executor
            .execute(&mut command, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_matches!(error, ExecutionError::ExecutionStart { .. });

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_static_handler() {
        let logctx = test_setup_log("test_static_handler");
        let executor = FakeExecutor::new(logctx.log.clone());
        let mut handler = StaticHandler::new();
        handler.expect_ok("mt -f /dev/nst0 rewind");
        handler.expect(
            Input::shell("mt -f /dev/nst0 status"),
            Output::exited(2).set_stderr("No medium found"),
        );
        handler.register(&executor);
        let executor = executor.as_executor();

        let mut command = tokio::process::Command::new("mt");
        command.args(["-f", "/dev/nst0", "rewind"]);
        let output =
            executor.execute(&mut command, Duration::from_secs(1)).await.unwrap();
        assert!(output.status.success());

        let mut command = tokio::process::Command::new("mt");
        command.args(["-f", "/dev/nst0", "status"]);
        let output =
            executor.execute(&mut command, Duration::from_secs(1)).await.unwrap();
        assert_eq!(output.status.code(), Some(2));
        assert_eq!(output.stderr, b"No medium found");

        logctx.cleanup_successful();
    }
}
