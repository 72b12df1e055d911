//! Console events reported around the execution of a child process.

use std::path::Path;
use std::process::{Command, ExitStatus};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tally_dispatch::{Router, RouterError};
use tally_log::LogError;
use tally_protocol::{Event, Getter, Val};
use tally_statsd::MetricsTransport;

/// Dispatched before the command starts.
pub const COMMAND_EVENT: &str = "console.command";
/// Dispatched after the command exited.
pub const TERMINATE_EVENT: &str = "console.terminate";
/// Dispatched when the command could not be started or exited unsuccessfully.
pub const EXCEPTION_EVENT: &str = "console.exception";

/// An event describing a console command.
///
/// Exposes the paths `command`, `program`, `start_time` (seconds since the UNIX epoch),
/// `timing` (elapsed milliseconds), `exit_code` and `error`. Fields that are not known yet, such
/// as the timing of a command that has not finished, resolve to nothing.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsoleEvent {
    name: &'static str,
    command: String,
    program: String,
    start_time: f64,
    timing: Option<f64>,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl ConsoleEvent {
    fn new(name: &'static str, command: &[String], start_time: f64) -> Self {
        let program = command
            .first()
            .map(|program| {
                Path::new(program)
                    .file_name()
                    .map_or_else(|| program.clone(), |f| f.to_string_lossy().into_owned())
            })
            .unwrap_or_default();

        Self {
            name,
            command: command.join(" "),
            program,
            start_time,
            timing: None,
            exit_code: None,
            error: None,
        }
    }

    fn finished(&self, name: &'static str, started: Instant) -> Self {
        Self {
            name,
            timing: Some(started.elapsed().as_secs_f64() * 1000.0),
            ..self.clone()
        }
    }

    fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

impl Getter for ConsoleEvent {
    fn get_value(&self, path: &str) -> Option<Val<'_>> {
        Some(match path {
            "command" => self.command.as_str().into(),
            "program" => self.program.as_str().into(),
            "start_time" => self.start_time.into(),
            "timing" => self.timing?.into(),
            "exit_code" => self.exit_code?.into(),
            "error" => self.error.as_deref()?.into(),
            _ => return None,
        })
    }
}

impl Event for ConsoleEvent {
    fn name(&self) -> &str {
        self.name
    }

    fn type_name(&self) -> &'static str {
        "ConsoleEvent"
    }
}

fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(unix)]
fn signal(status: &ExitStatus) -> Option<i32> {
    std::os::unix::process::ExitStatusExt::signal(status)
}

#[cfg(not(unix))]
fn signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Returns the exit code of a process, following the shell convention for signals.
fn exit_code(status: &ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| signal(status).map(|signal| 128 + signal))
        .unwrap_or(1)
}

fn log_errors(result: Result<(), RouterError>) {
    if let Err(error) = result {
        for client in &error.errors {
            tally_log::error!("{}", LogError(client));
        }
    }
}

/// Dispatches console events to a router unless they are disabled.
struct ConsoleReporter<'a, T> {
    router: &'a mut Router<T>,
    enabled: bool,
}

impl<T: MetricsTransport> ConsoleReporter<'_, T> {
    fn report(&mut self, event: &ConsoleEvent) {
        if self.enabled {
            tally_log::trace!("dispatching {}", event.name);
            log_errors(self.router.handle_event(event));
        }
    }

    fn flush(&mut self) {
        log_errors(self.router.flush());
    }
}

/// Runs a command to completion and reports its console events.
///
/// Metric failures are logged and never affect the command. All clients are flushed once the
/// command finished. Returns the exit code of the command.
pub fn execute<T: MetricsTransport>(
    router: &mut Router<T>,
    command: &[String],
    console_events: bool,
) -> Result<i32> {
    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("no program to run");
    };

    let mut reporter = ConsoleReporter {
        router,
        enabled: console_events,
    };

    let started = Instant::now();
    let event = ConsoleEvent::new(COMMAND_EVENT, command, unix_time());
    reporter.report(&event);

    tally_log::debug!("running {}", event.command);
    let status = match Command::new(program).args(args).status() {
        Ok(status) => status,
        Err(error) => {
            reporter.report(&event.finished(EXCEPTION_EVENT, started).with_error(&error));
            reporter.flush();
            return Err(error).with_context(|| format!("failed to run {program}"));
        }
    };

    let exit_code = exit_code(&status);
    if !status.success() {
        let exception = event
            .finished(EXCEPTION_EVENT, started)
            .with_exit_code(exit_code)
            .with_error(status);
        reporter.report(&exception);
    }

    let terminate = event
        .finished(TERMINATE_EVENT, started)
        .with_exit_code(exit_code);
    reporter.report(&terminate);
    reporter.flush();

    tally_log::debug!("{} exited with {exit_code}", event.command);
    Ok(exit_code)
}
