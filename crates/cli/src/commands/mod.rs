pub mod config;
pub mod doctor;
pub mod migrate;
pub mod sweep;

use greenlight_core::config::{AppConfig, LoadOptions};
use serde::Serialize;

pub(crate) const EXIT_CONFIG: u8 = 2;
pub(crate) const EXIT_RUNTIME: u8 = 3;
pub(crate) const EXIT_DB: u8 = 4;
pub(crate) const EXIT_MIGRATION: u8 = 5;
pub(crate) const EXIT_SWEEP: u8 = 6;

/// Classified failure raised inside a command body. The class feeds the
/// machine-readable `error_class` field; the exit code is stable per class
/// so wrappers can branch on it.
#[derive(Debug)]
pub(crate) struct CommandError {
    class: &'static str,
    message: String,
    exit_code: u8,
}

impl CommandError {
    pub(crate) fn new(class: &'static str, message: impl Into<String>, exit_code: u8) -> Self {
        Self { class, message: message.into(), exit_code }
    }
}

/// What a command hands back to `run`: a JSON line for stdout and the
/// process exit code.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Serialize)]
struct CommandOutcome<'a> {
    command: &'a str,
    status: &'a str,
    error_class: Option<&'a str>,
    message: &'a str,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self { exit_code: 0, output: render(command, "ok", None, &message.into()) }
    }

    pub(crate) fn failure(command: &str, error: CommandError) -> Self {
        Self {
            exit_code: error.exit_code,
            output: render(command, "error", Some(error.class), &error.message),
        }
    }
}

fn render(command: &str, status: &str, error_class: Option<&str>, message: &str) -> String {
    let payload = CommandOutcome { command, status, error_class, message };
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Load and validate configuration, mapping failure straight to the
/// command's error envelope.
pub(crate) fn load_config(command: &str) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            CommandError::new("config_validation", format!("configuration issue: {error}"), EXIT_CONFIG),
        )
    })
}

/// Commands run on a single-threaded runtime; each invocation is one
/// bounded unit of work.
pub(crate) fn build_runtime(command: &str) -> Result<tokio::runtime::Runtime, CommandResult> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            CommandError::new(
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                EXIT_RUNTIME,
            ),
        )
    })
}
