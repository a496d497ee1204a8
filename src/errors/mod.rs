//! Structured spawn error reporting.
//!
//! A failed spawn is always materialized before propagation: the failing
//! participant writes category/summary/HTML artifacts into the work dir, and
//! the supervisor merges them with its own journey into a [`SpawnError`]
//! carrying everything an operator needs for a post-mortem.

pub mod renderer;

use crate::config::SpawnConfig;
use crate::journey::Journey;
use crate::types::SpawnKitError;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Coarse classification of what went wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A system call failed.
    OperatingSystemError,
    /// A pipe or stream broke, or returned EOF where data was expected.
    IoError,
    /// The overall spawn deadline expired.
    TimeoutError,
    /// A contract violation inside the spawning kit or one of its helpers.
    InternalError,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::OperatingSystemError => "OPERATING_SYSTEM_ERROR",
            ErrorCategory::IoError => "IO_ERROR",
            ErrorCategory::TimeoutError => "TIMEOUT_ERROR",
            ErrorCategory::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Infer a category for a failure that did not materialize an
    /// `error/category` artifact: IO-family errors map to IO, syscall-family
    /// to operating system, timeouts stay first-class, everything else is
    /// internal.
    pub fn infer_from(err: &SpawnKitError) -> ErrorCategory {
        match err {
            SpawnKitError::Io(_) => ErrorCategory::IoError,
            SpawnKitError::Syscall(_) | SpawnKitError::Process(_) => {
                ErrorCategory::OperatingSystemError
            }
            SpawnKitError::Timeout(_) => ErrorCategory::TimeoutError,
            SpawnKitError::Config(_)
            | SpawnKitError::Journey(_)
            | SpawnKitError::Protocol(_) => ErrorCategory::InternalError,
        }
    }

    fn default_summary(self) -> &'static str {
        match self {
            ErrorCategory::OperatingSystemError => {
                "An operating system error occurred while spawning an application process"
            }
            ErrorCategory::IoError => {
                "An I/O error occurred while spawning an application process"
            }
            ErrorCategory::TimeoutError => {
                "A timeout occurred while spawning an application process"
            }
            ErrorCategory::InternalError => {
                "An internal error occurred while spawning an application process"
            }
        }
    }
}

impl FromStr for ErrorCategory {
    type Err = SpawnKitError;

    fn from_str(value: &str) -> Result<Self, SpawnKitError> {
        match value {
            "OPERATING_SYSTEM_ERROR" => Ok(ErrorCategory::OperatingSystemError),
            "IO_ERROR" => Ok(ErrorCategory::IoError),
            "TIMEOUT_ERROR" => Ok(ErrorCategory::TimeoutError),
            "INTERNAL_ERROR" => Ok(ErrorCategory::InternalError),
            other => Err(SpawnKitError::Protocol(format!(
                "Unknown error category '{}'",
                other
            ))),
        }
    }
}

/// Escape a string for embedding into HTML text content.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Environment snapshot harvested from the work dir's `envdump/` tree.
#[derive(Clone, Debug, Default)]
pub struct EnvDump {
    pub envvars: Option<String>,
    pub user_info: Option<String>,
    pub ulimits: Option<String>,
}

/// A fully materialized spawn failure.
///
/// Built incrementally by whichever supervisor-side component detects the
/// failure, then finalized before propagation so that summary and HTML
/// descriptions are always present.
#[derive(Clone, Debug)]
pub struct SpawnError {
    category: ErrorCategory,
    summary: String,
    advanced_problem_details: String,
    problem_description_html: Option<String>,
    solution_description_html: Option<String>,
    stdout_and_err_data: String,
    annotations: BTreeMap<String, String>,
    journey: Journey,
    env_dump: EnvDump,
    app_root: String,
    app_type: String,
    app_env: String,
    integration_mode: String,
}

impl SpawnError {
    pub fn new(category: ErrorCategory, journey: Journey, config: &SpawnConfig) -> SpawnError {
        SpawnError {
            category,
            summary: String::new(),
            advanced_problem_details: String::new(),
            problem_description_html: None,
            solution_description_html: None,
            stdout_and_err_data: String::new(),
            annotations: BTreeMap::new(),
            journey,
            env_dump: EnvDump::default(),
            app_root: config.app_root.clone(),
            app_type: config.app_type.clone(),
            app_env: config.app_env.clone(),
            integration_mode: config.integration_mode.clone(),
        }
    }

    /// Wrap an infrastructure error, inferring the category and using the
    /// error text as summary.
    pub fn from_kit_error(
        err: &SpawnKitError,
        journey: Journey,
        config: &SpawnConfig,
    ) -> SpawnError {
        let mut spawn_error = SpawnError::new(ErrorCategory::infer_from(err), journey, config);
        spawn_error.summary = err.to_string();
        spawn_error.advanced_problem_details = err.to_string();
        spawn_error
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn advanced_problem_details(&self) -> &str {
        &self.advanced_problem_details
    }

    pub fn journey(&self) -> &Journey {
        &self.journey
    }

    pub fn journey_mut(&mut self) -> &mut Journey {
        &mut self.journey
    }

    pub fn stdout_and_err_data(&self) -> &str {
        &self.stdout_and_err_data
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    pub fn app_root(&self) -> &str {
        &self.app_root
    }

    pub fn problem_description_html(&self) -> &str {
        self.problem_description_html.as_deref().unwrap_or("")
    }

    pub fn solution_description_html(&self) -> &str {
        self.solution_description_html.as_deref().unwrap_or("")
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) {
        self.summary = summary.into();
    }

    pub fn set_advanced_problem_details(&mut self, details: impl Into<String>) {
        self.advanced_problem_details = details.into();
    }

    pub fn set_problem_description_html(&mut self, html: impl Into<String>) {
        self.problem_description_html = Some(html.into());
    }

    pub fn set_solution_description_html(&mut self, html: impl Into<String>) {
        self.solution_description_html = Some(html.into());
    }

    pub fn set_stdout_and_err_data(&mut self, data: impl Into<String>) {
        self.stdout_and_err_data = data.into();
    }

    /// Attach a diagnostic annotation. With `overwrite` false an existing
    /// value wins, so caller-provided context never clobbers what a child
    /// process reported.
    pub fn set_annotation(&mut self, key: &str, value: &str, overwrite: bool) {
        if overwrite || !self.annotations.contains_key(key) {
            self.annotations.insert(key.to_string(), value.to_string());
        }
    }

    /// Load the `envdump/` snapshot files from a work dir for the
    /// diagnostics sections of the rendered report.
    pub fn load_env_dump(&mut self, envdump_dir: &Path) {
        self.env_dump.envvars = read_trimmed(&envdump_dir.join("envvars"));
        self.env_dump.user_info = read_trimmed(&envdump_dir.join("user_info"));
        self.env_dump.ulimits = read_trimmed(&envdump_dir.join("ulimits"));
        for (key, value) in load_annotations_from_dir(&envdump_dir.join("annotations")) {
            self.set_annotation(&key, &value, true);
        }
    }

    /// Fill in anything still missing so the error is presentable:
    /// a category-derived summary, problem HTML derived from the summary,
    /// and a generic solution description.
    pub fn finalize(mut self) -> SpawnError {
        if self.summary.is_empty() {
            self.summary = self.category.default_summary().to_string();
        }
        if self.advanced_problem_details.is_empty() {
            self.advanced_problem_details = self.summary.clone();
        }
        if self.problem_description_html.is_none() {
            self.problem_description_html = Some(format!(
                "<p>The application server tried to start the web application, \
                 but encountered an error:</p>\n<pre>{}</pre>",
                escape_html(&self.summary)
            ));
        }
        if self.solution_description_html.is_none() {
            self.solution_description_html = Some(
                "<p class=\"sole-solution\">Please study the error message and the \
                 diagnostics reports to find out what went wrong, then fix the \
                 underlying problem and restart the application.</p>"
                    .to_string(),
            );
        }
        self
    }

    pub fn inspect_basic_info_as_json(&self) -> Value {
        json!({
            "category": self.category.as_str(),
            "summary": self.summary,
            "advanced_problem_details": self.advanced_problem_details,
            "problem_description_html": self.problem_description_html(),
            "solution_description_html": self.solution_description_html(),
        })
    }

    pub fn inspect_system_wide_details_as_json(&self) -> Value {
        json!({
            "operating_system": std::env::consts::OS,
            "architecture": std::env::consts::ARCH,
        })
    }

    pub fn inspect_parent_process_details_as_json(&self) -> Value {
        json!({
            "pid": std::process::id(),
            "app_root": self.app_root,
            "app_type": self.app_type,
            "app_env": self.app_env,
            "integration_mode": self.integration_mode,
        })
    }

    pub fn inspect_preloader_process_details_as_json(&self) -> Value {
        json!({
            "annotations": self.annotations,
        })
    }

    pub fn inspect_subprocess_details_as_json(&self) -> Value {
        json!({
            "envvars": self.env_dump.envvars,
            "user_info": self.env_dump.user_info,
            "ulimits": self.env_dump.ulimits,
            "stdout_and_err": self.stdout_and_err_data,
        })
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary)
    }
}

impl std::error::Error for SpawnError {}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim_end().to_string())
}

/// Read every non-hidden file in an annotations directory into a map.
pub fn load_annotations_from_dir(dir: &Path) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return result,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) if !name.starts_with('.') => name.to_string(),
            _ => continue,
        };
        if let Some(value) = read_trimmed(&entry.path()) {
            result.insert(name, value);
        }
    }
    result
}
