//! Domain layer of the RelayCRM update runner.
//!
//! Holds everything an upgrade package needs that is independent of the
//! database engine: the append-only [`UpdateLogger`] with its error
//! accumulator, the sequential [`Step`] runner, the preflight host check,
//! the terminal [`RunStatus`] gate, version markers, typed field
//! definitions, and the config-file regeneration helpers.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

/// Minimum host execution/input time limit the package requires, in seconds.
pub const MIN_EXECUTION_SECS: u64 = 600;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum UpdateError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("preflight error: {0}")]
    Preflight(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("log error: {0}")]
    Log(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "[INFO]",
            Self::Warning => "[WARNING]",
            Self::Error => "[ERROR]",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "[INFO]" => Some(Self::Info),
            "[WARNING]" => Some(Self::Warning),
            "[ERROR]" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Append-only run log plus the in-memory error accumulator.
///
/// The log store is opened and closed per call, so a crash never loses
/// previously written lines. Any message carrying the `[ERROR]` marker
/// (case-insensitive) is also retained in memory for the failure gate.
pub struct UpdateLogger {
    path: PathBuf,
    errors: Vec<String>,
}

impl UpdateLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `message` and a newline to the log store.
    ///
    /// # Errors
    /// Returns [`UpdateError::Log`] when the log store cannot be opened
    /// or written.
    pub fn log(&mut self, message: &str) -> Result<(), UpdateError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| {
                UpdateError::Log(format!(
                    "failed to open log store {}: {err}",
                    self.path.display()
                ))
            })?;
        writeln!(file, "{message}").map_err(|err| {
            UpdateError::Log(format!(
                "failed to append to log store {}: {err}",
                self.path.display()
            ))
        })?;

        if message.to_lowercase().contains("[error]") {
            self.errors.push(message.to_string());
        }
        Ok(())
    }

    pub fn info(&mut self, message: &str) -> Result<(), UpdateError> {
        self.log(&format!("  {} {message}", LogLevel::Info.as_str()))
    }

    pub fn warning(&mut self, message: &str) -> Result<(), UpdateError> {
        self.log(&format!("  {} {message}", LogLevel::Warning.as_str()))
    }

    pub fn error(&mut self, message: &str) -> Result<(), UpdateError> {
        self.log(&format!("  {} {message}", LogLevel::Error.as_str()))
    }

    #[must_use]
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// One named unit of update work executed in a fixed position within a run.
pub struct Step<'a, C> {
    name: String,
    action: Box<dyn FnOnce(&mut C, &mut UpdateLogger) -> anyhow::Result<()> + 'a>,
}

impl<'a, C> Step<'a, C> {
    pub fn new(
        name: impl Into<String>,
        action: impl FnOnce(&mut C, &mut UpdateLogger) -> anyhow::Result<()> + 'a,
    ) -> Self {
        Self {
            name: name.into(),
            action: Box::new(action),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StepReport {
    pub name: String,
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
    pub minutes: f64,
}

/// Executes `steps` once, in order, logging a start and an end line per step.
///
/// The first action fault is logged with its message and error chain, the
/// one-shot `on_fault` cleanup hook runs (used to flush pending importer
/// logs), and the fault propagates; remaining steps are skipped. Effects
/// of completed steps stay in place; there is no rollback.
///
/// # Errors
/// Returns the failing action's error, or [`UpdateError::Log`] when the
/// log store itself cannot be written.
pub fn run_steps<C>(
    ctx: &mut C,
    logger: &mut UpdateLogger,
    steps: Vec<Step<'_, C>>,
    on_fault: impl FnOnce(&mut C, &mut UpdateLogger),
) -> anyhow::Result<Vec<StepReport>> {
    let mut reports = Vec::with_capacity(steps.len());
    let mut on_fault = Some(on_fault);

    for step in steps {
        let started_at = now_utc();
        let clock = Instant::now();
        logger.log(&format!(
            "{} | {}",
            step.name,
            format_log_timestamp(started_at)?
        ))?;

        if let Err(err) = (step.action)(ctx, logger) {
            logger.log(&format!("{err} | {err:?}"))?;
            if let Some(hook) = on_fault.take() {
                hook(ctx, logger);
            }
            return Err(err.context(format!("update step '{}' failed", step.name)));
        }

        let finished_at = now_utc();
        let minutes = round_minutes(clock.elapsed().as_secs_f64());
        logger.log(&format!(
            "{} | {} | {minutes} min",
            step.name,
            format_log_timestamp(finished_at)?
        ))?;
        reports.push(StepReport {
            name: step.name,
            started_at,
            finished_at,
            minutes,
        });
    }

    Ok(reports)
}

fn round_minutes(elapsed_secs: f64) -> f64 {
    (elapsed_secs / 60.0 * 100.0).round() / 100.0
}

/// Host limits relevant to a long-running upgrade, in seconds; `0` means
/// the limit is not enforced by the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct HostLimits {
    pub max_execution_time: u64,
    pub max_input_time: u64,
}

impl HostLimits {
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            max_execution_time: 0,
            max_input_time: 0,
        }
    }
}

/// Checks host limits before any mutation occurs.
///
/// # Errors
/// Returns [`UpdateError::Preflight`] naming every violated limit when a
/// finite limit is below [`MIN_EXECUTION_SECS`].
pub fn preflight(limits: &HostLimits) -> Result<(), UpdateError> {
    let mut violations = Vec::new();
    if limits.max_execution_time != 0 && limits.max_execution_time < MIN_EXECUTION_SECS {
        violations.push(format!(
            "max_execution_time = {} < {MIN_EXECUTION_SECS}",
            limits.max_execution_time
        ));
    }
    if limits.max_input_time != 0 && limits.max_input_time < MIN_EXECUTION_SECS {
        violations.push(format!(
            "max_input_time = {} < {MIN_EXECUTION_SECS}",
            limits.max_input_time
        ));
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(UpdateError::Preflight(format!(
            "the host configuration is not compatible with the requirements of the upgrade package: {}",
            violations.join(", ")
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureReport {
    pub errors: Vec<String>,
    pub import_log: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed(FailureReport),
}

impl RunStatus {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Terminal success/failure decision for one run.
///
/// The run failed when the accumulator holds at least one `[ERROR]` line
/// or the cumulative import log contains the `Error` substring.
#[must_use]
pub fn evaluate_run(errors: &[String], import_log: &str) -> RunStatus {
    if errors.is_empty() && !import_log.contains("Error") {
        RunStatus::Completed
    } else {
        RunStatus::Failed(FailureReport {
            errors: errors.to_vec(),
            import_log: import_log.to_string(),
        })
    }
}

/// Renders the static HTML failure fragment shown to the operator.
#[must_use]
pub fn render_failure_page(report: &FailureReport) -> String {
    let mut page = String::new();
    page.push_str("<div class=\"update-failure\">\n");
    page.push_str("<h1>System update failed</h1>\n");
    page.push_str(
        "<p>Some errors appeared during the update. \
         We recommend verifying the logs and running the update package again.</p>\n",
    );
    if !report.errors.is_empty() {
        page.push_str("<blockquote class=\"update-errors\">");
        for line in &report.errors {
            page.push_str(&escape_html(line));
            page.push('\n');
        }
        page.push_str("</blockquote>\n");
    }
    page.push_str("<blockquote class=\"import-log\">");
    page.push_str(&escape_html(&report.import_log));
    page.push_str("</blockquote>\n");
    page.push_str("</div>\n");
    page
}

#[must_use]
pub fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Descriptor of one upgrade package, loaded from `manifest.json` in the
/// package directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageManifest {
    pub label: String,
    pub from_version: String,
    pub to_version: String,
}

impl PackageManifest {
    /// Loads and validates the manifest from `package_dir`.
    ///
    /// # Errors
    /// Returns [`UpdateError::Configuration`] when the manifest is missing,
    /// unreadable, or invalid.
    pub fn load(package_dir: &Path) -> Result<Self, UpdateError> {
        let path = package_dir.join("manifest.json");
        let body = std::fs::read_to_string(&path).map_err(|err| {
            UpdateError::Configuration(format!("failed to read {}: {err}", path.display()))
        })?;
        let manifest: Self = serde_json::from_str(&body).map_err(|err| {
            UpdateError::Configuration(format!("invalid manifest {}: {err}", path.display()))
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// # Errors
    /// Returns [`UpdateError::Validation`] when a required field is blank.
    pub fn validate(&self) -> Result<(), UpdateError> {
        for (name, value) in [
            ("label", &self.label),
            ("from_version", &self.from_version),
            ("to_version", &self.to_version),
        ] {
            if value.trim().is_empty() {
                return Err(UpdateError::Validation(format!(
                    "manifest field '{name}' must not be empty"
                )));
            }
        }
        Ok(())
    }
}

/// Persisted outcome of one upgrade attempt; written exactly once per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionMarker {
    pub run_id: Ulid,
    pub actor: String,
    pub label: String,
    pub from_version: String,
    pub to_version: String,
    pub result: bool,
    pub time: OffsetDateTime,
}

impl VersionMarker {
    #[must_use]
    pub fn for_run(manifest: &PackageManifest, actor: &str, result: bool) -> Self {
        Self {
            run_id: Ulid::new(),
            actor: actor.to_string(),
            label: manifest.label.clone(),
            from_version: manifest.from_version.clone(),
            to_version: manifest.to_version.clone(),
            result,
            time: now_utc(),
        }
    }
}

/// Typed SQL column type for field creation; replaces the positional
/// type strings the registry otherwise would carry around.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    TinyInteger { width: u8 },
    SmallInteger { width: u8 },
    Integer { width: u8, unsigned: bool },
    BigInteger { width: u8 },
    VarChar { length: u32 },
    Text,
    Decimal { precision: u8, scale: u8 },
    DateTime,
}

impl ColumnType {
    #[must_use]
    pub fn as_sql(self) -> String {
        match self {
            Self::TinyInteger { width } => format!("TINYINT({width})"),
            Self::SmallInteger { width } => format!("SMALLINT({width})"),
            Self::Integer { width, unsigned } => {
                if unsigned {
                    format!("INTEGER({width}) UNSIGNED")
                } else {
                    format!("INTEGER({width})")
                }
            }
            Self::BigInteger { width } => format!("BIGINT({width})"),
            Self::VarChar { length } => format!("VARCHAR({length})"),
            Self::Text => "TEXT".to_string(),
            Self::Decimal { precision, scale } => format!("DECIMAL({precision},{scale})"),
            Self::DateTime => "DATETIME".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockSpec {
    pub label: String,
    pub sequence: i64,
    pub show_title: bool,
    pub visible: bool,
    pub icon: Option<String>,
}

/// One field definition for idempotent field creation.
///
/// Every attribute the registry needs is a named member; picklist values
/// apply to picklist ui types and related modules to reference fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSpec {
    pub module: String,
    pub table: String,
    pub column: String,
    pub name: String,
    pub label: String,
    pub uitype: u16,
    pub column_type: ColumnType,
    pub type_of_data: String,
    pub display_type: i64,
    pub presence: i64,
    pub quick_create: i64,
    pub mass_editable: i64,
    pub summary_field: i64,
    pub maximum_length: Option<String>,
    pub default_value: Option<String>,
    pub field_params: Option<String>,
    pub block_label: String,
    pub block: Option<BlockSpec>,
    pub picklist_values: Vec<String>,
    pub related_modules: Vec<String>,
}

impl FieldSpec {
    pub const UITYPE_REFERENCE: u16 = 10;
    pub const PICKLIST_UITYPES: [u16; 3] = [15, 16, 33];

    #[must_use]
    pub fn is_picklist(&self) -> bool {
        Self::PICKLIST_UITYPES.contains(&self.uitype)
    }

    #[must_use]
    pub fn is_reference(&self) -> bool {
        self.uitype == Self::UITYPE_REFERENCE
    }

    /// # Errors
    /// Returns [`UpdateError::Validation`] when identifiers are blank or
    /// ui-type specific attributes are inconsistent.
    pub fn validate(&self) -> Result<(), UpdateError> {
        for (name, value) in [
            ("module", &self.module),
            ("table", &self.table),
            ("column", &self.column),
            ("name", &self.name),
            ("label", &self.label),
            ("block_label", &self.block_label),
        ] {
            if value.trim().is_empty() {
                return Err(UpdateError::Validation(format!(
                    "field definition attribute '{name}' must not be empty"
                )));
            }
        }
        if !self.is_picklist() && !self.picklist_values.is_empty() {
            return Err(UpdateError::Validation(format!(
                "field '{}' carries picklist values but uitype {} is not a picklist",
                self.name, self.uitype
            )));
        }
        if !self.is_reference() && !self.related_modules.is_empty() {
            return Err(UpdateError::Validation(format!(
                "field '{}' carries related modules but uitype {} is not a reference",
                self.name, self.uitype
            )));
        }
        Ok(())
    }
}

/// Template of one subsystem's key/value config store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigTemplate {
    pub name: String,
    pub defaults: Map<String, Value>,
}

impl ConfigTemplate {
    /// Loads `<dir>/<name>.json` as the template for subsystem `name`.
    ///
    /// # Errors
    /// Returns [`UpdateError::Configuration`] when the template is missing
    /// or not a JSON object.
    pub fn load(dir: &Path, name: &str) -> Result<Self, UpdateError> {
        let path = dir.join(format!("{name}.json"));
        let body = std::fs::read_to_string(&path).map_err(|err| {
            UpdateError::Configuration(format!("failed to read {}: {err}", path.display()))
        })?;
        let value: Value = serde_json::from_str(&body).map_err(|err| {
            UpdateError::Configuration(format!("invalid template {}: {err}", path.display()))
        })?;
        let Value::Object(defaults) = value else {
            return Err(UpdateError::Configuration(format!(
                "template {} must be a JSON object",
                path.display()
            )));
        };
        Ok(Self {
            name: name.to_string(),
            defaults,
        })
    }

    /// Loads every `*.json` template under `dir`, sorted by name. A missing
    /// directory yields an empty set.
    ///
    /// # Errors
    /// Returns [`UpdateError::Configuration`] on unreadable entries.
    pub fn load_all(dir: &Path) -> Result<Vec<Self>, UpdateError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(UpdateError::Configuration(format!(
                    "failed to list templates in {}: {err}",
                    dir.display()
                )))
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                UpdateError::Configuration(format!(
                    "failed to list templates in {}: {err}",
                    dir.display()
                ))
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();

        names.iter().map(|name| Self::load(dir, name)).collect()
    }
}

/// Regenerates one subsystem config store wholesale from its template,
/// carrying over previously-set values and explicit overrides.
pub struct ConfigFile {
    template: ConfigTemplate,
    overrides: Map<String, Value>,
}

impl ConfigFile {
    #[must_use]
    pub fn new(template: ConfigTemplate) -> Self {
        Self {
            template,
            overrides: Map::new(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.overrides.insert(key.into(), value);
    }

    /// Writes `<config_dir>/<name>.json`: template defaults, overlaid by
    /// existing values for keys the template still declares, overlaid by
    /// explicit overrides. Keys the template dropped disappear.
    ///
    /// # Errors
    /// Returns [`UpdateError::Configuration`] on read/write failures.
    pub fn create(&self, config_dir: &Path) -> Result<PathBuf, UpdateError> {
        std::fs::create_dir_all(config_dir).map_err(|err| {
            UpdateError::Configuration(format!(
                "failed to create config dir {}: {err}",
                config_dir.display()
            ))
        })?;
        let path = config_dir.join(format!("{}.json", self.template.name));

        let existing = match std::fs::read_to_string(&path) {
            Ok(body) => serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|value| match value {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .unwrap_or_default(),
            Err(_) => Map::new(),
        };

        let mut merged = self.template.defaults.clone();
        for (key, value) in &existing {
            if merged.contains_key(key) {
                merged.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in &self.overrides {
            merged.insert(key.clone(), value.clone());
        }

        let body = serde_json::to_string_pretty(&Value::Object(merged)).map_err(|err| {
            UpdateError::Configuration(format!("failed to serialize {}: {err}", path.display()))
        })?;
        std::fs::write(&path, body).map_err(|err| {
            UpdateError::Configuration(format!("failed to write {}: {err}", path.display()))
        })?;
        Ok(path)
    }
}

/// Rewrites a mail subsystem config map to the 6.4.0 shape: IMAP host keys
/// gain the default port when they carry none, SMTP host and port collapse
/// into one `host:port` value, and the retired `advanced_search` plugin
/// entry is removed.
#[must_use]
pub fn migrate_mail_config(existing: &Map<String, Value>, default_port: u16) -> Map<String, Value> {
    let mut migrated = existing.clone();

    if let Some(Value::Object(hosts)) = existing.get("imap_hosts") {
        let mut rewritten = Map::new();
        for (host, display) in hosts {
            let mut host = host.clone();
            let mut display = display.as_str().unwrap_or_default().to_string();
            if !host_has_port(&host) {
                if display == host {
                    let _ = write!(display, ":{default_port}");
                }
                let _ = write!(host, ":{default_port}");
            }
            rewritten.insert(host, Value::String(display));
        }
        migrated.insert("imap_hosts".to_string(), Value::Object(rewritten));
    }

    let smtp_host = existing
        .get("smtp_host")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let smtp_port = existing.get("smtp_port").and_then(Value::as_u64);
    if !smtp_host.is_empty() {
        let combined = match smtp_port {
            Some(port) if !host_has_port(&smtp_host) => format!("{smtp_host}:{port}"),
            _ => smtp_host,
        };
        migrated.insert("smtp_host".to_string(), Value::String(combined));
    }
    migrated.remove("smtp_port");

    if let Some(Value::Array(plugins)) = existing.get("plugins") {
        let kept: Vec<Value> = plugins
            .iter()
            .filter(|plugin| plugin.as_str() != Some("advanced_search"))
            .cloned()
            .collect();
        migrated.insert("plugins".to_string(), Value::Array(kept));
    }

    migrated
}

fn host_has_port(host: &str) -> bool {
    host.rsplit_once(':')
        .is_some_and(|(_, port)| !port.is_empty() && port.chars().all(|ch| ch.is_ascii_digit()))
}

/// Recursively removes a directory; an absent path is not an error.
///
/// # Errors
/// Returns [`UpdateError::Configuration`] on any other filesystem failure.
pub fn recurse_delete(path: &Path) -> Result<(), UpdateError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(UpdateError::Configuration(format!(
            "failed to delete {}: {err}",
            path.display()
        ))),
    }
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Formats a timestamp as `YYYY-MM-DD HH:MM:SS` (UTC) for log lines.
///
/// # Errors
/// Returns [`UpdateError::Validation`] when formatting fails.
pub fn format_log_timestamp(value: OffsetDateTime) -> Result<String, UpdateError> {
    let format =
        time::format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
            .map_err(|err| {
                UpdateError::Validation(format!("invalid log timestamp format: {err}"))
            })?;
    value
        .to_offset(UtcOffset::UTC)
        .format(&format)
        .map_err(|err| UpdateError::Validation(format!("failed to format log timestamp: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`UpdateError::Validation`] when parsing fails or the input is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, UpdateError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| UpdateError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;
    if parsed.offset() != UtcOffset::UTC {
        return Err(UpdateError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }
    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`UpdateError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, UpdateError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            UpdateError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}
