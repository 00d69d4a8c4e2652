use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;
pub const DEFAULT_RETRIES: u32 = 3;

const TOP_LEVEL_FIELDS: &str = "api_version, run, services";
const PROBE_TYPES: &str = "tcp, http, command";

/// The static service registry: everything the orchestrator needs to know
/// about a run, supplied once before any probing starts.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub api_version: ApiVersion,
    pub run: RunConfig,
    pub services: Vec<ServiceDescriptor>,
}

#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub deadline: Option<Duration>,
    pub probe_jitter: JitterMode,
}

/// Immutable description of one service: identity, probe parameters and the
/// names of the services that must be healthy before probing begins.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub probe: ProbeSpec,
    pub requires: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub target: ProbeTarget,
    pub interval: Duration,
    pub timeout: Duration,
    pub success_threshold: u32,
    pub retries: u32,
    pub start_period: Duration,
    pub jitter: Option<JitterMode>,
}

/// Closed set of probe kinds. Each variant carries its own target shape; the
/// executor dispatches over this tag rather than over trait objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// Pass iff a TCP connection to `address` succeeds within the timeout.
    Connectivity { address: String },
    /// Pass iff an HTTP GET to `url` answers with the expected status within
    /// the timeout. `expect_status: None` accepts any 2xx.
    Handshake {
        url: String,
        expect_status: Option<u16>,
    },
    /// Pass iff the invoked command exits zero within the timeout.
    Command { program: String, args: Vec<String> },
}

impl ProbeTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeTarget::Connectivity { .. } => "tcp",
            ProbeTarget::Handshake { .. } => "http",
            ProbeTarget::Command { .. } => "command",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterMode {
    #[default]
    None,
    Equal,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ApiVersion {
    #[default]
    V1,
    Unsupported(String),
}

impl RegistryConfig {
    pub fn from_reader(mut reader: impl Read) -> Result<Self, RegistryConfigError> {
        let mut contents = String::new();
        reader.read_to_string(&mut contents)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RegistryConfigError> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    fn from_yaml_str(contents: &str) -> Result<Self, RegistryConfigError> {
        let raw: RawRegistryFile = serde_yaml::from_str(contents)?;
        Self::from_raw(raw).map_err(RegistryConfigError::Invalid)
    }

    fn from_raw(raw: RawRegistryFile) -> Result<Self, RegistryValidationError> {
        let mut errors = Vec::new();

        let RawRegistryFile {
            api_version: raw_api_version,
            run: raw_run,
            services: raw_services,
            extra_fields,
        } = raw;

        for key in extra_fields.keys() {
            errors.push(format!(
                "error[root]: unknown top-level key \"{key}\" (expected one of {TOP_LEVEL_FIELDS})"
            ));
        }

        let api_version = parse_api_version(raw_api_version, &mut errors);
        let run = parse_run_config(raw_run, &mut errors);

        if raw_services.is_empty() {
            errors.push("error[root]: at least one service is required".to_string());
        }

        let mut seen = BTreeSet::new();
        let mut services = Vec::with_capacity(raw_services.len());
        for (index, raw_service) in raw_services.into_iter().enumerate() {
            if let Some(service) = parse_service(raw_service, index, &mut seen, &mut errors) {
                services.push(service);
            }
        }

        if errors.is_empty() {
            Ok(Self {
                api_version,
                run,
                services,
            })
        } else {
            Err(RegistryValidationError::new(errors))
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRegistryFile {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    run: Option<RawRunSection>,
    #[serde(default)]
    services: Vec<RawService>,
    #[serde(default, flatten)]
    extra_fields: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Deserialize)]
struct RawRunSection {
    #[serde(default)]
    deadline: Option<String>,
    #[serde(default)]
    probe_jitter: Option<String>,
    #[serde(default, flatten)]
    extra_fields: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Deserialize)]
struct RawService {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    probe: Option<RawProbe>,
    #[serde(default, flatten)]
    extra_fields: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Deserialize)]
struct RawProbe {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    expect_status: Option<u16>,
    #[serde(default)]
    command: Option<Vec<String>>,
    #[serde(default)]
    interval: Option<String>,
    #[serde(default)]
    timeout: Option<String>,
    #[serde(default)]
    success_threshold: Option<u32>,
    #[serde(default)]
    retries: Option<u32>,
    #[serde(default)]
    start_period: Option<String>,
    #[serde(default)]
    jitter: Option<String>,
    #[serde(default, flatten)]
    extra_fields: BTreeMap<String, YamlValue>,
}

fn parse_api_version(raw: Option<String>, errors: &mut Vec<String>) -> ApiVersion {
    match raw {
        None => {
            errors
                .push("error[root]: api_version is required (supported versions: v1)".to_string());
            ApiVersion::V1
        }
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                errors.push("error[root]: api_version must be a non-empty string".to_string());
                ApiVersion::V1
            } else if trimmed.eq_ignore_ascii_case("v1") {
                ApiVersion::V1
            } else {
                errors.push(format!(
                    "error[root]: api_version `{trimmed}` is not supported (supported versions: v1)"
                ));
                ApiVersion::Unsupported(trimmed.to_string())
            }
        }
    }
}

fn parse_run_config(raw: Option<RawRunSection>, errors: &mut Vec<String>) -> RunConfig {
    let Some(raw) = raw else {
        return RunConfig::default();
    };

    for key in raw.extra_fields.keys() {
        errors.push(format!(
            "error[run]: unknown key \"{key}\" (expected one of deadline, probe_jitter)"
        ));
    }

    let deadline = raw.deadline.as_deref().and_then(|value| {
        match parse_duration_field(value, "run.deadline") {
            Ok(duration) => Some(duration),
            Err(message) => {
                errors.push(message);
                None
            }
        }
    });

    if deadline.is_some_and(|value| value.is_zero()) {
        errors.push("error[run]: deadline must be greater than zero".to_string());
    }

    let probe_jitter = raw
        .probe_jitter
        .as_deref()
        .and_then(|value| match parse_jitter_mode(value) {
            Ok(mode) => Some(mode),
            Err(message) => {
                errors.push(format!("error[run]: {message}"));
                None
            }
        })
        .unwrap_or_default();

    RunConfig {
        deadline,
        probe_jitter,
    }
}

fn parse_service(
    raw: RawService,
    index: usize,
    seen: &mut BTreeSet<String>,
    errors: &mut Vec<String>,
) -> Option<ServiceDescriptor> {
    let name = match raw.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            errors.push(format!(
                "error[service #{index}]: name is required and must be non-empty"
            ));
            return None;
        }
    };

    if !seen.insert(name.clone()) {
        errors.push(format!("service `{name}`: duplicate service name"));
        return None;
    }

    for key in raw.extra_fields.keys() {
        errors.push(format!(
            "service `{name}`: unknown key \"{key}\" (expected one of name, requires, probe)"
        ));
    }

    let requires = parse_requires(&name, raw.requires, errors);
    let probe = parse_probe(&name, raw.probe, errors)?;

    Some(ServiceDescriptor {
        name,
        probe,
        requires,
    })
}

fn parse_requires(name: &str, raw: Vec<String>, errors: &mut Vec<String>) -> Vec<String> {
    let mut deduped = BTreeSet::new();
    for value in raw {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            errors.push(format!("service `{name}`: empty dependency name in requires"));
            continue;
        }
        if trimmed == name {
            errors.push(format!("service `{name}`: a service cannot require itself"));
            continue;
        }
        deduped.insert(trimmed.to_string());
    }
    deduped.into_iter().collect()
}

fn parse_probe(name: &str, raw: Option<RawProbe>, errors: &mut Vec<String>) -> Option<ProbeSpec> {
    let Some(raw) = raw else {
        errors.push(format!("service `{name}`: probe section is required"));
        return None;
    };

    for key in raw.extra_fields.keys() {
        errors.push(format!("service `{name}`: unknown probe key \"{key}\""));
    }

    let target = parse_probe_target(name, &raw, errors);

    let interval = parse_optional_duration(name, "interval", raw.interval.as_deref(), errors)
        .unwrap_or(DEFAULT_INTERVAL);
    let timeout = parse_optional_duration(name, "timeout", raw.timeout.as_deref(), errors)
        .unwrap_or(DEFAULT_TIMEOUT);
    let start_period =
        parse_optional_duration(name, "start_period", raw.start_period.as_deref(), errors)
            .unwrap_or(Duration::ZERO);

    if interval.is_zero() {
        errors.push(format!("service `{name}`: probe interval must be greater than zero"));
    }
    if timeout.is_zero() {
        errors.push(format!("service `{name}`: probe timeout must be greater than zero"));
    }
    if !interval.is_zero() && !timeout.is_zero() && timeout >= interval {
        errors.push(format!(
            "service `{name}`: probe timeout ({}) must be strictly shorter than interval ({})",
            humantime::format_duration(timeout),
            humantime::format_duration(interval),
        ));
    }

    let success_threshold = raw.success_threshold.unwrap_or(DEFAULT_SUCCESS_THRESHOLD);
    if success_threshold == 0 {
        errors.push(format!(
            "service `{name}`: success_threshold must be at least 1"
        ));
    }

    let retries = raw.retries.unwrap_or(DEFAULT_RETRIES);
    if retries == 0 {
        errors.push(format!("service `{name}`: retries must be at least 1"));
    }

    let jitter = raw
        .jitter
        .as_deref()
        .and_then(|value| match parse_jitter_mode(value) {
            Ok(mode) => Some(mode),
            Err(message) => {
                errors.push(format!("service `{name}`: {message}"));
                None
            }
        });

    let target = target?;
    Some(ProbeSpec {
        target,
        interval,
        timeout,
        success_threshold,
        retries,
        start_period,
        jitter,
    })
}

fn parse_probe_target(
    name: &str,
    raw: &RawProbe,
    errors: &mut Vec<String>,
) -> Option<ProbeTarget> {
    let kind = match raw.kind.as_deref().map(str::trim) {
        Some(kind) if !kind.is_empty() => kind,
        _ => {
            errors.push(format!(
                "service `{name}`: probe type is required (one of {PROBE_TYPES})"
            ));
            return None;
        }
    };

    match kind {
        "tcp" => match raw.address.as_deref().map(str::trim) {
            Some(address) if !address.is_empty() => Some(ProbeTarget::Connectivity {
                address: address.to_string(),
            }),
            _ => {
                errors.push(format!(
                    "service `{name}`: tcp probe requires a non-empty address (host:port)"
                ));
                None
            }
        },
        "http" => match raw.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => {
                if let Err(err) = reqwest::Url::parse(url) {
                    errors.push(format!("service `{name}`: invalid probe url `{url}`: {err}"));
                    return None;
                }
                if let Some(status) = raw.expect_status {
                    if !(100..=599).contains(&status) {
                        errors.push(format!(
                            "service `{name}`: expect_status {status} is not a valid HTTP status"
                        ));
                        return None;
                    }
                }
                Some(ProbeTarget::Handshake {
                    url: url.to_string(),
                    expect_status: raw.expect_status,
                })
            }
            _ => {
                errors.push(format!("service `{name}`: http probe requires a non-empty url"));
                None
            }
        },
        "command" => match raw.command.as_deref() {
            Some([program, args @ ..]) if !program.trim().is_empty() => {
                Some(ProbeTarget::Command {
                    program: program.trim().to_string(),
                    args: args.to_vec(),
                })
            }
            _ => {
                errors.push(format!(
                    "service `{name}`: command probe requires a non-empty argv list"
                ));
                None
            }
        },
        other => {
            errors.push(format!(
                "service `{name}`: unknown probe type `{other}` (expected one of {PROBE_TYPES})"
            ));
            None
        }
    }
}

fn parse_optional_duration(
    name: &str,
    field: &str,
    raw: Option<&str>,
    errors: &mut Vec<String>,
) -> Option<Duration> {
    let raw = raw?;
    match parse_duration_field(raw, field) {
        Ok(duration) => Some(duration),
        Err(message) => {
            errors.push(format!("service `{name}`: {message}"));
            None
        }
    }
}

fn parse_duration_field(raw: &str, field: &str) -> Result<Duration, String> {
    humantime::parse_duration(raw.trim())
        .map_err(|err| format!("error parsing {field} `{raw}`: {err}"))
}

fn parse_jitter_mode(raw: &str) -> Result<JitterMode, String> {
    match raw.trim() {
        "none" => Ok(JitterMode::None),
        "equal" => Ok(JitterMode::Equal),
        "full" => Ok(JitterMode::Full),
        other => Err(format!(
            "unknown jitter mode `{other}` (expected one of none, equal, full)"
        )),
    }
}

#[derive(Debug, Error)]
pub enum RegistryConfigError {
    #[error("failed to read service registry: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse service registry: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Invalid(RegistryValidationError),
}

#[derive(Debug, Error)]
#[error("service registry validation failed:\n{rendered}")]
pub struct RegistryValidationError {
    rendered: String,
}

impl RegistryValidationError {
    pub fn new(messages: Vec<String>) -> Self {
        let rendered = messages
            .iter()
            .map(|msg| format!("- {msg}"))
            .collect::<Vec<_>>()
            .join("\n");
        Self { rendered }
    }
}
