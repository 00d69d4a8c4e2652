use crate::error::Result;
use crate::probe::ProbeOutcome;
use chrono::{SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt::{self as stdfmt, Write as _};
use std::sync::Mutex;
use std::sync::OnceLock;
use tracing::field::{Field, Visit};
use tracing::Event;
use tracing::Subscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "convoy";

pub fn init_tracing() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("convoy=info,info"));

    // Warnings and errors go to stderr, everything else to stdout.
    let writer = std::io::stderr
        .with_max_level(tracing::Level::WARN)
        .or_else(std::io::stdout);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .event_format(KeyValueFormatter::new())
        .with_writer(writer)
        .try_init()
        .map_err(|err| crate::err!("failed to initialise tracing subscriber: {err}"))
}

struct KeyValueFormatter {
    service_name: &'static str,
}

impl KeyValueFormatter {
    const fn new() -> Self {
        Self {
            service_name: SERVICE_NAME,
        }
    }
}

impl<S, N> FormatEvent<S, N> for KeyValueFormatter
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let pid = std::process::id().to_string();
        let metadata = event.metadata();
        let component = metadata.target();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let message = visitor
            .message
            .take()
            .unwrap_or_else(|| metadata.name().to_string());

        let mut fields = visitor.fields;
        fields.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));

        let span_path = current_span_path(ctx);

        let mut line = String::new();
        push_field(&mut line, "ts", &timestamp);
        push_field(&mut line, "level", metadata.level().as_str());
        push_field(&mut line, "service", self.service_name);
        push_field(&mut line, "component", component);
        push_field(&mut line, "pid", &pid);

        if let Some(span_path) = span_path {
            push_field(&mut line, "span", &span_path);
        }

        push_field(&mut line, "msg", &message);

        for (key, value) in fields {
            push_field(&mut line, &key, &value);
        }

        writer.write_str(&line)?;
        writer.write_char('\n')
    }
}

fn current_span_path<S, N>(ctx: &FmtContext<'_, S, N>) -> Option<String>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    let span = ctx.lookup_current()?;
    let names: Vec<&str> = span.scope().from_root().map(|s| s.name()).collect();
    if names.is_empty() {
        None
    } else {
        Some(names.join("."))
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn record_field(&mut self, field: &Field, value: String) {
        if field.name().is_empty() {
            return;
        }
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_field(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn stdfmt::Debug) {
        self.record_field(field, format!("{value:?}"));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_field(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_field(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_field(field, value.to_string());
    }
}

fn encode_field_value(value: &str) -> String {
    let needs_quotes = value.chars().any(|c| {
        c.is_whitespace()
            || matches!(
                c,
                '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ',' | '\n' | '\r' | '\t'
            )
    });

    if !needs_quotes {
        return value.to_string();
    }

    let mut encoded = String::with_capacity(value.len() + 2);
    encoded.push('"');
    for ch in value.chars() {
        match ch {
            '"' => encoded.push_str("\\\""),
            '\\' => encoded.push_str("\\\\"),
            '\n' => encoded.push_str("\\n"),
            '\r' => encoded.push_str("\\r"),
            '\t' => encoded.push_str("\\t"),
            _ => encoded.push(ch),
        }
    }
    encoded.push('"');
    encoded
}

fn push_field(buffer: &mut String, key: &str, value: &str) {
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(key);
    buffer.push('=');
    buffer.push_str(&encode_field_value(value));
}

/// In-process counters for the probe engine. Snapshots are cheap copies so
/// diagnostic consumers never hold the registries locked.
#[derive(Default)]
pub struct RuntimeCounters {
    probes: ProbeOutcomeRegistry,
    activations: ActivationRegistry,
    forced_failures: ForcedFailureRegistry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeCountersSnapshot {
    pub probes: Vec<ProbeCountsSnapshot>,
    pub activations: Vec<ActivationSnapshot>,
    pub forced_failures: Vec<ForcedFailureSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeCountsSnapshot {
    pub service: String,
    pub success: u64,
    pub failure: u64,
    pub timeout: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivationSnapshot {
    pub service: String,
    pub total: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForcedFailureSnapshot {
    pub service: String,
    pub reason: String,
    pub total: u64,
}

static RUNTIME_COUNTERS: OnceLock<RuntimeCounters> = OnceLock::new();

pub fn runtime_counters() -> &'static RuntimeCounters {
    RUNTIME_COUNTERS.get_or_init(RuntimeCounters::default)
}

impl RuntimeCounters {
    pub fn record_probe_outcome(&self, service: &str, outcome: ProbeOutcome) {
        self.probes.record(service, outcome);
    }

    pub fn record_activation(&self, service: &str) {
        self.activations.record(service);
    }

    pub fn record_forced_failure(&self, service: &str, reason: &str) {
        self.forced_failures.record(service, reason);
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        RuntimeCountersSnapshot {
            probes: self.probes.snapshot(),
            activations: self.activations.snapshot(),
            forced_failures: self.forced_failures.snapshot(),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct ProbeCounts {
    success: u64,
    failure: u64,
    timeout: u64,
}

#[derive(Default)]
struct ProbeOutcomeRegistry {
    inner: Mutex<BTreeMap<String, ProbeCounts>>,
}

impl ProbeOutcomeRegistry {
    fn record(&self, service: &str, outcome: ProbeOutcome) {
        let mut guard = self.inner.lock().expect("probe registry poisoned");
        let entry = guard.entry(service.to_string()).or_default();
        match outcome {
            ProbeOutcome::Success => entry.success = entry.success.saturating_add(1),
            ProbeOutcome::Failure => entry.failure = entry.failure.saturating_add(1),
            ProbeOutcome::Timeout => entry.timeout = entry.timeout.saturating_add(1),
        }
    }

    fn snapshot(&self) -> Vec<ProbeCountsSnapshot> {
        let guard = self.inner.lock().expect("probe registry poisoned");
        guard
            .iter()
            .map(|(service, counts)| ProbeCountsSnapshot {
                service: service.clone(),
                success: counts.success,
                failure: counts.failure,
                timeout: counts.timeout,
            })
            .collect()
    }
}

#[derive(Default)]
struct ActivationRegistry {
    inner: Mutex<BTreeMap<String, u64>>,
}

impl ActivationRegistry {
    fn record(&self, service: &str) {
        let mut guard = self.inner.lock().expect("activation registry poisoned");
        *guard.entry(service.to_string()).or_insert(0) += 1;
    }

    fn snapshot(&self) -> Vec<ActivationSnapshot> {
        let guard = self.inner.lock().expect("activation registry poisoned");
        guard
            .iter()
            .map(|(service, total)| ActivationSnapshot {
                service: service.clone(),
                total: *total,
            })
            .collect()
    }
}

#[derive(Default)]
struct ForcedFailureRegistry {
    inner: Mutex<BTreeMap<(String, String), u64>>,
}

impl ForcedFailureRegistry {
    fn record(&self, service: &str, reason: &str) {
        let mut guard = self.inner.lock().expect("forced failure registry poisoned");
        let key = (service.to_string(), reason.to_string());
        *guard.entry(key).or_insert(0) += 1;
    }

    fn snapshot(&self) -> Vec<ForcedFailureSnapshot> {
        let guard = self.inner.lock().expect("forced failure registry poisoned");
        guard
            .iter()
            .map(|((service, reason), total)| ForcedFailureSnapshot {
                service: service.clone(),
                reason: reason.clone(),
                total: *total,
            })
            .collect()
    }
}
