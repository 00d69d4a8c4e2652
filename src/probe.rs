use crate::config::registry::{ProbeSpec, ProbeTarget};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure,
    Timeout,
}

impl ProbeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeOutcome::Success => "SUCCESS",
            ProbeOutcome::Failure => "FAILURE",
            ProbeOutcome::Timeout => "TIMEOUT",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ProbeOutcome::Success)
    }
}

/// Outcome of a single probe attempt. Transient: consumed by the health
/// state machine and retained only as bounded diagnostic history.
#[derive(Clone, Debug)]
pub struct ProbeResult {
    pub service: String,
    pub at: DateTime<Utc>,
    pub outcome: ProbeOutcome,
    pub latency: Duration,
    pub detail: Option<String>,
}

/// Seam between the health monitors and the wire. The production
/// implementation is [`EndpointProber`]; tests inject scripted probers.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn execute(&self, service: &str, spec: &ProbeSpec) -> ProbeResult;
}

/// Executes one typed probe per call, honoring the per-attempt timeout.
/// Never propagates a failure: every error becomes a Failure or Timeout
/// outcome with a diagnostic detail.
pub struct EndpointProber {
    client: reqwest::Client,
}

impl EndpointProber {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client })
    }

    async fn attempt(&self, target: &ProbeTarget) -> std::result::Result<(), String> {
        match target {
            ProbeTarget::Connectivity { address } => TcpStream::connect(address.as_str())
                .await
                .map(|_| ())
                .map_err(|err| format!("connect {address}: {err}")),
            ProbeTarget::Handshake { url, expect_status } => {
                let response = self
                    .client
                    .get(url.as_str())
                    .send()
                    .await
                    .map_err(|err| format!("GET {url}: {err}"))?;

                let status = response.status();
                let accepted = match expect_status {
                    Some(expected) => status.as_u16() == *expected,
                    None => status.is_success(),
                };
                if accepted {
                    Ok(())
                } else {
                    Err(format!("GET {url}: unexpected status {status}"))
                }
            }
            ProbeTarget::Command { program, args } => {
                let output = Command::new(program)
                    .args(args)
                    .stdin(std::process::Stdio::null())
                    .kill_on_drop(true)
                    .output()
                    .await
                    .map_err(|err| format!("spawn `{program}`: {err}"))?;

                if output.status.success() {
                    Ok(())
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let stderr = stderr.trim();
                    if stderr.is_empty() {
                        Err(format!("`{program}` exited with {}", output.status))
                    } else {
                        Err(format!("`{program}` exited with {}: {stderr}", output.status))
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Prober for EndpointProber {
    async fn execute(&self, service: &str, spec: &ProbeSpec) -> ProbeResult {
        let at = Utc::now();
        let started = Instant::now();

        let (outcome, detail) = match timeout(spec.timeout, self.attempt(&spec.target)).await {
            Ok(Ok(())) => (ProbeOutcome::Success, None),
            Ok(Err(detail)) => (ProbeOutcome::Failure, Some(detail)),
            Err(_) => (
                ProbeOutcome::Timeout,
                Some(format!(
                    "no response within {}",
                    humantime::format_duration(spec.timeout)
                )),
            ),
        };

        ProbeResult {
            service: service.to_string(),
            at,
            outcome,
            latency: started.elapsed(),
            detail,
        }
    }
}
