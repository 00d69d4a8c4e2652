use anyhow::Context as _;
use convoy::config::registry::RegistryConfig;
use convoy::config::ConvoyConfig;
use convoy::graph::DependencyGraph;
use convoy::orchestrator::{Orchestrator, RunReport, RunSettings, Verdict};
use convoy::probe::EndpointProber;
use convoy::telemetry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const USAGE: &str = "\
convoy - dependency-aware startup orchestration

Usage:
  convoy run [-c <file> | --config <file>]
  convoy validate <file>...
  convoy --help

Commands:
  run        Execute a startup run over the service registry and exit with
             the verdict: 0 all healthy, 1 failed, 2 deadline exceeded,
             130 interrupted.
  validate   Parse and graph-check one or more registry files without
             probing anything.

Options:
  -c, --config <file>   Service registry to use for `run`. Defaults to the
                        `registry_path` from process configuration.
  -h, --help            Show this message.
";

enum Command {
    Run { config: Option<String> },
    Validate { configs: Vec<String> },
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut iter = args.iter();
    let command = match iter.next() {
        Some(arg) if arg == "-h" || arg == "--help" => {
            print!("{USAGE}");
            std::process::exit(0);
        }
        Some(arg) => arg.as_str(),
        None => return Err("missing command (expected `run` or `validate`)".to_string()),
    };

    match command {
        "run" => {
            let mut config = None;
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "-c" | "--config" => {
                        let value = iter
                            .next()
                            .ok_or_else(|| format!("{arg} requires a file argument"))?;
                        config = Some(value.clone());
                    }
                    other => return Err(format!("unexpected argument `{other}`")),
                }
            }
            Ok(Command::Run { config })
        }
        "validate" => {
            let configs: Vec<String> = iter.cloned().collect();
            if configs.is_empty() {
                return Err("validate requires at least one registry file".to_string());
            }
            Ok(Command::Validate { configs })
        }
        other => Err(format!("unknown command `{other}`")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("error: {message}");
            eprint!("{USAGE}");
            std::process::exit(1);
        }
    };

    match command {
        Command::Run { config } => run(config).await,
        Command::Validate { configs } => validate(&configs),
    }
}

async fn run(config_override: Option<String>) -> anyhow::Result<()> {
    telemetry::init_tracing().context("telemetry initialisation failed")?;

    let registry_path = match config_override {
        Some(path) => path,
        None => {
            let process_config = ConvoyConfig::load().context("loading process configuration")?;
            process_config.registry_path.context(
                "no service registry given (pass --config or set CONVOY__REGISTRY_PATH)",
            )?
        }
    };

    let registry = RegistryConfig::from_path(&registry_path)
        .with_context(|| format!("loading service registry `{registry_path}`"))?;

    let graph = match DependencyGraph::build(registry.services) {
        Ok(graph) => Arc::new(graph),
        Err(error) => {
            eprintln!("{error}");
            eprintln!("{}", serde_json::to_string_pretty(&error)?);
            std::process::exit(1);
        }
    };

    tracing::info!(
        registry = registry_path.as_str(),
        services = graph.len() as u64,
        roots = graph.roots().len() as u64,
        "dependency graph constructed"
    );

    let settings = RunSettings {
        deadline: registry.run.deadline,
        jitter: registry.run.probe_jitter,
    };
    let prober = Arc::new(EndpointProber::new().context("building probe executor")?);
    let orchestrator = Orchestrator::new(graph, prober, settings);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    let report = orchestrator.run(shutdown).await?;
    render_failures(&report);

    std::process::exit(match report.verdict {
        Verdict::AllHealthy => 0,
        Verdict::Failed => 1,
        Verdict::DeadlineExceeded => 2,
        Verdict::Interrupted => 130,
    });
}

fn render_failures(report: &RunReport) {
    if report.verdict == Verdict::AllHealthy {
        return;
    }
    eprintln!("startup did not complete: {}", report.verdict.as_str());
    for failure in &report.failures {
        let detail = failure.last_detail.as_deref().unwrap_or("no diagnostic recorded");
        eprintln!(
            "  - {}: {} ({} consecutive failures; last: {})",
            failure.service,
            failure.phase.as_str(),
            failure.consecutive_failures,
            detail
        );
    }
}

fn validate(configs: &[String]) -> anyhow::Result<()> {
    let mut failed = false;

    for path in configs {
        let registry = match RegistryConfig::from_path(path) {
            Ok(registry) => registry,
            Err(error) => {
                eprintln!("{path}: invalid");
                eprintln!("{error}");
                failed = true;
                continue;
            }
        };

        match DependencyGraph::build(registry.services) {
            Ok(graph) => {
                println!("{path}: ok ({} services, {} roots)", graph.len(), graph.roots().len());
            }
            Err(error) => {
                eprintln!("{path}: invalid");
                eprintln!("{error}");
                eprintln!("{}", serde_json::to_string_pretty(&error)?);
                failed = true;
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
