use convoy::config::registry::{
    ApiVersion, JitterMode, ProbeTarget, RegistryConfig, RegistryConfigError,
};
use std::time::Duration;

fn parse(yaml: &str) -> Result<RegistryConfig, RegistryConfigError> {
    RegistryConfig::from_reader(yaml.as_bytes())
}

fn validation_message(yaml: &str) -> String {
    match parse(yaml) {
        Err(RegistryConfigError::Invalid(error)) => error.to_string(),
        Err(other) => panic!("expected validation error, got: {other}"),
        Ok(_) => panic!("expected validation error, config parsed"),
    }
}

const FULL_REGISTRY: &str = r#"
api_version: v1
run:
  deadline: 30s
  probe_jitter: equal
services:
  - name: db
    probe:
      type: tcp
      address: 127.0.0.1:5432
      interval: 2s
      timeout: 500ms
      success_threshold: 2
      retries: 5
      start_period: 3s
  - name: api
    requires: [db]
    probe:
      type: http
      url: http://127.0.0.1:8080/health
      expect_status: 200
      interval: 1s
      timeout: 250ms
  - name: worker
    requires: [db]
    probe:
      type: command
      command: ["pg_isready", "-q"]
"#;

#[test]
fn full_registry_parses() {
    let registry = parse(FULL_REGISTRY).unwrap();

    assert_eq!(registry.api_version, ApiVersion::V1);
    assert_eq!(registry.run.deadline, Some(Duration::from_secs(30)));
    assert_eq!(registry.run.probe_jitter, JitterMode::Equal);
    assert_eq!(registry.services.len(), 3);

    let db = &registry.services[0];
    assert_eq!(db.name, "db");
    assert!(db.requires.is_empty());
    assert_eq!(
        db.probe.target,
        ProbeTarget::Connectivity {
            address: "127.0.0.1:5432".to_string()
        }
    );
    assert_eq!(db.probe.interval, Duration::from_secs(2));
    assert_eq!(db.probe.timeout, Duration::from_millis(500));
    assert_eq!(db.probe.success_threshold, 2);
    assert_eq!(db.probe.retries, 5);
    assert_eq!(db.probe.start_period, Duration::from_secs(3));

    let api = &registry.services[1];
    assert_eq!(api.requires, vec!["db".to_string()]);
    assert_eq!(
        api.probe.target,
        ProbeTarget::Handshake {
            url: "http://127.0.0.1:8080/health".to_string(),
            expect_status: Some(200),
        }
    );

    let worker = &registry.services[2];
    assert_eq!(
        worker.probe.target,
        ProbeTarget::Command {
            program: "pg_isready".to_string(),
            args: vec!["-q".to_string()],
        }
    );
}

#[test]
fn probe_defaults_are_applied() {
    let registry = parse(
        r#"
api_version: v1
services:
  - name: db
    probe:
      type: tcp
      address: localhost:5432
"#,
    )
    .unwrap();

    let probe = &registry.services[0].probe;
    assert_eq!(probe.interval, Duration::from_secs(2));
    assert_eq!(probe.timeout, Duration::from_millis(500));
    assert_eq!(probe.success_threshold, 1);
    assert_eq!(probe.retries, 3);
    assert_eq!(probe.start_period, Duration::ZERO);
    assert_eq!(probe.jitter, None);
}

#[test]
fn requires_are_deduplicated_and_sorted() {
    let registry = parse(
        r#"
api_version: v1
services:
  - name: db
    probe: { type: tcp, address: "localhost:5432" }
  - name: cache
    probe: { type: tcp, address: "localhost:6379" }
  - name: api
    requires: [db, cache, db]
    probe: { type: tcp, address: "localhost:8080" }
"#,
    )
    .unwrap();

    let api = registry
        .services
        .iter()
        .find(|service| service.name == "api")
        .unwrap();
    assert_eq!(api.requires, vec!["cache".to_string(), "db".to_string()]);
}

#[test]
fn api_version_is_required_and_checked() {
    let message = validation_message(
        r#"
services:
  - name: db
    probe: { type: tcp, address: "localhost:5432" }
"#,
    );
    assert!(message.contains("api_version is required"), "{message}");

    let message = validation_message(
        r#"
api_version: v9
services:
  - name: db
    probe: { type: tcp, address: "localhost:5432" }
"#,
    );
    assert!(message.contains("`v9` is not supported"), "{message}");
}

#[test]
fn empty_registry_is_rejected() {
    let message = validation_message("api_version: v1\nservices: []\n");
    assert!(message.contains("at least one service is required"), "{message}");
}

#[test]
fn unknown_keys_are_rejected() {
    let message = validation_message(
        r#"
api_version: v1
servces: oops
services:
  - name: db
    color: blue
    probe:
      type: tcp
      address: "localhost:5432"
      frequency: 2s
"#,
    );
    assert!(message.contains("unknown top-level key \"servces\""), "{message}");
    assert!(message.contains("unknown key \"color\""), "{message}");
    assert!(message.contains("unknown probe key \"frequency\""), "{message}");
}

#[test]
fn duplicate_and_self_referencing_services_are_rejected() {
    let message = validation_message(
        r#"
api_version: v1
services:
  - name: db
    probe: { type: tcp, address: "localhost:5432" }
  - name: db
    probe: { type: tcp, address: "localhost:5433" }
  - name: api
    requires: [api]
    probe: { type: tcp, address: "localhost:8080" }
"#,
    );
    assert!(message.contains("duplicate service name"), "{message}");
    assert!(message.contains("cannot require itself"), "{message}");
}

#[test]
fn probe_target_shapes_are_validated() {
    let message = validation_message(
        r#"
api_version: v1
services:
  - name: a
    probe: { type: tcp }
  - name: b
    probe: { type: http, url: "not a url" }
  - name: c
    probe: { type: http, url: "http://localhost/health", expect_status: 42 }
  - name: d
    probe: { type: command, command: [] }
  - name: e
    probe: { type: carrier-pigeon }
  - name: f
    probe: {}
"#,
    );
    assert!(message.contains("tcp probe requires a non-empty address"), "{message}");
    assert!(message.contains("invalid probe url"), "{message}");
    assert!(message.contains("expect_status 42 is not a valid HTTP status"), "{message}");
    assert!(message.contains("command probe requires a non-empty argv list"), "{message}");
    assert!(message.contains("unknown probe type `carrier-pigeon`"), "{message}");
    assert!(message.contains("probe type is required"), "{message}");
}

#[test]
fn probe_timing_is_validated() {
    let message = validation_message(
        r#"
api_version: v1
services:
  - name: a
    probe:
      type: tcp
      address: "localhost:1"
      interval: 1s
      timeout: 2s
  - name: b
    probe:
      type: tcp
      address: "localhost:1"
      interval: soon
  - name: c
    probe:
      type: tcp
      address: "localhost:1"
      success_threshold: 0
      retries: 0
"#,
    );
    assert!(
        message.contains("timeout (2s) must be strictly shorter than interval (1s)"),
        "{message}"
    );
    assert!(message.contains("error parsing interval `soon`"), "{message}");
    assert!(message.contains("success_threshold must be at least 1"), "{message}");
    assert!(message.contains("retries must be at least 1"), "{message}");
}

#[test]
fn run_section_is_validated() {
    let message = validation_message(
        r#"
api_version: v1
run:
  deadline: 0s
  probe_jitter: sometimes
  retries: 3
services:
  - name: db
    probe: { type: tcp, address: "localhost:5432" }
"#,
    );
    assert!(message.contains("deadline must be greater than zero"), "{message}");
    assert!(message.contains("unknown jitter mode `sometimes`"), "{message}");
    assert!(message.contains("error[run]: unknown key \"retries\""), "{message}");
}

#[test]
fn malformed_yaml_is_a_parse_error() {
    let result = parse("api_version: [v1\n");
    assert!(matches!(result, Err(RegistryConfigError::Parse(_))));
}
