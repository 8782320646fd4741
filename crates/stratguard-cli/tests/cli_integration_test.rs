//! End-to-end tests of the command implementations against real files.

use std::path::{Path, PathBuf};
use stratguard_cli::commands::audit::{self, AuditQuery};
use stratguard_cli::commands::run::{self, RunArgs};
use stratguard_cli::commands::{analyze, load_config};
use stratguard_cli::{ExitCode, OutputFormat};
use stratguard_core::{GuardConfig, RiskLevel};
use tempfile::TempDir;

const RISING: &str = "
class Rising:
    def generate_signals(self, data):
        out = {}
        for i in range(1, len(data)):
            if data.close[i] > data.close[i - 1]:
                out[i] = 1.0
            else:
                out[i] = -1.0
        return out
";

const SPIN: &str = "
class Spin:
    def generate_signals(self, data):
        n = 0
        while True:
            n = n + 1
        return {}
";

fn write(dir: &TempDir, name: &str, text: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, text).unwrap();
    path
}

fn config_with_audit(dir: &TempDir) -> (GuardConfig, PathBuf) {
    let log = dir.path().join("audit.jsonl");
    let config_file = write(
        dir,
        "stratguard.toml",
        &format!(
            "audit_log_path = \"{}\"\ncpu_limit_seconds = 1000.0\nwall_clock_timeout_seconds = 0.5\n",
            log.display()
        ),
    );
    let (config, _) = load_config(Some(&config_file)).unwrap();
    (config, log)
}

fn run_args(file: &Path, class: &str, data: &Path) -> RunArgs {
    RunArgs {
        file: file.to_path_buf(),
        class_name: class.to_string(),
        data: data.to_path_buf(),
        op: "generate_signals".to_string(),
        id: None,
        source_type: "custom".to_string(),
        strict_mode: true,
    }
}

#[tokio::test]
async fn test_run_then_audit_verifies() {
    let dir = TempDir::new().unwrap();
    let (config, log) = config_with_audit(&dir);
    let strategy = write(&dir, "rising.py", RISING);
    let prices = write(&dir, "prices.json", "[10.0, 10.5, 10.2, 10.9]");

    let code = run::run(run_args(&strategy, "Rising", &prices), &config, OutputFormat::Json)
        .await
        .unwrap();
    assert_eq!(code, ExitCode::SUCCESS);

    let view = audit::query(
        &log,
        &AuditQuery {
            verify: true,
            ..AuditQuery::default()
        },
    )
    .unwrap();
    let kinds: Vec<&str> = view.events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        kinds,
        ["load_attempt", "load_success", "execution_start", "execution_end"]
    );
    assert_eq!(view.events[0].subject_id, "rising");
    assert_eq!(view.events[3].outcome, "ok");
    assert!(view.chain.unwrap().valid);
}

#[tokio::test]
async fn test_rejected_code_exits_rejected() {
    let dir = TempDir::new().unwrap();
    let (config, log) = config_with_audit(&dir);
    let strategy = write(&dir, "evil.py", "import os\nclass Evil:\n    pass\n");
    let prices = write(&dir, "prices.json", "[1.0, 2.0]");

    let code = run::run(run_args(&strategy, "Evil", &prices), &config, OutputFormat::Json)
        .await
        .unwrap();
    assert_eq!(code, ExitCode::REJECTED);

    let violations = audit::query(
        &log,
        &AuditQuery {
            event_type: Some("security_violation".to_string()),
            ..AuditQuery::default()
        },
    )
    .unwrap();
    assert_eq!(violations.events.len(), 1);
}

#[tokio::test]
async fn test_runaway_loop_exits_limit_exceeded() {
    let dir = TempDir::new().unwrap();
    let (config, log) = config_with_audit(&dir);
    let strategy = write(&dir, "spin.py", SPIN);
    let prices = write(&dir, "prices.json", "[1.0]");

    let code = run::run(run_args(&strategy, "Spin", &prices), &config, OutputFormat::Json)
        .await
        .unwrap();
    assert_eq!(code, ExitCode::LIMIT_EXCEEDED);

    let ends = audit::query(
        &log,
        &AuditQuery {
            event_type: Some("execution_end".to_string()),
            ..AuditQuery::default()
        },
    )
    .unwrap();
    assert_eq!(ends.events[0].outcome, "timeout");
}

#[tokio::test]
async fn test_builtin_run_and_bad_params() {
    let dir = TempDir::new().unwrap();
    let (config, _) = config_with_audit(&dir);
    let prices = write(&dir, "prices.json", "[1.0, 2.0, 3.0, 2.0, 1.0, 2.0]");

    let params = write(&dir, "mac.json", r#"{"fast": 2, "slow": 3}"#);
    let mut args = run_args(&params, "MovingAverageCross", &prices);
    args.source_type = "builtin".to_string();
    let code = run::run(args.clone(), &config, OutputFormat::Json).await.unwrap();
    assert_eq!(code, ExitCode::SUCCESS);

    args.file = write(&dir, "bad.json", r#"{"fast": 5, "slow": 3}"#);
    let code = run::run(args, &config, OutputFormat::Json).await.unwrap();
    assert_eq!(code, ExitCode::INVALID_INPUT);
}

#[tokio::test]
async fn test_unknown_operation_is_an_error() {
    let dir = TempDir::new().unwrap();
    let strategy = write(&dir, "rising.py", RISING);
    let prices = write(&dir, "prices.json", "[1.0]");
    let mut args = run_args(&strategy, "Rising", &prices);
    args.op = "rebalance".to_string();
    let err = run::run(args, &GuardConfig::default(), OutputFormat::Json)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid --op"));
}

#[test]
fn test_analyze_lenient_attaches_warnings() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "peek.py", &format!("import inspect\n{RISING}"));

    let lenient = analyze::analyze(&file, false, &GuardConfig::default()).unwrap();
    assert!(lenient.admitted);
    assert_eq!(lenient.risk_level, RiskLevel::Medium);
    assert!(!lenient.violations.is_empty());

    let code = analyze::run(&file, true, &GuardConfig::default(), OutputFormat::Pretty).unwrap();
    assert_eq!(code, ExitCode::REJECTED);
}
