use std::env;
use std::sync::{Mutex, OnceLock};

use banter_cli::commands::{chat, clear, doctor, history, migrate};
use serde_json::Value;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(
        &[
            ("BANTER_DATABASE_URL", "sqlite::memory:"),
            ("BANTER_DATABASE_MAX_CONNECTIONS", "1"),
        ],
        || {
            let result = migrate::run();
            assert_eq!(result.exit_code, 0, "expected successful migrate run");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "migrate");
            assert_eq!(payload["status"], "ok");
        },
    );
}

#[test]
fn migrate_returns_config_failure_with_unusable_provider_url() {
    with_env(&[("BANTER_LLM_BASE_URL", "ftp://models.internal")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn doctor_passes_all_checks_with_valid_env() {
    with_env(
        &[
            ("BANTER_DATABASE_URL", "sqlite::memory:"),
            ("BANTER_DATABASE_MAX_CONNECTIONS", "1"),
        ],
        || {
            let report: Value = serde_json::from_str(&doctor::run(true))
                .expect("doctor --json should emit valid JSON");

            assert_eq!(report["overall_status"], "pass");
            let checks = report["checks"].as_array().expect("checks should be an array");
            let names: Vec<&str> =
                checks.iter().filter_map(|check| check["name"].as_str()).collect();
            assert_eq!(names, ["config_validation", "model_registry", "database_connectivity"]);
            assert!(checks.iter().all(|check| check["status"] == "pass"));
        },
    );
}

#[test]
fn doctor_renders_human_output_with_summary_first() {
    with_env(
        &[
            ("BANTER_DATABASE_URL", "sqlite::memory:"),
            ("BANTER_DATABASE_MAX_CONNECTIONS", "1"),
        ],
        || {
            let output = doctor::run(false);
            let first_line = output.lines().next().unwrap_or_default();

            assert_eq!(first_line, "doctor: all readiness checks passed");
            assert!(output.contains("- [ok] model_registry:"));
            assert!(output.contains("- [ok] database_connectivity:"));
        },
    );
}

#[test]
fn doctor_skips_downstream_checks_when_config_is_invalid() {
    with_env(&[("BANTER_LLM_BASE_URL", "ftp://models.internal")], || {
        let report: Value =
            serde_json::from_str(&doctor::run(true)).expect("doctor --json should emit valid JSON");

        assert_eq!(report["overall_status"], "fail");
        let checks = report["checks"].as_array().expect("checks should be an array");
        assert_eq!(checks[0]["name"], "config_validation");
        assert_eq!(checks[0]["status"], "fail");
        assert_eq!(checks[1]["status"], "skipped");
        assert_eq!(checks[2]["status"], "skipped");
    });
}

#[test]
fn history_reports_an_empty_conversation() {
    with_env(
        &[
            ("BANTER_DATABASE_URL", "sqlite::memory:"),
            ("BANTER_DATABASE_MAX_CONNECTIONS", "1"),
        ],
        || {
            let result = history::run("support-1042");
            assert_eq!(result.exit_code, 0, "expected history read to succeed");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "history");
            assert_eq!(payload["status"], "ok");

            let message = payload["message"].as_str().unwrap_or("");
            assert!(message.contains("no stored messages for conversation `support-1042`"));
        },
    );
}

#[test]
fn clear_is_idempotent_across_runs() {
    with_env(
        &[
            ("BANTER_DATABASE_URL", "sqlite::memory:"),
            ("BANTER_DATABASE_MAX_CONNECTIONS", "1"),
        ],
        || {
            let first = clear::run("support-1042");
            assert_eq!(first.exit_code, 0, "expected first clear invocation success");
            let first_payload = parse_payload(&first.output);
            assert_eq!(first_payload["command"], "clear");
            assert_eq!(first_payload["status"], "ok");

            let second = clear::run("support-1042");
            assert_eq!(second.exit_code, 0, "expected second clear invocation success");
            let second_payload = parse_payload(&second.output);
            assert_eq!(second_payload["command"], "clear");
            assert_eq!(second_payload["status"], "ok");

            assert_eq!(first_payload["message"], second_payload["message"]);
        },
    );
}

#[test]
fn chat_returns_config_failure_with_unusable_provider_url() {
    with_env(&[("BANTER_LLM_BASE_URL", "ftp://models.internal")], || {
        let result = chat::run("hello", "support-1042", "operator", false);
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "chat");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "BANTER_DATABASE_URL",
        "BANTER_DATABASE_MAX_CONNECTIONS",
        "BANTER_DATABASE_TIMEOUT_SECS",
        "BANTER_LLM_BASE_URL",
        "BANTER_LLM_API_KEY",
        "BANTER_LLM_TIMEOUT_SECS",
        "BANTER_LLM_MODELS",
        "BANTER_AGENT_SYSTEM_PROMPT",
        "BANTER_AGENT_MAX_TOOL_ROUNDS",
        "BANTER_AGENT_MAX_ATTEMPTS_PER_MODEL",
        "BANTER_AGENT_RETRY_BASE_DELAY_MS",
        "BANTER_MEMORY_MODE",
        "BANTER_SERVER_BIND_ADDRESS",
        "BANTER_SERVER_HEALTH_CHECK_PORT",
        "BANTER_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "BANTER_LOGGING_LEVEL",
        "BANTER_LOGGING_FORMAT",
        "BANTER_LOG_LEVEL",
        "BANTER_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
