use std::env;
use std::sync::{Mutex, OnceLock};

use serde_json::Value;
use vocario_cli::commands::{doctor, migrate};

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("VOCARIO_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert!(payload["message"].as_str().unwrap_or_default().contains("migration(s) applied"));
    });
}

#[test]
fn migrate_returns_config_failure_for_incomplete_whatsapp_setup() {
    with_env(
        &[("VOCARIO_DATABASE_URL", "sqlite::memory:"), ("VOCARIO_WHATSAPP_ENABLED", "true")],
        || {
            let result = migrate::run();
            assert_eq!(result.exit_code, 2, "expected config validation failure code");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "migrate");
            assert_eq!(payload["status"], "error");
            assert_eq!(payload["error_class"], "config_validation");
        },
    );
}

#[test]
fn doctor_json_lists_every_check() {
    with_env(&[("VOCARIO_DATABASE_URL", "sqlite::memory:")], || {
        let result = doctor::run(true);
        let payload = parse_payload(&result.output);

        let names: Vec<&str> = payload["checks"]
            .as_array()
            .expect("checks array")
            .iter()
            .filter_map(|check| check["name"].as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "config_validation",
                "whatsapp_delivery",
                "email_delivery",
                "pdf_converter",
                "database_connectivity"
            ]
        );
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
        "VOCARIO_DATABASE_URL",
        "VOCARIO_DATABASE_MAX_CONNECTIONS",
        "VOCARIO_DATABASE_TIMEOUT_SECS",
        "VOCARIO_WHATSAPP_ENABLED",
        "VOCARIO_WHATSAPP_ACCOUNT_SID",
        "VOCARIO_WHATSAPP_AUTH_TOKEN",
        "VOCARIO_WHATSAPP_SENDER",
        "VOCARIO_EMAIL_ENABLED",
        "VOCARIO_EMAIL_API_KEY",
        "VOCARIO_LLM_PROVIDER",
        "VOCARIO_LLM_API_KEY",
        "VOCARIO_LLM_BASE_URL",
        "VOCARIO_LLM_LINE_ITEM_EXTRACTION",
        "VOCARIO_SERVER_PORT",
        "VOCARIO_LOGGING_LEVEL",
        "VOCARIO_LOGGING_FORMAT",
        "VOCARIO_LOG_LEVEL",
        "VOCARIO_LOG_FORMAT",
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
