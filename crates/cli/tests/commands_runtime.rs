use std::env;
use std::sync::{Mutex, OnceLock};

use concierge_cli::commands::chat::{self, ChatRequest};
use concierge_cli::commands::{config, doctor, migrate};
use serde_json::Value;

#[test]
fn migrate_applies_pending_migrations_with_valid_env() {
    with_env(&[("CONCIERGE_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["data"]["applied"], 2);
    });
}

#[test]
fn migrate_returns_config_failure_for_invalid_threshold() {
    with_env(&[("CONCIERGE_ROUTING_ESCALATION_THRESHOLD", "-3")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn doctor_reports_warnings_for_offline_provider_and_fresh_schema() {
    with_env(&[("CONCIERGE_DATABASE_URL", "sqlite::memory:")], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 0, "warnings should not fail doctor");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["overall_status"], "warn");
        let checks = payload["checks"].as_array().expect("checks array");
        let status_of = |name: &str| {
            checks
                .iter()
                .find(|check| check["name"] == name)
                .map(|check| check["status"].clone())
                .unwrap_or(Value::Null)
        };
        assert_eq!(status_of("config_validation"), "pass");
        assert_eq!(status_of("generation_provider"), "warn");
        assert_eq!(status_of("database_connectivity"), "pass");
        assert_eq!(status_of("migrations"), "warn");
    });
}

#[test]
fn doctor_fails_and_skips_dependent_checks_on_invalid_config() {
    with_env(&[("CONCIERGE_LLM_PROVIDER", "carrier-pigeon")], || {
        let result = doctor::run(false);
        assert_eq!(result.exit_code, 1);
        assert!(result.output.starts_with("doctor: one or more readiness checks failed"));
        assert!(result.output.contains("- [fail] config_validation"));
        assert!(result.output.contains("- [skip] database_connectivity"));
    });
}

#[test]
fn config_attributes_sources_and_redacts_api_key() {
    with_env(
        &[("CONCIERGE_LLM_API_KEY", "sk-live-do-not-print"), ("CONCIERGE_SERVER_PORT", "9191")],
        || {
            let output = config::run();

            assert!(output.contains(
                "- llm.api_key = sk-*** (source: env (CONCIERGE_LLM_API_KEY))"
            ));
            assert!(!output.contains("do-not-print"));
            assert!(output.contains("- server.port = 9191 (source: env (CONCIERGE_SERVER_PORT))"));
            assert!(output.contains("- routing.escalation_threshold = -0.5 (source: default)"));
            assert!(output.contains("- rate_limits.free.capacity = 20 (source: default)"));
            assert!(output.contains("- rate_limits.hourly.pro.capacity = 1000 (source: default)"));
            assert!(output.contains("- routing.negative_score_floor = 0 (source: default)"));
        },
    );
}

#[test]
fn chat_routes_turns_through_the_offline_router() {
    with_env(&[], || {
        let result = chat::run(request("pro", &["hi there", "where is my order 1042?"]));
        assert_eq!(result.exit_code, 0, "unexpected output: {}", result.output);

        assert!(result.output.starts_with("you> hi there\n"));
        assert!(result.output.contains("order_management> Order #1042"));

        let payload = parse_payload(last_line(&result.output));
        assert_eq!(payload["command"], "chat");
        assert_eq!(payload["status"], "ok");
        let turns = payload["data"]["turns"].as_array().expect("turns array");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0]["sequence_number"], 1);
        assert_eq!(turns[1]["sequence_number"], 3);
        assert_eq!(turns[1]["speaker"], "order_management");
        assert!(turns[1]["reply"].as_str().is_some_and(|r| r.contains("1Z999AA10123456784")));
    });
}

#[test]
fn chat_keeps_answering_with_escalation_notice_after_handoff_request() {
    with_env(&[], || {
        let result =
            chat::run(request("enterprise", &["let me talk to a human", "hello? anyone?"]));
        assert_eq!(result.exit_code, 0, "unexpected output: {}", result.output);

        let payload = parse_payload(last_line(&result.output));
        let turns = payload["data"]["turns"].as_array().expect("turns array");
        assert!(turns.iter().all(|turn| turn["escalated"] == true));
        assert_eq!(turns[0]["state"], "escalating");
        assert_eq!(turns[1]["state"], "escalating");
    });
}

#[test]
fn chat_stops_at_admission_rejection() {
    with_env(&[("CONCIERGE_RATE_LIMITS_FREE_REFILL_PER_SEC", "0.01")], || {
        let messages = ["one", "two", "three"];
        let result = chat::run(ChatRequest {
            messages: std::iter::repeat(messages).flatten().take(21).map(String::from).collect(),
            ..request("free", &[])
        });
        assert_eq!(result.exit_code, 4);

        let payload = parse_payload(last_line(&result.output));
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "rate_limited");
        assert_eq!(result.output.matches("you> ").count(), 20);
    });
}

#[test]
fn chat_rejects_unknown_tier() {
    with_env(&[], || {
        let result = chat::run(request("platinum", &["hi"]));
        assert_eq!(result.exit_code, 2);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["error_class"], "invalid_argument");
    });
}

fn request(tier: &str, messages: &[&str]) -> ChatRequest {
    ChatRequest {
        caller: "cli-caller".to_string(),
        tier: tier.to_string(),
        channel: "chat".to_string(),
        messages: messages.iter().map(ToString::to_string).collect(),
    }
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn last_line(output: &str) -> &str {
    output.lines().last().unwrap_or_default()
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "CONCIERGE_DATABASE_URL",
        "CONCIERGE_DATABASE_MAX_CONNECTIONS",
        "CONCIERGE_DATABASE_TIMEOUT_SECS",
        "CONCIERGE_LLM_PROVIDER",
        "CONCIERGE_LLM_API_KEY",
        "CONCIERGE_LLM_BASE_URL",
        "CONCIERGE_LLM_MODEL",
        "CONCIERGE_LLM_TIMEOUT_SECS",
        "CONCIERGE_LLM_MAX_RETRIES",
        "CONCIERGE_LLM_TEMPERATURE",
        "CONCIERGE_SERVER_BIND_ADDRESS",
        "CONCIERGE_SERVER_PORT",
        "CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "CONCIERGE_ROUTING_COMPANY_NAME",
        "CONCIERGE_ROUTING_ESCALATION_THRESHOLD",
        "CONCIERGE_ROUTING_SENTIMENT_ALPHA",
        "CONCIERGE_ROUTING_NEGATIVE_SCORE_FLOOR",
        "CONCIERGE_ROUTING_MAX_TURNS",
        "CONCIERGE_ROUTING_TURN_TIMEOUT_SECS",
        "CONCIERGE_ROUTING_INACTIVITY_TIMEOUT_SECS",
        "CONCIERGE_RATE_LIMITS_ENABLED",
        "CONCIERGE_RATE_LIMITS_FREE_CAPACITY",
        "CONCIERGE_RATE_LIMITS_FREE_REFILL_PER_SEC",
        "CONCIERGE_RATE_LIMITS_PRO_HOURLY_CAPACITY",
        "CONCIERGE_LOGGING_LEVEL",
        "CONCIERGE_LOGGING_FORMAT",
        "CONCIERGE_LOG_LEVEL",
        "CONCIERGE_LOG_FORMAT",
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
