//! Configuration loading from disk and environment.

use taskforge_core::config::TaskForgeConfig;
use taskforge_core::error::TaskForgeError;

#[test]
fn test_load_full_file() {
    let dir = std::env::temp_dir().join(format!("taskforge-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("config.toml");
    std::fs::write(
        &path,
        r#"
[queue]
max_queue_size = 25
max_history_size = 10

[workers]
count = 2
dequeue_timeout_ms = 250

[retry]
max_attempts = 5
base_delay_ms = 100
jitter = false

[breaker]
failure_threshold = 3
cooldown_secs = 5

[approval]
timeout_secs = 3600

[verification]
pass_threshold = 85.0
max_iterations = 2

[notify]
log_events = false
webhook_url = "https://hooks.example.com/taskforge"
"#,
    )
    .unwrap();

    let config = TaskForgeConfig::load_from(&path).unwrap();
    assert_eq!(config.queue.max_queue_size, 25);
    assert_eq!(config.workers.count, 2);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.max_delay_ms, Some(10_000));
    assert!(!config.retry.jitter);
    assert_eq!(config.breaker.window_secs, 60);
    assert_eq!(config.verification.max_iterations, 2);
    assert_eq!(
        config.notify.webhook_url.as_deref(),
        Some("https://hooks.example.com/taskforge")
    );

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_missing_file_is_config_error() {
    let err = TaskForgeConfig::load_from(std::path::Path::new("/nonexistent/taskforge.toml"))
        .unwrap_err();
    assert!(matches!(err, TaskForgeError::Config(_)));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let err = TaskForgeConfig::from_toml("[queue\nmax_queue_size = 1").unwrap_err();
    assert!(matches!(err, TaskForgeError::TomlDe(_)));
}

#[test]
fn test_default_path_is_under_home() {
    let path = TaskForgeConfig::default_path();
    assert!(path.ends_with(".taskforge/config.toml"));
}
