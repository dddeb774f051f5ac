use groupq::Error;
use groupq::config::Config;
use secrecy::ExposeSecret;

// Environment variables are process-global, so every scenario runs in one
// test to keep them from racing.
#[test]
fn config_from_env() {
    let vars = [
        "REDIS_URL",
        "GROUPQ_NAMESPACE",
        "GROUPQ_VISIBILITY_TIMEOUT_MS",
        "GROUPQ_MAX_ATTEMPTS",
    ];
    unsafe {
        for var in vars {
            std::env::remove_var(var);
        }
    }

    // Missing REDIS_URL.
    assert!(matches!(Config::from_env(), Err(Error::Config(_))));

    // Defaults.
    unsafe {
        std::env::set_var("REDIS_URL", "redis://:hunter2@localhost:6379/0");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.redis_url.expose_secret(), "redis://:hunter2@localhost:6379/0");
    assert_eq!(config.namespace, "default");
    assert!(!config.log_level.is_empty());
    assert!(
        !format!("{config:?}").contains("hunter2"),
        "credentials must not appear in debug output"
    );
    let options = config.queue_options();
    assert_eq!(options.visibility_timeout_ms, 30_000);
    assert_eq!(options.max_attempts, 3);

    // Overrides.
    unsafe {
        std::env::set_var("GROUPQ_NAMESPACE", "sessions");
        std::env::set_var("GROUPQ_VISIBILITY_TIMEOUT_MS", "1500");
        std::env::set_var("GROUPQ_MAX_ATTEMPTS", "7");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.namespace, "sessions");
    let options = config.queue_options();
    assert_eq!(options.visibility_timeout_ms, 1_500);
    assert_eq!(options.max_attempts, 7);

    // Malformed numbers are rejected rather than ignored.
    unsafe {
        std::env::set_var("GROUPQ_MAX_ATTEMPTS", "lots");
    }
    match Config::from_env() {
        Err(Error::Config(msg)) => assert!(msg.contains("GROUPQ_MAX_ATTEMPTS"), "{msg}"),
        other => panic!("expected a config error, got {other:?}"),
    }

    unsafe {
        for var in vars {
            std::env::remove_var(var);
        }
    }
}
