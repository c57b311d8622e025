use super::GatewayConfig;
use std::time::Duration;

#[test]
fn test_defaults_validate() {
    let cfg = GatewayConfig::default();
    cfg.validate().unwrap();
    assert_eq!(cfg.proxy.path_prefix, "/");
    assert_eq!(cfg.store.backend, "redis");
    assert_eq!(cfg.limiter.limit, 100);
    assert_eq!(cfg.limiter.window, Duration::from_secs(60));
}

#[test]
fn test_load_toml_with_duration_strings() {
    let toml = r#"
[proxy]
path_prefix = "/api"
trust_forwarded_for = true
request_timeout = "15s"

[upstream]
url = "http://10.0.0.5:8081/base"
connect_timeout = "500ms"

[store]
backend = "memory"
timeout = "2s"

[limiter]
limit = 50
window = "30s"

[analytics]
enabled = false
batch_size = 100
flush_interval = "5s"
"#;
    let tmp = std::env::temp_dir().join("portcullis_test_config.toml");
    std::fs::write(&tmp, toml).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    std::fs::remove_file(&tmp).ok();

    assert_eq!(cfg.proxy.path_prefix, "/api");
    assert!(cfg.proxy.trust_forwarded_for);
    assert_eq!(cfg.proxy.request_timeout, Duration::from_secs(15));
    assert_eq!(cfg.upstream.url, "http://10.0.0.5:8081/base");
    assert_eq!(cfg.upstream.connect_timeout, Duration::from_millis(500));
    assert_eq!(cfg.store.backend, "memory");
    assert_eq!(cfg.limiter.limit, 50);
    assert_eq!(cfg.limiter.window, Duration::from_secs(30));
    assert!(!cfg.analytics.enabled);
    assert_eq!(cfg.analytics.batch_size, 100);
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "upstream": { "url": "https://backend.internal:8443" },
        "store": { "backend": "memory" },
        "limiter": { "limit": 10, "window": "1m" }
    }"#;
    let tmp = std::env::temp_dir().join("portcullis_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    std::fs::remove_file(&tmp).ok();

    assert_eq!(cfg.upstream.url, "https://backend.internal:8443");
    assert_eq!(cfg.limiter.window, Duration::from_secs(60));
}

#[test]
fn test_validate_bad_prefix_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.proxy.path_prefix = "api".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_bad_backend_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.store.backend = "memcached".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_limit_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.limiter.limit = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_window_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.limiter.window = Duration::ZERO;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_malformed_upstream_url_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.upstream.url = "not a url".into();
    assert!(cfg.validate().is_err());

    cfg.upstream.url = "ftp://host:21".into();
    assert!(cfg.validate().is_err());
}
