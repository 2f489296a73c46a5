use std::io::Write;

use watch_node::config::{AppConfig, NotifyKind};

#[test]
fn app_config_env_overrides_env_refs() {
    std::env::set_var("WATCH_TEST_BSCSCAN", "from-ref");
    std::env::set_var("TOKEN", "123:override");

    let mut f = tempfile::NamedTempFile::new().unwrap();
    write!(
        f,
        r#"
[storage]
path = "/tmp/watch-test"

[upstream]
base_url = "https://api.bscscan.com"
api_key = "env:WATCH_TEST_BSCSCAN"
timeout_ms = 5000

[reconcile]
interval_secs = 30
observation_window_secs = 0
notify_timeout_ms = 2000

[notify]
kind = "telegram"
bot_token = "env:IGNORED_BECAUSE_TOKEN_IS_SET"
api_base = "https://api.telegram.org"

[api]
listen_addr = "0.0.0.0:9000"
max_subscriptions_per_subscriber = 5
"#
    )
    .unwrap();

    let cfg = AppConfig::from_toml(f.path()).unwrap();
    assert_eq!(cfg.upstream.api_key.as_deref(), Some("from-ref"));
    assert_eq!(cfg.notify.kind, NotifyKind::Telegram);
    assert_eq!(cfg.notify.bot_token.as_deref(), Some("123:override"));
    assert_eq!(cfg.reconciler().observation_window_ms, 0);
    assert_eq!(cfg.registry().max_subscriptions_per_subscriber, 5);
}

#[test]
fn telegram_without_token_is_rejected() {
    let mut cfg = AppConfig::from_toml_str("").unwrap();
    cfg.notify.kind = NotifyKind::Telegram;
    cfg.notify.bot_token = None;
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("bot_token"));

    cfg.notify.bot_token = Some("123:abc".to_string());
    assert!(cfg.validate().is_ok());
}

#[test]
fn missing_file_is_reported() {
    let err = AppConfig::from_toml(std::path::Path::new("/nonexistent/watch.toml")).unwrap_err();
    assert!(format!("{err:#}").contains("failed reading config file"));
}

#[test]
fn partial_reconcile_section_parses() {
    let cfg = AppConfig::from_toml_str("[reconcile]\ninterval_secs = 30\n").unwrap();
    assert_eq!(cfg.reconciler().interval, std::time::Duration::from_secs(30));
    assert_eq!(cfg.reconciler().observation_window_ms, 86_400_000);
}
