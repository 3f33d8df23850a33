use super::*;
use crate::message::ChannelKind;

#[test]
fn test_scheduler_config_default() {
    let sc = SchedulerConfig::default();
    assert_eq!(sc.reconcile_hours.len(), 12);
    assert_eq!(sc.reconcile_hours[1], 2);
    assert_eq!(sc.entity_sweep_hours, vec![0, 8, 16]);
    assert_eq!(sc.horizon_margin_secs, 300);
    assert_eq!(sc.clock_offset_hours, 0);
    assert_eq!(sc.fresh_register_days, 5);
}

#[test]
fn test_session_config_default() {
    let sc = SessionConfig::default();
    assert_eq!(sc.long_poll_timeout_secs, 25);
    assert_eq!(sc.reconnect_backoff_secs, 5);
}

#[test]
fn test_full_config_from_toml() {
    let toml_str = r#"
        [bot]
        data_dir = "/tmp/coursebot"

        [scheduler]
        reconcile_hours = [3, 15]
        clock_offset_hours = 5

        [session]
        reconnect_backoff_secs = 1

        [school]
        address = "Main st. 1"

        [channel.telegram]
        enabled = true
        bot_token = "abc"

        [channel.vk]
        enabled = true
        group_id = 42
        reset_keywords = ["Menu"]
    "#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.bot.data_dir, "/tmp/coursebot");
    assert_eq!(config.bot.log_level, "info");
    assert_eq!(config.scheduler.reconcile_hours, vec![3, 15]);
    assert_eq!(config.scheduler.entity_sweep_hours, vec![0, 8, 16]);
    assert_eq!(config.scheduler.clock_offset(), chrono::Duration::hours(5));
    assert_eq!(config.session.reconnect_backoff_secs, 1);
    assert_eq!(config.session.long_poll_timeout_secs, 25);
    assert_eq!(config.school.address, "Main st. 1");

    let tg = config.channel.telegram.as_ref().unwrap();
    assert_eq!(tg.bot_token, "abc");
    assert!(tg.reset_keywords.contains(&"/start".to_string()));

    let vk = config.channel.vk.as_ref().unwrap();
    assert_eq!(vk.api_version, "5.131");
    assert_eq!(vk.group_id, 42);
    assert_eq!(
        config.channel.reset_keywords(ChannelKind::Vk),
        vec!["menu".to_string()]
    );
    assert_eq!(
        config.channel.enabled(),
        vec![ChannelKind::Telegram, ChannelKind::Vk]
    );
}

#[test]
fn test_reset_keywords_fall_back_when_channel_missing() {
    let config = Config::default();
    let tg = config.channel.reset_keywords(ChannelKind::Telegram);
    assert!(tg.contains(&"/menu".to_string()));
    assert!(tg.contains(&"☰ menu".to_string()));
    let vk = config.channel.reset_keywords(ChannelKind::Vk);
    assert!(!vk.contains(&"/admin".to_string()));
    assert!(vk.contains(&"начать".to_string()));
    assert!(config.channel.enabled().is_empty());
}

#[test]
fn test_admin_identity_ignores_empty() {
    let mut config = Config::default();
    config.channel.telegram = Some(TelegramConfig {
        admin_identity: Some(String::new()),
        ..Default::default()
    });
    assert_eq!(config.channel.admin_identity(ChannelKind::Telegram), None);
    config.channel.vk = Some(VkConfig {
        admin_identity: Some("100".into()),
        ..Default::default()
    });
    assert_eq!(
        config.channel.admin_identity(ChannelKind::Vk),
        Some("100".to_string())
    );
}

#[test]
fn test_env_overrides_create_channel_sections() {
    let mut config = Config::default();
    config.apply_overrides(Some("tg-token".into()), Some(String::new()));
    assert_eq!(config.channel.telegram.unwrap().bot_token, "tg-token");
    assert!(config.channel.vk.is_none());
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let config = load("/nonexistent/__coursebot_test__/config.toml").unwrap();
    assert_eq!(config.bot.name, "coursebot");
    assert_eq!(config.store.db_path, "~/.coursebot/data/coursebot.db");
}

#[test]
fn test_load_rejects_malformed_file() {
    let tmp = std::env::temp_dir().join("__coursebot_test_bad_config__.toml");
    std::fs::write(&tmp, "[scheduler\nreconcile_hours = ").unwrap();
    let err = load(tmp.to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("failed to parse config"));
    let _ = std::fs::remove_file(&tmp);
}

#[test]
fn test_shellexpand_home() {
    std::env::set_var("HOME", "/home/test");
    assert_eq!(shellexpand("~/x/y"), "/home/test/x/y");
    assert_eq!(shellexpand("/abs"), "/abs");
}
