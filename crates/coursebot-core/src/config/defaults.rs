pub(super) fn default_name() -> String {
    "coursebot".to_string()
}
pub(super) fn default_data_dir() -> String {
    "~/.coursebot".to_string()
}
pub(super) fn default_log_level() -> String {
    "info".to_string()
}
pub(super) fn default_db_path() -> String {
    "~/.coursebot/data/coursebot.db".to_string()
}
/// Every two hours.
pub(super) fn default_reconcile_hours() -> Vec<u32> {
    (0..24).step_by(2).collect()
}
/// Every eight hours.
pub(super) fn default_entity_sweep_hours() -> Vec<u32> {
    vec![0, 8, 16]
}
pub(super) fn default_horizon_margin_secs() -> u64 {
    300
}
pub(super) fn default_long_poll_timeout_secs() -> u64 {
    25
}
pub(super) fn default_reconnect_backoff_secs() -> u64 {
    5
}
pub(super) fn default_fresh_register_days() -> i64 {
    5
}
pub(super) fn default_school_name() -> String {
    "Course school".to_string()
}
pub(super) fn default_vk_api_version() -> String {
    "5.131".to_string()
}
pub(super) fn default_telegram_reset_keywords() -> Vec<String> {
    [
        "start", "/start", "/admin", "начать", "старт", "+", "☰ menu", "/menu",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
pub(super) fn default_vk_reset_keywords() -> Vec<String> {
    ["start", "/start", "начать", "старт", "+"]
        .into_iter()
        .map(String::from)
        .collect()
}
