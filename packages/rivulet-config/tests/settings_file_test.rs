use rivulet_config::{
    ConfigError, CustomProxy, DuplicateAction, ProxyKind, ProxySettings, Settings, SoundSettings,
};
use tempfile::TempDir;

#[test]
fn test_load_missing_file_returns_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let settings = Settings::load(&temp_dir.path().join("settings.json")).unwrap();
    assert_eq!(settings, Settings::default());
}

#[test]
fn test_save_and_load() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("settings.json");

    let settings = Settings::new()
        .with_max_connections(16)
        .with_duplicate_action(DuplicateAction::ShowCompleteDialogOrResume)
        .with_sounds(SoundSettings::muted())
        .with_proxy(ProxySettings::Custom(CustomProxy {
            kind: ProxyKind::Http,
            host: "proxy.local".to_string(),
            port: 3128,
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
        }));
    settings.save(&path).unwrap();

    let loaded = Settings::load(&path).unwrap();
    assert_eq!(loaded, settings);
}

#[test]
fn test_load_rejects_invalid_values() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("settings.json");
    std::fs::write(&path, r#"{"max_connections": 0}"#).unwrap();

    let result = Settings::load(&path);
    assert!(matches!(result, Err(ConfigError::Invalid { .. })));
}

#[test]
fn test_load_rejects_malformed_json() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("settings.json");
    std::fs::write(&path, "{ not json").unwrap();

    assert!(matches!(Settings::load(&path), Err(ConfigError::Json(_))));
}
