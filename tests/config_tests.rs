use concentrator::core::DownsamplingMethod;
use concentrator::engine::{ConcentratorConfig, ConfigError};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_load_partial_config_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("concentrator.json");

    fs::write(
        &path,
        r#"{
            "frames_per_second": 60,
            "lag_time": 0.25,
            "downsampling_method": "Closest",
            "maximum_publication_timeout_ms": 50
        }"#,
    )
    .unwrap();

    let config = ConcentratorConfig::from_file(&path).unwrap();
    assert_eq!(config.frames_per_second, 60);
    assert_eq!(config.lag_time, 0.25);
    assert_eq!(config.lead_time, 1.0);
    assert_eq!(config.downsampling_method, DownsamplingMethod::Closest);

    let settings = config.validate().unwrap();
    assert_eq!(settings.maximum_publication_timeout, Duration::from_millis(50));
    assert!(settings.allow_preemptive_publishing);
}

#[test]
fn test_missing_file_reports_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.json");

    let error = ConcentratorConfig::from_file(&path).unwrap_err();
    assert!(format!("{:#}", error).contains("absent.json"));
}

#[test]
fn test_malformed_file_fails_to_parse() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.json");
    fs::write(&path, "{ \"lag_time\": ").unwrap();

    assert!(ConcentratorConfig::from_file(&path).is_err());
}

#[test]
fn test_json_value_config() {
    let config = ConcentratorConfig::from_json(serde_json::json!({
        "frames_per_second": 0
    }))
    .unwrap();

    assert!(matches!(config.validate(), Err(ConfigError::InvalidFrameRate)));

    let error = ConcentratorConfig::from_json(serde_json::json!({ "lag_time": "soon" })).unwrap_err();
    assert!(matches!(error, ConfigError::Parse(_)));
}
