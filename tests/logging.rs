use featforge::logging::{self, LoggingConfig};

#[test]
fn logging_initialization_is_idempotent() {
    let config = LoggingConfig::default();
    logging::init_logging(&config).expect("first initialization succeeds");
    logging::init_logging(&config).expect("subsequent initialization succeeds");
}

#[test]
fn log_file_is_named_after_the_day() {
    let config = LoggingConfig {
        directory: Some(".logs".into()),
        ..LoggingConfig::default()
    };
    let file = config.log_file().expect("directory configured");
    assert!(file.starts_with(".logs"));
    assert_eq!(file.extension().and_then(|ext| ext.to_str()), Some("log"));
    assert!(LoggingConfig::default().log_file().is_none());
}
