use groundlink::config::*;
use groundlink::error::{ConfigError, Error};
use groundlink::instrument::config::CyclicMode;
use std::io::Write;

const STATION_YAML: &str = r#"
server:
  port: 23456
instruments:
  - provider: psu
    transport: tcp
    address: 192.168.0.20
    port: 5025
    parameters:
      voltage:
        type: float
        default: 0.0
        get:
          instrument_command:
            - query: "VOLT?"
  - provider: obc
    transport: rmap
    address: 10.0.0.7
    port: 3000
    cyclic:
      mode: stream
      interval_ms: 250
"#;

#[test]
fn test_load_from_file_fills_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(STATION_YAML.as_bytes()).unwrap();

    let config = SystemConfig::load(file.path()).unwrap();
    assert_eq!(config.server.host, DEFAULT_HOST);
    assert_eq!(config.server.port, 23456);
    assert_eq!(config.server.bind_address(), "127.0.0.1:23456");
    assert_eq!(config.instruments.len(), 2);

    let psu = &config.instruments[0];
    assert_eq!(psu.provider, "psu");
    assert_eq!(psu.socket_address().as_deref(), Some("192.168.0.20:5025"));
    assert_eq!(psu.write_termination, "\n");
    assert_eq!(psu.timeout_ms, 1000);
    assert!(psu.parameters.contains_key("voltage"));

    let obc = &config.instruments[1];
    assert_eq!(obc.rmap.target_address, 0x32);
    let cyclic = obc.cyclic.as_ref().unwrap();
    assert_eq!(cyclic.mode, CyclicMode::Stream);
    assert_eq!(cyclic.interval_ms, 250);
}

#[test]
fn test_empty_document_uses_server_defaults() {
    let config = SystemConfig::from_yaml_str("{}").unwrap();
    assert_eq!(config.server, ServerConfig::default());
    assert_eq!(config.server.port, DEFAULT_PORT);
    assert!(config.instruments.is_empty());
}

#[test]
fn test_duplicate_provider_is_rejected() {
    let yaml = r#"
instruments:
  - provider: psu
  - provider: psu
"#;
    let err = SystemConfig::from_yaml_str(yaml).unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::Invalid(_))));
}

#[test]
fn test_empty_provider_is_rejected() {
    let err = SystemConfig::from_yaml_str("instruments:\n  - provider: ''\n").unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::Invalid(_))));
}

#[test]
fn test_malformed_yaml_is_a_yaml_error() {
    let err = SystemConfig::from_yaml_str("server: [unclosed").unwrap_err();
    assert!(matches!(err, Error::Yaml(_)));
}

#[test]
fn test_missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = SystemConfig::load(dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}
