use serial_test::serial;
use std::env;
use std::fs;
use std::time::Duration;

use toolbridge::approval::MemoryPreferences;
use toolbridge::config::AppConfig;
use toolbridge::connector::{ConnectorRegistry, Timeouts};
use toolbridge::mcp::config::{ServerKind, TransportSettings, load_mcp_config};
use toolbridge::{ApprovalEngine, ErrorKind};

// Helper to clear environment variables that might interfere with tests
fn clear_env_vars() {
    unsafe {
        env::remove_var("TOOLBRIDGE_TIMEOUTS__EXECUTE_SECS");
        env::remove_var("TOOLBRIDGE_TRANSPORT__MAX_FRAME_BYTES");
        env::remove_var("TOOLBRIDGE_CONNECTORS__CONFIG_PATH");
        env::remove_var("CONFIG_FILE");
        env::remove_var("MCP_CONFIG");
    }
}

#[test]
#[serial]
fn test_default_config() {
    clear_env_vars();

    let config = AppConfig::load_from_args(["toolbridge"]).expect("defaults should load");
    assert_eq!(config.connectors.config_path, "mcp.json");
    assert_eq!(config.timeouts(), Timeouts::default());
    assert_eq!(config.transport_settings(), TransportSettings::default());
}

#[test]
#[serial]
fn test_env_override() {
    clear_env_vars();
    unsafe {
        env::set_var("TOOLBRIDGE_TIMEOUTS__EXECUTE_SECS", "15");
        env::set_var("TOOLBRIDGE_TRANSPORT__MAX_FRAME_BYTES", "1024");
    }

    let config = AppConfig::load_from_args(["toolbridge"]).expect("Failed to load config");
    assert_eq!(config.timeouts().execute, Duration::from_secs(15));
    assert_eq!(config.transport_settings().max_frame_bytes, 1024);

    clear_env_vars();
}

#[test]
#[serial]
fn test_file_load() {
    clear_env_vars();

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("toolbridge.yaml");
    fs::write(
        &file_path,
        "timeouts:\n  connect_secs: 5\napproval:\n  preferences_path: /tmp/prefs.json\n",
    )
    .expect("Failed to write temp config");

    let config = AppConfig::load_from_args(["toolbridge", "--config", file_path.to_str().unwrap()])
        .expect("Failed to load config from file");
    assert_eq!(config.timeouts().connect, Duration::from_secs(5));
    assert_eq!(config.timeouts().discover, Duration::from_secs(30));
    assert_eq!(config.preferences_path().to_str(), Some("/tmp/prefs.json"));
}

#[test]
#[serial]
fn test_cli_beats_env() {
    clear_env_vars();
    unsafe {
        env::set_var("TOOLBRIDGE_TIMEOUTS__EXECUTE_SECS", "15");
        env::set_var("TOOLBRIDGE_CONNECTORS__CONFIG_PATH", "from-env.json");
    }

    let config = AppConfig::load_from_args([
        "toolbridge",
        "--execute-timeout",
        "7",
        "--mcp-config",
        "from-cli.json",
    ])
    .unwrap();
    assert_eq!(config.timeouts().execute, Duration::from_secs(7));
    assert_eq!(config.connectors.config_path, "from-cli.json");

    clear_env_vars();
}

#[test]
fn test_mcp_config_builds_registry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcp.json");
    fs::write(
        &path,
        r#"{
          "mcpServers": {
            "time": {"command": "time-server", "args": ["--utc"]},
            "search": {
              "name": "Web search",
              "url": "https://search.example.com/mcp",
              "bearerTokenEnv": "SEARCH_TOKEN",
              "enabled": false
            }
          }
        }"#,
    )
    .unwrap();

    let mcp = load_mcp_config(&path).unwrap();
    assert!(matches!(mcp.mcp_servers["time"].kind, ServerKind::Stdio { .. }));
    assert!(matches!(
        mcp.mcp_servers["search"].kind,
        ServerKind::RemoteHttp { .. }
    ));

    let approval = ApprovalEngine::new(std::sync::Arc::new(MemoryPreferences::new())).unwrap();
    let registry = ConnectorRegistry::from_config(
        &mcp,
        TransportSettings::default(),
        Timeouts::default(),
        std::sync::Arc::new(approval),
    )
    .unwrap();

    let statuses = registry.statuses();
    assert_eq!(statuses.len(), 2);
    let search = statuses.iter().find(|s| s.id == "search").unwrap();
    assert_eq!(search.name, "Web search");
    assert!(!search.enabled);
    let time = statuses.iter().find(|s| s.id == "time").unwrap();
    assert_eq!(time.name, "time");
}

#[test]
fn test_mcp_config_rejects_namespace_separator_in_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcp.json");
    fs::write(&path, r#"{"mcpServers": {"my__server": {"command": "x"}}}"#).unwrap();

    let mcp = load_mcp_config(&path).unwrap();
    let approval = ApprovalEngine::new(std::sync::Arc::new(MemoryPreferences::new())).unwrap();
    let err = ConnectorRegistry::from_config(
        &mcp,
        TransportSettings::default(),
        Timeouts::default(),
        std::sync::Arc::new(approval),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_missing_mcp_config_names_the_file() {
    let err = load_mcp_config("/nonexistent/mcp.json").unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/mcp.json"));
}
