//! Application configuration.
//!
//! Layered lowest to highest: built-in defaults, an optional config file
//! (`--config` / `CONFIG_FILE`, or `./toolbridge.{yaml,toml,json}` when
//! present), `TOOLBRIDGE_*` environment variables (`__` separates sections,
//! e.g. `TOOLBRIDGE_TIMEOUTS__EXECUTE_SECS=30`), then CLI flags.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::approval::{RuleScope, RuleType};
use crate::connector::Timeouts;
use crate::mcp::config::TransportSettings;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Provider configuration (`mcp.json`)
    #[arg(long, env = "MCP_CONFIG")]
    pub mcp_config: Option<String>,

    /// Approval preferences file
    #[arg(long)]
    pub preferences: Option<String>,

    /// Execution timeout in seconds
    #[arg(long)]
    pub execute_timeout: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Connect all providers and list the merged tool catalog
    Tools {
        /// Print function-calling descriptors as JSON
        #[arg(long)]
        json: bool,
    },
    /// Connect all providers and show each connector's state
    Status,
    /// Call one tool
    Call {
        /// Tool display name, e.g. `time__now`
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Approve without prompting
        #[arg(long)]
        yes: bool,
    },
    /// Manage approval rules
    Rules {
        #[command(subcommand)]
        action: RulesCommand,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum RulesCommand {
    /// Show approval settings and rules in evaluation order
    List,
    /// Append a rule
    Add {
        /// Glob pattern (`*`, `?`), case-insensitive
        pattern: String,
        /// Verdict the rule gives
        #[arg(long, value_enum, default_value = "allow")]
        rule_type: RuleType,
        /// What the pattern is matched against
        #[arg(long, value_enum, default_value = "tool")]
        scope: RuleScope,
    },
    /// Delete a rule by id
    Remove { id: String },
    /// Enable a rule by id
    Enable { id: String },
    /// Disable a rule by id
    Disable { id: String },
    /// Turn approval on (rules and prompts apply)
    On,
    /// Turn approval off (every call is approved)
    Off,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub connectors: ConnectorsConfig,
    pub timeouts: TimeoutsConfig,
    pub transport: TransportConfig,
    pub approval: ApprovalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConnectorsConfig {
    pub config_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutsConfig {
    pub connect_secs: u64,
    pub discover_secs: u64,
    pub execute_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    pub max_frame_bytes: usize,
    pub spawn_grace_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApprovalConfig {
    pub preferences_path: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Self::from_cli(&cli)
    }

    pub fn from_cli(cli: &Cli) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();

        // 1. Defaults
        builder = builder
            .set_default("connectors.config_path", "mcp.json")?
            .set_default("timeouts.connect_secs", 30)?
            .set_default("timeouts.discover_secs", 30)?
            .set_default("timeouts.execute_secs", 120)?
            .set_default("transport.max_frame_bytes", 4 * 1024 * 1024)?
            .set_default("transport.spawn_grace_ms", 50)?
            .set_default("approval.preferences_path", ".toolbridge/preferences.json")?;

        // 2. Config file: explicit path must exist, the cwd fallback may not
        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("toolbridge").required(false)),
        };

        // 3. Environment, e.g. TOOLBRIDGE_TIMEOUTS__EXECUTE_SECS=30
        builder = builder.add_source(
            Environment::with_prefix("TOOLBRIDGE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // 4. CLI overrides
        if let Some(path) = &cli.mcp_config {
            builder = builder.set_override("connectors.config_path", path.as_str())?;
        }
        if let Some(path) = &cli.preferences {
            builder = builder.set_override("approval.preferences_path", path.as_str())?;
        }
        if let Some(secs) = cli.execute_timeout {
            builder = builder.set_override("timeouts.execute_secs", secs)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.timeouts.connect_secs),
            discover: Duration::from_secs(self.timeouts.discover_secs),
            execute: Duration::from_secs(self.timeouts.execute_secs),
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            max_frame_bytes: self.transport.max_frame_bytes,
            spawn_grace: Duration::from_millis(self.transport.spawn_grace_ms),
        }
    }

    pub fn preferences_path(&self) -> PathBuf {
        PathBuf::from(&self.approval.preferences_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_call_subcommand() {
        let cli = Cli::try_parse_from([
            "toolbridge",
            "call",
            "time__now",
            "--args",
            r#"{"tz":"UTC"}"#,
            "--yes",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Call {
                tool: "time__now".into(),
                args: r#"{"tz":"UTC"}"#.into(),
                yes: true,
            })
        );
    }

    #[test]
    fn test_cli_parses_rules_add() {
        let cli = Cli::try_parse_from([
            "toolbridge",
            "rules",
            "add",
            "fs__*",
            "--rule-type",
            "deny",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Rules {
                action: RulesCommand::Add {
                    rule_type: RuleType::Deny,
                    scope: RuleScope::Tool,
                    ..
                }
            })
        ));
    }

    #[test]
    fn test_cli_rejects_unknown_rule_type() {
        let err = Cli::try_parse_from([
            "toolbridge",
            "rules",
            "add",
            "fs__*",
            "--rule-type",
            "maybe",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }
}
