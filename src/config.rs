use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::mcp::manager::{ManagerSettings, ReconnectPolicy};
use crate::telemetry::LogFormat;

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay model tool calls to MCP endpoints", long_about = None)]
pub struct Cli {
    /// Config file path (YAML, TOML or JSON)
    #[arg(short, long, env = "RELAY_CONFIG_FILE")]
    pub config: Option<String>,

    /// Endpoints file path
    #[arg(short, long, env = "RELAY_ENDPOINTS_FILE")]
    pub endpoints: Option<String>,

    /// Log output format: compact or json
    #[arg(long)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the dispatch function definition advertised to the model
    Tools,
    /// Dispatch one request to an endpoint
    Call {
        /// Endpoint name
        resource: String,
        /// Operation (tool) name
        operation: String,
        /// Operation arguments as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Subscribe to a resource and print notifications until Ctrl-C
    Watch {
        /// Endpoint name
        resource: String,
        /// Resource URI
        uri: String,
    },
    /// Feed a recorded model response (JSON array of chunks) through a turn
    Replay {
        file: PathBuf,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub endpoints: EndpointsConfig,
    pub reconnect: ReconnectConfig,
    pub dispatch: DispatchConfig,
    pub notifications: NotificationsConfig,
    pub handshake: HandshakeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EndpointsConfig {
    pub file: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    pub call_timeout_secs: u64,
    pub list_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationsConfig {
    pub outbox_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HandshakeConfig {
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
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

    /// Layering, lowest first: defaults, config file, `RELAY_*`
    /// environment (`__` between sections), CLI flags.
    pub fn from_cli(cli: &Cli) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder()
            .set_default("endpoints.file", "mcp-servers.json")?
            .set_default("reconnect.max_attempts", 5)?
            .set_default("reconnect.backoff_ms", 1000)?
            .set_default("dispatch.call_timeout_secs", 30)?
            .set_default("dispatch.list_timeout_secs", 10)?
            .set_default("notifications.outbox_capacity", 16)?
            .set_default("handshake.timeout_secs", 15)?
            .set_default("logging.format", "compact")?;

        // An explicit file must exist; ./relay.{yaml,toml,json} is optional.
        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("relay").required(false)),
        };

        // E.g. RELAY_DISPATCH__CALL_TIMEOUT_SECS=60
        builder = builder.add_source(
            Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(endpoints) = &cli.endpoints {
            builder = builder.set_override("endpoints.file", endpoints.as_str())?;
        }
        if let Some(format) = &cli.log_format {
            builder = builder.set_override("logging.format", format.as_str())?;
        }

        let cfg = builder.build()?;
        cfg.try_deserialize()
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            reconnect: ReconnectPolicy {
                max_attempts: self.reconnect.max_attempts.max(1),
                backoff_unit: Duration::from_millis(self.reconnect.backoff_ms),
            },
            outbox_capacity: self.notifications.outbox_capacity.max(1),
            handshake_timeout: Duration::from_secs(self.handshake.timeout_secs),
            list_on_connect: true,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.call_timeout_secs)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.list_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "tool-relay",
            "--endpoints",
            "servers.json",
            "call",
            "time",
            "now",
            "--params",
            r#"{"tz":"UTC"}"#,
        ])
        .unwrap();

        assert_eq!(cli.endpoints.as_deref(), Some("servers.json"));
        assert_eq!(
            cli.command,
            Some(Command::Call {
                resource: "time".to_string(),
                operation: "now".to_string(),
                params: r#"{"tz":"UTC"}"#.to_string(),
            })
        );
    }

    #[test]
    fn test_call_params_default_to_empty_object() {
        let cli = Cli::try_parse_from(["tool-relay", "call", "time", "now"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Call { params, .. }) if params == "{}"));
    }
}
