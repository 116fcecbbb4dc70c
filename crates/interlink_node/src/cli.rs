//! Command-line interface for the interlink node.

use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;

/// Command line options. Anything set here overrides the config file.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the relay role (`hub` or `spoke`)
    pub role: Option<String>,
    /// Optional override for this node's server id
    pub server_id: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

impl CliArgs {
    /// Parses the process arguments.
    pub fn parse() -> Self {
        Self::parse_from(std::env::args_os())
    }

    pub fn parse_from<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = command().get_matches_from(args);

        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("interlink.toml")),
            role: matches.get_one::<String>("role").cloned(),
            server_id: matches.get_one::<String>("server-id").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

fn command() -> Command {
    Command::new("Interlink Node")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Cross-node messaging: authenticated TCP relay and pub/sub bus")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("interlink.toml"),
        )
        .arg(
            Arg::new("role")
                .short('r')
                .long("role")
                .value_name("ROLE")
                .value_parser(["hub", "spoke"])
                .help("Relay role: hub (proxy) or spoke (game node)"),
        )
        .arg(
            Arg::new("server-id")
                .short('s')
                .long("server-id")
                .value_name("ID")
                .help("Unique server id within the environment"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = CliArgs::parse_from(["interlink-node"]);
        assert_eq!(args.config_path, PathBuf::from("interlink.toml"));
        assert!(args.role.is_none());
        assert!(args.server_id.is_none());
        assert!(!args.json_logs);
    }

    #[test]
    fn test_overrides() {
        let args = CliArgs::parse_from([
            "interlink-node",
            "-c",
            "node.toml",
            "--role",
            "hub",
            "--server-id",
            "proxy",
            "--log-level",
            "debug",
            "--json-logs",
        ]);
        assert_eq!(args.config_path, PathBuf::from("node.toml"));
        assert_eq!(args.role.as_deref(), Some("hub"));
        assert_eq!(args.server_id.as_deref(), Some("proxy"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
    }

    #[test]
    fn test_rejects_unknown_role() {
        assert!(command()
            .try_get_matches_from(["interlink-node", "--role", "relay"])
            .is_err());
    }
}
