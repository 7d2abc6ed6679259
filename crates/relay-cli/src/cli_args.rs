use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_service_alias(value: &str) -> Result<(String, String), String> {
    let Some((token, key)) = value.split_once('=') else {
        return Err(format!("service alias '{value}' must look like TOKEN=KEY"));
    };
    let (token, key) = (token.trim(), key.trim());
    if token.is_empty() || key.is_empty() {
        return Err(format!(
            "service alias '{value}' needs a non-empty token and key"
        ));
    }
    Ok((token.to_string(), key.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliGatewayAuthMode {
    Token,
    LocalhostDev,
}

impl CliGatewayAuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CliGatewayAuthMode::Token => "token",
            CliGatewayAuthMode::LocalhostDev => "localhost-dev",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliStdioMode {
    /// Enabled when stdin is not a terminal.
    Auto,
    Always,
    Never,
}

impl CliStdioMode {
    pub fn resolve(self, stdin_is_terminal: bool) -> bool {
        match self {
            CliStdioMode::Auto => !stdin_is_terminal,
            CliStdioMode::Always => true,
            CliStdioMode::Never => false,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "relay-gateway",
    about = "HTTP and server-push gateway in front of stdio JSON-RPC services",
    version
)]
pub struct Cli {
    #[arg(
        long = "host",
        env = "MCP_GATEWAY_HOST",
        default_value = "127.0.0.1",
        help = "Interface the HTTP listener binds to"
    )]
    pub host: String,

    #[arg(long = "port", env = "PORT", default_value_t = 3000)]
    pub port: u16,

    #[arg(
        long = "services-file",
        env = "MCP_GATEWAY_SERVICES_FILE",
        default_value = "services/services.json",
        help = "JSON file holding the registered services"
    )]
    pub services_file: PathBuf,

    #[arg(
        long = "auth-mode",
        env = "MCP_GATEWAY_AUTH_MODE",
        value_enum,
        default_value = "token",
        help = "Gateway auth mode: token or localhost-dev"
    )]
    pub auth_mode: CliGatewayAuthMode,

    #[arg(
        long = "auth-token",
        env = "MCP_GATEWAY_TOKEN",
        hide_env_values = true,
        help = "Shared secret expected in the Authorization header when --auth-mode=token"
    )]
    pub auth_token: Option<String>,

    #[arg(
        long = "log-level",
        env = "LOG_LEVEL",
        default_value = "info",
        help = "Default log filter directive; RUST_LOG overrides it"
    )]
    pub log_level: String,

    #[arg(
        long = "request-timeout-ms",
        env = "MCP_GATEWAY_REQUEST_TIMEOUT_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64
    )]
    pub request_timeout_ms: u64,

    #[arg(
        long = "startup-timeout-ms",
        env = "MCP_GATEWAY_STARTUP_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64
    )]
    pub startup_timeout_ms: u64,

    #[arg(
        long = "slow-start-grace-ms",
        env = "MCP_GATEWAY_SLOW_START_GRACE_MS",
        default_value_t = 60_000,
        value_parser = parse_positive_u64,
        help = "Startup window for services flagged slow_start"
    )]
    pub slow_start_grace_ms: u64,

    #[arg(
        long = "idle-timeout-ms",
        env = "MCP_GATEWAY_IDLE_TIMEOUT_MS",
        default_value_t = 300_000,
        value_parser = parse_positive_u64
    )]
    pub idle_timeout_ms: u64,

    #[arg(
        long = "idle-sweep-interval-ms",
        env = "MCP_GATEWAY_IDLE_SWEEP_INTERVAL_MS",
        default_value_t = 60_000,
        value_parser = parse_positive_u64
    )]
    pub idle_sweep_interval_ms: u64,

    #[arg(
        long = "heartbeat-interval-ms",
        env = "MCP_GATEWAY_HEARTBEAT_INTERVAL_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64
    )]
    pub heartbeat_interval_ms: u64,

    #[arg(
        long = "stdio-mode",
        env = "MCP_GATEWAY_STDIO_MODE",
        value_enum,
        default_value = "auto"
    )]
    pub stdio_mode: CliStdioMode,

    #[arg(
        long = "service-alias",
        env = "MCP_GATEWAY_SERVICE_ALIASES",
        action = ArgAction::Append,
        value_delimiter = ',',
        default_value = "affine-mcp=affine",
        value_parser = parse_service_alias,
        help = "Command token that maps to a shared process key (TOKEN=KEY)"
    )]
    pub service_aliases: Vec<(String, String)>,

    #[arg(
        long = "auto-login-service",
        env = "MCP_GATEWAY_AUTO_LOGIN_SERVICE",
        default_value = "affine"
    )]
    pub auto_login_service: String,

    #[arg(long = "auto-login-email", env = "AFFINE_EMAIL")]
    pub auto_login_email: Option<String>,

    #[arg(
        long = "auto-login-password",
        env = "AFFINE_PASSWORD",
        hide_env_values = true
    )]
    pub auto_login_password: Option<String>,

    #[arg(
        long = "auto-login-tool",
        env = "MCP_GATEWAY_AUTO_LOGIN_TOOL",
        default_value = "sign_in"
    )]
    pub auto_login_tool: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("relay-gateway").chain(args.iter().copied()))
            .expect("parse cli")
    }

    #[test]
    fn unit_defaults_match_documented_values() {
        let cli = parse(&[]);
        assert_eq!(cli.host, "127.0.0.1");
        assert_eq!(cli.auth_mode, CliGatewayAuthMode::Token);
        assert_eq!(cli.services_file, PathBuf::from("services/services.json"));
        assert_eq!(cli.request_timeout_ms, 30_000);
        assert_eq!(cli.startup_timeout_ms, 10_000);
        assert_eq!(cli.slow_start_grace_ms, 60_000);
        assert_eq!(cli.idle_timeout_ms, 300_000);
        assert_eq!(cli.idle_sweep_interval_ms, 60_000);
        assert_eq!(cli.heartbeat_interval_ms, 30_000);
        assert_eq!(cli.stdio_mode, CliStdioMode::Auto);
        assert_eq!(
            cli.service_aliases,
            vec![("affine-mcp".to_string(), "affine".to_string())]
        );
        assert_eq!(cli.auto_login_tool, "sign_in");
    }

    #[test]
    fn functional_flags_override_defaults() {
        let cli = parse(&[
            "--port",
            "4100",
            "--auth-mode",
            "localhost-dev",
            "--stdio-mode",
            "never",
            "--service-alias",
            "github-mcp=github",
            "--service-alias",
            "/opt/bin/notes=notes",
            "--request-timeout-ms",
            "1500",
        ]);
        assert_eq!(cli.port, 4100);
        assert_eq!(cli.auth_mode.as_str(), "localhost-dev");
        assert_eq!(cli.stdio_mode, CliStdioMode::Never);
        assert_eq!(cli.request_timeout_ms, 1500);
        assert_eq!(cli.service_aliases.len(), 2);
        assert_eq!(cli.service_aliases[1].1, "notes");
    }

    #[test]
    fn regression_zero_durations_and_malformed_aliases_are_rejected() {
        let base = ["relay-gateway"];
        for args in [
            vec!["--request-timeout-ms", "0"],
            vec!["--idle-sweep-interval-ms", "0"],
            vec!["--service-alias", "no-separator"],
            vec!["--service-alias", "=key"],
        ] {
            let result = Cli::try_parse_from(base.iter().copied().chain(args.iter().copied()));
            assert!(result.is_err(), "expected {args:?} to be rejected");
        }
    }

    #[test]
    fn unit_stdio_mode_resolution_follows_terminal_detection() {
        assert!(CliStdioMode::Auto.resolve(false));
        assert!(!CliStdioMode::Auto.resolve(true));
        assert!(CliStdioMode::Always.resolve(true));
        assert!(!CliStdioMode::Never.resolve(false));
    }
}
