use std::time::Duration;

use anyhow::{Context, Result};
use relay_gateway::{GatewayAuthMode, GatewayServerConfig};
use relay_runtime::{AutoLoginConfig, FanOutConfig, ProcessPoolConfig, ServiceKeyResolver};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use crate::cli_args::{Cli, CliGatewayAuthMode};

/// Logs always go to stderr; stdout carries JSON-RPC in stdio entry mode.
pub(crate) fn init_tracing(log_level: &str) -> Result<()> {
    let default_directive = log_level
        .trim()
        .parse::<Directive>()
        .with_context(|| format!("invalid log level '{log_level}'"))?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_directive)
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

pub(crate) fn build_gateway_config(
    cli: &Cli,
    stdin_is_terminal: bool,
) -> Result<GatewayServerConfig> {
    let auth_mode = match cli.auth_mode {
        CliGatewayAuthMode::Token => GatewayAuthMode::Token,
        CliGatewayAuthMode::LocalhostDev => GatewayAuthMode::LocalhostDev,
    };
    let resolver = cli
        .service_aliases
        .iter()
        .fold(ServiceKeyResolver::empty(), |resolver, (token, key)| {
            resolver.with_alias(token.as_str(), key.as_str())
        });
    let mut auto_login = AutoLoginConfig::new(cli.auto_login_service.trim())
        .with_tool_name(cli.auto_login_tool.trim());
    if let (Some(email), Some(password)) = (&cli.auto_login_email, &cli.auto_login_password) {
        auto_login = auto_login.with_credentials(email.as_str(), password.as_str());
    }

    let mut config = GatewayServerConfig::new(
        format!("{}:{}", bracket_ipv6(cli.host.trim()), cli.port),
        cli.services_file.clone(),
    );
    config.auth_mode = auth_mode;
    config.auth_token = cli.auth_token.clone();
    config.pool = ProcessPoolConfig {
        startup_timeout: Duration::from_millis(cli.startup_timeout_ms),
        slow_start_grace: Duration::from_millis(cli.slow_start_grace_ms),
        idle_timeout: Duration::from_millis(cli.idle_timeout_ms),
        idle_sweep_interval: Duration::from_millis(cli.idle_sweep_interval_ms),
    };
    config.request_timeout = Duration::from_millis(cli.request_timeout_ms);
    config.fanout = FanOutConfig {
        heartbeat_interval: Duration::from_millis(cli.heartbeat_interval_ms),
    };
    config.resolver = resolver;
    config.auto_login = auto_login;
    config.stdio_enabled = cli.stdio_mode.resolve(stdin_is_terminal);
    config
        .validate()
        .context("invalid relay gateway configuration")?;
    Ok(config)
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("relay-gateway").chain(args.iter().copied()))
            .expect("parse cli")
    }

    #[test]
    fn functional_build_gateway_config_maps_every_setting() {
        let cli = cli(&[
            "--auth-token",
            "secret",
            "--port",
            "4100",
            "--idle-timeout-ms",
            "1000",
            "--service-alias",
            "github-mcp=github",
            "--auto-login-email",
            "user@example.com",
            "--auto-login-password",
            "pw",
        ]);
        let config = build_gateway_config(&cli, true).expect("config");
        assert_eq!(config.bind, "127.0.0.1:4100");
        assert_eq!(config.auth_mode, GatewayAuthMode::Token);
        assert_eq!(config.pool.idle_timeout, Duration::from_millis(1000));
        assert_eq!(config.resolver.aliases().get("github-mcp").map(String::as_str), Some("github"));
        assert!(!config.resolver.aliases().contains_key("affine-mcp"));
        assert_eq!(
            config.auto_login.credentials(),
            Some(("user@example.com", "pw"))
        );
        assert!(!config.stdio_enabled);
    }

    #[test]
    fn regression_token_mode_without_token_fails_validation() {
        let mut cli = cli(&["--auth-mode", "token"]);
        cli.auth_token = None;
        let error = build_gateway_config(&cli, true).expect_err("missing token");
        assert!(format!("{error:#}").contains("auth token"));

        cli.auth_token = Some("   ".to_string());
        let error = build_gateway_config(&cli, true).expect_err("blank token");
        assert!(format!("{error:#}").contains("auth token"));
    }

    #[test]
    fn unit_bracket_ipv6_wraps_bare_addresses_only() {
        assert_eq!(bracket_ipv6("::1"), "[::1]");
        assert_eq!(bracket_ipv6("[::1]"), "[::1]");
        assert_eq!(bracket_ipv6("0.0.0.0"), "0.0.0.0");
    }
}
