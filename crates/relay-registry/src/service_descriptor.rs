//! Service descriptor model and command-line validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Substrings rejected in any command token before a process is ever spawned.
pub const UNSAFE_COMMAND_SEQUENCES: [&str; 3] = [";", "&&", "||"];

/// How the gateway decides that a freshly spawned backend is ready for traffic.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessProbe {
    /// Round-trip an MCP `initialize` request.
    #[default]
    Initialize,
    /// Ready as soon as any bytes arrive on stdout.
    FirstOutput,
    /// Ready once the startup window passes without the process exiting.
    GracePeriod,
}

impl ReadinessProbe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::FirstOutput => "first_output",
            Self::GracePeriod => "grace_period",
        }
    }

    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// One registered backend: an id plus the argv that launches it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub id: String,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_passthrough: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub isolate_env: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub slow_start: bool,
    #[serde(default, skip_serializing_if = "ReadinessProbe::is_default")]
    pub readiness: ReadinessProbe,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ServiceDescriptor {
    pub fn new(id: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            id: id.into(),
            command,
            env: BTreeMap::new(),
            env_passthrough: Vec::new(),
            isolate_env: false,
            slow_start: false,
            readiness: ReadinessProbe::default(),
        }
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_env_passthrough(mut self, names: &[&str]) -> Self {
        self.env_passthrough = names.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn with_slow_start(mut self, slow_start: bool) -> Self {
        self.slow_start = slow_start;
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessProbe) -> Self {
        self.readiness = readiness;
        self
    }

    /// Checks the id and the command line together.
    pub fn validate(&self) -> Result<(), CommandValidationError> {
        validate_service_id(self.id.as_str())?;
        validate_command(&self.command)?;
        for name in self.env.keys().chain(self.env_passthrough.iter()) {
            if name.trim().is_empty() || name.contains('=') {
                return Err(CommandValidationError::InvalidEnvName(name.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandValidationError {
    #[error("service id must be non-empty and must not contain '/'")]
    InvalidServiceId,
    #[error("command must contain at least one token")]
    EmptyCommand,
    #[error("command executable must be non-empty")]
    EmptyExecutable,
    #[error("command token '{token}' contains forbidden sequence '{sequence}'")]
    UnsafeToken {
        token: String,
        sequence: &'static str,
    },
    #[error("environment variable name '{0}' is invalid")]
    InvalidEnvName(String),
}

pub fn validate_service_id(id: &str) -> Result<(), CommandValidationError> {
    let trimmed = id.trim();
    if trimmed.is_empty() || trimmed != id || id.contains('/') {
        return Err(CommandValidationError::InvalidServiceId);
    }
    Ok(())
}

/// Rejects empty argv and any token carrying a shell chaining sequence.
pub fn validate_command(command: &[String]) -> Result<(), CommandValidationError> {
    let Some(executable) = command.first() else {
        return Err(CommandValidationError::EmptyCommand);
    };
    if executable.trim().is_empty() {
        return Err(CommandValidationError::EmptyExecutable);
    }
    for token in command {
        if let Some(sequence) = UNSAFE_COMMAND_SEQUENCES
            .iter()
            .find(|sequence| token.contains(**sequence))
            .copied()
        {
            return Err(CommandValidationError::UnsafeToken {
                token: token.clone(),
                sequence,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|token| token.to_string()).collect()
    }

    #[test]
    fn unit_validate_command_accepts_plain_argv() {
        validate_command(&argv(&["node", "echo.js", "--port=3"])).expect("plain argv");
        validate_command(&argv(&["npx", "-y", "@scope/server|pipe-in-name"])).expect("single pipe");
    }

    #[test]
    fn unit_validate_command_rejects_chaining_sequences() {
        for token in ["a;b", "x && y", "&&", "fallback||true"] {
            let error = validate_command(&argv(&["node", token])).expect_err("unsafe token");
            assert!(matches!(error, CommandValidationError::UnsafeToken { .. }));
        }
    }

    #[test]
    fn regression_validate_command_rejects_empty_and_blank_executable() {
        assert_eq!(
            validate_command(&[]),
            Err(CommandValidationError::EmptyCommand)
        );
        assert_eq!(
            validate_command(&argv(&["  ", "echo.js"])),
            Err(CommandValidationError::EmptyExecutable)
        );
    }

    #[test]
    fn unit_service_id_validation_rejects_blank_and_path_like_ids() {
        validate_service_id("echo").expect("simple id");
        for id in ["", "  ", " echo", "a/b"] {
            assert_eq!(
                validate_service_id(id),
                Err(CommandValidationError::InvalidServiceId)
            );
        }
    }

    #[test]
    fn functional_descriptor_serialization_omits_defaults() {
        let descriptor = ServiceDescriptor::new("echo", argv(&["node", "echo.js"]));
        let rendered = serde_json::to_value(&descriptor).expect("serialize");
        assert_eq!(
            rendered,
            serde_json::json!({"id": "echo", "command": ["node", "echo.js"]})
        );

        let slow = descriptor
            .clone()
            .with_slow_start(true)
            .with_readiness(ReadinessProbe::GracePeriod)
            .with_env_passthrough(&["AFFINE_BASE_URL"]);
        let rendered = serde_json::to_value(&slow).expect("serialize slow");
        assert_eq!(rendered["slow_start"], true);
        assert_eq!(rendered["readiness"], "grace_period");
        assert_eq!(rendered["env_passthrough"][0], "AFFINE_BASE_URL");
    }

    #[test]
    fn regression_descriptor_validate_rejects_bad_env_names() {
        let descriptor =
            ServiceDescriptor::new("echo", argv(&["node"])).with_env("BAD=NAME", "value");
        assert_eq!(
            descriptor.validate(),
            Err(CommandValidationError::InvalidEnvName("BAD=NAME".to_string()))
        );
    }
}
