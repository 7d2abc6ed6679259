//! Maps a service command line to the pool key of the process that serves it.
//!
//! Services whose commands resolve to the same key share one backend process.

use std::collections::BTreeMap;
use std::path::Path;

pub const UNKNOWN_SERVICE_KEY: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceKeyResolver {
    aliases: BTreeMap<String, String>,
}

impl Default for ServiceKeyResolver {
    fn default() -> Self {
        Self::empty().with_alias("affine-mcp", "affine")
    }
}

impl ServiceKeyResolver {
    pub fn empty() -> Self {
        Self {
            aliases: BTreeMap::new(),
        }
    }

    /// Any command token equal to `token` (or whose file name is `token`) resolves to `key`.
    pub fn with_alias(mut self, token: impl Into<String>, key: impl Into<String>) -> Self {
        self.aliases.insert(token.into(), key.into());
        self
    }

    pub fn aliases(&self) -> &BTreeMap<String, String> {
        &self.aliases
    }

    /// Alias matches win; otherwise the last non-blank token is the key.
    pub fn resolve(&self, command: &[String]) -> String {
        for token in command {
            let token = token.trim();
            if let Some(key) = self.aliases.get(token) {
                return key.clone();
            }
            let file_name = Path::new(token).file_name().and_then(|name| name.to_str());
            if let Some(key) = file_name.and_then(|name| self.aliases.get(name)) {
                return key.clone();
            }
        }
        command
            .iter()
            .rev()
            .map(|token| token.trim())
            .find(|token| !token.is_empty())
            .unwrap_or(UNKNOWN_SERVICE_KEY)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|token| token.to_string()).collect()
    }

    #[test]
    fn unit_resolve_uses_last_non_blank_token() {
        let resolver = ServiceKeyResolver::default();
        assert_eq!(resolver.resolve(&argv(&["node", "echo.js"])), "echo.js");
        assert_eq!(resolver.resolve(&argv(&["python3", "server.py", "  "])), "server.py");
        assert_eq!(resolver.resolve(&[]), UNKNOWN_SERVICE_KEY);
    }

    #[test]
    fn functional_resolve_maps_alias_tokens_and_paths() {
        let resolver = ServiceKeyResolver::default();
        assert_eq!(resolver.resolve(&argv(&["affine-mcp"])), "affine");
        assert_eq!(
            resolver.resolve(&argv(&["/usr/local/bin/affine-mcp", "--stdio"])),
            "affine"
        );
        assert_eq!(
            resolver.resolve(&argv(&["npx", "-y", "affine-mcp", "--workspace", "main"])),
            "affine"
        );
    }

    #[test]
    fn unit_empty_resolver_has_no_aliases() {
        let resolver = ServiceKeyResolver::empty().with_alias("github-mcp", "github");
        assert_eq!(resolver.resolve(&argv(&["affine-mcp"])), "affine-mcp");
        assert_eq!(resolver.resolve(&argv(&["github-mcp"])), "github");
        assert_eq!(resolver.aliases().len(), 1);
    }
}
