//! Runtime environment detection.
//!
//! Single source of truth for test/development/production mode, driven by
//! `CLAUDE_REMOTE_ENV`. Test mode redirects config/project storage under the
//! crate's own `tmp/` directory so unit and integration tests never touch a
//! real user's config directory.

/// Application name used for the default config directory (`~/.config/claude-remote`
/// on Linux, `~/Library/Application Support/claude-remote` on macOS).
pub const APP_NAME: &str = "claude-remote";

/// Runtime environment for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Production environment (default).
    Production,
    /// Development environment.
    Development,
    /// Test environment — redirects config/project paths under `tmp/`.
    Test,
}

impl Environment {
    /// Detect current environment from `CLAUDE_REMOTE_ENV`.
    #[must_use]
    pub fn current() -> Self {
        match std::env::var("CLAUDE_REMOTE_ENV").as_deref() {
            Ok("test") => Self::Test,
            Ok("development") | Ok("dev") => Self::Development,
            _ => Self::Production,
        }
    }

    #[must_use]
    pub fn is_test(self) -> bool {
        self == Self::Test
    }

    #[must_use]
    pub fn is_production(self) -> bool {
        self == Self::Production
    }

    #[must_use]
    pub fn is_development(self) -> bool {
        self == Self::Development
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Development => write!(f, "development"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Convenience wrapper for `Environment::current().is_test()`.
#[must_use]
pub fn is_test_mode() -> bool {
    Environment::current().is_test()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_variant() {
        assert_eq!(Environment::Production.to_string(), "production");
        assert_eq!(Environment::Development.to_string(), "development");
        assert_eq!(Environment::Test.to_string(), "test");
    }

    #[test]
    fn is_methods() {
        assert!(Environment::Test.is_test());
        assert!(!Environment::Test.is_production());
        assert!(Environment::Production.is_production());
        assert!(Environment::Development.is_development());
    }
}
