use std::env;
use std::fmt;

/// Name of the environment variable that [`Environment::from_env()`] reads.
pub const ENVIRONMENT_VARIABLE: &str = "PEEPHOLE_ENV";

/// The kind of deployment the instrumented process runs in.
///
/// Some operations (such as attaching verbose transport tracing to network clients) are
/// refused in [`Environment::Production`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Environment {
    /// A developer workstation. This is the default.
    #[default]
    Development,

    /// An automated test run.
    Test,

    /// A pre-production deployment.
    Staging,

    /// A production deployment.
    Production,
}

impl Environment {
    /// Determines the environment from the `PEEPHOLE_ENV` environment variable.
    ///
    /// An unset or empty variable means [`Environment::Development`]. A value that is not
    /// recognized means [`Environment::Production`], so a typo never unlocks debug-only
    /// operations on a production machine.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_variable(env::var(ENVIRONMENT_VARIABLE).ok().as_deref())
    }

    fn from_variable(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") => Self::Development,
            Some(value) => Self::parse(value).unwrap_or(Self::Production),
        }
    }

    /// Parses an environment name, ignoring ASCII case.
    ///
    /// Accepts `development`/`dev`, `test`, `staging` and `production`/`prod`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "test" => Some(Self::Test),
            "staging" => Some(Self::Staging),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }

    /// Whether debug-only operations may be activated in this environment.
    #[must_use]
    pub const fn allows_debugging(self) -> bool {
        !matches!(self, Self::Production)
    }

    /// The canonical lowercase name of the environment.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn unset_variable_means_development() {
        assert_eq!(Environment::from_variable(None), Environment::Development);
        assert_eq!(Environment::from_variable(Some("  ")), Environment::Development);
    }

    #[test]
    fn known_names_parse_case_insensitively() {
        assert_eq!(Environment::parse("PROD"), Some(Environment::Production));
        assert_eq!(Environment::parse("Staging"), Some(Environment::Staging));
        assert_eq!(Environment::parse("dev"), Some(Environment::Development));
        assert_eq!(Environment::parse("test"), Some(Environment::Test));
        assert_eq!(Environment::parse("qa"), None);
    }

    #[test]
    fn unknown_value_fails_safe() {
        assert_eq!(
            Environment::from_variable(Some("prodution")),
            Environment::Production
        );
    }

    #[test]
    fn only_production_forbids_debugging() {
        assert!(Environment::Development.allows_debugging());
        assert!(Environment::Test.allows_debugging());
        assert!(Environment::Staging.allows_debugging());
        assert!(!Environment::Production.allows_debugging());
    }
}
