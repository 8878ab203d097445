//! Environment variable interpolation for configuration

use super::error::ConfigError;
use regex::Regex;
use std::env;
use std::sync::OnceLock;

const ENV_VAR_PATTERN: &str = r"\$\{([A-Z_][A-Z0-9_]*)\}";

/// Interpolate `${VAR}` references in a configuration string
///
/// Every reference must resolve; the first missing variable is reported.
pub fn interpolate_env_vars(content: &str) -> Result<String, ConfigError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let env_var_pattern = PATTERN.get_or_init(|| Regex::new(ENV_VAR_PATTERN).expect("valid env var pattern"));

    let mut missing_vars = Vec::new();
    let result = env_var_pattern.replace_all(content, |cap: &regex::Captures<'_>| {
        let var_name = &cap[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing_vars.push(var_name.to_string());
                String::new()
            }
        }
    });

    if let Some(var) = missing_vars.into_iter().next() {
        return Err(ConfigError::MissingEnvVar { var });
    }

    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env_vars() {
        env::set_var("SWITCHBOARD_TEST_KEY", "sk-from-env");

        let content = "api_key: ${SWITCHBOARD_TEST_KEY}";
        let result = interpolate_env_vars(content).unwrap();
        assert_eq!(result, "api_key: sk-from-env");

        env::remove_var("SWITCHBOARD_TEST_KEY");
    }

    #[test]
    fn test_missing_env_var() {
        let content = "api_key: ${SWITCHBOARD_MISSING_VAR}";
        match interpolate_env_vars(content) {
            Err(ConfigError::MissingEnvVar { var }) => {
                assert_eq!(var, "SWITCHBOARD_MISSING_VAR")
            }
            other => panic!("Expected MissingEnvVar error, got {:?}", other),
        }
    }

    #[test]
    fn test_repeated_reference() {
        env::set_var("SWITCHBOARD_HOST", "example.com");

        let content = "a: https://${SWITCHBOARD_HOST}/x, b: https://${SWITCHBOARD_HOST}/y";
        let result = interpolate_env_vars(content).unwrap();
        assert_eq!(result, "a: https://example.com/x, b: https://example.com/y");

        env::remove_var("SWITCHBOARD_HOST");
    }
}
