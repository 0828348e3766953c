//! `${VAR}` interpolation for configuration files

use super::error::ConfigError;
use regex::Regex;
use std::env;
use std::sync::OnceLock;

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is a valid regex")
    })
}

/// Replace every `${VAR}` in `content` with the value of `VAR`.
///
/// Fails on the first variable that is not set, so channel keys never end up
/// holding a literal placeholder.
pub fn interpolate_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing = None;
    let result = env_var_pattern().replace_all(content, |caps: &regex::Captures<'_>| {
        match env::var(&caps[1]) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| caps[1].to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var) => Err(ConfigError::EnvVarNotFound { var }),
        None => Ok(result.into_owned()),
    }
}

/// Variable names referenced by `text`
pub fn referenced_vars(text: &str) -> Vec<String> {
    env_var_pattern()
        .captures_iter(text)
        .map(|cap| cap[1].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env_vars() {
        env::set_var("UNIGATE_TEST_KEY", "sk-from-env");

        let content = "key: ${UNIGATE_TEST_KEY}";
        let result = interpolate_env_vars(content).unwrap();
        assert_eq!(result, "key: sk-from-env");

        env::remove_var("UNIGATE_TEST_KEY");
    }

    #[test]
    fn test_missing_env_var() {
        let result = interpolate_env_vars("key: ${UNIGATE_DEFINITELY_MISSING}");
        match result {
            Err(ConfigError::EnvVarNotFound { var }) => {
                assert_eq!(var, "UNIGATE_DEFINITELY_MISSING")
            }
            other => panic!("expected EnvVarNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_repeated_and_multiple_vars() {
        env::set_var("UNIGATE_TEST_A", "a");
        env::set_var("UNIGATE_TEST_B", "b");

        let result = interpolate_env_vars("${UNIGATE_TEST_A}-${UNIGATE_TEST_B}-${UNIGATE_TEST_A}");
        assert_eq!(result.unwrap(), "a-b-a");

        env::remove_var("UNIGATE_TEST_A");
        env::remove_var("UNIGATE_TEST_B");
    }

    #[test]
    fn test_referenced_vars() {
        let vars = referenced_vars("${OPENAI_KEY} and ${ANTHROPIC_KEY} but not $PLAIN");
        assert_eq!(vars, vec!["OPENAI_KEY", "ANTHROPIC_KEY"]);
    }
}
