//! Environment-reference literals.
//!
//! Secret columns may store a reference of the form `env.NAME` instead of a
//! raw value. The reference is what gets persisted; the referenced variable
//! is read at load time. References are never encrypted at rest.

/// Prefix marking a stored value as an environment reference.
pub const ENV_PREFIX: &str = "env.";

/// Whether a stored value is an `env.NAME` reference.
pub fn is_env_ref(value: &str) -> bool {
    value.len() > ENV_PREFIX.len() && value.starts_with(ENV_PREFIX)
}

/// The variable name inside an `env.NAME` reference, if `value` is one.
pub fn env_var_name(value: &str) -> Option<&str> {
    if is_env_ref(value) {
        Some(&value[ENV_PREFIX.len()..])
    } else {
        None
    }
}

/// Resolve a stored value for a caller.
///
/// Plain values come back unchanged. For `env.NAME` references the variable
/// is read from the process environment; a missing variable logs a warning
/// and returns the original literal so read paths never hard-fail.
pub fn resolve(value: &str) -> String {
    match env_var_name(value) {
        Some(name) => match std::env::var(name) {
            Ok(resolved) => resolved,
            Err(_) => {
                log::warn!("environment variable {} referenced by config is not set", name);
                value.to_string()
            }
        },
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_env_ref() {
        assert!(is_env_ref("env.OPENAI_API_KEY"));
        assert!(!is_env_ref("env."));
        assert!(!is_env_ref("sk-abc123"));
        assert!(!is_env_ref("environment"));
    }

    #[test]
    fn test_resolve_plain_value() {
        assert_eq!(resolve("sk-abc123"), "sk-abc123");
    }

    #[test]
    fn test_resolve_set_variable() {
        std::env::set_var("MODELGATE_TEST_RESOLVE", "resolved-secret");
        assert_eq!(resolve("env.MODELGATE_TEST_RESOLVE"), "resolved-secret");
        std::env::remove_var("MODELGATE_TEST_RESOLVE");
    }

    #[test]
    fn test_resolve_missing_variable_returns_literal() {
        assert_eq!(
            resolve("env.MODELGATE_TEST_DEFINITELY_UNSET"),
            "env.MODELGATE_TEST_DEFINITELY_UNSET"
        );
    }
}
