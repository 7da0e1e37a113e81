//! Environment variable interpolation for config files.
//!
//! Supports the following syntax:
//! - `$VAR` or `${VAR}` - substitute with env var value, error if missing
//! - `${VAR:-default}` - use default if VAR is unset OR empty
//! - `${VAR-default}` - use default only if VAR is unset (empty is OK)
//! - `$$` - escape sequence for literal `$`

use regex::{Captures, Regex};
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?P<escape>\$\$)
        |
        \$\{
            (?P<braced>[A-Za-z_][A-Za-z0-9_]*)
            (?:(?P<op>:?-)(?P<default>[^}]*))?
        \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("Invalid regex pattern")
});

/// How a missing or empty variable is resolved.
enum Fallback<'a> {
    /// No default: a missing variable is an error.
    Required,
    /// `${VAR-default}`: default only when unset.
    IfUnset(&'a str),
    /// `${VAR:-default}`: default when unset or empty.
    IfUnsetOrEmpty(&'a str),
}

impl<'a> Fallback<'a> {
    fn from_captures(caps: &Captures<'a>) -> Self {
        let default = caps.name("default").map_or("", |m| m.as_str());
        match caps.name("op").map(|m| m.as_str()) {
            Some(":-") => Fallback::IfUnsetOrEmpty(default),
            Some(_) => Fallback::IfUnset(default),
            None => Fallback::Required,
        }
    }
}

/// Interpolate process environment variables into `input`.
///
/// Every problem is collected so the user sees all missing variables at once.
pub fn interpolate(input: &str) -> Result<String, Vec<String>> {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Interpolate using an arbitrary variable lookup.
pub fn interpolate_with<F>(input: &str, lookup: F) -> Result<String, Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures| {
        if caps.name("escape").is_some() {
            return "$".to_string();
        }

        let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
            return caps[0].to_string();
        };
        let name = name.as_str();

        match (lookup(name), Fallback::from_captures(caps)) {
            (Some(value), _) if value.contains(|c| c == '\n' || c == '\r') => {
                errors.push(format!(
                    "environment variable '{name}' contains newlines, which is not allowed"
                ));
                caps[0].to_string()
            }
            (Some(value), Fallback::IfUnsetOrEmpty(default)) if value.is_empty() => {
                default.to_string()
            }
            (Some(value), _) => value,
            (None, Fallback::IfUnset(default) | Fallback::IfUnsetOrEmpty(default)) => {
                default.to_string()
            }
            (None, Fallback::Required) => {
                errors.push(format!("environment variable '{name}' is not set"));
                caps[0].to_string()
            }
        }
    });

    if errors.is_empty() {
        Ok(text.into_owned())
    } else {
        Err(errors)
    }
}
