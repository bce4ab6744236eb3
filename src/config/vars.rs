//! Environment variable interpolation for config files.
//!
//! This is the only place the process environment is read; everything
//! downstream receives the resolved [`Config`](super::Config).
//!
//! Syntax:
//! - `$VAR` or `${VAR}`: value of VAR, error if unset
//! - `${VAR:-default}`: default if VAR is unset or empty
//! - `${VAR-default}`: default only if VAR is unset
//! - `$$`: literal `$`

use regex::{Captures, Regex};
use std::sync::LazyLock;

static VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        |
        \$\{
            (?P<braced>[A-Za-z_][A-Za-z0-9_]*)
            (?: (?P<op>:?-) (?P<default>[^}]*) )?
        \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("interpolation pattern must compile")
});

/// Interpolate using the process environment.
///
/// On failure returns every problem found, so all missing variables can be
/// reported at once.
pub fn interpolate(input: &str) -> Result<String, Vec<String>> {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Interpolate using an arbitrary variable lookup.
pub fn interpolate_with<F>(input: &str, lookup: F) -> Result<String, Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();

    let text = VAR_PATTERN.replace_all(input, |caps: &Captures| {
        let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
            return "$".to_string();
        };
        let name = name.as_str();
        let default = caps.name("default").map(|m| m.as_str());
        let empty_means_unset = caps.name("op").is_some_and(|op| op.as_str() == ":-");

        match lookup(name) {
            Some(value) if value.contains(['\n', '\r']) => {
                errors.push(format!(
                    "environment variable '{name}' contains newlines, which is not allowed"
                ));
                String::new()
            }
            Some(value) if value.is_empty() && empty_means_unset => {
                default.unwrap_or_default().to_string()
            }
            Some(value) => value,
            None => match default {
                Some(default) => default.to_string(),
                None => {
                    errors.push(format!("environment variable '{name}' is not set"));
                    String::new()
                }
            },
        }
    });

    if errors.is_empty() {
        Ok(text.into_owned())
    } else {
        Err(errors)
    }
}
