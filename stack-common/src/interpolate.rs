//! `${VAR}` substitution for descriptor values, so credentials can come from
//! the operator's environment instead of being written in the file.
//!
//! Supported forms: `${VAR}`, `${VAR:-default}` (default when unset or empty)
//! and `$$` for a literal `$`.
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InterpolationError {
    #[error("variable {0} is not set and has no default")]
    Unset(String),
    #[error("unterminated variable reference in {0:?}")]
    Unterminated(String),
    #[error("invalid variable name {0:?}")]
    InvalidName(String),
}

pub fn interpolate<F>(input: &str, lookup: F) -> Result<String, InterpolationError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(position) = rest.find('$') {
        output.push_str(&rest[..position]);
        let after = &rest[position + 1..];

        if let Some(stripped) = after.strip_prefix('$') {
            output.push('$');
            rest = stripped;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body
                .find('}')
                .ok_or_else(|| InterpolationError::Unterminated(input.to_owned()))?;
            output.push_str(&resolve(&body[..end], &lookup)?);
            rest = &body[end + 1..];
        } else {
            // A lone `$` is kept as-is.
            output.push('$');
            rest = after;
        }
    }

    output.push_str(rest);
    Ok(output)
}

fn resolve<F>(reference: &str, lookup: &F) -> Result<String, InterpolationError>
where
    F: Fn(&str) -> Option<String>,
{
    let (name, default) = match reference.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (reference, None),
    };

    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        return Err(InterpolationError::InvalidName(name.to_owned()));
    }

    match (lookup(name), default) {
        (Some(value), Some(default)) if value.is_empty() => Ok(default.to_owned()),
        (Some(value), _) => Ok(value),
        (None, Some(default)) => Ok(default.to_owned()),
        (None, None) => Err(InterpolationError::Unset(name.to_owned())),
    }
}

/// Interpolates against the current process environment.
pub fn interpolate_env(input: &str) -> Result<String, InterpolationError> {
    interpolate(input, |name| std::env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn substitutes_variables() {
        let vars = lookup(&[("DB_USER", "todo"), ("DB_HOST", "db")]);
        assert_eq!(
            interpolate("postgres://${DB_USER}@${DB_HOST}:5432", vars),
            Ok("postgres://todo@db:5432".to_owned())
        );
    }

    #[test]
    fn applies_defaults_when_unset_or_empty() {
        let vars = lookup(&[("EMPTY", "")]);
        assert_eq!(
            interpolate("${MISSING:-5432}/${EMPTY:-fallback}", vars),
            Ok("5432/fallback".to_owned())
        );
    }

    #[test]
    fn keeps_literal_dollars() {
        let vars = lookup(&[]);
        assert_eq!(interpolate("cost: $$5 or $", vars), Ok("cost: $5 or $".to_owned()));
    }

    #[test]
    fn reports_errors() {
        assert_eq!(
            interpolate("${DB_PASSWORD}", lookup(&[])),
            Err(InterpolationError::Unset("DB_PASSWORD".to_owned()))
        );
        assert!(matches!(
            interpolate("${DB_PASSWORD", lookup(&[])),
            Err(InterpolationError::Unterminated(_))
        ));
        assert!(matches!(
            interpolate("${1ABC}", lookup(&[])),
            Err(InterpolationError::InvalidName(_))
        ));
    }
}
