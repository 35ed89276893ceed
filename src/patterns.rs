//! Name grammars shared by the registry, contexts and argument parsing.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::TimeError;

/// A valid macro (or tag) name.
pub static MACRO_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[A-Za-z][A-Za-z0-9_-]*|[=-])$").expect("valid macro name regex"));

/// A story (`$`) or temporary (`_`) variable name.
pub static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[$_][$A-Za-z_][$0-9A-Za-z_]*$").expect("valid variable regex")
});

/// Every variable reference inside a larger string.
pub static VARIABLE_IN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[$_][$A-Za-z_][$0-9A-Za-z_]*").expect("valid variable regex")
});

static CSS_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([+-]?(?:\d*\.)?\d+)([Mm]?[Ss])$").expect("valid time regex"));

pub fn is_macro_name(name: &str) -> bool {
    MACRO_NAME.is_match(name)
}

pub fn is_variable(name: &str) -> bool {
    VARIABLE.is_match(name)
}

/// Convert a CSS time value (`"2s"`, `"250ms"`) into milliseconds.
pub fn css_time_to_ms(value: &str) -> Result<f64, TimeError> {
    let caps = CSS_TIME
        .captures(value)
        .ok_or_else(|| TimeError::Syntax(value.to_string()))?;

    let mut msec: f64 = caps[1]
        .parse()
        .map_err(|_| TimeError::Syntax(value.to_string()))?;

    if caps[2].len() == 1 {
        msec *= 1000.0;
    }

    if !msec.is_finite() {
        return Err(TimeError::Range(value.to_string()));
    }

    Ok(msec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macro_names() {
        for name in ["if", "link-append", "a_1", "=", "-"] {
            assert!(is_macro_name(name), "{name}");
        }
        for name in ["", "1st", "/if", "a b", "==", "_x", "a\u{e9}", "x\u{663}"] {
            assert!(!is_macro_name(name), "{name}");
        }
    }

    #[test]
    fn test_variable_names() {
        assert!(is_variable("$gold"));
        assert!(is_variable("_i"));
        assert!(is_variable("$_x$"));
        assert!(!is_variable("gold"));
        assert!(!is_variable("$1x"));
        assert!(!is_variable("$"));
    }

    #[test]
    fn test_css_time() {
        assert_eq!(css_time_to_ms("2s").unwrap(), 2000.0);
        assert_eq!(css_time_to_ms("250ms").unwrap(), 250.0);
        assert_eq!(css_time_to_ms(".5S").unwrap(), 500.0);
        assert_eq!(css_time_to_ms("-1s").unwrap(), -1000.0);
        assert_eq!(
            css_time_to_ms("soon"),
            Err(TimeError::Syntax("soon".to_string()))
        );
        assert!(css_time_to_ms("10").is_err());
    }
}
