//! Cell coercion
//!
//! CSV cells arrive as text. Before binding, a cell is either recognised as a
//! null marker or converted according to the destination column's declared
//! type. Text that does not parse for its column is passed through unchanged
//! so the database produces the error, which the loader reports per row.

use std::collections::HashSet;

use serde::Deserialize;
use tablift_core::Value;

/// The NA strings recognised by pandas' CSV reader by default.
pub const DEFAULT_NULL_MARKERS: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// Set of cell texts that load as SQL NULL.
///
/// Cells are compared after trimming ASCII whitespace, so with the default
/// set a whitespace-only cell is null too.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "Vec<String>")]
pub struct NullMarkers {
    markers: HashSet<String>,
}

impl NullMarkers {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(&self, cell: &str) -> bool {
        self.markers
            .contains(cell.trim_matches(|c: char| c.is_ascii_whitespace()))
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

impl Default for NullMarkers {
    fn default() -> Self {
        Self::new(DEFAULT_NULL_MARKERS.iter().copied())
    }
}

impl From<Vec<String>> for NullMarkers {
    fn from(markers: Vec<String>) -> Self {
        Self::new(markers)
    }
}

/// Coarse classification of a declared column type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Integer,
    Real,
    Numeric,
    Boolean,
    Text,
}

impl TypeFamily {
    /// Classify a declared type name such as `BIGINT`, `double precision`
    /// or `NUMERIC(10,2)`.
    pub fn from_declared_type(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();

        if upper.contains("BOOL") {
            TypeFamily::Boolean
        } else if upper.contains("INT") && !upper.contains("INTERVAL") && !upper.contains("POINT")
        {
            TypeFamily::Integer
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            TypeFamily::Real
        } else if upper.contains("NUMERIC") || upper.contains("DECIMAL") {
            TypeFamily::Numeric
        } else {
            TypeFamily::Text
        }
    }
}

/// Convert one CSV cell into the value bound for a column of `family`.
pub fn coerce_cell(raw: &str, family: TypeFamily, markers: &NullMarkers) -> Value {
    if markers.is_null(raw) {
        return Value::Null;
    }

    let trimmed = raw.trim();
    let coerced = match family {
        TypeFamily::Integer => parse_integer(trimmed).map(Value::Int64),
        TypeFamily::Real => trimmed.parse::<f64>().ok().map(Value::Float64),
        TypeFamily::Numeric => is_decimal(trimmed).then(|| Value::Decimal(trimmed.to_string())),
        TypeFamily::Boolean => parse_bool(trimmed).map(Value::Bool),
        TypeFamily::Text => None,
    };

    coerced.unwrap_or_else(|| Value::String(raw.to_string()))
}

/// Integers, plus integral floats such as `3.0` that spreadsheets like to write.
fn parse_integer(text: &str) -> Option<i64> {
    if let Ok(v) = text.parse::<i64>() {
        return Some(v);
    }
    let f = text.parse::<f64>().ok()?;
    let in_range = f >= i64::MIN as f64 && f < i64::MAX as f64;
    (f.is_finite() && f.fract() == 0.0 && in_range).then_some(f as i64)
}

fn is_decimal(text: &str) -> bool {
    text.parse::<f64>().is_ok_and(|f| f.is_finite())
        && text
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_markers_are_null() {
        let markers = NullMarkers::default();
        for cell in ["", "   ", "NA", " n/a ", "NaN", "null", "None", "#N/A"] {
            assert!(markers.is_null(cell), "{:?} should be null", cell);
        }
        assert!(!markers.is_null("0"));
        assert!(!markers.is_null("none"));
    }

    #[test]
    fn test_type_family_classification() {
        let cases = [
            ("INTEGER", TypeFamily::Integer),
            ("bigint", TypeFamily::Integer),
            ("SMALLINT", TypeFamily::Integer),
            ("int4", TypeFamily::Integer),
            ("INTERVAL", TypeFamily::Text),
            ("POINT", TypeFamily::Text),
            ("REAL", TypeFamily::Real),
            ("double precision", TypeFamily::Real),
            ("FLOAT8", TypeFamily::Real),
            ("NUMERIC(10,2)", TypeFamily::Numeric),
            ("decimal", TypeFamily::Numeric),
            ("BOOLEAN", TypeFamily::Boolean),
            ("VARCHAR(255)", TypeFamily::Text),
            ("timestamp without time zone", TypeFamily::Text),
            ("", TypeFamily::Text),
        ];
        for (declared, family) in cases {
            assert_eq!(TypeFamily::from_declared_type(declared), family, "{}", declared);
        }
    }

    #[test]
    fn test_empty_numeric_cell_is_null() {
        let markers = NullMarkers::default();
        assert_eq!(coerce_cell("", TypeFamily::Integer, &markers), Value::Null);
        assert_eq!(coerce_cell("", TypeFamily::Numeric, &markers), Value::Null);
        assert_eq!(coerce_cell("NaN", TypeFamily::Real, &markers), Value::Null);
    }

    #[test]
    fn test_integer_coercion() {
        let markers = NullMarkers::default();
        assert_eq!(coerce_cell(" 42 ", TypeFamily::Integer, &markers), Value::Int64(42));
        assert_eq!(coerce_cell("3.0", TypeFamily::Integer, &markers), Value::Int64(3));
        assert_eq!(
            coerce_cell("3.5", TypeFamily::Integer, &markers),
            Value::String("3.5".into())
        );
        assert_eq!(
            coerce_cell("abc", TypeFamily::Integer, &markers),
            Value::String("abc".into())
        );
    }

    #[test]
    fn test_real_numeric_and_bool() {
        let markers = NullMarkers::default();
        assert_eq!(coerce_cell("2.5", TypeFamily::Real, &markers), Value::Float64(2.5));
        assert_eq!(
            coerce_cell("-12.50", TypeFamily::Numeric, &markers),
            Value::Decimal("-12.50".into())
        );
        assert_eq!(
            coerce_cell("1e3", TypeFamily::Numeric, &markers),
            Value::Decimal("1e3".into())
        );
        assert_eq!(
            coerce_cell("inf", TypeFamily::Numeric, &markers),
            Value::String("inf".into())
        );
        assert_eq!(coerce_cell("Yes", TypeFamily::Boolean, &markers), Value::Bool(true));
        assert_eq!(coerce_cell("f", TypeFamily::Boolean, &markers), Value::Bool(false));
        assert_eq!(
            coerce_cell("maybe", TypeFamily::Boolean, &markers),
            Value::String("maybe".into())
        );
    }

    #[test]
    fn test_text_is_kept_verbatim() {
        let markers = NullMarkers::default();
        assert_eq!(
            coerce_cell(" padded ", TypeFamily::Text, &markers),
            Value::String(" padded ".into())
        );
    }

    #[test]
    fn test_custom_markers() {
        let markers = NullMarkers::new(["-"]);
        assert_eq!(coerce_cell("-", TypeFamily::Text, &markers), Value::Null);
        assert_eq!(
            coerce_cell("", TypeFamily::Text, &markers),
            Value::String(String::new())
        );
    }
}
