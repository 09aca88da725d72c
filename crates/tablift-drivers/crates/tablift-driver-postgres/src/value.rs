//! Conversion between tablift values and PostgreSQL's binary wire format.

use bytes::{BufMut, BytesMut};
use std::error::Error;
use tablift_core::{Result, Value};
use tokio_postgres::Row as PgRow;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type};

type BoxError = Box<dyn Error + Sync + Send>;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_MAX_DSCALE: i32 = 0x3FFF;

/// Owned parameter value handed to tokio-postgres.
///
/// Text cells from CSV files arrive as strings; once the prepared statement
/// reports the parameter type they are converted to the variant whose binary
/// encoding the server expects.
#[derive(Debug)]
pub(crate) enum PgValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    /// Pre-encoded binary NUMERIC payload
    Numeric(Vec<u8>),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    Json(serde_json::Value),
    DateTimeUtc(chrono::DateTime<chrono::Utc>),
    Date(chrono::NaiveDate),
    Time(chrono::NaiveTime),
    DateTime(chrono::NaiveDateTime),
    /// A value that cannot be represented as the target type. Binding fails
    /// with this message.
    Invalid(String),
}

impl PgValue {
    /// Convert a value into the variant matching the target parameter type so
    /// tokio-postgres writes the correct binary width (e.g. 4 bytes for INT4,
    /// not 8 bytes from an i64).
    pub(crate) fn from_value_for_type(value: &Value, target_type: &Type) -> Self {
        match value {
            Value::Null => PgValue::Null,
            Value::Bool(v) => match *target_type {
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => PgValue::String(v.to_string()),
                _ => PgValue::Bool(*v),
            },

            Value::Int16(v) => Self::coerce_int(*v as i64, target_type),
            Value::Int32(v) => Self::coerce_int(*v as i64, target_type),
            Value::Int64(v) => Self::coerce_int(*v, target_type),

            Value::Float32(v) => Self::coerce_float(*v as f64, target_type),
            Value::Float64(v) => Self::coerce_float(*v, target_type),

            Value::Decimal(v) | Value::String(v) => Self::coerce_string(v, target_type),
            Value::Bytes(v) => PgValue::Bytes(v.clone()),
            Value::Uuid(v) => PgValue::Uuid(*v),
            Value::Json(v) => PgValue::Json(v.clone()),
            Value::DateTimeUtc(v) => PgValue::DateTimeUtc(*v),
            Value::Date(v) => PgValue::Date(*v),
            Value::Time(v) => PgValue::Time(*v),
            Value::DateTime(v) => PgValue::DateTime(*v),
        }
    }

    /// Fallback used when we don't know the target parameter type.
    pub(crate) fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => PgValue::Null,
            Value::Bool(v) => PgValue::Bool(*v),
            Value::Int16(v) => PgValue::Int16(*v),
            Value::Int32(v) => PgValue::Int32(*v),
            Value::Int64(v) => PgValue::Int64(*v),
            Value::Float32(v) => PgValue::Float32(*v),
            Value::Float64(v) => PgValue::Float64(*v),
            Value::Decimal(v) | Value::String(v) => PgValue::String(v.clone()),
            Value::Bytes(v) => PgValue::Bytes(v.clone()),
            Value::Uuid(v) => PgValue::Uuid(*v),
            Value::Json(v) => PgValue::Json(v.clone()),
            Value::DateTimeUtc(v) => PgValue::DateTimeUtc(*v),
            Value::Date(v) => PgValue::Date(*v),
            Value::Time(v) => PgValue::Time(*v),
            Value::DateTime(v) => PgValue::DateTime(*v),
        }
    }

    fn coerce_int(value: i64, target_type: &Type) -> Self {
        let out_of_range = || PgValue::Invalid(format!("value {} is out of range for {}", value, target_type));
        match *target_type {
            Type::INT2 => i16::try_from(value).map(PgValue::Int16).unwrap_or_else(|_| out_of_range()),
            Type::INT4 => i32::try_from(value).map(PgValue::Int32).unwrap_or_else(|_| out_of_range()),
            Type::FLOAT4 => PgValue::Float32(value as f32),
            Type::FLOAT8 => PgValue::Float64(value as f64),
            Type::NUMERIC => Self::numeric(&value.to_string(), target_type),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR => PgValue::String(value.to_string()),
            Type::BOOL if value == 0 || value == 1 => PgValue::Bool(value == 1),
            _ => PgValue::Int64(value),
        }
    }

    fn coerce_float(value: f64, target_type: &Type) -> Self {
        match *target_type {
            Type::FLOAT4 => PgValue::Float32(value as f32),
            Type::NUMERIC => Self::numeric(&value.to_string(), target_type),
            Type::INT2 | Type::INT4 | Type::INT8 => match integral(value) {
                Some(int) => Self::coerce_int(int, target_type),
                None => PgValue::Invalid(format!("cannot convert '{}' to {}", value, target_type)),
            },
            Type::TEXT | Type::VARCHAR | Type::BPCHAR => PgValue::String(value.to_string()),
            _ => PgValue::Float64(value),
        }
    }

    /// Parse text into the representation of the target parameter type.
    ///
    /// Types the server reads in a non-text binary format reject text that
    /// does not parse; everything else is sent as text.
    fn coerce_string(value: &str, target_type: &Type) -> Self {
        let trimmed = value.trim();
        let invalid = || PgValue::Invalid(format!("cannot convert '{}' to {}", value, target_type));

        match *target_type {
            Type::INT2 | Type::INT4 | Type::INT8 => trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().and_then(integral))
                .map(|int| Self::coerce_int(int, target_type))
                .unwrap_or_else(invalid),
            Type::FLOAT4 => trimmed
                .parse::<f32>()
                .map(PgValue::Float32)
                .unwrap_or_else(|_| invalid()),
            Type::FLOAT8 => trimmed
                .parse::<f64>()
                .map(PgValue::Float64)
                .unwrap_or_else(|_| invalid()),
            Type::NUMERIC => Self::numeric(trimmed, target_type),
            Type::BOOL => parse_bool(trimmed).map(PgValue::Bool).unwrap_or_else(invalid),
            Type::UUID => uuid::Uuid::parse_str(trimmed)
                .map(PgValue::Uuid)
                .unwrap_or_else(|_| invalid()),
            Type::JSON | Type::JSONB => serde_json::from_str::<serde_json::Value>(value)
                .map(PgValue::Json)
                .unwrap_or_else(|_| invalid()),
            Type::DATE => parse_date(trimmed).map(PgValue::Date).unwrap_or_else(invalid),
            Type::TIME => chrono::NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
                .or_else(|_| chrono::NaiveTime::parse_from_str(trimmed, "%H:%M:%S%.f"))
                .or_else(|_| chrono::NaiveTime::parse_from_str(trimmed, "%H:%M"))
                .map(PgValue::Time)
                .unwrap_or_else(|_| invalid()),
            Type::TIMESTAMP => parse_naive_datetime(trimmed)
                .map(PgValue::DateTime)
                .unwrap_or_else(invalid),
            Type::TIMESTAMPTZ => chrono::DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|timestamp| timestamp.with_timezone(&chrono::Utc))
                .or_else(|| {
                    parse_naive_datetime(trimmed).map(|timestamp| {
                        chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(
                            timestamp,
                            chrono::Utc,
                        )
                    })
                })
                .map(PgValue::DateTimeUtc)
                .unwrap_or_else(invalid),
            _ => PgValue::String(value.to_string()),
        }
    }

    fn numeric(text: &str, target_type: &Type) -> Self {
        match encode_numeric(text) {
            Ok(payload) => PgValue::Numeric(payload),
            Err(reason) => PgValue::Invalid(format!(
                "cannot convert '{}' to {}: {}",
                text, target_type, reason
            )),
        }
    }
}

impl ToSql for PgValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match self {
            PgValue::Null => Ok(IsNull::Yes),
            PgValue::Bool(v) => v.to_sql(ty, out),
            PgValue::Int16(v) => v.to_sql(ty, out),
            PgValue::Int32(v) => v.to_sql(ty, out),
            PgValue::Int64(v) => v.to_sql(ty, out),
            PgValue::Float32(v) => v.to_sql(ty, out),
            PgValue::Float64(v) => v.to_sql(ty, out),
            PgValue::Numeric(payload) => {
                out.put_slice(payload);
                Ok(IsNull::No)
            }
            PgValue::String(v) => v.to_sql(ty, out),
            PgValue::Bytes(v) => v.to_sql(ty, out),
            PgValue::Uuid(v) => v.to_sql(ty, out),
            PgValue::Json(v) => v.to_sql(ty, out),
            PgValue::DateTimeUtc(v) => v.to_sql(ty, out),
            PgValue::Date(v) => v.to_sql(ty, out),
            PgValue::Time(v) => v.to_sql(ty, out),
            PgValue::DateTime(v) => v.to_sql(ty, out),
            PgValue::Invalid(message) => Err(message.clone().into()),
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    postgres_types::to_sql_checked!();
}

fn integral(value: f64) -> Option<i64> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn parse_date(text: &str) -> Option<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_naive_datetime(text).map(|timestamp| timestamp.date()))
}

fn parse_naive_datetime(text: &str) -> Option<chrono::NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
    ];
    FORMATS
        .iter()
        .find_map(|format| chrono::NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// Encode decimal text (`-12.50`, `1e-3`, `NaN`) as a binary NUMERIC payload:
/// ndigits, weight, sign and dscale followed by base-10000 digit groups.
pub(crate) fn encode_numeric(text: &str) -> std::result::Result<Vec<u8>, String> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("nan") {
        return Ok(numeric_payload(0, NUMERIC_NAN, 0, &[]));
    }

    let (negative, unsigned) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(pos) => {
            let exponent = unsigned[pos + 1..]
                .parse::<i32>()
                .map_err(|_| "invalid exponent".to_string())?;
            (&unsigned[..pos], exponent)
        }
        None => (unsigned, 0),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err("no digits".into());
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return Err("not a decimal number".into());
    }
    if exponent.abs() > 1000 {
        return Err("exponent out of range".into());
    }

    let mut digits: Vec<u8> = int_part
        .bytes()
        .chain(frac_part.bytes())
        .map(|b| b - b'0')
        .collect();
    // Digits to the left of the decimal point
    let mut point = int_part.len() as i32 + exponent;
    let dscale = (frac_part.len() as i32 - exponent).max(0);
    if dscale > NUMERIC_MAX_DSCALE {
        return Err("scale out of range".into());
    }

    let leading_zeros = digits.iter().take_while(|d| **d == 0).count();
    digits.drain(..leading_zeros);
    point -= leading_zeros as i32;
    while digits.last() == Some(&0) {
        digits.pop();
    }

    if digits.is_empty() {
        return Ok(numeric_payload(0, NUMERIC_POS, dscale as u16, &[]));
    }

    let left_pad = (4 - point.rem_euclid(4)) % 4;
    let weight = (point + left_pad) / 4 - 1;
    let weight = i16::try_from(weight).map_err(|_| "value out of range".to_string())?;

    let mut padded = vec![0u8; left_pad as usize];
    padded.extend_from_slice(&digits);
    while padded.len() % 4 != 0 {
        padded.push(0);
    }
    let groups: Vec<u16> = padded
        .chunks(4)
        .map(|chunk| chunk.iter().fold(0u16, |acc, d| acc * 10 + *d as u16))
        .collect();

    let sign = if negative { NUMERIC_NEG } else { NUMERIC_POS };
    Ok(numeric_payload(weight, sign, dscale as u16, &groups))
}

fn numeric_payload(weight: i16, sign: u16, dscale: u16, groups: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + groups.len() * 2);
    out.extend_from_slice(&(groups.len() as i16).to_be_bytes());
    out.extend_from_slice(&weight.to_be_bytes());
    out.extend_from_slice(&sign.to_be_bytes());
    out.extend_from_slice(&dscale.to_be_bytes());
    for group in groups {
        out.extend_from_slice(&group.to_be_bytes());
    }
    out
}

/// NUMERIC read as exact decimal text.
#[derive(Debug)]
struct PgNumericString(String);

impl PgNumericString {
    fn parse(raw: &[u8]) -> std::result::Result<String, BoxError> {
        if raw.len() < 8 {
            return Err("invalid NUMERIC payload: too short".into());
        }

        let ndigits = i16::from_be_bytes([raw[0], raw[1]]).max(0) as usize;
        let weight = i16::from_be_bytes([raw[2], raw[3]]) as i32;
        let sign = u16::from_be_bytes([raw[4], raw[5]]);
        let dscale = i16::from_be_bytes([raw[6], raw[7]]).max(0) as usize;

        if raw.len() < 8 + ndigits * 2 {
            return Err("invalid NUMERIC payload: truncated digits".into());
        }
        if sign == NUMERIC_NAN {
            return Ok("NaN".to_string());
        }

        let mut digits = Vec::with_capacity(ndigits);
        for index in 0..ndigits {
            let offset = 8 + index * 2;
            let group = u16::from_be_bytes([raw[offset], raw[offset + 1]]);
            if group > 9999 {
                return Err("invalid NUMERIC payload: group out of range".into());
            }
            digits.push(group);
        }
        let group_at = |index: i32| -> u16 {
            if index < 0 {
                0
            } else {
                digits.get(index as usize).copied().unwrap_or(0)
            }
        };

        let mut integer_text = String::new();
        if weight < 0 {
            integer_text.push('0');
        } else {
            for index in 0..=weight {
                if index == 0 {
                    integer_text.push_str(&group_at(index).to_string());
                } else {
                    integer_text.push_str(&format!("{:04}", group_at(index)));
                }
            }
        }

        let mut fraction_text = String::new();
        for offset in 0..dscale.div_ceil(4) {
            fraction_text.push_str(&format!("{:04}", group_at(weight + 1 + offset as i32)));
        }
        fraction_text.truncate(dscale);

        let mut output = String::new();
        if sign == NUMERIC_NEG && digits.iter().any(|group| *group != 0) {
            output.push('-');
        }
        output.push_str(&integer_text);
        if !fraction_text.is_empty() {
            output.push('.');
            output.push_str(&fraction_text);
        }
        Ok(output)
    }
}

impl<'a> FromSql<'a> for PgNumericString {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        Ok(Self(Self::parse(raw)?))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Raw UTF-8 payload for types without a dedicated decoder (enums, citext).
#[derive(Debug)]
struct PgFallbackString(String);

impl<'a> FromSql<'a> for PgFallbackString {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        Ok(Self(String::from_utf8(raw.to_vec())?))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn get<'a, T: FromSql<'a>>(row: &'a PgRow, idx: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

/// Convert a PostgreSQL row value to our Value type
pub(crate) fn postgres_to_value(row: &PgRow, idx: usize) -> Result<Value> {
    let type_name = row.columns()[idx].type_().name();

    let value = match type_name {
        "bool" => get(row, idx).map(Value::Bool),
        "int2" => get(row, idx).map(Value::Int16),
        "int4" => get(row, idx).map(Value::Int32),
        "int8" => get(row, idx).map(Value::Int64),
        "float4" => get(row, idx).map(Value::Float32),
        "float8" => get(row, idx).map(Value::Float64),
        "text" | "varchar" | "bpchar" | "name" => get(row, idx).map(Value::String),
        "bytea" => get(row, idx).map(Value::Bytes),
        "uuid" => get(row, idx).map(Value::Uuid),
        "json" | "jsonb" => get(row, idx).map(Value::Json),
        "date" => get(row, idx).map(Value::Date),
        "time" => get(row, idx).map(Value::Time),
        "timestamp" => get(row, idx).map(Value::DateTime),
        "timestamptz" => get(row, idx).map(Value::DateTimeUtc),
        "numeric" => get::<PgNumericString>(row, idx).map(|value| Value::Decimal(value.0)),
        _ => get::<PgFallbackString>(row, idx).map(|value| Value::String(value.0)),
    };

    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &PgValue, ty: &Type) -> std::result::Result<Vec<u8>, String> {
        let mut out = BytesMut::new();
        value
            .to_sql_checked(ty, &mut out)
            .map(|_| out.to_vec())
            .map_err(|e| e.to_string())
    }

    #[test]
    fn test_encode_numeric_layout() {
        // 123.45 -> groups [123, 4500], weight 0, dscale 2
        assert_eq!(
            encode_numeric("123.45").unwrap(),
            vec![0, 2, 0, 0, 0, 0, 0, 2, 0, 123, 0x11, 0x94]
        );
        // -10000 -> one group [1] with weight 1
        assert_eq!(
            encode_numeric("-10000").unwrap(),
            vec![0, 1, 0, 1, 0x40, 0, 0, 0, 0, 1]
        );
        // 0.00005 -> group [5000] with weight -2, dscale 5
        assert_eq!(
            encode_numeric("0.00005").unwrap(),
            vec![0, 1, 0xFF, 0xFE, 0, 0, 0, 5, 0x13, 0x88]
        );
    }

    #[test]
    fn test_encode_numeric_zero_nan_and_exponent() {
        assert_eq!(encode_numeric("0.00").unwrap(), vec![0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(encode_numeric("NaN").unwrap(), vec![0, 0, 0, 0, 0xC0, 0, 0, 0]);
        assert_eq!(encode_numeric("1.5e3").unwrap(), encode_numeric("1500").unwrap());
        assert_eq!(encode_numeric("25e-2").unwrap(), encode_numeric("0.25").unwrap());
    }

    #[test]
    fn test_encode_numeric_rejects_garbage() {
        assert!(encode_numeric("").is_err());
        assert!(encode_numeric("12abc").is_err());
        assert!(encode_numeric("1.2.3").is_err());
        assert!(encode_numeric("-").is_err());
    }

    #[test]
    fn test_numeric_text_survives_encoding() {
        for text in ["123.45", "-0.5", "0.00005", "10000", "99999999.0001", "0.00"] {
            let payload = encode_numeric(text).unwrap();
            assert_eq!(PgNumericString::parse(&payload).unwrap(), text);
        }
    }

    #[test]
    fn test_string_coercion_by_target_type() {
        assert!(matches!(
            PgValue::from_value_for_type(&Value::String("42".into()), &Type::INT4),
            PgValue::Int32(42)
        ));
        assert!(matches!(
            PgValue::from_value_for_type(&Value::String("3.0".into()), &Type::INT8),
            PgValue::Int64(3)
        ));
        assert!(matches!(
            PgValue::from_value_for_type(&Value::String("Yes".into()), &Type::BOOL),
            PgValue::Bool(true)
        ));
        assert!(matches!(
            PgValue::from_value_for_type(&Value::String("2024-02-29".into()), &Type::DATE),
            PgValue::Date(_)
        ));
        assert!(matches!(
            PgValue::from_value_for_type(&Value::String("hello".into()), &Type::TEXT),
            PgValue::String(_)
        ));
    }

    #[test]
    fn test_numbers_follow_target_type() {
        assert!(matches!(
            PgValue::from_value_for_type(&Value::Int64(7), &Type::INT2),
            PgValue::Int16(7)
        ));
        assert!(matches!(
            PgValue::from_value_for_type(&Value::Int64(7), &Type::FLOAT8),
            PgValue::Float64(_)
        ));
        assert!(matches!(
            PgValue::from_value_for_type(&Value::Float64(2.5), &Type::NUMERIC),
            PgValue::Numeric(_)
        ));
        assert!(matches!(
            PgValue::from_value_for_type(&Value::Int64(70_000), &Type::INT2),
            PgValue::Invalid(_)
        ));
    }

    #[test]
    fn test_unconvertible_text_fails_to_bind() {
        let value = PgValue::from_value_for_type(&Value::String("abc".into()), &Type::INT4);
        let err = encode(&value, &Type::INT4).unwrap_err();
        assert_eq!(err, "cannot convert 'abc' to int4");
    }

    #[test]
    fn test_numeric_binding_writes_payload() {
        let value = PgValue::from_value_for_type(&Value::Decimal("19.99".into()), &Type::NUMERIC);
        assert_eq!(
            encode(&value, &Type::NUMERIC).unwrap(),
            encode_numeric("19.99").unwrap()
        );
    }
}
