//! Parameter declarations and validation for built-in strategy classes.
//!
//! A built-in record's source text is a JSON object. Every key must match a
//! declared [`ParamSpec`] and every value must have the declared kind and
//! lie within its range. Missing optional parameters take their default.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use stratguard_core::{Error, Result};

/// Type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// Integer, JSON integers only
    Int,
    /// Floating point, any JSON number
    Float,
    /// Boolean
    Bool,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        })
    }
}

/// A validated parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// Boolean value
    Bool(bool),
}

impl ParamValue {
    fn as_f64(self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(v as f64),
            Self::Float(v) => Some(v),
            Self::Bool(_) => None,
        }
    }
}

/// Declaration of one parameter.
///
/// # Examples
///
/// ```
/// use stratguard_loader::params::{ParamSpec, ParamValue, validate};
///
/// let specs = [
///     ParamSpec::int("lookback").with_range(1.0, 250.0),
///     ParamSpec::float("threshold").with_default(ParamValue::Float(0.0)),
/// ];
/// let params = validate(&specs, r#"{"lookback": 20}"#).unwrap();
/// assert_eq!(params.get_int("lookback").unwrap(), 20);
/// assert_eq!(params.get_float("threshold").unwrap(), 0.0);
///
/// assert!(validate(&specs, r#"{"lookback": 0}"#).is_err());
/// assert!(validate(&specs, r#"{"lookback": 5, "leverage": 3}"#).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    /// Parameter name
    pub name: String,
    /// Value kind
    pub kind: ParamKind,
    /// Inclusive lower bound for numeric kinds
    pub min: Option<f64>,
    /// Inclusive upper bound for numeric kinds
    pub max: Option<f64>,
    /// Value used when the parameter is absent
    pub default: Option<ParamValue>,
    /// Whether the parameter must be given
    pub required: bool,
}

impl ParamSpec {
    fn new(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            min: None,
            max: None,
            default: None,
            required: true,
        }
    }

    /// Required integer parameter.
    #[must_use]
    pub fn int(name: &str) -> Self {
        Self::new(name, ParamKind::Int)
    }

    /// Required float parameter.
    #[must_use]
    pub fn float(name: &str) -> Self {
        Self::new(name, ParamKind::Float)
    }

    /// Required boolean parameter.
    #[must_use]
    pub fn bool(name: &str) -> Self {
        Self::new(name, ParamKind::Bool)
    }

    /// Sets an inclusive range.
    #[must_use]
    pub const fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Makes the parameter optional with a default.
    #[must_use]
    pub const fn with_default(mut self, default: ParamValue) -> Self {
        self.default = Some(default);
        self.required = false;
        self
    }

    fn coerce(&self, value: &Value) -> Result<ParamValue> {
        let parsed = match (self.kind, value) {
            (ParamKind::Int, Value::Number(n)) => n.as_i64().map(ParamValue::Int),
            (ParamKind::Float, Value::Number(n)) => n.as_f64().map(ParamValue::Float),
            (ParamKind::Bool, Value::Bool(b)) => Some(ParamValue::Bool(*b)),
            _ => None,
        };
        let value = parsed.ok_or_else(|| self.invalid(format!("expected {}, got {value}", self.kind)))?;
        if let Some(v) = value.as_f64() {
            if let Some(min) = self.min
                && v < min
            {
                return Err(self.invalid(format!("{v} is below the minimum {min}")));
            }
            if let Some(max) = self.max
                && v > max
            {
                return Err(self.invalid(format!("{v} is above the maximum {max}")));
            }
        }
        Ok(value)
    }

    fn invalid(&self, reason: String) -> Error {
        Error::ValidationError {
            field: self.name.clone(),
            reason,
        }
    }
}

/// Validated parameters of one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Params {
    values: BTreeMap<String, ParamValue>,
}

impl Params {
    fn value(&self, name: &str) -> Result<ParamValue> {
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| Error::ValidationError {
                field: name.to_string(),
                reason: "parameter not declared".to_string(),
            })
    }

    /// Reads an integer parameter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValidationError`] if absent or not an integer.
    pub fn get_int(&self, name: &str) -> Result<i64> {
        match self.value(name)? {
            ParamValue::Int(v) => Ok(v),
            other => Err(mistyped(name, "int", other)),
        }
    }

    /// Reads a numeric parameter; integers are widened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValidationError`] if absent or not numeric.
    pub fn get_float(&self, name: &str) -> Result<f64> {
        let value = self.value(name)?;
        value.as_f64().ok_or_else(|| mistyped(name, "float", value))
    }

    /// Reads a boolean parameter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValidationError`] if absent or not a boolean.
    pub fn get_bool(&self, name: &str) -> Result<bool> {
        match self.value(name)? {
            ParamValue::Bool(v) => Ok(v),
            other => Err(mistyped(name, "bool", other)),
        }
    }

    /// Iterates name/value pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

fn mistyped(name: &str, expected: &str, found: ParamValue) -> Error {
    Error::ValidationError {
        field: name.to_string(),
        reason: format!("expected {expected}, got {found:?}"),
    }
}

/// Parses `source_text` as a JSON object and checks it against `specs`.
///
/// Empty text is an empty object.
///
/// # Errors
///
/// Returns [`Error::ValidationError`] naming the first offending parameter:
/// unknown, mistyped, out of range or missing.
pub fn validate(specs: &[ParamSpec], source_text: &str) -> Result<Params> {
    let object = if source_text.trim().is_empty() {
        serde_json::Map::new()
    } else {
        match serde_json::from_str::<Value>(source_text) {
            Ok(Value::Object(object)) => object,
            Ok(other) => {
                return Err(Error::ValidationError {
                    field: "parameters".to_string(),
                    reason: format!("expected a JSON object, got {other}"),
                });
            }
            Err(err) => {
                return Err(Error::ValidationError {
                    field: "parameters".to_string(),
                    reason: format!("invalid JSON: {err}"),
                });
            }
        }
    };

    if let Some(unknown) = object
        .keys()
        .find(|key| !specs.iter().any(|spec| spec.name == **key))
    {
        return Err(Error::ValidationError {
            field: unknown.clone(),
            reason: "unknown parameter".to_string(),
        });
    }

    let mut values = BTreeMap::new();
    for spec in specs {
        let value = match object.get(&spec.name) {
            Some(raw) => spec.coerce(raw)?,
            None => match spec.default {
                Some(default) if !spec.required => default,
                _ => return Err(spec.invalid("missing required parameter".to_string())),
            },
        };
        values.insert(spec.name.clone(), value);
    }
    Ok(Params { values })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<ParamSpec> {
        vec![
            ParamSpec::int("fast").with_range(1.0, 100.0),
            ParamSpec::float("threshold")
                .with_range(0.0, 1.0)
                .with_default(ParamValue::Float(0.01)),
            ParamSpec::bool("long_only").with_default(ParamValue::Bool(false)),
        ]
    }

    fn field_of(err: &Error) -> &str {
        match err {
            Error::ValidationError { field, .. } => field,
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_defaults_fill_missing_optionals() {
        let params = validate(&specs(), r#"{"fast": 5}"#).unwrap();
        assert_eq!(params.get_int("fast").unwrap(), 5);
        assert!((params.get_float("threshold").unwrap() - 0.01).abs() < f64::EPSILON);
        assert!(!params.get_bool("long_only").unwrap());
        assert_eq!(params.iter().count(), 3);
    }

    #[test]
    fn test_int_widens_to_float() {
        let params = validate(&specs(), r#"{"fast": 5, "threshold": 1}"#).unwrap();
        assert!((params.get_float("threshold").unwrap() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rejections_name_the_field() {
        let cases = [
            (r#"{"fast": 5, "leverage": 2}"#, "leverage"),
            (r#"{"fast": 2.5}"#, "fast"),
            (r#"{"fast": "5"}"#, "fast"),
            (r#"{"fast": 0}"#, "fast"),
            (r#"{"fast": 5, "threshold": 1.5}"#, "threshold"),
            (r#"{"fast": 5, "long_only": 1}"#, "long_only"),
            ("{}", "fast"),
            ("[1, 2]", "parameters"),
            ("{fast: 5", "parameters"),
        ];
        for (text, field) in cases {
            let err = validate(&specs(), text).unwrap_err();
            assert!(err.is_validation_error(), "{text}");
            assert_eq!(field_of(&err), field, "{text}");
        }
    }

    #[test]
    fn test_empty_text_is_empty_object() {
        let optional = [ParamSpec::int("n").with_default(ParamValue::Int(3))];
        let params = validate(&optional, "  ").unwrap();
        assert_eq!(params.get_int("n").unwrap(), 3);
    }

    #[test]
    fn test_getter_type_mismatch() {
        let params = validate(&specs(), r#"{"fast": 5}"#).unwrap();
        assert!(params.get_bool("fast").is_err());
        assert!(params.get_int("missing").is_err());
    }
}
