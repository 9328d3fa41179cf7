use serde::{Deserialize, Serialize};
use taskline_contracts::Scalar;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// Positive integer identifier.
    Id,
    /// String whose length in characters lies in `min_len..=max_len`.
    Text { min_len: usize, max_len: usize },
    Int { min: i64, max: i64 },
    /// 0/1 or boolean, normalized to `Scalar::Bool`.
    Bit,
    /// `YYYY-MM-DD` or an RFC 3339 timestamp, normalized to a date.
    Date,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub nullable: bool,
    pub default: Option<Scalar>,
}

impl Field {
    fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            nullable: false,
            default: None,
        }
    }

    pub fn id(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Id)
    }

    pub fn text(name: impl Into<String>, min_len: usize, max_len: usize) -> Self {
        Self::new(name, FieldKind::Text { min_len, max_len })
    }

    pub fn int(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self::new(name, FieldKind::Int { min, max })
    }

    pub fn bit(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Bit)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Date)
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Accepts explicit `null` and makes the field optional.
    pub fn nullable(mut self) -> Self {
        self.required = false;
        self.nullable = true;
        self
    }

    pub fn default(mut self, value: impl Into<Scalar>) -> Self {
        self.required = false;
        self.default = Some(value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    pub reason: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A raw input value before coercion. Route and query values arrive as text
/// and are coerced; body values must already carry the right JSON type.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RawInput<'a> {
    Json(&'a serde_json::Value),
    Text(&'a str),
}

pub(crate) fn check_field(field: &Field, input: Option<RawInput<'_>>) -> Result<Scalar, String> {
    let input = match input {
        Some(RawInput::Json(serde_json::Value::Null)) => {
            return if field.nullable {
                Ok(Scalar::Null)
            } else {
                Err("must not be null".to_string())
            };
        }
        Some(RawInput::Text(raw)) if raw.trim().is_empty() => None,
        other => other,
    };

    let Some(input) = input else {
        if let Some(default) = field.default.as_ref() {
            return Ok(default.clone());
        }
        return if field.required {
            Err("required".to_string())
        } else {
            Ok(Scalar::Null)
        };
    };

    match &field.kind {
        FieldKind::Id => {
            let value = coerce_int(input)?;
            if value < 1 {
                return Err("must be a positive integer".to_string());
            }
            Ok(Scalar::Int(value))
        }
        FieldKind::Text { min_len, max_len } => {
            let text = match input {
                RawInput::Json(serde_json::Value::String(s)) => s.as_str(),
                RawInput::Text(s) => s,
                RawInput::Json(_) => return Err("expected string".to_string()),
            };
            let len = text.chars().count();
            if len < *min_len {
                return Err(format!("must be at least {} characters", min_len));
            }
            if len > *max_len {
                return Err(format!("must be at most {} characters", max_len));
            }
            Ok(Scalar::Text(text.to_string()))
        }
        FieldKind::Int { min, max } => {
            let value = coerce_int(input)?;
            if value < *min {
                return Err(format!("must be >= {}", min));
            }
            if value > *max {
                return Err(format!("must be <= {}", max));
            }
            Ok(Scalar::Int(value))
        }
        FieldKind::Bit => {
            let value = match input {
                RawInput::Json(serde_json::Value::Bool(b)) => Some(*b),
                RawInput::Json(serde_json::Value::Number(n)) => match n.as_i64() {
                    Some(0) => Some(false),
                    Some(1) => Some(true),
                    _ => None,
                },
                RawInput::Text(s) => match s.trim() {
                    "0" | "false" => Some(false),
                    "1" | "true" => Some(true),
                    _ => None,
                },
                RawInput::Json(_) => None,
            };
            value
                .map(Scalar::Bool)
                .ok_or_else(|| "expected 0 or 1".to_string())
        }
        FieldKind::Date => {
            let raw = match input {
                RawInput::Json(serde_json::Value::String(s)) => s.as_str(),
                RawInput::Text(s) => s,
                RawInput::Json(_) => return Err("expected date string".to_string()),
            };
            parse_date(raw)
                .map(Scalar::Date)
                .ok_or_else(|| "expected date (YYYY-MM-DD or RFC 3339)".to_string())
        }
    }
}

fn coerce_int(input: RawInput<'_>) -> Result<i64, String> {
    let parsed = match input {
        RawInput::Json(serde_json::Value::Number(n)) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                .map(|f| f as i64)
        }),
        RawInput::Text(s) => s.trim().parse::<i64>().ok(),
        RawInput::Json(_) => None,
    };
    parsed.ok_or_else(|| "expected integer".to_string())
}

pub(crate) fn parse_date(raw: &str) -> Option<Date> {
    let raw = raw.trim();
    if let Ok(date) = Date::parse(raw, format_description!("[year]-[month]-[day]")) {
        return Some(date);
    }
    OffsetDateTime::parse(raw, &Rfc3339)
        .ok()
        .map(|ts| ts.date())
}
