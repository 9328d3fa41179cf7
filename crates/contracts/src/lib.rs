use std::collections::BTreeMap;

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Date, OffsetDateTime};

pub mod canonical;

/// A single nullable value flowing between the gate, the binder and routine results.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(Date),
    Timestamp(OffsetDateTime),
}

impl Scalar {
    pub fn text(value: impl Into<String>) -> Self {
        Scalar::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(v) => Some(*v),
            Scalar::Int(0) => Some(false),
            Scalar::Int(1) => Some(true),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<Date> {
        match self {
            Scalar::Date(v) => Some(*v),
            Scalar::Timestamp(v) => Some(v.date()),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Null => serde_json::Value::Null,
            Scalar::Bool(v) => serde_json::Value::Bool(*v),
            Scalar::Int(v) => serde_json::Value::from(*v),
            Scalar::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Scalar::Text(v) => serde_json::Value::String(v.clone()),
            Scalar::Date(v) => serde_json::Value::String(v.to_string()),
            Scalar::Timestamp(v) => serde_json::Value::String(format_timestamp(*v)),
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<Date> for Scalar {
    fn from(value: Date) -> Self {
        Scalar::Date(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Scalar::Null)
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scalar::Null => serializer.serialize_none(),
            Scalar::Bool(v) => serializer.serialize_bool(*v),
            Scalar::Int(v) => serializer.serialize_i64(*v),
            Scalar::Float(v) => serializer.serialize_f64(*v),
            Scalar::Text(v) => serializer.serialize_str(v),
            Scalar::Date(v) => serializer.collect_str(v),
            Scalar::Timestamp(v) => serializer.serialize_str(&format_timestamp(*v)),
        }
    }
}

fn format_timestamp(value: OffsetDateTime) -> String {
    value
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Ordered routine parameters. Re-inserting a name replaces the value in place,
/// so arity and binding order stay stable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: Vec<(String, Scalar)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Scalar>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Missing names read as `Null`, matching how the binder treats them.
    pub fn value(&self, name: &str) -> Scalar {
        self.get(name).cloned().unwrap_or(Scalar::Null)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut out = serde_json::Map::with_capacity(self.entries.len());
        for (k, v) in &self.entries {
            out.insert(k.clone(), v.to_json());
        }
        serde_json::Value::Object(out)
    }
}

impl Serialize for Params {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// One result row keyed by column name.
pub type Record = BTreeMap<String, Scalar>;

/// One result set.
pub type Table = Vec<Record>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResult {
    pub tables: Vec<Table>,
    pub rows_affected: u64,
}

impl RawResult {
    pub fn single(rows: Table) -> Self {
        let rows_affected = rows.len() as u64;
        Self {
            tables: vec![rows],
            rows_affected,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ExpectedReturn {
    #[default]
    Single,
    Multi,
    None,
}

impl ExpectedReturn {
    /// Unknown or empty names fall back to `Single` so callers that omit the
    /// mode keep working.
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "Multi" | "multi" | "MULTI" => ExpectedReturn::Multi,
            "None" | "none" | "NONE" => ExpectedReturn::None,
            _ => ExpectedReturn::Single,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    Create,
    Read,
    Update,
    Delete,
    List,
}

impl Permission {
    pub const ALL: [Permission; 5] = [
        Permission::Create,
        Permission::Read,
        Permission::Update,
        Permission::Delete,
        Permission::List,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Create => "CREATE",
            Permission::Read => "READ",
            Permission::Update => "UPDATE",
            Permission::Delete => "DELETE",
            Permission::List => "LIST",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Permission::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequirement {
    pub securable: String,
    pub permission: Permission,
}

impl PermissionRequirement {
    pub fn new(securable: impl Into<String>, permission: Permission) -> Self {
        Self {
            securable: securable.into(),
            permission,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Uniform response body for every HTTP outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = serde_json::Value> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub timestamp: String,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: now_rfc3339(),
        }
    }
}

impl Envelope<serde_json::Value> {
    pub fn failure(error: ErrorBody) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            timestamp: now_rfc3339(),
        }
    }
}

pub fn now_rfc3339() -> String {
    format_timestamp(OffsetDateTime::now_utc())
}
