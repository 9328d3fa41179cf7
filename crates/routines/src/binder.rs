use taskline_contracts::canonical::fingerprint_params;
use taskline_contracts::{Params, Scalar};

use crate::error::{BindError, ParamSummary};

const MAX_IDENTIFIER_LEN: usize = 63;

pub fn is_identifier(raw: &str) -> bool {
    let mut chars = raw.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    raw.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn quote_identifier(raw: &str) -> String {
    format!("\"{}\"", raw.replace('"', "\"\""))
}

/// Schema-qualified routine name, e.g. `functional.spTaskCreate`.
///
/// The bracketed form `[functional].[spTaskCreate]` is accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutineName {
    schema: String,
    name: String,
}

impl RoutineName {
    pub fn parse(raw: &str) -> Result<Self, BindError> {
        let invalid = || BindError::InvalidRoutineName(raw.to_string());
        let (schema, name) = raw.trim().split_once('.').ok_or_else(invalid)?;
        let unbracket = |part: &str| {
            let part = part.trim();
            part.strip_prefix('[')
                .and_then(|p| p.strip_suffix(']'))
                .unwrap_or(part)
                .to_string()
        };
        let schema = unbracket(schema);
        let name = unbracket(name);
        if !is_identifier(&schema) || !is_identifier(&name) {
            return Err(invalid());
        }
        Ok(Self { schema, name })
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    fn quoted(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.name)
        )
    }
}

impl std::fmt::Display for RoutineName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// A routine call ready for execution: SQL text plus positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundCall {
    pub routine: RoutineName,
    pub sql: String,
    pub params: Params,
    /// The routine returns `SETOF refcursor`; each cursor is one result set.
    pub cursors: bool,
    pub summary: ParamSummary,
}

impl BoundCall {
    /// Non-null values in placeholder order. Nulls are rendered inline.
    pub fn args(&self) -> impl Iterator<Item = &Scalar> {
        self.params.iter().map(|(_, v)| v).filter(|v| !v.is_null())
    }
}

/// Binds every parameter by name, in the order given. Null values are passed
/// as a literal `NULL` in their named slot.
pub fn bind(routine: &RoutineName, params: &Params, cursors: bool) -> Result<BoundCall, BindError> {
    let mut slots = Vec::with_capacity(params.len());
    let mut position = 0usize;

    for (name, value) in params.iter() {
        if !is_identifier(name) {
            return Err(BindError::InvalidParameterName(name.to_string()));
        }
        let slot = if value.is_null() {
            "NULL".to_string()
        } else {
            position += 1;
            format!("${}", position)
        };
        slots.push(format!("{} => {}", quote_identifier(name), slot));
    }

    let call = format!("{}({})", routine.quoted(), slots.join(", "));
    let sql = if cursors {
        format!("SELECT CAST(c AS text) FROM {} AS c", call)
    } else {
        format!("SELECT * FROM {}", call)
    };

    Ok(BoundCall {
        routine: routine.clone(),
        sql,
        params: params.clone(),
        cursors,
        summary: ParamSummary {
            names: params.names().map(str::to_string).collect(),
            fingerprint: fingerprint_params(params),
        },
    })
}

/// `FETCH ALL` for a cursor name returned by a refcursor routine.
pub(crate) fn fetch_cursor_sql(cursor: &str) -> String {
    format!("FETCH ALL FROM {}", quote_identifier(cursor))
}
