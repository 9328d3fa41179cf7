//! Validation and authorization gate.
//!
//! A [`Gate`] is declared once per operation with the permissions it needs.
//! Each request is authorized against the caller's [`Credential`] first; only
//! then is the selected part of the request parsed against a declarative
//! [`Schema`], collecting every violation in one pass.

use std::collections::HashMap;

use taskline_contracts::{Params, PermissionRequirement};

pub mod authz;
pub mod schema;

pub use authz::{Credential, Denied, Grant, ParseGrantsError, authorize, parse_grants};
pub use schema::{Field, FieldKind, Schema, Violation};

use schema::{RawInput, check_field};

/// The part of an inbound request a schema is applied to.
#[derive(Debug, Clone, Copy)]
pub enum RequestSource<'a> {
    Body(&'a serde_json::Value),
    Route(&'a HashMap<String, String>),
    Query(&'a HashMap<String, String>),
    /// Route parameters take precedence over body keys of the same name.
    RouteAndBody {
        route: &'a HashMap<String, String>,
        body: &'a serde_json::Value,
    },
}

impl RequestSource<'_> {
    pub fn label(&self) -> &'static str {
        match self {
            RequestSource::Body(_) => "body",
            RequestSource::Route(_) => "route",
            RequestSource::Query(_) => "query",
            RequestSource::RouteAndBody { .. } => "route+body",
        }
    }

    fn lookup(&self, name: &str) -> Option<RawInput<'_>> {
        match self {
            RequestSource::Body(body) => body.get(name).map(RawInput::Json),
            RequestSource::Route(map) | RequestSource::Query(map) => {
                map.get(name).map(|v| RawInput::Text(v.as_str()))
            }
            RequestSource::RouteAndBody { route, body } => route
                .get(name)
                .map(|v| RawInput::Text(v.as_str()))
                .or_else(|| body.get(name).map(RawInput::Json)),
        }
    }

    fn body_shape_violation(&self) -> Option<Violation> {
        let body = match self {
            RequestSource::Body(body) => body,
            RequestSource::RouteAndBody { body, .. } => body,
            _ => return None,
        };
        if body.is_object() || body.is_null() {
            None
        } else {
            Some(Violation::new("body", "must be a JSON object"))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    pub params: Params,
    pub credential: Credential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    Unauthorized(Denied),
    Invalid(Vec<Violation>),
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateError::Unauthorized(_) => write!(f, "insufficient permission"),
            GateError::Invalid(violations) => {
                write!(f, "invalid request")?;
                for (idx, violation) in violations.iter().enumerate() {
                    let sep = if idx == 0 { ": " } else { "; " };
                    write!(f, "{}{} {}", sep, violation.field, violation.reason)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for GateError {}

pub type ValidationOutcome = Result<Validated, GateError>;

/// Per-operation permission contract plus the request-source conventions of
/// the CRUD verbs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gate {
    requirements: Vec<PermissionRequirement>,
}

impl Gate {
    pub fn new(requirements: Vec<PermissionRequirement>) -> Self {
        Self { requirements }
    }

    pub fn validate(
        &self,
        credential: &Credential,
        source: RequestSource<'_>,
        schema: &Schema,
    ) -> ValidationOutcome {
        if let Err(denied) = authorize(credential, &self.requirements) {
            tracing::debug!(
                principal_id = %credential.principal_id,
                missing = denied.missing.len(),
                "gate denied request"
            );
            return Err(GateError::Unauthorized(denied));
        }

        if let Some(violation) = source.body_shape_violation() {
            return Err(GateError::Invalid(vec![violation]));
        }

        let mut params = Params::new();
        let mut violations = Vec::new();
        for field in schema.fields() {
            match check_field(field, source.lookup(&field.name)) {
                Ok(value) => params.set(field.name.clone(), value),
                Err(reason) => violations.push(Violation::new(field.name.clone(), reason)),
            }
        }

        if !violations.is_empty() {
            return Err(GateError::Invalid(violations));
        }

        Ok(Validated {
            params,
            credential: credential.clone(),
        })
    }

    pub fn create(
        &self,
        credential: &Credential,
        body: &serde_json::Value,
        schema: &Schema,
    ) -> ValidationOutcome {
        self.validate(credential, RequestSource::Body(body), schema)
    }

    pub fn read(
        &self,
        credential: &Credential,
        route: &HashMap<String, String>,
        schema: &Schema,
    ) -> ValidationOutcome {
        self.validate(credential, RequestSource::Route(route), schema)
    }

    /// Validates route and body together. Route parameters override body
    /// keys of the same name, so a body `id` never replaces the path `id`.
    pub fn update(
        &self,
        credential: &Credential,
        route: &HashMap<String, String>,
        body: &serde_json::Value,
        schema: &Schema,
    ) -> ValidationOutcome {
        self.validate(credential, RequestSource::RouteAndBody { route, body }, schema)
    }

    pub fn delete(
        &self,
        credential: &Credential,
        route: &HashMap<String, String>,
        schema: &Schema,
    ) -> ValidationOutcome {
        self.validate(credential, RequestSource::Route(route), schema)
    }

    pub fn list(
        &self,
        credential: &Credential,
        query: &HashMap<String, String>,
        schema: &Schema,
    ) -> ValidationOutcome {
        self.validate(credential, RequestSource::Query(query), schema)
    }
}
