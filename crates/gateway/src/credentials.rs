use axum::http::HeaderMap;
use taskline_policy::{Credential, Grant};

use crate::config::GatewayConfig;

pub const LOCAL_AUTH_SECRET_HEADER: &str = "x-taskline-local-auth-secret";
pub const PRINCIPAL_ID_HEADER: &str = "x-taskline-principal-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for CredentialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CredentialError {}

/// Resolves the caller's credential for one request.
pub trait CredentialSource: Send + Sync {
    fn credential(&self, headers: &HeaderMap) -> Result<Credential, CredentialError>;
}

/// Fixed stand-in credential. Every caller gets the configured account, user
/// and grants; an optional shared secret gates access.
#[derive(Debug, Clone)]
pub struct LocalCredentials {
    principal_id: String,
    account_id: i64,
    user_id: i64,
    grants: Vec<Grant>,
    shared_secret: Option<String>,
}

impl LocalCredentials {
    pub fn new(
        principal_id: impl Into<String>,
        account_id: i64,
        user_id: i64,
        grants: Vec<Grant>,
        shared_secret: Option<String>,
    ) -> Self {
        Self {
            principal_id: principal_id.into(),
            account_id,
            user_id,
            grants,
            shared_secret,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.local_principal_id.clone(),
            config.local_account_id,
            config.local_user_id,
            config.local_grants.clone(),
            config.local_auth_shared_secret.clone(),
        )
    }

    fn check_shared_secret(&self, headers: &HeaderMap) -> Result<(), CredentialError> {
        let Some(expected) = self.shared_secret.as_deref() else {
            return Ok(());
        };

        let provided = header_value(headers, LOCAL_AUTH_SECRET_HEADER).ok_or_else(|| {
            CredentialError {
                code: "ERR_AUTH_REQUIRED",
                message: "missing local auth secret".to_string(),
            }
        })?;

        if provided != expected {
            return Err(CredentialError {
                code: "ERR_AUTH_INVALID",
                message: "invalid local auth secret".to_string(),
            });
        }
        Ok(())
    }
}

impl CredentialSource for LocalCredentials {
    fn credential(&self, headers: &HeaderMap) -> Result<Credential, CredentialError> {
        self.check_shared_secret(headers)?;
        let principal_id = header_value(headers, PRINCIPAL_ID_HEADER)
            .unwrap_or(self.principal_id.as_str())
            .to_string();
        Ok(Credential::new(
            principal_id,
            self.account_id,
            self.user_id,
            self.grants.clone(),
        ))
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}
