use taskline_contracts::{Permission, PermissionRequirement};

pub const WILDCARD: &str = "*";

/// One capability held by a caller. `securable == "*"` matches every securable
/// and `permission == None` matches every permission.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Grant {
    pub securable: String,
    pub permission: Option<Permission>,
}

impl Grant {
    pub fn new(securable: impl Into<String>, permission: Permission) -> Self {
        Self {
            securable: securable.into(),
            permission: Some(permission),
        }
    }

    pub fn all() -> Self {
        Self {
            securable: WILDCARD.to_string(),
            permission: None,
        }
    }

    pub fn covers(&self, requirement: &PermissionRequirement) -> bool {
        let securable_ok = self.securable == WILDCARD
            || self.securable.eq_ignore_ascii_case(&requirement.securable);
        let permission_ok = self
            .permission
            .is_none_or(|permission| permission == requirement.permission);
        securable_ok && permission_ok
    }
}

/// Caller identity plus capabilities, supplied per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub principal_id: String,
    pub account_id: i64,
    pub user_id: i64,
    grants: Vec<Grant>,
}

impl Credential {
    pub fn new(
        principal_id: impl Into<String>,
        account_id: i64,
        user_id: i64,
        mut grants: Vec<Grant>,
    ) -> Self {
        grants.sort();
        grants.dedup();
        Self {
            principal_id: principal_id.into(),
            account_id,
            user_id,
            grants,
        }
    }

    pub fn allows(&self, requirement: &PermissionRequirement) -> bool {
        self.grants.iter().any(|grant| grant.covers(requirement))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denied {
    pub missing: Vec<PermissionRequirement>,
}

/// Checks every requirement, not just the first failing one, so the denial
/// can be logged in full. Callers must not echo `missing` to clients.
pub fn authorize(
    credential: &Credential,
    requirements: &[PermissionRequirement],
) -> Result<(), Denied> {
    let missing = requirements
        .iter()
        .filter(|requirement| !credential.allows(requirement))
        .cloned()
        .collect::<Vec<_>>();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(Denied { missing })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseGrantsError {
    message: String,
}

impl ParseGrantsError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ParseGrantsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseGrantsError {}

/// Parses `SECURABLE:PERMISSION` pairs separated by commas, e.g.
/// `TASK:CREATE,TASK:READ` or `*:*`.
pub fn parse_grants(raw: &str) -> Result<Vec<Grant>, ParseGrantsError> {
    let mut out = Vec::new();

    for entry in raw.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let (securable, permission) = entry.split_once(':').ok_or_else(|| {
            ParseGrantsError::new(format!(
                "grant `{}` must look like SECURABLE:PERMISSION",
                entry
            ))
        })?;

        let securable = securable.trim();
        if securable.is_empty() {
            return Err(ParseGrantsError::new(format!(
                "grant `{}` has an empty securable",
                entry
            )));
        }

        let permission = match permission.trim() {
            WILDCARD => None,
            other => Some(Permission::parse(other).ok_or_else(|| {
                ParseGrantsError::new(format!("grant `{}` has unknown permission", entry))
            })?),
        };

        out.push(Grant {
            securable: securable.to_ascii_uppercase(),
            permission,
        });
    }

    out.sort();
    out.dedup();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(permission: Permission) -> PermissionRequirement {
        PermissionRequirement::new("TASK", permission)
    }

    #[test]
    fn parse_grants_accepts_pairs_and_wildcards() {
        let grants = parse_grants("task:read, TASK:CREATE,TASK:READ,*:*").expect("grants parse");
        assert_eq!(
            grants,
            vec![
                Grant::all(),
                Grant::new("TASK", Permission::Create),
                Grant::new("TASK", Permission::Read),
            ]
        );
        assert!(parse_grants("").expect("empty grants parse").is_empty());
    }

    #[test]
    fn parse_grants_rejects_invalid_shapes() {
        let err = parse_grants("TASK").unwrap_err();
        assert!(err.to_string().contains("SECURABLE:PERMISSION"));

        let err = parse_grants("TASK:ADMIN").unwrap_err();
        assert!(err.to_string().contains("unknown permission"));

        let err = parse_grants(":READ").unwrap_err();
        assert!(err.to_string().contains("empty securable"));
    }

    #[test]
    fn authorize_reports_every_missing_requirement() {
        let credential = Credential::new(
            "reader",
            1,
            1,
            vec![Grant::new("TASK", Permission::Read)],
        );

        assert!(authorize(&credential, &[task(Permission::Read)]).is_ok());

        let denied = authorize(
            &credential,
            &[
                task(Permission::Update),
                task(Permission::Read),
                PermissionRequirement::new("USER", Permission::Read),
            ],
        )
        .unwrap_err();
        assert_eq!(
            denied.missing,
            vec![
                task(Permission::Update),
                PermissionRequirement::new("USER", Permission::Read),
            ]
        );
    }

    #[test]
    fn securable_wildcard_respects_permission() {
        let credential = Credential::new(
            "lister",
            1,
            1,
            vec![Grant {
                securable: WILDCARD.to_string(),
                permission: Some(Permission::List),
            }],
        );
        assert!(credential.allows(&task(Permission::List)));
        assert!(!credential.allows(&task(Permission::Delete)));
    }
}
