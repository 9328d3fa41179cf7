use serde::Serialize;

/// Infrastructure-level cause of a failed routine call.
#[derive(Debug)]
pub enum Fault {
    Timeout,
    Sqlx(sqlx::Error),
    UnsupportedColumn { column: String, type_name: String },
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Timeout => write!(f, "routine call timed out"),
            Fault::Sqlx(err) => write!(f, "routine sql error: {}", err),
            Fault::UnsupportedColumn { column, type_name } => write!(
                f,
                "column `{}` has unsupported type {}",
                column, type_name
            ),
        }
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Fault::Sqlx(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Fault {
    fn from(value: sqlx::Error) -> Self {
        Fault::Sqlx(value)
    }
}

/// What a backend reports when a call does not produce a result.
#[derive(Debug)]
pub enum Failure {
    /// The routine itself rejected the call with the business-rule code.
    Business { code: String, message: String },
    Infrastructure(Fault),
}

impl From<Fault> for Failure {
    fn from(value: Fault) -> Self {
        Failure::Infrastructure(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    InvalidRoutineName(String),
    InvalidParameterName(String),
    DuplicateResultSetName(String),
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindError::InvalidRoutineName(name) => {
                write!(f, "invalid routine name `{}`", name)
            }
            BindError::InvalidParameterName(name) => {
                write!(f, "invalid parameter name `{}`", name)
            }
            BindError::DuplicateResultSetName(name) => {
                write!(f, "duplicate result set name `{}`", name)
            }
        }
    }
}

impl std::error::Error for BindError {}

/// Parameter names plus a digest of their values. Safe to log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParamSummary {
    pub names: Vec<String>,
    pub fingerprint: String,
}

impl std::fmt::Display for ParamSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short = self.fingerprint.get(..12).unwrap_or(&self.fingerprint);
        write!(f, "[{}] sha256:{}", self.names.join(", "), short)
    }
}

#[derive(Debug)]
pub enum RoutineError {
    Bind(BindError),
    /// Business-rule rejection raised by the routine; `message` is meant for
    /// the end user.
    Business {
        routine: String,
        code: String,
        message: String,
    },
    Execution {
        routine: String,
        params: ParamSummary,
        cause: Fault,
    },
    /// Begin, commit or rollback failed at the driver level.
    Transaction {
        stage: &'static str,
        cause: Fault,
    },
    /// The transaction context was already committed, rolled back or closed.
    TransactionClosed,
}

impl RoutineError {
    pub(crate) fn from_failure(routine: &str, params: &ParamSummary, failure: Failure) -> Self {
        match failure {
            Failure::Business { code, message } => RoutineError::Business {
                routine: routine.to_string(),
                code,
                message,
            },
            Failure::Infrastructure(cause) => RoutineError::Execution {
                routine: routine.to_string(),
                params: params.clone(),
                cause,
            },
        }
    }

    pub(crate) fn from_transaction_failure(stage: &'static str, failure: Failure) -> Self {
        match failure {
            Failure::Business { code, message } => RoutineError::Business {
                routine: stage.to_string(),
                code,
                message,
            },
            Failure::Infrastructure(cause) => RoutineError::Transaction { stage, cause },
        }
    }

    pub fn is_business(&self) -> bool {
        matches!(self, RoutineError::Business { .. })
    }
}

impl std::fmt::Display for RoutineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutineError::Bind(err) => write!(f, "{}", err),
            RoutineError::Business { message, .. } => write!(f, "{}", message),
            RoutineError::Execution {
                routine,
                params,
                cause,
            } => write!(f, "routine {} failed with {}: {}", routine, params, cause),
            RoutineError::Transaction { stage, cause } => {
                write!(f, "transaction {} failed: {}", stage, cause)
            }
            RoutineError::TransactionClosed => write!(f, "transaction is no longer open"),
        }
    }
}

impl std::error::Error for RoutineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RoutineError::Bind(err) => Some(err),
            RoutineError::Execution { cause, .. } | RoutineError::Transaction { cause, .. } => {
                Some(cause)
            }
            _ => None,
        }
    }
}

impl From<BindError> for RoutineError {
    fn from(value: BindError) -> Self {
        RoutineError::Bind(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_display_names_params_but_not_values() {
        let err = RoutineError::Execution {
            routine: "functional.spTaskGet".to_string(),
            params: ParamSummary {
                names: vec!["idAccount".to_string(), "idTask".to_string()],
                fingerprint: "0123456789abcdef".repeat(4),
            },
            cause: Fault::Timeout,
        };
        assert_eq!(
            err.to_string(),
            "routine functional.spTaskGet failed with [idAccount, idTask] sha256:0123456789ab: routine call timed out"
        );
    }

    #[test]
    fn business_display_is_the_routine_message() {
        let err = RoutineError::from_failure(
            "functional.spTaskDelete",
            &ParamSummary::default(),
            Failure::Business {
                code: "51000".to_string(),
                message: "TaskDoesntExist".to_string(),
            },
        );
        assert!(err.is_business());
        assert_eq!(err.to_string(), "TaskDoesntExist");
    }
}
