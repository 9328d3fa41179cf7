//! Stored-routine plumbing: bind parameters, invoke routines, reshape their
//! result sets and scope multi-call work in transactions.

use taskline_contracts::{ExpectedReturn, Params};

pub mod backend;
pub mod binder;
pub mod error;
pub mod invoker;
pub mod postgres;
#[cfg(any(test, feature = "scripted"))]
pub mod scripted;
pub mod shaper;
pub mod transaction;

pub use backend::{RoutineBackend, RoutineSession};
pub use binder::{BoundCall, RoutineName, bind};
pub use error::{BindError, Failure, Fault, ParamSummary, RoutineError};
pub use invoker::Invoker;
pub use postgres::{DEFAULT_BUSINESS_SQLSTATE, PgBackend, PgBackendOptions, PgPoolSettings};
pub use shaper::{NameMismatch, Shaped, name_mismatch, shape};
pub use transaction::{ScopeFuture, TransactionContext, TransactionManager, TxState};

/// A fully described routine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutineCall {
    pub name: RoutineName,
    pub parameters: Params,
    pub expected_return: ExpectedReturn,
    pub result_set_names: Option<Vec<String>>,
}

impl RoutineCall {
    pub fn new(name: RoutineName, parameters: Params) -> Self {
        Self {
            name,
            parameters,
            expected_return: ExpectedReturn::Single,
            result_set_names: None,
        }
    }

    pub fn expecting(mut self, expected_return: ExpectedReturn) -> Self {
        self.expected_return = expected_return;
        self
    }

    /// Names result sets by position and switches to `Multi`. Names must be
    /// distinct.
    pub fn with_result_sets(mut self, names: Vec<String>) -> Result<Self, BindError> {
        for (idx, name) in names.iter().enumerate() {
            if names[..idx].contains(name) {
                return Err(BindError::DuplicateResultSetName(name.clone()));
            }
        }
        self.expected_return = ExpectedReturn::Multi;
        self.result_set_names = Some(names);
        Ok(self)
    }

    pub fn result_set_names(&self) -> Option<&[String]> {
        self.result_set_names.as_deref()
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
