use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use taskline_contracts::RawResult;
use ulid::Ulid;

use crate::backend::{RoutineBackend, RoutineSession};
use crate::binder::BoundCall;
use crate::error::RoutineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
    /// Commit or rollback failed; the connection has been released.
    Closed,
}

/// A transaction on a dedicated connection. Not `Clone`; hand it to one
/// logical operation by `&mut`.
///
/// Dropping an open context rolls the transaction back.
pub struct TransactionContext {
    id: Ulid,
    session: Option<Box<dyn RoutineSession>>,
    state: TxState,
}

impl TransactionContext {
    fn new(session: Box<dyn RoutineSession>) -> Self {
        Self {
            id: Ulid::new(),
            session: Some(session),
            state: TxState::Open,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TxState::Open
    }

    pub(crate) async fn invoke(&mut self, call: &BoundCall) -> Result<RawResult, RoutineError> {
        let session = match (self.state, self.session.as_mut()) {
            (TxState::Open, Some(session)) => session,
            _ => return Err(RoutineError::TransactionClosed),
        };
        session
            .invoke(call)
            .await
            .map_err(|failure| {
                RoutineError::from_failure(&call.routine.qualified(), &call.summary, failure)
            })
    }

    pub async fn commit(&mut self) -> Result<(), RoutineError> {
        let session = self.take_open()?;
        match session.commit().await {
            Ok(()) => {
                self.state = TxState::Committed;
                tracing::debug!(tx_id = %self.id, "transaction committed");
                Ok(())
            }
            Err(failure) => {
                self.state = TxState::Closed;
                Err(RoutineError::from_transaction_failure("commit", failure))
            }
        }
    }

    pub async fn rollback(&mut self) -> Result<(), RoutineError> {
        let session = self.take_open()?;
        match session.rollback().await {
            Ok(()) => {
                self.state = TxState::RolledBack;
                tracing::debug!(tx_id = %self.id, "transaction rolled back");
                Ok(())
            }
            Err(failure) => {
                self.state = TxState::Closed;
                Err(RoutineError::from_transaction_failure("rollback", failure))
            }
        }
    }

    fn take_open(&mut self) -> Result<Box<dyn RoutineSession>, RoutineError> {
        if self.state != TxState::Open {
            return Err(RoutineError::TransactionClosed);
        }
        self.session.take().ok_or(RoutineError::TransactionClosed)
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if self.state == TxState::Open && self.session.is_some() {
            tracing::warn!(tx_id = %self.id, "transaction dropped while open; rolling back");
        }
    }
}

pub type ScopeFuture<'t, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 't>>;

#[derive(Clone)]
pub struct TransactionManager {
    backend: Arc<dyn RoutineBackend>,
}

impl TransactionManager {
    pub fn new(backend: Arc<dyn RoutineBackend>) -> Self {
        Self { backend }
    }

    pub async fn begin(&self) -> Result<TransactionContext, RoutineError> {
        let session = self
            .backend
            .begin()
            .await
            .map_err(|failure| RoutineError::from_transaction_failure("begin", failure))?;
        let ctx = TransactionContext::new(session);
        tracing::debug!(tx_id = %ctx.id, "transaction started");
        Ok(ctx)
    }

    /// Runs `f` inside a fresh transaction. Commits when `f` succeeds and
    /// leaves the context open, rolls back when it fails. If the future is
    /// cancelled the context is dropped, which also rolls back.
    pub async fn scope<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut TransactionContext) -> ScopeFuture<'t, T, E>,
        E: From<RoutineError>,
    {
        let mut ctx = self.begin().await?;
        let outcome = f(&mut ctx).await;

        match outcome {
            Ok(value) => {
                if ctx.is_open() {
                    ctx.commit().await?;
                }
                Ok(value)
            }
            Err(err) => {
                if ctx.is_open()
                    && let Err(rollback_err) = ctx.rollback().await
                {
                    tracing::warn!(
                        tx_id = %ctx.id,
                        error = %rollback_err,
                        "rollback after failed scope did not complete"
                    );
                }
                Err(err)
            }
        }
    }
}
