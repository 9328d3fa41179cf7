use async_trait::async_trait;
use taskline_contracts::RawResult;

use crate::binder::BoundCall;
use crate::error::Failure;

/// Executes bound routine calls. The invoker and transaction manager only
/// see this trait, so tests can substitute an in-memory backend.
#[async_trait]
pub trait RoutineBackend: Send + Sync {
    /// Runs one call on a pooled connection.
    async fn invoke(&self, call: &BoundCall) -> Result<RawResult, Failure>;

    /// Opens a transaction on a dedicated connection.
    async fn begin(&self) -> Result<Box<dyn RoutineSession>, Failure>;

    /// Cheap liveness probe used by readiness checks.
    async fn ping(&self) -> Result<(), Failure>;
}

/// One open transaction. Dropping a session without commit or rollback
/// rolls it back.
#[async_trait]
pub trait RoutineSession: Send {
    async fn invoke(&mut self, call: &BoundCall) -> Result<RawResult, Failure>;

    async fn commit(self: Box<Self>) -> Result<(), Failure>;

    async fn rollback(self: Box<Self>) -> Result<(), Failure>;
}
