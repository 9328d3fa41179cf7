//! Command facade: gate, bind, invoke, shape, and the single place where
//! failures are classified for the HTTP boundary.

use std::sync::Arc;
use std::time::Instant;

use taskline_contracts::{ExpectedReturn, Params};
use taskline_policy::{Credential, Gate, GateError, RequestSource, Schema, Validated, Violation};
use taskline_routines::{
    Invoker, RoutineBackend, RoutineCall, RoutineError, RoutineName, ScopeFuture, Shaped,
    TransactionContext, TransactionManager, name_mismatch, shape,
};
use tracing::Instrument;

/// Builds routine parameters from a validated request.
pub type BuildParams = fn(&Validated) -> Params;

/// One declared operation: who may run it, what input it takes, which
/// routine it calls and how the result is shaped.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: &'static str,
    pub gate: Gate,
    pub schema: Schema,
    pub routine: RoutineName,
    pub build: BuildParams,
    pub expected_return: ExpectedReturn,
    pub result_set_names: Vec<String>,
    /// Run the call inside a transaction scope.
    pub transactional: bool,
}

impl Command {
    pub fn new(
        name: &'static str,
        gate: Gate,
        schema: Schema,
        routine: RoutineName,
        build: BuildParams,
    ) -> Self {
        Self {
            name,
            gate,
            schema,
            routine,
            build,
            expected_return: ExpectedReturn::Single,
            result_set_names: Vec::new(),
            transactional: false,
        }
    }

    pub fn expecting(mut self, expected_return: ExpectedReturn) -> Self {
        self.expected_return = expected_return;
        self
    }

    pub fn with_result_sets(mut self, names: &[&str]) -> Self {
        self.expected_return = ExpectedReturn::Multi;
        self.result_set_names = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    fn routine_call(&self, params: Params) -> Result<RoutineCall, RoutineError> {
        let call = RoutineCall::new(self.routine.clone(), params).expecting(self.expected_return);
        if self.result_set_names.is_empty() {
            Ok(call)
        } else {
            Ok(call.with_result_sets(self.result_set_names.clone())?)
        }
    }
}

#[derive(Debug)]
pub enum CommandError {
    Validation(Vec<Violation>),
    Unauthorized,
    /// Rejected by the routine; `message` is shown to the caller verbatim.
    RoutineBusiness { code: String, message: String },
    RoutineExecution(RoutineError),
    TransactionClosed,
    /// A routine result did not have the shape the caller relies on.
    Internal(String),
}

impl CommandError {
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CommandError::Validation(_)
                | CommandError::Unauthorized
                | CommandError::RoutineBusiness { .. }
        )
    }

    fn outcome(&self) -> &'static str {
        match self {
            CommandError::Validation(_) => "invalid",
            CommandError::Unauthorized => "unauthorized",
            CommandError::RoutineBusiness { .. } => "business",
            _ => "error",
        }
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Validation(violations) => {
                write!(f, "validation failed for {} field(s)", violations.len())
            }
            CommandError::Unauthorized => write!(f, "insufficient permission"),
            CommandError::RoutineBusiness { message, .. } => write!(f, "{}", message),
            CommandError::RoutineExecution(err) => write!(f, "{}", err),
            CommandError::TransactionClosed => write!(f, "transaction is no longer open"),
            CommandError::Internal(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::RoutineExecution(err) => Some(err),
            _ => None,
        }
    }
}

impl From<GateError> for CommandError {
    fn from(value: GateError) -> Self {
        match value {
            GateError::Unauthorized(_) => CommandError::Unauthorized,
            GateError::Invalid(violations) => CommandError::Validation(violations),
        }
    }
}

impl From<RoutineError> for CommandError {
    fn from(value: RoutineError) -> Self {
        match value {
            RoutineError::Business { code, message, .. } => {
                CommandError::RoutineBusiness { code, message }
            }
            RoutineError::TransactionClosed => CommandError::TransactionClosed,
            other => CommandError::RoutineExecution(other),
        }
    }
}

#[derive(Clone)]
pub struct Commands {
    invoker: Invoker,
    transactions: TransactionManager,
}

impl Commands {
    pub fn new(backend: Arc<dyn RoutineBackend>) -> Self {
        Self {
            invoker: Invoker::new(backend.clone()),
            transactions: TransactionManager::new(backend),
        }
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    pub async fn execute(
        &self,
        command: &Command,
        credential: &Credential,
        source: RequestSource<'_>,
    ) -> Result<Shaped, CommandError> {
        let span = tracing::info_span!(
            "command.execute",
            command = command.name,
            routine = %command.routine,
            source = source.label(),
            transactional = command.transactional,
            outcome = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        );

        async move {
            let started = Instant::now();
            let result = self.run(command, credential, source).await;

            let span = tracing::Span::current();
            span.record("latency_ms", started.elapsed().as_millis() as u64);
            match &result {
                Ok(_) => {
                    span.record("outcome", "ok");
                }
                Err(err) => {
                    span.record("outcome", err.outcome());
                    if !err.is_client_error() {
                        tracing::error!(error = %err, "command failed");
                    }
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        command: &Command,
        credential: &Credential,
        source: RequestSource<'_>,
    ) -> Result<Shaped, CommandError> {
        let validated = command.gate.validate(credential, source, &command.schema)?;
        let call = command.routine_call((command.build)(&validated))?;
        let routine = call.name.qualified();

        let started = Instant::now();
        let raw = if command.transactional {
            let invoker = self.invoker.clone();
            let scoped = call.clone();
            self.execute_in_transaction(move |ctx| {
                Box::pin(async move { Ok(invoker.invoke(&scoped, Some(ctx)).await?) })
            })
            .await
        } else {
            self.invoker
                .invoke(&call, None)
                .await
                .map_err(CommandError::from)
        };
        crate::metrics::observe_routine_call(
            &routine,
            match &raw {
                Ok(_) => "ok",
                Err(CommandError::RoutineBusiness { .. }) => "business",
                Err(_) => "error",
            },
            started.elapsed(),
        );
        let raw = raw?;

        if let Some(mismatch) = name_mismatch(&raw, call.result_set_names()) {
            tracing::warn!(
                routine = %routine,
                tables = mismatch.tables,
                names = mismatch.names,
                "result set count does not match declared names"
            );
        }

        Ok(shape(raw, call.expected_return, call.result_set_names()))
    }

    /// Runs several routine calls as one unit of work. Commits when `f`
    /// returns `Ok`, rolls back otherwise.
    pub async fn execute_in_transaction<T, F>(&self, f: F) -> Result<T, CommandError>
    where
        F: for<'t> FnOnce(&'t mut TransactionContext) -> ScopeFuture<'t, T, CommandError>,
    {
        let result = self.transactions.scope(f).await;
        crate::metrics::observe_transaction(if result.is_ok() {
            "committed"
        } else {
            "rolled_back"
        });
        result
    }
}
