use std::sync::Arc;
use std::time::Instant;

use taskline_contracts::{ExpectedReturn, RawResult};
use tracing::Instrument;

use crate::RoutineCall;
use crate::backend::RoutineBackend;
use crate::binder::bind;
use crate::error::RoutineError;
use crate::transaction::TransactionContext;

#[derive(Clone)]
pub struct Invoker {
    backend: Arc<dyn RoutineBackend>,
}

impl Invoker {
    pub fn new(backend: Arc<dyn RoutineBackend>) -> Self {
        Self { backend }
    }

    /// Binds and runs one routine call. With a transaction context the call
    /// joins that transaction and never commits or rolls it back; without one
    /// it runs on a pooled connection for the duration of the call.
    pub async fn invoke(
        &self,
        call: &RoutineCall,
        tx: Option<&mut TransactionContext>,
    ) -> Result<RawResult, RoutineError> {
        let bound = bind(
            &call.name,
            &call.parameters,
            call.expected_return == ExpectedReturn::Multi,
        )?;
        let routine = bound.routine.qualified();

        let span = tracing::info_span!(
            "routine.invoke",
            routine = %routine,
            param_count = bound.params.len(),
            in_transaction = tx.is_some(),
            outcome = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        );

        async move {
            let start = Instant::now();
            let result = match tx {
                Some(ctx) => ctx.invoke(&bound).await,
                None => self.backend.invoke(&bound).await.map_err(|failure| {
                    RoutineError::from_failure(&routine, &bound.summary, failure)
                }),
            };

            let span = tracing::Span::current();
            span.record("latency_ms", start.elapsed().as_millis() as u64);
            match &result {
                Ok(raw) => {
                    span.record("outcome", "ok");
                    tracing::debug!(
                        tables = raw.tables.len(),
                        rows_affected = raw.rows_affected,
                        "routine returned"
                    );
                }
                Err(RoutineError::Business { code, message, .. }) => {
                    span.record("outcome", "business");
                    tracing::info!(code = %code, message = %message, "routine rejected call");
                }
                Err(err) => {
                    span.record("outcome", "error");
                    tracing::error!(
                        params = %bound.summary,
                        error = %err,
                        "routine call failed"
                    );
                }
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::RoutineName;
    use crate::error::Fault;
    use crate::scripted::{Scripted, ScriptedBackend};
    use crate::transaction::TransactionManager;
    use taskline_contracts::{Params, Record, Scalar};

    fn create_call() -> RoutineCall {
        RoutineCall::new(
            RoutineName::parse("functional.spTaskCreate").expect("name should parse"),
            Params::new()
                .with("idAccount", 1_i64)
                .with("title", "Buy milk")
                .with("description", Scalar::Null),
        )
    }

    fn id_row(id: i64) -> RawResult {
        RawResult::single(vec![Record::from([(
            "idTask".to_string(),
            Scalar::Int(id),
        )])])
    }

    #[tokio::test]
    async fn invoke_binds_nulls_and_returns_raw_tables() {
        let backend =
            ScriptedBackend::new().on("functional.spTaskCreate", Scripted::Ok(id_row(42)));
        let invoker = Invoker::new(Arc::new(backend.clone()));

        let raw = invoker
            .invoke(&create_call(), None)
            .await
            .expect("invoke should succeed");
        assert_eq!(raw, id_row(42));

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].params.get("description"), Some(&Scalar::Null));
        assert!(calls[0].sql.contains(r#""description" => NULL"#));
        assert!(!calls[0].in_transaction);
    }

    #[tokio::test]
    async fn business_and_infrastructure_failures_stay_distinct() {
        let backend = ScriptedBackend::new()
            .on(
                "functional.spTaskCreate",
                Scripted::business("51000", "TitleTaken"),
            )
            .on("functional.spTaskCreate", Scripted::Unavailable);
        let invoker = Invoker::new(Arc::new(backend));

        let err = invoker.invoke(&create_call(), None).await.unwrap_err();
        assert!(matches!(
            &err,
            RoutineError::Business { code, message, .. } if code == "51000" && message == "TitleTaken"
        ));

        let err = invoker.invoke(&create_call(), None).await.unwrap_err();
        let RoutineError::Execution {
            routine,
            params,
            cause,
        } = err
        else {
            panic!("expected execution error");
        };
        assert_eq!(routine, "functional.spTaskCreate");
        assert_eq!(params.names, vec!["idAccount", "title", "description"]);
        assert!(matches!(cause, Fault::Sqlx(sqlx::Error::PoolTimedOut)));
    }

    #[tokio::test]
    async fn invoke_inside_transaction_leaves_it_open() {
        let backend =
            ScriptedBackend::new().on("functional.spTaskCreate", Scripted::Ok(id_row(1)));
        let invoker = Invoker::new(Arc::new(backend.clone()));
        let manager = TransactionManager::new(Arc::new(backend.clone()));

        let mut ctx = manager.begin().await.expect("begin should succeed");
        invoker
            .invoke(&create_call(), Some(&mut ctx))
            .await
            .expect("invoke should succeed");
        assert!(ctx.is_open());
        assert!(backend.calls()[0].in_transaction);

        ctx.commit().await.expect("commit should succeed");
        assert!(matches!(
            invoker.invoke(&create_call(), Some(&mut ctx)).await,
            Err(RoutineError::TransactionClosed)
        ));
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn multi_calls_are_bound_as_cursor_routines() {
        let backend = ScriptedBackend::new().on(
            "functional.spTaskOverview",
            Scripted::Ok(RawResult::default()),
        );
        let invoker = Invoker::new(Arc::new(backend.clone()));
        let call = RoutineCall::new(
            RoutineName::parse("functional.spTaskOverview").expect("name should parse"),
            Params::new(),
        )
        .with_result_sets(vec!["pending".to_string(), "completed".to_string()])
        .expect("names are distinct");

        invoker
            .invoke(&call, None)
            .await
            .expect("invoke should succeed");
        assert!(backend.calls()[0].sql.starts_with("SELECT CAST(c AS text)"));
    }
}
