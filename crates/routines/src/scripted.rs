//! In-memory [`RoutineBackend`] that replays canned results and records
//! every call it receives.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use taskline_contracts::{Params, RawResult};

use crate::backend::{RoutineBackend, RoutineSession};
use crate::binder::BoundCall;
use crate::error::{Failure, Fault};

#[derive(Debug, Clone)]
pub enum Scripted {
    Ok(RawResult),
    Business { code: String, message: String },
    /// Behaves like an exhausted connection pool.
    Unavailable,
}

impl Scripted {
    pub fn business(code: impl Into<String>, message: impl Into<String>) -> Self {
        Scripted::Business {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub routine: String,
    pub params: Params,
    pub sql: String,
    pub in_transaction: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionCounts {
    pub begun: usize,
    pub committed: usize,
    pub rolled_back: usize,
    /// Sessions released without commit or rollback.
    pub dropped: usize,
}

#[derive(Default)]
struct ScriptState {
    responses: HashMap<String, VecDeque<Scripted>>,
    calls: Vec<RecordedCall>,
    transactions: TransactionCounts,
    fail_begin: bool,
    fail_commit: bool,
    fail_rollback: bool,
}

#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response for the next call of `routine` (schema-qualified).
    /// The last queued response is replayed once the queue drains.
    pub fn on(self, routine: &str, response: Scripted) -> Self {
        self.lock()
            .responses
            .entry(routine.to_string())
            .or_default()
            .push_back(response);
        self
    }

    /// Makes every subsequent `begin` fail like an unreachable database.
    pub fn fail_begin(self) -> Self {
        self.lock().fail_begin = true;
        self
    }

    /// Makes every subsequent commit fail after the session is released.
    pub fn fail_commit(self) -> Self {
        self.lock().fail_commit = true;
        self
    }

    pub fn fail_rollback(self) -> Self {
        self.lock().fail_rollback = true;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn transactions(&self) -> TransactionCounts {
        self.lock().transactions
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn respond(&self, call: &BoundCall, in_transaction: bool) -> Result<RawResult, Failure> {
        let routine = call.routine.qualified();
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            routine: routine.clone(),
            params: call.params.clone(),
            sql: call.sql.clone(),
            in_transaction,
        });

        let response = match state.responses.get_mut(&routine) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };

        match response {
            Some(Scripted::Ok(raw)) => Ok(raw),
            Some(Scripted::Business { code, message }) => Err(Failure::Business { code, message }),
            Some(Scripted::Unavailable) => {
                Err(Failure::Infrastructure(Fault::Sqlx(sqlx::Error::PoolTimedOut)))
            }
            None => Err(Failure::Infrastructure(Fault::Sqlx(sqlx::Error::Protocol(
                format!("no scripted response for {}", routine),
            )))),
        }
    }
}

#[async_trait]
impl RoutineBackend for ScriptedBackend {
    async fn invoke(&self, call: &BoundCall) -> Result<RawResult, Failure> {
        self.respond(call, false)
    }

    async fn begin(&self) -> Result<Box<dyn RoutineSession>, Failure> {
        let mut state = self.lock();
        if state.fail_begin {
            return Err(Failure::Infrastructure(Fault::Sqlx(
                sqlx::Error::PoolTimedOut,
            )));
        }
        state.transactions.begun += 1;
        drop(state);
        Ok(Box::new(ScriptedSession {
            backend: self.clone(),
            finished: false,
        }))
    }

    async fn ping(&self) -> Result<(), Failure> {
        Ok(())
    }
}

struct ScriptedSession {
    backend: ScriptedBackend,
    finished: bool,
}

#[async_trait]
impl RoutineSession for ScriptedSession {
    async fn invoke(&mut self, call: &BoundCall) -> Result<RawResult, Failure> {
        self.backend.respond(call, true)
    }

    async fn commit(self: Box<Self>) -> Result<(), Failure> {
        let mut session = self;
        session.finished = true;
        let mut state = session.backend.lock();
        if state.fail_commit {
            return Err(connection_lost());
        }
        state.transactions.committed += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), Failure> {
        let mut session = self;
        session.finished = true;
        let mut state = session.backend.lock();
        if state.fail_rollback {
            return Err(connection_lost());
        }
        state.transactions.rolled_back += 1;
        Ok(())
    }
}

fn connection_lost() -> Failure {
    Failure::Infrastructure(Fault::Sqlx(sqlx::Error::Protocol(
        "connection closed during transaction".to_string(),
    )))
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        if !self.finished {
            self.backend.lock().transactions.dropped += 1;
        }
    }
}
