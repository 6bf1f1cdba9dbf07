use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::command::Command;
use super::store::{QueryOutput, TimeseriesStore};
use crate::handler::{CommandError, CommandHandler};

/// Serves [`Command`]s from a [`TimeseriesStore`]. Store calls block, so they
/// run on the blocking thread pool.
pub struct TimeseriesHandler<S> {
    store: Arc<S>,
}

impl<S: TimeseriesStore> TimeseriesHandler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: TimeseriesStore> CommandHandler for TimeseriesHandler<S> {
    type Output = QueryOutput;

    async fn handle(&self, command: Value) -> Result<Option<QueryOutput>, CommandError> {
        let command = Command::from_value(command)?;
        let kind = command.kind();
        debug!(kind, "Start request");

        let started = Instant::now();
        let store = Arc::clone(&self.store);
        let outcome = tokio::task::spawn_blocking(move || execute(&*store, command))
            .await
            .map_err(|e| CommandError::internal(format!("{} request task failed: {}", kind, e)))?;

        debug!(
            kind,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            ok = outcome.is_ok(),
            "Finish request"
        );
        outcome
    }
}

fn execute<S: TimeseriesStore>(
    store: &S,
    command: Command,
) -> Result<Option<QueryOutput>, CommandError> {
    match command {
        Command::Query { data, next_token } => store
            .query(&data, next_token.as_deref())
            .map(Some)
            .map_err(|e| CommandError::new(format!("failed to exec ts query: {}", e))),
        Command::Write {
            db,
            table,
            records,
        } => store
            .write(&db, &table, &records)
            .map(|()| None)
            .map_err(|e| CommandError::new(format!("failed to write ts records: {}", e))),
        Command::DescribeDb { db } => store
            .describe_database(&db)
            .map(|()| None)
            .map_err(|e| CommandError::new(format!("failed to describe tsdb: {}", e))),
        Command::DescribeTable { db, table } => store
            .describe_table(&db, &table)
            .map(|()| None)
            .map_err(|e| CommandError::new(format!("failed to describe tsdb table: {}", e))),
    }
}
