//! Time-series commands served over the worker queue.
//!
//! [`TimeseriesHandler`] decodes the `type`-tagged request into a
//! [`Command`] and runs it against a blocking [`TimeseriesStore`].

mod command;
mod handler;
mod store;

pub use command::{Command, RecordDimension, WriteRecord};
pub use handler::TimeseriesHandler;
pub use store::{ColumnInfo, MemoryStore, QueryOutput, Row, StoreError, TimeseriesStore};
