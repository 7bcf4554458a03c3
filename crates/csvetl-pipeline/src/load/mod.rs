//! Load stage: sink capability, retrying batch loader and the PostgreSQL sink

pub mod loader;
pub mod postgres;
pub mod sink;

pub use loader::{BatchLoader, LoadFailure, RetryPolicy};
pub use postgres::{PgConnectOptions, PostgresSink};
pub use sink::{Sink, SinkError, SinkErrorKind};
