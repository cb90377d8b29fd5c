// Pipeline storage: canonical artifact, table catalogue and destination store

pub mod artifact;
pub mod schema;
pub mod store;

pub use schema::{TableRow, TableSpec};
pub use store::{MaterializationRecord, Store};
