pub mod anomalies;
pub mod chunk_buffers;
pub mod commands;
pub mod database;
pub mod devices;
pub mod error;
pub mod retries;
pub mod row_helpers;
pub mod schema;
pub mod scores;
pub mod sessions;
pub mod sites;
pub mod snapshots;
pub mod wake_cycles;

pub use database::Database;
pub use error::StoreError;
