//! Persisted state: storage layout, settings, lap/pit databases and the
//! read-only roads database.
//!
//! All SQLite handles are opened once per store and used only from the main
//! thread. Settings writes use atomic replace so a reader never observes a
//! partial file.

mod lap_db;
mod layout;
mod pit_db;
mod roads_db;
mod settings;

pub use lap_db::{LapDb, StoredLap, StoredLapPoint};
pub use layout::StorageLayout;
pub use pit_db::PitDb;
pub use roads_db::{Road, RoadsDb};
pub use settings::SettingsStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("db: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("{0}")]
    Invalid(String),
}
