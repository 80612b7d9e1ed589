//! Persistence layer: SQLite storage for inbounds, client traffic,
//! settings, share-link history and panel users.
//!
//! All access goes through [`SqliteRepository`]; the operations are split
//! across submodules by table.

mod clients;
pub mod db_file;
mod inbounds;
pub mod links;
pub mod models;
mod seeders;
pub mod settings;
mod sqlite;

pub use clients::ClientRecord;
pub use sqlite::SqliteRepository;

#[cfg(test)]
pub(crate) use inbounds::tests as fixtures;
