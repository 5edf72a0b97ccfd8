pub mod database;
pub mod http_clients;
pub mod leader;
pub mod memory_store;
pub mod observability;

pub use database::{open_repositories, SqliteStore};
pub use http_clients::{HttpCmdbClient, HttpReturnProvider, HttpStepChecker};
pub use leader::StandaloneElector;
pub use memory_store::MemoryStore;
pub use observability::*;
