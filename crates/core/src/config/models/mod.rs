mod app_config;
mod database;
mod detector;
mod dispatcher;
mod observability;
mod phases;

pub use app_config::*;
pub use database::*;
pub use detector::*;
pub use dispatcher::*;
pub use observability::*;
pub use phases::*;
