pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod traits;

pub use self::config::*;
pub use errors::*;
pub use logging::{init_logging, LogConfig, LogFormat};
pub use traits::*;
