pub mod config;
pub mod logging;
mod macros;

pub use config::{Environment, env_parse};
pub use logging::setup_logging;
