pub mod config;
pub mod error;
pub mod types;
pub mod urls;
pub mod zorder;

pub use config::Config;
pub use error::SeshuError;
pub use types::*;
