pub mod canonical;
pub mod config;
pub mod error;
pub mod types;

pub use config::FileConfig;
pub use error::MedSignalError;
pub use types::*;
