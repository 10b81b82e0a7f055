mod error;
pub use error::ModelError;

mod domain;
pub use domain::*;

pub mod config;
pub use config::LinkConfig;
