pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod manifest;
pub mod orchestration;
pub mod util;

pub use error::{Error, GraphError, Result};
pub use manifest::Manifest;
