pub mod compress;
pub mod config;
pub mod error;
pub mod export;
pub mod ffu;
pub mod partition;
pub mod sign;
pub mod stream;

pub use error::{ErrorKind, FfuError, HashRegion};
