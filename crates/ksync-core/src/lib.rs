pub mod config;
pub mod error;
pub mod types;

pub use error::{KsyncError, KsyncResult};
pub use types::{InfoCollections, Wbo};
