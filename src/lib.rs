pub mod config;
pub mod error;
pub mod fs;
pub mod handle;
pub mod hooks;
pub mod inspect;
pub mod lifecycle;
pub mod metastore;
pub mod metrics;
pub mod pipeline;
pub mod plugins;
pub mod store;
pub mod stream;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Error, Result};
pub use handle::{Extensions, FileHandle, Metadata};
pub use store::{FileStore, Options, StoreOptions};
