//! Collaborators wired into the store through its hooks.

pub mod cache;
pub mod gzip;
pub mod tar_dir;

pub use cache::FileCache;
pub use gzip::Gzip;
pub use tar_dir::TarDirectory;
