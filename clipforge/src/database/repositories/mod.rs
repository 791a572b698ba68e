//! Repository traits and their sqlx implementations.

pub mod manifest;

pub use manifest::{ManifestRepository, SqlxManifestRepository};
