//! Persisted dataset containers
//!
//! A [`DatasetArchive`] stores any number of named datasets in one file and
//! restores them through the core factory.

#![warn(missing_docs)]

mod archive;
mod error;

pub use archive::{DatasetArchive, ArchiveEntry, ARCHIVE_MAGIC, ARCHIVE_VERSION};
pub use error::{Error, Result};
