//! Persistent stores: the archive catalog and the vector table

mod catalog;
#[cfg(feature = "semantic")]
mod vector;

pub use catalog::{ArchiveCatalog, ArchiveRecord, UnitKind};
#[cfg(feature = "semantic")]
pub use vector::{VectorMatch, VectorStorage};
