//! dcmcat: a local catalog of DICOM series fed from archives and remote PACS,
//! with concurrent retrieval into a local storage SCP and transmission of
//! catalogued series to remote nodes.

pub mod archive;
pub mod catalog;
pub mod config;
pub mod error;
pub mod indexer;
pub mod project;
pub mod query;
pub mod receiver;
pub mod report;
pub mod retrieval;
pub mod scanner;
pub mod selection;
pub mod transmission;

pub use catalog::{CatalogHandle, CatalogStore};
pub use error::{Error, Result};
pub use project::Project;
