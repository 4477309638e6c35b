//! DIMSE (DICOM Message Service Element) implementation
//!
//! This crate provides the networking side of dcmcat on top of `dicom-ul`:
//!
//! # Features
//! - Outbound DIMSE services (SCU): C-FIND and C-MOVE on the Study Root
//!   information model, C-STORE of Part 10 files
//! - Inbound storage SCP: C-STORE and C-ECHO
//! - An [`AssociationFactory`] seam so callers can be tested without a network

pub mod association;
pub mod config;
pub mod error;
pub mod message;
pub mod scp;
pub mod scu;
pub mod types;

// Re-export commonly used types
pub use association::{Association, AssociationFactory};
pub use config::{DimseConfig, RemoteNode};
pub use error::{DimseError, Result};
pub use scp::{BoundStoreScp, ReceivedObject, StoreHandler, StoreScp};
pub use scu::DimseScu;
pub use types::{
    DimseStatus, FindOutcome, FindQuery, MoveOutcome, MovePriority, MoveQuery, PresentationContext, QueryLevel,
};

/// Default port of the local storage SCP
pub const DEFAULT_DIMSE_PORT: u16 = 11113;
