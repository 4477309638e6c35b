//! Association-level abstraction over outbound DIMSE operations
//!
//! Everything above the protocol crate talks to remote nodes through these two
//! traits, so indexing, retrieval and transmission can be driven against
//! in-process fakes in tests.

use std::path::Path;

use async_trait::async_trait;

use crate::config::RemoteNode;
use crate::types::{DimseStatus, FindOutcome, FindQuery, MoveOutcome, MoveQuery, PresentationContext};
use crate::Result;

/// An open association with a remote node
#[async_trait]
pub trait Association: Send {
    /// C-FIND on the Study Root information model; collects all pending matches
    async fn find(&mut self, query: &FindQuery) -> Result<FindOutcome>;

    /// C-MOVE on the Study Root information model; waits for the final response
    async fn move_request(&mut self, query: &MoveQuery) -> Result<MoveOutcome>;

    /// C-STORE of one Part 10 file
    async fn store_file(&mut self, path: &Path) -> Result<DimseStatus>;

    /// Release the association
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Opens associations with remote nodes
#[async_trait]
pub trait AssociationFactory: Send + Sync {
    async fn associate(
        &self,
        node: &RemoteNode,
        contexts: Vec<PresentationContext>,
    ) -> Result<Box<dyn Association>>;
}
