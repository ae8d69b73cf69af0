//! Error types for tree mutations.

use thiserror::Error;

/// Errors returned when re-parenting a node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropError {
    /// The parent has been destroyed; the caller should discard the child.
    #[error("parent node has been destroyed")]
    ParentDestroyed,

    /// The node being attached has itself been destroyed.
    #[error("node has been destroyed")]
    NodeDestroyed,

    /// Parent and child belong to different trees.
    #[error("nodes belong to different trees")]
    ForeignTree,

    /// The parent is the child or one of its descendants.
    #[error("attaching would create a cycle")]
    Cycle,
}
