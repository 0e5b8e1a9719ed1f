use thiserror::Error;

/// Errors raised by the replicated tree document.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Parent not found: {0}")]
    ParentNotFound(String),

    #[error("Node already exists: {0}")]
    DuplicateNode(String),

    #[error("Unknown node kind: {0}")]
    UnknownKind(String),

    #[error("Node kind '{parent}' does not accept children of kind '{child}'")]
    ChildRejected { parent: String, child: String },

    #[error("Node {0} still has children")]
    HasChildren(String),

    #[error("Root node {0} has children and no parent to hand them to")]
    RootHasChildren(String),

    #[error("Malformed node {id}: {reason}")]
    MalformedNode { id: String, reason: String },

    #[error("Invalid node data: {0}")]
    InvalidData(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Update rejected: {0}")]
    Update(String),
}

impl From<yrs::encoding::read::Error> for TreeError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        TreeError::Decode(e.to_string())
    }
}
