//! # arbor-core: Replicated tree document for Arbor
//!
//! A tree of titled nodes stored in a single yrs CRDT document so that any
//! number of replicas can mutate it concurrently and still converge.
//!
//! ## Layout inside the yrs `Doc`
//!
//! ```text
//! Doc
//!  ├── "nodeDict"  Map<node id, NodeMap>
//!  │                 NodeMap ├── id, title, parent, nodeTypeName
//!  │                         ├── data      (JSON value)
//!  │                         ├── children  (nested Array<String>)
//!  │                         └── ydata     (nested Map, free-form sub-content)
//!  └── "metadata"  Map { rootId, treeId, version }
//! ```
//!
//! ## Modules
//!
//! - [`node`]: `NodeRecord` and the node-kind registry
//! - [`document`]: `TreeDoc`: transactions, sync primitives, JSON views
//! - [`tree`]: structural operations (insert, delete, import)
//! - [`error`]: `TreeError`

pub mod document;
pub mod error;
pub mod node;
pub mod tree;

pub use document::{is_empty_update, SharedKind, TreeDoc, TreeJson, TreeMetadata};
pub use error::TreeError;
pub use node::{GenericKind, NodeKind, NodeKindRegistry, NodeRecord, GENERIC_KIND};
pub use tree::{DeletePolicy, TreePatch};
