//! Node records and node kinds.
//!
//! A [`NodeRecord`] is the plain, owned view of one tree node. Inside the
//! replicated document the same fields live in a nested yrs map; the
//! conversion between the two lives in [`crate::document`].
//!
//! Every node carries an explicit `kind` discriminant (`nodeTypeName` on the
//! wire). Kinds are resolved through a [`NodeKindRegistry`] which decides
//! which children a node accepts and how its sub-content is seeded.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use yrs::{MapRef, TransactionMut};

/// Name of the built-in kind that accepts every child.
pub const GENERIC_KIND: &str = "Generic";

fn empty_object() -> Value {
    Value::Object(JsonMap::new())
}

/// Owned snapshot of a single tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(rename = "nodeTypeName")]
    pub kind: String,
    #[serde(default, rename = "ydata")]
    pub sub_content: JsonMap<String, Value>,
}

impl NodeRecord {
    /// Create a detached node with a fresh random id.
    pub fn new(title: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), title, kind)
    }

    pub fn with_id(id: impl Into<String>, title: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            parent: None,
            children: Vec::new(),
            data: empty_object(),
            kind: kind.into(),
            sub_content: JsonMap::new(),
        }
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn sub_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.sub_content.insert(key.into(), value);
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Behaviour attached to a node kind.
///
/// Implementations must be cheap to share: the registry hands out
/// `Arc<dyn NodeKind>` to every replica of a document.
pub trait NodeKind: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a node of this kind may receive a child of `child_kind`.
    fn accepts_child(&self, _child_kind: &str) -> bool {
        true
    }

    /// Seed the nested sub-content map of a freshly inserted node.
    ///
    /// Runs inside the insertion transaction, after any fields supplied by
    /// the caller have been written.
    fn initialize_sub_content(&self, _txn: &mut TransactionMut, _sub_content: &MapRef) {}
}

/// The default kind: accepts any child, seeds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericKind;

impl NodeKind for GenericKind {
    fn name(&self) -> &str {
        GENERIC_KIND
    }
}

/// Kind lookup table. Always contains [`GenericKind`].
#[derive(Clone)]
pub struct NodeKindRegistry {
    kinds: HashMap<String, Arc<dyn NodeKind>>,
}

impl NodeKindRegistry {
    pub fn new() -> Self {
        let mut kinds: HashMap<String, Arc<dyn NodeKind>> = HashMap::new();
        kinds.insert(GENERIC_KIND.to_string(), Arc::new(GenericKind));
        Self { kinds }
    }

    /// Register a kind, replacing any previous kind with the same name.
    pub fn register(&mut self, kind: impl NodeKind + 'static) {
        self.kinds.insert(kind.name().to_string(), Arc::new(kind));
    }

    pub fn with(mut self, kind: impl NodeKind + 'static) -> Self {
        self.register(kind);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn NodeKind>> {
        self.kinds.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kinds.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for NodeKindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeKindRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKindRegistry")
            .field("kinds", &self.names())
            .finish()
    }
}
