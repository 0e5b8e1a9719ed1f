//! `TreeDoc`: the replicated document behind a tree.
//!
//! Owns the yrs `Doc` and exposes the primitives the sync layer needs
//! (state vectors, diffs, update application) plus read-only JSON views.
//! Structural tree operations live in [`crate::tree`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, Doc, GetString, Map, MapPrelim, MapRef, Options, Out,
    ReadTxn, StateVector, Transact, TransactionMut, Update, WriteTxn,
};

use crate::error::TreeError;
use crate::node::{NodeKindRegistry, NodeRecord};

pub(crate) const NODES: &str = "nodeDict";
pub(crate) const METADATA: &str = "metadata";

pub(crate) const ROOT_ID: &str = "rootId";
pub(crate) const TREE_ID: &str = "treeId";
pub(crate) const VERSION: &str = "version";

pub(crate) const ID: &str = "id";
pub(crate) const TITLE: &str = "title";
pub(crate) const PARENT: &str = "parent";
pub(crate) const CHILDREN: &str = "children";
pub(crate) const DATA: &str = "data";
pub(crate) const KIND: &str = "nodeTypeName";
pub(crate) const SUB_CONTENT: &str = "ydata";

/// Encoded form of an update that carries no changes.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Returns true when `update` carries neither insertions nor deletions.
pub fn is_empty_update(update: &[u8]) -> bool {
    update.is_empty() || update == EMPTY_UPDATE
}

/// Shape of a named top-level shared object, used for JSON extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SharedKind {
    Array,
    Map,
    Text,
    XmlFragment,
    XmlElement,
}

impl SharedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SharedKind::Array => "Array",
            SharedKind::Map => "Map",
            SharedKind::Text => "Text",
            SharedKind::XmlFragment => "XmlFragment",
            SharedKind::XmlElement => "XmlElement",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Plain JSON snapshot of a whole tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeJson {
    pub metadata: TreeMetadata,
    pub node_dict: BTreeMap<String, NodeRecord>,
}

/// A replica of a tree document.
///
/// Cloning is cheap and yields another handle to the same replica.
#[derive(Clone)]
pub struct TreeDoc {
    doc: Doc,
    kinds: Arc<NodeKindRegistry>,
}

impl TreeDoc {
    /// New empty replica with garbage collection enabled and only the
    /// built-in node kind.
    pub fn new() -> Self {
        Self::with_options(true, Arc::new(NodeKindRegistry::default()))
    }

    pub fn with_options(gc: bool, kinds: Arc<NodeKindRegistry>) -> Self {
        let doc = Doc::with_options(Options {
            skip_gc: !gc,
            ..Options::default()
        });
        {
            let mut txn = yrs::Transact::transact_mut(&doc);
            txn.get_or_insert_map(NODES);
            txn.get_or_insert_map(METADATA);
        }
        Self { doc, kinds }
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn kinds(&self) -> &NodeKindRegistry {
        &self.kinds
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    // -- Sync primitives ---------------------------------------------------

    /// Encoded state vector (the "what I have" summary sent in step 1).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = yrs::Transact::transact(&self.doc);
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that the peer described by `remote_sv`
    /// lacks.
    pub fn diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, TreeError> {
        let sv = StateVector::decode_v1(remote_sv)?;
        let txn = yrs::Transact::transact(&self.doc);
        Ok(txn.encode_diff_v1(&sv))
    }

    /// The whole document encoded as a single update.
    pub fn full_state(&self) -> Vec<u8> {
        let txn = yrs::Transact::transact(&self.doc);
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Apply a v1 update and return the change it actually produced.
    ///
    /// Updates whose dependencies are still missing are buffered by yrs and
    /// yield an empty update until they can be integrated.
    pub fn apply_update(&self, update: &[u8]) -> Result<Vec<u8>, TreeError> {
        let update = Update::decode_v1(update)?;
        let mut txn = yrs::Transact::transact_mut(&self.doc);
        txn.apply_update(update)
            .map_err(|e| TreeError::Update(e.to_string()))?;
        Ok(txn.encode_update_v1())
    }

    /// Run `f` in one transaction and return its result together with the
    /// encoded update the transaction produced.
    ///
    /// yrs has no rollback: `f` must finish its validation before it writes.
    pub fn mutate<R>(
        &self,
        f: impl FnOnce(&mut TransactionMut) -> Result<R, TreeError>,
    ) -> Result<(R, Vec<u8>), TreeError> {
        let mut txn = yrs::Transact::transact_mut(&self.doc);
        let result = f(&mut txn)?;
        let update = txn.encode_update_v1();
        Ok((result, update))
    }

    // -- Metadata ----------------------------------------------------------

    pub fn metadata(&self) -> TreeMetadata {
        let txn = yrs::Transact::transact(&self.doc);
        read_metadata(&txn)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Vec<u8> {
        let mut txn = yrs::Transact::transact_mut(&self.doc);
        let metadata = txn.get_or_insert_map(METADATA);
        metadata.insert(&mut txn, key.to_string(), value.to_string());
        txn.encode_update_v1()
    }

    // -- JSON views --------------------------------------------------------

    /// JSON rendering of a named top-level shared object.
    ///
    /// Text and XML objects render as their string content.
    pub fn shared_json(&self, name: &str, kind: SharedKind) -> Value {
        let mut txn = yrs::Transact::transact_mut(&self.doc);
        match kind {
            SharedKind::Map => {
                let map = txn.get_or_insert_map(name);
                any_to_json(map.to_json(&txn))
            }
            SharedKind::Array => {
                let array = txn.get_or_insert_array(name);
                any_to_json(array.to_json(&txn))
            }
            SharedKind::Text => {
                let text = txn.get_or_insert_text(name);
                Value::String(text.get_string(&txn))
            }
            SharedKind::XmlFragment | SharedKind::XmlElement => {
                let xml = txn.get_or_insert_xml_fragment(name);
                Value::String(xml.get_string(&txn))
            }
        }
    }

    /// Owned snapshot of every node plus the metadata map.
    ///
    /// Node entries that cannot be read are skipped with a warning.
    pub fn snapshot(&self) -> TreeJson {
        let txn = yrs::Transact::transact(&self.doc);
        let mut node_dict = BTreeMap::new();
        if let Some(nodes) = txn.get_map(NODES) {
            for (id, out) in nodes.iter(&txn) {
                match out {
                    Out::YMap(map) => match read_node(&txn, id, &map) {
                        Ok(record) => {
                            node_dict.insert(id.to_string(), record);
                        }
                        Err(e) => log::warn!("Skipping node in snapshot: {}", e),
                    },
                    _ => log::warn!("Skipping non-map entry {} in node dictionary", id),
                }
            }
        }
        TreeJson {
            metadata: read_metadata(&txn),
            node_dict,
        }
    }
}

impl Default for TreeDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TreeDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeDoc")
            .field("client_id", &self.doc.client_id())
            .field("kinds", &self.kinds)
            .finish()
    }
}

// -- Conversion helpers shared with the tree module --------------------------

pub(crate) fn nodes_map<T: ReadTxn>(txn: &T) -> Option<MapRef> {
    txn.get_map(NODES)
}

pub(crate) fn node_map<T: ReadTxn>(txn: &T, id: &str) -> Option<MapRef> {
    match nodes_map(txn)?.get(txn, id) {
        Some(Out::YMap(map)) => Some(map),
        _ => None,
    }
}

pub(crate) fn out_string(out: Option<Out>) -> Option<String> {
    match out {
        Some(Out::Any(Any::String(s))) => Some(s.to_string()),
        _ => None,
    }
}

pub(crate) fn any_to_json(any: Any) -> Value {
    serde_json::to_value(&any).unwrap_or(Value::Null)
}

pub(crate) fn json_to_any(value: &Value) -> Result<Any, TreeError> {
    serde_json::from_value(value.clone()).map_err(|e| TreeError::InvalidData(e.to_string()))
}

pub(crate) fn child_ids<T: ReadTxn>(txn: &T, node: &MapRef) -> Vec<String> {
    match node.get(txn, CHILDREN) {
        Some(Out::YArray(children)) => children
            .iter(txn)
            .filter_map(|out| match out {
                Out::Any(Any::String(s)) => Some(s.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// The node's children array, created if the record lacks one.
pub(crate) fn children_array(txn: &mut TransactionMut, node: &MapRef) -> ArrayRef {
    match node.get(&*txn, CHILDREN) {
        Some(Out::YArray(children)) => children,
        _ => node.insert(txn, CHILDREN, ArrayPrelim::default()),
    }
}

pub(crate) fn sub_content_map(txn: &mut TransactionMut, node: &MapRef) -> MapRef {
    match node.get(&*txn, SUB_CONTENT) {
        Some(Out::YMap(sub)) => sub,
        _ => node.insert(txn, SUB_CONTENT, MapPrelim::default()),
    }
}

pub(crate) fn read_node<T: ReadTxn>(txn: &T, id: &str, map: &MapRef) -> Result<NodeRecord, TreeError> {
    let kind = out_string(map.get(txn, KIND)).ok_or_else(|| TreeError::MalformedNode {
        id: id.to_string(),
        reason: format!("missing {}", KIND),
    })?;
    let data = match map.get(txn, DATA) {
        Some(out) => any_to_json(out.to_json(txn)),
        None => Value::Object(JsonMap::new()),
    };
    let sub_content = match map.get(txn, SUB_CONTENT) {
        Some(Out::YMap(sub)) => match any_to_json(sub.to_json(txn)) {
            Value::Object(fields) => fields,
            _ => JsonMap::new(),
        },
        _ => JsonMap::new(),
    };

    Ok(NodeRecord {
        id: out_string(map.get(txn, ID)).unwrap_or_else(|| id.to_string()),
        title: out_string(map.get(txn, TITLE)).unwrap_or_default(),
        parent: out_string(map.get(txn, PARENT)),
        children: child_ids(txn, map),
        data,
        kind,
        sub_content,
    })
}

/// Write `record` as a nested map under its id, replacing any previous
/// entry. Returns the node map and its sub-content map.
///
/// All JSON conversion happens before the first write so a conversion
/// error leaves the document untouched.
pub(crate) fn write_node(
    txn: &mut TransactionMut,
    nodes: &MapRef,
    record: &NodeRecord,
) -> Result<(MapRef, MapRef), TreeError> {
    let data = json_to_any(&record.data)?;
    let sub_fields = record
        .sub_content
        .iter()
        .map(|(key, value)| Ok((key.clone(), json_to_any(value)?)))
        .collect::<Result<Vec<(String, Any)>, TreeError>>()?;

    let node = nodes.insert(txn, record.id.clone(), MapPrelim::default());
    node.insert(txn, ID, record.id.clone());
    node.insert(txn, TITLE, record.title.clone());
    let parent = record.parent.clone().map(Any::from).unwrap_or(Any::Null);
    node.insert(txn, PARENT, parent);
    node.insert(txn, KIND, record.kind.clone());
    node.insert(txn, DATA, data);

    let children = node.insert(txn, CHILDREN, ArrayPrelim::default());
    if !record.children.is_empty() {
        children.insert_range(txn, 0, record.children.iter().cloned());
    }

    let sub = node.insert(txn, SUB_CONTENT, MapPrelim::default());
    for (key, value) in sub_fields {
        sub.insert(txn, key, value);
    }

    Ok((node, sub))
}

fn read_metadata<T: ReadTxn>(txn: &T) -> TreeMetadata {
    match txn.get_map(METADATA) {
        Some(metadata) => TreeMetadata {
            root_id: out_string(metadata.get(txn, ROOT_ID)),
            tree_id: out_string(metadata.get(txn, TREE_ID)),
            version: out_string(metadata.get(txn, VERSION)),
        },
        None => TreeMetadata::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_doc_is_empty() {
        let doc = TreeDoc::new();
        let snapshot = doc.snapshot();
        assert!(snapshot.node_dict.is_empty());
        assert_eq!(snapshot.metadata, TreeMetadata::default());
    }

    #[test]
    fn test_full_state_hydrates_fresh_replica() {
        let a = TreeDoc::new();
        a.set_metadata(TREE_ID, "tree-1");

        let b = TreeDoc::new();
        let effective = b.apply_update(&a.full_state()).unwrap();
        assert!(!is_empty_update(&effective));
        assert_eq!(b.metadata().tree_id.as_deref(), Some("tree-1"));
    }

    #[test]
    fn test_diff_against_peer_state_vector() {
        let a = TreeDoc::new();
        let b = TreeDoc::new();
        a.set_metadata(VERSION, "0.0.1");

        let missing = a.diff(&b.state_vector()).unwrap();
        b.apply_update(&missing).unwrap();
        assert_eq!(b.metadata().version.as_deref(), Some("0.0.1"));

        // Nothing left to send once both sides agree.
        let rest = a.diff(&b.state_vector()).unwrap();
        assert!(is_empty_update(&b.apply_update(&rest).unwrap()));
    }

    #[test]
    fn test_reapplying_update_is_noop() {
        let a = TreeDoc::new();
        let update = a.set_metadata(ROOT_ID, "r");

        let b = TreeDoc::new();
        assert!(!is_empty_update(&b.apply_update(&update).unwrap()));
        assert!(is_empty_update(&b.apply_update(&update).unwrap()));
    }

    #[test]
    fn test_garbage_update_is_rejected() {
        let doc = TreeDoc::new();
        assert!(doc.apply_update(&[0xff, 0xff, 0xff]).is_err());
        assert!(doc.diff(&[0xff]).is_err());
    }

    #[test]
    fn test_mutation_without_changes_is_empty() {
        let doc = TreeDoc::new();
        let (_, update) = doc.mutate(|_| Ok(())).unwrap();
        assert!(is_empty_update(&update));
    }

    #[test]
    fn test_shared_json_shapes() {
        let doc = TreeDoc::new();
        {
            let mut txn = doc.doc().transact_mut();
            let text = txn.get_or_insert_text("notes");
            yrs::Text::insert(&text, &mut txn, 0, "hello");
        }

        assert_eq!(doc.shared_json("notes", SharedKind::Text), Value::String("hello".into()));
        assert_eq!(doc.shared_json("missing", SharedKind::Array), serde_json::json!([]));
        assert_eq!(doc.shared_json("metadata", SharedKind::Map), serde_json::json!({}));
    }

    #[test]
    fn test_shared_kind_deserializes_from_names() {
        let kinds: std::collections::HashMap<String, SharedKind> =
            serde_json::from_str(r#"{"nodeDict":"Map","body":"Text"}"#).unwrap();
        assert_eq!(kinds["nodeDict"], SharedKind::Map);
        assert_eq!(kinds["body"].as_str(), "Text");
    }
}
