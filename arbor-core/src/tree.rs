//! Structural tree operations on a [`TreeDoc`].
//!
//! Every mutation runs in a single yrs transaction and returns the encoded
//! update it produced, ready to be broadcast to other replicas. Validation
//! happens before the first write so a rejected operation leaves the
//! document untouched.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use yrs::{Any, Array, ArrayRef, Map, MapRef, Out, ReadTxn, WriteTxn};

use crate::document::{
    child_ids, children_array, json_to_any, node_map, nodes_map, out_string, read_node,
    sub_content_map, write_node, TreeDoc, TreeJson, TreeMetadata, DATA, KIND, METADATA, NODES,
    PARENT, ROOT_ID, TITLE, TREE_ID, VERSION,
};
use crate::error::TreeError;
use crate::node::{NodeKind, NodeRecord};

/// What happens to the descendants of a deleted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeletePolicy {
    /// Remove the whole subtree.
    #[default]
    Cascade,
    /// Hand the children to the grandparent, at the deleted node's slot.
    Reparent,
    /// Refuse to delete a node that still has children.
    RejectIfNonEmpty,
}

/// A partial tree to merge into a document.
///
/// `null` entries in `nodeDict` delete the corresponding node record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreePatch {
    #[serde(default)]
    pub metadata: TreeMetadata,
    #[serde(default)]
    pub node_dict: BTreeMap<String, Option<NodeRecord>>,
}

impl From<TreeJson> for TreePatch {
    fn from(tree: TreeJson) -> Self {
        Self {
            metadata: tree.metadata,
            node_dict: tree
                .node_dict
                .into_iter()
                .map(|(id, record)| (id, Some(record)))
                .collect(),
        }
    }
}

impl TreeDoc {
    fn resolve_kind(&self, name: &str) -> Result<Arc<dyn NodeKind>, TreeError> {
        self.kinds()
            .get(name)
            .cloned()
            .ok_or_else(|| TreeError::UnknownKind(name.to_string()))
    }

    // -- Structure ---------------------------------------------------------

    /// Add a parentless node and record it as the tree root.
    pub fn insert_root(&self, node: NodeRecord) -> Result<Vec<u8>, TreeError> {
        let kind = self.resolve_kind(&node.kind)?;
        let mut record = node;
        record.parent = None;

        let ((), update) = self.mutate(|txn| {
            let nodes = txn.get_or_insert_map(NODES);
            if nodes.contains_key(&*txn, &record.id) {
                return Err(TreeError::DuplicateNode(record.id.clone()));
            }
            let (_, sub) = write_node(txn, &nodes, &record)?;
            kind.initialize_sub_content(txn, &sub);

            let metadata = txn.get_or_insert_map(METADATA);
            metadata.insert(txn, ROOT_ID, record.id.clone());
            Ok(())
        })?;

        log::debug!("Inserted root node {}", record.id);
        Ok(update)
    }

    /// Insert `node` under `parent_id`, right after the sibling
    /// `position_id`. Without a position, or when the sibling is not among
    /// the parent's children, the node is appended.
    pub fn insert_node(
        &self,
        node: NodeRecord,
        parent_id: &str,
        position_id: Option<&str>,
    ) -> Result<Vec<u8>, TreeError> {
        let kind = self.resolve_kind(&node.kind)?;
        let mut record = node;
        record.parent = Some(parent_id.to_string());

        let (index, update) = self.mutate(|txn| {
            let nodes = txn.get_or_insert_map(NODES);
            if nodes.contains_key(&*txn, &record.id) {
                return Err(TreeError::DuplicateNode(record.id.clone()));
            }
            let parent = node_map(&*txn, parent_id)
                .ok_or_else(|| TreeError::ParentNotFound(parent_id.to_string()))?;

            if let Some(parent_kind) = out_string(parent.get(&*txn, KIND)) {
                if let Some(parent_kind) = self.kinds().get(&parent_kind) {
                    if !parent_kind.accepts_child(&record.kind) {
                        return Err(TreeError::ChildRejected {
                            parent: parent_kind.name().to_string(),
                            child: record.kind.clone(),
                        });
                    }
                }
            }

            let siblings = child_ids(&*txn, &parent);
            let index = match position_id {
                None => siblings.len(),
                Some(position) => match siblings.iter().position(|id| id == position) {
                    Some(i) => i + 1,
                    None => {
                        log::warn!(
                            "Sibling {} not found under {}, appending {}",
                            position,
                            parent_id,
                            record.id
                        );
                        siblings.len()
                    }
                },
            };

            let (_, sub) = write_node(txn, &nodes, &record)?;
            kind.initialize_sub_content(txn, &sub);

            let children = children_array(txn, &parent);
            children.insert(txn, index as u32, record.id.clone());
            Ok(index)
        })?;

        log::debug!("Inserted node {} under {} at {}", record.id, parent_id, index);
        Ok(update)
    }

    /// Remove a node and detach it from its parent's children.
    pub fn delete_node(&self, node_id: &str, policy: DeletePolicy) -> Result<Vec<u8>, TreeError> {
        let (removed, update) = self.mutate(|txn| {
            let nodes = txn.get_or_insert_map(NODES);
            let node = node_map(&*txn, node_id)
                .ok_or_else(|| TreeError::NodeNotFound(node_id.to_string()))?;
            let parent_id = out_string(node.get(&*txn, PARENT));
            let parent = parent_id.as_deref().and_then(|id| node_map(&*txn, id));
            let children = child_ids(&*txn, &node);

            if !children.is_empty() {
                match (policy, &parent_id, &parent) {
                    (DeletePolicy::RejectIfNonEmpty, _, _) => {
                        return Err(TreeError::HasChildren(node_id.to_string()));
                    }
                    (DeletePolicy::Reparent, None, _) => {
                        return Err(TreeError::RootHasChildren(node_id.to_string()));
                    }
                    (DeletePolicy::Reparent, Some(missing), None) => {
                        return Err(TreeError::ParentNotFound(missing.clone()));
                    }
                    _ => {}
                }
            }

            let mut slot: Option<(ArrayRef, u32)> = None;
            if let Some(parent) = &parent {
                let siblings = children_array(txn, parent);
                let index = match position_in(&*txn, &siblings, node_id) {
                    Some(index) => {
                        siblings.remove(txn, index);
                        index
                    }
                    None => siblings.len(&*txn),
                };
                slot = Some((siblings, index));
            }

            let mut removed = 1;
            match policy {
                DeletePolicy::Cascade => {
                    for id in collect_descendants(&*txn, node_id) {
                        nodes.remove(txn, &id);
                        removed += 1;
                    }
                }
                DeletePolicy::Reparent => {
                    if let (Some((siblings, index)), Some(new_parent)) = (&slot, &parent_id) {
                        for (offset, child) in children.iter().enumerate() {
                            siblings.insert(txn, index + offset as u32, child.clone());
                            if let Some(child_node) = node_map(&*txn, child) {
                                child_node.insert(txn, PARENT, new_parent.clone());
                            }
                        }
                    }
                }
                DeletePolicy::RejectIfNonEmpty => {}
            }
            nodes.remove(txn, node_id);

            let metadata = txn.get_or_insert_map(METADATA);
            if out_string(metadata.get(&*txn, ROOT_ID)).as_deref() == Some(node_id) {
                metadata.remove(txn, ROOT_ID);
            }
            Ok(removed)
        })?;

        log::debug!("Deleted node {} ({:?}, {} records removed)", node_id, policy, removed);
        Ok(update)
    }

    /// Merge a partial tree: metadata keys are overwritten, node entries
    /// replace the stored record and `null` entries delete it.
    pub fn import_tree(&self, patch: &TreePatch, tree_id: Option<&str>) -> Result<Vec<u8>, TreeError> {
        for record in patch.node_dict.values().flatten() {
            self.resolve_kind(&record.kind)?;
            json_to_any(&record.data)?;
            for value in record.sub_content.values() {
                json_to_any(value)?;
            }
        }

        let ((), update) = self.mutate(|txn| {
            let metadata = txn.get_or_insert_map(METADATA);
            let meta = &patch.metadata;
            for (key, value) in [
                (ROOT_ID, &meta.root_id),
                (TREE_ID, &meta.tree_id),
                (VERSION, &meta.version),
            ] {
                if let Some(value) = value {
                    metadata.insert(txn, key, value.clone());
                }
            }
            if let Some(tree_id) = tree_id {
                metadata.insert(txn, TREE_ID, tree_id.to_string());
            }

            let nodes = txn.get_or_insert_map(NODES);
            for (id, entry) in &patch.node_dict {
                match entry {
                    Some(record) if &record.id == id => {
                        write_node(txn, &nodes, record)?;
                    }
                    Some(record) => {
                        let mut record = record.clone();
                        record.id = id.clone();
                        write_node(txn, &nodes, &record)?;
                    }
                    None => {
                        nodes.remove(txn, id);
                    }
                }
            }
            Ok(())
        })?;

        log::debug!("Imported {} node entries", patch.node_dict.len());
        Ok(update)
    }

    // -- Field edits -------------------------------------------------------

    pub fn set_title(&self, node_id: &str, title: &str) -> Result<Vec<u8>, TreeError> {
        let ((), update) = self.mutate(|txn| {
            let node = existing(&*txn, node_id)?;
            node.insert(txn, TITLE, title.to_string());
            Ok(())
        })?;
        Ok(update)
    }

    /// Set one key of the node's JSON `data` object. The object is replaced
    /// as a whole, so concurrent edits of `data` resolve last-writer-wins.
    pub fn set_data_field(&self, node_id: &str, key: &str, value: Value) -> Result<Vec<u8>, TreeError> {
        let value = json_to_any(&value)?;
        let ((), update) = self.mutate(|txn| {
            let node = existing(&*txn, node_id)?;
            let mut fields: HashMap<String, Any> = match node.get(&*txn, DATA) {
                Some(Out::Any(Any::Map(current))) => (*current).clone(),
                _ => HashMap::new(),
            };
            fields.insert(key.to_string(), value);
            node.insert(txn, DATA, Any::Map(Arc::new(fields)));
            Ok(())
        })?;
        Ok(update)
    }

    /// Set one field of the node's collaborative sub-content. Concurrent
    /// edits of different fields merge.
    pub fn set_sub_content_field(
        &self,
        node_id: &str,
        key: &str,
        value: Value,
    ) -> Result<Vec<u8>, TreeError> {
        let value = json_to_any(&value)?;
        let ((), update) = self.mutate(|txn| {
            let node = existing(&*txn, node_id)?;
            let sub = sub_content_map(txn, &node);
            sub.insert(txn, key.to_string(), value);
            Ok(())
        })?;
        Ok(update)
    }

    // -- Queries -----------------------------------------------------------

    pub fn node(&self, node_id: &str) -> Result<NodeRecord, TreeError> {
        let txn = yrs::Transact::transact(self.doc());
        let node = existing(&txn, node_id)?;
        read_node(&txn, node_id, &node)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        let txn = yrs::Transact::transact(self.doc());
        node_map(&txn, node_id).is_some()
    }

    pub fn children(&self, node_id: &str) -> Result<Vec<String>, TreeError> {
        let txn = yrs::Transact::transact(self.doc());
        let node = existing(&txn, node_id)?;
        Ok(child_ids(&txn, &node))
    }

    /// Child records in order. Ids without a record are skipped.
    pub fn child_nodes(&self, node_id: &str) -> Result<Vec<NodeRecord>, TreeError> {
        let txn = yrs::Transact::transact(self.doc());
        let node = existing(&txn, node_id)?;
        Ok(child_ids(&txn, &node)
            .into_iter()
            .filter_map(|id| {
                let child = node_map(&txn, &id)?;
                read_node(&txn, &id, &child).ok()
            })
            .collect())
    }

    pub fn parent(&self, node_id: &str) -> Result<Option<String>, TreeError> {
        let txn = yrs::Transact::transact(self.doc());
        let node = existing(&txn, node_id)?;
        Ok(out_string(node.get(&txn, PARENT)))
    }

    pub fn root(&self) -> Option<NodeRecord> {
        let root_id = self.metadata().root_id?;
        self.node(&root_id).ok()
    }

    /// Ids of every node below `node_id`, depth-first in child order.
    pub fn descendants(&self, node_id: &str) -> Result<Vec<String>, TreeError> {
        let txn = yrs::Transact::transact(self.doc());
        existing(&txn, node_id)?;
        Ok(collect_descendants(&txn, node_id))
    }

    pub fn node_count(&self) -> u32 {
        let txn = yrs::Transact::transact(self.doc());
        nodes_map(&txn).map(|nodes| nodes.len(&txn)).unwrap_or(0)
    }
}

fn existing<T: ReadTxn>(txn: &T, node_id: &str) -> Result<MapRef, TreeError> {
    node_map(txn, node_id).ok_or_else(|| TreeError::NodeNotFound(node_id.to_string()))
}

fn position_in<T: ReadTxn>(txn: &T, children: &ArrayRef, id: &str) -> Option<u32> {
    children
        .iter(txn)
        .position(|out| matches!(out, Out::Any(Any::String(s)) if &*s == id))
        .map(|i| i as u32)
}

fn collect_descendants<T: ReadTxn>(txn: &T, node_id: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    seen.insert(node_id.to_string());
    let mut stack: Vec<String> = match node_map(txn, node_id) {
        Some(node) => child_ids(txn, &node).into_iter().rev().collect(),
        None => Vec::new(),
    };

    let mut out = Vec::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(node) = node_map(txn, &id) {
            stack.extend(child_ids(txn, &node).into_iter().rev());
        }
        out.push(id);
    }
    out
}
