//! Ephemeral presence ("awareness") per document.
//!
//! Each client id owns one JSON state and a clock it increments on every
//! change. States are never persisted and never enter the document; they are
//! exchanged as awareness messages and merged last-writer-wins by clock.
//!
//! A removed client keeps its clock with no state (a tombstone) so a stale
//! state that arrives later cannot resurrect it.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::protocol::{read_str, ProtocolError};

/// One entry of an awareness message. `state: None` encodes a removal.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client: u64,
    pub clock: u64,
    pub state: Option<Value>,
}

/// Decoded awareness message payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clients(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.client).collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::with_capacity(8 + self.entries.len() * 32);
        buf.write_var(self.entries.len());
        for entry in &self.entries {
            buf.write_var(entry.client);
            buf.write_var(entry.clock);
            let json = match &entry.state {
                Some(state) => state.to_string(),
                None => "null".to_string(),
            };
            buf.write_string(&json);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let count: u64 = cursor.read_var()?;
        let mut entries = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let client: u64 = cursor.read_var()?;
            let clock: u64 = cursor.read_var()?;
            let json = read_str(&mut cursor)?;
            let state: Value = serde_json::from_str(json)
                .map_err(|e| ProtocolError::InvalidAwareness(e.to_string()))?;
            entries.push(AwarenessEntry {
                client,
                clock,
                state: match state {
                    Value::Null => None,
                    state => Some(state),
                },
            });
        }
        Ok(Self { entries })
    }
}

/// Client ids touched by one applied update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChanges {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every touched id: added, then updated, then removed.
    pub fn all(&self) -> Vec<u64> {
        let mut ids = Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        ids.extend_from_slice(&self.added);
        ids.extend_from_slice(&self.updated);
        ids.extend_from_slice(&self.removed);
        ids
    }
}

#[derive(Debug, Clone)]
pub struct ClientMeta {
    pub clock: u64,
    pub last_updated: Instant,
}

/// Awareness store for one document replica.
///
/// Unlike `yrs::sync::Awareness`, a store need not own a client id: the
/// server relays every peer's state without publishing one of its own, so
/// any id a client picks (including 0) stays removable by that client.
#[derive(Debug)]
pub struct Awareness {
    local_id: Option<u64>,
    states: HashMap<u64, Value>,
    meta: HashMap<u64, ClientMeta>,
}

impl Awareness {
    /// Store for a replica that publishes its own state under `local_id`.
    pub fn new(local_id: u64) -> Self {
        Self::with_local_id(Some(local_id))
    }

    /// Store that only mirrors remote peers.
    pub fn relay() -> Self {
        Self::with_local_id(None)
    }

    fn with_local_id(local_id: Option<u64>) -> Self {
        Self {
            local_id,
            states: HashMap::new(),
            meta: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> Option<u64> {
        self.local_id
    }

    pub fn local_state(&self) -> Option<&Value> {
        self.states.get(&self.local_id?)
    }

    /// Replace the local state (or clear it with `None`) and return the
    /// update to publish. A relay store has nothing to publish.
    pub fn set_local_state(&mut self, state: Option<Value>) -> Option<AwarenessUpdate> {
        let local_id = self.local_id?;
        let clock = self.meta.get(&local_id).map_or(0, |m| m.clock + 1);
        match &state {
            Some(state) => {
                self.states.insert(local_id, state.clone());
            }
            None => {
                self.states.remove(&local_id);
            }
        }
        self.meta.insert(
            local_id,
            ClientMeta {
                clock,
                last_updated: Instant::now(),
            },
        );
        Some(AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client: local_id,
                clock,
                state,
            }],
        })
    }

    /// Live state of a client.
    pub fn get(&self, client: u64) -> Option<&Value> {
        self.states.get(&client)
    }

    pub fn clock(&self, client: u64) -> Option<u64> {
        self.meta.get(&client).map(|m| m.clock)
    }

    pub fn meta(&self, client: u64) -> Option<&ClientMeta> {
        self.meta.get(&client)
    }

    pub fn states(&self) -> &HashMap<u64, Value> {
        &self.states
    }

    /// Number of clients with a live state.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Merge a remote update.
    ///
    /// An entry wins when its clock is strictly newer than the stored one,
    /// or when the clocks tie and the entry removes a live state. Anything
    /// else is stale and dropped.
    pub fn apply_update(&mut self, update: &AwarenessUpdate) -> AwarenessChanges {
        let now = Instant::now();
        let mut changes = AwarenessChanges::default();

        for entry in &update.entries {
            let client = entry.client;
            let is_local = self.local_id == Some(client);
            let had_state = self.states.contains_key(&client);
            let newer = match self.meta.get(&client) {
                None => true,
                Some(meta) => {
                    entry.clock > meta.clock
                        || (entry.clock == meta.clock && entry.state.is_none() && had_state)
                }
            };
            if !newer {
                log::trace!("Dropping stale awareness entry for client {}", client);
                continue;
            }

            let mut clock = entry.clock;
            match &entry.state {
                None if is_local && had_state => {
                    // Remote peers cannot clear our own state; outbid them.
                    clock += 1;
                }
                None => {
                    self.states.remove(&client);
                }
                Some(state) => {
                    self.states.insert(client, state.clone());
                }
            }
            self.meta.insert(
                client,
                ClientMeta {
                    clock,
                    last_updated: now,
                },
            );

            match (had_state, &entry.state) {
                (false, Some(_)) => changes.added.push(client),
                (true, None) if !is_local => changes.removed.push(client),
                (true, Some(_)) => changes.updated.push(client),
                _ => {}
            }
        }

        changes
    }

    /// Drop the states of `clients`, leaving tombstones one clock ahead.
    /// Returns the ids that actually had a state.
    pub fn remove_states(&mut self, clients: &[u64]) -> Vec<u64> {
        let now = Instant::now();
        let mut removed = Vec::new();
        for &client in clients {
            if self.states.remove(&client).is_some() {
                let clock = self.meta.get(&client).map_or(0, |m| m.clock + 1);
                self.meta.insert(
                    client,
                    ClientMeta {
                        clock,
                        last_updated: now,
                    },
                );
                removed.push(client);
            }
        }
        removed
    }

    /// Current entries (state or tombstone) for the given clients.
    pub fn encode_update(&self, clients: &[u64]) -> AwarenessUpdate {
        let entries = clients
            .iter()
            .filter_map(|client| {
                let meta = self.meta.get(client)?;
                Some(AwarenessEntry {
                    client: *client,
                    clock: meta.clock,
                    state: self.states.get(client).cloned(),
                })
            })
            .collect();
        AwarenessUpdate { entries }
    }

    /// Every live state, as sent to a newly connected peer.
    pub fn full_update(&self) -> AwarenessUpdate {
        let mut clients: Vec<u64> = self.states.keys().copied().collect();
        clients.sort_unstable();
        self.encode_update(&clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(client: u64, clock: u64, state: Option<Value>) -> AwarenessUpdate {
        AwarenessUpdate {
            entries: vec![AwarenessEntry { client, clock, state }],
        }
    }

    #[test]
    fn test_payload_wire_format() {
        let update = AwarenessUpdate {
            entries: vec![
                AwarenessEntry { client: 5, clock: 2, state: Some(json!({"user": "ana"})) },
                AwarenessEntry { client: 300, clock: 1, state: None },
            ],
        };
        let bytes = update.encode();
        // count, client 5, clock 2, then the JSON string.
        assert_eq!(&bytes[..3], &[2, 5, 2]);
        assert_eq!(AwarenessUpdate::decode(&bytes).unwrap(), update);
    }

    #[test]
    fn test_decode_rejects_bad_json() {
        let mut buf: Vec<u8> = Vec::new();
        buf.write_var(1u64);
        buf.write_var(1u64);
        buf.write_var(1u64);
        buf.write_string("{not json");
        assert!(matches!(
            AwarenessUpdate::decode(&buf),
            Err(ProtocolError::InvalidAwareness(_))
        ));
    }

    #[test]
    fn test_add_update_remove() {
        let mut aw = Awareness::relay();

        let changes = aw.apply_update(&entry(7, 1, Some(json!({"x": 1}))));
        assert_eq!(changes.added, vec![7]);

        let changes = aw.apply_update(&entry(7, 2, Some(json!({"x": 2}))));
        assert_eq!(changes.updated, vec![7]);
        assert_eq!(aw.get(7), Some(&json!({"x": 2})));

        let changes = aw.apply_update(&entry(7, 3, None));
        assert_eq!(changes.removed, vec![7]);
        assert!(aw.get(7).is_none());
        assert_eq!(aw.clock(7), Some(3));
    }

    #[test]
    fn test_stale_clock_is_dropped() {
        let mut aw = Awareness::relay();
        aw.apply_update(&entry(7, 5, Some(json!("new"))));

        let changes = aw.apply_update(&entry(7, 4, Some(json!("old"))));
        assert!(changes.is_empty());
        let changes = aw.apply_update(&entry(7, 5, Some(json!("same clock"))));
        assert!(changes.is_empty());
        assert_eq!(aw.get(7), Some(&json!("new")));
    }

    #[test]
    fn test_removal_wins_clock_tie() {
        let mut aw = Awareness::relay();
        aw.apply_update(&entry(7, 5, Some(json!("here"))));
        let changes = aw.apply_update(&entry(7, 5, None));
        assert_eq!(changes.removed, vec![7]);
        assert!(aw.is_empty());
    }

    #[test]
    fn test_tombstone_blocks_resurrection() {
        let mut aw = Awareness::relay();
        aw.apply_update(&entry(9, 1, Some(json!("a"))));
        assert_eq!(aw.remove_states(&[9, 42]), vec![9]);
        assert_eq!(aw.clock(9), Some(2));

        let late = aw.apply_update(&entry(9, 1, Some(json!("a"))));
        assert!(late.is_empty());
        assert!(aw.get(9).is_none());

        let update = aw.encode_update(&[9]);
        assert_eq!(update.entries, vec![AwarenessEntry { client: 9, clock: 2, state: None }]);
    }

    #[test]
    fn test_remote_cannot_clear_local_state() {
        let mut aw = Awareness::new(1);
        aw.set_local_state(Some(json!({"me": true})));
        let changes = aw.apply_update(&entry(1, 0, None));
        assert!(changes.removed.is_empty());
        assert!(aw.local_state().is_some());
        assert_eq!(aw.clock(1), Some(1));
    }

    #[test]
    fn test_local_clock_increments() {
        let mut aw = Awareness::new(3);
        assert_eq!(aw.set_local_state(Some(json!(1))).unwrap().entries[0].clock, 0);
        assert_eq!(aw.set_local_state(Some(json!(2))).unwrap().entries[0].clock, 1);
        let cleared = aw.set_local_state(None).unwrap();
        assert_eq!(cleared.entries[0].clock, 2);
        assert_eq!(cleared.entries[0].state, None);
    }

    #[test]
    fn test_relay_store_lets_any_client_withdraw() {
        let mut aw = Awareness::relay();
        assert!(aw.local_id().is_none());
        assert!(aw.set_local_state(Some(json!("ignored"))).is_none());

        aw.apply_update(&entry(0, 1, Some(json!({"user": "zero"}))));
        let changes = aw.apply_update(&entry(0, 2, None));
        assert_eq!(changes.removed, vec![0]);
        assert!(aw.is_empty());
        assert_eq!(aw.clock(0), Some(2));
    }

    #[test]
    fn test_payload_matches_yrs_codec() {
        use yrs::updates::decoder::Decode;

        let update = AwarenessUpdate {
            entries: vec![AwarenessEntry { client: 11, clock: 4, state: Some(json!({"a": 1})) }],
        };
        let theirs = yrs::sync::AwarenessUpdate::decode_v1(&update.encode()).unwrap();
        let entry = &theirs.clients[&11];
        assert_eq!(entry.clock, 4);
        assert_eq!(serde_json::from_str::<Value>(&entry.json).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_full_update_lists_live_states_only() {
        let mut aw = Awareness::relay();
        aw.apply_update(&entry(5, 1, Some(json!("five"))));
        aw.apply_update(&entry(9, 1, Some(json!("nine"))));
        aw.remove_states(&[5]);
        assert_eq!(aw.full_update().clients(), vec![9]);
    }
}
