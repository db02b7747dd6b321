// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde_json::Value;

use qx_model::{wire, Message, Role};

/// Entries above this count trigger cache eviction down to half.
const CACHE_LIMIT: usize = 1000;

/// Ordered conversation history with a per-message serialization cache.
///
/// Invariants maintained by the run loop and checked by tests:
/// the first message (if any) is the single system message; every tool
/// message's id matches a prior assistant tool call; tool-call groups are
/// fully resolved before the next user/assistant message.
///
/// The cache memoizes each message's wire object keyed by a store-assigned
/// id, purely to avoid re-serializing large histories on every provider
/// call.  It carries no semantics.
pub struct MessageStore {
    entries: Vec<(u64, Message)>,
    next_id: u64,
    cache: HashMap<u64, Value>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            cache: HashMap::new(),
        }
    }

    pub fn push(&mut self, msg: Message) {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, msg));
    }

    /// Prepend the system message unless one already leads the store.
    pub fn ensure_system(&mut self, prompt: &str) {
        if matches!(self.entries.first(), Some((_, m)) if m.role == Role::System) {
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(0, (id, Message::system(prompt)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.entries.get(index).map(|(_, m)| m)
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|(_, m)| m)
    }

    pub fn last(&self) -> Option<&Message> {
        self.entries.last().map(|(_, m)| m)
    }

    /// Serialize the history into the provider wire shape, reusing cached
    /// per-message objects.  Consecutive tool-call messages are coalesced
    /// after the per-message step so caching stays message-granular.
    pub fn serialize(&mut self) -> Vec<Value> {
        let mut values = Vec::with_capacity(self.entries.len());
        for (id, msg) in &self.entries {
            let value = self
                .cache
                .entry(*id)
                .or_insert_with(|| wire::message_to_wire(msg))
                .clone();
            values.push(value);
        }
        self.evict_if_needed();
        wire::coalesce_tool_calls(values)
    }

    /// Drop the oldest half of the cache once it crosses [`CACHE_LIMIT`].
    /// Ids are monotonic, so the smallest keys are the oldest messages.
    fn evict_if_needed(&mut self) {
        if self.cache.len() < CACHE_LIMIT {
            return;
        }
        let mut ids: Vec<u64> = self.cache.keys().copied().collect();
        ids.sort_unstable();
        for id in &ids[..ids.len() / 2] {
            self.cache.remove(id);
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use qx_model::MessageContent;

    use super::*;

    #[test]
    fn push_preserves_order() {
        let mut store = MessageStore::new();
        store.push(Message::user("one"));
        store.push(Message::assistant("two"));
        let texts: Vec<_> = store.messages().filter_map(|m| m.as_text()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[test]
    fn ensure_system_prepends_once() {
        let mut store = MessageStore::new();
        store.push(Message::user("hi"));
        store.ensure_system("be helpful");
        store.ensure_system("be helpful");
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(0).unwrap().role, Role::System);
    }

    #[test]
    fn ensure_system_noop_when_already_leading() {
        let mut store = MessageStore::new();
        store.push(Message::system("first"));
        store.ensure_system("second");
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(0).unwrap().as_text(), Some("first"));
    }

    #[test]
    fn serialize_produces_wire_shape() {
        let mut store = MessageStore::new();
        store.push(Message::system("sys"));
        store.push(Message::user("q"));
        let wire = store.serialize();
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[1]["content"], "q");
    }

    #[test]
    fn serialize_coalesces_parallel_tool_calls() {
        let mut store = MessageStore::new();
        store.push(Message::tool_call("c1", "a", "{}"));
        store.push(Message::tool_call("c2", "b", "{}"));
        store.push(Message::tool_result("c1", "r1"));
        store.push(Message::tool_result("c2", "r2"));
        let wire = store.serialize();
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0]["tool_calls"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn serialize_twice_reuses_cache() {
        let mut store = MessageStore::new();
        store.push(Message::user("hello"));
        let first = store.serialize();
        let second = store.serialize();
        assert_eq!(first, second);
        assert_eq!(store.cached_entries(), 1);
    }

    #[test]
    fn cache_evicts_to_half_at_limit() {
        let mut store = MessageStore::new();
        for i in 0..CACHE_LIMIT {
            store.push(Message::user(format!("m{i}")));
        }
        let _ = store.serialize();
        assert!(
            store.cached_entries() <= CACHE_LIMIT / 2,
            "cache should have been halved, has {}",
            store.cached_entries()
        );
        // Serialization output is unaffected by eviction.
        let wire = store.serialize();
        assert_eq!(wire.len(), CACHE_LIMIT);
        assert_eq!(wire[0]["content"], "m0");
    }

    #[test]
    fn tool_results_match_prior_tool_call_ids() {
        let mut store = MessageStore::new();
        store.push(Message::system("s"));
        store.push(Message::user("u"));
        store.push(Message::tool_call("c1", "t", "{}"));
        store.push(Message::tool_result("c1", "out"));

        let call_ids: Vec<&str> = store
            .messages()
            .filter(|m| matches!(m.content, MessageContent::ToolCall { .. }))
            .filter_map(|m| m.tool_call_id())
            .collect();
        for m in store.messages().filter(|m| m.role == Role::Tool) {
            let id = m.tool_call_id().unwrap();
            assert!(call_ids.contains(&id), "orphan tool result {id}");
        }
    }
}
