//! Merging a client's proposed message list with the server's authoritative
//! one before persisting.
//!
//! Two passes over the client list:
//!
//! 1. exact id: a client message whose id equals an unclaimed server id
//!    claims that server row unchanged;
//! 2. content: every remaining assistant message claims the earliest
//!    still-unclaimed server row with the same role and byte-equal
//!    serialized content, and takes over its id.
//!
//! Pass 2 always scans every unclaimed server row, so an out-of-position id
//! match from pass 1 never hides an earlier row from a later content match.
//! Messages matched by neither pass are new and keep their client ids.

use std::collections::{HashMap, HashSet};

use crate::transcript::{IdOrigin, Message, Role};

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationResult {
    /// Client id → final id, for every client message.
    pub id_map: HashMap<String, String>,
    /// One row per client message, in client order, carrying final ids.
    pub messages: Vec<Message>,
    /// Server ids that are safe to delete; empty unless `deletion_allowed`.
    pub to_delete: Vec<String>,
    /// Whether the final id set is a subset of the server id set.
    pub deletion_allowed: bool,
}

impl ReconciliationResult {
    pub fn final_ids(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.id.as_str()).collect()
    }

    /// Client ids that were renamed to a server id.
    pub fn remapped(&self) -> impl Iterator<Item = (&str, &str)> {
        self.id_map
            .iter()
            .filter(|(from, to)| from != to)
            .map(|(from, to)| (from.as_str(), to.as_str()))
    }
}

fn content_key(message: &Message) -> Option<String> {
    serde_json::to_string(&message.content).ok()
}

/// Reconcile `client` against `server`.
///
/// Client ids are expected to be unique. A repeated id only claims a server
/// row once; every occurrence still yields an output row, so the repeats
/// collapse into one stored row on persist.
pub fn reconcile(server: &[Message], client: &[Message]) -> ReconciliationResult {
    let mut server_index: HashMap<&str, usize> = HashMap::with_capacity(server.len());
    for (index, message) in server.iter().enumerate() {
        server_index.entry(message.id.as_str()).or_insert(index);
    }

    let mut claimed = vec![false; server.len()];
    let mut matched: Vec<Option<usize>> = vec![None; client.len()];

    for (ci, message) in client.iter().enumerate() {
        if let Some(&si) = server_index.get(message.id.as_str()) {
            if !claimed[si] {
                claimed[si] = true;
                matched[ci] = Some(si);
            }
        }
    }

    // Serialized lazily; only assistant rows are ever compared.
    let mut server_keys: Vec<Option<Option<String>>> = vec![None; server.len()];
    for (ci, message) in client.iter().enumerate() {
        if matched[ci].is_some() || message.role != Role::Assistant {
            continue;
        }
        let Some(key) = content_key(message) else {
            continue;
        };
        let found = (0..server.len()).find(|&si| {
            if claimed[si] || server[si].role != message.role {
                return false;
            }
            let server_key = server_keys[si].get_or_insert_with(|| content_key(&server[si]));
            server_key.as_deref() == Some(key.as_str())
        });
        if let Some(si) = found {
            claimed[si] = true;
            matched[ci] = Some(si);
        }
    }

    let mut id_map = HashMap::with_capacity(client.len());
    let mut messages = Vec::with_capacity(client.len());
    let mut seen_client = HashSet::with_capacity(client.len());
    for (ci, message) in client.iter().enumerate() {
        if !seen_client.insert(message.id.as_str()) {
            tracing::debug!(id = %message.id, "repeated client id; rows will collapse on persist");
        }
        let final_message = match matched[ci] {
            Some(si) => Message {
                id: server[si].id.clone(),
                origin: IdOrigin::Server,
                ..message.clone()
            },
            None => message.clone(),
        };
        id_map.insert(message.id.clone(), final_message.id.clone());
        messages.push(final_message);
    }

    let server_ids: HashSet<&str> = server.iter().map(|m| m.id.as_str()).collect();
    let final_ids: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    let deletion_allowed = final_ids.is_subset(&server_ids);

    let mut to_delete = Vec::new();
    if deletion_allowed {
        let mut seen = HashSet::new();
        for message in server {
            let id = message.id.as_str();
            if !final_ids.contains(id) && seen.insert(id) {
                to_delete.push(message.id.clone());
            }
        }
    } else {
        tracing::debug!(
            new_ids = final_ids.difference(&server_ids).count(),
            "client introduced new ids; skipping deletion"
        );
    }

    ReconciliationResult {
        id_map,
        messages,
        to_delete,
        deletion_allowed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn srv(id: &str, role: Role, text: &str) -> Message {
        Message::server_text(id, role, text)
    }

    fn cli(id: &str, role: Role, text: &str) -> Message {
        Message {
            origin: IdOrigin::Client,
            ..Message::server_text(id, role, text)
        }
    }

    #[test]
    fn identical_lists_are_identity() {
        let server = vec![srv("u1", Role::User, "hi"), srv("a1", Role::Assistant, "yo")];
        let result = reconcile(&server, &server);
        assert_eq!(result.final_ids(), vec!["u1", "a1"]);
        assert!(result.remapped().next().is_none());
        assert!(result.to_delete.is_empty());
        assert!(result.deletion_allowed);
    }

    #[test]
    fn user_messages_are_never_content_matched() {
        let server = vec![srv("u1", Role::User, "again")];
        let client = vec![cli("u9", Role::User, "again")];
        let result = reconcile(&server, &client);
        assert_eq!(result.final_ids(), vec!["u9"]);
        assert!(!result.deletion_allowed);
        assert!(result.to_delete.is_empty());
    }

    #[test]
    fn content_match_requires_equal_role() {
        let server = vec![srv("t1", Role::Tool, "Sure")];
        let client = vec![cli("x1", Role::Assistant, "Sure")];
        let result = reconcile(&server, &client);
        assert_eq!(result.final_ids(), vec!["x1"]);
    }

    #[test]
    fn id_match_keeps_client_content() {
        let server = vec![srv("a1", Role::Assistant, "draft")];
        let client = vec![cli("a1", Role::Assistant, "final")];
        let result = reconcile(&server, &client);
        assert_eq!(result.messages[0].text(), "final");
        assert_eq!(result.id_map["a1"], "a1");
    }

    #[test]
    fn duplicate_content_takes_earliest_unclaimed_row() {
        let server = vec![
            srv("s1", Role::Assistant, "ok"),
            srv("s2", Role::Assistant, "ok"),
            srv("s3", Role::Assistant, "ok"),
        ];
        let client = vec![
            cli("s2", Role::Assistant, "ok"),
            cli("x1", Role::Assistant, "ok"),
            cli("x2", Role::Assistant, "ok"),
        ];
        let result = reconcile(&server, &client);
        assert_eq!(result.final_ids(), vec!["s2", "s1", "s3"]);
    }

    #[test]
    fn new_assistant_message_keeps_client_id() {
        let server = vec![srv("u1", Role::User, "hi")];
        let client = vec![cli("u1", Role::User, "hi"), cli("x1", Role::Assistant, "new")];
        let result = reconcile(&server, &client);
        assert_eq!(result.final_ids(), vec!["u1", "x1"]);
        assert_eq!(result.messages[1].origin, IdOrigin::Client);
        assert!(!result.deletion_allowed);
    }

    #[test]
    fn empty_client_list_deletes_everything() {
        let server = vec![srv("u1", Role::User, "hi")];
        let result = reconcile(&server, &[]);
        assert!(result.deletion_allowed);
        assert_eq!(result.to_delete, vec!["u1"]);
    }

    #[test]
    fn repeated_client_id_claims_one_row_and_collapses_on_persist() {
        use crate::transcript::{persist_messages, MemoryTranscript};

        let server = vec![srv("u1", Role::User, "hi")];
        let client = vec![cli("u1", Role::User, "hi"), cli("u1", Role::User, "hi")];
        let result = reconcile(&server, &client);
        assert_eq!(result.final_ids(), vec!["u1", "u1"]);
        assert_eq!(result.id_map.len(), 1);
        assert!(result.deletion_allowed);

        let mut store = MemoryTranscript::with_messages(server);
        persist_messages(&mut store, &client).unwrap();
        assert_eq!(store.ids(), vec!["u1"]);
    }
}
