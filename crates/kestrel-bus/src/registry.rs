// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bookkeeping for live agents: who exists, whose session they use, their
//! role (for role-based routing), and whether they're paused. Holds no
//! conversation state itself — that lives in the `Engine` the coordinator
//! keeps alongside this registry.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: String,
    pub parent: Option<String>,
    pub role: Option<String>,
    pub session_id: String,
    pub paused: bool,
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentRecord>,
    role_cursor: HashMap<String, usize>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: AgentRecord) {
        self.agents.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<&AgentRecord> {
        self.agents.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<AgentRecord> {
        self.agents.remove(id)
    }

    pub fn set_paused(&mut self, id: &str, paused: bool) -> bool {
        match self.agents.get_mut(id) {
            Some(record) => {
                record.paused = paused;
                true
            }
            None => false,
        }
    }

    /// How many other records still point at `session_id` — used to decide
    /// whether destroying an agent should also drop its shared engine.
    pub fn session_refcount(&self, session_id: &str) -> usize {
        self.agents.values().filter(|a| a.session_id == session_id).count()
    }

    /// Round-robin the next active (non-paused) agent with `role`. Advances
    /// the cursor for that role so the next call picks the next one.
    pub fn next_for_role(&mut self, role: &str) -> Option<String> {
        let mut candidates: Vec<&AgentRecord> =
            self.agents.values().filter(|a| a.role.as_deref() == Some(role) && !a.paused).collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        let cursor = self.role_cursor.entry(role.to_string()).or_insert(0);
        let chosen = candidates[*cursor % candidates.len()].id.clone();
        *cursor = (*cursor + 1) % candidates.len();
        Some(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, role: &str) -> AgentRecord {
        AgentRecord { id: id.into(), parent: None, role: Some(role.into()), session_id: id.into(), paused: false }
    }

    #[test]
    fn next_for_role_round_robins_across_calls() {
        let mut reg = AgentRegistry::new();
        reg.insert(record("a", "worker"));
        reg.insert(record("b", "worker"));
        let first = reg.next_for_role("worker").unwrap();
        let second = reg.next_for_role("worker").unwrap();
        let third = reg.next_for_role("worker").unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn next_for_role_skips_paused_agents() {
        let mut reg = AgentRegistry::new();
        reg.insert(record("a", "worker"));
        let mut paused = record("b", "worker");
        paused.paused = true;
        reg.insert(paused);
        assert_eq!(reg.next_for_role("worker").unwrap(), "a");
        assert_eq!(reg.next_for_role("worker").unwrap(), "a");
    }

    #[test]
    fn next_for_role_returns_none_when_nobody_matches() {
        let mut reg = AgentRegistry::new();
        assert!(reg.next_for_role("worker").is_none());
    }

    #[test]
    fn session_refcount_counts_shared_session_agents() {
        let mut reg = AgentRegistry::new();
        reg.insert(AgentRecord { id: "a".into(), parent: None, role: None, session_id: "shared".into(), paused: false });
        reg.insert(AgentRecord { id: "b".into(), parent: None, role: None, session_id: "shared".into(), paused: false });
        assert_eq!(reg.session_refcount("shared"), 2);
    }
}
