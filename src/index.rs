//! Rule and group storage with trigger-kind candidate selection.
//!
//! Candidates are returned in dispatch order: `priority` descending, ties
//! broken by `created_at` ascending, then id, so a single trigger always
//! fires its rules deterministically.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::{ExecutionError, VerdictError, VerdictResult};
use crate::pattern::{fact_key_matches, topic_matches};
use crate::rule::{Rule, RuleGroup, Trigger};

/// Engine-private rule and group index.
#[derive(Default)]
pub struct RuleIndex {
    rules: BTreeMap<String, Rule>,
    groups: BTreeMap<String, RuleGroup>,
}

impl RuleIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new rule.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::DuplicateId` when the id is taken.
    pub fn insert(&mut self, rule: Rule) -> VerdictResult<()> {
        if self.rules.contains_key(&rule.id) {
            return Err(VerdictError::Execution(ExecutionError::DuplicateId {
                id: rule.id,
            }));
        }
        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    /// Replaces an existing rule.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::RuleNotFound` when the id is unknown.
    pub fn replace(&mut self, rule: Rule) -> VerdictResult<()> {
        if !self.rules.contains_key(&rule.id) {
            return Err(VerdictError::Execution(ExecutionError::RuleNotFound {
                id: rule.id,
            }));
        }
        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    /// Removes a rule, returning it.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::RuleNotFound` when the id is unknown.
    pub fn remove(&mut self, id: &str) -> VerdictResult<Rule> {
        self.rules
            .remove(id)
            .ok_or_else(|| VerdictError::Execution(ExecutionError::RuleNotFound { id: id.to_string() }))
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.get(id)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Rule> {
        self.rules.get_mut(id)
    }

    /// All rules, ordered by id.
    #[must_use]
    pub fn all(&self) -> Vec<Rule> {
        self.rules.values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Inserts a new group.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::DuplicateId` when the id is taken.
    pub fn insert_group(&mut self, group: RuleGroup) -> VerdictResult<()> {
        if self.groups.contains_key(&group.id) {
            return Err(VerdictError::Execution(ExecutionError::DuplicateId {
                id: group.id,
            }));
        }
        self.groups.insert(group.id.clone(), group);
        Ok(())
    }

    /// Replaces an existing group.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::GroupNotFound` when the id is unknown.
    pub fn replace_group(&mut self, group: RuleGroup) -> VerdictResult<()> {
        if !self.groups.contains_key(&group.id) {
            return Err(VerdictError::Execution(ExecutionError::GroupNotFound {
                id: group.id,
            }));
        }
        self.groups.insert(group.id.clone(), group);
        Ok(())
    }

    /// Removes a group and ungates its rules.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::GroupNotFound` when the id is unknown.
    pub fn remove_group(&mut self, id: &str) -> VerdictResult<RuleGroup> {
        let group = self.groups.remove(id).ok_or_else(|| {
            VerdictError::Execution(ExecutionError::GroupNotFound { id: id.to_string() })
        })?;

        for rule in self.rules.values_mut() {
            if rule.group.as_deref() == Some(id) {
                rule.group = None;
            }
        }
        Ok(group)
    }

    #[must_use]
    pub fn get_group(&self, id: &str) -> Option<&RuleGroup> {
        self.groups.get(id)
    }

    #[must_use]
    pub fn get_group_mut(&mut self, id: &str) -> Option<&mut RuleGroup> {
        self.groups.get_mut(id)
    }

    /// All groups, ordered by id.
    #[must_use]
    pub fn all_groups(&self) -> Vec<RuleGroup> {
        self.groups.values().cloned().collect()
    }

    /// A rule is active iff enabled and its group (when present and known)
    /// is enabled. A stale group reference counts as ungrouped.
    #[must_use]
    pub fn is_active(&self, rule: &Rule) -> bool {
        if !rule.enabled {
            return false;
        }
        match rule.group.as_deref().and_then(|g| self.groups.get(g)) {
            Some(group) => group.enabled,
            None => true,
        }
    }

    fn candidates<F>(&self, matches: F) -> Vec<Rule>
    where
        F: Fn(&Trigger) -> bool,
    {
        let mut out: Vec<Rule> = self
            .rules
            .values()
            .filter(|rule| self.is_active(rule) && matches(&rule.trigger))
            .cloned()
            .collect();
        out.sort_by(dispatch_order);
        out
    }

    /// Active rules whose event trigger matches the topic, in dispatch order.
    #[must_use]
    pub fn candidates_for_event(&self, topic: &str) -> Vec<Rule> {
        self.candidates(|trigger| match trigger {
            Trigger::Event { topic: pattern } => topic_matches(pattern, topic),
            _ => false,
        })
    }

    /// Active rules whose fact trigger matches the key, in dispatch order.
    #[must_use]
    pub fn candidates_for_fact(&self, key: &str) -> Vec<Rule> {
        self.candidates(|trigger| match trigger {
            Trigger::Fact { pattern } => fact_key_matches(pattern, key),
            _ => false,
        })
    }

    /// Active rules whose timer trigger matches the name, in dispatch order.
    #[must_use]
    pub fn candidates_for_timer(&self, name: &str) -> Vec<Rule> {
        self.candidates(|trigger| match trigger {
            Trigger::Timer { name: pattern } => topic_matches(pattern, name),
            _ => false,
        })
    }

    /// The temporal rule for a completion, when still active.
    #[must_use]
    pub fn candidate_for_temporal(&self, rule_id: &str) -> Option<Rule> {
        self.rules
            .get(rule_id)
            .filter(|rule| self.is_active(rule) && matches!(rule.trigger, Trigger::Temporal { .. }))
            .cloned()
    }
}

pub(crate) fn dispatch_order(a: &Rule, b: &Rule) -> Ordering {
    b.priority
        .total_cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::Action;
    use crate::value::Value;

    fn rule(id: &str, priority: f64, topic: &str) -> Rule {
        Rule::builder(id)
            .priority(priority)
            .on_event(topic)
            .action(Action::SetFact {
                key: "k".to_string(),
                value: Value::Bool(true),
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_insert_duplicate_rejected() {
        let mut index = RuleIndex::new();
        index.insert(rule("r1", 0.0, "a")).unwrap();
        let err = index.insert(rule("r1", 0.0, "a")).unwrap_err();
        assert_eq!(err.kind(), "duplicate_id");
    }

    #[test]
    fn test_candidates_sorted_by_priority_then_created_at() {
        let mut index = RuleIndex::new();
        let mut low = rule("low", 1.0, "order.*");
        let mut high = rule("high", 50.0, "order.*");
        let mut tie_old = rule("tie-old", 10.0, "order.*");
        let mut tie_new = rule("tie-new", 10.0, "order.*");

        let t0 = chrono::Utc::now();
        low.created_at = t0;
        high.created_at = t0;
        tie_old.created_at = t0 - chrono::Duration::seconds(60);
        tie_new.created_at = t0;

        for r in [low, high, tie_new, tie_old] {
            index.insert(r).unwrap();
        }

        let ids: Vec<String> = index
            .candidates_for_event("order.created")
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["high", "tie-old", "tie-new", "low"]);
    }

    #[test]
    fn test_disabled_rule_is_not_a_candidate() {
        let mut index = RuleIndex::new();
        let mut r = rule("r1", 0.0, "a");
        r.enabled = false;
        index.insert(r).unwrap();
        assert!(index.candidates_for_event("a").is_empty());
    }

    #[test]
    fn test_disabled_group_gates_rules() {
        let mut index = RuleIndex::new();
        let mut group = RuleGroup::new("g1", "Group");
        group.enabled = false;
        index.insert_group(group).unwrap();

        let mut r = rule("r1", 0.0, "a");
        r.group = Some("g1".to_string());
        index.insert(r).unwrap();
        assert!(index.candidates_for_event("a").is_empty());

        index.get_group_mut("g1").unwrap().enabled = true;
        assert_eq!(index.candidates_for_event("a").len(), 1);
    }

    #[test]
    fn test_stale_group_reference_is_ungrouped() {
        let mut index = RuleIndex::new();
        let mut r = rule("r1", 0.0, "a");
        r.group = Some("ghost".to_string());
        index.insert(r).unwrap();
        assert_eq!(index.candidates_for_event("a").len(), 1);
    }

    #[test]
    fn test_remove_group_ungates_rules() {
        let mut index = RuleIndex::new();
        let mut group = RuleGroup::new("g1", "Group");
        group.enabled = false;
        index.insert_group(group).unwrap();

        let mut r = rule("r1", 0.0, "a");
        r.group = Some("g1".to_string());
        index.insert(r).unwrap();
        assert!(index.candidates_for_event("a").is_empty());

        index.remove_group("g1").unwrap();
        assert_eq!(index.candidates_for_event("a").len(), 1);
        assert!(index.get("r1").unwrap().group.is_none());
    }

    #[test]
    fn test_trigger_kind_segregation() {
        let mut index = RuleIndex::new();
        index.insert(rule("ev", 0.0, "order.*")).unwrap();

        let fact_rule = Rule::builder("fa")
            .on_fact("user:*:age")
            .action(Action::DeleteFact {
                key: "k".to_string(),
            })
            .build()
            .unwrap();
        index.insert(fact_rule).unwrap();

        let timer_rule = Rule::builder("ti")
            .on_timer("heartbeat.*")
            .action(Action::DeleteFact {
                key: "k".to_string(),
            })
            .build()
            .unwrap();
        index.insert(timer_rule).unwrap();

        assert_eq!(index.candidates_for_event("order.created").len(), 1);
        assert_eq!(index.candidates_for_fact("user:1:age").len(), 1);
        assert_eq!(index.candidates_for_timer("heartbeat.main").len(), 1);
        assert!(index.candidates_for_event("user:1:age").is_empty());
    }
}
