//! Backward chaining over the rule set.
//!
//! `query(goal)` answers "is this fact/event achievable, and through which
//! rules" without executing anything. The search is depth-bounded and tracks
//! `(rule id, goal)` pairs along the current path so mutually-producing rules
//! cannot loop.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::condition::apply_operator;
use crate::fact::FactStore;
use crate::index::RuleIndex;
use crate::pattern::{fact_key_matches, topic_matches};
use crate::rule::{Action, ConditionSource, Operator, Rule, Trigger};
use crate::value::{contains_template, Value};

/// A backward-chaining goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Goal {
    /// Prove a fact exists (optionally comparing its value).
    Fact {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operator: Option<Operator>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },

    /// Prove an event topic can be produced by rules.
    Event {
        topic: String,
    },
}

impl Goal {
    fn describe(&self) -> String {
        match self {
            Self::Fact { key, .. } => format!("fact {key}"),
            Self::Event { topic } => format!("event {topic}"),
        }
    }
}

/// A node in the proof tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProofNode {
    /// The goal fact is present in the store.
    FactExists {
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        satisfied: bool,
    },

    /// A rule can produce the goal.
    Rule {
        rule_id: String,
        /// Short trigger description.
        trigger: String,
        trigger_achievable: bool,
        /// Sub-proofs for fact-sourced conditions.
        conditions: Vec<ProofNode>,
        achievable: bool,
    },

    /// No path to the goal.
    Unachievable {
        goal: String,
        reason: String,
    },
}

impl ProofNode {
    /// Whether this node proves its goal.
    #[must_use]
    pub fn achievable(&self) -> bool {
        match self {
            Self::FactExists { satisfied, .. } => *satisfied,
            Self::Rule { achievable, .. } => *achievable,
            Self::Unachievable { .. } => false,
        }
    }
}

/// Result of a `query` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub root: ProofNode,
    pub achievable: bool,
    /// True when the depth bound pruned the search.
    pub max_depth_reached: bool,
}

struct Prover<'a> {
    index: &'a RuleIndex,
    facts: &'a FactStore,
    max_depth: usize,
    max_depth_reached: bool,
}

/// Runs a backward-chaining query. Read-only: no actions execute.
#[must_use]
pub(crate) fn prove(
    index: &RuleIndex,
    facts: &FactStore,
    goal: &Goal,
    max_depth: usize,
) -> QueryOutcome {
    let mut prover = Prover {
        index,
        facts,
        max_depth: max_depth.max(1),
        max_depth_reached: false,
    };
    let mut path = HashSet::new();
    let root = prover.prove_goal(goal, 0, &mut path);

    QueryOutcome {
        achievable: root.achievable(),
        max_depth_reached: prover.max_depth_reached,
        root,
    }
}

impl Prover<'_> {
    fn prove_goal(
        &mut self,
        goal: &Goal,
        depth: usize,
        path: &mut HashSet<(String, String)>,
    ) -> ProofNode {
        if depth >= self.max_depth {
            self.max_depth_reached = true;
            return ProofNode::Unachievable {
                goal: goal.describe(),
                reason: "max depth reached".to_string(),
            };
        }

        match goal {
            Goal::Fact {
                key,
                operator,
                value,
            } => {
                if let Some(current) = self.facts.get(key) {
                    let satisfied = match (operator, value) {
                        (Some(op), Some(expected)) => {
                            apply_operator(*op, current, expected).unwrap_or(false)
                        }
                        (None, Some(expected)) => current == expected,
                        _ => true,
                    };
                    if satisfied {
                        return ProofNode::FactExists {
                            key: key.clone(),
                            value: Some(current.clone()),
                            satisfied: true,
                        };
                    }
                }
                self.prove_via_producers(goal, depth, path, |rule| {
                    produces_fact(&rule.actions, key)
                })
            }

            Goal::Event { topic } => self.prove_via_producers(goal, depth, path, |rule| {
                produces_event(&rule.actions, topic)
            }),
        }
    }

    fn prove_via_producers<F>(
        &mut self,
        goal: &Goal,
        depth: usize,
        path: &mut HashSet<(String, String)>,
        produces: F,
    ) -> ProofNode
    where
        F: Fn(&Rule) -> bool,
    {
        let goal_key = goal.describe();
        let mut producers: Vec<Rule> = self
            .index
            .all()
            .into_iter()
            .filter(|rule| self.index.is_active(rule) && produces(rule))
            .collect();
        producers.sort_by(|a, b| b.priority.total_cmp(&a.priority).then(a.id.cmp(&b.id)));

        if producers.is_empty() {
            return ProofNode::Unachievable {
                goal: goal_key,
                reason: "no rule produces this goal".to_string(),
            };
        }

        let mut first_node = None;
        for rule in producers {
            let path_key = (rule.id.clone(), goal_key.clone());
            if path.contains(&path_key) {
                continue;
            }
            path.insert(path_key.clone());
            let node = self.prove_rule(&rule, depth, path);
            path.remove(&path_key);

            if node.achievable() {
                return node;
            }
            first_node.get_or_insert(node);
        }

        first_node.unwrap_or(ProofNode::Unachievable {
            goal: goal_key,
            reason: "all producer paths are cyclic".to_string(),
        })
    }

    fn prove_rule(
        &mut self,
        rule: &Rule,
        depth: usize,
        path: &mut HashSet<(String, String)>,
    ) -> ProofNode {
        let (trigger_desc, trigger_achievable) = match &rule.trigger {
            // Externally suppliable triggers are axiomatically achievable.
            Trigger::Event { topic } => (format!("event {topic}"), true),
            Trigger::Timer { name } => (format!("timer {name}"), true),
            Trigger::Temporal { .. } => ("temporal".to_string(), true),
            // A fact trigger needs the fact to exist or be producible.
            Trigger::Fact { pattern } => {
                let achievable = !self.facts.query(pattern).is_empty()
                    || self
                        .prove_goal(
                            &Goal::Fact {
                                key: pattern.clone(),
                                operator: None,
                                value: None,
                            },
                            depth + 1,
                            path,
                        )
                        .achievable();
                (format!("fact {pattern}"), achievable)
            }
        };

        // Fact-sourced conditions become subgoals; everything else depends
        // only on trigger input and is not refutable statically.
        let mut conditions = Vec::new();
        let mut conditions_achievable = true;
        for condition in &rule.conditions {
            if let ConditionSource::Fact { pattern } = &condition.source {
                let node = self.prove_goal(
                    &Goal::Fact {
                        key: pattern.clone(),
                        operator: Some(condition.operator),
                        value: Some(condition.value.clone()),
                    },
                    depth + 1,
                    path,
                );
                conditions_achievable &= node.achievable();
                conditions.push(node);
            }
        }

        ProofNode::Rule {
            rule_id: rule.id.clone(),
            trigger: trigger_desc,
            trigger_achievable,
            achievable: trigger_achievable && conditions_achievable,
            conditions,
        }
    }
}

fn produces_fact(actions: &[Action], goal_key: &str) -> bool {
    actions.iter().any(|action| match action {
        Action::SetFact { key, .. } => {
            // An interpolated key may produce any concrete key; a literal
            // key may itself be a glob target of the goal.
            contains_template(key) || key == goal_key || fact_key_matches(goal_key, key)
        }
        Action::Conditional {
            then, otherwise, ..
        } => {
            produces_fact(then, goal_key)
                || otherwise
                    .as_ref()
                    .is_some_and(|actions| produces_fact(actions, goal_key))
        }
        _ => false,
    })
}

fn produces_event(actions: &[Action], goal_topic: &str) -> bool {
    actions.iter().any(|action| match action {
        Action::EmitEvent { topic, .. } => {
            contains_template(topic) || topic == goal_topic || topic_matches(goal_topic, topic)
        }
        Action::Conditional {
            then, otherwise, ..
        } => {
            produces_event(then, goal_topic)
                || otherwise
                    .as_ref()
                    .is_some_and(|actions| produces_event(actions, goal_topic))
        }
        _ => false,
    })
}
