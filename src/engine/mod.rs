//! The engine: lifecycle, public API handle and dispatch loop.
//!
//! [`Engine::start`] spawns a dedicated dispatch thread that owns every piece
//! of mutable state (facts, rules, timers, temporal partitions, traces). The
//! public handle talks to it over one bounded command channel, so all
//! mutation is serialized and every rule fire observes a consistent world.
//! Producers block when the queue is full rather than dropping work.

pub mod chaining;
pub mod stats;
pub mod trace;

mod core;

pub use chaining::{Goal, ProofNode, QueryOutcome};
pub use stats::{RuleCounters, StatsSnapshot};
pub use trace::{TraceEntry, TraceOutcome};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::audit::AuditEntry;
use crate::bus::{EventHandler, EventStream, SubscriptionId};
use crate::error::{ExecutionError, VerdictError, VerdictResult};
use crate::event::Event;
use crate::fact::Fact;
use crate::rule::{Rule, RuleGroup};
use crate::service::Service;
use crate::storage::StorageAdapter;
use crate::time::{Clock, ManualClock, SystemClock};
use crate::timer::{Timer, TimerConfig};
use crate::value::{Map, Value};
use crate::versioning::VersionEntry;

/// Time source selection for an engine.
#[derive(Clone, Default)]
pub enum EngineClock {
    /// Wall-clock time.
    #[default]
    System,
    /// Manually driven time; enables [`Engine::advance_clock`].
    Manual(Arc<ManualClock>),
}

impl EngineClock {
    fn as_clock(&self) -> Arc<dyn Clock> {
        match self {
            Self::System => Arc::new(SystemClock),
            Self::Manual(clock) => Arc::clone(clock) as Arc<dyn Clock>,
        }
    }

    pub(crate) fn manual(&self) -> Option<Arc<ManualClock>> {
        match self {
            Self::System => None,
            Self::Manual(clock) => Some(Arc::clone(clock)),
        }
    }
}

/// Engine configuration.
#[derive(Clone)]
pub struct EngineConfig {
    /// Command/trigger queue bound; producers block when full.
    pub queue_capacity: usize,
    /// Lookup pool size.
    pub lookup_workers: usize,
    /// Per-request lookup and service-call timeout.
    pub lookup_timeout: Duration,
    /// Interval between proactive lookup-cache sweeps.
    pub cache_sweep_interval: Duration,
    /// Interval between temporal partition GC sweeps.
    pub temporal_sweep_interval: Duration,
    /// Write-behind flush interval; `None` flushes only on stop.
    pub flush_interval: Option<Duration>,
    /// Trace ring capacity.
    pub trace_capacity: usize,
    /// Audit ring capacity.
    pub audit_capacity: usize,
    /// Ceiling on synthesized trigger depth; deeper emissions are dropped.
    pub max_trigger_depth: u16,
    /// Depth bound for backward-chaining queries.
    pub max_query_depth: usize,
    /// Default buffer capacity for [`Engine::subscribe_stream`].
    pub stream_capacity: usize,
    /// Identity recorded in persisted payload metadata.
    pub server_id: String,
    /// Time source.
    pub clock: EngineClock,
    /// Optional write-behind persistence.
    pub storage: Option<Arc<dyn StorageAdapter>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            lookup_workers: 4,
            lookup_timeout: Duration::from_secs(5),
            cache_sweep_interval: Duration::from_secs(30),
            temporal_sweep_interval: Duration::from_secs(30),
            flush_interval: None,
            trace_capacity: 1024,
            audit_capacity: 4096,
            max_trigger_depth: 16,
            max_query_depth: 8,
            stream_capacity: 1024,
            server_id: "verdict".to_string(),
            clock: EngineClock::default(),
            storage: None,
        }
    }
}

pub(crate) enum Command {
    Emit {
        event: Event,
        depth: u16,
    },
    SetFact {
        key: String,
        value: Value,
        reply: Sender<VerdictResult<Fact>>,
    },
    DeleteFact {
        key: String,
        reply: Sender<bool>,
    },
    GetFact {
        key: String,
        reply: Sender<Option<Value>>,
    },
    GetFactFull {
        key: String,
        reply: Sender<Option<Fact>>,
    },
    QueryFacts {
        pattern: String,
        reply: Sender<Vec<Fact>>,
    },
    RegisterRule {
        rule: Rule,
        reply: Sender<VerdictResult<Rule>>,
    },
    UpdateRule {
        rule: Rule,
        reply: Sender<VerdictResult<Rule>>,
    },
    UnregisterRule {
        id: String,
        reply: Sender<VerdictResult<Rule>>,
    },
    SetRuleEnabled {
        id: String,
        enabled: bool,
        reply: Sender<VerdictResult<Rule>>,
    },
    GetRule {
        id: String,
        reply: Sender<VerdictResult<Rule>>,
    },
    GetRules {
        reply: Sender<Vec<Rule>>,
    },
    RegisterGroup {
        group: RuleGroup,
        reply: Sender<VerdictResult<RuleGroup>>,
    },
    UpdateGroup {
        group: RuleGroup,
        reply: Sender<VerdictResult<RuleGroup>>,
    },
    UnregisterGroup {
        id: String,
        reply: Sender<VerdictResult<RuleGroup>>,
    },
    SetGroupEnabled {
        id: String,
        enabled: bool,
        reply: Sender<VerdictResult<RuleGroup>>,
    },
    GetGroup {
        id: String,
        reply: Sender<VerdictResult<RuleGroup>>,
    },
    GetGroups {
        reply: Sender<Vec<RuleGroup>>,
    },
    SetTimer {
        config: TimerConfig,
        reply: Sender<VerdictResult<Timer>>,
    },
    CancelTimer {
        name: String,
        reply: Sender<bool>,
    },
    GetTimers {
        reply: Sender<Vec<Timer>>,
    },
    Subscribe {
        pattern: String,
        handler: Arc<dyn EventHandler>,
        reply: Sender<SubscriptionId>,
    },
    SubscribeStream {
        pattern: String,
        capacity: usize,
        reply: Sender<EventStream>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: Sender<bool>,
    },
    RegisterService {
        name: String,
        service: Arc<dyn Service>,
        reply: Sender<()>,
    },
    Query {
        goal: Goal,
        reply: Sender<QueryOutcome>,
    },
    GetStats {
        reply: Sender<StatsSnapshot>,
    },
    SetTracing {
        enabled: bool,
        reply: Sender<()>,
    },
    GetTrace {
        reply: Sender<Vec<TraceEntry>>,
    },
    GetAudit {
        category: Option<String>,
        reply: Sender<Vec<AuditEntry>>,
    },
    VersionHistory {
        rule_id: String,
        reply: Sender<VerdictResult<Vec<VersionEntry>>>,
    },
    RollbackRule {
        rule_id: String,
        version: u64,
        reply: Sender<VerdictResult<Rule>>,
    },
    AdvanceClock {
        by: Duration,
        reply: Sender<VerdictResult<()>>,
    },
    Flush {
        reply: Sender<()>,
    },
    Stop {
        reply: Sender<()>,
    },
}

/// Handle to a running engine. Cheap to clone; all clones share the engine.
#[derive(Clone)]
pub struct Engine {
    cmd_tx: Sender<Command>,
    clock: Arc<dyn Clock>,
    stopped: Arc<AtomicBool>,
    dispatch_thread: ThreadId,
    reentrant: Arc<Mutex<VecDeque<(Event, u16)>>>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
    stream_capacity: usize,
}

impl Engine {
    /// Starts an engine with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`Engine::start`].
    pub fn start_default() -> VerdictResult<Self> {
        Self::start(EngineConfig::default())
    }

    /// Starts an engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Fails when the dispatch thread cannot be spawned. Storage load
    /// failures are logged, not fatal: the engine starts on empty state.
    pub fn start(config: EngineConfig) -> VerdictResult<Self> {
        let clock = config.clock.as_clock();
        let stopped = Arc::new(AtomicBool::new(false));
        let reentrant: Arc<Mutex<VecDeque<(Event, u16)>>> = Arc::new(Mutex::new(VecDeque::new()));
        let stream_capacity = config.stream_capacity;

        let (cmd_tx, cmd_rx): (Sender<Command>, Receiver<Command>) =
            bounded(config.queue_capacity.max(1));

        let core = core::EngineCore::new(config, Arc::clone(&reentrant));
        let handle = thread::Builder::new()
            .name("verdict-dispatch".to_string())
            .spawn(move || core.run(&cmd_rx))
            .map_err(|e| VerdictError::internal(format!("failed to spawn dispatcher: {e}")))?;
        let dispatch_thread = handle.thread().id();

        Ok(Self {
            cmd_tx,
            clock,
            stopped,
            dispatch_thread,
            reentrant,
            join: Arc::new(Mutex::new(Some(handle))),
            stream_capacity,
        })
    }

    fn ensure_running(&self) -> VerdictResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(VerdictError::Execution(ExecutionError::EngineStopped));
        }
        Ok(())
    }

    fn request<T>(
        &self,
        operation: &'static str,
        make: impl FnOnce(Sender<T>) -> Command,
    ) -> VerdictResult<T> {
        self.ensure_running()?;
        if thread::current().id() == self.dispatch_thread {
            // Waiting for a reply here would deadlock: the dispatcher is the
            // thread running this handler.
            return Err(VerdictError::Execution(ExecutionError::ReentrantCall {
                operation: operation.to_string(),
            }));
        }

        let (reply_tx, reply_rx) = bounded::<T>(1);
        self.cmd_tx.send(make(reply_tx)).map_err(|_| {
            VerdictError::Execution(ExecutionError::Disconnected {
                path: operation.to_string(),
            })
        })?;
        reply_rx.recv().map_err(|_| {
            if self.stopped.load(Ordering::Acquire) {
                VerdictError::Execution(ExecutionError::EngineStopped)
            } else {
                VerdictError::Execution(ExecutionError::Disconnected {
                    path: operation.to_string(),
                })
            }
        })
    }

    fn emit_event(&self, event: Event) -> VerdictResult<Event> {
        self.ensure_running()?;

        if thread::current().id() == self.dispatch_thread {
            // Re-entrant emission from a handler: append for the dispatch
            // loop to drain onto the queue tail instead of deadlocking.
            if let Ok(mut queue) = self.reentrant.lock() {
                queue.push_back((event.clone(), 0));
            }
            return Ok(event);
        }

        self.cmd_tx
            .send(Command::Emit {
                event: event.clone(),
                depth: 0,
            })
            .map_err(|_| {
                VerdictError::Execution(ExecutionError::Disconnected {
                    path: "emit".to_string(),
                })
            })?;
        Ok(event)
    }

    /// Publishes an event. Blocks when the trigger queue is full.
    ///
    /// # Errors
    ///
    /// Returns `EngineStopped` after [`Engine::stop`].
    pub fn emit(&self, topic: impl Into<String>, data: Map) -> VerdictResult<Event> {
        self.emit_event(Event::new(topic, data, self.clock.now(), "api"))
    }

    /// Publishes an event carrying correlation metadata.
    ///
    /// # Errors
    ///
    /// Returns `EngineStopped` after [`Engine::stop`].
    pub fn emit_correlated(
        &self,
        topic: impl Into<String>,
        data: Map,
        correlation_id: impl Into<String>,
        causation_id: Option<String>,
    ) -> VerdictResult<Event> {
        let event =
            Event::new(topic, data, self.clock.now(), "api").correlated(correlation_id, causation_id);
        self.emit_event(event)
    }

    /// Writes a fact, bumping its version.
    pub fn set_fact(&self, key: impl Into<String>, value: Value) -> VerdictResult<Fact> {
        self.request("set_fact", |reply| Command::SetFact {
            key: key.into(),
            value,
            reply,
        })?
    }

    /// Deletes a fact. Returns whether it existed.
    pub fn delete_fact(&self, key: impl Into<String>) -> VerdictResult<bool> {
        self.request("delete_fact", |reply| Command::DeleteFact {
            key: key.into(),
            reply,
        })
    }

    /// Current value of a fact.
    pub fn get_fact(&self, key: impl Into<String>) -> VerdictResult<Option<Value>> {
        self.request("get_fact", |reply| Command::GetFact {
            key: key.into(),
            reply,
        })
    }

    /// Full fact snapshot.
    pub fn get_fact_full(&self, key: impl Into<String>) -> VerdictResult<Option<Fact>> {
        self.request("get_fact_full", |reply| Command::GetFactFull {
            key: key.into(),
            reply,
        })
    }

    /// Facts whose keys match a colon-glob pattern.
    pub fn query_facts(&self, pattern: impl Into<String>) -> VerdictResult<Vec<Fact>> {
        self.request("query_facts", |reply| Command::QueryFacts {
            pattern: pattern.into(),
            reply,
        })
    }

    /// Registers a rule; its version becomes 1.
    pub fn register_rule(&self, rule: Rule) -> VerdictResult<Rule> {
        self.request("register_rule", |reply| Command::RegisterRule { rule, reply })?
    }

    /// Updates a rule in place, bumping its version.
    pub fn update_rule(&self, rule: Rule) -> VerdictResult<Rule> {
        self.request("update_rule", |reply| Command::UpdateRule { rule, reply })?
    }

    /// Removes a rule, returning its final state.
    pub fn unregister_rule(&self, id: impl Into<String>) -> VerdictResult<Rule> {
        self.request("unregister_rule", |reply| Command::UnregisterRule {
            id: id.into(),
            reply,
        })?
    }

    /// Enables a rule. Idempotent.
    pub fn enable_rule(&self, id: impl Into<String>) -> VerdictResult<Rule> {
        self.request("enable_rule", |reply| Command::SetRuleEnabled {
            id: id.into(),
            enabled: true,
            reply,
        })?
    }

    /// Disables a rule. Idempotent.
    pub fn disable_rule(&self, id: impl Into<String>) -> VerdictResult<Rule> {
        self.request("disable_rule", |reply| Command::SetRuleEnabled {
            id: id.into(),
            enabled: false,
            reply,
        })?
    }

    /// Fetches a rule by id.
    pub fn get_rule(&self, id: impl Into<String>) -> VerdictResult<Rule> {
        self.request("get_rule", |reply| Command::GetRule {
            id: id.into(),
            reply,
        })?
    }

    /// All rules, ordered by id.
    pub fn get_rules(&self) -> VerdictResult<Vec<Rule>> {
        self.request("get_rules", |reply| Command::GetRules { reply })
    }

    /// Registers a rule group.
    pub fn register_group(&self, group: RuleGroup) -> VerdictResult<RuleGroup> {
        self.request("register_group", |reply| Command::RegisterGroup { group, reply })?
    }

    /// Updates a rule group.
    pub fn update_group(&self, group: RuleGroup) -> VerdictResult<RuleGroup> {
        self.request("update_group", |reply| Command::UpdateGroup { group, reply })?
    }

    /// Removes a group, ungating its rules.
    pub fn unregister_group(&self, id: impl Into<String>) -> VerdictResult<RuleGroup> {
        self.request("unregister_group", |reply| Command::UnregisterGroup {
            id: id.into(),
            reply,
        })?
    }

    /// Enables a group. Idempotent.
    pub fn enable_group(&self, id: impl Into<String>) -> VerdictResult<RuleGroup> {
        self.request("enable_group", |reply| Command::SetGroupEnabled {
            id: id.into(),
            enabled: true,
            reply,
        })?
    }

    /// Disables a group; its rules stop firing.
    pub fn disable_group(&self, id: impl Into<String>) -> VerdictResult<RuleGroup> {
        self.request("disable_group", |reply| Command::SetGroupEnabled {
            id: id.into(),
            enabled: false,
            reply,
        })?
    }

    /// Fetches a group by id.
    pub fn get_group(&self, id: impl Into<String>) -> VerdictResult<RuleGroup> {
        self.request("get_group", |reply| Command::GetGroup {
            id: id.into(),
            reply,
        })?
    }

    /// All groups, ordered by id.
    pub fn get_groups(&self) -> VerdictResult<Vec<RuleGroup>> {
        self.request("get_groups", |reply| Command::GetGroups { reply })
    }

    /// Arms (or replaces) a timer.
    pub fn set_timer(&self, config: TimerConfig) -> VerdictResult<Timer> {
        self.request("set_timer", |reply| Command::SetTimer { config, reply })?
    }

    /// Cancels a timer. Returns whether one existed.
    pub fn cancel_timer(&self, name: impl Into<String>) -> VerdictResult<bool> {
        self.request("cancel_timer", |reply| Command::CancelTimer {
            name: name.into(),
            reply,
        })
    }

    /// All armed timers, ordered by name.
    pub fn get_timers(&self) -> VerdictResult<Vec<Timer>> {
        self.request("get_timers", |reply| Command::GetTimers { reply })
    }

    /// Subscribes a handler to a topic glob.
    pub fn subscribe(
        &self,
        pattern: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> VerdictResult<SubscriptionId> {
        self.request("subscribe", |reply| Command::Subscribe {
            pattern: pattern.into(),
            handler,
            reply,
        })
    }

    /// Subscribes a bounded stream to a topic glob.
    pub fn subscribe_stream(&self, pattern: impl Into<String>) -> VerdictResult<EventStream> {
        let capacity = self.stream_capacity;
        self.request("subscribe_stream", |reply| Command::SubscribeStream {
            pattern: pattern.into(),
            capacity,
            reply,
        })
    }

    /// Removes a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> VerdictResult<bool> {
        self.request("unsubscribe", |reply| Command::Unsubscribe { id, reply })
    }

    /// Registers an external service for lookups and `call_service`.
    pub fn register_service(
        &self,
        name: impl Into<String>,
        service: Arc<dyn Service>,
    ) -> VerdictResult<()> {
        self.request("register_service", |reply| Command::RegisterService {
            name: name.into(),
            service,
            reply,
        })
    }

    /// Backward-chaining query; read-only.
    pub fn query(&self, goal: Goal) -> VerdictResult<QueryOutcome> {
        self.request("query", |reply| Command::Query { goal, reply })
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> VerdictResult<StatsSnapshot> {
        self.request("stats", |reply| Command::GetStats { reply })
    }

    /// Turns the trace collector on.
    pub fn enable_tracing(&self) -> VerdictResult<()> {
        self.request("enable_tracing", |reply| Command::SetTracing {
            enabled: true,
            reply,
        })
    }

    /// Turns the trace collector off.
    pub fn disable_tracing(&self) -> VerdictResult<()> {
        self.request("disable_tracing", |reply| Command::SetTracing {
            enabled: false,
            reply,
        })
    }

    /// Buffered trace entries, oldest first.
    pub fn trace_entries(&self) -> VerdictResult<Vec<TraceEntry>> {
        self.request("trace_entries", |reply| Command::GetTrace { reply })
    }

    /// Retained audit entries, optionally filtered by category.
    pub fn audit_entries(&self, category: Option<&str>) -> VerdictResult<Vec<AuditEntry>> {
        let category = category.map(str::to_string);
        self.request("audit_entries", |reply| Command::GetAudit { category, reply })
    }

    /// Version history for a rule, oldest first.
    pub fn version_history(&self, rule_id: impl Into<String>) -> VerdictResult<Vec<VersionEntry>> {
        self.request("version_history", |reply| Command::VersionHistory {
            rule_id: rule_id.into(),
            reply,
        })?
    }

    /// Re-applies a prior version of a rule as a new update.
    pub fn rollback_rule(&self, rule_id: impl Into<String>, version: u64) -> VerdictResult<Rule> {
        self.request("rollback_rule", |reply| Command::RollbackRule {
            rule_id: rule_id.into(),
            version,
            reply,
        })?
    }

    /// Advances a manual clock, firing due timers, absence deadlines and
    /// sweeps. Errors on engines running the system clock.
    pub fn advance_clock(&self, by: Duration) -> VerdictResult<()> {
        self.request("advance_clock", |reply| Command::AdvanceClock { by, reply })?
    }

    /// Forces a write-behind flush now.
    pub fn flush(&self) -> VerdictResult<()> {
        self.request("flush", |reply| Command::Flush { reply })
    }

    /// Stops the engine: cancels timers, flushes sinks, rejects further
    /// mutation. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let (reply_tx, reply_rx) = bounded::<()>(1);
        if self.cmd_tx.send(Command::Stop { reply: reply_tx }).is_ok() {
            let _ = reply_rx.recv_timeout(Duration::from_secs(10));
        }

        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }

    /// Whether [`Engine::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
