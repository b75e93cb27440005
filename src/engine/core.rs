//! The dispatch loop and trigger processing.
//!
//! One thread owns all engine state. Work arrives as commands on a bounded
//! channel; triggers synthesized during processing (action emissions, fact
//! changes, temporal completions, timer fires) go onto an internal pending
//! queue consumed breadth-first, so dispatch never recurses and a firing
//! rule always observes the pre-emission world for its own trigger.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog};
use crate::bus::SubscriberRegistry;
use crate::condition::evaluate_all;
use crate::context::EvalContext;
use crate::error::{ExecutionError, VerdictError, VerdictResult};
use crate::event::{topics, Event};
use crate::fact::{Fact, FactStore};
use crate::index::{dispatch_order, RuleIndex};
use crate::lookup::{LookupResolver, ResolvedLookup};
use crate::rule::{Action, LogLevel, Rule, RuleGroup, Trigger};
use crate::service::ServiceRegistry;
use crate::temporal::{Completion, TemporalEngine};
use crate::time::{Clock, ManualClock};
use crate::timer::{OnExpire, TimerConfig, TimerWheel};
use crate::value::{Map, Value};
use crate::versioning::{ChangeType, VersionStore};

use super::chaining::{self, Goal};
use super::stats::EngineStats;
use super::trace::{TraceCollector, TraceEntry, TraceOutcome};
use super::{Command, EngineConfig};

enum Route {
    /// A published event.
    Event,
    /// A fact mutation; the event is the synthetic fact-change event.
    FactChange { key: String },
    /// A timer expiry; the event is the `on_expire` emission.
    Timer { name: String },
    /// A temporal completion for one rule partition.
    Temporal {
        rule_id: String,
        captures: Map,
        aggregate: Option<f64>,
        group_key: String,
    },
}

struct PendingTrigger {
    route: Route,
    event: Event,
    depth: u16,
}

/// Per-fire owned context: the trigger event plus resolved lookups and the
/// scratch map exposed as `context.*`.
struct FireCtx {
    event: Event,
    lookups: Map,
    scratch: Map,
    captures: Option<Map>,
    aggregate: Option<f64>,
    depth: u16,
}

impl FireCtx {
    fn ctx<'a>(&'a self, facts: &'a FactStore) -> EvalContext<'a> {
        let mut ctx = EvalContext::new(Some(&self.event), facts, &self.lookups, &self.scratch);
        if let Some(captures) = &self.captures {
            ctx = ctx.with_captures(captures);
        }
        if let Some(value) = self.aggregate {
            ctx = ctx.with_aggregate(value);
        }
        ctx
    }
}

pub(crate) struct EngineCore {
    cfg: EngineConfig,
    clock: Arc<dyn Clock>,
    manual_clock: Option<Arc<ManualClock>>,
    facts: FactStore,
    index: RuleIndex,
    subscribers: SubscriberRegistry,
    timers: TimerWheel,
    temporal: TemporalEngine,
    resolver: LookupResolver,
    versions: VersionStore,
    audit: AuditLog,
    stats: EngineStats,
    trace: TraceCollector,
    started_at: DateTime<Utc>,
    pending: VecDeque<PendingTrigger>,
    reentrant: Arc<Mutex<VecDeque<(Event, u16)>>>,
    next_cache_sweep: DateTime<Utc>,
    next_temporal_sweep: DateTime<Utc>,
    next_flush: Option<DateTime<Utc>>,
}

impl EngineCore {
    pub(crate) fn new(cfg: EngineConfig, reentrant: Arc<Mutex<VecDeque<(Event, u16)>>>) -> Self {
        let clock = cfg.clock.as_clock();
        let manual_clock = cfg.clock.manual();
        let services = Arc::new(ServiceRegistry::new());
        let resolver = LookupResolver::new(
            Arc::clone(&services),
            Arc::clone(&clock),
            cfg.lookup_workers,
            cfg.lookup_timeout,
        );
        let now = clock.now();

        Self {
            facts: FactStore::new(),
            index: RuleIndex::new(),
            subscribers: SubscriberRegistry::new(),
            timers: TimerWheel::new(),
            temporal: TemporalEngine::new(),
            resolver,
            versions: VersionStore::new(),
            audit: AuditLog::new(cfg.audit_capacity),
            stats: EngineStats::new(),
            trace: TraceCollector::new(cfg.trace_capacity),
            started_at: now,
            pending: VecDeque::new(),
            reentrant,
            next_cache_sweep: now + chrono::Duration::from_std(cfg.cache_sweep_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            next_temporal_sweep: now + chrono::Duration::from_std(cfg.temporal_sweep_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            next_flush: cfg.flush_interval.and_then(|interval| {
                chrono::Duration::from_std(interval).ok().map(|d| now + d)
            }),
            manual_clock,
            clock,
            cfg,
        }
    }

    fn services(&self) -> Arc<ServiceRegistry> {
        self.resolver.registry()
    }

    pub(crate) fn run(mut self, cmd_rx: &Receiver<Command>) {
        self.load_persisted();
        info!(server_id = %self.cfg.server_id, "engine started");

        let mut payload = Map::new();
        payload.insert("server_id".to_string(), Value::from(self.cfg.server_id.clone()));
        self.enqueue_internal(topics::ENGINE_STARTED, payload, 0);

        loop {
            self.drain_reentrant(0);
            while let Some(trigger) = self.pending.pop_front() {
                let depth = trigger.depth;
                self.process_trigger(trigger);
                self.drain_reentrant(depth.saturating_add(1));
            }

            self.run_due_work();
            if !self.pending.is_empty() {
                continue;
            }

            match cmd_rx.recv_timeout(self.idle_timeout()) {
                Ok(Command::Stop { reply }) => {
                    self.shutdown();
                    let _ = reply.send(());
                    break;
                }
                Ok(command) => self.handle_command(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Every handle is gone; tear down gracefully.
                    self.shutdown();
                    break;
                }
            }
        }
    }

    // ---------------------------------------------------------------- loop

    fn drain_reentrant(&mut self, depth_floor: u16) {
        let drained: Vec<(Event, u16)> = match self.reentrant.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => return,
        };
        for (event, depth) in drained {
            self.enqueue(PendingTrigger {
                route: Route::Event,
                event,
                depth: depth.max(depth_floor),
            });
        }
    }

    fn idle_timeout(&mut self) -> Duration {
        // Virtual-time engines are driven by `advance_clock`; real deadlines
        // mean nothing to them.
        if self.manual_clock.is_some() {
            return Duration::from_millis(200);
        }

        let now = self.clock.now();
        let mut next: DateTime<Utc> = now + chrono::Duration::seconds(60);

        if let Some(deadline) = self.timers.next_deadline() {
            next = next.min(deadline);
        }
        if let Some(deadline) = self.temporal.next_deadline() {
            next = next.min(deadline);
        }
        next = next.min(self.next_cache_sweep).min(self.next_temporal_sweep);
        if let Some(flush) = self.next_flush {
            next = next.min(flush);
        }

        (next - now).to_std().unwrap_or(Duration::ZERO)
    }

    fn run_due_work(&mut self) {
        let now = self.clock.now();

        for fired in self.timers.due(now) {
            self.stats.timers_fired += 1;

            let event = Event::new(
                fired.on_expire.topic.clone(),
                fired.on_expire.data.clone(),
                now,
                "timer",
            );
            self.enqueue(PendingTrigger {
                route: Route::Timer {
                    name: fired.name.clone(),
                },
                event,
                depth: 0,
            });

            let mut payload = Map::new();
            payload.insert("name".to_string(), Value::from(fired.name));
            payload.insert("fired_count".to_string(), Value::Int(i64::from(fired.fired_count)));
            payload.insert("topic".to_string(), Value::from(fired.on_expire.topic));
            self.enqueue_internal(topics::TIMER_FIRED, payload, 0);
        }

        for completion in self.temporal.on_deadline(now) {
            self.enqueue_completion(completion, 0);
        }

        if now >= self.next_cache_sweep {
            self.resolver.sweep_cache();
            self.next_cache_sweep = now
                + chrono::Duration::from_std(self.cfg.cache_sweep_interval)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
        }
        if now >= self.next_temporal_sweep {
            self.temporal.sweep(now);
            self.next_temporal_sweep = now
                + chrono::Duration::from_std(self.cfg.temporal_sweep_interval)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
        }
        if let (Some(flush_at), Some(interval)) = (self.next_flush, self.cfg.flush_interval) {
            if now >= flush_at {
                self.flush_persistence(now);
                self.next_flush = chrono::Duration::from_std(interval).ok().map(|d| now + d);
            }
        }
    }

    fn enqueue(&mut self, trigger: PendingTrigger) {
        if trigger.depth > self.cfg.max_trigger_depth {
            self.stats.dropped_triggers += 1;
            warn!(
                topic = %trigger.event.topic,
                depth = trigger.depth,
                "trigger depth ceiling exceeded; dropping"
            );
            return;
        }
        self.pending.push_back(trigger);
    }

    fn enqueue_internal(&mut self, topic: &str, payload: Map, depth: u16) {
        let event = Event::new(topic, payload, self.clock.now(), "engine");
        self.enqueue(PendingTrigger {
            route: Route::Event,
            event,
            depth,
        });
    }

    fn enqueue_completion(&mut self, completion: Completion, depth: u16) {
        self.stats.temporal_completions += 1;

        let mut captures = Map::new();
        for (i, (alias, event)) in completion.captured.iter().enumerate() {
            captures.insert(i.to_string(), Value::Object(event.data.clone()));
            if let Some(alias) = alias {
                captures.insert(alias.clone(), Value::Object(event.data.clone()));
            }
        }

        // The last captured event doubles as the trigger event.
        let Some((_, last)) = completion.captured.last() else {
            return;
        };
        let mut trigger_event = last.clone();
        trigger_event.source = "temporal".to_string();

        if let Some(count) = completion.count {
            captures
                .entry("count".to_string())
                .or_insert(Value::Int(count as i64));
        }

        self.enqueue(PendingTrigger {
            route: Route::Temporal {
                rule_id: completion.rule_id,
                captures,
                aggregate: completion.aggregate_value,
                group_key: completion.group_key,
            },
            event: trigger_event,
            depth,
        });
    }

    // ------------------------------------------------------------ triggers

    fn process_trigger(&mut self, trigger: PendingTrigger) {
        let started = Instant::now();

        let is_temporal_route = matches!(trigger.route, Route::Temporal { .. });
        if !is_temporal_route {
            self.stats.events_processed += 1;
            self.stats.handler_errors += self.subscribers.dispatch(&trigger.event);

            // Temporal detectors observe every real event exactly once.
            let completions = self.temporal.on_event(&trigger.event);
            for completion in completions {
                self.enqueue_completion(completion, trigger.depth.saturating_add(1));
            }
        }

        self.record_audit(&trigger);

        let candidates = self.candidates(&trigger);
        for rule in candidates {
            self.fire_rule(&rule, &trigger);
        }

        self.stats
            .record_processing(started.elapsed().as_micros().min(u128::from(u64::MAX)) as u64);
    }

    fn candidates(&self, trigger: &PendingTrigger) -> Vec<Rule> {
        match &trigger.route {
            Route::Event => self.index.candidates_for_event(&trigger.event.topic),
            Route::FactChange { key } => merge_candidates(
                self.index.candidates_for_fact(key),
                self.index.candidates_for_event(&trigger.event.topic),
            ),
            Route::Timer { name } => merge_candidates(
                self.index.candidates_for_timer(name),
                self.index.candidates_for_event(&trigger.event.topic),
            ),
            Route::Temporal { rule_id, .. } => self
                .index
                .candidate_for_temporal(rule_id)
                .into_iter()
                .collect(),
        }
    }

    fn record_audit(&mut self, trigger: &PendingTrigger) {
        let (category, action, entity_id) = match &trigger.route {
            Route::Temporal { rule_id, group_key, .. } => {
                let mut payload = Map::new();
                payload.insert("rule_id".to_string(), Value::from(rule_id.clone()));
                payload.insert("group_key".to_string(), Value::from(group_key.clone()));
                self.audit.record(AuditEntry {
                    timestamp: trigger.event.timestamp,
                    category: "temporal".to_string(),
                    action: "temporal_completed".to_string(),
                    entity_id: rule_id.clone(),
                    payload: Value::Object(payload),
                });
                return;
            }
            _ => {
                let Some(category) = audit_category(&trigger.event.topic) else {
                    return;
                };
                let entity_id = ["key", "rule_id", "name"]
                    .iter()
                    .find_map(|k| trigger.event.data.get(*k))
                    .map(Value::coerce_string)
                    .unwrap_or_default();
                (category, trigger.event.topic.clone(), entity_id)
            }
        };

        self.audit.record(AuditEntry {
            timestamp: trigger.event.timestamp,
            category: category.to_string(),
            action,
            entity_id,
            payload: Value::Object(trigger.event.data.clone()),
        });
    }

    // --------------------------------------------------------------- fires

    fn fire_rule(&mut self, rule: &Rule, trigger: &PendingTrigger) {
        let started = Instant::now();
        let summary = trigger_summary(trigger);

        let mut scratch = Map::new();
        scratch.insert("rule_id".to_string(), Value::from(rule.id.clone()));
        scratch.insert("topic".to_string(), Value::from(trigger.event.topic.clone()));
        match &trigger.route {
            Route::Event => {
                scratch.insert("trigger".to_string(), Value::from("event"));
            }
            Route::FactChange { key } => {
                scratch.insert("trigger".to_string(), Value::from("fact"));
                scratch.insert("fact_key".to_string(), Value::from(key.clone()));
            }
            Route::Timer { name } => {
                scratch.insert("trigger".to_string(), Value::from("timer"));
                scratch.insert("timer".to_string(), Value::from(name.clone()));
            }
            Route::Temporal { group_key, .. } => {
                scratch.insert("trigger".to_string(), Value::from("temporal"));
                scratch.insert("group_key".to_string(), Value::from(group_key.clone()));
            }
        }
        if let Some(correlation) = &trigger.event.correlation_id {
            scratch.insert("correlation_id".to_string(), Value::from(correlation.clone()));
        }

        let (captures, aggregate) = match &trigger.route {
            Route::Temporal {
                captures, aggregate, ..
            } => (Some(captures.clone()), *aggregate),
            _ => (None, None),
        };

        let mut fire = FireCtx {
            event: trigger.event.clone(),
            lookups: Map::new(),
            scratch,
            captures,
            aggregate,
            depth: trigger.depth,
        };

        if !rule.lookups.is_empty() {
            let requirements: Vec<ResolvedLookup> = {
                let ctx = fire.ctx(&self.facts);
                rule.lookups
                    .iter()
                    .map(|lookup| {
                        let args = lookup.args.iter().map(|a| ctx.resolve_value(a)).collect();
                        ResolvedLookup::bind(lookup, args)
                    })
                    .collect()
            };

            match self.resolver.resolve_all(&requirements) {
                Ok(resolution) => {
                    if !resolution.skipped.is_empty() {
                        // A skipped lookup drops the fire.
                        self.stats.rules_skipped += 1;
                        self.stats.rule(&rule.id).skipped += 1;
                        self.push_trace(rule, &summary, started, 0, TraceOutcome::Skipped {
                            reason: format!("lookups skipped: {}", resolution.skipped.join(", ")),
                        });
                        return;
                    }
                    fire.lookups = resolution.values;
                }
                Err(err) => {
                    self.finish_failed(rule, &summary, started, 0, &err, fire.depth);
                    return;
                }
            }
        }

        let conditions_passed = {
            let ctx = fire.ctx(&self.facts);
            evaluate_all(&rule.conditions, &ctx)
        };
        match conditions_passed {
            Ok(true) => {}
            Ok(false) => {
                self.push_trace(rule, &summary, started, 0, TraceOutcome::ConditionsFailed);
                return;
            }
            Err(err) => {
                self.finish_failed(rule, &summary, started, 0, &err, fire.depth);
                return;
            }
        }

        let mut executed = 0usize;
        match self.execute_actions(rule, &rule.actions, &fire, &mut executed) {
            Ok(()) => {
                self.stats.rules_executed += 1;
                self.stats.rule(&rule.id).executions += 1;
                self.stats.actions_executed += executed as u64;
                self.push_trace(rule, &summary, started, executed, TraceOutcome::Fired);

                let mut payload = Map::new();
                payload.insert("rule_id".to_string(), Value::from(rule.id.clone()));
                payload.insert("name".to_string(), Value::from(rule.name.clone()));
                payload.insert("trigger".to_string(), Value::from(summary));
                self.enqueue_internal(topics::RULE_FIRED, payload, fire.depth.saturating_add(1));
            }
            Err(err) => {
                self.stats.actions_executed += executed as u64;
                self.finish_failed(rule, &summary, started, executed, &err, fire.depth);
            }
        }
    }

    fn finish_failed(
        &mut self,
        rule: &Rule,
        summary: &str,
        started: Instant,
        executed: usize,
        err: &VerdictError,
        depth: u16,
    ) {
        self.stats.rules_failed += 1;
        self.stats.rule(&rule.id).failures += 1;
        warn!(rule = %rule.id, error = %err, "rule fire failed");
        self.push_trace(rule, summary, started, executed, TraceOutcome::Failed {
            error: err.to_string(),
        });

        let mut payload = Map::new();
        payload.insert("rule_id".to_string(), Value::from(rule.id.clone()));
        payload.insert("error".to_string(), Value::from(err.to_string()));
        payload.insert("error_kind".to_string(), Value::from(err.kind()));
        self.enqueue_internal(topics::RULE_FAILED, payload, depth.saturating_add(1));
    }

    fn push_trace(
        &mut self,
        rule: &Rule,
        summary: &str,
        started: Instant,
        actions_executed: usize,
        outcome: TraceOutcome,
    ) {
        if !self.trace.is_enabled() {
            return;
        }
        self.trace.record(TraceEntry {
            id: Uuid::new_v4(),
            timestamp: self.clock.now(),
            rule_id: rule.id.clone(),
            trigger: summary.to_string(),
            outcome,
            actions_executed,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        });
    }

    // -------------------------------------------------------------- actions

    fn execute_actions(
        &mut self,
        rule: &Rule,
        actions: &[Action],
        fire: &FireCtx,
        executed: &mut usize,
    ) -> VerdictResult<()> {
        for (index, action) in actions.iter().enumerate() {
            self.execute_action(rule, action, fire, executed)
                .map_err(|err| {
                    VerdictError::Execution(ExecutionError::ActionFailed {
                        rule_id: rule.id.clone(),
                        index,
                        action: action.kind().to_string(),
                        reason: err.to_string(),
                    })
                })?;
            *executed += 1;
        }
        Ok(())
    }

    fn execute_action(
        &mut self,
        rule: &Rule,
        action: &Action,
        fire: &FireCtx,
        executed: &mut usize,
    ) -> VerdictResult<()> {
        match action {
            Action::SetFact { key, value } => {
                let (key, value) = {
                    let ctx = fire.ctx(&self.facts);
                    (ctx.interpolate(key), ctx.resolve_value(value))
                };
                self.apply_set_fact(key, value, format!("rule:{}", rule.id), fire.depth.saturating_add(1));
            }

            Action::DeleteFact { key } => {
                let key = fire.ctx(&self.facts).interpolate(key);
                self.apply_delete_fact(&key, fire.depth.saturating_add(1));
            }

            Action::EmitEvent { topic, data } => {
                let (topic, data) = {
                    let ctx = fire.ctx(&self.facts);
                    (ctx.interpolate(topic), ctx.resolve_map(data))
                };
                let mut event = Event::new(topic, data, self.clock.now(), format!("rule:{}", rule.id));
                event.causation_id = Some(fire.event.id.to_string());
                event.correlation_id = fire
                    .event
                    .correlation_id
                    .clone()
                    .or_else(|| Some(fire.event.id.to_string()));
                self.enqueue(PendingTrigger {
                    route: Route::Event,
                    event,
                    depth: fire.depth.saturating_add(1),
                });
            }

            Action::SetTimer { timer } => {
                let config = {
                    let ctx = fire.ctx(&self.facts);
                    TimerConfig {
                        name: ctx.interpolate(&timer.name),
                        on_expire: OnExpire {
                            topic: ctx.interpolate(&timer.on_expire.topic),
                            data: ctx.resolve_map(&timer.on_expire.data),
                        },
                        schedule: timer.schedule.clone(),
                    }
                };
                let armed = self
                    .timers
                    .set(config, self.clock.now())
                    .map_err(VerdictError::Validation)?;

                let mut payload = Map::new();
                payload.insert("name".to_string(), Value::from(armed.name));
                payload.insert(
                    "expires_at".to_string(),
                    Value::from(armed.expires_at.to_rfc3339()),
                );
                self.enqueue_internal(topics::TIMER_SET, payload, fire.depth.saturating_add(1));
            }

            Action::CancelTimer { name } => {
                let name = fire.ctx(&self.facts).interpolate(name);
                if self.timers.cancel(&name) {
                    let mut payload = Map::new();
                    payload.insert("name".to_string(), Value::from(name));
                    self.enqueue_internal(topics::TIMER_CANCELLED, payload, fire.depth.saturating_add(1));
                }
            }

            Action::CallService {
                service,
                method,
                args,
            } => {
                let args: Vec<Value> = {
                    let ctx = fire.ctx(&self.facts);
                    args.iter().map(|a| ctx.resolve_value(a)).collect()
                };
                self.resolver.invoke(service, method, args)?;
            }

            Action::Log { level, message } => {
                let message = fire.ctx(&self.facts).interpolate(message);
                match level {
                    LogLevel::Trace => tracing::trace!(rule = %rule.id, "{message}"),
                    LogLevel::Debug => debug!(rule = %rule.id, "{message}"),
                    LogLevel::Info => info!(rule = %rule.id, "{message}"),
                    LogLevel::Warn => warn!(rule = %rule.id, "{message}"),
                    LogLevel::Error => error!(rule = %rule.id, "{message}"),
                }
            }

            Action::Conditional {
                conditions,
                then,
                otherwise,
            } => {
                let branch_taken = {
                    let ctx = fire.ctx(&self.facts);
                    evaluate_all(conditions, &ctx)?
                };
                if branch_taken {
                    self.execute_actions(rule, then, fire, executed)?;
                } else if let Some(actions) = otherwise {
                    self.execute_actions(rule, actions, fire, executed)?;
                }
            }
        }
        Ok(())
    }

    fn apply_set_fact(&mut self, key: String, value: Value, source: String, depth: u16) -> Fact {
        let now = self.clock.now();
        let write = self.facts.set(key, value, source, now);

        let topic = if write.created() {
            topics::FACT_CREATED
        } else {
            topics::FACT_UPDATED
        };

        let mut data = Map::new();
        data.insert("key".to_string(), Value::from(write.fact.key.clone()));
        data.insert("value".to_string(), write.fact.value.clone());
        data.insert("version".to_string(), Value::Int(write.fact.version as i64));
        if let Some(previous) = &write.previous {
            data.insert("previous".to_string(), previous.clone());
        }

        let event = Event::new(topic, data, now, "engine");
        self.enqueue(PendingTrigger {
            route: Route::FactChange {
                key: write.fact.key.clone(),
            },
            event,
            depth,
        });
        write.fact
    }

    fn apply_delete_fact(&mut self, key: &str, depth: u16) -> bool {
        let Some(removed) = self.facts.delete(key) else {
            return false;
        };

        let mut data = Map::new();
        data.insert("key".to_string(), Value::from(removed.key.clone()));
        data.insert("previous".to_string(), removed.value);

        let event = Event::new(topics::FACT_DELETED, data, self.clock.now(), "engine");
        self.enqueue(PendingTrigger {
            route: Route::FactChange {
                key: removed.key,
            },
            event,
            depth,
        });
        true
    }

    // ------------------------------------------------------------- commands

    #[allow(clippy::too_many_lines)]
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Emit { event, depth } => {
                self.enqueue(PendingTrigger {
                    route: Route::Event,
                    event,
                    depth,
                });
            }
            Command::SetFact { key, value, reply } => {
                let fact = self.apply_set_fact(key, value, "api".to_string(), 0);
                let _ = reply.send(Ok(fact));
            }
            Command::DeleteFact { key, reply } => {
                let existed = self.apply_delete_fact(&key, 0);
                let _ = reply.send(existed);
            }
            Command::GetFact { key, reply } => {
                let _ = reply.send(self.facts.get(&key).cloned());
            }
            Command::GetFactFull { key, reply } => {
                let _ = reply.send(self.facts.get_full(&key));
            }
            Command::QueryFacts { pattern, reply } => {
                let _ = reply.send(self.facts.query(&pattern));
            }
            Command::RegisterRule { rule, reply } => {
                let _ = reply.send(self.register_rule(rule));
            }
            Command::UpdateRule { rule, reply } => {
                let _ = reply.send(self.update_rule(rule));
            }
            Command::UnregisterRule { id, reply } => {
                let _ = reply.send(self.unregister_rule(&id));
            }
            Command::SetRuleEnabled { id, enabled, reply } => {
                let _ = reply.send(self.set_rule_enabled(&id, enabled));
            }
            Command::GetRule { id, reply } => {
                let result = self.index.get(&id).cloned().ok_or_else(|| {
                    VerdictError::Execution(ExecutionError::RuleNotFound { id })
                });
                let _ = reply.send(result);
            }
            Command::GetRules { reply } => {
                let _ = reply.send(self.index.all());
            }
            Command::RegisterGroup { group, reply } => {
                let result = self.index.insert_group(group.clone()).map(|()| group);
                let _ = reply.send(result);
            }
            Command::UpdateGroup { group, reply } => {
                let result = self.index.replace_group(group.clone()).map(|()| group);
                let _ = reply.send(result);
            }
            Command::UnregisterGroup { id, reply } => {
                let _ = reply.send(self.index.remove_group(&id));
            }
            Command::SetGroupEnabled { id, enabled, reply } => {
                let result = match self.index.get_group_mut(&id) {
                    Some(group) => {
                        group.enabled = enabled;
                        Ok(group.clone())
                    }
                    None => Err(VerdictError::Execution(ExecutionError::GroupNotFound { id })),
                };
                let _ = reply.send(result);
            }
            Command::GetGroup { id, reply } => {
                let result = self.index.get_group(&id).cloned().ok_or_else(|| {
                    VerdictError::Execution(ExecutionError::GroupNotFound { id })
                });
                let _ = reply.send(result);
            }
            Command::GetGroups { reply } => {
                let _ = reply.send(self.index.all_groups());
            }
            Command::SetTimer { config, reply } => {
                let result = self.set_timer(config);
                let _ = reply.send(result);
            }
            Command::CancelTimer { name, reply } => {
                let existed = self.timers.cancel(&name);
                if existed {
                    let mut payload = Map::new();
                    payload.insert("name".to_string(), Value::from(name));
                    self.enqueue_internal(topics::TIMER_CANCELLED, payload, 0);
                }
                let _ = reply.send(existed);
            }
            Command::GetTimers { reply } => {
                let _ = reply.send(self.timers.snapshot());
            }
            Command::Subscribe {
                pattern,
                handler,
                reply,
            } => {
                let _ = reply.send(self.subscribers.subscribe(&pattern, handler));
            }
            Command::SubscribeStream {
                pattern,
                capacity,
                reply,
            } => {
                let _ = reply.send(self.subscribers.subscribe_stream(&pattern, capacity));
            }
            Command::Unsubscribe { id, reply } => {
                let _ = reply.send(self.subscribers.unsubscribe(id));
            }
            Command::RegisterService {
                name,
                service,
                reply,
            } => {
                self.services().register(name, service);
                let _ = reply.send(());
            }
            Command::Query { goal, reply } => {
                let outcome =
                    chaining::prove(&self.index, &self.facts, &goal, self.cfg.max_query_depth);
                let _ = reply.send(outcome);
            }
            Command::GetStats { reply } => {
                let _ = reply.send(self.stats.snapshot(self.started_at, self.clock.now()));
            }
            Command::SetTracing { enabled, reply } => {
                if enabled {
                    self.trace.enable();
                } else {
                    self.trace.disable();
                }
                let _ = reply.send(());
            }
            Command::GetTrace { reply } => {
                let _ = reply.send(self.trace.entries());
            }
            Command::GetAudit { category, reply } => {
                let entries = match category {
                    Some(category) => self.audit.by_category(&category),
                    None => self.audit.entries(),
                };
                let _ = reply.send(entries);
            }
            Command::VersionHistory { rule_id, reply } => {
                let result = self
                    .versions
                    .history(&rule_id)
                    .map(<[_]>::to_vec)
                    .ok_or(VerdictError::Execution(ExecutionError::RuleNotFound {
                        id: rule_id,
                    }));
                let _ = reply.send(result);
            }
            Command::RollbackRule {
                rule_id,
                version,
                reply,
            } => {
                let _ = reply.send(self.rollback_rule(&rule_id, version));
            }
            Command::AdvanceClock { by, reply } => {
                let result = match &self.manual_clock {
                    Some(clock) => {
                        clock.advance(by);
                        Ok(())
                    }
                    None => Err(VerdictError::Execution(ExecutionError::SubsystemUnavailable {
                        subsystem: "manual_clock".to_string(),
                    })),
                };
                let _ = reply.send(result);
            }
            Command::Flush { reply } => {
                let now = self.clock.now();
                self.flush_persistence(now);
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                // Handled in the run loop; kept exhaustive for safety.
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn register_rule(&mut self, mut rule: Rule) -> VerdictResult<Rule> {
        rule.validate()?;
        let now = self.clock.now();
        rule.version = 1;
        rule.created_at = now;
        rule.updated_at = now;

        self.index.insert(rule.clone())?;
        if let Trigger::Temporal { pattern } = &rule.trigger {
            self.temporal.register(&rule.id, pattern.clone());
        }
        self.versions.record(&rule, ChangeType::Registered, now);
        self.rule_lifecycle_event(topics::RULE_REGISTERED, &rule);
        Ok(rule)
    }

    fn update_rule(&mut self, mut rule: Rule) -> VerdictResult<Rule> {
        rule.validate()?;
        let existing = self.index.get(&rule.id).cloned().ok_or_else(|| {
            VerdictError::Execution(ExecutionError::RuleNotFound {
                id: rule.id.clone(),
            })
        })?;

        let now = self.clock.now();
        rule.version = existing.version + 1;
        rule.created_at = existing.created_at;
        rule.updated_at = now;

        self.index.replace(rule.clone())?;
        self.reindex_temporal(&rule);
        self.versions.record(&rule, ChangeType::Updated, now);
        self.rule_lifecycle_event(topics::RULE_UPDATED, &rule);
        Ok(rule)
    }

    fn set_rule_enabled(&mut self, id: &str, enabled: bool) -> VerdictResult<Rule> {
        let existing = self.index.get(id).cloned().ok_or_else(|| {
            VerdictError::Execution(ExecutionError::RuleNotFound { id: id.to_string() })
        })?;

        // Idempotent: enabling an enabled rule changes nothing.
        if existing.enabled == enabled {
            return Ok(existing);
        }

        let now = self.clock.now();
        let mut updated = existing;
        updated.enabled = enabled;
        updated.version += 1;
        updated.updated_at = now;
        self.index.replace(updated.clone())?;

        let (change, topic) = if enabled {
            (ChangeType::Enabled, topics::RULE_ENABLED)
        } else {
            (ChangeType::Disabled, topics::RULE_DISABLED)
        };
        self.versions.record(&updated, change, now);
        self.rule_lifecycle_event(topic, &updated);
        Ok(updated)
    }

    fn unregister_rule(&mut self, id: &str) -> VerdictResult<Rule> {
        let rule = self.index.remove(id)?;
        self.temporal.unregister(id);
        self.versions
            .record(&rule, ChangeType::Unregistered, self.clock.now());
        self.rule_lifecycle_event(topics::RULE_UNREGISTERED, &rule);
        Ok(rule)
    }

    fn rollback_rule(&mut self, rule_id: &str, version: u64) -> VerdictResult<Rule> {
        let current = self.index.get(rule_id).cloned().ok_or_else(|| {
            VerdictError::Execution(ExecutionError::RuleNotFound {
                id: rule_id.to_string(),
            })
        })?;
        let entry = self.versions.entry(rule_id, version).cloned().ok_or(
            VerdictError::Execution(ExecutionError::VersionNotFound {
                rule_id: rule_id.to_string(),
                version,
            }),
        )?;

        let now = self.clock.now();
        let mut restored = entry.snapshot;
        restored.version = current.version + 1;
        restored.created_at = current.created_at;
        restored.updated_at = now;

        self.index.replace(restored.clone())?;
        self.reindex_temporal(&restored);
        self.versions.record(&restored, ChangeType::RolledBack, now);
        self.rule_lifecycle_event(topics::RULE_UPDATED, &restored);
        Ok(restored)
    }

    fn reindex_temporal(&mut self, rule: &Rule) {
        self.temporal.unregister(&rule.id);
        if let Trigger::Temporal { pattern } = &rule.trigger {
            self.temporal.register(&rule.id, pattern.clone());
        }
    }

    fn rule_lifecycle_event(&mut self, topic: &str, rule: &Rule) {
        let mut payload = Map::new();
        payload.insert("rule_id".to_string(), Value::from(rule.id.clone()));
        payload.insert("name".to_string(), Value::from(rule.name.clone()));
        payload.insert("version".to_string(), Value::Int(rule.version as i64));
        self.enqueue_internal(topic, payload, 0);
    }

    fn set_timer(&mut self, config: TimerConfig) -> VerdictResult<crate::timer::Timer> {
        let timer = self
            .timers
            .set(config, self.clock.now())
            .map_err(VerdictError::Validation)?;

        let mut payload = Map::new();
        payload.insert("name".to_string(), Value::from(timer.name.clone()));
        payload.insert(
            "expires_at".to_string(),
            Value::from(timer.expires_at.to_rfc3339()),
        );
        self.enqueue_internal(topics::TIMER_SET, payload, 0);
        Ok(timer)
    }

    // ---------------------------------------------------------- persistence

    fn load_persisted(&mut self) {
        let Some(storage) = self.cfg.storage.clone() else {
            return;
        };

        match storage.load(crate::storage::keys::FACTS) {
            Ok(Some(payload)) => match payload.unwrap_state::<Vec<Fact>>() {
                Ok(facts) => self.facts.restore(facts),
                Err(e) => warn!(error = %e, "skipping malformed fact snapshot"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to load fact snapshot"),
        }

        match storage.load(crate::storage::keys::GROUPS) {
            Ok(Some(payload)) => match payload.unwrap_state::<Vec<RuleGroup>>() {
                Ok(groups) => {
                    for group in groups {
                        let _ = self.index.insert_group(group);
                    }
                }
                Err(e) => warn!(error = %e, "skipping malformed group snapshot"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to load group snapshot"),
        }

        match storage.load(crate::storage::keys::RULES) {
            Ok(Some(payload)) => match payload.unwrap_state::<Vec<Rule>>() {
                Ok(rules) => {
                    for rule in rules {
                        if let Err(e) = rule.validate() {
                            warn!(rule = %rule.id, error = %e, "skipping invalid persisted rule");
                            continue;
                        }
                        if let Trigger::Temporal { pattern } = &rule.trigger {
                            self.temporal.register(&rule.id, pattern.clone());
                        }
                        let _ = self.index.insert(rule);
                    }
                }
                Err(e) => warn!(error = %e, "skipping malformed rule snapshot"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to load rule snapshot"),
        }

        self.versions.load_from(storage.as_ref());
    }

    fn flush_persistence(&mut self, now: DateTime<Utc>) {
        let Some(storage) = self.cfg.storage.clone() else {
            return;
        };
        let server_id = self.cfg.server_id.clone();

        let snapshots: [(&str, Result<crate::storage::Persisted, _>); 3] = [
            (
                crate::storage::keys::FACTS,
                crate::storage::Persisted::wrap(&self.facts.snapshot(), &server_id, now),
            ),
            (
                crate::storage::keys::RULES,
                crate::storage::Persisted::wrap(&self.index.all(), &server_id, now),
            ),
            (
                crate::storage::keys::GROUPS,
                crate::storage::Persisted::wrap(&self.index.all_groups(), &server_id, now),
            ),
        ];
        for (key, payload) in snapshots {
            match payload {
                Ok(payload) => {
                    if let Err(e) = storage.save(key, &payload) {
                        warn!(key, error = %e, "write-behind flush failed");
                    }
                }
                Err(e) => warn!(key, error = %e, "snapshot serialization failed"),
            }
        }

        self.versions.flush_to(storage.as_ref(), &server_id, now);
        self.audit.flush_to(storage.as_ref(), &server_id, now);
    }

    fn shutdown(&mut self) {
        let now = self.clock.now();
        self.timers.clear();

        let mut payload = Map::new();
        payload.insert("server_id".to_string(), Value::from(self.cfg.server_id.clone()));
        let event = Event::new(topics::ENGINE_STOPPED, payload.clone(), now, "engine");

        // Observers hear the stop synchronously; no rules dispatch for it.
        self.stats.handler_errors += self.subscribers.dispatch(&event);
        self.audit.record(AuditEntry {
            timestamp: now,
            category: "engine".to_string(),
            action: topics::ENGINE_STOPPED.to_string(),
            entity_id: self.cfg.server_id.clone(),
            payload: Value::Object(payload),
        });

        self.flush_persistence(now);
        info!(server_id = %self.cfg.server_id, "engine stopped");
        // Dropping the lookup resolver abandons in-flight service calls; the
        // pool detaches its workers rather than blocking shutdown on them.
    }
}

fn merge_candidates(primary: Vec<Rule>, secondary: Vec<Rule>) -> Vec<Rule> {
    let mut merged = primary;
    for rule in secondary {
        if !merged.iter().any(|r| r.id == rule.id) {
            merged.push(rule);
        }
    }
    merged.sort_by(dispatch_order);
    merged
}

fn trigger_summary(trigger: &PendingTrigger) -> String {
    match &trigger.route {
        Route::Event => format!("event {}", trigger.event.topic),
        Route::FactChange { key } => format!("fact {key}"),
        Route::Timer { name } => format!("timer {name}"),
        Route::Temporal { rule_id, .. } => format!("temporal {rule_id}"),
    }
}

fn audit_category(topic: &str) -> Option<&'static str> {
    match topic {
        topics::FACT_CREATED | topics::FACT_UPDATED | topics::FACT_DELETED => Some("fact"),
        topics::RULE_REGISTERED
        | topics::RULE_UPDATED
        | topics::RULE_ENABLED
        | topics::RULE_DISABLED
        | topics::RULE_UNREGISTERED
        | topics::RULE_FIRED
        | topics::RULE_FAILED => Some("rule"),
        topics::TIMER_SET | topics::TIMER_FIRED | topics::TIMER_CANCELLED => Some("timer"),
        topics::ENGINE_STARTED | topics::ENGINE_STOPPED => Some("engine"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::Action;

    #[test]
    fn test_audit_category_mapping() {
        assert_eq!(audit_category(topics::FACT_CREATED), Some("fact"));
        assert_eq!(audit_category(topics::RULE_FIRED), Some("rule"));
        assert_eq!(audit_category(topics::TIMER_SET), Some("timer"));
        assert_eq!(audit_category(topics::ENGINE_STARTED), Some("engine"));
        assert_eq!(audit_category("order.created"), None);
    }

    #[test]
    fn test_merge_candidates_dedups_and_orders() {
        let high = Rule::builder("high")
            .priority(10.0)
            .on_event("a")
            .action(Action::DeleteFact {
                key: "k".to_string(),
            })
            .build()
            .unwrap();
        let low = Rule::builder("low")
            .priority(1.0)
            .on_timer("t")
            .action(Action::DeleteFact {
                key: "k".to_string(),
            })
            .build()
            .unwrap();

        let merged = merge_candidates(vec![low.clone()], vec![high.clone(), low.clone()]);
        let ids: Vec<&str> = merged.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low"]);
    }
}
