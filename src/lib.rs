//! # Verdict - an embedded rules engine
//!
//! Verdict ingests events and fact changes, evaluates user-defined rules
//! against them, and executes the resulting actions: emit more events,
//! mutate facts, arm or cancel timers, invoke external services, log.
//!
//! ## Core Concepts
//!
//! - **Event**: a published occurrence on a dotted topic (`order.created`)
//! - **Fact**: a versioned value under a colon key (`user:123:age`)
//! - **Rule**: trigger + conditions + ordered actions, optionally gated by a
//!   group and fed by cached external lookups
//! - **Temporal pattern**: sequence / absence / count / aggregate detection
//!   over windowed, partitioned event streams
//! - **Timer**: one-shot, interval or cron schedules feeding synthetic
//!   triggers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use verdict::{Action, Engine, EngineConfig, Rule, Value};
//!
//! let engine = Engine::start(EngineConfig::default())?;
//! engine.register_rule(
//!     Rule::builder("flag-orders")
//!         .on_event("order.created")
//!         .action(Action::SetFact {
//!             key: "order:triggered".into(),
//!             value: Value::Bool(true),
//!         })
//!         .build()?,
//! )?;
//! engine.emit("order.created", Default::default())?;
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod audit;
pub mod bus;
pub mod condition;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod fact;
pub mod lookup;
pub mod pattern;
pub mod rule;
pub mod service;
pub mod storage;
pub mod temporal;
pub mod time;
pub mod timer;
pub mod value;
pub mod versioning;
pub mod yaml;

pub(crate) mod index;

// Re-export primary types at crate root for convenience
pub use audit::AuditEntry;
pub use bus::{EventHandler, EventStream, SubscriptionId};
pub use engine::{
    Engine, EngineClock, EngineConfig, Goal, ProofNode, QueryOutcome, RuleCounters, StatsSnapshot,
    TraceEntry, TraceOutcome,
};
pub use error::{ExecutionError, ValidationError, VerdictError, VerdictResult};
pub use event::{topics, Event, EventId};
pub use fact::{Fact, FactStore};
pub use rule::{
    Action, CacheSpec, Condition, ConditionSource, LogLevel, Lookup, OnError, Operator, Rule,
    RuleBuilder, RuleGroup, Trigger,
};
pub use service::{service_fn, Service, ServiceError, ServiceRegistry};
pub use storage::{MemoryAdapter, Persisted, PersistMeta, StorageAdapter, StorageError};
pub use temporal::{AggregateFn, Comparison, EventMatcher, TemporalPattern};
pub use time::{Clock, DurationMs, ManualClock, SystemClock};
pub use timer::{OnExpire, Timer, TimerConfig, TimerSchedule};
pub use value::{Map, Value};
pub use versioning::{ChangeType, VersionEntry};

#[cfg(feature = "persistent")]
pub use storage::FileAdapter;
