//! Error types for the verdict engine.
//!
//! All errors are strongly typed using thiserror. Every variant carries a
//! short machine-readable kind code (see [`ValidationError::kind`] and
//! [`ExecutionError::kind`]) so callers and transports can translate errors
//! without string matching.

use thiserror::Error;

/// Validation errors raised while checking rule, timer, goal or lookup input.
///
/// Validation failures are reported at the API boundary and never crash the
/// engine; the offending operation is rejected.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Required field missing.
    #[error("Required field '{field}' is missing")]
    MissingField {
        /// Name of missing field.
        field: String,
    },

    /// A field is syntactically valid but semantically invalid.
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Field name.
        field: String,
        /// Reason the field is invalid.
        reason: String,
    },

    /// Rule id is empty.
    #[error("Rule id cannot be empty")]
    EmptyRuleId,

    /// A rule must declare at least one action.
    #[error("Rule '{rule_id}' must declare at least one action")]
    NoActions {
        /// Offending rule id.
        rule_id: String,
    },

    /// Rule priority must be a finite number.
    #[error("Rule '{rule_id}' priority must be finite, got {priority}")]
    NonFinitePriority {
        /// Offending rule id.
        rule_id: String,
        /// The rejected priority.
        priority: f64,
    },

    /// A duration string did not match `^\d+(ms|s|m|h|d|w|y)$`.
    #[error("Invalid duration '{input}'")]
    InvalidDuration {
        /// The rejected input.
        input: String,
    },

    /// A cron expression failed to parse.
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron {
        /// The rejected expression.
        expr: String,
        /// Parser diagnostic.
        reason: String,
    },

    /// A regular expression in a `matches` condition failed to compile.
    #[error("Invalid regex '{pattern}': {reason}")]
    InvalidRegex {
        /// The rejected pattern.
        pattern: String,
        /// Compiler diagnostic.
        reason: String,
    },

    /// A temporal pattern is malformed.
    #[error("Invalid temporal pattern: {reason}")]
    InvalidTemporalPattern {
        /// Reason for invalidity.
        reason: String,
    },

    /// A backward-chaining goal is malformed.
    #[error("Invalid goal: {reason}")]
    InvalidGoal {
        /// Reason for invalidity.
        reason: String,
    },

    /// YAML input failed to parse or normalize.
    #[error("Invalid YAML rule document: {reason}")]
    InvalidYaml {
        /// Parser diagnostic.
        reason: String,
    },
}

impl ValidationError {
    /// Short machine-readable kind code.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MissingField { .. } => "missing_field",
            Self::InvalidField { .. } => "invalid_field",
            Self::EmptyRuleId => "empty_rule_id",
            Self::NoActions { .. } => "no_actions",
            Self::NonFinitePriority { .. } => "non_finite_priority",
            Self::InvalidDuration { .. } => "invalid_duration",
            Self::InvalidCron { .. } => "invalid_cron",
            Self::InvalidRegex { .. } => "invalid_regex",
            Self::InvalidTemporalPattern { .. } => "invalid_temporal_pattern",
            Self::InvalidGoal { .. } => "invalid_goal",
            Self::InvalidYaml { .. } => "invalid_yaml",
        }
    }
}

/// Execution errors raised while the engine is running.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Unknown rule id on an operation requiring it.
    #[error("Rule not found: {id}")]
    RuleNotFound {
        /// Missing rule id.
        id: String,
    },

    /// Unknown rule group id.
    #[error("Rule group not found: {id}")]
    GroupNotFound {
        /// Missing group id.
        id: String,
    },

    /// Unknown rule version on a rollback.
    #[error("Rule '{rule_id}' has no version {version}")]
    VersionNotFound {
        /// Rule id.
        rule_id: String,
        /// Missing version.
        version: u64,
    },

    /// Duplicate id on create.
    #[error("Duplicate id: {id}")]
    DuplicateId {
        /// The conflicting id.
        id: String,
    },

    /// An optional subsystem was requested but is not configured.
    #[error("Subsystem not configured: {subsystem}")]
    SubsystemUnavailable {
        /// Subsystem name (e.g. `versioning`, `audit`).
        subsystem: String,
    },

    /// An external data lookup failed and the requirement was marked `fail`.
    #[error("Data resolution failed for lookup '{name}': {reason}")]
    DataResolution {
        /// Lookup name (rule-local).
        name: String,
        /// Failure detail.
        reason: String,
    },

    /// A `call_service` action failed.
    #[error("Service call {service}.{method} failed: {reason}")]
    ServiceCall {
        /// Service name.
        service: String,
        /// Method name.
        method: String,
        /// Failure detail.
        reason: String,
    },

    /// Unknown service name.
    #[error("Service not registered: {service}")]
    ServiceNotFound {
        /// Missing service.
        service: String,
    },

    /// Storage adapter failure. The engine continues on in-memory state.
    #[error("Storage error: {message}")]
    Storage {
        /// Error details.
        message: String,
    },

    /// An operation timed out.
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        /// Duration before timeout.
        duration_ms: u64,
    },

    /// The engine command queue is full.
    #[error("Engine queue is full (capacity={capacity})")]
    QueueFull {
        /// Queue capacity.
        capacity: usize,
    },

    /// The dispatch loop is gone before producing a reply.
    #[error("Engine dispatcher disconnected for {path}")]
    Disconnected {
        /// Path name describing where the disconnect was observed.
        path: String,
    },

    /// A mutating call with a reply was made from within a handler.
    #[error("Re-entrant call to '{operation}' from an event handler")]
    ReentrantCall {
        /// Operation name.
        operation: String,
    },

    /// The engine has been stopped; no further operations are accepted.
    #[error("Engine is stopped")]
    EngineStopped,

    /// Action execution failed for a rule fire.
    #[error("Action {index} ({action}) of rule '{rule_id}' failed: {reason}")]
    ActionFailed {
        /// Rule id.
        rule_id: String,
        /// Zero-based action index within the fire.
        index: usize,
        /// Action kind name.
        action: String,
        /// Failure detail.
        reason: String,
    },
}

impl ExecutionError {
    /// Short machine-readable kind code.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RuleNotFound { .. } => "rule_not_found",
            Self::GroupNotFound { .. } => "group_not_found",
            Self::VersionNotFound { .. } => "version_not_found",
            Self::DuplicateId { .. } => "duplicate_id",
            Self::SubsystemUnavailable { .. } => "subsystem_unavailable",
            Self::DataResolution { .. } => "data_resolution",
            Self::ServiceCall { .. } => "service_call",
            Self::ServiceNotFound { .. } => "service_not_found",
            Self::Storage { .. } => "storage",
            Self::Timeout { .. } => "timeout",
            Self::QueueFull { .. } => "queue_full",
            Self::Disconnected { .. } => "disconnected",
            Self::ReentrantCall { .. } => "reentrant_call",
            Self::EngineStopped => "engine_stopped",
            Self::ActionFailed { .. } => "action_failed",
        }
    }
}

/// Top-level error type for the verdict engine.
#[derive(Debug, Error)]
pub enum VerdictError {
    /// Input validation failed.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Execution failure.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Internal system error (unexpected invariant violation).
    #[error("Internal error: {message}")]
    Internal {
        /// Error description.
        message: String,
    },
}

impl VerdictError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if the engine rejected the call because it is stopped.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::EngineStopped))
    }

    /// Short machine-readable kind code.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.kind(),
            Self::Execution(e) => e.kind(),
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for verdict operations.
pub type VerdictResult<T> = Result<T, VerdictError>;
