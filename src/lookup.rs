//! Data lookup resolution: parallel fan-out, single-flight, TTL cache.
//!
//! Lookups run on a small fixed worker pool so the dispatch loop only waits,
//! never executes service code. The cache key is a blake3 hash of the
//! canonical `(service, method, args)` serialization; concurrent resolutions
//! of the same key share one in-flight service call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::warn;

use crate::error::{ExecutionError, VerdictError, VerdictResult};
use crate::rule::{Lookup, OnError};
use crate::service::ServiceRegistry;
use crate::time::Clock;
use crate::value::{Map, Value};

/// Stable cache key over `(service, method, args)`.
pub type CacheKey = [u8; 32];

/// Computes the canonical cache key.
///
/// Object keys are ordered, so structurally equal argument lists always
/// produce the same hash.
#[must_use]
pub fn cache_key(service: &str, method: &str, args: &[Value]) -> CacheKey {
    let canonical = serde_json::to_vec(&(service, method, args)).unwrap_or_default();
    *blake3::hash(&canonical).as_bytes()
}

type Outcome = Result<Value, String>;

/// A lookup requirement with its arguments already resolved for this fire.
#[derive(Debug, Clone)]
pub struct ResolvedLookup {
    pub name: String,
    pub service: String,
    pub method: String,
    pub args: Vec<Value>,
    pub ttl: Option<Duration>,
    pub on_error: OnError,
}

impl ResolvedLookup {
    /// Binds a rule lookup to concrete arguments.
    #[must_use]
    pub fn bind(lookup: &Lookup, args: Vec<Value>) -> Self {
        Self {
            name: lookup.name.clone(),
            service: lookup.service.clone(),
            method: lookup.method.clone(),
            args,
            ttl: lookup.cache.map(|c| c.ttl.as_std()),
            on_error: lookup.on_error,
        }
    }
}

/// Result of resolving all requirements of one rule fire.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Successful lookups keyed by requirement name.
    pub values: Map,
    /// Requirements that failed under the `skip` policy.
    pub skipped: Vec<String>,
}

struct CacheEntry {
    value: Value,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Shared {
    cache: Mutex<HashMap<CacheKey, CacheEntry>>,
    in_flight: Mutex<HashMap<CacheKey, Vec<Sender<Outcome>>>>,
}

impl Shared {
    fn cached(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Value> {
        let mut guard = self.cache.lock().ok()?;
        match guard.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                // Lazy eviction on access.
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    fn complete(&self, key: CacheKey, ttl: Option<Duration>, now: DateTime<Utc>, outcome: Outcome) {
        if let (Ok(value), Some(ttl)) = (&outcome, ttl) {
            if let Ok(mut guard) = self.cache.lock() {
                guard.insert(
                    key,
                    CacheEntry {
                        value: value.clone(),
                        expires_at: now
                            + chrono::Duration::from_std(ttl)
                                .unwrap_or_else(|_| chrono::Duration::zero()),
                    },
                );
            }
        }

        let waiters = self
            .in_flight
            .lock()
            .ok()
            .and_then(|mut guard| guard.remove(&key))
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

enum Job {
    /// Cached, single-flight resolution.
    Resolve {
        key: CacheKey,
        service: String,
        method: String,
        args: Vec<Value>,
        ttl: Option<Duration>,
    },

    /// Direct invocation (no cache, no single-flight) for `call_service`.
    Invoke {
        service: String,
        method: String,
        args: Vec<Value>,
        reply: Sender<Outcome>,
    },
}

/// Resolves data requirements against the service registry.
pub struct LookupResolver {
    registry: Arc<ServiceRegistry>,
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,
    timeout: Duration,
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl LookupResolver {
    /// Spawns the worker pool.
    #[must_use]
    pub fn new(
        registry: Arc<ServiceRegistry>,
        clock: Arc<dyn Clock>,
        workers: usize,
        timeout: Duration,
    ) -> Self {
        let workers = workers.max(1);
        let shared = Arc::new(Shared::default());
        let (tx, rx) = bounded::<Job>(workers * 64);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let registry = Arc::clone(&registry);
            let shared = Arc::clone(&shared);
            let clock = Arc::clone(&clock);
            let handle = thread::Builder::new()
                .name(format!("verdict-lookup-{idx}"))
                .spawn(move || worker_loop(&rx, &registry, &shared, &clock))
                .expect("failed to spawn verdict lookup worker");
            handles.push(handle);
        }

        Self {
            registry,
            clock,
            shared,
            timeout,
            tx,
            workers: handles,
        }
    }

    /// Fans out all requirements, waits for every result, and applies each
    /// requirement's failure policy.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::DataResolution` when a `fail` requirement
    /// errors or times out.
    pub fn resolve_all(&self, requirements: &[ResolvedLookup]) -> VerdictResult<Resolution> {
        enum Waiter {
            Cached(Value),
            Pending(Receiver<Outcome>),
        }

        let now = self.clock.now();
        let mut waiters = Vec::with_capacity(requirements.len());

        for req in requirements {
            let key = cache_key(&req.service, &req.method, &req.args);

            if let Some(value) = self.shared.cached(&key, now) {
                waiters.push(Waiter::Cached(value));
                continue;
            }

            let (reply_tx, reply_rx) = bounded::<Outcome>(1);
            let submit = {
                let mut guard = self
                    .shared
                    .in_flight
                    .lock()
                    .map_err(|_| VerdictError::internal("lookup in-flight lock poisoned"))?;
                match guard.get_mut(&key) {
                    Some(existing) => {
                        // Single-flight: join the request already underway.
                        existing.push(reply_tx);
                        false
                    }
                    None => {
                        guard.insert(key, vec![reply_tx]);
                        true
                    }
                }
            };

            if submit {
                let job = Job::Resolve {
                    key,
                    service: req.service.clone(),
                    method: req.method.clone(),
                    args: req.args.clone(),
                    ttl: req.ttl,
                };
                if self.tx.send(job).is_err() {
                    self.shared.complete(key, None, now, Err("lookup pool is shut down".to_string()));
                }
            }
            waiters.push(Waiter::Pending(reply_rx));
        }

        let deadline = Instant::now() + self.timeout;
        let mut resolution = Resolution::default();
        // Every requirement is awaited before a `fail` policy propagates, so
        // slow siblings still land in the cache for the next fire.
        let mut failure: Option<VerdictError> = None;

        for (req, waiter) in requirements.iter().zip(waiters) {
            let outcome = match waiter {
                Waiter::Cached(value) => Ok(value),
                Waiter::Pending(rx) => match rx.recv_deadline(deadline) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(reason)) => Err(reason),
                    Err(RecvTimeoutError::Timeout) => Err(format!(
                        "timed out after {}ms",
                        self.timeout.as_millis()
                    )),
                    Err(RecvTimeoutError::Disconnected) => {
                        Err("lookup worker disconnected".to_string())
                    }
                },
            };

            match outcome {
                Ok(value) => {
                    resolution.values.insert(req.name.clone(), value);
                }
                Err(reason) => match req.on_error {
                    OnError::Fail => {
                        failure.get_or_insert(VerdictError::Execution(
                            ExecutionError::DataResolution {
                                name: req.name.clone(),
                                reason,
                            },
                        ));
                    }
                    OnError::Skip => {
                        resolution.skipped.push(req.name.clone());
                    }
                },
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(resolution),
        }
    }

    /// Invokes a service method directly (used by `call_service` actions).
    ///
    /// Never cached and never single-flighted: distinct invocations may have
    /// side effects.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::ServiceCall` on failure or timeout.
    pub fn invoke(&self, service: &str, method: &str, args: Vec<Value>) -> VerdictResult<Value> {
        let fail = |reason: String| {
            VerdictError::Execution(ExecutionError::ServiceCall {
                service: service.to_string(),
                method: method.to_string(),
                reason,
            })
        };

        if !self.registry.contains(service) {
            return Err(VerdictError::Execution(ExecutionError::ServiceNotFound {
                service: service.to_string(),
            }));
        }

        let (reply_tx, reply_rx) = bounded::<Outcome>(1);
        self.tx
            .send(Job::Invoke {
                service: service.to_string(),
                method: method.to_string(),
                args,
                reply: reply_tx,
            })
            .map_err(|_| fail("lookup pool is shut down".to_string()))?;

        match reply_rx.recv_timeout(self.timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(fail(reason)),
            Err(RecvTimeoutError::Timeout) => {
                Err(fail(format!("timed out after {}ms", self.timeout.as_millis())))
            }
            Err(RecvTimeoutError::Disconnected) => Err(fail("worker disconnected".to_string())),
        }
    }

    /// The service registry backing this resolver.
    #[must_use]
    pub fn registry(&self) -> Arc<ServiceRegistry> {
        Arc::clone(&self.registry)
    }

    /// Proactively evicts expired cache entries.
    pub fn sweep_cache(&self) {
        let now = self.clock.now();
        if let Ok(mut guard) = self.shared.cache.lock() {
            guard.retain(|_, entry| entry.expires_at > now);
        }
    }

    /// Number of live cache entries.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.shared.cache.lock().map(|g| g.len()).unwrap_or(0)
    }
}

impl Drop for LookupResolver {
    fn drop(&mut self) {
        // Close the channel so idle workers exit.
        let (dummy_tx, _) = bounded::<Job>(1);
        drop(std::mem::replace(&mut self.tx, dummy_tx));

        // Do not join: a worker may be blocked inside a service call and the
        // engine's stop contract abandons in-flight lookups after its grace
        // period. Detached workers exit once their current call returns.
        for handle in self.workers.drain(..) {
            drop(handle);
        }
    }
}

fn worker_loop(
    rx: &Receiver<Job>,
    registry: &Arc<ServiceRegistry>,
    shared: &Arc<Shared>,
    clock: &Arc<dyn Clock>,
) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Resolve {
                key,
                service,
                method,
                args,
                ttl,
            } => {
                let outcome = call(registry, &service, &method, &args);
                if outcome.is_err() {
                    warn!(%service, %method, "lookup resolution failed");
                }
                shared.complete(key, ttl, clock.now(), outcome);
            }
            Job::Invoke {
                service,
                method,
                args,
                reply,
            } => {
                let _ = reply.send(call(registry, &service, &method, &args));
            }
        }
    }
}

fn call(registry: &ServiceRegistry, service: &str, method: &str, args: &[Value]) -> Outcome {
    match registry.get(service) {
        Some(svc) => svc.call(method, args).map_err(|e| e.to_string()),
        None => Err(format!("service not registered: {service}")),
    }
}
