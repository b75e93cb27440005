//! External service registry.
//!
//! Services back both `call_service` actions and data lookups. A service is a
//! single-method interface so long-lived registrations do not capture call
//! sites; closures get a blanket adapter via [`service_fn`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::value::Value;

/// Errors produced by service implementations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The method is not exposed by this service.
    #[error("Unknown method: {method}")]
    UnknownMethod {
        /// Requested method.
        method: String,
    },

    /// The call failed.
    #[error("{message}")]
    Failed {
        /// Failure detail.
        message: String,
    },
}

impl ServiceError {
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// An invokable external service. Calls may block.
pub trait Service: Send + Sync {
    /// Invokes a method with positional arguments.
    fn call(&self, method: &str, args: &[Value]) -> Result<Value, ServiceError>;
}

struct FnService<F>(F);

impl<F> Service for FnService<F>
where
    F: Fn(&str, &[Value]) -> Result<Value, ServiceError> + Send + Sync,
{
    fn call(&self, method: &str, args: &[Value]) -> Result<Value, ServiceError> {
        (self.0)(method, args)
    }
}

/// Wraps a closure as a [`Service`].
pub fn service_fn<F>(f: F) -> Arc<dyn Service>
where
    F: Fn(&str, &[Value]) -> Result<Value, ServiceError> + Send + Sync + 'static,
{
    Arc::new(FnService(f))
}

/// Name-keyed registry of services.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a service.
    pub fn register(&self, name: impl Into<String>, service: Arc<dyn Service>) {
        if let Ok(mut guard) = self.services.write() {
            guard.insert(name.into(), service);
        }
    }

    /// Looks up a service by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.read().ok()?.get(name).map(Arc::clone)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.services
            .read()
            .map(|g| g.contains_key(name))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_fn_dispatches_methods() {
        let svc = service_fn(|method, args| match method {
            "echo" => Ok(args.first().cloned().unwrap_or(Value::Null)),
            other => Err(ServiceError::UnknownMethod {
                method: other.to_string(),
            }),
        });

        assert_eq!(svc.call("echo", &[Value::Int(7)]), Ok(Value::Int(7)));
        assert!(matches!(
            svc.call("nope", &[]),
            Err(ServiceError::UnknownMethod { .. })
        ));
    }

    #[test]
    fn test_registry_register_and_get() {
        let registry = ServiceRegistry::new();
        assert!(registry.get("users").is_none());

        registry.register("users", service_fn(|_, _| Ok(Value::Null)));
        assert!(registry.contains("users"));
        assert!(registry.get("users").is_some());
    }

    #[test]
    fn test_registry_replace() {
        let registry = ServiceRegistry::new();
        registry.register("svc", service_fn(|_, _| Ok(Value::Int(1))));
        registry.register("svc", service_fn(|_, _| Ok(Value::Int(2))));
        let svc = registry.get("svc").unwrap();
        assert_eq!(svc.call("any", &[]), Ok(Value::Int(2)));
    }
}
