use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use verdict::{
    service_fn, Action, CacheSpec, Condition, ConditionSource, DurationMs, Engine, EngineConfig,
    Lookup, Map, OnError, Operator, Rule, ServiceError, Value,
};

fn spy_service(calls: Arc<AtomicU64>, delay: Duration) -> Arc<dyn verdict::Service> {
    service_fn(move |method, args| {
        calls.fetch_add(1, Ordering::SeqCst);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        match method {
            "get" => Ok(Value::from(format!(
                "v:{}",
                args.first().map(Value::coerce_string).unwrap_or_default()
            ))),
            "boom" => Err(ServiceError::failed("kaput")),
            other => Err(ServiceError::UnknownMethod {
                method: other.to_string(),
            }),
        }
    })
}

fn lookup(name: &str, method: &str, on_error: OnError) -> Lookup {
    Lookup {
        name: name.to_string(),
        service: "svc".to_string(),
        method: method.to_string(),
        args: vec![Value::from("k")],
        cache: Some(CacheSpec {
            ttl: DurationMs::parse("1m").unwrap(),
        }),
        on_error,
    }
}

#[test]
fn identical_lookups_share_one_service_call() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let calls = Arc::new(AtomicU64::new(0));
    engine
        .register_service("svc", spy_service(Arc::clone(&calls), Duration::from_millis(50)))
        .unwrap();

    // Two rules, same tick, same (service, method, args) cache key.
    for id in ["first", "second"] {
        engine
            .register_rule(
                Rule::builder(id)
                    .on_event("tick")
                    .lookup(lookup("user", "get", OnError::Skip))
                    .action(Action::SetFact {
                        key: format!("seen:{id}"),
                        value: Value::reference("lookups.user"),
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
    }

    engine.emit("tick", Map::new()).unwrap();

    assert_eq!(
        engine.get_fact("seen:first").unwrap(),
        Some(Value::from("v:k"))
    );
    assert_eq!(
        engine.get_fact("seen:second").unwrap(),
        Some(Value::from("v:k"))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    engine.stop();
}

#[test]
fn lookup_results_feed_conditions() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let calls = Arc::new(AtomicU64::new(0));
    engine
        .register_service("svc", spy_service(calls, Duration::ZERO))
        .unwrap();

    engine
        .register_rule(
            Rule::builder("gated")
                .on_event("tick")
                .lookup(lookup("user", "get", OnError::Skip))
                .condition(Condition::new(
                    ConditionSource::Lookup {
                        name: "user".to_string(),
                        field: None,
                    },
                    Operator::Eq,
                    Value::from("v:k"),
                ))
                .action(Action::SetFact {
                    key: "gated:ok".to_string(),
                    value: Value::Bool(true),
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    engine.emit("tick", Map::new()).unwrap();
    assert_eq!(
        engine.get_fact("gated:ok").unwrap(),
        Some(Value::Bool(true))
    );

    engine.stop();
}

#[test]
fn skip_policy_drops_the_fire() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let calls = Arc::new(AtomicU64::new(0));
    engine
        .register_service("svc", spy_service(calls, Duration::ZERO))
        .unwrap();

    engine
        .register_rule(
            Rule::builder("skipper")
                .on_event("tick")
                .lookup(lookup("bad", "boom", OnError::Skip))
                .action(Action::SetFact {
                    key: "skipper:fired".to_string(),
                    value: Value::Bool(true),
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    engine.emit("tick", Map::new()).unwrap();

    assert_eq!(engine.get_fact("skipper:fired").unwrap(), None);
    let stats = engine.stats().unwrap();
    assert_eq!(stats.rules_skipped, 1);
    assert_eq!(stats.rules_failed, 0);

    engine.stop();
}

#[test]
fn fail_policy_surfaces_rule_failure() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let calls = Arc::new(AtomicU64::new(0));
    engine
        .register_service("svc", spy_service(calls, Duration::ZERO))
        .unwrap();

    engine
        .register_rule(
            Rule::builder("failer")
                .on_event("tick")
                .lookup(lookup("bad", "boom", OnError::Fail))
                .action(Action::SetFact {
                    key: "failer:fired".to_string(),
                    value: Value::Bool(true),
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    let failures = engine.subscribe_stream("rule_failed").unwrap();
    engine.emit("tick", Map::new()).unwrap();

    let failure = failures.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(failure.data.get("rule_id"), Some(&Value::from("failer")));
    assert_eq!(
        failure.data.get("error_kind"),
        Some(&Value::from("data_resolution"))
    );
    assert_eq!(engine.get_fact("failer:fired").unwrap(), None);
    assert_eq!(engine.stats().unwrap().rules_failed, 1);

    engine.stop();
}

#[test]
fn call_service_action_invokes_without_caching() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let calls = Arc::new(AtomicU64::new(0));
    engine
        .register_service("svc", spy_service(Arc::clone(&calls), Duration::ZERO))
        .unwrap();

    engine
        .register_rule(
            Rule::builder("caller")
                .on_event("tick")
                .action(Action::CallService {
                    service: "svc".to_string(),
                    method: "get".to_string(),
                    args: vec![Value::reference("event.id")],
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    engine.emit("tick", Map::new()).unwrap();
    engine.emit("tick", Map::new()).unwrap();
    let stats = engine.stats().unwrap();
    assert_eq!(stats.rules_executed, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2, "call_service is never cached");

    engine.stop();
}

#[test]
fn failed_service_call_aborts_remaining_actions() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let calls = Arc::new(AtomicU64::new(0));
    engine
        .register_service("svc", spy_service(calls, Duration::ZERO))
        .unwrap();

    engine
        .register_rule(
            Rule::builder("partial")
                .on_event("tick")
                .action(Action::SetFact {
                    key: "partial:before".to_string(),
                    value: Value::Bool(true),
                })
                .action(Action::CallService {
                    service: "svc".to_string(),
                    method: "boom".to_string(),
                    args: vec![],
                })
                .action(Action::SetFact {
                    key: "partial:after".to_string(),
                    value: Value::Bool(true),
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    engine.emit("tick", Map::new()).unwrap();

    // Applied prior actions are not rolled back; later ones never run.
    assert_eq!(
        engine.get_fact("partial:before").unwrap(),
        Some(Value::Bool(true))
    );
    assert_eq!(engine.get_fact("partial:after").unwrap(), None);
    assert_eq!(engine.stats().unwrap().rules_failed, 1);

    engine.stop();
}

#[test]
fn unknown_service_is_a_service_not_found_failure() {
    let engine = Engine::start(EngineConfig::default()).unwrap();

    engine
        .register_rule(
            Rule::builder("ghost-caller")
                .on_event("tick")
                .action(Action::CallService {
                    service: "ghost".to_string(),
                    method: "get".to_string(),
                    args: vec![],
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    let failures = engine.subscribe_stream("rule_failed").unwrap();
    engine.emit("tick", Map::new()).unwrap();

    let failure = failures.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(
        failure.data.get("error_kind"),
        Some(&Value::from("action_failed"))
    );

    engine.stop();
}
