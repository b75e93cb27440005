use std::sync::Arc;

use verdict::{
    Action, ChangeType, Engine, EngineConfig, Map, MemoryAdapter, Rule, StorageAdapter, Value,
};

fn flag_rule(priority: f64) -> Rule {
    Rule::builder("flagger")
        .name("Flag orders")
        .priority(priority)
        .on_event("order.created")
        .action(Action::SetFact {
            key: "order:flagged".to_string(),
            value: Value::Bool(true),
        })
        .build()
        .unwrap()
}

#[test]
fn rollback_restores_prior_version() {
    let engine = Engine::start(EngineConfig::default()).unwrap();

    let registered = engine.register_rule(flag_rule(10.0)).unwrap();
    assert_eq!(registered.version, 1);

    let mut updated = registered.clone();
    updated.priority = 50.0;
    let updated = engine.update_rule(updated).unwrap();
    assert_eq!(updated.version, 2);
    assert_eq!(updated.created_at, registered.created_at);

    let rolled_back = engine.rollback_rule("flagger", 1).unwrap();
    assert_eq!(rolled_back.priority, 10.0);
    assert_eq!(rolled_back.version, 3);
    assert_eq!(engine.get_rule("flagger").unwrap().priority, 10.0);

    let history = engine.version_history("flagger").unwrap();
    let changes: Vec<ChangeType> = history.iter().map(|e| e.change_type).collect();
    assert_eq!(
        changes,
        vec![
            ChangeType::Registered,
            ChangeType::Updated,
            ChangeType::RolledBack
        ]
    );
    assert_eq!(history[0].snapshot.priority, 10.0);
    assert_eq!(history[1].snapshot.priority, 50.0);

    engine.stop();
}

#[test]
fn rollback_to_unknown_version_fails() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    engine.register_rule(flag_rule(10.0)).unwrap();

    assert_eq!(
        engine.rollback_rule("flagger", 9).unwrap_err().kind(),
        "version_not_found"
    );
    assert_eq!(
        engine.rollback_rule("ghost", 1).unwrap_err().kind(),
        "rule_not_found"
    );

    engine.stop();
}

#[test]
fn enable_disable_recorded_in_history() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    engine.register_rule(flag_rule(10.0)).unwrap();

    engine.disable_rule("flagger").unwrap();
    engine.enable_rule("flagger").unwrap();
    // Idempotent repeat adds no entry.
    engine.enable_rule("flagger").unwrap();

    let changes: Vec<ChangeType> = engine
        .version_history("flagger")
        .unwrap()
        .iter()
        .map(|e| e.change_type)
        .collect();
    assert_eq!(
        changes,
        vec![
            ChangeType::Registered,
            ChangeType::Disabled,
            ChangeType::Enabled
        ]
    );

    engine.stop();
}

#[test]
fn state_round_trips_across_restart() {
    let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryAdapter::new());

    {
        let engine = Engine::start(EngineConfig {
            storage: Some(Arc::clone(&adapter)),
            ..EngineConfig::default()
        })
        .unwrap();

        engine.register_rule(flag_rule(10.0)).unwrap();
        engine.set_fact("user:1:age", Value::Int(30)).unwrap();
        engine.emit("order.created", Map::new()).unwrap();
        assert_eq!(
            engine.get_fact("order:flagged").unwrap(),
            Some(Value::Bool(true))
        );

        // stop() performs the final flush.
        engine.stop();
    }

    assert!(adapter.exists("facts").unwrap());
    assert!(adapter.exists("rules").unwrap());
    assert!(adapter.exists("rule-version:flagger").unwrap());

    let engine = Engine::start(EngineConfig {
        storage: Some(Arc::clone(&adapter)),
        ..EngineConfig::default()
    })
    .unwrap();

    // Facts, rules and histories survive the restart.
    assert_eq!(engine.get_fact("user:1:age").unwrap(), Some(Value::Int(30)));
    let rule = engine.get_rule("flagger").unwrap();
    assert_eq!(rule.priority, 10.0);
    assert_eq!(rule.version, 1);
    assert_eq!(engine.version_history("flagger").unwrap().len(), 1);

    // The reloaded rule still fires.
    engine.delete_fact("order:flagged").unwrap();
    engine.emit("order.created", Map::new()).unwrap();
    assert_eq!(
        engine.get_fact("order:flagged").unwrap(),
        Some(Value::Bool(true))
    );

    engine.stop();
}

#[test]
fn audit_buckets_persist_on_flush() {
    let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryAdapter::new());
    let engine = Engine::start(EngineConfig {
        storage: Some(Arc::clone(&adapter)),
        ..EngineConfig::default()
    })
    .unwrap();

    engine.set_fact("user:1:age", Value::Int(30)).unwrap();
    engine.flush().unwrap();

    let keys = adapter.list_keys(Some("audit:fact:")).unwrap();
    assert_eq!(keys.len(), 1);

    engine.stop();
}
