use std::sync::Arc;
use std::time::Duration;

use verdict::{
    Action, AggregateFn, Comparison, DurationMs, Engine, EngineClock, EngineConfig, EventMatcher,
    ManualClock, Map, OnExpire, Rule, TemporalPattern, TimerConfig, TimerSchedule, Value,
};

fn start_manual() -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let config = EngineConfig {
        clock: EngineClock::Manual(Arc::clone(&clock)),
        ..EngineConfig::default()
    };
    (Engine::start(config).unwrap(), clock)
}

fn data(entries: &[(&str, Value)]) -> Map {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn advance(engine: &Engine, secs: u64) {
    engine.advance_clock(Duration::from_secs(secs)).unwrap();
}

#[test]
fn sequence_completes_once_per_matched_pair() {
    let (engine, _clock) = start_manual();

    engine
        .register_rule(
            Rule::builder("order-paid")
                .on_temporal(TemporalPattern::Sequence {
                    events: vec![
                        EventMatcher::topic("order.created").with_alias("order"),
                        EventMatcher::topic("payment.received").with_alias("payment"),
                    ],
                    within: DurationMs::parse("5m").unwrap(),
                    group_by: Some("orderId".to_string()),
                    strict: false,
                })
                .action(Action::SetFact {
                    key: "paid:${event.orderId}".to_string(),
                    value: Value::reference("order.orderId"),
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    engine
        .emit("order.created", data(&[("orderId", Value::from("A"))]))
        .unwrap();
    advance(&engine, 30);
    engine
        .emit("payment.received", data(&[("orderId", Value::from("A"))]))
        .unwrap();

    assert_eq!(engine.get_fact("paid:A").unwrap(), Some(Value::from("A")));
    assert_eq!(engine.stats().unwrap().temporal_completions, 1);

    // A repeated first event alone does not re-fire.
    engine
        .emit("order.created", data(&[("orderId", Value::from("A"))]))
        .unwrap();
    assert_eq!(engine.stats().unwrap().temporal_completions, 1);
    assert_eq!(engine.get_fact_full("paid:A").unwrap().unwrap().version, 1);

    engine.stop();
}

#[test]
fn sequence_window_expiry_prevents_completion() {
    let (engine, _clock) = start_manual();

    engine
        .register_rule(
            Rule::builder("slow-pair")
                .on_temporal(TemporalPattern::Sequence {
                    events: vec![
                        EventMatcher::topic("order.created"),
                        EventMatcher::topic("payment.received"),
                    ],
                    within: DurationMs::parse("5m").unwrap(),
                    group_by: Some("orderId".to_string()),
                    strict: false,
                })
                .action(Action::SetFact {
                    key: "slow:done".to_string(),
                    value: Value::Bool(true),
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    engine
        .emit("order.created", data(&[("orderId", Value::from("X"))]))
        .unwrap();
    advance(&engine, 301);
    engine
        .emit("payment.received", data(&[("orderId", Value::from("X"))]))
        .unwrap();

    assert_eq!(engine.get_fact("slow:done").unwrap(), None);
    engine.stop();
}

#[test]
fn absence_fires_exactly_once_after_deadline() {
    let (engine, _clock) = start_manual();

    engine
        .register_rule(
            Rule::builder("payment-late")
                .on_temporal(TemporalPattern::Absence {
                    after: EventMatcher::topic("order.created"),
                    expected: EventMatcher::topic("payment.received"),
                    within: DurationMs::parse("10m").unwrap(),
                    group_by: Some("orderId".to_string()),
                })
                .action(Action::SetFact {
                    key: "late:${event.orderId}".to_string(),
                    value: Value::Bool(true),
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    engine
        .emit("order.created", data(&[("orderId", Value::from("B"))]))
        .unwrap();
    advance(&engine, 11 * 60);

    assert_eq!(engine.get_fact("late:B").unwrap(), Some(Value::Bool(true)));
    assert_eq!(engine.stats().unwrap().temporal_completions, 1);

    // Deadline fires once; more time does not re-fire.
    advance(&engine, 11 * 60);
    assert_eq!(engine.stats().unwrap().temporal_completions, 1);

    engine.stop();
}

#[test]
fn absence_cancelled_by_expected_event() {
    let (engine, _clock) = start_manual();

    engine
        .register_rule(
            Rule::builder("payment-late")
                .on_temporal(TemporalPattern::Absence {
                    after: EventMatcher::topic("order.created"),
                    expected: EventMatcher::topic("payment.received"),
                    within: DurationMs::parse("10m").unwrap(),
                    group_by: Some("orderId".to_string()),
                })
                .action(Action::SetFact {
                    key: "late:${event.orderId}".to_string(),
                    value: Value::Bool(true),
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    engine
        .emit("order.created", data(&[("orderId", Value::from("B"))]))
        .unwrap();
    advance(&engine, 5 * 60);
    engine
        .emit("payment.received", data(&[("orderId", Value::from("B"))]))
        .unwrap();
    advance(&engine, 20 * 60);

    assert_eq!(engine.get_fact("late:B").unwrap(), None);
    assert_eq!(engine.stats().unwrap().temporal_completions, 0);

    engine.stop();
}

#[test]
fn sliding_count_debounces_above_threshold() {
    let (engine, _clock) = start_manual();

    engine
        .register_rule(
            Rule::builder("brute-force")
                .on_temporal(TemporalPattern::Count {
                    event: EventMatcher::topic("auth.login_failed"),
                    threshold: 3,
                    comparison: Comparison::Gte,
                    window: DurationMs::parse("1m").unwrap(),
                    group_by: Some("userId".to_string()),
                    sliding: true,
                })
                .action(Action::EmitEvent {
                    topic: "auth.lockout".to_string(),
                    data: data(&[("userId", Value::reference("event.userId"))]),
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    let lockouts = engine.subscribe_stream("auth.lockout").unwrap();

    for _ in 0..5 {
        engine
            .emit("auth.login_failed", data(&[("userId", Value::from("u1"))]))
            .unwrap();
        advance(&engine, 10);
    }

    let lockout = lockouts.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(lockout.data.get("userId"), Some(&Value::from("u1")));

    // Above-threshold re-satisfactions do not re-emit.
    assert_eq!(engine.stats().unwrap().temporal_completions, 1);
    assert!(lockouts.try_recv().is_none());

    // Partitions are independent.
    for _ in 0..3 {
        engine
            .emit("auth.login_failed", data(&[("userId", Value::from("u2"))]))
            .unwrap();
    }
    let second = lockouts.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(second.data.get("userId"), Some(&Value::from("u2")));

    engine.stop();
}

#[test]
fn aggregate_exposes_value_to_actions() {
    let (engine, _clock) = start_manual();

    engine
        .register_rule(
            Rule::builder("spend-watch")
                .on_temporal(TemporalPattern::Aggregate {
                    event: EventMatcher::topic("order.created"),
                    field: "amount".to_string(),
                    function: AggregateFn::Sum,
                    threshold: 100.0,
                    comparison: Comparison::Gte,
                    window: DurationMs::parse("1h").unwrap(),
                    group_by: Some("userId".to_string()),
                })
                .action(Action::SetFact {
                    key: "spend:${event.userId}".to_string(),
                    value: Value::reference("aggregate.value"),
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    engine
        .emit(
            "order.created",
            data(&[("userId", Value::from("u1")), ("amount", Value::Int(60))]),
        )
        .unwrap();
    advance(&engine, 10);
    engine
        .emit(
            "order.created",
            data(&[("userId", Value::from("u1")), ("amount", Value::Int(50))]),
        )
        .unwrap();

    assert_eq!(
        engine.get_fact("spend:u1").unwrap(),
        Some(Value::Float(110.0))
    );
    engine.stop();
}

#[test]
fn one_shot_timer_fires_and_triggers_rules() {
    let (engine, _clock) = start_manual();

    engine
        .register_rule(
            Rule::builder("on-retry")
                .on_timer("retry.*")
                .action(Action::SetFact {
                    key: "retry:fired".to_string(),
                    value: Value::reference("event.attempt"),
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    engine
        .set_timer(TimerConfig {
            name: "retry.order".to_string(),
            on_expire: OnExpire {
                topic: "retry.due".to_string(),
                data: data(&[("attempt", Value::Int(1))]),
            },
            schedule: TimerSchedule::Once {
                duration: DurationMs::parse("5s").unwrap(),
            },
        })
        .unwrap();

    let expirations = engine.subscribe_stream("retry.due").unwrap();

    advance(&engine, 4);
    assert_eq!(engine.get_fact("retry:fired").unwrap(), None);

    advance(&engine, 2);
    assert_eq!(
        engine.get_fact("retry:fired").unwrap(),
        Some(Value::Int(1))
    );
    // The on_expire topic is also published as a real event.
    let event = expirations.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.source, "timer");
    assert_eq!(engine.stats().unwrap().timers_fired, 1);
    assert!(engine.get_timers().unwrap().is_empty());

    engine.stop();
}

#[test]
fn set_timer_with_same_name_replaces() {
    let (engine, _clock) = start_manual();

    let mk = |secs: u64, marker: i64| TimerConfig {
        name: "debounce".to_string(),
        on_expire: OnExpire {
            topic: "debounce.done".to_string(),
            data: data(&[("marker", Value::Int(marker))]),
        },
        schedule: TimerSchedule::Once {
            duration: DurationMs::from_secs(secs),
        },
    };

    engine.set_timer(mk(5, 1)).unwrap();
    engine.set_timer(mk(30, 2)).unwrap();
    assert_eq!(engine.get_timers().unwrap().len(), 1);

    let done = engine.subscribe_stream("debounce.done").unwrap();

    // The replaced 5s deadline must not fire.
    advance(&engine, 10);
    assert_eq!(engine.stats().unwrap().timers_fired, 0);

    advance(&engine, 25);
    let event = done.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.data.get("marker"), Some(&Value::Int(2)));

    engine.stop();
}

#[test]
fn repeating_timer_stops_at_max_count() {
    let (engine, _clock) = start_manual();

    engine
        .set_timer(TimerConfig {
            name: "beat".to_string(),
            on_expire: OnExpire {
                topic: "beat.tick".to_string(),
                data: Map::new(),
            },
            schedule: TimerSchedule::Repeat {
                interval: DurationMs::from_secs(60),
                max_count: Some(3),
            },
        })
        .unwrap();

    for _ in 0..6 {
        advance(&engine, 60);
    }

    assert_eq!(engine.stats().unwrap().timers_fired, 3);
    assert!(engine.get_timers().unwrap().is_empty());

    engine.stop();
}

#[test]
fn cancel_timer_prevents_firing() {
    let (engine, _clock) = start_manual();

    engine
        .set_timer(TimerConfig {
            name: "doomed".to_string(),
            on_expire: OnExpire {
                topic: "doomed.fire".to_string(),
                data: Map::new(),
            },
            schedule: TimerSchedule::Once {
                duration: DurationMs::from_secs(5),
            },
        })
        .unwrap();

    assert!(engine.cancel_timer("doomed").unwrap());
    assert!(!engine.cancel_timer("doomed").unwrap());

    advance(&engine, 60);
    assert_eq!(engine.stats().unwrap().timers_fired, 0);

    engine.stop();
}

#[test]
fn rule_actions_can_arm_and_cancel_timers() {
    let (engine, _clock) = start_manual();

    engine
        .register_rule(
            Rule::builder("arm-followup")
                .on_event("order.created")
                .action(Action::SetTimer {
                    timer: TimerConfig {
                        name: "followup.${event.orderId}".to_string(),
                        on_expire: OnExpire {
                            topic: "order.followup".to_string(),
                            data: data(&[("orderId", Value::reference("event.orderId"))]),
                        },
                        schedule: TimerSchedule::Once {
                            duration: DurationMs::parse("1m").unwrap(),
                        },
                    },
                })
                .build()
                .unwrap(),
        )
        .unwrap();
    engine
        .register_rule(
            Rule::builder("disarm-on-payment")
                .on_event("payment.received")
                .action(Action::CancelTimer {
                    name: "followup.${event.orderId}".to_string(),
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    // Order A pays in time; order B does not.
    engine
        .emit("order.created", data(&[("orderId", Value::from("A"))]))
        .unwrap();
    engine
        .emit("order.created", data(&[("orderId", Value::from("B"))]))
        .unwrap();
    assert_eq!(engine.get_timers().unwrap().len(), 2);

    engine
        .emit("payment.received", data(&[("orderId", Value::from("A"))]))
        .unwrap();
    assert_eq!(engine.get_timers().unwrap().len(), 1);

    let followups = engine.subscribe_stream("order.followup").unwrap();
    advance(&engine, 61);
    let event = followups.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.data.get("orderId"), Some(&Value::from("B")));
    assert!(followups.try_recv().is_none());

    engine.stop();
}
