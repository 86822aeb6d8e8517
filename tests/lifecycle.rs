// tests/lifecycle.rs
//! Office lifecycle, linking failures and the input gateway

mod common;

use common::{config, Outcomes};
use office_engine::{
    arg, EngineError, Escalation, FunctionSpec, Office, TeamKind, WiringTable,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn simple_office(counter: Arc<AtomicUsize>) -> Office {
    let wiring = WiringTable::new()
        .team("t", TeamKind::Pool { size: Some(2), max: None })
        .function("count", FunctionSpec::on("t"))
        .flow("count", "count");
    Office::builder(wiring)
        .config(config())
        .function("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .build()
        .unwrap()
}

#[test]
fn test_open_close_states() {
    let office = simple_office(Arc::default());
    assert!(!office.is_open());
    assert!(matches!(
        office.invoke_process("count", None, None, None),
        Err(EngineError::NotOpen)
    ));

    office.open().unwrap();
    assert!(office.is_open());
    assert!(matches!(office.open(), Err(EngineError::AlreadyOpen)));

    let report = office.close();
    assert_eq!(report.forced, 0);
    assert!(report.teams_stopped_cleanly);
    assert!(!office.is_open());
    assert!(matches!(
        office.invoke_and_wait("count", None, None),
        Err(EngineError::ShuttingDown)
    ));

    // closing twice is harmless
    let again = office.close();
    assert_eq!(again.drained + again.forced, 0);
}

#[test]
fn test_reopen_after_close() {
    let counter = Arc::new(AtomicUsize::new(0));
    let office = simple_office(Arc::clone(&counter));

    for _ in 0..3 {
        office.open().unwrap();
        office.invoke_and_wait("count", None, None).unwrap();
        office.close();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(office.live_process_count(), 0);
}

#[test]
fn test_close_drains_in_flight_processes() {
    let counter = Arc::new(AtomicUsize::new(0));
    let wiring = WiringTable::new()
        .team("t", TeamKind::Pool { size: Some(2), max: None })
        .function("slow", FunctionSpec::on("t").next("count"))
        .function("count", FunctionSpec::on("t"))
        .flow("go", "slow");
    let done = Arc::clone(&counter);
    let office = Office::builder(wiring)
        .config(config())
        .function("slow", |_| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        })
        .function("count", move |_| {
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .build()
        .unwrap();
    office.open().unwrap();

    let outcomes = Outcomes::new();
    for _ in 0..8 {
        office
            .invoke_process("go", None, None, outcomes.callback())
            .unwrap();
    }
    let report = office.close();

    assert_eq!(report.forced, 0);
    assert_eq!(report.drained, 8);
    assert!(outcomes.collect(8).iter().all(|o| o.is_ok()));
    assert_eq!(counter.load(Ordering::SeqCst), 8);
}

#[test]
fn test_close_forces_stuck_processes() {
    let (gate_tx, gate_rx) = crossbeam_channel::unbounded::<()>();
    let mut config = config();
    config.office.close_timeout_ms = 100;
    config.teams.stop_timeout_ms = 100;
    let wiring = WiringTable::new()
        .team("stuck", TeamKind::Dedicated)
        .function("hang", FunctionSpec::on("stuck"))
        .flow("hang", "hang");
    let office = Office::builder(wiring)
        .config(config)
        .function("hang", move |_| {
            let _ = gate_rx.recv_timeout(Duration::from_secs(10));
            Ok(())
        })
        .build()
        .unwrap();
    office.open().unwrap();

    let outcomes = Outcomes::new();
    office
        .invoke_process("hang", None, None, outcomes.callback())
        .unwrap();
    // the lone worker has taken the job and is blocked in it
    assert!(common::wait_until(|| office.stats().teams[0].queued == 0));

    let report = office.close();
    assert_eq!(report.forced, 1);
    assert_eq!(report.drained, 0);
    assert!(!report.teams_stopped_cleanly);
    assert!(matches!(outcomes.next(), Err(Escalation::ShuttingDown)));
    assert_eq!(office.live_process_count(), 0);

    gate_tx.send(()).unwrap();
}

#[test]
fn test_unknown_flow_is_rejected() {
    let office = simple_office(Arc::default());
    office.open().unwrap();
    match office.invoke_process("missing", None, None, None) {
        Err(EngineError::UnknownFlow(flow)) => assert_eq!(flow, "missing"),
        other => panic!("expected unknown flow, got {:?}", other),
    }
    assert_eq!(office.stats().processes_started, 0);
    office.close();
}

#[test]
fn test_link_reports_every_problem() {
    let wiring = WiringTable::new()
        .team("t", TeamKind::Dedicated)
        .function("a", FunctionSpec::on("nowhere").next("ghost"))
        .function("b", FunctionSpec::on("t").depends_on("db", "database"))
        .flow("go", "a");
    let result = Office::builder(wiring)
        .config(config())
        .function("a", |_| Ok(()))
        .build();

    match result {
        Err(EngineError::Link(problems)) => {
            let all = problems.join("\n");
            assert!(all.contains("nowhere"), "{}", all);
            assert!(all.contains("ghost"), "{}", all);
            assert!(all.contains("database"), "{}", all);
            // `b` has no body
            assert!(all.contains("`b`"), "{}", all);
            assert!(problems.len() >= 4);
        }
        Err(other) => panic!("expected a link failure, got {}", other),
        Ok(_) => panic!("expected a link failure"),
    }
}

#[test]
fn test_wiring_loaded_from_yaml() {
    let yaml = r#"
teams:
  workers: { kind: pool, size: 2 }
functions:
  parse: { team: workers, next: store }
  store: { team: workers }
flows:
  ingest: parse
"#;
    let stored = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&stored);
    let office = Office::builder(WiringTable::from_yaml(yaml).unwrap())
        .config(config())
        .function("parse", |ctx| {
            let raw = ctx.parameter::<String>().cloned().unwrap_or_default();
            let value: usize = raw
                .trim()
                .parse()
                .map_err(|e| Escalation::raise("parse", e))?;
            ctx.set_next_parameter(arg(value));
            Ok(())
        })
        .function("store", move |ctx| {
            sink.fetch_add(ctx.parameter::<usize>().copied().unwrap_or(0), Ordering::SeqCst);
            Ok(())
        })
        .build()
        .unwrap();
    office.open().unwrap();

    office
        .invoke_and_wait("ingest", arg(" 40 ".to_string()), None)
        .unwrap();
    let err = office
        .invoke_and_wait("ingest", arg("forty".to_string()), None)
        .unwrap_err();
    assert!(matches!(err, EngineError::Escalated(ref e) if e.kind() == "parse"));
    assert_eq!(stored.load(Ordering::SeqCst), 40);
    office.close();
}

#[test]
fn test_gateway_is_safe_from_many_threads() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 50;
    let counter = Arc::new(AtomicUsize::new(0));
    let office = simple_office(Arc::clone(&counter));
    office.open().unwrap();

    let outcomes = Arc::new(Outcomes::new());
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let gateway = office.gateway();
            let outcomes = Arc::clone(&outcomes);
            std::thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    gateway
                        .invoke_process("count", None, None, outcomes.callback())
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(outcomes
        .collect(THREADS * PER_THREAD)
        .iter()
        .all(|o| o.is_ok()));
    assert_eq!(counter.load(Ordering::SeqCst), THREADS * PER_THREAD);
    let stats = office.stats();
    assert_eq!(stats.processes_started, (THREADS * PER_THREAD) as u64);
    assert_eq!(stats.processes_completed, (THREADS * PER_THREAD) as u64);
    office.close();
}

#[test]
fn test_input_sources_round_robin() {
    let hits = Arc::new(parking_lot::Mutex::new(Vec::<&'static str>::new()));
    let wiring = WiringTable::new()
        .team("t", TeamKind::Passive)
        .function("http", FunctionSpec::on("t"))
        .function("queue", FunctionSpec::on("t"))
        .flow("http", "http")
        .flow("queue", "queue");
    let (h1, h2) = (Arc::clone(&hits), Arc::clone(&hits));
    let office = Office::builder(wiring)
        .config(config())
        .input_source("web", "http")
        .input_source("jobs", "queue")
        .function("http", move |_| {
            h1.lock().push("http");
            Ok(())
        })
        .function("queue", move |_| {
            h2.lock().push("queue");
            Ok(())
        })
        .build()
        .unwrap();
    office.open().unwrap();

    let gateway = office.gateway();
    let sources = gateway.input_sources().clone();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources.get(1).map(|s| s.name.as_str()), Some("jobs"));

    let mut cursor = None;
    for _ in 0..4 {
        let index = sources.next_index(cursor).unwrap();
        gateway.invoke_source(index, None, None, None).unwrap();
        cursor = Some(index);
    }
    assert_eq!(*hits.lock(), ["http", "queue", "http", "queue"]);

    assert!(matches!(
        gateway.invoke_source(9, None, None, None),
        Err(EngineError::UnknownInputSource(9))
    ));
    office.close();
}

#[test]
fn test_input_source_with_unknown_flow_fails_to_link() {
    let wiring = WiringTable::new()
        .team("t", TeamKind::Passive)
        .function("f", FunctionSpec::on("t"))
        .flow("f", "f");
    let result = Office::builder(wiring)
        .config(config())
        .input_source("web", "not_a_flow")
        .function("f", |_| Ok(()))
        .build();
    assert!(matches!(result, Err(EngineError::Link(ref problems)) if problems.len() == 1));
}

#[tokio::test]
async fn test_invoke_async_resolves_with_the_outcome() {
    let wiring = WiringTable::new()
        .team("t", TeamKind::Pool { size: Some(2), max: None })
        .function("ok", FunctionSpec::on("t"))
        .function("bad", FunctionSpec::on("t"))
        .flow("ok", "ok")
        .flow("bad", "bad");
    let office = Office::builder(wiring)
        .config(config())
        .function("ok", |_| Ok(()))
        .function("bad", |_| Err(Escalation::msg("rejected", "no")))
        .build()
        .unwrap();
    office.open().unwrap();

    office.invoke_async("ok", None, None).await.unwrap();
    let err = office.invoke_async("bad", None, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Escalated(ref e) if e.kind() == "rejected"));

    // the process starts eagerly, before the future is polled
    let pending = office.invoke_async("ok", None, None);
    assert_eq!(office.stats().processes_started, 3);
    pending.await.unwrap();

    office.close();
    assert!(matches!(
        office.invoke_async("ok", None, None).await,
        Err(EngineError::ShuttingDown)
    ));
}
