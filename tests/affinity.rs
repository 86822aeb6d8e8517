// tests/affinity.rs
//! Thread affinity: chains resume on their origin thread across team hops

mod common;

use common::{config, Outcomes};
use office_engine::{
    EngineError, Escalation, FunctionContext, FunctionSpec, Office, TeamKind, WiringTable,
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

type Visits = Arc<Mutex<Vec<(&'static str, ThreadId)>>>;

fn visit(
    visits: &Visits,
    label: &'static str,
) -> impl Fn(&mut FunctionContext<'_>) -> Result<(), Escalation> + Send + Sync + 'static {
    let visits = Arc::clone(visits);
    move |_| {
        visits.lock().push((label, thread::current().id()));
        Ok(())
    }
}

fn round_trip_wiring() -> WiringTable {
    WiringTable::new()
        .team("ui", TeamKind::Affinity { lanes: Some(3) })
        .team("bg", TeamKind::Pool { size: Some(2), max: None })
        .function("ui_start", FunctionSpec::on("ui").next("work"))
        .function("work", FunctionSpec::on("bg").next("ui_end"))
        .function("ui_end", FunctionSpec::on("ui"))
        .flow("round_trip", "ui_start")
}

fn round_trip_office(visits: &Visits) -> Office {
    Office::builder(round_trip_wiring())
        .config(config())
        .function("ui_start", visit(visits, "ui_start"))
        .function("work", visit(visits, "work"))
        .function("ui_end", visit(visits, "ui_end"))
        .build()
        .unwrap()
}

#[test]
fn test_waiting_caller_serves_as_the_affinity_thread() {
    let visits: Visits = Arc::default();
    let office = round_trip_office(&visits);
    office.open().unwrap();

    office.invoke_and_wait("round_trip", None, None).unwrap();

    let caller = thread::current().id();
    let visits = visits.lock().clone();
    let labels: Vec<&str> = visits.iter().map(|(l, _)| *l).collect();
    assert_eq!(labels, ["ui_start", "work", "ui_end"]);
    assert_eq!(visits[0].1, caller);
    assert_ne!(visits[1].1, caller);
    assert_eq!(visits[2].1, caller);
    office.close();
}

#[test]
fn test_each_waiting_caller_keeps_its_own_chain() {
    let visits: Visits = Arc::default();
    let office = Arc::new(round_trip_office(&visits));
    office.open().unwrap();

    let callers: Vec<ThreadId> = (0..4)
        .map(|_| {
            let office = Arc::clone(&office);
            thread::spawn(move || {
                office.invoke_and_wait("round_trip", None, None).unwrap();
                thread::current().id()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    let visits = visits.lock();
    let ui_threads: Vec<ThreadId> = visits
        .iter()
        .filter(|(label, _)| label.starts_with("ui"))
        .map(|(_, thread)| *thread)
        .collect();
    assert_eq!(ui_threads.len(), 8);
    assert!(ui_threads.iter().all(|t| callers.contains(t)));
    for caller in &callers {
        assert_eq!(ui_threads.iter().filter(|t| *t == caller).count(), 2);
    }
    office.close();
}

type PerProcess = Arc<Mutex<HashMap<String, Vec<ThreadId>>>>;

fn pinned(
    per_process: &PerProcess,
) -> impl Fn(&mut FunctionContext<'_>) -> Result<(), Escalation> + Send + Sync + 'static {
    let per_process = Arc::clone(per_process);
    move |ctx| {
        assert!(ctx.context_token().is_some());
        per_process
            .lock()
            .entry(ctx.process_id().to_string())
            .or_default()
            .push(thread::current().id());
        Ok(())
    }
}

#[test]
fn test_fire_and_forget_process_is_pinned_to_one_lane() {
    const PROCESSES: usize = 12;
    let per_process: PerProcess = Arc::default();
    let wiring = WiringTable::new()
        .team("ui", TeamKind::Affinity { lanes: Some(3) })
        .team("bg", TeamKind::Pool { size: Some(3), max: None })
        .function("ui_a", FunctionSpec::on("ui").next("bg_a"))
        .function("bg_a", FunctionSpec::on("bg").next("ui_b"))
        .function("ui_b", FunctionSpec::on("ui").next("bg_b"))
        .function("bg_b", FunctionSpec::on("bg").next("ui_c"))
        .function("ui_c", FunctionSpec::on("ui"))
        .flow("go", "ui_a");

    let office = Office::builder(wiring)
        .config(config())
        .function("ui_a", pinned(&per_process))
        .function("ui_b", pinned(&per_process))
        .function("ui_c", pinned(&per_process))
        .function("bg_a", |_| Ok(()))
        .function("bg_b", |_| Ok(()))
        .build()
        .unwrap();
    office.open().unwrap();

    let outcomes = Outcomes::new();
    for _ in 0..PROCESSES {
        office
            .invoke_process("go", None, None, outcomes.callback())
            .unwrap();
    }
    assert!(outcomes.collect(PROCESSES).iter().all(|o| o.is_ok()));

    let per_process = per_process.lock();
    assert_eq!(per_process.len(), PROCESSES);
    let caller = thread::current().id();
    for threads in per_process.values() {
        assert_eq!(threads.len(), 3);
        assert!(threads.iter().all(|t| *t == threads[0]));
        assert_ne!(threads[0], caller);
    }
    office.close();
}

#[test]
fn test_blocking_wait_from_worker_is_rejected() {
    let handle: Arc<OnceCell<Weak<Office>>> = Arc::new(OnceCell::new());
    let observed = Arc::new(Mutex::new(None::<String>));
    let wiring = WiringTable::new()
        .team("t", TeamKind::Pool { size: Some(2), max: None })
        .function("nested", FunctionSpec::on("t"))
        .function("noop", FunctionSpec::on("t"))
        .flow("nested", "nested")
        .flow("noop", "noop");

    let (office_ref, sink) = (Arc::clone(&handle), Arc::clone(&observed));
    let office = Arc::new(
        Office::builder(wiring)
            .config(config())
            .function("nested", move |_| {
                let office = office_ref.get().and_then(Weak::upgrade);
                if let Some(office) = office {
                    let result = office.invoke_and_wait("noop", None, None);
                    *sink.lock() = Some(match result {
                        Err(EngineError::BlockingInWorker(worker)) => worker,
                        other => format!("unexpected: {:?}", other),
                    });
                }
                Ok(())
            })
            .function("noop", |_| Ok(()))
            .build()
            .unwrap(),
    );
    let _ = handle.set(Arc::downgrade(&office));
    office.open().unwrap();

    office.invoke_and_wait("nested", None, None).unwrap();
    let worker = observed.lock().clone().unwrap();
    assert!(worker.starts_with("t-"), "rejected on {}", worker);
    // no stray process was started by the rejected call
    assert_eq!(office.stats().processes_started, 1);
    office.close();
}
