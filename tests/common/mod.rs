// tests/common/mod.rs
#![allow(dead_code)]

use crossbeam_channel::{Receiver, Sender};
use office_engine::{EngineConfig, ProcessCallback, ProcessOutcome};
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(20);

pub fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.office.close_timeout_ms = 5_000;
    config.teams.stop_timeout_ms = 2_000;
    config.teams.pool_size = 4;
    config
}

/// Collects process outcomes delivered through completion callbacks
pub struct Outcomes {
    sender: Sender<ProcessOutcome>,
    receiver: Receiver<ProcessOutcome>,
}

impl Outcomes {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    pub fn callback(&self) -> Option<ProcessCallback> {
        let sender = self.sender.clone();
        Some(Box::new(move |outcome| {
            let _ = sender.send(outcome);
        }))
    }

    /// Wait for exactly `count` outcomes
    pub fn collect(&self, count: usize) -> Vec<ProcessOutcome> {
        let deadline = Instant::now() + WAIT;
        (0..count)
            .map(|_| {
                self.receiver
                    .recv_deadline(deadline)
                    .expect("process did not complete in time")
            })
            .collect()
    }

    pub fn next(&self) -> ProcessOutcome {
        self.collect(1).remove(0)
    }

    pub fn is_drained(&self) -> bool {
        self.receiver.is_empty()
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
