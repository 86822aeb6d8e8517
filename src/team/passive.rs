// src/team/passive.rs
//! Team that borrows the submitting thread
//!
//! Jobs run inline on whichever thread submits them. Jobs submitted while
//! one is already running on that thread are queued and run after it
//! returns, so long continuation chains never deepen the stack.

use crate::escalation::Escalation;
use crate::job::Job;
use crate::team::worker;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

thread_local! {
    static TRAMPOLINE: RefCell<Option<VecDeque<Job>>> = const { RefCell::new(None) };
}

/// Clears the trampoline when the outermost drain ends, even on unwind
struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let leftover = TRAMPOLINE.try_with(|queue| queue.borrow_mut().take()).ok().flatten();
        // jobs dropped here cancel themselves
        drop(leftover);
    }
}

pub struct PassiveTeam {
    name: String,
    running: AtomicBool,
}

impl PassiveTeam {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub fn stop(&self) -> bool {
        self.running.store(false, Ordering::Release);
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn submit(&self, job: Job) {
        if !self.is_running() {
            job.cancel(Escalation::TeamStopped {
                team: self.name.clone(),
            });
            return;
        }

        let first = TRAMPOLINE
            .try_with(|queue| {
                let mut queue = queue.borrow_mut();
                match queue.as_mut() {
                    Some(pending) => {
                        pending.push_back(job);
                        None
                    }
                    None => {
                        *queue = Some(VecDeque::new());
                        Some(job)
                    }
                }
            })
            .ok()
            .flatten();

        let Some(first) = first else {
            return;
        };

        let _guard = DrainGuard;
        let _scope = worker::enter(&self.name);
        worker::run_job(first);
        while let Some(next) = TRAMPOLINE
            .try_with(|queue| queue.borrow_mut().as_mut().and_then(VecDeque::pop_front))
            .ok()
            .flatten()
        {
            worker::run_job(next);
        }
    }
}
