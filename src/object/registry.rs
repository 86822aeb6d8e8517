// src/object/registry.rs
//! Per-process managed object registry
//!
//! One slot per linked object, each with its own lock, so unrelated parallel
//! flows of a process never serialize on a process-wide lock. Initialization
//! is lazy and double-checked: a settled slot is read lock-free through its
//! `OnceCell`; only the first reference takes the slot lock to start
//! sourcing. Jobs referencing a slot whose object is still becoming ready
//! park on the slot and are re-submitted to their team when it settles.

use crate::escalation::Escalation;
use crate::job::Job;
use crate::object::{
    source_guarded, AnyObject, LinkedObject, ObjectBinding, ObjectId, Readiness, SourceContext,
    Sourced,
};
use crate::process::ProcessState;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

enum SlotState {
    Vacant,
    Sourcing {
        waiters: Vec<Job>,
        /// The source answered `Pending`
        pending: bool,
        /// The readiness handle was dropped before `Pending` was seen
        abandoned: bool,
    },
    Settled,
    Released,
}

struct Slot {
    value: OnceCell<Result<AnyObject, Escalation>>,
    state: Mutex<SlotState>,
}

impl Slot {
    fn new() -> Self {
        Self {
            value: OnceCell::new(),
            state: Mutex::new(SlotState::Vacant),
        }
    }
}

/// Result of looking up a dependency for a job
pub(crate) enum Lookup {
    Ready(Job, AnyObject),
    /// The job was parked on the slot and will be re-submitted
    Parked,
    Failed(Job, Escalation),
}

/// Registry of a process's bound managed objects
pub struct ProcessObjects {
    slots: Box<[Slot]>,
}

impl ProcessObjects {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            slots: (0..count).map(|_| Slot::new()).collect(),
        }
    }

    /// Bind an externally supplied instance, e.g. an input's root object
    pub(crate) fn bind(&self, id: ObjectId, object: AnyObject) -> bool {
        let Some(slot) = self.slots.get(id.0) else {
            return false;
        };
        let mut state = slot.state.lock();
        if slot.value.set(Ok(object)).is_err() {
            return false;
        }
        *state = SlotState::Settled;
        true
    }

    /// Number of slots holding a ready instance
    pub fn bound_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value.get(), Some(Ok(_))))
            .count()
    }

    /// Resolve `object` for `job`, sourcing it on first reference
    pub(crate) fn lookup(
        &self,
        process: &Arc<ProcessState>,
        object: &LinkedObject,
        job: Job,
    ) -> Lookup {
        let slot = &self.slots[object.id.0];
        if let Some(settled) = slot.value.get() {
            return resolved(job, settled);
        }

        {
            let mut state = slot.state.lock();
            if let Some(settled) = slot.value.get() {
                return resolved(job, settled);
            }
            match &mut *state {
                SlotState::Sourcing { waiters, .. } => {
                    trace!("Parking job on {} while it is sourced", object.name);
                    waiters.push(job);
                    return Lookup::Parked;
                }
                SlotState::Released => {
                    return Lookup::Failed(job, Escalation::Cancelled);
                }
                SlotState::Vacant | SlotState::Settled => {
                    *state = SlotState::Sourcing {
                        waiters: Vec::new(),
                        pending: false,
                        abandoned: false,
                    };
                }
            }
        }

        // This caller owns sourcing; the slot lock is not held so a source
        // may complete its readiness handle synchronously.
        let sourced = match &object.binding {
            ObjectBinding::Pooled(pool) => Some(pool.acquire()),
            ObjectBinding::Input => Some(Err(Escalation::sourcing(
                object.name.clone(),
                anyhow::anyhow!("no root object bound to this process"),
            ))),
            ObjectBinding::Sourced(source) => {
                let readiness = Readiness::new(
                    Arc::clone(process),
                    object.id,
                    &object.name,
                    object.binding.clone(),
                );
                let ctx = SourceContext::for_process(&object.name, process.id(), readiness);
                match source_guarded(source.as_ref(), ctx) {
                    Ok(Sourced::Ready(instance)) => Some(Ok(instance)),
                    Ok(Sourced::Pending) => None,
                    Err(err) => Some(Err(Escalation::sourcing(object.name.clone(), err))),
                }
            }
        };

        match sourced {
            Some(result) => {
                self.settle(process, object.id, result, Some(&object.binding));
                match slot.value.get() {
                    Some(settled) => resolved(job, settled),
                    None => Lookup::Failed(job, Escalation::Cancelled),
                }
            }
            None => {
                let mut state = slot.state.lock();
                if let Some(settled) = slot.value.get() {
                    drop(state);
                    return resolved(job, settled);
                }
                match &mut *state {
                    SlotState::Sourcing {
                        waiters,
                        pending,
                        abandoned,
                    } => {
                        if *abandoned {
                            drop(state);
                            let escalation = Escalation::sourcing(
                                object.name.clone(),
                                anyhow::anyhow!("readiness handle dropped before the object became ready"),
                            );
                            self.settle(process, object.id, Err(escalation.clone()), None);
                            return Lookup::Failed(job, escalation);
                        }
                        *pending = true;
                        debug!(
                            "Object {} pending readiness for process {}",
                            object.name,
                            process.id()
                        );
                        waiters.push(job);
                        Lookup::Parked
                    }
                    _ => Lookup::Failed(job, Escalation::Cancelled),
                }
            }
        }
    }

    /// Record the sourcing result and re-submit parked jobs
    pub(crate) fn settle(
        &self,
        process: &Arc<ProcessState>,
        id: ObjectId,
        result: Result<AnyObject, Escalation>,
        binding: Option<&ObjectBinding>,
    ) {
        let Some(slot) = self.slots.get(id.0) else {
            return;
        };

        let waiters = {
            let mut state = slot.state.lock();
            if matches!(*state, SlotState::Released) || slot.value.get().is_some() {
                drop(state);
                // Late or duplicate completion: nobody will release this instance
                if let (Ok(instance), Some(binding)) = (result, binding) {
                    dispose(binding, instance);
                }
                return;
            }
            let _ = slot.value.set(result);
            match std::mem::replace(&mut *state, SlotState::Settled) {
                SlotState::Sourcing { waiters, .. } => waiters,
                _ => Vec::new(),
            }
        };

        if !waiters.is_empty() {
            trace!(
                "Re-submitting {} job(s) of process {} after readiness",
                waiters.len(),
                process.id()
            );
        }
        for job in waiters {
            job.resubmit();
        }
    }

    /// Mark a readiness handle as dropped without completing
    pub(crate) fn abandon(
        &self,
        process: &Arc<ProcessState>,
        id: ObjectId,
        escalation: Escalation,
    ) {
        let Some(slot) = self.slots.get(id.0) else {
            return;
        };
        {
            let mut state = slot.state.lock();
            if let SlotState::Sourcing {
                pending: false,
                abandoned,
                ..
            } = &mut *state
            {
                // the sourcing call has not returned yet; it settles on return
                *abandoned = true;
                return;
            }
        }
        self.settle(process, id, Err(escalation), None);
    }

    /// Remove every parked job, e.g. to cancel them
    pub(crate) fn take_waiters(&self) -> Vec<Job> {
        let mut taken = Vec::new();
        for slot in self.slots.iter() {
            let mut state = slot.state.lock();
            if let SlotState::Sourcing { waiters, .. } = &mut *state {
                taken.append(waiters);
            }
        }
        taken
    }

    /// Dispose process-scoped instances and return pooled ones
    ///
    /// Returns jobs that were still parked (only possible on forced
    /// termination).
    pub(crate) fn release(&self, objects: &[LinkedObject]) -> Vec<Job> {
        let mut leftover = Vec::new();
        for (slot, object) in self.slots.iter().zip(objects) {
            let instance = {
                let mut state = slot.state.lock();
                if let SlotState::Sourcing { waiters, .. } = &mut *state {
                    leftover.append(waiters);
                }
                *state = SlotState::Released;
                match slot.value.get() {
                    Some(Ok(instance)) => Some(Arc::clone(instance)),
                    _ => None,
                }
            };

            if let Some(instance) = instance {
                dispose(&object.binding, instance);
            }
        }
        leftover
    }
}

fn dispose(binding: &ObjectBinding, instance: AnyObject) {
    match binding {
        ObjectBinding::Sourced(source) => source.dispose(instance),
        ObjectBinding::Pooled(pool) => pool.release(instance),
        ObjectBinding::Input => {}
    }
}

fn resolved(job: Job, settled: &Result<AnyObject, Escalation>) -> Lookup {
    match settled {
        Ok(instance) => Lookup::Ready(job, Arc::clone(instance)),
        Err(escalation) => Lookup::Failed(job, escalation.clone()),
    }
}
