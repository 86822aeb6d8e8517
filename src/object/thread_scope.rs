// src/object/thread_scope.rs
//! Thread-scoped managed objects
//!
//! Each thread keeps its own instances, keyed by office and object. The
//! registry is thread-local, so instances are disposed by the thread-local
//! destructor when the thread retires.

use crate::escalation::Escalation;
use crate::object::{
    source_guarded, AnyObject, LinkedObject, ManagedObjectSource, ObjectId, SourceContext, Sourced,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Default)]
struct ThreadObjects {
    entries: HashMap<(u64, ObjectId), (AnyObject, Arc<dyn ManagedObjectSource>)>,
}

impl Drop for ThreadObjects {
    fn drop(&mut self) {
        for (_, (object, source)) in self.entries.drain() {
            source.dispose(object);
        }
    }
}

thread_local! {
    static THREAD_OBJECTS: RefCell<ThreadObjects> = RefCell::new(ThreadObjects::default());
}

/// The calling thread's instance of `object`, sourcing it on first use
pub(crate) fn acquire(office: u64, object: &LinkedObject) -> Result<AnyObject, Escalation> {
    let key = (office, object.id);
    let cached = THREAD_OBJECTS
        .try_with(|objects| objects.borrow().entries.get(&key).map(|(o, _)| Arc::clone(o)))
        .map_err(|_| {
            Escalation::sourcing(
                object.name.clone(),
                anyhow::anyhow!("thread is shutting down"),
            )
        })?;
    if let Some(found) = cached {
        return Ok(found);
    }

    let source = object.source().cloned().ok_or_else(|| {
        Escalation::sourcing(object.name.clone(), anyhow::anyhow!("no source bound"))
    })?;

    // Sourced outside the borrow so a source may itself use thread scope
    let instance = match source_guarded(source.as_ref(), SourceContext::synchronous(&object.name)) {
        Ok(Sourced::Ready(instance)) => instance,
        Ok(Sourced::Pending) => {
            return Err(Escalation::sourcing(
                object.name.clone(),
                anyhow::anyhow!("thread-scoped objects must be sourced synchronously"),
            ))
        }
        Err(err) => return Err(Escalation::sourcing(object.name.clone(), err)),
    };

    trace!(
        "Sourced thread-scoped {} on {:?}",
        object.name,
        std::thread::current().name()
    );
    let stored = Arc::clone(&instance);
    let _ = THREAD_OBJECTS.try_with(|objects| {
        objects.borrow_mut().entries.insert(key, (stored, source));
    });
    Ok(instance)
}

/// Number of instances the calling thread holds for `office`
pub fn thread_instance_count(office: u64) -> usize {
    THREAD_OBJECTS
        .try_with(|objects| {
            objects
                .borrow()
                .entries
                .keys()
                .filter(|(owner, _)| *owner == office)
                .count()
        })
        .unwrap_or(0)
}
