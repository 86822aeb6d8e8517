// src/office/gateway.rs
//! Input invocation gateway
//!
//! The entry point for threads the engine does not own: request handlers,
//! timers, callbacks of asynchronous managed objects. Each call allocates a
//! new process, binds the caller's root object and submits the initial job.
//! The gateway is cheap to clone and safe to call concurrently from any
//! number of threads.

use crate::function::Parameter;
use crate::object::AnyObject;
use crate::office::shared::OfficeCore;
use crate::process::{Completion, ProcessCallback, ProcessId};
use crate::utils::errors::{EngineError, Result};
use std::fmt;
use std::sync::Arc;

/// A registered homogeneous input source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSource {
    pub name: String,
    pub flow: String,
}

/// Office-owned arena of input sources addressed by index
///
/// Choosing which source fires next is the caller's business; the arena only
/// provides the index arithmetic.
#[derive(Debug, Clone, Default)]
pub struct InputSources {
    slots: Vec<InputSource>,
}

impl InputSources {
    pub(crate) fn new(slots: Vec<InputSource>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&InputSource> {
        self.slots.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InputSource> {
        self.slots.iter()
    }

    /// Round-robin successor of `after`; the first slot when `after` is `None`
    pub fn next_index(&self, after: Option<usize>) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        Some(match after {
            Some(index) => (index % self.slots.len() + 1) % self.slots.len(),
            None => 0,
        })
    }
}

#[derive(Clone)]
pub struct InputGateway {
    core: Arc<OfficeCore>,
}

impl InputGateway {
    pub(crate) fn new(core: Arc<OfficeCore>) -> Self {
        Self { core }
    }

    /// Start a process on `flow`
    ///
    /// `root` is bound as the process's root object and requires an input
    /// binding for the flow. `callback` receives the outcome once every flow
    /// of the process has completed. On error no process is created and the
    /// callback is never invoked.
    pub fn invoke_process(
        &self,
        flow: &str,
        parameter: Option<Parameter>,
        root: Option<AnyObject>,
        callback: Option<ProcessCallback>,
    ) -> Result<ProcessId> {
        let completion = match callback {
            Some(callback) => Completion::Callback(callback),
            None => Completion::Detached,
        };
        self.core
            .start_process(flow, parameter, root, completion, None)
    }

    /// Invoke the flow registered for input source `index`
    pub fn invoke_source(
        &self,
        index: usize,
        parameter: Option<Parameter>,
        root: Option<AnyObject>,
        callback: Option<ProcessCallback>,
    ) -> Result<ProcessId> {
        let flow = self
            .core
            .input_sources
            .get(index)
            .map(|source| source.flow.clone())
            .ok_or(EngineError::UnknownInputSource(index))?;
        self.invoke_process(&flow, parameter, root, callback)
    }

    pub fn input_sources(&self) -> &InputSources {
        &self.core.input_sources
    }
}

impl fmt::Debug for InputGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputGateway")
            .field("office", &self.core.id())
            .field("sources", &self.core.input_sources.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sources(count: usize) -> InputSources {
        InputSources::new(
            (0..count)
                .map(|i| InputSource {
                    name: format!("socket-{}", i),
                    flow: "serve".to_string(),
                })
                .collect(),
        )
    }

    #[test]
    fn test_empty_arena_has_no_next() {
        assert_eq!(sources(0).next_index(None), None);
        assert_eq!(sources(0).next_index(Some(3)), None);
    }

    #[test]
    fn test_round_robin_wraps() {
        let arena = sources(3);
        assert_eq!(arena.next_index(None), Some(0));
        assert_eq!(arena.next_index(Some(0)), Some(1));
        assert_eq!(arena.next_index(Some(2)), Some(0));
        assert_eq!(arena.get(1).map(|s| s.name.as_str()), Some("socket-1"));
    }

    #[test]
    fn test_out_of_range_index_wraps_without_overflow() {
        let arena = sources(3);
        // usize::MAX % 3 == 0
        assert_eq!(arena.next_index(Some(usize::MAX)), Some(1));
        assert_eq!(arena.next_index(Some(7)), Some(2));
        assert_eq!(sources(1).next_index(Some(usize::MAX)), Some(0));
    }

    proptest! {
        #[test]
        fn prop_next_index_is_in_range(count in 1usize..64, after in any::<usize>()) {
            let arena = sources(count);
            let index = arena.next_index(Some(after)).unwrap();
            prop_assert!(index < count);
            prop_assert_eq!(index, (after % count + 1) % count);
        }
    }

    proptest! {
        #[test]
        fn prop_round_robin_never_repeats_and_is_fair(count in 2usize..32, invocations in 1usize..500) {
            let arena = sources(count);
            let mut hits = vec![0usize; count];
            let mut previous = None;
            for _ in 0..invocations {
                let index = arena.next_index(previous).unwrap();
                prop_assert!(index < count);
                prop_assert_ne!(Some(index), previous);
                hits[index] += 1;
                previous = Some(index);
            }
            prop_assert_eq!(hits.iter().sum::<usize>(), invocations);
            let max = *hits.iter().max().unwrap();
            let min = *hits.iter().min().unwrap();
            prop_assert!(max - min <= 1);
        }
    }
}
