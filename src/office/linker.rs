// src/office/linker.rs
//! Link-time validation
//!
//! Turns the wiring table plus the bodies and sources supplied in code into
//! index-addressed linked structures. Every unresolved reference is
//! collected and reported together; nothing is linked unless all resolve.

use crate::escalation::{EscalationScope, HandlerEntry};
use crate::function::{Dependency, FunctionId, LinkedFunction, ManagedFunction};
use crate::object::{LinkedObject, ManagedObjectSource, ObjectBinding, ObjectId, ObjectPool, ObjectScope};
use crate::office::wiring::{HandlerSpec, WiringTable};
use crate::team::{LaneRegistry, Team, TeamId};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub(crate) const OFFICE_SCOPE: &str = "office";

/// Everything an office needs at runtime, fully resolved
pub(crate) struct Linked {
    pub(crate) teams: Vec<Team>,
    pub(crate) functions: Vec<LinkedFunction>,
    pub(crate) objects: Vec<LinkedObject>,
    pub(crate) pools: Vec<Arc<ObjectPool>>,
    pub(crate) flows: HashMap<String, FunctionId>,
    pub(crate) inputs: HashMap<String, ObjectId>,
    /// Last-resort handlers for escalations reaching a process root
    pub(crate) office_scope: Arc<EscalationScope>,
}

pub(crate) struct Linker<'a> {
    wiring: &'a WiringTable,
    config: &'a EngineConfig,
    team_ids: HashMap<&'a str, TeamId>,
    function_ids: HashMap<&'a str, FunctionId>,
    object_ids: HashMap<&'a str, ObjectId>,
    problems: Vec<String>,
}

impl<'a> Linker<'a> {
    pub(crate) fn new(wiring: &'a WiringTable, config: &'a EngineConfig) -> Self {
        Self {
            team_ids: wiring
                .teams
                .keys()
                .enumerate()
                .map(|(i, name)| (name.as_str(), TeamId(i)))
                .collect(),
            function_ids: wiring
                .functions
                .keys()
                .enumerate()
                .map(|(i, name)| (name.as_str(), FunctionId(i)))
                .collect(),
            object_ids: wiring
                .objects
                .keys()
                .enumerate()
                .map(|(i, name)| (name.as_str(), ObjectId(i)))
                .collect(),
            wiring,
            config,
            problems: Vec::new(),
        }
    }

    pub(crate) fn link(
        mut self,
        bodies: &HashMap<String, Arc<dyn ManagedFunction>>,
        sources: &HashMap<String, Arc<dyn ManagedObjectSource>>,
        input_flows: &[String],
        lanes: Arc<LaneRegistry>,
    ) -> Result<Linked> {
        let objects = self.link_objects(sources);
        let (office_scope, scopes) = self.link_scopes();
        let functions = self.link_functions(bodies, &scopes);
        let flows = self.link_flows();
        let inputs = self.link_inputs();

        for flow in input_flows {
            if !self.wiring.flows.contains_key(flow) {
                self.problems
                    .push(format!("input source targets unknown flow `{}`", flow));
            }
        }

        if !self.problems.is_empty() {
            return Err(EngineError::Link(self.problems));
        }

        let teams = self
            .wiring
            .teams
            .iter()
            .enumerate()
            .map(|(i, (name, kind))| Team::new(TeamId(i), name, kind, &self.config.teams, Arc::clone(&lanes)))
            .collect();
        let pools = objects
            .iter()
            .filter_map(|object| match &object.binding {
                ObjectBinding::Pooled(pool) => Some(Arc::clone(pool)),
                _ => None,
            })
            .collect();
        let functions = functions.into_iter().flatten().collect();

        debug!(
            "Linked {} team(s), {} function(s), {} object(s)",
            self.wiring.teams.len(),
            self.wiring.functions.len(),
            objects.len()
        );
        Ok(Linked {
            teams,
            functions,
            objects,
            pools,
            flows,
            inputs,
            office_scope,
        })
    }

    fn link_objects(
        &mut self,
        sources: &HashMap<String, Arc<dyn ManagedObjectSource>>,
    ) -> Vec<LinkedObject> {
        let wiring = self.wiring;
        let roots: HashSet<&str> = wiring.inputs.values().map(String::as_str).collect();

        for name in sources.keys() {
            if !wiring.objects.contains_key(name) {
                self.problems
                    .push(format!("source supplied for undeclared object `{}`", name));
            }
        }

        let mut linked = Vec::with_capacity(wiring.objects.len());
        for (i, (name, spec)) in wiring.objects.iter().enumerate() {
            let binding = if roots.contains(name.as_str()) {
                if spec.scope != ObjectScope::Process {
                    self.problems.push(format!(
                        "root object `{}` must have process scope",
                        name
                    ));
                }
                ObjectBinding::Input
            } else {
                let Some(source) = sources.get(name) else {
                    self.problems
                        .push(format!("object `{}` has no source", name));
                    continue;
                };
                match spec.scope {
                    ObjectScope::Pooled => {
                        let capacity = spec.pool_size.unwrap_or(self.config.objects.default_pool_size);
                        if capacity == 0 {
                            self.problems
                                .push(format!("pooled object `{}` has zero capacity", name));
                        }
                        ObjectBinding::Pooled(Arc::new(ObjectPool::new(
                            name.clone(),
                            Arc::clone(source),
                            capacity,
                            self.config.pool_acquire_timeout(),
                        )))
                    }
                    ObjectScope::Process | ObjectScope::Thread => {
                        ObjectBinding::Sourced(Arc::clone(source))
                    }
                }
            };
            linked.push(LinkedObject {
                id: ObjectId(i),
                name: name.clone(),
                scope: spec.scope,
                binding,
            });
        }
        linked
    }

    fn handlers(&mut self, owner: &str, specs: &[HandlerSpec]) -> Vec<HandlerEntry> {
        let mut entries = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.function_ids.get(spec.handler.as_str()) {
                Some(id) => entries.push(HandlerEntry::new(spec.kind.clone(), *id)),
                None => self.problems.push(format!(
                    "{} handles `{}` with unknown function `{}`",
                    owner, spec.kind, spec.handler
                )),
            }
        }
        entries
    }

    /// Office scope, plus one scope per section linked to its enclosing one
    ///
    /// Section chains end at the outermost section. The office scope is kept
    /// apart: it only sees escalations that reach a process's root flow.
    fn link_scopes(&mut self) -> (Arc<EscalationScope>, BTreeMap<String, Arc<EscalationScope>>) {
        let wiring = self.wiring;
        let office_handlers = self.handlers(OFFICE_SCOPE, &wiring.escalations);
        let office = Arc::new(EscalationScope::new(OFFICE_SCOPE, office_handlers, None));

        let mut built: BTreeMap<String, Arc<EscalationScope>> = BTreeMap::new();
        let mut broken: HashSet<&str> = HashSet::new();

        for start in wiring.sections.keys() {
            // walk outwards until a built scope, the outermost section, a dead end or a cycle
            let mut path: Vec<&str> = Vec::new();
            let mut current = Some(start.as_str());
            let mut outer: Option<Arc<EscalationScope>> = None;
            let mut resolved = true;
            while let Some(name) = current {
                let key = format!("section:{}", name);
                if let Some(scope) = built.get(&key) {
                    outer = Some(Arc::clone(scope));
                    break;
                }
                if broken.contains(name) {
                    resolved = false;
                    break;
                }
                if path.contains(&name) {
                    self.problems.push(format!(
                        "section `{}` is part of an enclosing cycle: {}",
                        name,
                        path.join(" -> ")
                    ));
                    resolved = false;
                    break;
                }
                path.push(name);
                current = match wiring.sections.get(name) {
                    Some(spec) => spec.enclosing.as_deref(),
                    None => {
                        self.problems.push(format!(
                            "section `{}` is enclosed by unknown section `{}`",
                            path.get(path.len().wrapping_sub(2)).copied().unwrap_or(start),
                            name
                        ));
                        path.pop();
                        resolved = false;
                        break;
                    }
                };
            }

            if !resolved {
                broken.extend(path);
                continue;
            }
            for name in path.into_iter().rev() {
                let Some(spec) = wiring.sections.get(name) else {
                    continue;
                };
                let entries = self.handlers(&format!("section `{}`", name), &spec.escalations);
                let key = format!("section:{}", name);
                let scope = Arc::new(EscalationScope::new(key.clone(), entries, outer.take()));
                built.insert(key, Arc::clone(&scope));
                outer = Some(scope);
            }
        }
        (office, built)
    }

    fn link_functions(
        &mut self,
        bodies: &HashMap<String, Arc<dyn ManagedFunction>>,
        scopes: &BTreeMap<String, Arc<EscalationScope>>,
    ) -> Vec<Option<LinkedFunction>> {
        for name in bodies.keys() {
            if !self.wiring.functions.contains_key(name) {
                self.problems
                    .push(format!("body supplied for undeclared function `{}`", name));
            }
        }

        let wiring = self.wiring;
        let mut linked = Vec::with_capacity(wiring.functions.len());
        for (name, spec) in &wiring.functions {
            let body = bodies.get(name).cloned();
            if body.is_none() {
                self.problems
                    .push(format!("function `{}` has no body", name));
            }
            let team = self.team_ids.get(spec.team.as_str()).copied();
            if team.is_none() {
                self.problems.push(format!(
                    "function `{}` references unknown team `{}`",
                    name, spec.team
                ));
            }

            let next = match spec.next.as_deref() {
                Some(next) => {
                    let id = self.function_ids.get(next).copied();
                    if id.is_none() {
                        self.problems.push(format!(
                            "function `{}` continues with unknown function `{}`",
                            name, next
                        ));
                    }
                    id
                }
                None => None,
            };

            let mut flows = HashMap::with_capacity(spec.flows.len());
            for (key, target) in &spec.flows {
                match self.function_ids.get(target.as_str()) {
                    Some(id) => {
                        flows.insert(key.clone(), *id);
                    }
                    None => self.problems.push(format!(
                        "flow `{}` of function `{}` targets unknown function `{}`",
                        key, name, target
                    )),
                }
            }

            let mut dependencies = Vec::with_capacity(spec.dependencies.len());
            for (dependency, object) in &spec.dependencies {
                match self.object_ids.get(object.as_str()) {
                    Some(id) => dependencies.push(Dependency {
                        name: dependency.clone(),
                        object: *id,
                    }),
                    None => self.problems.push(format!(
                        "dependency `{}` of function `{}` binds unknown object `{}`",
                        dependency, name, object
                    )),
                }
            }

            let enclosing = match &spec.section {
                Some(section) => {
                    let scope = scopes.get(&format!("section:{}", section)).cloned();
                    if scope.is_none() && !wiring.sections.contains_key(section) {
                        self.problems.push(format!(
                            "function `{}` is in unknown section `{}`",
                            name, section
                        ));
                    }
                    scope
                }
                None => None,
            };
            let handlers = self.handlers(&format!("function `{}`", name), &spec.escalations);

            linked.push(match (body, team) {
                (Some(body), Some(team)) => Some(LinkedFunction {
                    name: name.clone(),
                    body,
                    team,
                    next,
                    flows,
                    dependencies,
                    escalations: Arc::new(EscalationScope::new(
                        format!("function:{}", name),
                        handlers,
                        enclosing,
                    )),
                }),
                _ => None,
            });
        }
        linked
    }

    fn link_flows(&mut self) -> HashMap<String, FunctionId> {
        let mut flows = HashMap::with_capacity(self.wiring.flows.len());
        for (key, function) in &self.wiring.flows {
            match self.function_ids.get(function.as_str()) {
                Some(id) => {
                    flows.insert(key.clone(), *id);
                }
                None => self.problems.push(format!(
                    "entry flow `{}` targets unknown function `{}`",
                    key, function
                )),
            }
        }
        flows
    }

    fn link_inputs(&mut self) -> HashMap<String, ObjectId> {
        let mut inputs = HashMap::with_capacity(self.wiring.inputs.len());
        for (flow, object) in &self.wiring.inputs {
            if !self.wiring.flows.contains_key(flow) {
                self.problems
                    .push(format!("input binds unknown entry flow `{}`", flow));
            }
            match self.object_ids.get(object.as_str()) {
                Some(id) => {
                    inputs.insert(flow.clone(), *id);
                }
                None => self.problems.push(format!(
                    "input `{}` binds unknown object `{}`",
                    flow, object
                )),
            }
        }
        inputs
    }
}
