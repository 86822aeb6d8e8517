// src/office/wiring.rs
//! Static wiring table
//!
//! The output of the external graph linker: which team runs each function,
//! what comes next, which flows a function may invoke, how dependencies
//! bind to managed objects and which handlers catch which escalations. Loaded
//! once when an office is built and validated by the linker.
//!
//! ```yaml
//! teams:
//!   workers: { kind: pool, size: 4, max: 16 }
//!   ui: { kind: affinity }
//! functions:
//!   parse: { team: workers, next: store, dependencies: { request: http_request } }
//!   store: { team: workers, escalations: [{ kind: "*", handler: report }] }
//!   report: { team: ui }
//! flows:
//!   ingest: parse
//! objects:
//!   http_request: { scope: process }
//! inputs:
//!   ingest: http_request
//! ```

use crate::object::ObjectScope;
use crate::team::TeamKind;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One `kind -> handler` declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSpec {
    pub kind: String,
    pub handler: String,
}

impl HandlerSpec {
    pub fn new(kind: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            handler: handler.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FunctionSpec {
    pub team: String,
    pub next: Option<String>,
    /// Flow key -> target function
    pub flows: BTreeMap<String, String>,
    /// Dependency name -> managed object
    pub dependencies: BTreeMap<String, String>,
    pub escalations: Vec<HandlerSpec>,
    pub section: Option<String>,
}

impl FunctionSpec {
    pub fn on(team: impl Into<String>) -> Self {
        Self {
            team: team.into(),
            ..Self::default()
        }
    }

    pub fn next(mut self, function: impl Into<String>) -> Self {
        self.next = Some(function.into());
        self
    }

    pub fn flow(mut self, key: impl Into<String>, function: impl Into<String>) -> Self {
        self.flows.insert(key.into(), function.into());
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>, object: impl Into<String>) -> Self {
        self.dependencies.insert(dependency.into(), object.into());
        self
    }

    pub fn handle(mut self, kind: impl Into<String>, handler: impl Into<String>) -> Self {
        self.escalations.push(HandlerSpec::new(kind, handler));
        self
    }

    pub fn in_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }
}

/// Handler scope enclosing a group of functions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SectionSpec {
    pub enclosing: Option<String>,
    pub escalations: Vec<HandlerSpec>,
}

impl SectionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enclosed_by(mut self, section: impl Into<String>) -> Self {
        self.enclosing = Some(section.into());
        self
    }

    pub fn handle(mut self, kind: impl Into<String>, handler: impl Into<String>) -> Self {
        self.escalations.push(HandlerSpec::new(kind, handler));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectSpec {
    pub scope: ObjectScope,
    /// Pool capacity; `objects.default_pool_size` when omitted
    #[serde(default)]
    pub pool_size: Option<usize>,
}

impl ObjectSpec {
    pub fn process() -> Self {
        Self {
            scope: ObjectScope::Process,
            pool_size: None,
        }
    }

    pub fn thread() -> Self {
        Self {
            scope: ObjectScope::Thread,
            pool_size: None,
        }
    }

    pub fn pooled(size: usize) -> Self {
        Self {
            scope: ObjectScope::Pooled,
            pool_size: Some(size),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WiringTable {
    pub teams: BTreeMap<String, TeamKind>,
    pub functions: BTreeMap<String, FunctionSpec>,
    pub sections: BTreeMap<String, SectionSpec>,
    /// Office-wide handlers, the outermost scope
    pub escalations: Vec<HandlerSpec>,
    /// Process entry flow key -> initial function
    pub flows: BTreeMap<String, String>,
    pub objects: BTreeMap<String, ObjectSpec>,
    /// Entry flow key -> process object bound to the caller's root instance
    pub inputs: BTreeMap<String, String>,
}

impl WiringTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&text),
            Some("yaml") | Some("yml") => Self::from_yaml(&text),
            other => Err(EngineError::WiringParse(format!(
                "unsupported wiring file extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }

    pub fn team(mut self, name: impl Into<String>, kind: TeamKind) -> Self {
        self.teams.insert(name.into(), kind);
        self
    }

    pub fn function(mut self, name: impl Into<String>, spec: FunctionSpec) -> Self {
        self.functions.insert(name.into(), spec);
        self
    }

    pub fn section(mut self, name: impl Into<String>, spec: SectionSpec) -> Self {
        self.sections.insert(name.into(), spec);
        self
    }

    pub fn handle(mut self, kind: impl Into<String>, handler: impl Into<String>) -> Self {
        self.escalations.push(HandlerSpec::new(kind, handler));
        self
    }

    pub fn flow(mut self, key: impl Into<String>, function: impl Into<String>) -> Self {
        self.flows.insert(key.into(), function.into());
        self
    }

    pub fn object(mut self, name: impl Into<String>, spec: ObjectSpec) -> Self {
        self.objects.insert(name.into(), spec);
        self
    }

    pub fn input(mut self, flow: impl Into<String>, root_object: impl Into<String>) -> Self {
        self.inputs.insert(flow.into(), root_object.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TABLE: &str = r#"
teams:
  workers: { kind: pool, size: 2, max: 4 }
  ui: { kind: affinity, lanes: 1 }
functions:
  parse:
    team: workers
    next: store
    flows: { audit: audit }
    dependencies: { request: http_request }
    section: ingest
  store: { team: workers }
  audit: { team: ui }
  report: { team: ui }
sections:
  ingest:
    escalations: [{ kind: "*", handler: report }]
flows:
  ingest: parse
objects:
  http_request: { scope: process }
  db: { scope: pooled, pool_size: 3 }
inputs:
  ingest: http_request
"#;

    #[test]
    fn test_parse_yaml() {
        let table = WiringTable::from_yaml(TABLE).unwrap();
        assert_eq!(table.teams.len(), 2);
        assert_eq!(
            table.teams["workers"],
            TeamKind::Pool {
                size: Some(2),
                max: Some(4)
            }
        );
        let parse = &table.functions["parse"];
        assert_eq!(parse.next.as_deref(), Some("store"));
        assert_eq!(parse.dependencies["request"], "http_request");
        assert_eq!(parse.section.as_deref(), Some("ingest"));
        assert_eq!(table.sections["ingest"].escalations[0].handler, "report");
        assert_eq!(table.objects["db"], ObjectSpec::pooled(3));
        assert_eq!(table.inputs["ingest"], "http_request");
    }

    #[test]
    fn test_builder_matches_parsed_table() {
        let built = WiringTable::new()
            .team("workers", TeamKind::Pool { size: Some(2), max: Some(4) })
            .team("ui", TeamKind::Affinity { lanes: Some(1) })
            .function(
                "parse",
                FunctionSpec::on("workers")
                    .next("store")
                    .flow("audit", "audit")
                    .depends_on("request", "http_request")
                    .in_section("ingest"),
            )
            .function("store", FunctionSpec::on("workers"))
            .function("audit", FunctionSpec::on("ui"))
            .function("report", FunctionSpec::on("ui"))
            .section("ingest", SectionSpec::new().handle("*", "report"))
            .flow("ingest", "parse")
            .object("http_request", ObjectSpec::process())
            .object("db", ObjectSpec::pooled(3))
            .input("ingest", "http_request");

        assert_eq!(built, WiringTable::from_yaml(TABLE).unwrap());
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let err = WiringTable::from_yaml("functions:\n  a: { team: t, nxt: b }\n").unwrap_err();
        assert!(matches!(err, EngineError::WiringParse(_)));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"teams": {{"t": {{"kind": "dedicated"}}}}, "functions": {{"a": {{"team": "t"}}}}, "flows": {{"go": "a"}}}}"#
        )
        .unwrap();

        let table = WiringTable::from_file(file.path()).unwrap();
        assert_eq!(table.teams["t"], TeamKind::Dedicated);
        assert_eq!(table.flows["go"], "a");
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(matches!(
            WiringTable::from_file(file.path()),
            Err(EngineError::WiringParse(_))
        ));
    }
}
