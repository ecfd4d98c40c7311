//! A small declare-then-apply resource engine.
//!
//! Resources are declared as [`Node`]s with data edges (`uses`) and
//! ordering-only edges (`after`). Each applied resource is recorded in
//! the [`State`] with a fingerprint over its kind, its inputs, and the
//! fingerprints and outputs of everything it uses. A re-apply keeps
//! every resource whose fingerprint is unchanged, so an unchanged
//! declaration converges with zero mutations, while a replaced
//! upstream cascades to whatever consumes its outputs.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{DeployError, DeployResult};
use crate::state::{Record, State};

/// A declared resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub kind: String,
    pub inputs: Value,
    /// Resources whose outputs this one consumes.
    pub uses: Vec<String>,
    /// Resources that must be applied first but whose outputs do not
    /// matter to this one.
    pub after: Vec<String>,
    /// Runs on every apply and is never recorded.
    pub ephemeral: bool,
}

impl Node {
    #[must_use]
    pub fn new(id: &str, kind: &str, inputs: Value) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            inputs,
            uses: Vec::new(),
            after: Vec::new(),
            ephemeral: false,
        }
    }

    #[must_use]
    pub fn uses(mut self, ids: &[&str]) -> Self {
        self.uses.extend(ids.iter().map(ToString::to_string));
        self
    }

    #[must_use]
    pub fn after(mut self, ids: &[&str]) -> Self {
        self.after.extend(ids.iter().map(ToString::to_string));
        self
    }

    #[must_use]
    pub const fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    fn deps(&self) -> impl Iterator<Item = &String> {
        self.uses.iter().chain(self.after.iter())
    }
}

/// Performs the side effects for each kind of resource.
pub trait Reconciler {
    /// Bring `node` into existence. `state` holds the records of
    /// everything applied before it. Returns the outputs to record.
    fn create(&mut self, node: &Node, state: &State) -> DeployResult<Value>;

    /// Bring an existing resource in line with a changed declaration.
    /// Defaults to delete-then-create.
    fn update(&mut self, node: &Node, previous: &Record, state: &State) -> DeployResult<Value> {
        self.delete(&node.id, previous, state)?;
        self.create(node, state)
    }

    /// Remove a recorded resource. Must work from the record alone,
    /// since the declaration may be gone.
    fn delete(&mut self, id: &str, record: &Record, state: &State) -> DeployResult<()>;
}

/// What apply did, per resource id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
}

impl Report {
    /// Number of mutated resources.
    #[must_use]
    pub fn changes(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.changes() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    /// Changed, or downstream of a change.
    Replace,
    Keep,
    Delete,
    /// Ephemeral; runs every time.
    Run,
}

impl Action {
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Replace => "~",
            Self::Keep => "=",
            Self::Delete => "-",
            Self::Run => ">",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub id: String,
    pub kind: String,
    pub action: Action,
}

/// Declared resources in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: Node) -> DeployResult<()> {
        if self.node(&node.id).is_some() {
            return Err(DeployError::Config(format!(
                "resource '{}' declared twice",
                node.id
            )));
        }
        self.nodes.push(node);
        Ok(())
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Topological order; ties keep declaration order.
    pub fn order(&self) -> DeployResult<Vec<&Node>> {
        for node in &self.nodes {
            for dep in node.deps() {
                let Some(target) = self.node(dep) else {
                    return Err(DeployError::Config(format!(
                        "resource '{}' depends on undeclared '{dep}'",
                        node.id
                    )));
                };
                if target.ephemeral && node.uses.contains(dep) {
                    return Err(DeployError::Config(format!(
                        "resource '{}' uses outputs of ephemeral '{dep}'",
                        node.id
                    )));
                }
            }
        }

        let edges: Vec<(String, Vec<String>)> = self
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.deps().cloned().collect()))
            .collect();
        let sorted = stable_toposort(&edges).ok_or_else(|| {
            DeployError::Config("resource dependencies form a cycle".to_string())
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|id| self.node(&id))
            .collect())
    }

    /// Ids recorded in `state` but no longer declared.
    #[must_use]
    pub fn orphans(&self, state: &State) -> Vec<String> {
        state
            .resources
            .keys()
            .filter(|id| self.node(id).is_none_or(|n| n.ephemeral))
            .cloned()
            .collect()
    }

    /// Converge `state` towards this graph.
    ///
    /// `checkpoint` is called after every mutation so partial progress
    /// survives a failure. The first failure stops the walk and is
    /// returned tagged with the resource id.
    pub fn apply(
        &self,
        state: &mut State,
        reconciler: &mut dyn Reconciler,
        checkpoint: &mut dyn FnMut(&State) -> DeployResult<()>,
    ) -> DeployResult<Report> {
        let order = self.order()?;
        let mut report = Report::default();

        let orphans = self.orphans(state);
        if !orphans.is_empty() {
            let mut doomed = state.clone();
            doomed.resources.retain(|id, _| orphans.contains(id));
            for id in reverse_order(&doomed) {
                delete_one(&id, state, reconciler, checkpoint)?;
                report.deleted.push(id);
            }
        }

        for node in order {
            if node.ephemeral {
                debug!(resource = %node.id, "running");
                reconciler
                    .create(node, state)
                    .map_err(|e| e.in_stage(&node.id))?;
                continue;
            }

            let fingerprint = fingerprint(node, state);
            let previous = state.get(&node.id).cloned();

            let outputs = match &previous {
                Some(record) if record.fingerprint == fingerprint => {
                    debug!(resource = %node.id, "unchanged");
                    report.unchanged.push(node.id.clone());
                    continue;
                }
                Some(record) => {
                    info!(resource = %node.id, kind = %node.kind, "updating");
                    let outputs = reconciler
                        .update(node, record, state)
                        .map_err(|e| e.in_stage(&node.id))?;
                    report.updated.push(node.id.clone());
                    outputs
                }
                None => {
                    info!(resource = %node.id, kind = %node.kind, "creating");
                    let outputs = reconciler
                        .create(node, state)
                        .map_err(|e| e.in_stage(&node.id))?;
                    report.created.push(node.id.clone());
                    outputs
                }
            };

            state.resources.insert(
                node.id.clone(),
                Record {
                    kind: node.kind.clone(),
                    fingerprint,
                    outputs,
                    deps: node.deps().cloned().collect(),
                },
            );
            checkpoint(state)?;
        }

        Ok(report)
    }

    /// What [`Graph::apply`] would do, without doing it.
    pub fn plan(&self, state: &State) -> DeployResult<Vec<PlannedStep>> {
        let order = self.order()?;
        let mut steps = Vec::new();

        for id in reverse_order_of(state, &self.orphans(state)) {
            if let Some(record) = state.get(&id) {
                steps.push(PlannedStep {
                    id,
                    kind: record.kind.clone(),
                    action: Action::Delete,
                });
            }
        }

        let mut changing: HashSet<&str> = HashSet::new();
        for node in order {
            let action = if node.ephemeral {
                Action::Run
            } else if !state.contains(&node.id) {
                Action::Create
            } else if node.uses.iter().any(|d| changing.contains(d.as_str()))
                || state
                    .get(&node.id)
                    .is_some_and(|r| r.fingerprint != fingerprint(node, state))
            {
                Action::Replace
            } else {
                Action::Keep
            };
            if matches!(action, Action::Create | Action::Replace) {
                changing.insert(node.id.as_str());
            }
            steps.push(PlannedStep {
                id: node.id.clone(),
                kind: node.kind.clone(),
                action,
            });
        }

        Ok(steps)
    }
}

/// Delete everything recorded in `state`, dependents first.
pub fn destroy(
    state: &mut State,
    reconciler: &mut dyn Reconciler,
    checkpoint: &mut dyn FnMut(&State) -> DeployResult<()>,
) -> DeployResult<Vec<String>> {
    let mut deleted = Vec::new();
    for id in reverse_order(state) {
        delete_one(&id, state, reconciler, checkpoint)?;
        deleted.push(id);
    }
    Ok(deleted)
}

fn delete_one(
    id: &str,
    state: &mut State,
    reconciler: &mut dyn Reconciler,
    checkpoint: &mut dyn FnMut(&State) -> DeployResult<()>,
) -> DeployResult<()> {
    let Some(record) = state.get(id).cloned() else {
        return Ok(());
    };
    info!(resource = id, kind = %record.kind, "deleting");
    reconciler
        .delete(id, &record, state)
        .map_err(|e| e.in_stage(id))?;
    state.resources.shift_remove(id);
    checkpoint(state)
}

/// Recorded ids, each after everything that depends on it.
fn reverse_order(state: &State) -> Vec<String> {
    let edges: Vec<(String, Vec<String>)> = state
        .resources
        .iter()
        .map(|(id, r)| (id.clone(), r.deps.clone()))
        .collect();
    let mut order =
        stable_toposort(&edges).unwrap_or_else(|| state.resources.keys().cloned().collect());
    order.reverse();
    order
}

fn reverse_order_of(state: &State, ids: &[String]) -> Vec<String> {
    reverse_order(state)
        .into_iter()
        .filter(|id| ids.contains(id))
        .collect()
}

/// Kahn's algorithm, always taking the earliest-listed ready node.
/// Edges to unknown ids are ignored. `None` on a cycle.
fn stable_toposort(edges: &[(String, Vec<String>)]) -> Option<Vec<String>> {
    let known: HashSet<&str> = edges.iter().map(|(id, _)| id.as_str()).collect();
    let mut pending: HashMap<&str, usize> = edges
        .iter()
        .map(|(id, deps)| {
            let n = deps
                .iter()
                .filter(|d| known.contains(d.as_str()))
                .collect::<HashSet<_>>()
                .len();
            (id.as_str(), n)
        })
        .collect();

    let mut done: Vec<String> = Vec::with_capacity(edges.len());
    let mut placed: HashSet<&str> = HashSet::new();

    while done.len() < edges.len() {
        let next = edges
            .iter()
            .find(|(id, _)| !placed.contains(id.as_str()) && pending[id.as_str()] == 0)?;
        let id = next.0.as_str();
        placed.insert(id);
        done.push(id.to_string());

        for (other, deps) in edges {
            if !placed.contains(other.as_str()) && deps.iter().any(|d| d == id) {
                if let Some(count) = pending.get_mut(other.as_str()) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    Some(done)
}

/// SHA-256 over kind, inputs, and each used resource's fingerprint and
/// outputs.
#[must_use]
pub fn fingerprint(node: &Node, state: &State) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node.kind.as_bytes());
    hasher.update([0]);
    hasher.update(node.inputs.to_string().as_bytes());
    for dep in &node.uses {
        hasher.update([0]);
        hasher.update(dep.as_bytes());
        if let Some(record) = state.get(dep) {
            hasher.update([0]);
            hasher.update(record.fingerprint.as_bytes());
            hasher.update([0]);
            hasher.update(record.outputs.to_string().as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        fail_on: Option<String>,
        version: HashMap<String, u32>,
    }

    impl Reconciler for Recorder {
        fn create(&mut self, node: &Node, _state: &State) -> DeployResult<Value> {
            if self.fail_on.as_deref() == Some(node.id.as_str()) {
                return Err(DeployError::Build("boom".into()));
            }
            self.events.push(format!("create {}", node.id));
            let v = self.version.entry(node.id.clone()).or_default();
            *v += 1;
            Ok(json!({ "v": *v }))
        }

        fn delete(&mut self, id: &str, _record: &Record, _state: &State) -> DeployResult<()> {
            self.events.push(format!("delete {id}"));
            Ok(())
        }
    }

    fn graph(image_input: &str) -> Graph {
        let mut g = Graph::new();
        g.add(Node::new("host", "host", json!({"type": "cx22"}))).unwrap();
        g.add(Node::new("ready", "probe", json!({})).after(&["host"]).ephemeral())
            .unwrap();
        g.add(
            Node::new("image", "image", json!({ "digest": image_input }))
                .after(&["ready"]),
        )
        .unwrap();
        g.add(Node::new("volume", "volume", json!({"name": "v"})).after(&["ready"]))
            .unwrap();
        g.add(Node::new("app", "container", json!({})).uses(&["image", "volume"]))
            .unwrap();
        g
    }

    fn apply(g: &Graph, state: &mut State, r: &mut Recorder) -> DeployResult<Report> {
        g.apply(state, r, &mut |_| Ok(()))
    }

    #[test]
    fn order_respects_edges_and_declaration() {
        let g = graph("a");
        let ids: Vec<&str> = g.order().unwrap().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["host", "ready", "image", "volume", "app"]);
    }

    #[test]
    fn declaration_order_does_not_need_to_be_topological() {
        let mut g = Graph::new();
        g.add(Node::new("b", "k", json!({})).uses(&["a"])).unwrap();
        g.add(Node::new("a", "k", json!({}))).unwrap();
        let ids: Vec<&str> = g.order().unwrap().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn cycles_and_unknown_edges_are_rejected() {
        let mut g = Graph::new();
        g.add(Node::new("a", "k", json!({})).after(&["b"])).unwrap();
        g.add(Node::new("b", "k", json!({})).after(&["a"])).unwrap();
        assert!(matches!(g.order(), Err(DeployError::Config(_))));

        let mut g = Graph::new();
        g.add(Node::new("a", "k", json!({})).uses(&["ghost"])).unwrap();
        assert!(matches!(g.order(), Err(DeployError::Config(_))));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut g = Graph::new();
        g.add(Node::new("a", "k", json!({}))).unwrap();
        assert!(g.add(Node::new("a", "k", json!({}))).is_err());
    }

    #[test]
    fn second_apply_is_a_noop() {
        let g = graph("a");
        let mut state = State::default();
        let mut r = Recorder::default();

        let first = apply(&g, &mut state, &mut r).unwrap();
        assert_eq!(first.created, ["host", "image", "volume", "app"]);

        r.events.clear();
        let second = apply(&g, &mut state, &mut r).unwrap();
        assert!(second.is_noop());
        assert_eq!(second.unchanged.len(), 4);
        // only the ephemeral probe ran
        assert_eq!(r.events, ["create ready"]);
    }

    #[test]
    fn changed_input_cascades_through_uses_only() {
        let g = graph("a");
        let mut state = State::default();
        let mut r = Recorder::default();
        apply(&g, &mut state, &mut r).unwrap();

        let report = apply(&graph("b"), &mut state, &mut r).unwrap();
        assert_eq!(report.updated, ["image", "app"]);
        assert_eq!(report.unchanged, ["host", "volume"]);
    }

    #[test]
    fn plan_marks_downstream_as_replace() {
        let g = graph("a");
        let mut state = State::default();
        apply(&g, &mut state, &mut Recorder::default()).unwrap();

        let steps = graph("b").plan(&state).unwrap();
        let actions: Vec<(&str, Action)> =
            steps.iter().map(|s| (s.id.as_str(), s.action)).collect();
        assert_eq!(
            actions,
            [
                ("host", Action::Keep),
                ("ready", Action::Run),
                ("image", Action::Replace),
                ("volume", Action::Keep),
                ("app", Action::Replace),
            ]
        );
    }

    #[test]
    fn plan_on_empty_state_creates_everything() {
        let steps = graph("a").plan(&State::default()).unwrap();
        assert!(
            steps
                .iter()
                .all(|s| matches!(s.action, Action::Create | Action::Run))
        );
    }

    #[test]
    fn undeclared_resources_are_deleted_first() {
        let g = graph("a");
        let mut state = State::default();
        let mut r = Recorder::default();
        apply(&g, &mut state, &mut r).unwrap();

        let mut smaller = Graph::new();
        smaller.add(Node::new("host", "host", json!({"type": "cx22"}))).unwrap();
        r.events.clear();
        let report = apply(&smaller, &mut state, &mut r).unwrap();

        assert_eq!(report.deleted, ["app", "volume", "image"]);
        assert_eq!(r.events, ["delete app", "delete volume", "delete image"]);
        assert_eq!(state.resources.len(), 1);
    }

    #[test]
    fn failure_keeps_partial_progress_and_names_the_stage() {
        let g = graph("a");
        let mut state = State::default();
        let mut r = Recorder {
            fail_on: Some("volume".into()),
            ..Recorder::default()
        };
        let mut saved = 0;
        let err = g
            .apply(&mut state, &mut r, &mut |_| {
                saved += 1;
                Ok(())
            })
            .unwrap_err();

        assert_eq!(err.stage(), Some("volume"));
        assert!(matches!(err.root(), DeployError::Build(_)));
        assert!(state.contains("image"));
        assert!(!state.contains("app"));
        assert_eq!(saved, 2);
    }

    #[test]
    fn destroy_deletes_dependents_first() {
        let g = graph("a");
        let mut state = State::default();
        let mut r = Recorder::default();
        apply(&g, &mut state, &mut r).unwrap();

        r.events.clear();
        let deleted = destroy(&mut state, &mut r, &mut |_| Ok(())).unwrap();
        assert_eq!(deleted, ["app", "volume", "image", "host"]);
        assert!(state.is_empty());
    }
}
