//! Execution plan derived from a validated definition.
//!
//! The plan resolves the graph relationships the scheduler needs on every
//! tick: effective prerequisites (declared dependencies plus the implicit
//! edge from Start), controller/child links, and error-handler ownership.
//! It also groups steps into depth-based waves for display.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use weft_types::workflow::{StepKind, StepSpec, WorkflowDefinition};

/// Scheduling view over a [`WorkflowDefinition`].
#[derive(Debug, Clone)]
pub struct WorkflowPlan {
    /// Step ids in declaration order.
    order: Vec<String>,
    specs: HashMap<String, StepSpec>,
    /// Declared dependencies plus the implicit Start edge.
    effective_deps: HashMap<String, Vec<String>>,
    /// Child step -> controlling Condition/Loop/Parallel.
    controller_of: HashMap<String, String>,
    /// Guarded step -> error handler.
    handler_for: HashMap<String, String>,
    start: Option<String>,
}

impl WorkflowPlan {
    pub fn new(definition: &WorkflowDefinition) -> Self {
        let order: Vec<String> = definition.steps.iter().map(|s| s.id.clone()).collect();
        let specs: HashMap<String, StepSpec> = definition
            .steps
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();

        let mut controller_of = HashMap::new();
        let mut handler_for = HashMap::new();
        for step in &definition.steps {
            for child in step.controlled_steps() {
                controller_of.insert(child.to_string(), step.id.clone());
            }
            if let StepKind::ErrorHandler { guards, .. } = &step.kind {
                handler_for.insert(guards.clone(), step.id.clone());
            }
        }

        let start = definition.start_step().map(|s| s.id.clone());

        let mut effective_deps = HashMap::new();
        for step in &definition.steps {
            let mut deps = definition.dependencies_of(&step.id).to_vec();
            let implicit_root = deps.is_empty()
                && !matches!(step.kind, StepKind::Start | StepKind::ErrorHandler { .. })
                && !controller_of.contains_key(&step.id);
            if implicit_root {
                if let Some(start) = &start {
                    deps.push(start.clone());
                }
            }
            effective_deps.insert(step.id.clone(), deps);
        }

        Self {
            order,
            specs,
            effective_deps,
            controller_of,
            handler_for,
            start,
        }
    }

    /// Step ids in declaration order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn spec(&self, id: &str) -> Option<&StepSpec> {
        self.specs.get(id)
    }

    pub fn start(&self) -> Option<&str> {
        self.start.as_deref()
    }

    /// Prerequisites the scheduler waits on, including the implicit Start edge.
    pub fn prerequisites(&self, id: &str) -> &[String] {
        self.effective_deps
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn controller_of(&self, id: &str) -> Option<&str> {
        self.controller_of.get(id).map(String::as_str)
    }

    pub fn handler_for(&self, id: &str) -> Option<&str> {
        self.handler_for.get(id).map(String::as_str)
    }

    pub fn is_handler(&self, id: &str) -> bool {
        matches!(
            self.specs.get(id).map(|s| &s.kind),
            Some(StepKind::ErrorHandler { .. })
        )
    }

    /// Every step transitively controlled by `controller`, in declaration order.
    pub fn subtree(&self, controller: &str) -> Vec<String> {
        let mut found = HashSet::new();
        let mut stack: Vec<&str> = self
            .specs
            .get(controller)
            .map(StepSpec::controlled_steps)
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            if id == controller || !found.insert(id.to_string()) {
                continue;
            }
            if let Some(spec) = self.specs.get(id) {
                stack.extend(spec.controlled_steps());
            }
        }
        self.order
            .iter()
            .filter(|id| found.contains(id.as_str()))
            .cloned()
            .collect()
    }

    /// Group steps into waves by dependency depth.
    ///
    /// Steps in one wave have no dependency path between them. Controller
    /// edges count as dependencies, so branches land after their controller.
    /// Error handlers are left out. Returns `None` if the graph has a cycle,
    /// which cannot happen for a validated definition.
    pub fn waves(&self) -> Option<Vec<Vec<&StepSpec>>> {
        let mut graph = DiGraph::<&str, ()>::new();
        let nodes: HashMap<&str, _> = self
            .order
            .iter()
            .filter(|id| !self.is_handler(id))
            .map(|id| (id.as_str(), graph.add_node(id.as_str())))
            .collect();

        let mut parents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (id, &to) in &nodes {
            let mut incoming: Vec<&str> = self.prerequisites(id).iter().map(String::as_str).collect();
            if let Some(controller) = self.controller_of(id) {
                incoming.push(controller);
            }
            for dep in &incoming {
                if let Some(&from) = nodes.get(dep) {
                    graph.add_edge(from, to, ());
                }
            }
            parents.insert(id, incoming);
        }

        let sorted = toposort(&graph, None).ok()?;

        let mut depths: HashMap<&str, usize> = HashMap::new();
        for node in sorted {
            let id = graph[node];
            let depth = parents
                .get(id)
                .into_iter()
                .flatten()
                .filter_map(|p| depths.get(p).map(|d| d + 1))
                .max()
                .unwrap_or(0);
            depths.insert(id, depth);
        }

        let max_depth = depths.values().copied().max().unwrap_or(0);
        let mut waves: Vec<Vec<&StepSpec>> = vec![Vec::new(); max_depth + 1];
        for id in &self.order {
            if let (Some(depth), Some(spec)) = (depths.get(id.as_str()), self.specs.get(id)) {
                waves[*depth].push(spec);
            }
        }
        waves.retain(|w| !w.is_empty());
        Some(waves)
    }
}
