//! Workflow definition parsing and validation.
//!
//! Raw definitions (YAML or JSON) are converted into the validated
//! [`WorkflowDefinition`] IR. Validation is a pure function that collects
//! every violation it finds rather than stopping at the first one.
//!
//! Dependencies can be declared either in the top-level `dependencies` map or
//! per step via `depends_on`; per-step `condition` entries likewise merge
//! into `conditions`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;
use weft_types::workflow::{StepKind, StepSpec, WorkflowDefinition};

const KNOWN_KINDS: &[&str] = &[
    "start",
    "agent_call",
    "condition",
    "loop",
    "parallel",
    "error_handler",
    "end",
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A single problem found in a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("workflow name '{0}' is invalid (use letters, digits, '-' and '_')")]
    InvalidName(String),

    #[error("workflow has no steps")]
    NoSteps,

    #[error("step #{index} has an empty id")]
    EmptyStepId { index: usize },

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("step '{step_id}' is missing field '{field}'")]
    MissingField { step_id: String, field: String },

    #[error("step '{step_id}' has unknown kind '{kind}'")]
    UnknownKind { step_id: String, kind: String },

    #[error("step '{step_id}' is malformed: {message}")]
    InvalidStep { step_id: String, message: String },

    #[error("step '{step_id}' references unknown step '{target}' in {field}")]
    DanglingReference {
        step_id: String,
        field: String,
        target: String,
    },

    #[error("dependency cycle between steps: {}", .steps.join(" -> "))]
    Cycle { steps: Vec<String> },

    #[error("workflow must have exactly one start step, found {0}")]
    StartCount(usize),

    #[error("workflow may have at most one end step, found {0}")]
    EndCount(usize),

    #[error("start step '{0}' cannot have dependencies or conditions")]
    StartHasDependencies(String),

    #[error("step '{step_id}' cannot depend on end step '{end}'")]
    DependsOnEnd { step_id: String, end: String },

    #[error("condition '{step_id}' has conflicting branches: {message}")]
    BranchConflict { step_id: String, message: String },

    #[error("step '{step_id}' must list at least one step in {field}")]
    EmptyStepList { step_id: String, field: String },

    #[error("loop '{0}' must allow at least one iteration")]
    ZeroIterations(String),

    #[error("step '{step_id}' is controlled by more than one step: {}", .controllers.join(", "))]
    MultipleControllers {
        step_id: String,
        controllers: Vec<String>,
    },

    #[error("step '{step_id}' cannot be controlled by '{controller}'")]
    Uncontrollable { step_id: String, controller: String },

    #[error("error handler '{step_id}' is misused: {message}")]
    HandlerMisuse { step_id: String, message: String },

    #[error("step '{guarded}' has more than one error handler: {}", .handlers.join(", "))]
    DuplicateHandler {
        guarded: String,
        handlers: Vec<String>,
    },

    #[error("step '{step_id}' depends on '{dependency}' inside the body of loop '{loop_id}'; depend on the loop instead")]
    LoopBodyEscape {
        step_id: String,
        dependency: String,
        loop_id: String,
    },
}

/// A rejected definition, listing every violation found.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid workflow definition: {}", render_violations(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    pub fn has_cycle(&self) -> bool {
        self.violations
            .iter()
            .any(|v| matches!(v, Violation::Cycle { .. }))
    }

    pub fn has_dangling_reference(&self) -> bool {
        self.violations
            .iter()
            .any(|v| matches!(v, Violation::DanglingReference { .. }))
    }
}

fn render_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from loading a definition.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

// ---------------------------------------------------------------------------
// Raw definition
// ---------------------------------------------------------------------------

/// Definition as authored, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawWorkflowDefinition {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub steps: Vec<RawStep>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub conditions: BTreeMap<String, String>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// A step as authored. Kind-specific fields stay untyped until validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawStep {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

/// Parse a YAML workflow definition (JSON is valid YAML) and validate it.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let raw: RawWorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    Ok(validate(raw)?)
}

/// Parse a JSON workflow definition and validate it.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let raw: RawWorkflowDefinition =
        serde_json::from_str(json).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    Ok(validate(raw)?)
}

/// Load and validate a workflow file (`.json` as JSON, anything else as YAML).
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a raw definition and convert it into the IR.
pub fn validate(raw: RawWorkflowDefinition) -> Result<WorkflowDefinition, ValidationError> {
    let mut violations = Vec::new();

    if !is_valid_name(&raw.name) {
        violations.push(Violation::InvalidName(raw.name.clone()));
    }
    if raw.steps.is_empty() {
        violations.push(Violation::NoSteps);
    }

    let mut dependencies = raw.dependencies;
    let mut conditions = raw.conditions;
    let mut declared: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    let mut steps = Vec::with_capacity(raw.steps.len());

    for (index, raw_step) in raw.steps.into_iter().enumerate() {
        if raw_step.id.is_empty() {
            violations.push(Violation::EmptyStepId { index });
            continue;
        }
        if !seen.insert(raw_step.id.clone()) {
            violations.push(Violation::DuplicateStepId(raw_step.id.clone()));
            continue;
        }
        declared.push(raw_step.id.clone());

        if !raw_step.depends_on.is_empty() {
            let deps = dependencies.entry(raw_step.id.clone()).or_default();
            for dep in raw_step.depends_on {
                if !deps.contains(&dep) {
                    deps.push(dep);
                }
            }
        }
        if let Some(condition) = raw_step.condition {
            conditions.insert(raw_step.id.clone(), condition);
        }

        match parse_kind(&raw_step.id, raw_step.fields) {
            Ok(kind) => steps.push(StepSpec {
                name: raw_step.name.unwrap_or_else(|| raw_step.id.clone()),
                id: raw_step.id,
                kind,
            }),
            Err(violation) => violations.push(violation),
        }
    }

    let definition = WorkflowDefinition {
        id: raw.id.unwrap_or_else(Uuid::now_v7),
        name: raw.name,
        description: raw.description,
        timeout_secs: raw.timeout_secs,
        steps,
        dependencies,
        conditions,
        variables: raw.variables,
        metadata: raw.metadata,
    };

    let declared: HashSet<&str> = declared.iter().map(String::as_str).collect();
    violations.extend(structural_violations(&definition, &declared));

    if violations.is_empty() {
        Ok(definition)
    } else {
        Err(ValidationError { violations })
    }
}

/// Re-check a definition that did not come through [`validate`] (e.g. one
/// built in code or restored from storage).
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<(), ValidationError> {
    let mut violations = Vec::new();
    if !is_valid_name(&definition.name) {
        violations.push(Violation::InvalidName(definition.name.clone()));
    }
    if definition.steps.is_empty() {
        violations.push(Violation::NoSteps);
    }

    let mut declared = HashSet::new();
    for (index, step) in definition.steps.iter().enumerate() {
        if step.id.is_empty() {
            violations.push(Violation::EmptyStepId { index });
        } else if !declared.insert(step.id.as_str()) {
            violations.push(Violation::DuplicateStepId(step.id.clone()));
        }
    }
    violations.extend(structural_violations(definition, &declared));

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { violations })
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn parse_kind(
    step_id: &str,
    fields: serde_json::Map<String, Value>,
) -> Result<StepKind, Violation> {
    let kind = match fields.get("kind") {
        None => {
            return Err(Violation::MissingField {
                step_id: step_id.to_string(),
                field: "kind".to_string(),
            });
        }
        Some(Value::String(kind)) => kind.clone(),
        Some(other) => other.to_string(),
    };
    if !KNOWN_KINDS.contains(&kind.as_str()) {
        return Err(Violation::UnknownKind {
            step_id: step_id.to_string(),
            kind,
        });
    }

    serde_json::from_value(Value::Object(fields)).map_err(|e| {
        let message = e.to_string();
        match missing_field_name(&message) {
            Some(field) => Violation::MissingField {
                step_id: step_id.to_string(),
                field,
            },
            None => Violation::InvalidStep {
                step_id: step_id.to_string(),
                message,
            },
        }
    })
}

/// Extract `x` from serde's "missing field `x`" message.
fn missing_field_name(message: &str) -> Option<String> {
    let rest = message.strip_prefix("missing field `")?;
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}

fn structural_violations(
    definition: &WorkflowDefinition,
    declared: &HashSet<&str>,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    let dangling = |step_id: &str, field: &str, target: &str| Violation::DanglingReference {
        step_id: step_id.to_string(),
        field: field.to_string(),
        target: target.to_string(),
    };

    // References in the dependency and condition maps.
    for (step_id, deps) in &definition.dependencies {
        if !declared.contains(step_id.as_str()) {
            violations.push(dangling(step_id, "dependencies", step_id));
        }
        for dep in deps {
            if !declared.contains(dep.as_str()) {
                violations.push(dangling(step_id, "dependencies", dep));
            }
        }
    }
    for step_id in definition.conditions.keys() {
        if !declared.contains(step_id.as_str()) {
            violations.push(dangling(step_id, "conditions", step_id));
        }
    }

    // Start / End cardinality.
    let starts: Vec<&StepSpec> = definition
        .steps
        .iter()
        .filter(|s| matches!(s.kind, StepKind::Start))
        .collect();
    if starts.len() != 1 {
        violations.push(Violation::StartCount(starts.len()));
    }
    for start in &starts {
        if !definition.dependencies_of(&start.id).is_empty()
            || definition.conditions.contains_key(&start.id)
        {
            violations.push(Violation::StartHasDependencies(start.id.clone()));
        }
    }
    let ends: Vec<&str> = definition
        .steps
        .iter()
        .filter(|s| matches!(s.kind, StepKind::End))
        .map(|s| s.id.as_str())
        .collect();
    if ends.len() > 1 {
        violations.push(Violation::EndCount(ends.len()));
    }
    for (step_id, deps) in &definition.dependencies {
        for end in deps.iter().filter(|d| ends.contains(&d.as_str())) {
            violations.push(Violation::DependsOnEnd {
                step_id: step_id.clone(),
                end: end.clone(),
            });
        }
    }

    // Kind-specific checks and controller bookkeeping.
    let kinds: HashMap<&str, &StepKind> = definition
        .steps
        .iter()
        .map(|s| (s.id.as_str(), &s.kind))
        .collect();
    let mut controllers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut handlers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for step in &definition.steps {
        let id = step.id.as_str();
        match &step.kind {
            StepKind::Condition {
                true_branch,
                false_branch,
                ..
            } => {
                for (field, target) in [("true_branch", true_branch), ("false_branch", false_branch)] {
                    if !declared.contains(target.as_str()) {
                        violations.push(dangling(id, field, target));
                    }
                }
                if true_branch == false_branch {
                    violations.push(Violation::BranchConflict {
                        step_id: id.to_string(),
                        message: format!("both branches are '{true_branch}'"),
                    });
                }
                if true_branch == id || false_branch == id {
                    violations.push(Violation::BranchConflict {
                        step_id: id.to_string(),
                        message: "a branch cannot be the condition itself".to_string(),
                    });
                }
            }
            StepKind::Loop {
                body,
                max_iterations,
                ..
            } => {
                if *max_iterations == 0 {
                    violations.push(Violation::ZeroIterations(id.to_string()));
                }
                check_step_list(id, "body", body, declared, &mut violations);
            }
            StepKind::Parallel { branches } => {
                check_step_list(id, "branches", branches, declared, &mut violations);
            }
            StepKind::ErrorHandler { guards, .. } => {
                if !declared.contains(guards.as_str()) {
                    violations.push(dangling(id, "guards", guards));
                } else if matches!(kinds.get(guards.as_str()), Some(StepKind::ErrorHandler { .. })) {
                    violations.push(Violation::HandlerMisuse {
                        step_id: id.to_string(),
                        message: format!("cannot guard another error handler '{guards}'"),
                    });
                }
                handlers.entry(guards.as_str()).or_default().push(id);

                let referenced = definition.dependencies.contains_key(id)
                    || definition.conditions.contains_key(id)
                    || definition
                        .dependencies
                        .values()
                        .any(|deps| deps.iter().any(|d| d == id));
                if referenced {
                    violations.push(Violation::HandlerMisuse {
                        step_id: id.to_string(),
                        message: "error handlers cannot take part in dependencies or conditions"
                            .to_string(),
                    });
                }
            }
            StepKind::Start | StepKind::AgentCall { .. } | StepKind::End => {}
        }

        for child in step.controlled_steps() {
            let owners = controllers.entry(child).or_default();
            if child != id && !owners.contains(&id) {
                owners.push(id);
            }
        }
    }

    for (child, owners) in &controllers {
        if owners.len() > 1 {
            violations.push(Violation::MultipleControllers {
                step_id: child.to_string(),
                controllers: owners.iter().map(|s| s.to_string()).collect(),
            });
        }
        if let Some(kind) = kinds.get(child) {
            if matches!(
                kind,
                StepKind::Start | StepKind::End | StepKind::ErrorHandler { .. }
            ) {
                violations.push(Violation::Uncontrollable {
                    step_id: child.to_string(),
                    controller: owners[0].to_string(),
                });
            }
        }
    }

    for (guarded, owners) in &handlers {
        if owners.len() > 1 {
            violations.push(Violation::DuplicateHandler {
                guarded: guarded.to_string(),
                handlers: owners.iter().map(|s| s.to_string()).collect(),
            });
        }
    }

    // Steps outside a loop must depend on the loop, not on its body.
    for step in &definition.steps {
        if let StepKind::Loop { .. } = step.kind {
            let body = subtree(&definition.steps, &step.id);
            for (dependent, deps) in &definition.dependencies {
                if body.contains(dependent.as_str()) || dependent == &step.id {
                    continue;
                }
                for dep in deps {
                    if body.contains(dep.as_str()) {
                        violations.push(Violation::LoopBodyEscape {
                            step_id: dependent.clone(),
                            dependency: dep.clone(),
                            loop_id: step.id.clone(),
                        });
                    }
                }
            }
        }
    }

    violations.extend(cycle_violations(definition));
    violations
}

fn check_step_list(
    id: &str,
    field: &str,
    list: &[String],
    declared: &HashSet<&str>,
    violations: &mut Vec<Violation>,
) {
    if list.is_empty() {
        violations.push(Violation::EmptyStepList {
            step_id: id.to_string(),
            field: field.to_string(),
        });
    }
    for target in list {
        if target == id {
            violations.push(Violation::InvalidStep {
                step_id: id.to_string(),
                message: format!("{field} cannot contain the step itself"),
            });
        } else if !declared.contains(target.as_str()) {
            violations.push(Violation::DanglingReference {
                step_id: id.to_string(),
                field: field.to_string(),
                target: target.clone(),
            });
        }
    }
}

/// Every step transitively controlled by `root` (excluding `root`).
fn subtree<'a>(steps: &'a [StepSpec], root: &str) -> HashSet<&'a str> {
    let by_id: HashMap<&str, &StepSpec> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut found = HashSet::new();
    let mut stack: Vec<&str> = by_id
        .get(root)
        .map(|s| s.controlled_steps())
        .unwrap_or_default();
    while let Some(id) = stack.pop() {
        if id == root || !found.insert(id) {
            continue;
        }
        if let Some(step) = by_id.get(id) {
            stack.extend(step.controlled_steps());
        }
    }
    found
}

/// Report every strongly connected component of the dependency graph
/// (including controller -> controlled edges) as a cycle.
fn cycle_violations(definition: &WorkflowDefinition) -> Vec<Violation> {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, _> = definition
        .steps
        .iter()
        .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
        .collect();

    for step in &definition.steps {
        let to = nodes[step.id.as_str()];
        for dep in definition.dependencies_of(&step.id) {
            if let Some(&from) = nodes.get(dep.as_str()) {
                graph.add_edge(from, to, ());
            }
        }
        for child in step.controlled_steps() {
            if let Some(&child_idx) = nodes.get(child) {
                graph.add_edge(to, child_idx, ());
            }
        }
    }

    let order: HashMap<&str, usize> = definition
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    tarjan_scc(&graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1 || graph.contains_edge(component[0], component[0])
        })
        .map(|component| {
            let mut steps: Vec<&str> = component.iter().map(|&n| graph[n]).collect();
            steps.sort_by_key(|id| order[id]);
            Violation::Cycle {
                steps: steps.into_iter().map(str::to_string).collect(),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR: &str = r#"
name: linear
steps:
  - id: start
    kind: start
  - id: a1
    kind: agent_call
    agent_ref: solver
    input_mapping:
      query: "{{ input.query }}"
  - id: end
    kind: end
dependencies:
  a1: [start]
  end: [a1]
"#;

    fn violations(yaml: &str) -> Vec<Violation> {
        match parse_workflow_yaml(yaml) {
            Err(DefinitionError::Invalid(err)) => err.violations,
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn parses_linear_workflow() {
        let def = parse_workflow_yaml(LINEAR).unwrap();
        assert_eq!(def.name, "linear");
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.steps[1].name, "a1");
        assert_eq!(def.dependencies_of("end"), ["a1".to_string()]);
        assert!(matches!(def.steps[1].kind, StepKind::AgentCall { .. }));
    }

    #[test]
    fn step_level_depends_on_merges_into_dependencies() {
        let def = parse_workflow_yaml(
            r#"
name: inline-deps
steps:
  - id: start
    kind: start
  - id: a1
    kind: agent_call
    agent_ref: solver
    depends_on: [start]
    condition: "input.enabled"
"#,
        )
        .unwrap();
        assert_eq!(def.dependencies_of("a1"), ["start".to_string()]);
        assert_eq!(def.conditions["a1"], "input.enabled");
    }

    #[test]
    fn parses_json_definition() {
        let def = parse_workflow_json(
            r#"{"name":"j","steps":[{"id":"start","kind":"start"},{"id":"end","kind":"end"}],
                "dependencies":{"end":["start"]}}"#,
        )
        .unwrap();
        assert_eq!(def.steps.len(), 2);
    }

    #[test]
    fn rejects_cycle_and_reports_all_violations() {
        let found = violations(
            r#"
name: cyclic
steps:
  - id: start
    kind: start
  - id: a
    kind: agent_call
    agent_ref: x
  - id: b
    kind: agent_call
    agent_ref: y
dependencies:
  a: [b]
  b: [a]
  ghost: [start]
"#,
        );

        assert!(found.contains(&Violation::Cycle {
            steps: vec!["a".to_string(), "b".to_string()]
        }));
        assert!(found.contains(&Violation::DanglingReference {
            step_id: "ghost".to_string(),
            field: "dependencies".to_string(),
            target: "ghost".to_string(),
        }));
    }

    #[test]
    fn rejects_self_dependency() {
        let found = violations(
            r#"
name: selfish
steps:
  - id: start
    kind: start
  - id: a
    kind: agent_call
    agent_ref: x
dependencies:
  a: [a]
"#,
        );
        assert_eq!(
            found,
            vec![Violation::Cycle {
                steps: vec!["a".to_string()]
            }]
        );
    }

    #[test]
    fn rejects_missing_kind_fields_and_unknown_kinds() {
        let found = violations(
            r#"
name: broken
steps:
  - id: start
    kind: start
  - id: a
    kind: agent_call
  - id: b
    kind: teleport
  - id: c
    agent_ref: x
"#,
        );
        assert!(found.contains(&Violation::MissingField {
            step_id: "a".to_string(),
            field: "agent_ref".to_string(),
        }));
        assert!(found.contains(&Violation::UnknownKind {
            step_id: "b".to_string(),
            kind: "teleport".to_string(),
        }));
        assert!(found.contains(&Violation::MissingField {
            step_id: "c".to_string(),
            field: "kind".to_string(),
        }));
    }

    #[test]
    fn rejects_duplicate_ids_and_bad_name() {
        let found = violations(
            r#"
name: "bad name!"
steps:
  - id: start
    kind: start
  - id: start
    kind: end
"#,
        );
        assert!(found.contains(&Violation::InvalidName("bad name!".to_string())));
        assert!(found.contains(&Violation::DuplicateStepId("start".to_string())));
    }

    #[test]
    fn requires_exactly_one_start() {
        let found = violations(
            r#"
name: no-start
steps:
  - id: end
    kind: end
"#,
        );
        assert_eq!(found, vec![Violation::StartCount(0)]);
    }

    #[test]
    fn condition_branch_rules() {
        let found = violations(
            r#"
name: cond
steps:
  - id: start
    kind: start
  - id: c1
    kind: condition
    expression: "flag"
    true_branch: a
    false_branch: a
  - id: a
    kind: agent_call
    agent_ref: x
"#,
        );
        assert!(matches!(found[0], Violation::BranchConflict { .. }));
    }

    #[test]
    fn loop_rules() {
        let found = violations(
            r#"
name: loops
steps:
  - id: start
    kind: start
  - id: l1
    kind: loop
    body: [b1]
    max_iterations: 0
    exit_condition: "false"
  - id: b1
    kind: agent_call
    agent_ref: x
  - id: after
    kind: agent_call
    agent_ref: y
dependencies:
  after: [b1]
"#,
        );
        assert!(found.contains(&Violation::ZeroIterations("l1".to_string())));
        assert!(found.contains(&Violation::LoopBodyEscape {
            step_id: "after".to_string(),
            dependency: "b1".to_string(),
            loop_id: "l1".to_string(),
        }));
    }

    #[test]
    fn handler_rules() {
        let found = violations(
            r#"
name: handlers
steps:
  - id: start
    kind: start
  - id: a
    kind: agent_call
    agent_ref: x
  - id: h1
    kind: error_handler
    guards: a
    action: retry
  - id: h2
    kind: error_handler
    guards: a
    action: skip
  - id: h3
    kind: error_handler
    guards: nowhere
    action: skip
"#,
        );
        assert!(found.contains(&Violation::DuplicateHandler {
            guarded: "a".to_string(),
            handlers: vec!["h1".to_string(), "h2".to_string()],
        }));
        assert!(found.contains(&Violation::DanglingReference {
            step_id: "h3".to_string(),
            field: "guards".to_string(),
            target: "nowhere".to_string(),
        }));
    }

    #[test]
    fn step_controlled_twice_is_rejected() {
        let found = violations(
            r#"
name: shared-branch
steps:
  - id: start
    kind: start
  - id: p1
    kind: parallel
    branches: [a]
  - id: p2
    kind: parallel
    branches: [a]
  - id: a
    kind: agent_call
    agent_ref: x
"#,
        );
        assert_eq!(
            found,
            vec![Violation::MultipleControllers {
                step_id: "a".to_string(),
                controllers: vec!["p1".to_string(), "p2".to_string()],
            }]
        );
    }

    #[test]
    fn validation_error_display_lists_every_violation() {
        let err = ValidationError {
            violations: vec![
                Violation::StartCount(0),
                Violation::DuplicateStepId("a".to_string()),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("exactly one start step"));
        assert!(text.contains("duplicate step id 'a'"));
        assert!(!err.has_cycle());
    }

    #[test]
    fn load_workflow_file_reads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linear.yaml");
        std::fs::write(&path, LINEAR).unwrap();

        let def = load_workflow_file(&path).unwrap();
        assert_eq!(def.name, "linear");
        assert!(validate_definition(&def).is_ok());
    }
}
