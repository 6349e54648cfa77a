//! Frontend component validations.
//!
//! Validations only run on visible nodes: a node inside a hidden row or
//! under a hidden ancestor is skipped, while its data stays untouched.

use crate::hierarchy::{LayoutNode, LayoutPages};
use crate::id::NodeId;
use crate::model::{ComponentDef, Trigger};
use crate::path::pick;
use crate::registry::ComponentRegistry;
use petgraph::graph::NodeIndex;
use serde::Serialize;
use serde_json::Value;

pub const REQUIRED_KEY: &str = "form_filler.error_required";
pub const MIN_ITEMS_KEY: &str = "validation_errors.minItems";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidationSeverity {
    Error,
    Warning,
}

/// When a validation becomes visible to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidationCategory {
    /// Shown once the user tries to move on (empty required field,
    /// too few rows).
    Required,
    /// Shown as soon as it occurs.
    Component,
}

/// One validation message for one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentValidation {
    pub node_id: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding_key: Option<String>,
    pub message_key: String,
    pub params: Vec<String>,
    pub severity: ValidationSeverity,
    pub category: ValidationCategory,
}

/// Required check: every bound field of a required node must be non-empty.
pub fn validate_required(node: &LayoutNode, data: &Value) -> Vec<ComponentValidation> {
    if !node.required {
        return Vec::new();
    }
    let title = node.texts.get("title").cloned().unwrap_or_default();
    node.bindings
        .iter()
        .filter(|(_, path)| is_empty(pick(data, path)))
        .map(|(key, _)| ComponentValidation {
            node_id: node.id,
            binding_key: Some(key.to_string()),
            message_key: REQUIRED_KEY.to_string(),
            params: vec![title.clone()],
            severity: ValidationSeverity::Error,
            category: ValidationCategory::Required,
        })
        .collect()
}

/// Repeating groups need at least `minCount` visible rows.
///
/// The message parameter is the group's configured minimum.
pub fn validate_min_count(node: &LayoutNode, _data: &Value) -> Vec<ComponentValidation> {
    let Some(group) = &node.group else {
        return Vec::new();
    };
    if node.bindings.group().is_none() {
        return Vec::new();
    }
    let visible = group.visible_rows().count();
    if visible >= group.min_count {
        return Vec::new();
    }
    vec![ComponentValidation {
        node_id: node.id,
        binding_key: None,
        message_key: MIN_ITEMS_KEY.to_string(),
        params: vec![group.min_count.to_string()],
        severity: ValidationSeverity::Error,
        category: ValidationCategory::Required,
    }]
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

/// Run the registered validation of every visible node.
pub fn validate_all(
    pages: &LayoutPages,
    registry: &ComponentRegistry,
    data: &Value,
) -> Vec<ComponentValidation> {
    pages
        .flat()
        .filter(|(_, node)| !node.hidden)
        .flat_map(|(_, node)| validate_node(node, registry, data))
        .collect()
}

/// Validations of one node, or nothing when it is hidden or of unknown type.
pub fn validate_node(
    node: &LayoutNode,
    registry: &ComponentRegistry,
    data: &Value,
) -> Vec<ComponentValidation> {
    if node.hidden {
        return Vec::new();
    }
    registry
        .get(&node.component_type)
        .map(|caps| (caps.run_validation)(node, data))
        .unwrap_or_default()
}

// ─── Group triggers ──────────────────────────────────────────────────────

/// Validation scope a repeating group asks for when a row is opened or
/// closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupTrigger {
    /// Validate the group and every row.
    Group,
    /// Validate only the row in question.
    Row,
}

/// The group's trigger. A whole-group trigger wins over a row trigger when
/// both are configured.
pub fn group_trigger(def: &ComponentDef) -> Option<GroupTrigger> {
    if def.has_trigger(Trigger::Validation) {
        Some(GroupTrigger::Group)
    } else if def.has_trigger(Trigger::ValidateRow) {
        Some(GroupTrigger::Row)
    } else {
        None
    }
}

/// Validate a node and all its visible descendants.
pub fn validate_subtree(
    pages: &LayoutPages,
    root: NodeIndex,
    registry: &ComponentRegistry,
    data: &Value,
) -> Vec<ComponentValidation> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(idx) = stack.pop() {
        let node = &pages[idx];
        if node.hidden {
            continue;
        }
        out.extend(validate_node(node, registry, data));
        let mut children = pages.children(idx);
        children.reverse();
        stack.extend(children);
    }
    out
}

/// Validate the children of one row of a group.
pub fn validate_row(
    pages: &LayoutPages,
    group: NodeIndex,
    row_index: usize,
    registry: &ComponentRegistry,
    data: &Value,
) -> Vec<ComponentValidation> {
    let Some(row) = pages[group]
        .group
        .as_ref()
        .and_then(|g| g.rows.iter().find(|r| r.index == row_index))
    else {
        return Vec::new();
    };
    if row.hidden {
        return Vec::new();
    }
    row.items
        .iter()
        .flat_map(|item| validate_subtree(pages, *item, registry, data))
        .collect()
}
