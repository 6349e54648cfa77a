//! Component capability registry.
//!
//! Every component type is described by a table of plain functions and
//! flags rather than a type hierarchy. The hierarchy generator asks the
//! registry whether a type is known and how it contains children; the
//! validation pass and renderers ask for display data, validations and
//! summary behavior.

use crate::diagnostics::Diagnostics;
use crate::expr::ExprType;
use crate::hierarchy::{LayoutNode, LayoutPages};
use crate::model::{ChildRef, ComponentDef, DataModelBindings};
use crate::path::{leaf_to_string, pick};
use crate::validation::{self, ComponentValidation};
use petgraph::graph::NodeIndex;
use serde_json::Value;
use std::collections::HashMap;

/// Broad kind of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Binds to the data model and accepts input.
    Form,
    /// Display only.
    Presentation,
    /// Triggers something (navigation, submit).
    Action,
    /// Holds other components.
    Container,
}

/// How a Summary component renders its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryKind {
    Default,
    Group,
    Attachments,
    None,
}

/// Capability table for one component type.
#[derive(Debug, Clone, Copy)]
pub struct ComponentCapabilities {
    pub category: Category,
    /// Binding keys that must be present in `dataModelBindings`.
    pub binding_requirements: &'static [&'static str],
    /// Extra properties that may hold expressions, with their result type.
    pub expression_keys: &'static [(&'static str, ExprType)],
    /// Whether the component uploads attachments.
    pub uploads_attachments: bool,
    pub summary_kind: SummaryKind,
    /// Child references declared by a container definition.
    pub children: fn(&ComponentDef) -> Vec<ChildRef>,
    /// Human readable value, used by summaries.
    pub display_data: fn(&LayoutNode, &Value) -> String,
    /// Component-specific validations for a visible node.
    pub run_validation: fn(&LayoutNode, &Value) -> Vec<ComponentValidation>,
}

impl ComponentCapabilities {
    const fn new(category: Category) -> Self {
        Self {
            category,
            binding_requirements: &[],
            expression_keys: &[],
            uploads_attachments: false,
            summary_kind: SummaryKind::None,
            children: no_children,
            display_data: no_display_data,
            run_validation: no_validation,
        }
    }

    const fn form(binding_requirements: &'static [&'static str]) -> Self {
        Self {
            binding_requirements,
            summary_kind: SummaryKind::Default,
            display_data: simple_display_data,
            run_validation: validation::validate_required,
            ..Self::new(Category::Form)
        }
    }

    const fn container(summary_kind: SummaryKind) -> Self {
        Self {
            summary_kind,
            children: declared_children,
            ..Self::new(Category::Container)
        }
    }

    pub fn is_container(&self) -> bool {
        self.category == Category::Container
    }
}

/// Component type name → capabilities.
#[derive(Debug, Clone)]
pub struct ComponentRegistry {
    types: HashMap<String, ComponentCapabilities>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ComponentRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    /// The registry with every built-in component type.
    pub fn builtin() -> Self {
        const SIMPLE: &[&str] = &[DataModelBindings::SIMPLE];

        let mut reg = Self::empty();
        reg.register(
            "Input",
            ComponentCapabilities {
                expression_keys: &[("maxLength", ExprType::Number)],
                ..ComponentCapabilities::form(SIMPLE)
            },
        );
        reg.register(
            "TextArea",
            ComponentCapabilities {
                expression_keys: &[("maxLength", ExprType::Number)],
                ..ComponentCapabilities::form(SIMPLE)
            },
        );
        reg.register(
            "Checkboxes",
            ComponentCapabilities {
                display_data: multi_value_display_data,
                ..ComponentCapabilities::form(SIMPLE)
            },
        );
        reg.register("RadioButtons", ComponentCapabilities::form(SIMPLE));
        reg.register("Dropdown", ComponentCapabilities::form(SIMPLE));
        reg.register(
            "MultipleSelect",
            ComponentCapabilities {
                display_data: multi_value_display_data,
                ..ComponentCapabilities::form(SIMPLE)
            },
        );
        reg.register(
            "Datepicker",
            ComponentCapabilities {
                expression_keys: &[("minDate", ExprType::String), ("maxDate", ExprType::String)],
                ..ComponentCapabilities::form(SIMPLE)
            },
        );
        reg.register(
            "Address",
            ComponentCapabilities {
                display_data: address_display_data,
                ..ComponentCapabilities::form(&["address", "zipCode", "postPlace"])
            },
        );

        reg.register("Paragraph", ComponentCapabilities::new(Category::Presentation));
        reg.register("Header", ComponentCapabilities::new(Category::Presentation));
        reg.register("Button", ComponentCapabilities::new(Category::Action));
        reg.register(
            "NavigationButtons",
            ComponentCapabilities {
                expression_keys: &[("showBackButton", ExprType::Boolean)],
                ..ComponentCapabilities::new(Category::Action)
            },
        );

        let upload = ComponentCapabilities {
            uploads_attachments: true,
            summary_kind: SummaryKind::Attachments,
            display_data: multi_value_display_data,
            ..ComponentCapabilities::new(Category::Form)
        };
        reg.register("FileUpload", upload);
        reg.register("FileUploadWithTag", upload);

        reg.register("Summary", ComponentCapabilities::new(Category::Presentation));

        reg.register("Group", ComponentCapabilities::container(SummaryKind::Group));
        reg.register(
            "RepeatingGroup",
            ComponentCapabilities {
                binding_requirements: &[DataModelBindings::GROUP],
                run_validation: validation::validate_min_count,
                ..ComponentCapabilities::container(SummaryKind::Group)
            },
        );
        reg.register(
            "Grid",
            ComponentCapabilities {
                children: grid_children,
                ..ComponentCapabilities::container(SummaryKind::Group)
            },
        );
        reg.register(
            "AccordionGroup",
            ComponentCapabilities::container(SummaryKind::Group),
        );
        reg.register(
            "ButtonGroup",
            ComponentCapabilities::container(SummaryKind::None),
        );
        reg
    }

    /// Register or replace a component type.
    pub fn register(&mut self, component_type: &str, caps: ComponentCapabilities) {
        self.types.insert(component_type.to_string(), caps);
    }

    pub fn get(&self, component_type: &str) -> Option<&ComponentCapabilities> {
        self.types.get(component_type)
    }

    pub fn contains(&self, component_type: &str) -> bool {
        self.types.contains_key(component_type)
    }

    /// Resolve what a Summary node should render.
    ///
    /// Reports a configuration error and returns `None` when the summary
    /// has no target, the target does not exist, or the target's type has
    /// nothing to summarize.
    pub fn summary_target(
        &self,
        pages: &LayoutPages,
        summary: &LayoutNode,
        diagnostics: &Diagnostics,
    ) -> Option<(NodeIndex, SummaryKind)> {
        let Some(target_id) = summary.def.component_ref else {
            diagnostics.error_once(format!("Summary '{}' has no componentRef", summary.id));
            return None;
        };
        let Some(target) = pages.find_closest(target_id, summary) else {
            diagnostics.error_once(format!(
                "Summary '{}' refers to unknown component '{target_id}'",
                summary.id
            ));
            return None;
        };
        let node = &pages[target];
        match self.get(&node.component_type).map(|c| c.summary_kind) {
            Some(SummaryKind::None) | None => {
                diagnostics.error_once(format!(
                    "Summary '{}' cannot render component type '{}'",
                    summary.id, node.component_type
                ));
                None
            }
            Some(kind) => Some((target, kind)),
        }
    }
}

// ─── Capability functions ────────────────────────────────────────────────

fn no_children(_def: &ComponentDef) -> Vec<ChildRef> {
    Vec::new()
}

fn declared_children(def: &ComponentDef) -> Vec<ChildRef> {
    def.child_refs().collect()
}

/// Grid cells name their component: `rows[*].cells[*].component`.
fn grid_children(def: &ComponentDef) -> Vec<ChildRef> {
    let Some(Value::Array(rows)) = def.extra.get("rows") else {
        return declared_children(def);
    };
    rows.iter()
        .filter_map(|row| row.get("cells")?.as_array())
        .flatten()
        .filter_map(|cell| cell.get("component")?.as_str())
        .filter_map(ChildRef::parse)
        .collect()
}

fn no_display_data(_node: &LayoutNode, _data: &Value) -> String {
    String::new()
}

fn no_validation(_node: &LayoutNode, _data: &Value) -> Vec<ComponentValidation> {
    Vec::new()
}

fn simple_display_data(node: &LayoutNode, data: &Value) -> String {
    node.bindings
        .simple()
        .map(|path| leaf_to_string(pick(data, path)))
        .unwrap_or_default()
}

/// Comma-separated selections, or a bound list, joined for display.
fn multi_value_display_data(node: &LayoutNode, data: &Value) -> String {
    let path = node.bindings.list().or(node.bindings.simple());
    match path.and_then(|p| pick(data, p)) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| leaf_to_string(Some(v)))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        other => leaf_to_string(other)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn address_display_data(node: &LayoutNode, data: &Value) -> String {
    ["address", "zipCode", "postPlace"]
        .iter()
        .filter_map(|key| node.bindings.get(key))
        .map(|path| leaf_to_string(pick(data, path)))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn builtin_categories() {
        let reg = ComponentRegistry::builtin();
        assert_eq!(reg.get("Input").unwrap().category, Category::Form);
        assert!(reg.get("RepeatingGroup").unwrap().is_container());
        assert_eq!(
            reg.get("RepeatingGroup").unwrap().binding_requirements,
            &["group"]
        );
        assert!(reg.get("FileUploadWithTag").unwrap().uploads_attachments);
        assert!(!reg.contains("Likert2"));
    }

    #[test]
    fn grid_children_come_from_cells() {
        let def: ComponentDef = serde_json::from_value(json!({
            "id": "grid", "type": "Grid",
            "rows": [
                {"cells": [{"text": "header"}, {"component": "a"}]},
                {"cells": [{"component": "b"}]}
            ]
        }))
        .unwrap();
        let children: Vec<String> = grid_children(&def)
            .into_iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(children, vec!["a", "b"]);
    }
}
