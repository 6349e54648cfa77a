//! Lint diagnostics for layout sets.
//!
//! Reports configuration defects without modifying the layout. The
//! hierarchy generator degrades gracefully on the same defects; lint gives
//! them a stable rule name so tooling can surface them per component.

use crate::hierarchy::{dependency_edges, evaluation_order, is_repeating, referenced_components};
use crate::id::NodeId;
use crate::model::{ChildRef, ComponentDef, DataModelBindings, LayoutSet, PageLayout};
use crate::path::pick;
use crate::registry::ComponentRegistry;
use serde_json::Value;
use std::collections::HashMap;

// ─── Diagnostic types ────────────────────────────────────────────────────

/// Severity of a lint finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LintSeverity {
    /// The generator will skip or misrender something.
    Error,
    /// Likely a mistake.
    Warning,
}

/// A single lint diagnostic for a layout component.
#[derive(Debug, Clone, PartialEq)]
pub struct LintDiagnostic {
    /// The component this diagnostic refers to.
    pub node_id: NodeId,
    pub page: String,
    /// Human-readable message.
    pub message: String,
    pub severity: LintSeverity,
    /// Short rule identifier (e.g. "unknown-type", "claimed-twice").
    pub rule: &'static str,
}

// ─── Public API ──────────────────────────────────────────────────────────

/// Run all lint rules over the layout set.
///
/// `data` enables the checks that need the data model's shape.
#[must_use]
pub fn lint_layout(
    layout: &LayoutSet,
    registry: &ComponentRegistry,
    data: Option<&Value>,
) -> Vec<LintDiagnostic> {
    let mut diags = Vec::new();
    for page in &layout.pages {
        let mut lint = PageLint {
            page,
            registry,
            owner: HashMap::new(),
            diags: &mut diags,
        };
        lint.unknown_types();
        lint.children();
        lint.bindings(data);
        lint.page_indices();
    }
    lint_expression_cycles(layout, registry, &mut diags);
    diags
}

// ─── Rules ───────────────────────────────────────────────────────────────

struct PageLint<'a> {
    page: &'a PageLayout,
    registry: &'a ComponentRegistry,
    /// Child id → first container claiming it.
    owner: HashMap<NodeId, NodeId>,
    diags: &'a mut Vec<LintDiagnostic>,
}

impl PageLint<'_> {
    fn push(&mut self, id: NodeId, severity: LintSeverity, rule: &'static str, message: String) {
        self.diags.push(LintDiagnostic {
            node_id: id,
            page: self.page.key.clone(),
            message,
            severity,
            rule,
        });
    }

    fn def(&self, id: NodeId) -> Option<&ComponentDef> {
        self.page.component(id)
    }

    fn unknown_types(&mut self) {
        let page = self.page;
        for def in &page.components {
            if !self.registry.contains(&def.component_type) {
                self.push(
                    def.id,
                    LintSeverity::Error,
                    "unknown-type",
                    format!("Unknown component type `{}` on `{}`.", def.component_type, def.id),
                );
            }
        }
    }

    /// `unknown-child` and `claimed-twice`; also fills the owner map.
    fn children(&mut self) {
        let page = self.page;
        for def in &page.components {
            let Some(caps) = self.registry.get(&def.component_type).copied() else {
                continue;
            };
            if !caps.is_container() {
                continue;
            }
            for child in (caps.children)(def) {
                if self.def(child.id).is_none() {
                    self.push(
                        def.id,
                        LintSeverity::Error,
                        "unknown-child",
                        format!("`{}` lists `{}`, which is not on this page.", def.id, child.id),
                    );
                    continue;
                }
                match self.owner.get(&child.id).copied() {
                    Some(first) if first != def.id => self.push(
                        child.id,
                        LintSeverity::Error,
                        "claimed-twice",
                        format!(
                            "`{}` is a child of both `{first}` and `{}`; only `{first}` keeps it.",
                            child.id, def.id
                        ),
                    ),
                    Some(_) => {}
                    None => {
                        self.owner.insert(child.id, def.id);
                    }
                }
            }
        }
    }

    /// Whether any ancestor of `id` is a repeating group.
    fn in_repeating_group(&self, id: NodeId) -> bool {
        let mut current = id;
        let mut hops = 0;
        while let Some(parent) = self.owner.get(&current).copied() {
            if self.def(parent).is_some_and(is_repeating) {
                return true;
            }
            current = parent;
            hops += 1;
            if hops > self.page.components.len() {
                break;
            }
        }
        false
    }

    /// `missing-binding` and `binding-type`.
    fn bindings(&mut self, data: Option<&Value>) {
        let page = self.page;
        for def in &page.components {
            let Some(caps) = self.registry.get(&def.component_type).copied() else {
                continue;
            };
            for key in caps.binding_requirements {
                if def.data_model_bindings.get(key).is_none() {
                    self.push(
                        def.id,
                        LintSeverity::Error,
                        "missing-binding",
                        format!("`{}` requires the data model binding `{key}`.", def.id),
                    );
                }
            }

            let bindings = &def.data_model_bindings;
            if caps.uploads_attachments
                && bindings.simple().is_none()
                && bindings.list().is_none()
                && self.in_repeating_group(def.id)
            {
                self.push(
                    def.id,
                    LintSeverity::Warning,
                    "missing-binding",
                    format!(
                        "`{}` is inside a repeating group but has no `{}` or `{}` binding; \
                         uploads cannot be tied to their row.",
                        def.id,
                        DataModelBindings::SIMPLE,
                        DataModelBindings::LIST
                    ),
                );
            }

            if let Some(data) = data
                && is_repeating(def)
                && !self.in_repeating_group(def.id)
                && let Some(path) = bindings.group()
                && let Some(value) = pick(data, path)
                && !value.is_array()
                && !value.is_null()
            {
                self.push(
                    def.id,
                    LintSeverity::Error,
                    "binding-type",
                    format!("Group binding `{path}` of `{}` does not point to an array.", def.id),
                );
            }
        }
    }

    /// `bad-page-index`: malformed `N:id` entries, and prefixes that do
    /// not match the group's `multiPage` setting.
    fn page_indices(&mut self) {
        let page = self.page;
        for def in &page.components {
            if def.children.is_empty() {
                continue;
            }
            let multi_page = def.edit.multi_page;
            for raw in &def.children {
                let problem = match ChildRef::parse(raw) {
                    None => Some(format!("`{raw}` is not a valid `pageIndex:childId` reference.")),
                    Some(child) if multi_page && child.page_index.is_none() => Some(format!(
                        "`{}` uses multiPage, so `{raw}` needs a page index prefix.",
                        def.id
                    )),
                    Some(child) if !multi_page && child.page_index.is_some() => Some(format!(
                        "`{raw}` has a page index but `{}` does not use multiPage.",
                        def.id
                    )),
                    Some(_) => None,
                };
                if let Some(message) = problem {
                    self.push(def.id, LintSeverity::Warning, "bad-page-index", message);
                }
            }
        }
    }
}

/// Error for every set of components whose expressions depend on each
/// other in a cycle.
fn lint_expression_cycles(
    layout: &LayoutSet,
    registry: &ComponentRegistry,
    diags: &mut Vec<LintDiagnostic>,
) {
    let mut ids = Vec::new();
    let mut containment = Vec::new();
    let mut references = Vec::new();
    let mut page_of = HashMap::new();
    for page in &layout.pages {
        for def in &page.components {
            ids.push(def.id);
            page_of.entry(def.id).or_insert_with(|| page.key.clone());
            let caps = registry.get(&def.component_type);
            for referenced in referenced_components(def, caps) {
                references.push((referenced, def.id));
            }
            for child in caps
                .filter(|c| c.is_container())
                .map(|c| (c.children)(def))
                .unwrap_or_default()
            {
                containment.push((def.id, child.id));
            }
        }
    }
    let edges = dependency_edges(&containment, &references);

    for (members, cyclic) in evaluation_order(&ids, &edges) {
        if !cyclic {
            continue;
        }
        let names: Vec<&str> = members.iter().map(|m| m.as_str()).collect();
        let first = members[0];
        diags.push(LintDiagnostic {
            node_id: first,
            page: page_of.get(&first).cloned().unwrap_or_default(),
            message: format!("Expressions form a dependency cycle: {}.", names.join(" → ")),
            severity: LintSeverity::Error,
            rule: "expression-cycle",
        });
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lint(components: Value, data: Option<&Value>) -> Vec<LintDiagnostic> {
        let mut set = LayoutSet::new();
        set.add_page_json("page", &components.to_string()).unwrap();
        lint_layout(&set, &ComponentRegistry::builtin(), data)
    }

    fn rules(diags: &[LintDiagnostic]) -> Vec<&'static str> {
        diags.iter().map(|d| d.rule).collect()
    }

    #[test]
    fn lint_unknown_type() {
        let diags = lint(json!([{"id": "x", "type": "Teleporter"}]), None);
        assert_eq!(rules(&diags), vec!["unknown-type"]);
    }

    #[test]
    fn lint_missing_binding() {
        let diags = lint(json!([{"id": "x", "type": "Input"}]), None);
        assert_eq!(rules(&diags), vec!["missing-binding"]);
        assert_eq!(diags[0].node_id, NodeId::intern("x"));
    }

    #[test]
    fn lint_unbound_upload_in_repeating_group() {
        let diags = lint(
            json!([
                {"id": "g", "type": "RepeatingGroup", "children": ["up"],
                 "dataModelBindings": {"group": "rows"}},
                {"id": "up", "type": "FileUpload"}
            ]),
            None,
        );
        assert!(diags.iter().any(|d| d.rule == "missing-binding" && d.node_id == NodeId::intern("up")));
    }

    #[test]
    fn lint_binding_type() {
        let layout = json!([
            {"id": "g", "type": "RepeatingGroup", "children": [],
             "dataModelBindings": {"group": "rows"}}
        ]);
        let data = json!({"rows": {"not": "an array"}});
        assert_eq!(rules(&lint(layout.clone(), Some(&data))), vec!["binding-type"]);
        assert!(lint(layout, Some(&json!({"rows": []}))).is_empty());
    }

    #[test]
    fn lint_children() {
        let diags = lint(
            json!([
                {"id": "a", "type": "Group", "children": ["c", "ghost"]},
                {"id": "b", "type": "Group", "children": ["c"]},
                {"id": "c", "type": "Paragraph"}
            ]),
            None,
        );
        assert_eq!(rules(&diags), vec!["unknown-child", "claimed-twice"]);
    }

    #[test]
    fn lint_page_indices() {
        let diags = lint(
            json!([
                {"id": "g", "type": "RepeatingGroup", "children": ["0:a", "b", "x:c"],
                 "edit": {"multiPage": true}, "dataModelBindings": {"group": "rows"}},
                {"id": "a", "type": "Paragraph"},
                {"id": "b", "type": "Paragraph"},
                {"id": "c", "type": "Paragraph"}
            ]),
            None,
        );
        let bad: Vec<&LintDiagnostic> = diags.iter().filter(|d| d.rule == "bad-page-index").collect();
        assert_eq!(bad.len(), 2);
    }

    #[test]
    fn lint_expression_cycle() {
        let diags = lint(
            json!([
                {"id": "a", "type": "Paragraph", "hidden": ["isHidden", "b"]},
                {"id": "b", "type": "Paragraph", "hidden": ["isHidden", "a"]}
            ]),
            None,
        );
        assert_eq!(rules(&diags), vec!["expression-cycle"]);
        assert!(diags[0].message.contains("a → b"));
    }

    #[test]
    fn lint_clean_layout_no_diags() {
        let diags = lint(
            json!([
                {"id": "g", "type": "RepeatingGroup", "children": ["name", "up"],
                 "dataModelBindings": {"group": "rows"}},
                {"id": "name", "type": "Input", "dataModelBindings": {"simpleBinding": "rows.name"}},
                {"id": "up", "type": "FileUpload", "dataModelBindings": {"list": "rows.files"}}
            ]),
            Some(&json!({"rows": [{"name": "x"}]})),
        );
        assert!(diags.is_empty(), "clean layout should have no diagnostics: {diags:?}");
    }
}
