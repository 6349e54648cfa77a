//! Integration tests: layout JSON + data → node hierarchy → validation.
//!
//! Exercises the full `form-core` pipeline on a household form with a
//! repeating group of members.

use form_core::hierarchy::ROW_ID_KEY;
use form_core::validation::{REQUIRED_KEY, validate_all};
use form_core::{
    ComponentRegistry, Diagnostics, GeneratorInput, GeneratorOptions, HierarchyGenerator,
    LayoutPages, LayoutSet, MemorySink, NodeId, SummaryKind, TextResources, lint_layout,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;

fn layout() -> LayoutSet {
    let mut set = LayoutSet::new();
    set.add_page_json("household", include_str!("fixtures/household_layout.json"))
        .unwrap();
    set
}

fn data() -> Value {
    serde_json::from_str(include_str!("fixtures/household_data.json")).unwrap()
}

fn generator(sink: Arc<MemorySink>) -> HierarchyGenerator {
    HierarchyGenerator::new(
        Arc::new(ComponentRegistry::builtin()),
        Diagnostics::new(sink),
        GeneratorOptions::default(),
    )
}

fn row_ids(pages: &LayoutPages, group: &str) -> Vec<Vec<String>> {
    let node = pages.find_by_id(NodeId::intern(group), None).unwrap();
    node.group
        .as_ref()
        .unwrap()
        .rows
        .iter()
        .map(|row| row.items.iter().map(|i| pages[*i].id.to_string()).collect())
        .collect()
}

// ─── Structure ──────────────────────────────────────────────────────────

#[test]
fn one_row_node_set_per_array_element() {
    let set = layout();
    let mut data = data();
    data["household"]["members"]
        .as_array_mut()
        .unwrap()
        .truncate(2);

    let pages = generator(Arc::new(MemorySink::new())).generate_uncached(&GeneratorInput::new(&set, &data));
    assert_eq!(
        row_ids(&pages, "members"),
        vec![
            vec!["memberName-0", "memberAge-0", "guardian-0", "memberDocs-0"],
            vec!["memberName-1", "memberAge-1", "guardian-1", "memberDocs-1"],
        ]
    );
}

#[test]
fn appended_row_keeps_existing_ids() {
    let set = layout();
    let mut data = data();
    let engine = generator(Arc::new(MemorySink::new()));
    let before = engine.generate_uncached(&GeneratorInput::new(&set, &data));

    let fresh = uuid::Uuid::new_v4();
    data["household"]["members"]
        .as_array_mut()
        .unwrap()
        .push(json!({ ROW_ID_KEY: fresh.to_string() }));
    let after = engine.generate_uncached(&GeneratorInput::new(&set, &data));

    let before_rows = row_ids(&before, "members");
    let after_rows = row_ids(&after, "members");
    assert_eq!(after_rows.len(), before_rows.len() + 1);
    assert_eq!(&after_rows[..before_rows.len()], &before_rows[..]);

    let group = after
        .find_by_id(NodeId::intern("members"), None)
        .unwrap()
        .group
        .clone()
        .unwrap();
    let last = group.rows.last().unwrap();
    assert_eq!(last.uuid, fresh);
    assert!(group.rows[..group.rows.len() - 1].iter().all(|r| r.uuid != fresh));
}

// ─── Expressions ────────────────────────────────────────────────────────

#[test]
fn row_expressions_resolve_against_their_own_row() {
    let set = layout();
    let data = data();
    let texts = TextResources::from([(
        "applicant.name.title".to_string(),
        "Your name".to_string(),
    )]);
    let mut input = GeneratorInput::new(&set, &data);
    input.texts = Some(&texts);
    let pages = generator(Arc::new(MemorySink::new())).generate_uncached(&input);

    let hidden = |id: &str| pages.find_by_id(NodeId::intern(id), None).unwrap().hidden;
    assert!(!hidden("guardian-0"), "a 12 year old needs a guardian");
    assert!(hidden("guardian-1"), "a 40 year old does not");
    assert!(hidden("memberName-2"), "removed rows are hidden");
    assert!(!hidden("summaryMembers"));

    let applicant = pages.find_by_id(NodeId::intern("applicant"), None).unwrap();
    assert_eq!(applicant.texts["title"], "Your name");
}

// ─── Validation ─────────────────────────────────────────────────────────

#[test]
fn hidden_rows_are_not_validated_but_keep_their_data() {
    let set = layout();
    let data = data();
    let registry = ComponentRegistry::builtin();
    let pages = generator(Arc::new(MemorySink::new())).generate_uncached(&GeneratorInput::new(&set, &data));

    let found = validate_all(&pages, &registry, &data);
    let ids: Vec<(String, String)> = found
        .iter()
        .map(|v| (v.node_id.to_string(), v.message_key.clone()))
        .collect();
    assert_eq!(ids, vec![("guardian-0".to_string(), REQUIRED_KEY.to_string())]);
    assert_eq!(data["household"]["members"][2]["removed"], json!(true));
}

#[test]
fn summary_renders_group_target() {
    let set = layout();
    let data = data();
    let sink = Arc::new(MemorySink::new());
    let registry = ComponentRegistry::builtin();
    let pages = generator(sink.clone()).generate_uncached(&GeneratorInput::new(&set, &data));

    let summary = pages.find_by_id(NodeId::intern("summaryMembers"), None).unwrap();
    let (target, kind) = registry
        .summary_target(&pages, summary, &Diagnostics::new(sink.clone()))
        .unwrap();
    assert_eq!(pages[target].id, NodeId::intern("members"));
    assert_eq!(kind, SummaryKind::Group);
    assert!(sink.entries().is_empty());
}

#[test]
fn row_expressions_read_children_of_the_same_row() {
    let mut set = LayoutSet::new();
    let components = json!([
        {"id": "tasks", "type": "RepeatingGroup", "children": ["status"],
         "dataModelBindings": {"group": "tasks"},
         "hiddenRow": ["equals", ["component", "status"], "done"]},
        {"id": "status", "type": "Input", "dataModelBindings": {"simpleBinding": "tasks.status"}},
        {"id": "box", "type": "Group", "children": ["flag"],
         "hidden": ["equals", ["component", "flag"], "hide"]},
        {"id": "flag", "type": "Input", "dataModelBindings": {"simpleBinding": "flag"}}
    ]);
    set.add_page_json("p", &components.to_string()).unwrap();
    let data = json!({"flag": "hide", "tasks": [{"status": "open"}, {"status": "done"}]});
    let sink = Arc::new(MemorySink::new());
    let pages = generator(sink.clone()).generate_uncached(&GeneratorInput::new(&set, &data));

    let tasks = pages.find_by_id(NodeId::intern("tasks"), None).unwrap();
    let hidden: Vec<bool> = tasks.group.as_ref().unwrap().rows.iter().map(|r| r.hidden).collect();
    assert_eq!(hidden, vec![false, true]);
    let node_hidden = |id: &str| pages.find_by_id(NodeId::intern(id), None).unwrap().hidden;
    assert!(!node_hidden("status-0"));
    assert!(node_hidden("status-1"));
    assert!(node_hidden("box"));
    assert!(node_hidden("flag"));
    assert_eq!(sink.count_containing("dependency cycle"), 0);

    let diags = lint_layout(&set, &ComponentRegistry::builtin(), Some(&data));
    assert!(diags.iter().all(|d| d.rule != "expression-cycle"), "{diags:?}");
}

// ─── Lint ───────────────────────────────────────────────────────────────

#[test]
fn fixture_layout_lints_clean() {
    let diags = lint_layout(&layout(), &ComponentRegistry::builtin(), Some(&data()));
    assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
}
