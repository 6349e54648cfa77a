//! Integration tests: repeating groups, attachments, pages and code lists
//! driven through a whole session.

mod common;

use common::MemoryBackend;
use form_core::validation::REQUIRED_KEY;
use form_core::{Diagnostics, LayoutNode, LayoutPage, LayoutSet, NodeId};
use form_session::{AttachmentFile, FormSession, NodeRenderer, OptionItem, RowDeletion, SessionConfig};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use uuid::Uuid;

const BIKE: &str = "0c7a5f5e-8d6b-4b39-9a57-3f1e2d4c5b6a";
const LAMP: &str = "7d2e9b1c-4a3f-4e8d-b5c6-1f0a9e8d7c6b";

fn uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap()
}

fn id(s: &str) -> NodeId {
    NodeId::intern(s)
}

fn layout() -> LayoutSet {
    let mut set = LayoutSet::new();
    set.add_page_json("items", include_str!("fixtures/items_layout.json"))
        .unwrap();
    set.add_page_json(
        "summary",
        &json!([{"id": "total", "type": "Paragraph"}]).to_string(),
    )
    .unwrap();
    set
}

fn data() -> Value {
    serde_json::from_str(include_str!("fixtures/items_data.json")).unwrap()
}

fn session_with(backend: MemoryBackend) -> (FormSession<MemoryBackend>, Arc<MemoryBackend>) {
    let backend = Arc::new(backend);
    let session = FormSession::new(
        SessionConfig::default(),
        Arc::clone(&backend),
        layout(),
        data(),
        Diagnostics::default(),
    );
    (session, backend)
}

fn session() -> (FormSession<MemoryBackend>, Arc<MemoryBackend>) {
    session_with(MemoryBackend::new(data()))
}

fn row_ids(session: &FormSession<MemoryBackend>) -> Vec<Uuid> {
    let pages = session.nodes();
    let group = pages.find_by_id(id("items"), None).unwrap();
    group.group.as_ref().unwrap().rows.iter().map(|r| r.uuid).collect()
}

fn receipt(name: &str) -> AttachmentFile {
    AttachmentFile {
        name: name.to_string(),
        content_type: "application/pdf".to_string(),
        bytes: b"%PDF".to_vec(),
        tags: Vec::new(),
    }
}

#[derive(Default)]
struct Recorder(Vec<String>);

impl NodeRenderer for Recorder {
    fn render(&mut self, node: &LayoutNode, _page: &LayoutPage) {
        self.0.push(node.id.to_string());
    }
}

// ─── Rows ───────────────────────────────────────────────────────────────

#[test]
fn added_row_keeps_existing_row_ids() {
    let (session, _) = session();
    assert_eq!(row_ids(&session), vec![uuid(BIKE), uuid(LAMP)]);

    let added = session.add_row(id("items")).unwrap();
    assert_eq!(row_ids(&session), vec![uuid(BIKE), uuid(LAMP), added]);
    assert_eq!(
        session.store().pick("items[2]"),
        Some(&json!({"altinnRowId": added.to_string()}))
    );
    // showTable without alwaysShowAddButton does not open the new row.
    assert_eq!(session.group_state(id("items")).editing(), None);
}

#[test]
fn group_stops_adding_at_max_count() {
    let (session, _) = session();
    for _ in 0..3 {
        assert!(session.add_row(id("items")).is_some());
    }
    assert_eq!(session.add_row(id("items")), None);
    assert_eq!(row_ids(&session).len(), 5);
}

#[test]
fn hidden_row_is_skipped_but_keeps_its_data() {
    let (session, _) = session();
    {
        let mut store = session.store();
        let now = tokio::time::Instant::now();
        store.set_leaf_value("items[1].archived", json!(true), now, None);
        store.set_leaf_value("items[1].name", json!(""), now, None);
        store.debounce(&[]);
    }

    let mut recorder = Recorder::default();
    assert!(session.render_page("items", &mut recorder));
    assert_eq!(recorder.0, vec!["owner", "items", "itemName-0", "receipt-0"]);
    assert_eq!(session.validations(), Vec::new());
    assert_eq!(session.store().pick("items[1].archived"), Some(&json!(true)));

    {
        let mut store = session.store();
        store.set_leaf_value("items[1].archived", json!(false), tokio::time::Instant::now(), None);
        store.debounce(&[]);
    }
    let keys: Vec<(NodeId, String)> = session
        .validations()
        .into_iter()
        .map(|v| (v.node_id, v.message_key))
        .collect();
    assert_eq!(keys, vec![(id("itemName-1"), REQUIRED_KEY.to_string())]);
}

#[test]
fn opening_a_row_validates_that_row() {
    let (session, _) = session();
    session.set_leaf_value("items[0].name", json!(""));

    let on_open = session.start_edit(id("items"), uuid(BIKE), true).unwrap();
    assert_eq!(on_open.len(), 1);
    assert_eq!(on_open[0].node_id, id("itemName-0"));
    assert_eq!(session.group_state(id("items")).editing(), Some(uuid(BIKE)));

    let quiet = session.start_edit(id("items"), uuid(LAMP), false).unwrap();
    assert_eq!(quiet, Vec::new());
    assert_eq!(session.stop_edit(id("items")), Vec::new());
    assert_eq!(session.group_state(id("items")).editing(), None);
}

#[test]
fn unknown_row_cannot_be_opened() {
    let (session, _) = session();
    assert_eq!(session.start_edit(id("items"), Uuid::new_v4(), true), None);
    assert_eq!(session.start_edit(id("owner"), uuid(BIKE), true), None);
}

#[tokio::test]
async fn group_that_leaves_the_hierarchy_mounts_afresh() {
    let mut set = LayoutSet::new();
    set.add_page_json(
        "trips",
        &json!([
            {"id": "trips", "type": "RepeatingGroup", "children": ["legs"], "maxCount": 3,
             "dataModelBindings": {"group": "trips"}},
            {"id": "legs", "type": "RepeatingGroup", "children": ["from"], "maxCount": 3,
             "dataModelBindings": {"group": "trips.legs"},
             "edit": {"openByDefault": true}},
            {"id": "from", "type": "Input", "dataModelBindings": {"simpleBinding": "trips.legs.from"}}
        ])
        .to_string(),
    )
    .unwrap();
    let initial = json!({"trips": [{"altinnRowId": BIKE}]});
    let session = FormSession::new(
        SessionConfig::default(),
        Arc::new(MemoryBackend::new(initial.clone())),
        set,
        initial,
        Diagnostics::default(),
    );

    assert!(session.mount_group(id("legs-0")).is_some());
    assert_eq!(session.mount_group(id("legs-0")), None);
    assert_eq!(session.store().pick("trips[0].legs").and_then(Value::as_array).map(Vec::len), Some(1));

    let outcome = session.delete_row(id("trips"), uuid(BIKE)).await;
    assert_eq!(outcome, Some(RowDeletion::Deleted));
    assert!(session.add_row(id("trips")).is_some());
    assert!(session.nodes().find_by_id(id("legs-0"), None).is_some());

    assert!(session.mount_group(id("legs-0")).is_some());
    assert_eq!(session.store().pick("trips[0].legs").and_then(Value::as_array).map(Vec::len), Some(1));
}

#[tokio::test]
async fn deleting_a_row_deletes_its_attachments_first() {
    let (session, backend) = session();
    let uploaded = session
        .upload_attachment(id("receipt-0"), receipt("bill.pdf"))
        .await
        .unwrap();
    assert_eq!(uploaded, "bill.pdf-0");
    assert_eq!(session.store().pick("items[0].receipts"), Some(&json!(["bill.pdf-0"])));

    let outcome = session.delete_row(id("items"), uuid(BIKE)).await;
    assert_eq!(outcome, Some(RowDeletion::Deleted));
    assert_eq!(*backend.deleted.lock().unwrap(), vec!["bill.pdf-0".to_string()]);
    assert_eq!(session.attachments().count(id("receipt-0")), 0);
    assert_eq!(row_ids(&session), vec![uuid(LAMP)]);
    assert_eq!(session.store().pick("items[0].name"), Some(&json!("Lamp")));
}

#[tokio::test]
async fn failed_attachment_delete_keeps_the_row() {
    let (session, backend) = session();
    session
        .upload_attachment(id("receipt-1"), receipt("lamp.pdf"))
        .await
        .unwrap();
    backend.fail_deletes.store(true, Ordering::SeqCst);

    let outcome = session.delete_row(id("items"), uuid(LAMP)).await;
    assert_eq!(outcome, Some(RowDeletion::Cancelled));
    assert_eq!(row_ids(&session), vec![uuid(BIKE), uuid(LAMP)]);
    assert_eq!(session.store().pick("items[1].receipts"), Some(&json!(["lamp.pdf-0"])));

    let attachments = session.attachments();
    let kept = attachments.list(id("receipt-1"));
    assert_eq!(kept.len(), 1);
    assert!(!kept[0].deleting);
    drop(attachments);
    assert!(!session.group_state(id("items")).is_deleting(uuid(LAMP)));
}

// ─── Generations ────────────────────────────────────────────────────────

#[test]
fn hierarchy_is_regenerated_only_after_a_freeze() {
    let (session, _) = session();
    session.nodes();
    session.nodes();
    assert_eq!(session.generations(), 1);

    session.set_leaf_value("owner", json!("Ola"));
    session.nodes();
    assert_eq!(session.generations(), 1);

    session.request_manual_save();
    session.nodes();
    assert_eq!(session.generations(), 2);
}

#[tokio::test]
async fn changed_code_list_regenerates() {
    let mut backend = MemoryBackend::new(data());
    backend.options.insert(
        "countries".to_string(),
        vec![OptionItem {
            value: "NO".to_string(),
            label: "Norway".to_string(),
        }],
    );
    let (session, _) = session_with(backend);
    session.nodes();
    assert_eq!(session.options("countries"), None);

    let items = session.load_options("countries", &BTreeMap::new()).await.unwrap();
    assert_eq!(items.len(), 1);
    session.nodes();
    assert_eq!(session.generations(), 2);

    session.load_options("countries", &BTreeMap::new()).await.unwrap();
    session.nodes();
    assert_eq!(session.generations(), 2);
    assert_eq!(session.options("countries").map(|o| o.len()), Some(1));
}

// ─── Pages ──────────────────────────────────────────────────────────────

#[test]
fn page_order_hides_pages_except_the_current_one() {
    let (session, _) = session();
    assert_eq!(session.navigation().current_view, "items");
    assert_eq!(session.visible_pages(), vec!["items", "summary"]);

    session.set_page_order(Some(vec!["items".to_string()]));
    assert_eq!(session.visible_pages(), vec!["items"]);

    assert!(!session.navigate_to("missing"));
    assert!(session.navigate_to("summary"));
    assert_eq!(session.visible_pages(), vec!["items", "summary"]);
}

#[test]
fn unknown_page_is_not_rendered() {
    let (session, _) = session();
    let mut recorder = Recorder::default();
    assert!(!session.render_page("missing", &mut recorder));
    assert!(recorder.0.is_empty());

    assert!(session.render_page("summary", &mut recorder));
    assert_eq!(recorder.0, vec!["total"]);
}

#[test]
fn display_data_reads_current_value() {
    let (session, _) = session();
    assert_eq!(session.display_data(id("owner")), "Kari Nordmann");
    assert_eq!(session.display_data(id("itemName-1")), "Lamp");
    assert_eq!(session.display_data(id("nobody")), "");
}
