//! Attachments and their mapping into the form data.
//!
//! Uploaded files live outside the form data. Upload components inside a
//! repeating group must still record their attachment ids in the data so
//! each file can be tied to its row: a `list` binding collects the ids, a
//! `simpleBinding` holds one.

use crate::store::FormDataStore;
use form_core::validation::{ComponentValidation, ValidationCategory, ValidationSeverity};
use form_core::{Diagnostics, LayoutNode, NodeId};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tokio::time::Instant;

pub const FILE_COUNT_KEY: &str = "form_filler.file_uploader_validation_error_file_number";
pub const NO_TAG_KEY: &str = "form_filler.file_uploader_validation_error_no_chosen_tag";

/// One uploaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    /// A delete request is in flight.
    pub deleting: bool,
}

/// Uploaded files per upload node.
#[derive(Debug, Clone, Default)]
pub struct Attachments {
    by_node: BTreeMap<NodeId, Vec<Attachment>>,
}

impl Attachments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: NodeId, attachment: Attachment) {
        self.by_node.entry(node).or_default().push(attachment);
    }

    pub fn list(&self, node: NodeId) -> &[Attachment] {
        self.by_node.get(&node).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn count(&self, node: NodeId) -> usize {
        self.list(node).len()
    }

    /// Flag an attachment as being deleted. `false` if unknown or already
    /// being deleted.
    pub fn mark_deleting(&mut self, node: NodeId, id: &str) -> bool {
        match self.find_mut(node, id) {
            Some(a) if !a.deleting => {
                a.deleting = true;
                true
            }
            _ => false,
        }
    }

    /// Clear the deleting flag after a failed delete.
    pub fn unmark_deleting(&mut self, node: NodeId, id: &str) {
        if let Some(a) = self.find_mut(node, id) {
            a.deleting = false;
        }
    }

    pub fn remove(&mut self, node: NodeId, id: &str) -> Option<Attachment> {
        let list = self.by_node.get_mut(&node)?;
        let pos = list.iter().position(|a| a.id == id)?;
        Some(list.remove(pos))
    }

    fn find_mut(&mut self, node: NodeId, id: &str) -> Option<&mut Attachment> {
        self.by_node.get_mut(&node)?.iter_mut().find(|a| a.id == id)
    }
}

// ─── Mapper ──────────────────────────────────────────────────────────────

/// Record `attachment_id` in the node's binding.
///
/// Without a binding this is a no-op; inside a repeating group it is also
/// reported, since the file can no longer be tied to its row.
pub fn add_attachment_to_data(
    node: &LayoutNode,
    attachment_id: &str,
    store: &mut FormDataStore,
    now: Instant,
    diagnostics: &Diagnostics,
) -> bool {
    if let Some(list) = node.bindings.list() {
        return store.append_to_list_unique(list, json!(attachment_id), now);
    }
    if let Some(simple) = node.bindings.simple() {
        return store.set_leaf_value(simple, json!(attachment_id), now, None);
    }
    report_unbound(node, "add attachment to", diagnostics);
    false
}

/// Remove `attachment_id` from the node's binding.
pub fn remove_attachment_from_data(
    node: &LayoutNode,
    attachment_id: &str,
    store: &mut FormDataStore,
    now: Instant,
    diagnostics: &Diagnostics,
) -> bool {
    if let Some(list) = node.bindings.list() {
        return store.remove_value_from_list(list, &json!(attachment_id), now);
    }
    if let Some(simple) = node.bindings.simple() {
        return store.set_leaf_value(simple, Value::Null, now, None);
    }
    report_unbound(node, "remove attachment from", diagnostics);
    false
}

fn report_unbound(node: &LayoutNode, action: &str, diagnostics: &Diagnostics) {
    if !node.row_frames.is_empty() {
        diagnostics.error(format!(
            "No valid data model binding for file uploader `{}`, cannot {action} form data. \
             This is required when using a file uploader inside a repeating group.",
            node.id
        ));
    }
}

// ─── Validation ──────────────────────────────────────────────────────────

/// `minNumberOfAttachments`, and for tagged uploads a tag on every file.
pub fn validate_attachments(node: &LayoutNode, attachments: &Attachments) -> Vec<ComponentValidation> {
    if node.hidden {
        return Vec::new();
    }
    let files = attachments.list(node.id);
    let mut out = Vec::new();

    let min = node
        .props
        .get("minNumberOfAttachments")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if min > 0 && (files.len() as u64) < min {
        out.push(validation(node, FILE_COUNT_KEY, vec![min.to_string()]));
    }

    if node.component_type == "FileUploadWithTag" {
        let tag_title = node
            .texts
            .get("tagTitle")
            .map(|t| t.to_lowercase())
            .unwrap_or_else(|| "tag".to_string());
        for file in files.iter().filter(|f| f.tags.is_empty()) {
            log::trace!("attachment {} of `{}` has no tag", file.id, node.id);
            out.push(validation(node, NO_TAG_KEY, vec![tag_title.clone()]));
        }
    }
    out
}

fn validation(node: &LayoutNode, key: &str, params: Vec<String>) -> ComponentValidation {
    ComponentValidation {
        node_id: node.id,
        binding_key: None,
        message_key: key.to_string(),
        params,
        severity: ValidationSeverity::Error,
        category: ValidationCategory::Required,
    }
}
