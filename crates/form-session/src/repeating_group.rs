//! Row editing state of repeating groups.
//!
//! Rows are tracked by uuid, never by index: row counts and the editable
//! index range are always read from the current generation's
//! [`GroupState`], so adding or deleting rows cannot leave a stale count
//! behind. The state machine itself is synchronous. Row deletion is split
//! in two ([`RepeatingGroupState::request_delete`] and
//! [`RepeatingGroupState::finish_delete`]) so the session can run the
//! asynchronous attachment cleanup in between.

use crate::store::FormDataStore;
use form_core::hierarchy::ROW_ID_KEY;
use form_core::validation::{GroupTrigger, group_trigger};
use form_core::{EditMode, GroupState, LayoutNode, LayoutPages, NodeId};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("`{0}` is not a repeating group")]
    NotRepeating(NodeId),

    #[error("`{0}` has no group data model binding")]
    Unbound(NodeId),

    #[error("`{0}` already has its maximum number of rows")]
    Full(NodeId),

    #[error("`{group}` has no row {row}")]
    UnknownRow { group: NodeId, row: Uuid },

    #[error("Row {row} of `{group}` is being deleted")]
    Deleting { group: NodeId, row: Uuid },

    #[error("`{0}` does not use multi-page rows")]
    NotMultiPage(NodeId),

    #[error("Could not write rows of `{0}` to the form data")]
    Write(NodeId),
}

/// What to validate after a row was opened or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationScope {
    /// The whole group with every row.
    Group,
    /// One row, by index.
    Row(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowDeletion {
    Deleted,
    /// The pre-deletion hook failed; the data is untouched.
    Cancelled,
}

/// Editing state of one repeating group.
#[derive(Debug, Clone, Default)]
pub struct RepeatingGroupState {
    editing: Option<Uuid>,
    deleting: BTreeSet<Uuid>,
    multi_page: HashMap<Uuid, usize>,
    mounted: bool,
}

impl RepeatingGroupState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The row open for editing, if any. In `showAll` mode every row is
    /// shown as editing; see [`Self::is_editing`].
    pub fn editing(&self) -> Option<Uuid> {
        self.editing
    }

    pub fn is_editing(&self, group: &GroupState, row: Uuid) -> bool {
        group.edit.mode == EditMode::ShowAll || self.editing == Some(row)
    }

    pub fn is_deleting(&self, row: Uuid) -> bool {
        self.deleting.contains(&row)
    }

    /// Index of the row open for editing in `group`'s current rows.
    pub fn edit_index(&self, group: &GroupState) -> Option<usize> {
        let editing = self.editing?;
        group.row_by_uuid(editing).map(|row| row.index)
    }

    pub fn multi_page_index(&self, row: Uuid) -> usize {
        self.multi_page.get(&row).copied().unwrap_or(0)
    }

    // ─── Transitions ─────────────────────────────────────────────────────

    /// First mount of the group: a group that opens by default and has no
    /// rows gets one.
    pub fn on_mount(
        &mut self,
        node: &LayoutNode,
        store: &mut FormDataStore,
        now: Instant,
    ) -> Result<Option<Uuid>, RowError> {
        if self.mounted {
            return Ok(None);
        }
        self.mounted = true;
        let group = group_of(node)?;
        if group.edit.open_by_default && group.rows.is_empty() {
            return self.add_row(node, store, now).map(Some);
        }
        Ok(None)
    }

    /// Append a new row with a fresh row id.
    ///
    /// The new row is opened for editing only when the group always shows
    /// its add button; `showAll` and `onlyTable` never track an editing row.
    pub fn add_row(
        &mut self,
        node: &LayoutNode,
        store: &mut FormDataStore,
        now: Instant,
    ) -> Result<Uuid, RowError> {
        let group = group_of(node)?;
        if !group.can_add() {
            return Err(RowError::Full(node.id));
        }
        let binding = group.binding.as_deref().ok_or(RowError::Unbound(node.id))?;

        let uuid = Uuid::new_v4();
        if !store.append_to_list(binding, json!({ ROW_ID_KEY: uuid.to_string() }), now) {
            return Err(RowError::Write(node.id));
        }

        let tracks_editing = !matches!(group.edit.mode, EditMode::ShowAll | EditMode::OnlyTable);
        if tracks_editing && group.edit.always_show_add_button {
            self.editing = Some(uuid);
            self.multi_page.insert(uuid, 0);
        }
        Ok(uuid)
    }

    /// Open `row` for editing. Any other open row is closed.
    ///
    /// With `validate_on_open`, the group's validation trigger decides
    /// what to validate.
    pub fn start_edit(
        &mut self,
        node: &LayoutNode,
        row: Uuid,
        validate_on_open: bool,
    ) -> Result<Option<ValidationScope>, RowError> {
        let group = group_of(node)?;
        let found = group.row_by_uuid(row).ok_or(RowError::UnknownRow {
            group: node.id,
            row,
        })?;
        if self.deleting.contains(&row) {
            return Err(RowError::Deleting {
                group: node.id,
                row,
            });
        }

        self.editing = Some(row);
        if group.edit.multi_page {
            self.multi_page.insert(row, 0);
        }
        Ok(validate_on_open
            .then(|| validation_scope(node, found.index))
            .flatten())
    }

    /// Close the open row. Closing always asks for validation when the
    /// group has a trigger.
    pub fn stop_edit(&mut self, node: &LayoutNode) -> Option<ValidationScope> {
        let row = self.editing.take()?;
        let index = node.group.as_ref()?.row_by_uuid(row)?.index;
        validation_scope(node, index)
    }

    /// Mark `row` as being deleted. Returns its current index.
    pub fn request_delete(&mut self, node: &LayoutNode, row: Uuid) -> Result<usize, RowError> {
        let group = group_of(node)?;
        let found = group.row_by_uuid(row).ok_or(RowError::UnknownRow {
            group: node.id,
            row,
        })?;
        if !self.deleting.insert(row) {
            return Err(RowError::Deleting {
                group: node.id,
                row,
            });
        }
        Ok(found.index)
    }

    /// Finish a deletion started with [`Self::request_delete`].
    ///
    /// When `hook_succeeded` is false the row stays. Otherwise the row is
    /// removed from the current data, located by its row id so concurrent
    /// edits to the list cannot make it remove the wrong element.
    pub fn finish_delete(
        &mut self,
        node: &LayoutNode,
        row: Uuid,
        hook_succeeded: bool,
        store: &mut FormDataStore,
        now: Instant,
    ) -> Result<RowDeletion, RowError> {
        if !self.deleting.remove(&row) {
            return Err(RowError::UnknownRow {
                group: node.id,
                row,
            });
        }
        if !hook_succeeded {
            log::debug!("deletion of row {row} in `{}` cancelled", node.id);
            return Ok(RowDeletion::Cancelled);
        }

        let group = group_of(node)?;
        let binding = group.binding.as_deref().ok_or(RowError::Unbound(node.id))?;
        let index = row_position(store.pick(binding), row)
            .or_else(|| group.row_by_uuid(row).map(|r| r.index))
            .ok_or(RowError::UnknownRow {
                group: node.id,
                row,
            })?;
        if !store.remove_index_from_list(binding, index, now) {
            return Err(RowError::Write(node.id));
        }

        if self.editing == Some(row) {
            self.editing = None;
        }
        self.multi_page.remove(&row);
        Ok(RowDeletion::Deleted)
    }

    /// Move the open row of a multi-page group to page `index`, clamped
    /// to the row's last page. Returns the page actually selected.
    pub fn set_multi_page_index(
        &mut self,
        node: &LayoutNode,
        pages: &LayoutPages,
        row: Uuid,
        index: usize,
    ) -> Result<usize, RowError> {
        let group = group_of(node)?;
        if !group.edit.multi_page {
            return Err(RowError::NotMultiPage(node.id));
        }
        let found = group.row_by_uuid(row).ok_or(RowError::UnknownRow {
            group: node.id,
            row,
        })?;
        let last_page = found
            .items
            .iter()
            .filter_map(|item| pages.node(*item)?.multi_page_index)
            .max()
            .unwrap_or(0);
        let clamped = index.min(last_page);
        self.multi_page.insert(row, clamped);
        Ok(clamped)
    }

    /// Drop state for rows that no longer exist in `group`.
    pub fn retain_rows(&mut self, group: &GroupState) {
        let alive = |uuid: &Uuid| group.row_by_uuid(*uuid).is_some();
        if self.editing.is_some_and(|uuid| !alive(&uuid)) {
            self.editing = None;
        }
        self.deleting.retain(alive);
        self.multi_page.retain(|uuid, _| alive(uuid));
    }
}

fn group_of(node: &LayoutNode) -> Result<&GroupState, RowError> {
    node.group
        .as_ref()
        .filter(|g| g.repeating)
        .ok_or(RowError::NotRepeating(node.id))
}

/// Validation asked for by the group's trigger when row `index` opens or
/// closes. A whole-group trigger wins over a row trigger.
fn validation_scope(node: &LayoutNode, index: usize) -> Option<ValidationScope> {
    match group_trigger(&node.def)? {
        GroupTrigger::Group => Some(ValidationScope::Group),
        GroupTrigger::Row => Some(ValidationScope::Row(index)),
    }
}

fn row_position(rows: Option<&Value>, row: Uuid) -> Option<usize> {
    let id = row.to_string();
    rows?
        .as_array()?
        .iter()
        .position(|item| item.get(ROW_ID_KEY).and_then(Value::as_str) == Some(id.as_str()))
}
