//! The form data store.
//!
//! The store keeps three snapshots of the form data:
//!
//! - **current**: every write lands here at once.
//! - **debounced**: `current` frozen after the debounce window following the
//!   last write has passed, or when a manual save or a lock asks for it.
//!   Saves and the node hierarchy only ever read this snapshot, so they never
//!   observe half of a batch of edits.
//! - **last saved**: what the backend last acknowledged.
//!
//! The store does no I/O. Callers pass `Instant`s in, poll [`FormDataStore::tick`]
//! and [`FormDataStore::next_save`], and report the outcome of every save
//! they were handed through [`FormDataStore::save_finished`] or
//! [`FormDataStore::save_failed`]. At most one save is outstanding at a time.

use crate::config::SessionConfig;
use form_core::path::{PathSegment, flatten, leaf_to_string, pick};
use form_core::rules::apply_rules;
use form_core::{
    DataModelBindings, DataPath, Diagnostics, DiffMap, PathError, RuleConnection, diff_data,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

// ─── Types ───────────────────────────────────────────────────────────────

/// One write in a [`FormDataStore::set_multi_leaf_values`] batch.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafChange {
    pub path: String,
    pub value: Value,
}

impl LeafChange {
    pub fn new(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }
}

/// A save the store has committed to.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveRequest {
    /// The frozen snapshot to send.
    pub new_data: Value,
    /// Previous value of every leaf that differs from the last save.
    pub previous_values: DiffMap,
}

/// What a [`SaveGatekeeper`] makes of a save the store is about to issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveGate {
    Allow,
    /// Not yet; asked again on the next poll.
    Delay,
    /// Drop this attempt. A manual save request is cleared.
    Veto,
}

/// App-supplied condition on saving, asked by [`FormDataStore::next_save`]
/// once the built-in checks pass. A veto from any gatekeeper wins over a
/// delay. Gatekeepers are not asked while a lock waits for its flush, nor by
/// the teardown flush.
pub trait SaveGatekeeper: Send + Sync {
    fn check(&self, store: &FormDataStore) -> SaveGate;
}

impl<F> SaveGatekeeper for F
where
    F: Fn(&FormDataStore) -> SaveGate + Send + Sync,
{
    fn check(&self, store: &FormDataStore) -> SaveGate {
        self(store)
    }
}

/// Who holds the save lock, if anyone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LockState {
    #[default]
    Unlocked,
    /// Requested; waiting for unsaved changes to be flushed.
    Pending(String),
    /// Held. No save is issued until the holder unlocks.
    Locked(String),
}

impl LockState {
    pub fn holder(&self) -> Option<&str> {
        match self {
            Self::Unlocked => None,
            Self::Pending(id) | Self::Locked(id) => Some(id),
        }
    }
}

/// Outcome of [`FormDataStore::lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRequest {
    Acquired,
    /// A save was requested; the lock is granted once it completes.
    WaitingForSave,
    /// Someone (possibly the caller) already holds or awaits the lock.
    Denied,
}

// ─── Store ───────────────────────────────────────────────────────────────

pub struct FormDataStore {
    current: Value,
    debounced: Value,
    last_saved: Value,

    /// Bumped on every change to `current`.
    current_rev: u64,
    /// `current_rev` at the last freeze.
    debounced_rev: u64,
    /// Bumped whenever `debounced` changes; feeds the hierarchy memo key.
    data_version: u64,

    debounce_deadline: Option<Instant>,
    debounce_timeout: Duration,

    auto_saving: bool,
    manual_save_requested: bool,
    is_saving: bool,
    lock: LockState,
    gatekeepers: Vec<Box<dyn SaveGatekeeper>>,

    diagnostics: Diagnostics,
}

impl FormDataStore {
    /// Create a store whose three snapshots all start as `initial`.
    pub fn new(initial: Value, config: &SessionConfig, diagnostics: Diagnostics) -> Self {
        Self {
            debounced: initial.clone(),
            last_saved: initial.clone(),
            current: initial,
            current_rev: 0,
            debounced_rev: 0,
            data_version: 0,
            debounce_deadline: None,
            debounce_timeout: config.debounce_timeout(),
            auto_saving: config.auto_saving,
            manual_save_requested: false,
            is_saving: false,
            lock: LockState::Unlocked,
            gatekeepers: Vec::new(),
            diagnostics,
        }
    }

    // ─── Reads ───────────────────────────────────────────────────────────

    pub fn current(&self) -> &Value {
        &self.current
    }

    pub fn debounced(&self) -> &Value {
        &self.debounced
    }

    pub fn last_saved(&self) -> &Value {
        &self.last_saved
    }

    pub fn data_version(&self) -> u64 {
        self.data_version
    }

    pub fn is_saving(&self) -> bool {
        self.is_saving
    }

    pub fn manual_save_requested(&self) -> bool {
        self.manual_save_requested
    }

    pub fn lock_state(&self) -> &LockState {
        &self.lock
    }

    pub fn locked_by(&self) -> Option<&str> {
        match &self.lock {
            LockState::Locked(id) => Some(id),
            _ => None,
        }
    }

    /// When the pending debounce window closes, if a write is waiting.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.debounce_deadline
    }

    /// Whether the current data deep-differs from the last save.
    pub fn has_unsaved_changes(&self) -> bool {
        self.current != self.last_saved
    }

    /// Read from the current data.
    pub fn pick(&self, path: &str) -> Option<&Value> {
        pick(&self.current, path)
    }

    pub fn pick_debounced(&self, path: &str) -> Option<&Value> {
        pick(&self.debounced, path)
    }

    /// The current leaf at `path` as a string; objects, arrays and missing
    /// values read as `""`.
    pub fn pick_fresh_string(&self, path: &str) -> String {
        leaf_to_string(self.pick(path))
    }

    /// [`Self::pick_fresh_string`] for every binding of a node.
    pub fn pick_fresh_strings(&self, bindings: &DataModelBindings) -> BTreeMap<String, String> {
        bindings
            .iter()
            .map(|(key, path)| (key.to_string(), self.pick_fresh_string(path)))
            .collect()
    }

    pub fn fresh_bindings(&self, bindings: &DataModelBindings) -> BTreeMap<String, Option<Value>> {
        bindings
            .iter()
            .map(|(key, path)| (key.to_string(), self.pick(path).cloned()))
            .collect()
    }

    pub fn debounced_dot_map(&self) -> BTreeMap<String, Value> {
        flatten(&self.debounced)
    }

    // ─── Writes ──────────────────────────────────────────────────────────

    /// Set one leaf. `""` and `null` delete it. Restarts the debounce
    /// window, using `debounce_override` for this write when given.
    ///
    /// Returns `false` when nothing changed or the path is malformed.
    pub fn set_leaf_value(
        &mut self,
        path: &str,
        value: Value,
        now: Instant,
        debounce_override: Option<Duration>,
    ) -> bool {
        let Some(path) = self.parse(path) else {
            return false;
        };
        match write_leaf(&mut self.current, &path, value) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                self.diagnostics.warn(format!("Write ignored: {e}"));
                return false;
            }
        }
        self.touched(now, debounce_override);
        true
    }

    /// Apply a batch of leaf writes as one change. A malformed path rejects
    /// the whole batch.
    pub fn set_multi_leaf_values(
        &mut self,
        changes: &[LeafChange],
        now: Instant,
        debounce_override: Option<Duration>,
    ) -> bool {
        let mut parsed = Vec::with_capacity(changes.len());
        for change in changes {
            match DataPath::parse(&change.path) {
                Ok(path) => parsed.push((path, change.value.clone())),
                Err(e) => {
                    self.diagnostics
                        .warn(format!("Batch of {} writes ignored: {e}", changes.len()));
                    return false;
                }
            }
        }

        let mut next = self.current.clone();
        let mut changed = false;
        for (path, value) in parsed {
            match write_leaf(&mut next, &path, value) {
                Ok(wrote) => changed |= wrote,
                Err(e) => {
                    self.diagnostics
                        .warn(format!("Batch of {} writes ignored: {e}", changes.len()));
                    return false;
                }
            }
        }
        if changed {
            self.current = next;
            self.touched(now, debounce_override);
        }
        changed
    }

    /// Write the leaf behind binding `key` of a node.
    pub fn set_for_binding(
        &mut self,
        bindings: &DataModelBindings,
        key: &str,
        value: Value,
        now: Instant,
    ) -> bool {
        let Some(path) = bindings.get(key) else {
            self.diagnostics
                .warn(format!("No `{key}` data model binding; write ignored"));
            return false;
        };
        self.set_leaf_value(path, value, now, None)
    }

    /// Push to the list at `path`, creating it when absent.
    pub fn append_to_list(&mut self, path: &str, value: Value, now: Instant) -> bool {
        self.edit_list(path, now, true, |list| {
            list.push(value);
            true
        })
    }

    /// Like [`Self::append_to_list`], but a no-op when `value` is already in
    /// the list.
    pub fn append_to_list_unique(&mut self, path: &str, value: Value, now: Instant) -> bool {
        self.edit_list(path, now, true, |list| {
            if list.contains(&value) {
                return false;
            }
            list.push(value);
            true
        })
    }

    /// Remove the element at `index`.
    ///
    /// Indices go stale when the list changes between reading and removing;
    /// prefer [`Self::remove_value_from_list`] when values are unique.
    pub fn remove_index_from_list(&mut self, path: &str, index: usize, now: Instant) -> bool {
        self.edit_list(path, now, false, |list| {
            if index >= list.len() {
                return false;
            }
            list.remove(index);
            true
        })
    }

    /// Remove every element equal to `value`.
    pub fn remove_value_from_list(&mut self, path: &str, value: &Value, now: Instant) -> bool {
        self.edit_list(path, now, false, |list| {
            let before = list.len();
            list.retain(|item| item != value);
            list.len() != before
        })
    }

    fn edit_list(
        &mut self,
        path: &str,
        now: Instant,
        create: bool,
        edit: impl FnOnce(&mut Vec<Value>) -> bool,
    ) -> bool {
        let Some(path) = self.parse(path) else {
            return false;
        };
        let exists = matches!(path.pick(&self.current), Some(Value::Array(_)));
        if !exists && !create {
            return false;
        }
        let Some(list) = path.array_mut(&mut self.current) else {
            self.diagnostics
                .warn(format!("'{path}' holds a value that is not a list; list edit ignored"));
            return false;
        };
        if !edit(list) {
            return false;
        }
        self.touched(now, None);
        true
    }

    fn parse(&self, path: &str) -> Option<DataPath> {
        match DataPath::parse(path) {
            Ok(p) => Some(p),
            Err(e) => {
                self.diagnostics.warn(format!("Write ignored: {e}"));
                None
            }
        }
    }

    fn touched(&mut self, now: Instant, debounce_override: Option<Duration>) {
        self.current_rev += 1;
        self.debounce_deadline = Some(now + debounce_override.unwrap_or(self.debounce_timeout));
    }

    // ─── Debounce ────────────────────────────────────────────────────────

    /// Run `rules` over the current data, then freeze it into the debounced
    /// snapshot. Returns whether the debounced snapshot changed.
    pub fn debounce(&mut self, rules: &[RuleConnection]) -> bool {
        if !rules.is_empty() && apply_rules(rules, &mut self.current, &self.diagnostics) > 0 {
            self.current_rev += 1;
        }
        self.debounce_deadline = None;
        if self.current_rev == self.debounced_rev {
            return false;
        }
        self.debounced = self.current.clone();
        self.debounced_rev = self.current_rev;
        self.data_version += 1;
        log::trace!("form data frozen (data v{})", self.data_version);
        true
    }

    /// Freeze if the debounce window has closed by `now`.
    pub fn tick(&mut self, now: Instant, rules: &[RuleConnection]) -> bool {
        match self.debounce_deadline {
            Some(deadline) if now >= deadline => self.debounce(rules),
            _ => false,
        }
    }

    /// Freeze now and let the next save through even with auto-saving off.
    pub fn request_manual_save(&mut self, rules: &[RuleConnection]) {
        self.manual_save_requested = true;
        self.debounce(rules);
    }

    // ─── Saving ──────────────────────────────────────────────────────────

    /// The save gatekeeper: the save to issue now, if any.
    ///
    /// A save is issued when the debounced data differs from the last save,
    /// no save is in flight, the lock is not held, and either auto-saving is
    /// on or a save was asked for. Taking the request marks the store as
    /// saving until the outcome is reported.
    pub fn next_save(&mut self) -> Option<SaveRequest> {
        if self.is_saving || matches!(self.lock, LockState::Locked(_)) {
            return None;
        }
        if self.debounced == self.last_saved {
            self.manual_save_requested = false;
            self.promote_pending_lock();
            return None;
        }
        let asked = self.manual_save_requested || matches!(self.lock, LockState::Pending(_));
        if !self.auto_saving && !asked {
            return None;
        }
        if !matches!(self.lock, LockState::Pending(_)) {
            match self.gate() {
                SaveGate::Allow => {}
                SaveGate::Delay => return None,
                SaveGate::Veto => {
                    log::debug!("save vetoed by a gatekeeper");
                    self.manual_save_requested = false;
                    return None;
                }
            }
        }

        self.is_saving = true;
        self.manual_save_requested = false;
        Some(SaveRequest {
            previous_values: diff_data(&self.debounced, &self.last_saved),
            new_data: self.debounced.clone(),
        })
    }

    /// Register an extra condition on [`Self::next_save`].
    pub fn add_gatekeeper(&mut self, gatekeeper: impl SaveGatekeeper + 'static) {
        self.gatekeepers.push(Box::new(gatekeeper));
    }

    fn gate(&self) -> SaveGate {
        let mut gate = SaveGate::Allow;
        for keeper in &self.gatekeepers {
            match keeper.check(self) {
                SaveGate::Veto => return SaveGate::Veto,
                SaveGate::Delay => gate = SaveGate::Delay,
                SaveGate::Allow => {}
            }
        }
        gate
    }

    /// Record a successful save of `new_data`.
    ///
    /// `changed_fields` are values the server computed while saving. They
    /// win over the local snapshots, so they are written into all three.
    pub fn save_finished(&mut self, new_data: Value, changed_fields: Option<&Value>) {
        self.is_saving = false;
        self.last_saved = new_data;

        if let Some(changed) = changed_fields {
            let mut debounced_changed = false;
            for (raw, value) in flatten(changed) {
                let path = match DataPath::parse(&raw) {
                    Ok(p) => p,
                    Err(e) => {
                        self.diagnostics
                            .warn(format!("Server changed field skipped: {e}"));
                        continue;
                    }
                };
                let written = write_leaf(&mut self.last_saved, &path, value.clone())
                    .and_then(|_| write_leaf(&mut self.current, &path, value.clone()))
                    .and_then(|_| write_leaf(&mut self.debounced, &path, value));
                match written {
                    Ok(changed) => debounced_changed |= changed,
                    Err(e) => self
                        .diagnostics
                        .warn(format!("Server changed field skipped: {e}")),
                }
            }
            if debounced_changed {
                self.data_version += 1;
            }
        }

        self.promote_pending_lock();
    }

    /// Record a failed save. The unsaved diff stays and is retried by the
    /// next cycle. A pending lock is rejected; its id is returned.
    pub fn save_failed(&mut self) -> Option<String> {
        self.is_saving = false;
        if !matches!(self.lock, LockState::Pending(_)) {
            return None;
        }
        let LockState::Pending(id) = std::mem::take(&mut self.lock) else {
            return None;
        };
        self.diagnostics
            .warn(format!("Lock requested by {id} rejected: saving form data failed"));
        Some(id)
    }

    /// Freeze the current data (without rules) and hand out a final save
    /// when anything is unsaved. Used when the session is torn down.
    pub fn flush_on_teardown(&mut self) -> Option<SaveRequest> {
        if self.is_saving || matches!(self.lock, LockState::Locked(_)) || !self.has_unsaved_changes()
        {
            return None;
        }
        self.debounce(&[]);
        self.is_saving = true;
        Some(SaveRequest {
            previous_values: diff_data(&self.debounced, &self.last_saved),
            new_data: self.debounced.clone(),
        })
    }

    // ─── Locking ─────────────────────────────────────────────────────────

    /// Ask for the save lock.
    ///
    /// With unsaved changes, a manual save is requested and the lock stays
    /// pending until that save (and any follow-up) has flushed everything.
    pub fn lock(&mut self, lock_id: &str, rules: &[RuleConnection]) -> LockRequest {
        if let Some(holder) = self.lock.holder() {
            if holder != lock_id {
                self.diagnostics.warn(format!(
                    "Form data is already locked by {holder}, cannot lock it again (requested by {lock_id})"
                ));
            }
            return LockRequest::Denied;
        }

        if self.is_saving || self.has_unsaved_changes() {
            self.lock = LockState::Pending(lock_id.to_string());
            if self.has_unsaved_changes() {
                self.request_manual_save(rules);
            }
            return LockRequest::WaitingForSave;
        }

        self.lock = LockState::Locked(lock_id.to_string());
        LockRequest::Acquired
    }

    /// Release the lock. With `new_data`, all three snapshots are replaced
    /// by it (the holder saved it through another channel).
    ///
    /// A pending request by the same id is withdrawn.
    pub fn unlock(&mut self, lock_id: &str, new_data: Option<Value>) -> bool {
        let holder = match &self.lock {
            LockState::Unlocked => {
                self.diagnostics.warn(format!(
                    "Form data is not locked, cannot unlock it (requested by {lock_id})"
                ));
                return false;
            }
            LockState::Pending(holder) | LockState::Locked(holder) => holder,
        };
        if holder != lock_id {
            self.diagnostics.warn(format!(
                "Form data is locked by {holder}, cannot unlock it (requested by {lock_id})"
            ));
            return false;
        }

        let was_locked = matches!(self.lock, LockState::Locked(_));
        self.lock = LockState::Unlocked;
        if was_locked && let Some(data) = new_data {
            self.current = data.clone();
            self.debounced = data.clone();
            self.last_saved = data;
            self.current_rev += 1;
            self.debounced_rev = self.current_rev;
            self.data_version += 1;
            self.debounce_deadline = None;
        }
        true
    }

    fn promote_pending_lock(&mut self) {
        if let LockState::Pending(id) = &self.lock
            && !self.is_saving
            && !self.has_unsaved_changes()
        {
            log::debug!("form data locked by {id}");
            self.lock = LockState::Locked(id.clone());
        }
    }
}

/// Write or clear one leaf. `""` and `null` clear: object keys are removed,
/// array slots become `null` so sibling indices stay put.
fn write_leaf(data: &mut Value, path: &DataPath, value: Value) -> Result<bool, PathError> {
    let clears = value.is_null() || value.as_str() == Some("");
    if !clears {
        if path.pick(data) == Some(&value) {
            return Ok(false);
        }
        path.set(data, value)?;
        return Ok(true);
    }
    match path.segments().last() {
        Some(PathSegment::Index(_)) => {
            if path.pick(data).is_none_or(Value::is_null) {
                return Ok(false);
            }
            path.set(data, Value::Null)?;
            Ok(true)
        }
        _ => Ok(path.delete(data).is_some()),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────
