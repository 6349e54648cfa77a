//! The per-session composite.
//!
//! [`FormSession`] owns one instance of every stateful subsystem (data
//! store, hierarchy generator, repeating-group states, attachments, page
//! navigation, code lists) and exposes named accessors for each. All
//! subsystem calls are synchronous; only backend calls await.
//!
//! Internal locks are never held across an `.await`, and when two are
//! needed they are taken in the order store, generator, groups,
//! attachments, navigation, options.

use crate::attachments::{
    Attachment, Attachments, add_attachment_to_data, remove_attachment_from_data,
    validate_attachments,
};
use crate::backend::{AttachmentFile, BackendError, FormBackend, OptionItem};
use crate::config::SessionConfig;
use crate::repeating_group::{RepeatingGroupState, RowDeletion, ValidationScope};
use crate::saver::{SaveDriver, SaveError, SaveOutcome, lock_store};
use crate::store::{FormDataStore, LockRequest, LockState, SaveGatekeeper};
use form_core::validation::{validate_all, validate_row, validate_subtree};
use form_core::{
    ComponentRegistry, ComponentValidation, Diagnostics, GeneratorInput, HierarchyGenerator,
    InstanceContext, LayoutNode, LayoutPage, LayoutPages, LayoutSet, LayoutSettings, NodeId,
    NodeIndex, PageNavigation, RuleConnection, SummaryKind, TextResources,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

/// Receives visible nodes of a page in render order.
pub trait NodeRenderer {
    fn render(&mut self, node: &LayoutNode, page: &LayoutPage);
}

#[derive(Debug, Default)]
struct OptionsCache {
    version: u64,
    lists: HashMap<String, Vec<OptionItem>>,
}

pub struct FormSession<B> {
    config: SessionConfig,
    backend: Arc<B>,
    saver: SaveDriver<B>,
    diagnostics: Diagnostics,
    registry: Arc<ComponentRegistry>,

    layout: LayoutSet,
    settings: LayoutSettings,
    texts: TextResources,
    instance: Option<InstanceContext>,
    frontend_settings: Map<String, Value>,
    rules: Vec<RuleConnection>,

    store: Mutex<FormDataStore>,
    generator: Mutex<HierarchyGenerator>,
    groups: Mutex<HashMap<NodeId, RepeatingGroupState>>,
    attachments: Mutex<Attachments>,
    navigation: Mutex<PageNavigation>,
    options: Mutex<OptionsCache>,

    /// Woken after every save that reached the backend.
    save_done: Notify,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<B: FormBackend> FormSession<B> {
    pub fn new(
        config: SessionConfig,
        backend: Arc<B>,
        layout: LayoutSet,
        initial_data: Value,
        diagnostics: Diagnostics,
    ) -> Self {
        let registry = Arc::new(ComponentRegistry::builtin());
        let generator = HierarchyGenerator::new(
            Arc::clone(&registry),
            diagnostics.clone(),
            config.generator_options(),
        );
        let navigation = PageNavigation {
            current_view: layout.pages.first().map(|p| p.key.clone()).unwrap_or_default(),
            order: None,
        };
        Self {
            saver: SaveDriver::new(Arc::clone(&backend), config.save_url.clone()),
            store: Mutex::new(FormDataStore::new(initial_data, &config, diagnostics.clone())),
            generator: Mutex::new(generator),
            groups: Mutex::new(HashMap::new()),
            attachments: Mutex::new(Attachments::new()),
            navigation: Mutex::new(navigation),
            options: Mutex::new(OptionsCache::default()),
            save_done: Notify::new(),
            settings: LayoutSettings::default(),
            texts: TextResources::new(),
            instance: None,
            frontend_settings: Map::new(),
            rules: Vec::new(),
            config,
            backend,
            diagnostics,
            registry,
            layout,
        }
    }

    /// Fetch the initial form data from the save url and start a session.
    pub async fn start(
        config: SessionConfig,
        backend: Arc<B>,
        layout: LayoutSet,
        diagnostics: Diagnostics,
    ) -> Result<Self, BackendError> {
        let data = backend.fetch_initial_form_data(&config.save_url).await?;
        Ok(Self::new(config, backend, layout, data, diagnostics))
    }

    /// Page order from `settings` also seeds navigation.
    pub fn with_settings(mut self, settings: LayoutSettings) -> Self {
        {
            let mut nav = guard(&self.navigation);
            if let Some(first) = settings.pages.order.first() {
                nav.current_view = first.clone();
            }
            nav.order = (!settings.pages.order.is_empty()).then(|| settings.pages.order.clone());
        }
        self.settings = settings;
        self
    }

    pub fn with_texts(mut self, texts: TextResources) -> Self {
        self.texts = texts;
        self
    }

    pub fn with_instance(mut self, instance: InstanceContext) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn with_frontend_settings(mut self, settings: Map<String, Value>) -> Self {
        self.frontend_settings = settings;
        self
    }

    pub fn with_rules(mut self, rules: Vec<RuleConnection>) -> Self {
        self.rules = rules;
        self
    }

    /// Add a condition every autosave and manual save must pass.
    pub fn with_gatekeeper(self, gatekeeper: impl SaveGatekeeper + 'static) -> Self {
        self.store().add_gatekeeper(gatekeeper);
        self
    }

    /// Replace the component registry, e.g. to add app-specific types.
    pub fn with_registry(mut self, registry: ComponentRegistry) -> Self {
        self.registry = Arc::new(registry);
        *guard(&self.generator) = HierarchyGenerator::new(
            Arc::clone(&self.registry),
            self.diagnostics.clone(),
            self.config.generator_options(),
        );
        self
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn layout(&self) -> &LayoutSet {
        &self.layout
    }

    pub fn store(&self) -> MutexGuard<'_, FormDataStore> {
        lock_store(&self.store)
    }

    pub fn attachments(&self) -> MutexGuard<'_, Attachments> {
        guard(&self.attachments)
    }

    pub fn navigation(&self) -> PageNavigation {
        guard(&self.navigation).clone()
    }

    /// Editing state of a repeating group (default when never touched).
    pub fn group_state(&self, group: NodeId) -> RepeatingGroupState {
        guard(&self.groups).get(&group).cloned().unwrap_or_default()
    }

    /// Number of full hierarchy generations so far.
    pub fn generations(&self) -> u64 {
        guard(&self.generator).generations()
    }

    /// The node hierarchy for the debounced data. Regenerated only when the
    /// layout, debounced data, navigation, code lists or language changed.
    pub fn nodes(&self) -> Arc<LayoutPages> {
        let pages = {
            let store = self.store();
            let mut generator = guard(&self.generator);
            let mut input = GeneratorInput::new(&self.layout, store.debounced());
            input.data_version = store.data_version();
            input.navigation = self.navigation();
            input.options_version = guard(&self.options).version;
            input.language = &self.config.language;
            input.instance = self.instance.as_ref();
            input.frontend_settings = Some(&self.frontend_settings);
            input.texts = Some(&self.texts);
            generator.generate(&input)
        };

        // A group that left the hierarchy starts over if it comes back.
        guard(&self.groups).retain(|id, state| {
            match pages.find_by_id(*id, None).and_then(|n| n.group.as_ref()) {
                Some(group) => {
                    state.retain_rows(group);
                    true
                }
                None => false,
            }
        });
        pages
    }

    // ─── Form data ───────────────────────────────────────────────────────

    pub fn set_leaf_value(&self, path: &str, value: Value) -> bool {
        self.store().set_leaf_value(path, value, Instant::now(), None)
    }

    pub fn set_leaf_value_with_debounce(&self, path: &str, value: Value, debounce: Duration) -> bool {
        self.store()
            .set_leaf_value(path, value, Instant::now(), Some(debounce))
    }

    /// Freeze the data if its debounce window has closed.
    pub fn tick(&self) -> bool {
        self.store().tick(Instant::now(), &self.rules)
    }

    pub fn request_manual_save(&self) {
        self.store().request_manual_save(&self.rules);
    }

    // ─── Saving ──────────────────────────────────────────────────────────

    /// Issue the next save, if one is due.
    pub async fn save(&self) -> Result<SaveOutcome, SaveError> {
        let result = self.saver.save_pending(&self.store).await;
        if !matches!(result, Ok(SaveOutcome::NothingToSave)) {
            self.save_done.notify_waiters();
        }
        result
    }

    /// Save everything unsaved before the session goes away.
    pub async fn teardown(&self) -> Result<SaveOutcome, SaveError> {
        let result = self.saver.flush(&self.store).await;
        if !matches!(result, Ok(SaveOutcome::NothingToSave)) {
            self.save_done.notify_waiters();
        }
        result
    }

    /// Freeze and save on the debounce schedule until `shutdown` changes,
    /// then flush. Save failures are sent to `errors`; the unsaved diff is
    /// retried on the next cycle.
    pub async fn run_autosave(
        &self,
        mut shutdown: watch::Receiver<bool>,
        errors: mpsc::UnboundedSender<SaveError>,
    ) {
        loop {
            let deadline = self
                .store()
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + self.config.debounce_timeout());
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = shutdown.changed() => break,
            }
            self.tick();
            if let Err(e) = self.save().await {
                let _ = errors.send(e);
            }
        }
        if let Err(e) = self.teardown().await {
            let _ = errors.send(e);
        }
    }

    // ─── Locking ─────────────────────────────────────────────────────────

    /// Take the save lock. With unsaved changes this saves them first and
    /// resolves once everything is flushed. Returns `false` when someone
    /// else holds the lock or the flushing save failed.
    pub async fn lock(&self, lock_id: &str) -> bool {
        let request = self.store().lock(lock_id, &self.rules);
        match request {
            LockRequest::Acquired => return true,
            LockRequest::Denied => return false,
            LockRequest::WaitingForSave => {}
        }

        loop {
            let state = self.store().lock_state().clone();
            match state {
                LockState::Locked(holder) if holder == lock_id => return true,
                LockState::Pending(holder) if holder == lock_id => {}
                _ => return false,
            }

            let finished = self.save_done.notified();
            match self.save().await {
                Ok(SaveOutcome::NothingToSave) => {
                    if self.store().is_saving() {
                        finished.await;
                    } else {
                        // Edits arrived after the freeze.
                        self.request_manual_save();
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("lock for {lock_id} not acquired: {e}");
                    return false;
                }
            }
        }
    }

    /// Release the lock, optionally replacing the form data.
    pub fn unlock(&self, lock_id: &str, new_data: Option<Value>) -> bool {
        self.store().unlock(lock_id, new_data)
    }

    // ─── Repeating groups ────────────────────────────────────────────────

    /// The group was shown for the first time.
    pub fn mount_group(&self, group: NodeId) -> Option<Uuid> {
        let pages = self.nodes();
        let node = self.group_node(&pages, group)?;
        let mut store = self.store();
        let result = guard(&self.groups)
            .entry(group)
            .or_default()
            .on_mount(node, &mut store, Instant::now());
        match result {
            Ok(Some(uuid)) => {
                store.debounce(&self.rules);
                Some(uuid)
            }
            Ok(None) => None,
            Err(e) => {
                self.diagnostics.warn(e.to_string());
                None
            }
        }
    }

    /// Append a row. Row structure changes are frozen at once so the next
    /// hierarchy already contains the row.
    pub fn add_row(&self, group: NodeId) -> Option<Uuid> {
        let pages = self.nodes();
        let node = self.group_node(&pages, group)?;
        let mut store = self.store();
        let result = guard(&self.groups)
            .entry(group)
            .or_default()
            .add_row(node, &mut store, Instant::now());
        match result {
            Ok(uuid) => {
                store.debounce(&self.rules);
                Some(uuid)
            }
            Err(e) => {
                self.diagnostics.warn(e.to_string());
                None
            }
        }
    }

    /// Open a row for editing. Returns the validations the group's trigger
    /// asks for, or `None` if the row cannot be opened.
    pub fn start_edit(
        &self,
        group: NodeId,
        row: Uuid,
        validate_on_open: bool,
    ) -> Option<Vec<ComponentValidation>> {
        let pages = self.nodes();
        let node = self.group_node(&pages, group)?;
        let result = guard(&self.groups)
            .entry(group)
            .or_default()
            .start_edit(node, row, validate_on_open);
        match result {
            Ok(scope) => Some(self.validate_scope(&pages, node, scope)),
            Err(e) => {
                self.diagnostics.warn(e.to_string());
                None
            }
        }
    }

    /// Close the open row, returning the validations the trigger asks for.
    pub fn stop_edit(&self, group: NodeId) -> Vec<ComponentValidation> {
        let pages = self.nodes();
        let Some(node) = self.group_node(&pages, group) else {
            return Vec::new();
        };
        let scope = guard(&self.groups).entry(group).or_default().stop_edit(node);
        self.validate_scope(&pages, node, scope)
    }

    pub fn set_multi_page_index(&self, group: NodeId, row: Uuid, index: usize) -> Option<usize> {
        let pages = self.nodes();
        let node = self.group_node(&pages, group)?;
        let result = guard(&self.groups)
            .entry(group)
            .or_default()
            .set_multi_page_index(node, &pages, row, index);
        result
            .map_err(|e| self.diagnostics.warn(e.to_string()))
            .ok()
    }

    /// Delete a row. Attachments uploaded in the row are deleted first; if
    /// any of those deletes fails the row is kept.
    pub async fn delete_row(&self, group: NodeId, row: Uuid) -> Option<RowDeletion> {
        let pages = self.nodes();
        let node = self.group_node(&pages, group)?.clone();
        let requested = guard(&self.groups)
            .entry(group)
            .or_default()
            .request_delete(&node, row);
        if let Err(e) = requested {
            self.diagnostics.warn(e.to_string());
            return None;
        }

        let hook_succeeded = self.delete_row_attachments(&pages, &node, row).await;

        let mut store = self.store();
        let result = guard(&self.groups).entry(group).or_default().finish_delete(
            &node,
            row,
            hook_succeeded,
            &mut store,
            Instant::now(),
        );
        match result {
            Ok(RowDeletion::Deleted) => {
                store.debounce(&self.rules);
                Some(RowDeletion::Deleted)
            }
            Ok(outcome) => Some(outcome),
            Err(e) => {
                self.diagnostics.warn(e.to_string());
                None
            }
        }
    }

    fn group_node<'p>(&self, pages: &'p LayoutPages, group: NodeId) -> Option<&'p LayoutNode> {
        let node = pages.find_by_id(group, None);
        if node.is_none() {
            self.diagnostics.warn(format!("No group `{group}` in the current hierarchy"));
        }
        node
    }

    async fn delete_row_attachments(&self, pages: &LayoutPages, node: &LayoutNode, row: Uuid) -> bool {
        let Some(items) = node
            .group
            .as_ref()
            .and_then(|g| g.row_by_uuid(row))
            .map(|r| r.items.to_vec())
        else {
            return true;
        };

        let mut targets = Vec::new();
        let mut stack = items;
        while let Some(idx) = stack.pop() {
            let child = &pages[idx];
            if self
                .registry
                .get(&child.component_type)
                .is_some_and(|caps| caps.uploads_attachments)
            {
                let ids: Vec<String> = self
                    .attachments()
                    .list(child.id)
                    .iter()
                    .map(|a| a.id.clone())
                    .collect();
                targets.extend(ids.into_iter().map(|id| (child.id, id)));
            }
            stack.extend(pages.children(idx));
        }

        let mut all_deleted = true;
        for (node_id, attachment_id) in targets {
            all_deleted &= self.delete_attachment(node_id, &attachment_id).await;
        }
        all_deleted
    }

    fn validate_scope(
        &self,
        pages: &LayoutPages,
        node: &LayoutNode,
        scope: Option<ValidationScope>,
    ) -> Vec<ComponentValidation> {
        let Some(scope) = scope else {
            return Vec::new();
        };
        let Some(idx) = node_index(pages, node) else {
            return Vec::new();
        };
        let store = self.store();
        match scope {
            ValidationScope::Group => validate_subtree(pages, idx, &self.registry, store.current()),
            ValidationScope::Row(row) => {
                validate_row(pages, idx, row, &self.registry, store.current())
            }
        }
    }

    // ─── Attachments ─────────────────────────────────────────────────────

    /// Upload a file for an upload node and record its id in the data.
    pub async fn upload_attachment(
        &self,
        node_id: NodeId,
        file: AttachmentFile,
    ) -> Result<String, BackendError> {
        let id = self.backend.upload_attachment(node_id, &file).await?;
        self.attachments().add(
            node_id,
            Attachment {
                id: id.clone(),
                name: file.name,
                tags: file.tags,
                deleting: false,
            },
        );

        let pages = self.nodes();
        if let Some(node) = pages.find_by_id(node_id, None) {
            let mut store = self.store();
            add_attachment_to_data(node, &id, &mut store, Instant::now(), &self.diagnostics);
        }
        Ok(id)
    }

    /// Delete an uploaded file and drop its id from the data.
    pub async fn delete_attachment(&self, node_id: NodeId, attachment_id: &str) -> bool {
        if !self.attachments().mark_deleting(node_id, attachment_id) {
            self.diagnostics.warn(format!(
                "Attachment {attachment_id} of `{node_id}` is unknown or already being deleted"
            ));
            return false;
        }

        match self.backend.delete_attachment(node_id, attachment_id).await {
            Ok(()) => {
                self.attachments().remove(node_id, attachment_id);
                let pages = self.nodes();
                if let Some(node) = pages.find_by_id(node_id, None) {
                    let mut store = self.store();
                    remove_attachment_from_data(
                        node,
                        attachment_id,
                        &mut store,
                        Instant::now(),
                        &self.diagnostics,
                    );
                }
                true
            }
            Err(e) => {
                self.attachments().unmark_deleting(node_id, attachment_id);
                self.diagnostics
                    .error(format!("Failed to delete attachment {attachment_id}: {e}"));
                false
            }
        }
    }

    // ─── Validation ──────────────────────────────────────────────────────

    /// Every validation of every visible node, attachments included.
    pub fn validations(&self) -> Vec<ComponentValidation> {
        let pages = self.nodes();
        let mut out = {
            let store = self.store();
            validate_all(&pages, &self.registry, store.current())
        };
        let attachments = self.attachments();
        for (_, node) in pages.flat() {
            let uploads = self
                .registry
                .get(&node.component_type)
                .is_some_and(|caps| caps.uploads_attachments);
            if uploads {
                out.extend(validate_attachments(node, &attachments));
            }
        }
        out
    }

    // ─── Pages ───────────────────────────────────────────────────────────

    pub fn navigate_to(&self, page: &str) -> bool {
        if self.layout.page(page).is_none() {
            self.diagnostics.warn(format!("Cannot navigate to unknown page '{page}'"));
            return false;
        }
        guard(&self.navigation).current_view = page.to_string();
        true
    }

    pub fn set_page_order(&self, order: Option<Vec<String>>) {
        guard(&self.navigation).order = order;
    }

    /// Keys of the pages not hidden by the page order.
    pub fn visible_pages(&self) -> Vec<String> {
        let pages = self.nodes();
        let nav = self.navigation();
        pages
            .pages()
            .iter()
            .filter(|p| !p.is_hidden_via_tracks(&self.settings, &nav))
            .map(|p| p.key.clone())
            .collect()
    }

    /// Walk the visible nodes of a page in layout order. Hidden nodes and
    /// hidden rows are skipped along with everything inside them.
    pub fn render_page(&self, key: &str, renderer: &mut impl NodeRenderer) -> bool {
        let pages = self.nodes();
        let Some(page) = pages.page(key) else {
            self.diagnostics.warn(format!("Cannot render unknown page '{key}'"));
            return false;
        };
        for idx in page.children() {
            render_node(&pages, page, *idx, renderer);
        }
        true
    }

    /// What a Summary node renders, or `None` after reporting why not.
    pub fn summary_target(&self, summary: NodeId) -> Option<(NodeIndex, SummaryKind)> {
        let pages = self.nodes();
        let node = pages.find_by_id(summary, None)?;
        self.registry.summary_target(&pages, node, &self.diagnostics)
    }

    /// Display text of a node's value, as shown in summaries.
    pub fn display_data(&self, node_id: NodeId) -> String {
        let pages = self.nodes();
        let Some(node) = pages.find_by_id(node_id, None) else {
            return String::new();
        };
        let Some(caps) = self.registry.get(&node.component_type) else {
            return String::new();
        };
        let store = self.store();
        (caps.display_data)(node, store.current())
    }

    // ─── Code lists ──────────────────────────────────────────────────────

    /// Fetch a code list and cache it. A changed list triggers
    /// regeneration of the hierarchy.
    pub async fn load_options(
        &self,
        source: &str,
        query: &BTreeMap<String, String>,
    ) -> Result<Vec<OptionItem>, BackendError> {
        let items = self.backend.fetch_options(source, query).await?;
        let mut cache = guard(&self.options);
        if cache.lists.get(source) != Some(&items) {
            cache.lists.insert(source.to_string(), items.clone());
            cache.version += 1;
        }
        Ok(items)
    }

    pub fn options(&self, source: &str) -> Option<Vec<OptionItem>> {
        guard(&self.options).lists.get(source).cloned()
    }
}

fn node_index(pages: &LayoutPages, node: &LayoutNode) -> Option<NodeIndex> {
    pages.page(&node.page_key)?.find_by_id(node.id)
}

fn render_node(
    pages: &LayoutPages,
    page: &LayoutPage,
    idx: NodeIndex,
    renderer: &mut impl NodeRenderer,
) {
    let node = &pages[idx];
    if node.hidden {
        return;
    }
    renderer.render(node, page);
    match &node.group {
        Some(group) => {
            for row in group.visible_rows() {
                for item in &row.items {
                    render_node(pages, page, *item, renderer);
                }
            }
        }
        None => {
            for child in pages.children(idx) {
                render_node(pages, page, child, renderer);
            }
        }
    }
}
