//! Node hierarchy generation.
//!
//! Turns the static [`LayoutSet`] plus the current (debounced) form data into
//! [`LayoutPages`]: every component instantiated once per row context, with
//! its expressions resolved. All nodes of all pages live in one `petgraph`
//! arena; pages hold index lists into it.
//!
//! The tree is never patched. Each generation builds a fresh arena and the
//! caller swaps the returned `Arc` in. Generation is memoized on
//! [`GenerationKey`].
//!
//! Two phases:
//!
//! 1. **Structure**: walk each page depth-first from its unclaimed
//!    components, expanding containers in place and repeating groups once
//!    per row of their bound array.
//! 2. **Expressions**: resolve `hidden`, `required`, `readOnly`, text
//!    bindings, type-specific expression properties and per-row `hiddenRow`
//!    in dependency order. The order comes from a graph over base component
//!    ids (parent → child, referenced → referencing) sorted with Tarjan's
//!    SCC algorithm; strongly connected components are cycles, reported as
//!    configuration errors and left unevaluated.

use crate::diagnostics::Diagnostics;
use crate::expr::{Expr, ExprContext, ExprType, resolve_property};
use crate::id::NodeId;
use crate::model::{
    ChildRef, ComponentDef, DataModelBindings, GroupEdit, InstanceContext, LayoutSet,
    LayoutSettings, PageLayout, TextResources,
};
use crate::path::{RowFrame, pick, transpose};
use crate::registry::{ComponentCapabilities, ComponentRegistry};
use crate::rules::DataContext;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::{Map, Value};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Index;
use std::sync::Arc;
use uuid::Uuid;

/// Row objects carry their identity under this key.
pub const ROW_ID_KEY: &str = "altinnRowId";

// ─── Nodes ───────────────────────────────────────────────────────────────

/// One row of a group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRow {
    pub uuid: Uuid,
    pub index: usize,
    /// Direct child nodes instantiated for this row.
    pub items: SmallVec<[NodeIndex; 4]>,
    /// Result of the group's `hiddenRow` expression for this row.
    pub hidden: bool,
}

/// Row bookkeeping for group containers.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupState {
    /// `false` for a group with `maxCount` 1: a single implicit row
    /// without add/remove.
    pub repeating: bool,
    /// Resolved path of the bound array.
    pub binding: Option<String>,
    pub rows: Vec<GroupRow>,
    pub min_count: usize,
    pub max_count: Option<usize>,
    pub edit: GroupEdit,
}

impl GroupState {
    pub fn row_by_uuid(&self, uuid: Uuid) -> Option<&GroupRow> {
        self.rows.iter().find(|r| r.uuid == uuid)
    }

    pub fn visible_rows(&self) -> impl Iterator<Item = &GroupRow> {
        self.rows.iter().filter(|r| !r.hidden)
    }

    /// Index of the last row, recomputed from the row list.
    pub fn last_index(&self) -> Option<usize> {
        self.rows.len().checked_sub(1)
    }

    /// Whether another row may be added.
    pub fn can_add(&self) -> bool {
        self.repeating && self.max_count.is_none_or(|max| self.rows.len() < max)
    }
}

/// A resolved component instance in one row context.
#[derive(Debug, Clone)]
pub struct LayoutNode {
    /// Unique id: base id plus one `-<row>` per enclosing row.
    pub id: NodeId,
    /// Template id from the layout.
    pub base_id: NodeId,
    pub component_type: String,
    pub page_key: String,
    pub def: Arc<ComponentDef>,
    pub parent: Option<NodeIndex>,
    /// Enclosing repeating-group rows, outermost first.
    pub row_frames: SmallVec<[RowFrame; 2]>,
    /// Uuid of the innermost enclosing row.
    pub row_uuid: Option<Uuid>,
    /// Bindings with row indices applied.
    pub bindings: DataModelBindings,
    /// Page within a multi-page group row.
    pub multi_page_index: Option<usize>,
    /// Own `hidden` or inherited from an ancestor or a hidden row.
    pub hidden: bool,
    pub required: bool,
    pub read_only: bool,
    /// Resolved text resource bindings (translated).
    pub texts: BTreeMap<String, String>,
    /// Remaining properties, with expression properties resolved.
    pub props: Map<String, Value>,
    pub group: Option<GroupState>,
}

impl LayoutNode {
    pub fn row_index(&self) -> Option<usize> {
        self.row_frames.last().map(|f| f.index)
    }

    pub fn is_repeating_group(&self) -> bool {
        self.group.as_ref().is_some_and(|g| g.repeating)
    }

    /// Current value of the simple binding.
    pub fn simple_value<'d>(&self, data: &'d Value) -> Option<&'d Value> {
        pick(data, self.bindings.simple()?)
    }
}

// ─── Pages ───────────────────────────────────────────────────────────────

/// Page navigation state that affects generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PageNavigation {
    pub current_view: String,
    /// Visible page order, when known.
    pub order: Option<Vec<String>>,
}

/// Index lists for one page.
#[derive(Debug, Clone, Default)]
pub struct LayoutPage {
    pub key: String,
    top_level: Vec<NodeIndex>,
    flat: Vec<NodeIndex>,
    /// Node id and base id → instances, in page order.
    id_index: HashMap<NodeId, SmallVec<[NodeIndex; 2]>>,
}

impl LayoutPage {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Self::default()
        }
    }

    fn register(&mut self, idx: NodeIndex, node: &LayoutNode) {
        if node.parent.is_none() {
            self.top_level.push(idx);
        }
        self.flat.push(idx);
        self.id_index.entry(node.id).or_default().push(idx);
        if node.base_id != node.id {
            self.id_index.entry(node.base_id).or_default().push(idx);
        }
    }

    /// Top-level nodes in layout order.
    pub fn children(&self) -> &[NodeIndex] {
        &self.top_level
    }

    /// Every node on the page, including repeated instances.
    pub fn flat(&self) -> &[NodeIndex] {
        &self.flat
    }

    /// First node with this id or base id on this page.
    pub fn find_by_id(&self, id: NodeId) -> Option<NodeIndex> {
        self.id_index.get(&id).and_then(|v| v.first().copied())
    }

    pub fn find_all_by_id(&self, id: NodeId) -> &[NodeIndex] {
        self.id_index.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Whether page order hides this page. The current view and the PDF
    /// layout are never hidden; without a known order nothing is.
    pub fn is_hidden_via_tracks(&self, settings: &LayoutSettings, nav: &PageNavigation) -> bool {
        if self.key == nav.current_view {
            return false;
        }
        if settings.pages.pdf_layout_name.as_deref() == Some(self.key.as_str()) {
            return false;
        }
        match &nav.order {
            Some(order) => !order.contains(&self.key),
            None => false,
        }
    }
}

/// All pages of one generation.
#[derive(Debug, Clone, Default)]
pub struct LayoutPages {
    graph: DiGraph<LayoutNode, ()>,
    pages: Vec<LayoutPage>,
}

impl Index<NodeIndex> for LayoutPages {
    type Output = LayoutNode;

    fn index(&self, idx: NodeIndex) -> &LayoutNode {
        &self.graph[idx]
    }
}

impl LayoutPages {
    pub fn pages(&self) -> &[LayoutPage] {
        &self.pages
    }

    pub fn page(&self, key: &str) -> Option<&LayoutPage> {
        self.pages.iter().find(|p| p.key == key)
    }

    pub fn node(&self, idx: NodeIndex) -> Option<&LayoutNode> {
        self.graph.node_weight(idx)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Children of a node in layout order.
    pub fn children(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut children: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, petgraph::Direction::Outgoing)
            .collect();
        children.sort();
        children
    }

    /// Find a node by id or base id, searching `from_page` first.
    pub fn find_by_id(&self, id: NodeId, from_page: Option<&str>) -> Option<&LayoutNode> {
        self.ordered_pages(from_page)
            .find_map(|p| p.find_by_id(id))
            .map(|idx| &self.graph[idx])
    }

    /// Every node with this id or base id, across all pages.
    pub fn find_all_by_id(&self, id: NodeId) -> Vec<&LayoutNode> {
        self.pages
            .iter()
            .flat_map(|p| p.find_all_by_id(id))
            .map(|idx| &self.graph[*idx])
            .collect()
    }

    /// Every node on every page, in page order.
    pub fn flat(&self) -> impl Iterator<Item = (NodeIndex, &LayoutNode)> {
        self.pages
            .iter()
            .flat_map(|p| p.flat.iter())
            .map(|idx| (*idx, &self.graph[*idx]))
    }

    /// The instance of `id` closest to `from`: sharing the most enclosing
    /// rows, then on the same page, then first in layout order.
    pub fn find_closest(&self, id: NodeId, from: &LayoutNode) -> Option<NodeIndex> {
        let candidates = self
            .ordered_pages(Some(&from.page_key))
            .flat_map(|p| p.find_all_by_id(id).iter().copied());
        closest(&self.graph, candidates, from)
    }

    fn ordered_pages<'a>(&'a self, first: Option<&'a str>) -> impl Iterator<Item = &'a LayoutPage> {
        let head = first.and_then(|k| self.page(k));
        head.into_iter()
            .chain(self.pages.iter().filter(move |p| Some(p.key.as_str()) != first))
    }
}

fn closest(
    graph: &DiGraph<LayoutNode, ()>,
    candidates: impl Iterator<Item = NodeIndex>,
    from: &LayoutNode,
) -> Option<NodeIndex> {
    closest_to_rows(graph, candidates, &from.row_frames, &from.page_key)
}

/// Like [`closest`], measured from a row context instead of a node. Row
/// expressions of a group look up components inside the row being
/// evaluated.
fn closest_to_rows(
    graph: &DiGraph<LayoutNode, ()>,
    candidates: impl Iterator<Item = NodeIndex>,
    rows: &[RowFrame],
    page_key: &str,
) -> Option<NodeIndex> {
    let mut best: Option<((usize, bool), NodeIndex)> = None;
    for idx in candidates {
        let node = &graph[idx];
        let shared = node
            .row_frames
            .iter()
            .zip(rows.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let score = (shared, node.page_key == page_key);
        if best.is_none_or(|(s, _)| score > s) {
            best = Some((score, idx));
        }
    }
    best.map(|(_, idx)| idx)
}

// ─── Generator ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorOptions {
    /// Give an empty repeating group one implicit row.
    pub always_show_one_row: bool,
}

/// Everything one generation reads.
#[derive(Debug, Clone)]
pub struct GeneratorInput<'a> {
    pub layout: &'a LayoutSet,
    /// Debounced form data.
    pub data: &'a Value,
    pub data_version: u64,
    pub navigation: PageNavigation,
    pub options_version: u64,
    pub language: &'a str,
    pub instance: Option<&'a InstanceContext>,
    pub frontend_settings: Option<&'a Map<String, Value>>,
    pub texts: Option<&'a TextResources>,
}

impl<'a> GeneratorInput<'a> {
    pub fn new(layout: &'a LayoutSet, data: &'a Value) -> Self {
        Self {
            layout,
            data,
            data_version: 0,
            navigation: PageNavigation::default(),
            options_version: 0,
            language: "nb",
            instance: None,
            frontend_settings: None,
            texts: None,
        }
    }

    pub fn key(&self) -> GenerationKey {
        GenerationKey {
            layout_version: self.layout.version,
            data_version: self.data_version,
            navigation: self.navigation.clone(),
            options_version: self.options_version,
            language: self.language.to_string(),
        }
    }

    fn data_context(&self) -> DataContext<'a> {
        DataContext {
            data: self.data,
            instance: self.instance,
            frontend_settings: self.frontend_settings,
            texts: self.texts,
            language: self.language,
        }
    }
}

/// Memoization key: regeneration happens only when one of these changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationKey {
    pub layout_version: u64,
    pub data_version: u64,
    pub navigation: PageNavigation,
    pub options_version: u64,
    pub language: String,
}

/// Builds and memoizes [`LayoutPages`].
pub struct HierarchyGenerator {
    registry: Arc<ComponentRegistry>,
    diagnostics: Diagnostics,
    options: GeneratorOptions,
    cache: Option<(GenerationKey, Arc<LayoutPages>)>,
    generations: u64,
}

impl HierarchyGenerator {
    pub fn new(
        registry: Arc<ComponentRegistry>,
        diagnostics: Diagnostics,
        options: GeneratorOptions,
    ) -> Self {
        Self {
            registry,
            diagnostics,
            options,
            cache: None,
            generations: 0,
        }
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn options(&self) -> GeneratorOptions {
        self.options
    }

    /// Number of full generations run so far (cache hits excluded).
    pub fn generations(&self) -> u64 {
        self.generations
    }

    /// Drop the memoized result.
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Generate the hierarchy, reusing the previous result when the
    /// generation key is unchanged.
    pub fn generate(&mut self, input: &GeneratorInput<'_>) -> Arc<LayoutPages> {
        let key = input.key();
        if let Some((cached_key, pages)) = &self.cache
            && *cached_key == key
        {
            return Arc::clone(pages);
        }

        log::debug!(
            "generating hierarchy (layout v{}, data v{})",
            key.layout_version,
            key.data_version
        );
        let pages = Arc::new(self.generate_uncached(input));
        self.generations += 1;
        self.cache = Some((key, Arc::clone(&pages)));
        pages
    }

    /// Generate without touching the memo.
    pub fn generate_uncached(&self, input: &GeneratorInput<'_>) -> LayoutPages {
        let mut builder = Builder {
            registry: &self.registry,
            diagnostics: &self.diagnostics,
            options: self.options,
            input,
            graph: DiGraph::new(),
            instances: HashMap::new(),
            order: Vec::new(),
        };

        let mut pages = Vec::with_capacity(input.layout.pages.len());
        let mut page_nodes = Vec::with_capacity(input.layout.pages.len());
        for page in &input.layout.pages {
            let start = builder.graph.node_count();
            builder.build_page(page);
            page_nodes.push(start..builder.graph.node_count());
        }

        builder.resolve_expressions();

        for (page, range) in input.layout.pages.iter().zip(page_nodes) {
            let mut layout_page = LayoutPage::new(&page.key);
            for i in range {
                let idx = NodeIndex::new(i);
                layout_page.register(idx, &builder.graph[idx]);
            }
            pages.push(layout_page);
        }

        LayoutPages {
            graph: builder.graph,
            pages,
        }
    }
}

// ─── Phase 1: structure ──────────────────────────────────────────────────

struct Builder<'a, 'i> {
    registry: &'a ComponentRegistry,
    diagnostics: &'a Diagnostics,
    options: GeneratorOptions,
    input: &'a GeneratorInput<'i>,
    graph: DiGraph<LayoutNode, ()>,
    /// Base id → instances, in creation order.
    instances: HashMap<NodeId, Vec<NodeIndex>>,
    /// Base ids in first-seen order.
    order: Vec<NodeId>,
}

/// Per-page lookup tables used while instantiating.
struct PageScope<'p> {
    key: &'p str,
    defs: HashMap<NodeId, Arc<ComponentDef>>,
    /// Child id → the container that owns it.
    owner: HashMap<NodeId, NodeId>,
}

impl Builder<'_, '_> {
    fn build_page(&mut self, page: &PageLayout) {
        let mut scope = PageScope {
            key: &page.key,
            defs: HashMap::new(),
            owner: HashMap::new(),
        };
        for def in &page.components {
            if scope.defs.contains_key(&def.id) {
                self.diagnostics.error_once(format!(
                    "Duplicate component id '{}' on page '{}'",
                    def.id, page.key
                ));
                continue;
            }
            scope.defs.insert(def.id, Arc::new(def.clone()));
        }

        for def in &page.components {
            let Some(caps) = self.registry.get(&def.component_type) else {
                continue;
            };
            if !caps.is_container() {
                continue;
            }
            for child in (caps.children)(def) {
                if !scope.defs.contains_key(&child.id) {
                    self.diagnostics.error_once(format!(
                        "Container '{}' lists unknown child '{}'",
                        def.id, child.id
                    ));
                    continue;
                }
                if let Some(first) = scope.owner.get(&child.id) {
                    if *first != def.id {
                        self.diagnostics.error_once(format!(
                            "Component '{}' is claimed by both '{first}' and '{}'",
                            child.id, def.id
                        ));
                    }
                    continue;
                }
                scope.owner.insert(child.id, def.id);
            }
        }

        for def in &page.components {
            if scope.owner.contains_key(&def.id) {
                continue;
            }
            if let Some(def) = scope.defs.get(&def.id).cloned() {
                self.instantiate(&scope, &def, None, &[], None, None);
            }
        }
    }

    fn instantiate(
        &mut self,
        scope: &PageScope<'_>,
        def: &Arc<ComponentDef>,
        parent: Option<NodeIndex>,
        rows: &[RowFrame],
        row_uuid: Option<Uuid>,
        multi_page_index: Option<usize>,
    ) -> Option<NodeIndex> {
        let Some(caps) = self.registry.get(&def.component_type).copied() else {
            self.diagnostics.error_once(format!(
                "Unknown component type '{}' for '{}'; skipping",
                def.component_type, def.id
            ));
            return None;
        };

        let suffix: SmallVec<[usize; 4]> = rows.iter().map(|r| r.index).collect();
        let bindings = DataModelBindings(
            def.data_model_bindings
                .iter()
                .map(|(k, v)| (k.to_string(), transpose(v, rows)))
                .collect(),
        );

        let node = LayoutNode {
            id: NodeId::with_row_suffix(def.id, &suffix),
            base_id: def.id,
            component_type: def.component_type.clone(),
            page_key: scope.key.to_string(),
            def: Arc::clone(def),
            parent,
            row_frames: rows.iter().cloned().collect(),
            row_uuid,
            bindings,
            multi_page_index,
            hidden: false,
            required: false,
            read_only: false,
            texts: BTreeMap::new(),
            props: def.extra.clone(),
            group: None,
        };
        let idx = self.graph.add_node(node);
        if let Some(p) = parent {
            self.graph.add_edge(p, idx, ());
        }
        let seen = self.instances.entry(def.id).or_default();
        if seen.is_empty() {
            self.order.push(def.id);
        }
        seen.push(idx);

        if caps.is_container() {
            let children: Vec<ChildRef> = (caps.children)(def)
                .into_iter()
                .filter(|c| scope.owner.get(&c.id) == Some(&def.id))
                .collect();
            self.expand_container(scope, idx, def, &caps, &children, rows, row_uuid);
        }
        Some(idx)
    }

    fn expand_container(
        &mut self,
        scope: &PageScope<'_>,
        idx: NodeIndex,
        def: &Arc<ComponentDef>,
        caps: &ComponentCapabilities,
        children: &[ChildRef],
        rows: &[RowFrame],
        row_uuid: Option<Uuid>,
    ) {
        let group_like = caps.binding_requirements.contains(&DataModelBindings::GROUP)
            || def.max_count.is_some();
        let repeating = is_repeating(def);

        if !repeating {
            let mut items = SmallVec::new();
            for child in children {
                if let Some(child_def) = scope.defs.get(&child.id).cloned()
                    && let Some(c) =
                        self.instantiate(scope, &child_def, Some(idx), rows, row_uuid, None)
                {
                    items.push(c);
                }
            }
            if group_like {
                let node_id = self.graph[idx].id;
                self.graph[idx].group = Some(GroupState {
                    repeating: false,
                    binding: self.graph[idx].bindings.group().map(str::to_string),
                    rows: vec![GroupRow {
                        uuid: fallback_row_uuid(node_id, 0),
                        index: 0,
                        items,
                        hidden: false,
                    }],
                    min_count: def.min_count.unwrap_or(0),
                    max_count: Some(1),
                    edit: def.edit.clone(),
                });
            }
            return;
        }

        let node_id = self.graph[idx].id;
        let template = def.data_model_bindings.group().map(str::to_string);
        let resolved = self.graph[idx].bindings.group().map(str::to_string);
        let array = resolved.as_deref().and_then(|p| pick(self.input.data, p));
        let existing: &[Value] = match array {
            Some(Value::Array(items)) => items,
            None | Some(Value::Null) => &[],
            Some(other) => {
                self.diagnostics.error_once(format!(
                    "Group binding '{}' of '{}' points to {} instead of an array",
                    resolved.as_deref().unwrap_or_default(),
                    def.id,
                    type_name(other)
                ));
                &[]
            }
        };
        let mut count = existing.len();
        if count == 0 && self.options.always_show_one_row {
            count = 1;
        }

        let mut group_rows = Vec::with_capacity(count);
        for i in 0..count {
            let uuid = existing
                .get(i)
                .and_then(|row| row.get(ROW_ID_KEY))
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .unwrap_or_else(|| fallback_row_uuid(node_id, i));

            let mut child_rows: SmallVec<[RowFrame; 2]> = rows.iter().cloned().collect();
            if let (Some(template), Some(resolved)) = (&template, &resolved) {
                child_rows.push(RowFrame {
                    template: template.clone(),
                    resolved: resolved.clone(),
                    index: i,
                });
            }

            let mut items = SmallVec::new();
            for child in children {
                let Some(child_def) = scope.defs.get(&child.id).cloned() else {
                    continue;
                };
                let page_index = if def.edit.multi_page {
                    child.page_index
                } else {
                    None
                };
                if let Some(c) = self.instantiate(
                    scope,
                    &child_def,
                    Some(idx),
                    &child_rows,
                    Some(uuid),
                    page_index,
                ) {
                    items.push(c);
                }
            }
            group_rows.push(GroupRow {
                uuid,
                index: i,
                items,
                hidden: false,
            });
        }

        self.graph[idx].group = Some(GroupState {
            repeating: true,
            binding: resolved,
            rows: group_rows,
            min_count: def.min_count.unwrap_or(0),
            max_count: def.max_count,
            edit: def.edit.clone(),
        });
    }
}

/// A group repeats unless `maxCount` is 1. Legacy `Group` components repeat
/// when `maxCount` is above 1.
pub fn is_repeating(def: &ComponentDef) -> bool {
    match def.component_type.as_str() {
        "RepeatingGroup" => def.max_count != Some(1),
        "Group" => def.max_count.is_some_and(|m| m > 1),
        _ => false,
    }
}

/// Deterministic row uuid for rows stored without an `altinnRowId`.
pub fn fallback_row_uuid(group: NodeId, index: usize) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{group}/{index}").as_bytes(),
    )
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ─── Phase 2: expressions ────────────────────────────────────────────────

/// Raw expression properties of a definition.
/// Node-level expressions of a definition. `hiddenRow` is evaluated per
/// row after the rows' children and is not part of the ordering graph.
fn expression_sources<'d>(
    def: &'d ComponentDef,
    caps: Option<&ComponentCapabilities>,
) -> impl Iterator<Item = &'d Value> {
    let fixed = [&def.hidden, &def.required, &def.read_only]
        .into_iter()
        .flatten();
    let texts = def.text_resource_bindings.values();
    let keys: &'static [(&'static str, ExprType)] = caps.map(|c| c.expression_keys).unwrap_or(&[]);
    let extra = keys.iter().filter_map(|(k, _)| def.extra.get(*k));
    fixed.chain(texts).chain(extra)
}

/// Base ids referenced through `component`/`isHidden` by a definition.
pub fn referenced_components(
    def: &ComponentDef,
    caps: Option<&ComponentCapabilities>,
) -> Vec<NodeId> {
    expression_sources(def, caps)
        .filter(|raw| raw.is_array())
        .filter_map(|raw| Expr::compile(raw).ok())
        .flat_map(|e| e.component_refs())
        .collect()
}

/// Ordering edges for expression resolution, as `(dependency, dependent)`.
///
/// `containment` holds `(parent, child)` pairs so containers resolve before
/// their children. `references` holds `(referenced, referencing)` pairs. A
/// container reading one of its own descendants gets no edge for that
/// reference: the descendant is still resolved after it and reads as
/// not hidden at that point.
pub fn dependency_edges(
    containment: &[(NodeId, NodeId)],
    references: &[(NodeId, NodeId)],
) -> Vec<(NodeId, NodeId)> {
    let mut parents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for (parent, child) in containment {
        let list = parents.entry(*child).or_default();
        if !list.contains(parent) {
            list.push(*parent);
        }
    }
    let is_ancestor = |ancestor: NodeId, of: NodeId| {
        let mut stack = vec![of];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            for parent in parents.get(&id).into_iter().flatten() {
                if *parent == ancestor {
                    return true;
                }
                if seen.insert(*parent) {
                    stack.push(*parent);
                }
            }
        }
        false
    };

    let mut edges = containment.to_vec();
    edges.extend(
        references
            .iter()
            .filter(|(referenced, referencing)| !is_ancestor(*referencing, *referenced))
            .copied(),
    );
    edges
}

/// Strongly connected groups of base ids in evaluation order, each flagged
/// when it forms a cycle.
///
/// `edges` are `(dependency, dependent)` pairs.
pub fn evaluation_order(ids: &[NodeId], edges: &[(NodeId, NodeId)]) -> Vec<(Vec<NodeId>, bool)> {
    let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
    let mut index = HashMap::new();
    for id in ids {
        index.entry(*id).or_insert_with(|| graph.add_node(*id));
    }
    for (from, to) in edges {
        if let (Some(a), Some(b)) = (index.get(from), index.get(to))
            && graph.find_edge(*a, *b).is_none()
        {
            graph.add_edge(*a, *b, ());
        }
    }

    let mut sccs = tarjan_scc(&graph);
    sccs.reverse();
    sccs.into_iter()
        .map(|scc| {
            let cyclic = scc.len() > 1 || graph.find_edge(scc[0], scc[0]).is_some();
            let mut ids: Vec<NodeId> = scc.into_iter().map(|i| graph[i]).collect();
            ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            (ids, cyclic)
        })
        .collect()
}

/// Row-aware expression context for one node.
struct NodeContext<'a> {
    base: DataContext<'a>,
    graph: &'a DiGraph<LayoutNode, ()>,
    instances: &'a HashMap<NodeId, Vec<NodeIndex>>,
    node: &'a LayoutNode,
    rows: &'a [RowFrame],
}

impl NodeContext<'_> {
    fn closest(&self, id: NodeId) -> Option<&LayoutNode> {
        let candidates = self.instances.get(&id)?.iter().copied();
        closest_to_rows(self.graph, candidates, self.rows, &self.node.page_key)
            .map(|idx| &self.graph[idx])
    }
}

impl ExprContext for NodeContext<'_> {
    fn data_model(&self, path: &str) -> Option<Value> {
        pick(self.base.data, &transpose(path, self.rows)).cloned()
    }

    fn component(&self, id: NodeId) -> Option<Value> {
        let target = self.closest(id)?;
        if target.hidden {
            return None;
        }
        target.simple_value(self.base.data).cloned()
    }

    fn is_hidden(&self, id: NodeId) -> Option<bool> {
        self.closest(id).map(|n| n.hidden)
    }

    fn instance_context(&self, key: &str) -> Option<String> {
        self.base.instance_context(key)
    }

    fn frontend_setting(&self, key: &str) -> Option<Value> {
        self.base.frontend_setting(key)
    }

    fn language(&self) -> String {
        self.base.language()
    }

    fn text(&self, key: &str) -> Option<String> {
        self.base.text(key)
    }
}

struct Resolved {
    hidden: bool,
    required: bool,
    read_only: bool,
    texts: BTreeMap<String, String>,
    props: Map<String, Value>,
}

impl Builder<'_, '_> {
    fn resolve_expressions(&mut self) {
        let mut containment = Vec::new();
        for idx in self.graph.node_indices() {
            let node = &self.graph[idx];
            if let Some(p) = node.parent {
                containment.push((self.graph[p].base_id, node.base_id));
            }
        }
        let mut references = Vec::new();
        for base in &self.order {
            let Some(first) = self.instances.get(base).and_then(|v| v.first()) else {
                continue;
            };
            let node = &self.graph[*first];
            let caps = self.registry.get(&node.component_type);
            for referenced in referenced_components(&node.def, caps) {
                references.push((referenced, *base));
            }
        }
        let edges = dependency_edges(&containment, &references);

        for (ids, cyclic) in evaluation_order(&self.order, &edges) {
            if cyclic {
                let names: Vec<&str> = ids.iter().map(|i| i.as_str()).collect();
                self.diagnostics.error_once(format!(
                    "Expression dependency cycle between: {}; expressions left unevaluated",
                    names.join(", ")
                ));
            }
            for base in ids {
                let Some(instances) = self.instances.get(&base).cloned() else {
                    continue;
                };
                for idx in instances {
                    let resolved = self.resolve_node(idx, cyclic);
                    self.apply(idx, resolved);
                }
            }
        }
        self.resolve_row_expressions();
    }

    /// `hiddenRow` of every repeating group, evaluated once the rows'
    /// children are resolved. Everything inside a hidden row is hidden.
    fn resolve_row_expressions(&mut self) {
        let groups: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| {
                let node = &self.graph[*idx];
                node.def.hidden_row.is_some() && node.group.as_ref().is_some_and(|g| g.repeating)
            })
            .collect();

        for idx in groups {
            let row_hidden = self.resolve_hidden_rows(idx);
            let mut hide = Vec::new();
            if let Some(group) = &mut self.graph[idx].group {
                for (row, hidden) in group.rows.iter_mut().zip(row_hidden) {
                    row.hidden = hidden;
                    if hidden {
                        hide.extend(row.items.iter().copied());
                    }
                }
            }
            while let Some(child) = hide.pop() {
                self.graph[child].hidden = true;
                hide.extend(self.graph.neighbors_directed(child, petgraph::Direction::Outgoing));
            }
        }
    }

    fn resolve_hidden_rows(&self, idx: NodeIndex) -> Vec<bool> {
        let node = &self.graph[idx];
        let (Some(group), Some(raw)) = (&node.group, &node.def.hidden_row) else {
            return Vec::new();
        };
        let template = node.def.data_model_bindings.group().unwrap_or_default();
        group
            .rows
            .iter()
            .map(|row| {
                let mut rows: SmallVec<[RowFrame; 2]> = node.row_frames.clone();
                rows.push(RowFrame {
                    template: template.to_string(),
                    resolved: group.binding.clone().unwrap_or_default(),
                    index: row.index,
                });
                let ctx = NodeContext {
                    base: self.input.data_context(),
                    graph: &self.graph,
                    instances: &self.instances,
                    node,
                    rows: &rows,
                };
                resolve_property(
                    raw,
                    ExprType::Boolean,
                    Value::Bool(false),
                    &ctx,
                    self.diagnostics,
                    &format!("'{}'.hiddenRow", node.base_id),
                )
                .as_bool()
                .unwrap_or(false)
            })
            .collect()
    }

    fn resolve_node(&self, idx: NodeIndex, cyclic: bool) -> Resolved {
        let node = &self.graph[idx];
        let def = &node.def;
        let caps = self.registry.get(&node.component_type);
        let ctx = NodeContext {
            base: self.input.data_context(),
            graph: &self.graph,
            instances: &self.instances,
            node,
            rows: &node.row_frames,
        };

        let prop = |raw: Option<&Value>, ty: ExprType, default: Value, name: &str| -> Value {
            match raw {
                None => default,
                Some(raw) if cyclic && raw.is_array() => default,
                Some(raw) => resolve_property(
                    raw,
                    ty,
                    default,
                    &ctx,
                    self.diagnostics,
                    &format!("'{}'.{name}", node.base_id),
                ),
            }
        };

        let as_bool = |v: Value| v.as_bool().unwrap_or(false);
        let hidden = as_bool(prop(def.hidden.as_ref(), ExprType::Boolean, Value::Bool(false), "hidden"));
        let required = as_bool(prop(def.required.as_ref(), ExprType::Boolean, Value::Bool(false), "required"));
        let read_only = as_bool(prop(def.read_only.as_ref(), ExprType::Boolean, Value::Bool(false), "readOnly"));

        let mut texts = BTreeMap::new();
        for (key, raw) in &def.text_resource_bindings {
            let text_key = prop(
                Some(raw),
                ExprType::String,
                Value::String(String::new()),
                key.as_str(),
            );
            let text_key = text_key.as_str().unwrap_or_default();
            let text = self
                .input
                .texts
                .and_then(|t| t.get(text_key))
                .cloned()
                .unwrap_or_else(|| text_key.to_string());
            texts.insert(key.clone(), text);
        }

        let mut props = def.extra.clone();
        for (key, ty) in caps.map(|c| c.expression_keys).unwrap_or(&[]) {
            if let Some(raw) = def.extra.get(*key) {
                props.insert((*key).to_string(), prop(Some(raw), *ty, Value::Null, *key));
            }
        }

        let inherited = node.parent.is_some_and(|p| self.graph[p].hidden);

        Resolved {
            hidden: hidden || inherited,
            required,
            read_only,
            texts,
            props,
        }
    }

    fn apply(&mut self, idx: NodeIndex, resolved: Resolved) {
        let node = &mut self.graph[idx];
        node.hidden = resolved.hidden;
        node.required = resolved.required;
        node.read_only = resolved.read_only;
        node.texts = resolved.texts;
        node.props = resolved.props;
    }
}
