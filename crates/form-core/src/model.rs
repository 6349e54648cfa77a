//! Static layout description: pages of component definitions.
//!
//! Layouts arrive as JSON, one file per page (`{"data": {"layout": [...]}}`).
//! Container components list their children by id; multi-page repeating
//! groups prefix each child with a page index (`"1:childId"`). Properties
//! that may hold expressions are kept as raw `serde_json::Value` here and
//! compiled by the expression module during hierarchy generation.

use crate::id::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Opaque text resource lookup (key → translated string).
pub type TextResources = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("Invalid layout for page '{page}': {source}")]
    Json {
        page: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Duplicate page '{0}'")]
    DuplicatePage(String),
}

// ─── Data model bindings ─────────────────────────────────────────────────

/// Binding name → data-model path (`simpleBinding`, `list`, `group`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataModelBindings(pub BTreeMap<String, String>);

impl DataModelBindings {
    pub const SIMPLE: &'static str = "simpleBinding";
    pub const LIST: &'static str = "list";
    pub const GROUP: &'static str = "group";

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn simple(&self) -> Option<&str> {
        self.get(Self::SIMPLE)
    }

    pub fn list(&self) -> Option<&str> {
        self.get(Self::LIST)
    }

    pub fn group(&self) -> Option<&str> {
        self.get(Self::GROUP)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

// ─── Repeating group configuration ───────────────────────────────────────

/// How rows of a repeating group are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EditMode {
    #[default]
    ShowTable,
    HideTable,
    ShowAll,
    OnlyTable,
    Likert,
}

/// The `edit` block of a repeating group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupEdit {
    pub mode: EditMode,
    pub multi_page: bool,
    pub open_by_default: bool,
    pub always_show_add_button: bool,
    pub add_button: Option<Value>,
    pub delete_button: Option<Value>,
}

/// Component triggers. Only the validation triggers matter to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Trigger {
    Validation,
    ValidateRow,
    ValidatePage,
    ValidateAllPages,
    #[serde(other)]
    Other,
}

/// A child reference inside a container's `children` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRef {
    pub id: NodeId,
    /// Page within a multi-page group row (`"1:childId"`).
    pub page_index: Option<usize>,
}

impl ChildRef {
    /// Parse `childId` or `pageIndex:childId`. Returns `None` on a malformed
    /// page prefix.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.split_once(':') {
            None => Some(Self {
                id: NodeId::intern(raw),
                page_index: None,
            }),
            Some((page, id)) => {
                let page_index = page.parse::<usize>().ok()?;
                if id.is_empty() {
                    return None;
                }
                Some(Self {
                    id: NodeId::intern(id),
                    page_index: Some(page_index),
                })
            }
        }
    }
}

// ─── Components ──────────────────────────────────────────────────────────

/// One component definition from a layout page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDef {
    pub id: NodeId,

    #[serde(rename = "type")]
    pub component_type: String,

    #[serde(default, skip_serializing_if = "DataModelBindings::is_empty")]
    pub data_model_bindings: DataModelBindings,

    /// Expression or literal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<Value>,

    /// Text keys or expressions producing text keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub text_resource_bindings: BTreeMap<String, Value>,

    /// Child ids (containers only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<usize>,

    #[serde(default)]
    pub edit: GroupEdit,

    /// Per-row visibility expression of a repeating group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden_row: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,

    /// Summary target (Summary components only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_ref: Option<NodeId>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_children: Vec<String>,

    /// Every other property, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ComponentDef {
    /// Parsed child references. Malformed entries are skipped.
    pub fn child_refs(&self) -> impl Iterator<Item = ChildRef> + '_ {
        self.children.iter().filter_map(|c| ChildRef::parse(c))
    }

    pub fn has_trigger(&self, trigger: Trigger) -> bool {
        self.triggers.contains(&trigger)
    }
}

// ─── Pages ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct LayoutFile {
    data: LayoutData,
}

#[derive(Debug, Clone, Deserialize)]
struct LayoutData {
    layout: Vec<ComponentDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LayoutFileShape {
    Wrapped(LayoutFile),
    Bare(Vec<ComponentDef>),
}

/// One page of the layout, in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct PageLayout {
    pub key: String,
    pub components: Vec<ComponentDef>,
}

impl PageLayout {
    pub fn component(&self, id: NodeId) -> Option<&ComponentDef> {
        self.components.iter().find(|c| c.id == id)
    }
}

/// All pages of a layout set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayoutSet {
    pub pages: Vec<PageLayout>,
    /// Bumped by the owner whenever the layout changes; part of the
    /// hierarchy memoization key.
    pub version: u64,
}

impl LayoutSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a page from its JSON source.
    ///
    /// # Errors
    /// - The JSON does not describe a component list
    /// - A page with the same key already exists
    pub fn add_page_json(&mut self, key: &str, json: &str) -> Result<(), LayoutError> {
        let shape: LayoutFileShape =
            serde_json::from_str(json).map_err(|source| LayoutError::Json {
                page: key.to_string(),
                source,
            })?;
        let components = match shape {
            LayoutFileShape::Wrapped(file) => file.data.layout,
            LayoutFileShape::Bare(list) => list,
        };
        self.add_page(key, components)
    }

    pub fn add_page(&mut self, key: &str, components: Vec<ComponentDef>) -> Result<(), LayoutError> {
        if self.page(key).is_some() {
            return Err(LayoutError::DuplicatePage(key.to_string()));
        }
        self.pages.push(PageLayout {
            key: key.to_string(),
            components,
        });
        self.version += 1;
        Ok(())
    }

    pub fn page(&self, key: &str) -> Option<&PageLayout> {
        self.pages.iter().find(|p| p.key == key)
    }

    /// Find a component definition on any page.
    pub fn component(&self, id: NodeId) -> Option<&ComponentDef> {
        self.pages.iter().find_map(|p| p.component(id))
    }
}

/// `Settings.json` subset relevant to the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayoutSettings {
    pub pages: PageSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageSettings {
    pub order: Vec<String>,
    pub pdf_layout_name: Option<String>,
}

/// Instance metadata exposed to expressions through `instanceContext`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceContext {
    pub instance_id: Option<String>,
    pub app_id: Option<String>,
    pub instance_owner_party_id: Option<String>,
    pub instance_owner_party_type: Option<String>,
}

impl InstanceContext {
    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "instanceId" => self.instance_id.as_deref(),
            "appId" => self.app_id.as_deref(),
            "instanceOwnerPartyId" => self.instance_owner_party_id.as_deref(),
            "instanceOwnerPartyType" => self.instance_owner_party_type.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_wrapped_and_bare_pages() {
        let mut set = LayoutSet::new();
        set.add_page_json(
            "page1",
            r#"{"data": {"layout": [{"id": "name", "type": "Input",
                "dataModelBindings": {"simpleBinding": "person.name"}}]}}"#,
        )
        .unwrap();
        set.add_page_json("page2", r#"[{"id": "p", "type": "Paragraph"}]"#)
            .unwrap();

        assert_eq!(set.pages.len(), 2);
        assert_eq!(set.version, 2);
        let name = set.component(NodeId::intern("name")).unwrap();
        assert_eq!(name.data_model_bindings.simple(), Some("person.name"));
        assert!(set.add_page_json("page1", "[]").is_err());
    }

    #[test]
    fn group_fields_and_extras() {
        let def: ComponentDef = serde_json::from_str(
            r#"{"id": "g", "type": "RepeatingGroup", "children": ["0:a", "1:b", "c"],
                "maxCount": 5, "edit": {"mode": "showAll", "multiPage": true},
                "triggers": ["validateRow", "somethingNew"], "pageBreak": true}"#,
        )
        .unwrap();
        assert_eq!(def.max_count, Some(5));
        assert_eq!(def.edit.mode, EditMode::ShowAll);
        assert!(def.edit.multi_page);
        assert!(def.has_trigger(Trigger::ValidateRow));
        assert_eq!(def.triggers[1], Trigger::Other);
        assert_eq!(def.extra.get("pageBreak"), Some(&Value::Bool(true)));

        let refs: Vec<ChildRef> = def.child_refs().collect();
        assert_eq!(refs[0].page_index, Some(0));
        assert_eq!(refs[1].id, NodeId::intern("b"));
        assert_eq!(refs[2].page_index, None);
    }

    #[test]
    fn malformed_child_refs() {
        assert_eq!(ChildRef::parse("x:child"), None);
        assert_eq!(ChildRef::parse("1:"), None);
    }
}
