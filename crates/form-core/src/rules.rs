//! Derived-field rules.
//!
//! A rule computes one data-model leaf from others. Rules run right before
//! the form data is frozen for saving, so the saved snapshot always carries
//! their outputs.

use crate::diagnostics::Diagnostics;
use crate::expr::{Expr, ExprContext, evaluate};
use crate::id::NodeId;
use crate::model::{InstanceContext, TextResources};
use crate::path::{DataPath, pick};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One derived field: `output` receives the value of `expression`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConnection {
    pub output: String,
    pub expression: Value,
}

/// Expression context over plain form data.
///
/// There are no nodes here, so `component` and `isHidden` read as absent.
pub struct DataContext<'a> {
    pub data: &'a Value,
    pub instance: Option<&'a InstanceContext>,
    pub frontend_settings: Option<&'a Map<String, Value>>,
    pub texts: Option<&'a TextResources>,
    pub language: &'a str,
}

impl<'a> DataContext<'a> {
    pub fn new(data: &'a Value) -> Self {
        Self {
            data,
            instance: None,
            frontend_settings: None,
            texts: None,
            language: "nb",
        }
    }
}

impl ExprContext for DataContext<'_> {
    fn data_model(&self, path: &str) -> Option<Value> {
        pick(self.data, path).cloned()
    }

    fn component(&self, _id: NodeId) -> Option<Value> {
        None
    }

    fn is_hidden(&self, _id: NodeId) -> Option<bool> {
        None
    }

    fn instance_context(&self, key: &str) -> Option<String> {
        self.instance?.get(key).map(str::to_string)
    }

    fn frontend_setting(&self, key: &str) -> Option<Value> {
        self.frontend_settings?.get(key).cloned()
    }

    fn language(&self) -> String {
        self.language.to_string()
    }

    fn text(&self, key: &str) -> Option<String> {
        self.texts?.get(key).cloned()
    }
}

/// Apply every rule in order, writing outputs into `data`.
///
/// Later rules see the outputs of earlier ones. A rule whose expression
/// fails or whose output path is malformed is skipped and reported once.
/// Returns the number of outputs that changed.
pub fn apply_rules(rules: &[RuleConnection], data: &mut Value, diagnostics: &Diagnostics) -> usize {
    let mut changed = 0;
    for rule in rules {
        let output = match DataPath::parse(&rule.output) {
            Ok(p) => p,
            Err(e) => {
                diagnostics.error_once(format!("Rule output skipped: {e}"));
                continue;
            }
        };

        let result = Expr::compile(&rule.expression)
            .and_then(|expr| evaluate(&expr, &DataContext::new(data)));
        let value = match result {
            Ok(v) => v,
            Err(e) => {
                diagnostics.error_once(format!(
                    "Rule for '{}' failed: {e} (expression: {})",
                    rule.output, rule.expression
                ));
                continue;
            }
        };

        if output.pick(data) == Some(&value) {
            continue;
        }
        log::trace!("rule output {} = {value}", rule.output);
        if value.is_null() {
            output.delete(data);
        } else if let Err(e) = output.set(data, value) {
            diagnostics.error_once(format!("Rule output skipped: {e}"));
            continue;
        }
        changed += 1;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::MemorySink;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn rules_chain_in_order() {
        let rules: Vec<RuleConnection> = serde_json::from_value(json!([
            {"output": "sum", "expression": ["plus", ["dataModel", "a"], ["dataModel", "b"]]},
            {"output": "label", "expression": ["concat", "Total: ", ["dataModel", "sum"]]}
        ]))
        .unwrap();
        let mut data = json!({"a": 2, "b": "3"});
        let changed = apply_rules(&rules, &mut data, &Diagnostics::default());
        assert_eq!(changed, 2);
        assert_eq!(data, json!({"a": 2, "b": "3", "sum": 5, "label": "Total: 5"}));

        // Re-running is a no-op.
        assert_eq!(apply_rules(&rules, &mut data, &Diagnostics::default()), 0);
    }

    #[test]
    fn failing_rule_is_skipped_and_reported() {
        let sink = Arc::new(MemorySink::new());
        let diag = Diagnostics::new(sink.clone());
        let rules = vec![
            RuleConnection {
                output: "x".into(),
                expression: json!(["divide", 1, 0]),
            },
            RuleConnection {
                output: "y".into(),
                expression: json!(["upperCase", "ok"]),
            },
        ];
        let mut data = json!({});
        apply_rules(&rules, &mut data, &diag);
        apply_rules(&rules, &mut data, &diag);
        assert_eq!(data, json!({"y": "OK"}));
        assert_eq!(sink.count_containing("Rule for 'x'"), 1);
    }
}
