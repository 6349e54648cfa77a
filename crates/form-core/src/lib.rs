pub mod diagnostics;
pub mod diff;
pub mod expr;
pub mod hierarchy;
pub mod id;
pub mod lint;
pub mod model;
pub mod path;
pub mod registry;
pub mod rules;
pub mod validation;

pub use diagnostics::{Diagnostics, DiagnosticsSink, Level, LogSink, MemorySink};
pub use diff::{DiffMap, diff_data, diff_models};
pub use expr::{Expr, ExprContext, ExprError, ExprType};
pub use hierarchy::{
    GenerationKey, GeneratorInput, GeneratorOptions, GroupRow, GroupState, HierarchyGenerator,
    LayoutNode, LayoutPage, LayoutPages, PageNavigation,
};
pub use id::NodeId;
pub use lint::{LintDiagnostic, LintSeverity, lint_layout};
pub use model::*;
pub use path::{DataPath, PathError};
pub use registry::{Category, ComponentCapabilities, ComponentRegistry, SummaryKind};
pub use rules::RuleConnection;
pub use validation::{ComponentValidation, ValidationCategory, ValidationSeverity};

// Re-export petgraph types so downstream crates don't need a direct dependency
pub use petgraph::graph::NodeIndex;
