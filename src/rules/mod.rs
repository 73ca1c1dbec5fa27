//! Rule definition, matching, and selection.

pub mod compiler;
pub mod matcher;
pub mod model;
pub mod selector;

pub use compiler::RuleCompiler;
pub use matcher::{Candidate, Matcher};
pub use model::{Action, Condition, MatchMode, Pattern, Rule};
pub use selector::{SelectionDecision, Selector};
