//! Rule model and loading
//!
//! [`model`] defines the rule record shape shared by the loader and the
//! offline CRS converter; [`loader`] reads rule-definition directories
//! into an atomically swappable [`model::RuleSet`].

mod loader;
mod model;

pub use loader::{RuleLoader, SharedRuleSet};
pub use model::{Rule, RuleSet, RuleSpec, Severity, Transform};
