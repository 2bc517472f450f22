//! Policy model, validation and the policy registry.

pub mod definition;
pub mod predicate;
pub mod registry;
pub mod selector;
pub mod validator;

pub use definition::{
    ActionParameters, ActionType, Condition, Policy, PolicyAuditRecord, PolicyCategory,
    PolicyChange, PolicyDefinition, PolicyId,
};
pub use predicate::{Attribute, Operator, Predicate, PredicateContext, Value};
pub use registry::PolicyRegistry;
pub use selector::{CompiledSelector, ObjectPattern, SelectorCache, TargetSelector};
pub use validator::PolicyValidator;
