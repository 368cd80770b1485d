mod conditions;
mod context;
mod logic;
mod vars;

pub use conditions::{evaluate_conditions, sort_conditions, FieldCondition};
pub use context::assemble_context;
pub use logic::{referenced_paths, truthy, EvalInput, LogicError, OperatorTable};
pub use vars::{
    check_schema_change, resolve_variable, ScopeType, VariableSchema, VariableType,
};
