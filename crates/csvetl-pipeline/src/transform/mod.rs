//! Transform stage: column schema, transformations, compiled rules and the record validator

pub mod rules;
pub mod schema;
pub mod transforms;
pub mod validator;

pub use rules::{Bound, CustomRule, CustomRuleRegistry, RecordView, Rule, RuleSet, RuleSpec};
pub use schema::{ColumnSpec, ColumnType, FieldBinding, TargetSchema};
pub use transforms::{
    RecordMut, TransformParams, TransformSet, TransformSpec, Transformation, TransformationRegistry,
};
pub use validator::{Extensions, Outcome, RulePolicy, Validator, PARSE_ERROR_RULE};
