//! Record validation and transformation
//!
//! `Validator::validate` is a pure function of the record, the binding, the compiled
//! transformations and rules and the policy. It never fails: every raw record comes back
//! either accepted, with values in target column order, or rejected with its ordered
//! violations.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::rules::{Cell, CustomRuleRegistry, RecordView, RuleSet, RuleSpec};
use super::schema::{FieldBinding, TargetSchema};
use super::transforms::{TransformSet, TransformSpec, TransformationRegistry};
use crate::error::{self, EtlError};
use crate::types::{RawRecord, RejectedRecord, TransformedRecord, Value, Violation, ViolationKind};

/// Rule name attached to records the reader could not parse
pub const PARSE_ERROR_RULE: &str = "parse-error";

/// Whether evaluation stops at the first violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePolicy {
    #[default]
    CollectAll,
    ShortCircuit,
}

impl std::str::FromStr for RulePolicy {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "collect-all" => Ok(RulePolicy::CollectAll),
            "short-circuit" => Ok(RulePolicy::ShortCircuit),
            other => Err(EtlError::config(format!("unknown rule policy '{other}'"))),
        }
    }
}

impl std::fmt::Display for RulePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RulePolicy::CollectAll => f.write_str("collect-all"),
            RulePolicy::ShortCircuit => f.write_str("short-circuit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Accepted(TransformedRecord),
    Rejected(RejectedRecord),
}

/// Programmatic hooks that configuration refers to by name
#[derive(Debug, Default, Clone)]
pub struct Extensions {
    pub rules: CustomRuleRegistry,
    pub transformations: TransformationRegistry,
}

#[derive(Debug)]
pub struct Validator {
    schema: TargetSchema,
    transforms: TransformSet,
    rules: RuleSet,
    policy: RulePolicy,
}

impl Validator {
    /// Compile transformations, then rules, against the read schema
    ///
    /// Rules may reference derived columns. Every bad reference is a configuration error.
    pub fn compile(
        schema: TargetSchema,
        transforms: &[TransformSpec],
        rules: &[RuleSpec],
        extensions: &Extensions,
        policy: RulePolicy,
    ) -> error::Result<Self> {
        let (schema, transforms) = TransformSet::compile(transforms, schema, &extensions.transformations)?;
        let rules = RuleSet::compile(rules, &schema, &extensions.rules)?;
        Ok(Self {
            schema,
            transforms,
            rules,
            policy,
        })
    }

    /// Target schema including derived columns
    pub fn schema(&self) -> &TargetSchema {
        &self.schema
    }

    pub fn validate(&self, record: RawRecord, binding: &FieldBinding) -> Outcome {
        if let Some(reason) = record.malformed {
            return Outcome::Rejected(RejectedRecord {
                line: record.line,
                fields: record.fields,
                violations: vec![Violation {
                    rule: PARSE_ERROR_RULE.to_string(),
                    kind: ViolationKind::ParseError,
                    message: reason,
                }],
            });
        }

        let mut cells = self.cells(&record.fields, binding);
        if let Err((name, message)) = self.transforms.apply(record.line, &self.schema, &mut cells) {
            return Outcome::Rejected(RejectedRecord {
                line: record.line,
                fields: record.fields,
                violations: vec![Violation {
                    rule: format!("transform:{name}"),
                    kind: ViolationKind::Custom,
                    message,
                }],
            });
        }
        let view = RecordView::new(record.line, &self.schema, &cells);
        let mut violations = Vec::new();
        let mut type_checked = HashSet::new();

        for rule in self.rules.rules() {
            if let Err(message) = rule.evaluate(&self.schema, &view, &cells) {
                if rule.kind() == ViolationKind::TypeCheck {
                    type_checked.extend(rule.column());
                }
                violations.push(Violation {
                    rule: rule.name().to_string(),
                    kind: rule.kind(),
                    message,
                });
                if self.policy == RulePolicy::ShortCircuit {
                    break;
                }
            }
        }

        // coercion to the declared type is checked even without an explicit rule
        let stop = self.policy == RulePolicy::ShortCircuit && !violations.is_empty();
        if !stop {
            for (index, (column, cell)) in self.schema.columns().iter().zip(&cells).enumerate() {
                if type_checked.contains(&index) {
                    continue;
                }
                if let Err(message) = &cell.value {
                    violations.push(Violation {
                        rule: format!("type:{}", column.name),
                        kind: ViolationKind::TypeCheck,
                        message: format!("column '{}': {message}", column.name),
                    });
                    if self.policy == RulePolicy::ShortCircuit {
                        break;
                    }
                }
            }
        }

        if !violations.is_empty() {
            return Outcome::Rejected(RejectedRecord {
                line: record.line,
                fields: record.fields,
                violations,
            });
        }

        match cells.into_iter().map(|c| c.value).collect::<Result<Vec<Value>, String>>() {
            Ok(values) => Outcome::Accepted(TransformedRecord::new(record.line, values)),
            Err(message) => Outcome::Rejected(RejectedRecord {
                line: record.line,
                fields: record.fields,
                violations: vec![Violation {
                    rule: "type".to_string(),
                    kind: ViolationKind::TypeCheck,
                    message,
                }],
            }),
        }
    }

    /// Derived columns start out null
    fn cells(&self, fields: &[String], binding: &FieldBinding) -> Vec<Cell> {
        let read = self.schema.read_columns().len();
        self.schema
            .columns()
            .iter()
            .enumerate()
            .map(|(index, column)| {
                if index >= read {
                    return Cell::null();
                }
                match column.prepare(binding.field(fields, index)) {
                    None => Cell::null(),
                    Some(text) => {
                        let value = column.column_type.coerce(&text);
                        Cell {
                            text: Some(text),
                            value,
                        }
                    },
                }
            })
            .collect()
    }
}
