//! Validation rules
//!
//! `RuleSpec` is the declarative form read from configuration. `RuleSet::compile` resolves
//! each rule spec against the target schema once per run, so a bad column reference, an invalid
//! pattern or a range bound on a non-comparable column surfaces as a single configuration
//! error before any file is claimed.

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::schema::{ColumnType, TargetSchema};
use crate::error::{EtlError, Result};
use crate::types::{Value, ViolationKind};

/// Inclusive range bound as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bound {
    Number(f64),
    Text(String),
}

/// Declarative rule, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleSpec {
    NotNull {
        column: String,
        #[serde(default)]
        name: Option<String>,
    },
    TypeCheck {
        column: String,
        /// Defaults to the column's declared type
        #[serde(rename = "type", default)]
        expected: Option<ColumnType>,
        #[serde(default)]
        name: Option<String>,
    },
    Range {
        column: String,
        #[serde(default)]
        min: Option<Bound>,
        #[serde(default)]
        max: Option<Bound>,
        #[serde(default)]
        name: Option<String>,
    },
    Regex {
        column: String,
        pattern: String,
        #[serde(default)]
        name: Option<String>,
    },
    OneOf {
        column: String,
        values: Vec<String>,
        #[serde(default)]
        name: Option<String>,
    },
    /// Predicate registered in a `CustomRuleRegistry`
    Custom { name: String },
}

impl RuleSpec {
    fn kind_name(&self) -> &'static str {
        match self {
            RuleSpec::NotNull { .. } => "not_null",
            RuleSpec::TypeCheck { .. } => "type_check",
            RuleSpec::Range { .. } => "range",
            RuleSpec::Regex { .. } => "regex",
            RuleSpec::OneOf { .. } => "one_of",
            RuleSpec::Custom { .. } => "custom",
        }
    }

    fn label(&self) -> String {
        match self {
            RuleSpec::NotNull { column, name }
            | RuleSpec::TypeCheck { column, name, .. }
            | RuleSpec::Range { column, name, .. }
            | RuleSpec::Regex { column, name, .. }
            | RuleSpec::OneOf { column, name, .. } => name
                .clone()
                .unwrap_or_else(|| format!("{}:{column}", self.kind_name())),
            RuleSpec::Custom { name } => name.clone(),
        }
    }
}

/// A column value as seen by rules: the standardised text and its coercion result
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Cell {
    pub text: Option<String>,
    pub value: std::result::Result<Value, String>,
}

impl Cell {
    pub fn null() -> Self {
        Self {
            text: None,
            value: Ok(Value::Null),
        }
    }
}

/// Read-only view of one record handed to custom rules
pub struct RecordView<'a> {
    line: u64,
    schema: &'a TargetSchema,
    cells: &'a [Cell],
}

impl<'a> RecordView<'a> {
    pub(crate) fn new(line: u64, schema: &'a TargetSchema, cells: &'a [Cell]) -> Self {
        Self {
            line,
            schema,
            cells,
        }
    }

    pub fn line(&self) -> u64 {
        self.line
    }

    /// Coerced value; `None` for unknown columns and values that failed coercion
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        let cell = self.cells.get(self.schema.index_of(column)?)?;
        cell.value.as_ref().ok()
    }

    /// Standardised text before coercion; `None` when null or unknown
    pub fn text(&self, column: &str) -> Option<&'a str> {
        let cell = self.cells.get(self.schema.index_of(column)?)?;
        cell.text.as_deref()
    }
}

/// Programmatic predicate over a whole record
pub trait CustomRule: Send + Sync {
    /// `Err` carries the violation message
    fn check(&self, record: &RecordView<'_>) -> std::result::Result<(), String>;
}

impl<F> CustomRule for F
where
    F: Fn(&RecordView<'_>) -> std::result::Result<(), String> + Send + Sync,
{
    fn check(&self, record: &RecordView<'_>) -> std::result::Result<(), String> {
        self(record)
    }
}

/// Named custom rules available to `custom { name }` specs
#[derive(Default, Clone)]
pub struct CustomRuleRegistry {
    rules: HashMap<String, Arc<dyn CustomRule>>,
}

impl CustomRuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, rule: impl CustomRule + 'static) {
        self.rules.insert(name.into(), Arc::new(rule));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CustomRule>> {
        self.rules.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.rules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for CustomRuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomRuleRegistry")
            .field("rules", &self.names())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Comparable {
    Number(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl Comparable {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Some(Comparable::Number(*i as f64)),
            Value::Float(f) => Some(Comparable::Number(*f)),
            Value::Date(d) => Some(Comparable::Date(*d)),
            Value::DateTime(dt) => Some(Comparable::DateTime(*dt)),
            _ => None,
        }
    }

    fn from_bound(bound: &Bound, column_type: ColumnType, rule: &str) -> Result<Self> {
        let invalid = || EtlError::config(format!("rule '{rule}': bound {bound:?} is not a valid {column_type}"));
        match (column_type, bound) {
            (ColumnType::Integer | ColumnType::Float, Bound::Number(n)) => Ok(Comparable::Number(*n)),
            (ColumnType::Integer | ColumnType::Float, Bound::Text(s)) => {
                s.trim().parse().map(Comparable::Number).map_err(|_| invalid())
            },
            (ColumnType::Date | ColumnType::DateTime, Bound::Text(s)) => {
                match column_type.coerce(s.trim()).map_err(|_| invalid())? {
                    Value::Date(d) => Ok(Comparable::Date(d)),
                    Value::DateTime(dt) => Ok(Comparable::DateTime(dt)),
                    _ => Err(invalid()),
                }
            },
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Comparable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparable::Number(n) => write!(f, "{n}"),
            Comparable::Date(d) => write!(f, "{d}"),
            Comparable::DateTime(dt) => write!(f, "{dt}"),
        }
    }
}

enum Check {
    NotNull,
    TypeCheck(ColumnType),
    Range {
        min: Option<Comparable>,
        max: Option<Comparable>,
    },
    Pattern(Regex),
    OneOf(Vec<String>),
    Custom(Arc<dyn CustomRule>),
}

/// Compiled rule bound to a column position
pub struct Rule {
    name: String,
    kind: ViolationKind,
    column: Option<usize>,
    check: Check,
}

impl Rule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ViolationKind {
        self.kind
    }

    /// Column the rule is bound to; `None` for whole-record custom rules
    pub fn column(&self) -> Option<usize> {
        self.column
    }

    /// Evaluate against a record; `Err` carries the violation message
    pub(crate) fn evaluate(
        &self,
        schema: &TargetSchema,
        view: &RecordView<'_>,
        cells: &[Cell],
    ) -> std::result::Result<(), String> {
        let Some(index) = self.column else {
            return match &self.check {
                Check::Custom(rule) => rule.check(view),
                _ => Ok(()),
            };
        };
        let (Some(column), Some(cell)) = (schema.columns().get(index), cells.get(index)) else {
            return Err(format!("rule '{}' is bound to column {index} outside the record", self.name));
        };

        match &self.check {
            Check::NotNull => match cell.text {
                None => Err(format!("column '{}' is null", column.name)),
                Some(_) => Ok(()),
            },
            Check::TypeCheck(expected) => {
                let Some(text) = cell.text.as_deref() else {
                    return Ok(());
                };
                if *expected == column.column_type {
                    cell.value.as_ref().map(|_| ())
                        .map_err(|e| format!("column '{}': {e}", column.name))
                } else {
                    expected
                        .coerce(text)
                        .map(|_| ())
                        .map_err(|e| format!("column '{}': {e}", column.name))
                }
            },
            Check::Range { min, max } => {
                let Some(value) = cell.value.as_ref().ok().and_then(Comparable::of) else {
                    return Ok(());
                };
                if let Some(min) = min {
                    if value < *min {
                        return Err(format!("column '{}' = {value} is below minimum {min}", column.name));
                    }
                }
                if let Some(max) = max {
                    if value > *max {
                        return Err(format!("column '{}' = {value} is above maximum {max}", column.name));
                    }
                }
                Ok(())
            },
            Check::Pattern(regex) => match cell.text.as_deref() {
                Some(text) if !regex.is_match(text) => Err(format!(
                    "column '{}' value '{text}' does not match pattern '{}'",
                    column.name,
                    regex.as_str()
                )),
                _ => Ok(()),
            },
            Check::OneOf(values) => match cell.text.as_deref() {
                Some(text) if !values.iter().any(|v| v == text) => Err(format!(
                    "column '{}' value '{text}' is not one of [{}]",
                    column.name,
                    values.join(", ")
                )),
                _ => Ok(()),
            },
            Check::Custom(rule) => rule.check(view),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("column", &self.column)
            .finish()
    }
}

/// Ordered, compiled rules for one target schema
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn compile(
        specs: &[RuleSpec],
        schema: &TargetSchema,
        registry: &CustomRuleRegistry,
    ) -> Result<Self> {
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            rules.push(compile_rule(spec, schema, registry)?);
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn compile_rule(spec: &RuleSpec, schema: &TargetSchema, registry: &CustomRuleRegistry) -> Result<Rule> {
    let name = spec.label();
    let resolve = |column: &str| {
        schema
            .index_of(column)
            .ok_or_else(|| EtlError::config(format!("rule '{name}' references unknown column '{column}'")))
    };

    let (kind, column, check) = match spec {
        RuleSpec::NotNull { column, .. } => (ViolationKind::NotNull, Some(resolve(column)?), Check::NotNull),
        RuleSpec::TypeCheck {
            column, expected, ..
        } => {
            let index = resolve(column)?;
            let expected = expected.unwrap_or(schema.columns()[index].column_type);
            (ViolationKind::TypeCheck, Some(index), Check::TypeCheck(expected))
        },
        RuleSpec::Range {
            column, min, max, ..
        } => {
            let index = resolve(column)?;
            let column_type = schema.columns()[index].column_type;
            if !column_type.is_comparable() {
                return Err(EtlError::config(format!(
                    "rule '{name}': range needs a numeric or date column, '{column}' is {column_type}"
                )));
            }
            if min.is_none() && max.is_none() {
                return Err(EtlError::config(format!("rule '{name}': range needs min or max")));
            }
            let min = min
                .as_ref()
                .map(|b| Comparable::from_bound(b, column_type, &name))
                .transpose()?;
            let max = max
                .as_ref()
                .map(|b| Comparable::from_bound(b, column_type, &name))
                .transpose()?;
            if let (Some(lo), Some(hi)) = (min, max) {
                if lo > hi {
                    return Err(EtlError::config(format!("rule '{name}': min {lo} exceeds max {hi}")));
                }
            }
            (ViolationKind::RangeCheck, Some(index), Check::Range { min, max })
        },
        RuleSpec::Regex {
            column, pattern, ..
        } => {
            let index = resolve(column)?;
            let regex = Regex::new(pattern)
                .map_err(|e| EtlError::config(format!("rule '{name}': invalid pattern: {e}")))?;
            (ViolationKind::Custom, Some(index), Check::Pattern(regex))
        },
        RuleSpec::OneOf { column, values, .. } => {
            if values.is_empty() {
                return Err(EtlError::config(format!("rule '{name}': one_of needs values")));
            }
            (ViolationKind::Custom, Some(resolve(column)?), Check::OneOf(values.clone()))
        },
        RuleSpec::Custom { name: rule_name } => {
            let rule = registry.get(rule_name).ok_or_else(|| {
                EtlError::config(format!("unknown custom rule '{rule_name}'"))
            })?;
            (ViolationKind::Custom, None, Check::Custom(rule))
        },
    };

    Ok(Rule {
        name,
        kind,
        column,
        check,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::transform::schema::ColumnSpec;

    fn schema() -> TargetSchema {
        TargetSchema::new(vec![
            ColumnSpec::new("id", ColumnType::Integer),
            ColumnSpec::new("amt", ColumnType::Float),
            ColumnSpec::new("note", ColumnType::Text),
            ColumnSpec::new("day", ColumnType::Date),
        ])
        .unwrap()
    }

    #[test]
    fn test_rule_specs_deserialize_from_yaml() {
        let yaml = r#"
- kind: not_null
  column: id
- kind: range
  column: amt
  min: 0
- kind: type_check
  column: amt
  type: number
- kind: one_of
  column: note
  values: [a, b]
  name: note-values
- kind: custom
  name: balanced
"#;
        let specs: Vec<RuleSpec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(specs.len(), 5);
        assert_eq!(specs[0].label(), "not_null:id");
        assert_eq!(
            specs[1],
            RuleSpec::Range {
                column: "amt".into(),
                min: Some(Bound::Number(0.0)),
                max: None,
                name: None
            }
        );
        assert_eq!(specs[3].label(), "note-values");
        assert_eq!(specs[4].label(), "balanced");
    }

    #[test]
    fn test_range_on_text_column_is_configuration_error() {
        let specs = vec![RuleSpec::Range {
            column: "note".into(),
            min: Some(Bound::Number(1.0)),
            max: None,
            name: None,
        }];
        let err = RuleSet::compile(&specs, &schema(), &CustomRuleRegistry::new()).unwrap_err();
        assert!(matches!(err, EtlError::Configuration(ref m) if m.contains("range")));
    }

    #[test]
    fn test_date_range_bounds_compile() {
        let specs = vec![RuleSpec::Range {
            column: "day".into(),
            min: Some(Bound::Text("2024-01-01".into())),
            max: Some(Bound::Text("2024-12-31".into())),
            name: None,
        }];
        let rules = RuleSet::compile(&specs, &schema(), &CustomRuleRegistry::new()).unwrap();
        assert_eq!(rules.rules()[0].kind(), ViolationKind::RangeCheck);

        let bad = vec![RuleSpec::Range {
            column: "day".into(),
            min: Some(Bound::Number(3.0)),
            max: None,
            name: None,
        }];
        assert!(RuleSet::compile(&bad, &schema(), &CustomRuleRegistry::new()).is_err());
    }

    #[test]
    fn test_unknown_column_pattern_and_custom_are_configuration_errors() {
        let registry = CustomRuleRegistry::new();
        let unknown = vec![RuleSpec::NotNull {
            column: "missing".into(),
            name: None,
        }];
        assert!(RuleSet::compile(&unknown, &schema(), &registry).is_err());

        let pattern = vec![RuleSpec::Regex {
            column: "note".into(),
            pattern: "([".into(),
            name: None,
        }];
        assert!(RuleSet::compile(&pattern, &schema(), &registry).is_err());

        let custom = vec![RuleSpec::Custom {
            name: "nope".into(),
        }];
        assert!(RuleSet::compile(&custom, &schema(), &registry).is_err());
    }

    #[test]
    fn test_rule_outside_record_is_violation_not_panic() {
        let specs = vec![RuleSpec::NotNull {
            column: "day".into(),
            name: None,
        }];
        let rules = RuleSet::compile(&specs, &schema(), &CustomRuleRegistry::new()).unwrap();

        let narrow = TargetSchema::new(vec![ColumnSpec::new("id", ColumnType::Integer)]).unwrap();
        let cells = vec![Cell::null()];
        let view = RecordView::new(1, &narrow, &cells);
        let err = rules.rules()[0].evaluate(&narrow, &view, &cells).unwrap_err();
        assert!(err.contains("outside the record"));
    }

    #[test]
    fn test_registry_accepts_closures() {
        let mut registry = CustomRuleRegistry::new();
        registry.register("positive-id", |view: &RecordView<'_>| match view.get("id") {
            Some(Value::Integer(i)) if *i > 0 => Ok(()),
            _ => Err("id must be positive".to_string()),
        });
        assert_eq!(registry.names(), vec!["positive-id"]);

        let specs = vec![RuleSpec::Custom {
            name: "positive-id".into(),
        }];
        let rules = RuleSet::compile(&specs, &schema(), &registry).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.rules()[0].name(), "positive-id");
    }
}
