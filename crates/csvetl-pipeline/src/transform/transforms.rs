//! Record transformations
//!
//! Transformations run after coercion and before any rule, in declaration order. They may
//! rewrite read columns and fill derived columns, which are appended to the target schema
//! when the set is compiled. A transformation that fails rejects the record; rules are not
//! evaluated for it.

use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use super::rules::Cell;
use super::schema::{ColumnSpec, ColumnType, TargetSchema};
use crate::error::{EtlError, Result};
use crate::types::Value;

/// Free-form parameters handed to a custom transformation
pub type TransformParams = BTreeMap<String, serde_json::Value>;

const DATE_PARTS: [&str; 5] = ["year", "month", "day", "dayofweek", "quarter"];

/// Declarative transformation, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformSpec {
    /// Split a date or datetime column into `<prefix>_year`, `_month`, `_day`,
    /// `_dayofweek` (Monday is 0) and `_quarter` integer columns
    DateParts {
        column: String,
        /// Defaults to the source column name
        #[serde(default)]
        prefix: Option<String>,
    },
    /// Transformation registered in a `TransformationRegistry`
    Custom {
        name: String,
        #[serde(default)]
        params: TransformParams,
        /// Columns the transformation fills in addition to the read ones
        #[serde(default)]
        columns: Vec<ColumnSpec>,
    },
}

impl TransformSpec {
    fn label(&self) -> String {
        match self {
            TransformSpec::DateParts { column, .. } => format!("date_parts:{column}"),
            TransformSpec::Custom { name, .. } => name.clone(),
        }
    }
}

/// Mutable view of one record handed to transformations
pub struct RecordMut<'a> {
    line: u64,
    schema: &'a TargetSchema,
    cells: &'a mut [Cell],
}

impl<'a> RecordMut<'a> {
    pub(crate) fn new(line: u64, schema: &'a TargetSchema, cells: &'a mut [Cell]) -> Self {
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
    pub fn get(&self, column: &str) -> Option<&Value> {
        let cell = self.cells.get(self.schema.index_of(column)?)?;
        cell.value.as_ref().ok()
    }

    /// Standardised text; `None` when null or unknown
    pub fn text(&self, column: &str) -> Option<&str> {
        let cell = self.cells.get(self.schema.index_of(column)?)?;
        cell.text.as_deref()
    }

    /// Store a value, which must be null or match the column's declared type
    pub fn set(&mut self, column: &str, value: Value) -> std::result::Result<(), String> {
        let (index, column_type) = self.resolve(column)?;
        if !fits(&value, column_type) {
            return Err(format!("value {value:?} does not fit {column_type} column '{column}'"));
        }
        self.cells[index] = Cell {
            text: render(&value),
            value: Ok(value),
        };
        Ok(())
    }

    /// Replace the text of a column and coerce it again; `None` stores null
    pub fn set_text(&mut self, column: &str, text: Option<String>) -> std::result::Result<(), String> {
        let (index, column_type) = self.resolve(column)?;
        self.cells[index] = match text {
            None => Cell::null(),
            Some(text) => Cell {
                value: column_type.coerce(&text),
                text: Some(text),
            },
        };
        Ok(())
    }

    fn resolve(&self, column: &str) -> std::result::Result<(usize, ColumnType), String> {
        self.schema
            .index_of(column)
            .filter(|&index| index < self.cells.len())
            .map(|index| (index, self.schema.columns()[index].column_type))
            .ok_or_else(|| format!("unknown column '{column}'"))
    }
}

fn fits(value: &Value, column_type: ColumnType) -> bool {
    matches!(
        (value, column_type),
        (Value::Null, _)
            | (Value::Text(_), ColumnType::Text)
            | (Value::Integer(_), ColumnType::Integer)
            | (Value::Float(_), ColumnType::Float)
            | (Value::Boolean(_), ColumnType::Boolean)
            | (Value::Date(_), ColumnType::Date)
            | (Value::DateTime(_), ColumnType::DateTime)
    )
}

fn render(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Text(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        Value::DateTime(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
    }
}

/// Programmatic rewrite of one record
pub trait Transformation: Send + Sync {
    /// `Err` carries the rejection message
    fn apply(&self, record: &mut RecordMut<'_>, params: &TransformParams) -> std::result::Result<(), String>;
}

impl<F> Transformation for F
where
    F: Fn(&mut RecordMut<'_>, &TransformParams) -> std::result::Result<(), String> + Send + Sync,
{
    fn apply(&self, record: &mut RecordMut<'_>, params: &TransformParams) -> std::result::Result<(), String> {
        self(record, params)
    }
}

/// Named transformations available to `custom { name }` specs
#[derive(Default, Clone)]
pub struct TransformationRegistry {
    transformations: HashMap<String, Arc<dyn Transformation>>,
}

impl TransformationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, transformation: impl Transformation + 'static) {
        self.transformations.insert(name.into(), Arc::new(transformation));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transformation>> {
        self.transformations.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.transformations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for TransformationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformationRegistry")
            .field("transformations", &self.names())
            .finish()
    }
}

enum Step {
    DateParts { source: usize, targets: [usize; 5] },
    Custom {
        transformation: Arc<dyn Transformation>,
        params: TransformParams,
    },
}

struct CompiledTransform {
    name: String,
    step: Step,
}

/// Ordered, compiled transformations for one target schema
#[derive(Default)]
pub struct TransformSet {
    steps: Vec<CompiledTransform>,
}

impl TransformSet {
    /// Compile specs against the read schema; returns the schema extended with every
    /// derived column
    pub fn compile(
        specs: &[TransformSpec],
        schema: TargetSchema,
        registry: &TransformationRegistry,
    ) -> Result<(TargetSchema, Self)> {
        let mut schema = schema;
        let mut steps = Vec::with_capacity(specs.len());
        for spec in specs {
            let name = spec.label();
            let step = match spec {
                TransformSpec::DateParts { column, prefix } => {
                    let source = schema.index_of(column).ok_or_else(|| {
                        EtlError::config(format!("transform '{name}' references unknown column '{column}'"))
                    })?;
                    let source_type = schema.columns()[source].column_type;
                    if !matches!(source_type, ColumnType::Date | ColumnType::DateTime) {
                        return Err(EtlError::config(format!(
                            "transform '{name}': '{column}' is {source_type}, date parts need a date column"
                        )));
                    }
                    let prefix = prefix.as_deref().unwrap_or(column.as_str());
                    let derived = DATE_PARTS
                        .iter()
                        .map(|part| ColumnSpec::new(format!("{prefix}_{part}"), ColumnType::Integer))
                        .collect();
                    let first = schema.columns().len();
                    schema = schema.with_derived(derived)?;
                    Step::DateParts {
                        source,
                        targets: [first, first + 1, first + 2, first + 3, first + 4],
                    }
                },
                TransformSpec::Custom {
                    name: key,
                    params,
                    columns,
                } => {
                    let transformation = registry
                        .get(key)
                        .ok_or_else(|| EtlError::config(format!("unknown transformation '{key}'")))?;
                    schema = schema.with_derived(columns.clone())?;
                    Step::Custom {
                        transformation,
                        params: params.clone(),
                    }
                },
            };
            steps.push(CompiledTransform { name, step });
        }
        Ok((schema, Self { steps }))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order; `Err` names the failing transformation and its message
    pub(crate) fn apply(
        &self,
        line: u64,
        schema: &TargetSchema,
        cells: &mut [Cell],
    ) -> std::result::Result<(), (String, String)> {
        for transform in &self.steps {
            match &transform.step {
                Step::DateParts { source, targets } => date_parts(cells, *source, targets),
                Step::Custom {
                    transformation,
                    params,
                } => {
                    let mut record = RecordMut::new(line, schema, cells);
                    transformation
                        .apply(&mut record, params)
                        .map_err(|message| (transform.name.clone(), message))?;
                },
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TransformSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.steps.iter().map(|t| t.name.as_str()).collect();
        f.debug_struct("TransformSet").field("steps", &names).finish()
    }
}

/// Null or uncoercible sources leave every part null
fn date_parts(cells: &mut [Cell], source: usize, targets: &[usize; 5]) {
    let date = match cells.get(source).map(|c| &c.value) {
        Some(Ok(Value::Date(d))) => Some(*d),
        Some(Ok(Value::DateTime(dt))) => Some(dt.date()),
        _ => None,
    };
    let parts = date.map(|d| {
        [
            i64::from(d.year()),
            i64::from(d.month()),
            i64::from(d.day()),
            i64::from(d.weekday().num_days_from_monday()),
            i64::from(d.month0() / 3 + 1),
        ]
    });
    for (slot, &target) in targets.iter().enumerate() {
        if let Some(cell) = cells.get_mut(target) {
            *cell = match parts {
                Some(parts) => Cell {
                    text: Some(parts[slot].to_string()),
                    value: Ok(Value::Integer(parts[slot])),
                },
                None => Cell::null(),
            };
        }
    }
}
