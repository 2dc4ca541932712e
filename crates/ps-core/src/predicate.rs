//! Declarative predicates and query intents
//!
//! Views never write SQL. They describe what they want as a [`QueryIntent`]
//! over a [`Predicate`], and the query engine adapter renders it for the
//! embedded engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A scalar literal used in predicates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Filter expression over dataset columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// Matches every row
    True,
    Eq { column: String, value: Value },
    In { column: String, values: Vec<Value> },
    /// Inclusive range
    Between { column: String, low: f64, high: f64 },
    Gte { column: String, value: f64 },
    Lte { column: String, value: f64 },
    NotNull { column: String },
    And { predicates: Vec<Predicate> },
    Or { predicates: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Default for Predicate {
    fn default() -> Self {
        Predicate::True
    }
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    /// `column IN (values)`; a single value collapses to `Eq`
    pub fn is_in<V: Into<Value>>(column: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        let column = column.into();
        let mut values: Vec<Value> = values.into_iter().map(Into::into).collect();
        if values.len() == 1 {
            if let Some(value) = values.pop() {
                return Predicate::Eq { column, value };
            }
        }
        Predicate::In { column, values }
    }

    pub fn between(column: impl Into<String>, low: f64, high: f64) -> Self {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        Predicate::Between {
            column: column.into(),
            low,
            high,
        }
    }

    pub fn gte(column: impl Into<String>, value: f64) -> Self {
        Predicate::Gte {
            column: column.into(),
            value,
        }
    }

    pub fn lte(column: impl Into<String>, value: f64) -> Self {
        Predicate::Lte {
            column: column.into(),
            value,
        }
    }

    pub fn not_null(column: impl Into<String>) -> Self {
        Predicate::NotNull {
            column: column.into(),
        }
    }

    /// Conjunction that drops `True` terms and flattens nested `And`s
    pub fn and(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        let mut terms = Vec::new();
        for p in predicates {
            match p {
                Predicate::True => {}
                Predicate::And { predicates } => terms.extend(predicates),
                other => terms.push(other),
            }
        }
        match terms.len() {
            0 => Predicate::True,
            1 => terms.remove(0),
            _ => Predicate::And { predicates: terms },
        }
    }

    /// Disjunction; any `True` term makes the whole thing `True`
    pub fn or(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        let mut terms = Vec::new();
        for p in predicates {
            match p {
                Predicate::True => return Predicate::True,
                Predicate::Or { predicates } => terms.extend(predicates),
                other => terms.push(other),
            }
        }
        match terms.len() {
            0 => Predicate::True,
            1 => terms.remove(0),
            _ => Predicate::Or { predicates: terms },
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not {
            predicate: Box::new(self),
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Predicate::True)
    }

    /// Column names referenced anywhere in the expression
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::True => {}
            Predicate::Eq { column, .. }
            | Predicate::In { column, .. }
            | Predicate::Between { column, .. }
            | Predicate::Gte { column, .. }
            | Predicate::Lte { column, .. }
            | Predicate::NotNull { column } => out.push(column),
            Predicate::And { predicates } | Predicate::Or { predicates } => {
                for p in predicates {
                    p.collect_columns(out);
                }
            }
            Predicate::Not { predicate } => predicate.collect_columns(out),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Row selection with optional projection, ordering, limit and sampling
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectIntent {
    /// Empty means all columns
    pub projection: Vec<String>,
    pub predicate: Predicate,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    /// Keep roughly this percentage of rows (0, 100]
    pub sample_percent: Option<f64>,
}

impl SelectIntent {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            ..Default::default()
        }
    }

    pub fn project<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.projection = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn sample(mut self, percent: f64) -> Self {
        self.sample_percent = Some(percent);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    Count,
    Min,
    Max,
    Avg,
    Sum,
}

impl AggregateFn {
    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregateFn::Count => "COUNT",
            AggregateFn::Min => "MIN",
            AggregateFn::Max => "MAX",
            AggregateFn::Avg => "AVG",
            AggregateFn::Sum => "SUM",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub func: AggregateFn,
    /// `None` only makes sense for `Count` (`COUNT(*)`)
    pub column: Option<String>,
    pub alias: String,
}

impl Aggregate {
    pub fn new(func: AggregateFn, column: impl Into<String>) -> Self {
        let column = column.into();
        let alias = format!("{}_{}", func.sql_name().to_lowercase(), column);
        Self {
            func,
            column: Some(column),
            alias,
        }
    }

    pub fn count_all() -> Self {
        Self {
            func: AggregateFn::Count,
            column: None,
            alias: "count".to_string(),
        }
    }
}

/// What a view wants from one or more datasets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryIntent {
    Select(SelectIntent),
    /// Distinct values of one column, sorted ascending
    Distinct { column: String, predicate: Predicate },
    Aggregate {
        aggregates: Vec<Aggregate>,
        group_by: Vec<String>,
        predicate: Predicate,
    },
}

impl QueryIntent {
    pub fn select(predicate: Predicate) -> Self {
        QueryIntent::Select(SelectIntent::new(predicate))
    }

    pub fn distinct(column: impl Into<String>) -> Self {
        QueryIntent::Distinct {
            column: column.into(),
            predicate: Predicate::True,
        }
    }

    pub fn predicate(&self) -> &Predicate {
        match self {
            QueryIntent::Select(s) => &s.predicate,
            QueryIntent::Distinct { predicate, .. } => predicate,
            QueryIntent::Aggregate { predicate, .. } => predicate,
        }
    }
}
