//! Descriptors supplied by the query-language layer.
//!
//! Functions arrive as opaque closures; this crate only calls them and
//! propagates whatever error they raise as a per-query error.

use super::datum::Datum;
use super::error::{Backtrace, QueryError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub type RowFn = Arc<dyn Fn(&Datum) -> Result<Datum, QueryError> + Send + Sync>;
pub type BinaryFn = Arc<dyn Fn(&Datum, &Datum) -> Result<Datum, QueryError> + Send + Sync>;

/// A compiled single-argument function.
#[derive(Clone)]
pub struct WireFunc {
    name: String,
    f: RowFn,
    backtrace: Backtrace,
}

impl WireFunc {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Datum) -> Result<Datum, QueryError> + Send + Sync + 'static,
    {
        WireFunc {
            name: name.into(),
            f: Arc::new(f),
            backtrace: Backtrace::new(),
        }
    }

    /// `row => row(field)`
    pub fn field(field: impl Into<String>) -> Self {
        let field = field.into();
        let name = format!("get_field({})", field);
        WireFunc::new(name, move |row| row.get_field(&field).cloned())
    }

    pub fn with_backtrace(mut self, backtrace: Backtrace) -> Self {
        self.backtrace = backtrace;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, row: &Datum) -> Result<Datum, QueryError> {
        (self.f)(row).map_err(|e| e.with_backtrace(self.backtrace.clone()))
    }
}

impl fmt::Debug for WireFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireFunc").field("name", &self.name).finish()
    }
}

/// A compiled two-argument reduction function.
#[derive(Clone)]
pub struct ReduceFunc {
    name: String,
    f: BinaryFn,
    backtrace: Backtrace,
}

impl ReduceFunc {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Datum, &Datum) -> Result<Datum, QueryError> + Send + Sync + 'static,
    {
        ReduceFunc {
            name: name.into(),
            f: Arc::new(f),
            backtrace: Backtrace::new(),
        }
    }

    pub fn with_backtrace(mut self, backtrace: Backtrace) -> Self {
        self.backtrace = backtrace;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, acc: &Datum, row: &Datum) -> Result<Datum, QueryError> {
        (self.f)(acc, row).map_err(|e| e.with_backtrace(self.backtrace.clone()))
    }
}

impl fmt::Debug for ReduceFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReduceFunc").field("name", &self.name).finish()
    }
}

/// Key functions of a `group` transform.
#[derive(Debug, Clone)]
pub struct GroupFunc {
    pub funcs: Vec<WireFunc>,
    /// Append the row's secondary-index value to the key.
    pub append_index: bool,
    /// An array key puts the row in one group per element.
    pub multi: bool,
}

impl GroupFunc {
    pub fn new(funcs: Vec<WireFunc>) -> Self {
        GroupFunc {
            funcs,
            append_index: false,
            multi: false,
        }
    }

    pub fn by_field(field: impl Into<String>) -> Self {
        Self::new(vec![WireFunc::field(field)])
    }

    pub fn multi(mut self) -> Self {
        self.multi = true;
        self
    }

    pub fn with_index(mut self) -> Self {
        self.append_index = true;
        self
    }
}

/// Aggregate computed per group.
#[derive(Debug, Clone)]
pub enum TerminalVariant {
    Count,
    Sum(Option<WireFunc>),
    Avg(Option<WireFunc>),
    Min(Option<WireFunc>),
    Max(Option<WireFunc>),
    Reduce(ReduceFunc),
}

impl TerminalVariant {
    pub fn name(&self) -> &'static str {
        match self {
            TerminalVariant::Count => "count",
            TerminalVariant::Sum(_) => "sum",
            TerminalVariant::Avg(_) => "avg",
            TerminalVariant::Min(_) => "min",
            TerminalVariant::Max(_) => "max",
            TerminalVariant::Reduce(_) => "reduce",
        }
    }
}

/// Requested output order of a range read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Sorting {
    #[default]
    Unordered,
    Ascending,
    Descending,
}

impl Sorting {
    /// Unordered reads are never reversed.
    pub fn reversed(&self) -> bool {
        matches!(self, Sorting::Descending)
    }

    pub fn is_ordered(&self) -> bool {
        !matches!(self, Sorting::Unordered)
    }
}

/// Apply an optional extraction function, defaulting to the row itself.
pub(crate) fn eval_opt(func: &Option<WireFunc>, row: &Datum) -> Result<Datum, QueryError> {
    match func {
        Some(f) => f.call(row),
        None => Ok(row.clone()),
    }
}
