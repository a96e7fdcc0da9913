//! The backend-neutral predicate and query model.
//!
//! A [`Query`] is an ordered list of [`Condition`]s that must all hold, an optional
//! ordering, a `skip`/`take` window and a projection. A condition is either a
//! structural [`Expr`], which adapters translate to native filter syntax through a
//! [`QueryVisitor`], or a compiled closure that can only run in-process. Every
//! structural expression can also be evaluated in-process (see [`crate::eval`]), so
//! an adapter that cannot translate part of a query falls back to filtering locally.
//!
//! # Example
//!
//! ```ignore
//! use dblayer::query::{Filter, Query, SortDirection};
//!
//! let query = Query::builder()
//!     .filter(Filter::eq("status", "active"))
//!     .matching(|order: &Order| order.lines.len() > 2)
//!     .order_by("created_at", SortDirection::Desc)
//!     .then_by("number", SortDirection::Asc)
//!     .skip(20)
//!     .take(10)
//!     .build();
//! ```

use bson::Bson;
use std::{fmt, sync::Arc};

use crate::{
    entity::{Entity, EntityExt, Record},
    error::{DataStoreError, DataStoreResult},
};

/// Pseudo-field addressing the partition key of a record.
pub const PARTITION_KEY_FIELD: &str = "PartitionKey";
/// Pseudo-field addressing the row key of a record.
pub const ROW_KEY_FIELD: &str = "RowKey";

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Sort specification: a field and a direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

/// Field comparison operators for filter expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// String or array contains value.
    Contains,
    /// String or array does not contain value.
    NotContains,
    StartsWith,
    EndsWith,
    /// Field (or any of its array items) equals any of the values.
    AnyOf,
    /// Field (or any of its array items) equals none of the values.
    NoneOf,
}

/// A structural filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// All expressions must match. An empty list matches everything.
    And(Vec<Expr>),
    /// Any expression must match. An empty list matches nothing.
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// The field exists (`true`) or is missing (`false`).
    Exists(String, bool),
    Field {
        field: String,
        op: FieldOp,
        value: Bson,
    },
}

impl Expr {
    pub fn field(field: String, op: FieldOp, value: Bson) -> Self {
        Expr::Field { field, op, value }
    }

    /// Combines this expression with another using logical AND.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut list) => {
                list.push(other);
                Expr::And(list)
            }
            _ => Expr::And(vec![self, other]),
        }
    }

    /// Combines this expression with another using logical OR.
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut list) => {
                list.push(other);
                Expr::Or(list)
            }
            _ => Expr::Or(vec![self, other]),
        }
    }

    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }
}

/// Helper for constructing filter expressions.
///
/// ```ignore
/// use dblayer::query::Filter;
///
/// let expr = Filter::partition("tenant-1").and(Filter::gt("age", 18));
/// ```
pub struct Filter;

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Eq, value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Ne, value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Gt, value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Gte, value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Lt, value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Lte, value.into())
    }

    pub fn starts_with(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::StartsWith, value.into())
    }

    pub fn ends_with(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::EndsWith, value.into())
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Contains, value.into())
    }

    pub fn not_contains(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::NotContains, value.into())
    }

    pub fn exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), true)
    }

    pub fn not_exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), false)
    }

    pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::And(exprs.into_iter().collect())
    }

    pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Or(exprs.into_iter().collect())
    }

    pub fn any_of(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::AnyOf, value.into())
    }

    pub fn none_of(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::NoneOf, value.into())
    }

    /// Matches records whose partition key equals `value`.
    pub fn partition(value: impl Into<String>) -> Expr {
        Self::eq(PARTITION_KEY_FIELD, value.into())
    }

    /// Matches records whose row key equals `value`.
    pub fn row(value: impl Into<String>) -> Expr {
        Self::eq(ROW_KEY_FIELD, value.into())
    }
}

/// Compiled in-process predicate over a full record.
pub type EvalFn = Arc<dyn Fn(&Record) -> DataStoreResult<bool> + Send + Sync>;

/// One predicate of a query.
#[derive(Clone)]
pub enum Condition {
    /// Structural form; translatable to native filters and evaluable in-process.
    Expr(Expr),
    /// Executable form; only evaluable in-process.
    Eval(EvalFn),
}

impl Condition {
    /// Wraps a typed closure. The record is deserialized into `E` before the call.
    pub fn from_fn<E, F>(predicate: F) -> Self
    where
        E: Entity,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Condition::Eval(Arc::new(move |record: &Record| {
            let entity = E::from_record(record.clone())?;
            Ok(predicate(&entity))
        }))
    }

    pub fn as_expr(&self) -> Option<&Expr> {
        match self {
            Condition::Expr(expr) => Some(expr),
            Condition::Eval(_) => None,
        }
    }
}

impl From<Expr> for Condition {
    fn from(expr: Expr) -> Self {
        Condition::Expr(expr)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Expr(expr) => f.debug_tuple("Expr").field(expr).finish(),
            Condition::Eval(_) => f.write_str("Eval(<closure>)"),
        }
    }
}

/// What an adapter returns for each matching record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Projection {
    #[default]
    Full,
    /// Keys (and tokens) only; bodies are left empty.
    KeysOnly,
}

/// A normalized query: conditions, ordering, window and projection.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// All conditions must hold. Empty means every record matches.
    pub conditions: Vec<Condition>,
    /// Primary sort first, then tie-breakers.
    pub order: Vec<Sort>,
    pub take: Option<usize>,
    pub skip: usize,
    pub projection: Projection,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> QueryBuilder {
        QueryBuilder::new()
    }

    /// A query matching every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Creates a query from a list of conditions.
    pub fn filtered(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Self {
            conditions: conditions.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Returns `true` when at least one condition has no structural form.
    pub fn has_eval_conditions(&self) -> bool {
        self.conditions
            .iter()
            .any(|condition| matches!(condition, Condition::Eval(_)))
    }

    /// Returns the structural conditions joined with AND, if there are any.
    pub fn structural_filter(&self) -> Option<Expr> {
        let mut exprs = self
            .conditions
            .iter()
            .filter_map(Condition::as_expr)
            .cloned()
            .collect::<Vec<_>>();

        match exprs.len() {
            0 => None,
            1 => exprs.pop(),
            _ => Some(Expr::And(exprs)),
        }
    }

    /// Returns a copy of this query keeping only the given conditions.
    pub fn with_conditions(&self, conditions: Vec<Condition>) -> Self {
        Self {
            conditions,
            order: self.order.clone(),
            take: self.take,
            skip: self.skip,
            projection: self.projection,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    pub fn new() -> Self {
        QueryBuilder { query: Query::default() }
    }

    /// Adds a structural condition.
    pub fn filter(mut self, filter: Expr) -> Self {
        self.query.conditions.push(Condition::Expr(filter));
        self
    }

    /// Adds an in-process condition over the typed entity.
    pub fn matching<E, F>(mut self, predicate: F) -> Self
    where
        E: Entity,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.query.conditions.push(Condition::from_fn(predicate));
        self
    }

    pub fn condition(mut self, condition: impl Into<Condition>) -> Self {
        self.query.conditions.push(condition.into());
        self
    }

    pub fn conditions(mut self, conditions: impl IntoIterator<Item = Condition>) -> Self {
        self.query.conditions.extend(conditions);
        self
    }

    /// Sets the primary ordering, replacing any previous ordering.
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.query.order = vec![Sort { field: field.into(), direction }];
        self
    }

    /// Adds a tie-breaking ordering after the existing ones.
    pub fn then_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.query.order.push(Sort { field: field.into(), direction });
        self
    }

    pub fn take(mut self, take: usize) -> Self {
        self.query.take = Some(take);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.query.skip = skip;
        self
    }

    pub fn keys_only(mut self) -> Self {
        self.query.projection = Projection::KeysOnly;
        self
    }

    pub fn build(self) -> Query {
        self.query
    }
}

/// Walks a structural expression, producing a backend-specific rendering.
pub trait QueryVisitor {
    type Output;
    type Error: Into<DataStoreError>;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error>;
    fn visit_exists(
        &mut self,
        field: &str,
        should_exist: bool,
    ) -> Result<Self::Output, Self::Error>;
    fn visit_field(
        &mut self,
        field: &str,
        op: &FieldOp,
        value: &Bson,
    ) -> Result<Self::Output, Self::Error>;

    fn visit_expr(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        match expr {
            Expr::And(exprs) => self.visit_and(exprs),
            Expr::Or(exprs) => self.visit_or(exprs),
            Expr::Not(expr) => self.visit_not(expr),
            Expr::Exists(field, should_exist) => self.visit_exists(field, *should_exist),
            Expr::Field { field, op, value } => self.visit_field(field, op, value),
        }
    }
}
