//! In-process evaluation of queries over records.
//!
//! Adapters without a native rendering for some predicate run it here: ordered
//! stores feed their scan through [`run_query`], remote stores pass their natively
//! filtered stream through [`refine_stream`] for the leftover conditions.

use bson::{Bson, datetime::DateTime};
use futures::{StreamExt, TryStreamExt, future, stream};
use std::{borrow::Cow, cmp::Ordering, collections::HashMap};

use crate::{
    backend::RecordStream,
    entity::Record,
    error::{DataStoreError, DataStoreResult},
    query::{
        Condition, Expr, FieldOp, PARTITION_KEY_FIELD, Projection, Query, QueryVisitor,
        ROW_KEY_FIELD, Sort, SortDirection,
    },
};

/// Type-erased, comparable view of a BSON value. Integers of either width compare
/// exactly; they are widened to `f64` only against a double.
#[derive(Debug)]
enum Comparable<'a> {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    DateTime(DateTime),
    String(&'a str),
    Array(Vec<Comparable<'a>>),
    Map(HashMap<&'a str, Comparable<'a>>),
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Int(i64::from(*value)),
            Bson::Int64(value) => Comparable::Int(*value),
            Bson::Double(value) => Comparable::Double(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::Array(items) => Comparable::Array(items.iter().map(Comparable::from).collect()),
            Bson::Document(doc) => Comparable::Map(
                doc.iter()
                    .map(|(k, v)| (k.as_str(), Comparable::from(v)))
                    .collect(),
            ),
            _ => Comparable::Null,
        }
    }
}

impl Comparable<'_> {
    fn rank(&self) -> u8 {
        match self {
            Comparable::Null => 0,
            Comparable::Bool(_) => 1,
            Comparable::Int(_) | Comparable::Double(_) => 2,
            Comparable::String(_) => 3,
            Comparable::DateTime(_) => 4,
            Comparable::Array(_) => 5,
            Comparable::Map(_) => 6,
        }
    }

    fn contains(&self, value: &Comparable<'_>) -> bool {
        match (self, value) {
            (Comparable::Array(items), value) => items.iter().any(|item| item == value),
            (Comparable::String(left), Comparable::String(right)) => left.contains(right),
            _ => false,
        }
    }

    /// `self` is the stored value, `candidates` a single value or an array of them.
    fn any_of(&self, candidates: &Comparable<'_>) -> bool {
        match (self, candidates) {
            (Comparable::Array(items), Comparable::Array(values)) => {
                values.iter().any(|value| items.iter().any(|item| item == value))
            }
            (Comparable::Array(items), single) => items.iter().any(|item| item == single),
            (single, Comparable::Array(values)) => values.iter().any(|value| value == single),
            (left, right) => left == right,
        }
    }
}

impl PartialEq for Comparable<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Int(a), Comparable::Int(b)) => a == b,
            (Comparable::Double(a), Comparable::Double(b)) => a == b,
            (Comparable::Int(a), Comparable::Double(b)) | (Comparable::Double(b), Comparable::Int(a)) => {
                compare_int_double(*a, *b) == Some(Ordering::Equal)
            }
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::Array(a), Comparable::Array(b)) => a == b,
            (Comparable::Map(a), Comparable::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialOrd for Comparable<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Int(a), Comparable::Int(b)) => a.partial_cmp(b),
            (Comparable::Double(a), Comparable::Double(b)) => a.partial_cmp(b),
            (Comparable::Int(a), Comparable::Double(b)) => compare_int_double(*a, *b),
            (Comparable::Double(a), Comparable::Int(b)) => {
                compare_int_double(*b, *a).map(Ordering::reverse)
            }
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// Orders an integer against a double. Integral doubles inside the `i64` range
/// compare as integers, so precision is not lost above 2^53.
fn compare_int_double(int: i64, double: f64) -> Option<Ordering> {
    if double.fract() == 0.0 && double >= i64::MIN as f64 && double < i64::MAX as f64 {
        return Some(int.cmp(&(double as i64)));
    }
    (int as f64).partial_cmp(&double)
}

/// Resolves `field` on a record. The key pseudo-fields resolve to the record key;
/// dotted paths descend into embedded documents.
pub fn field_value<'a>(record: &'a Record, field: &str) -> Option<Cow<'a, Bson>> {
    match field {
        PARTITION_KEY_FIELD => Some(Cow::Owned(Bson::String(record.key.partition_key.clone()))),
        ROW_KEY_FIELD => Some(Cow::Owned(Bson::String(record.key.row_key.clone()))),
        _ => {
            if let Some(value) = record.body.get(field) {
                return Some(Cow::Borrowed(value));
            }

            let mut parts = field.split('.');
            let mut current = record.body.get(parts.next()?)?;
            for part in parts {
                current = current.as_document()?.get(part)?;
            }

            Some(Cow::Borrowed(current))
        }
    }
}

/// Evaluates structural expressions against one record.
pub struct RecordEvaluator<'a> {
    record: &'a Record,
}

impl<'a> RecordEvaluator<'a> {
    pub fn new(record: &'a Record) -> Self {
        Self { record }
    }

    pub fn evaluate(&mut self, expr: &Expr) -> DataStoreResult<bool> {
        self.visit_expr(expr)
    }
}

impl QueryVisitor for RecordEvaluator<'_> {
    type Output = bool;
    type Error = DataStoreError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if !self.visit_expr(expr)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if self.visit_expr(expr)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(!self.visit_expr(expr)?)
    }

    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Result<Self::Output, Self::Error> {
        Ok(field_value(self.record, field).is_some() == should_exist)
    }

    fn visit_field(
        &mut self,
        field: &str,
        op: &FieldOp,
        value: &Bson,
    ) -> Result<Self::Output, Self::Error> {
        let stored = field_value(self.record, field);
        let right = Comparable::from(value);
        let left = match &stored {
            Some(stored) => Comparable::from(&**stored),
            // A missing field reads as null for equality and membership.
            None => match op {
                FieldOp::Eq | FieldOp::Ne | FieldOp::AnyOf | FieldOp::NoneOf => Comparable::Null,
                FieldOp::NotContains => return Ok(true),
                _ => return Ok(false),
            },
        };

        Ok(match op {
            FieldOp::Eq => left == right,
            FieldOp::Ne => left != right,
            FieldOp::Gt | FieldOp::Gte | FieldOp::Lt | FieldOp::Lte => {
                match left.partial_cmp(&right) {
                    Some(ordering) => match op {
                        FieldOp::Gt => ordering == Ordering::Greater,
                        FieldOp::Gte => ordering != Ordering::Less,
                        FieldOp::Lt => ordering == Ordering::Less,
                        _ => ordering != Ordering::Greater,
                    },
                    None => false,
                }
            }
            FieldOp::Contains => left.contains(&right),
            FieldOp::NotContains => !left.contains(&right),
            FieldOp::StartsWith => match (&left, &right) {
                (Comparable::String(l), Comparable::String(r)) => l.starts_with(r),
                _ => false,
            },
            FieldOp::EndsWith => match (&left, &right) {
                (Comparable::String(l), Comparable::String(r)) => l.ends_with(r),
                _ => false,
            },
            FieldOp::AnyOf => left.any_of(&right),
            FieldOp::NoneOf => !left.any_of(&right),
        })
    }
}

/// Evaluates one condition against a record.
pub fn matches(condition: &Condition, record: &Record) -> DataStoreResult<bool> {
    match condition {
        Condition::Expr(expr) => RecordEvaluator::new(record).evaluate(expr),
        Condition::Eval(predicate) => predicate(record),
    }
}

/// Returns `true` when every condition holds. An empty list always holds.
pub fn matches_all(conditions: &[Condition], record: &Record) -> DataStoreResult<bool> {
    for condition in conditions {
        if !matches(condition, record)? {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Total order over two optional field values: missing and null first, then by type.
pub fn compare_values(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    let a = a.map(Comparable::from).unwrap_or(Comparable::Null);
    let b = b.map(Comparable::from).unwrap_or(Comparable::Null);

    a.rank()
        .cmp(&b.rank())
        .then_with(|| a.partial_cmp(&b).unwrap_or(Ordering::Equal))
}

/// Stable sort by the given keys; ties keep their incoming order.
pub fn sort_records(records: &mut [Record], order: &[Sort]) {
    if order.is_empty() {
        return;
    }

    records.sort_by(|a, b| {
        order.iter().fold(Ordering::Equal, |acc, sort| {
            acc.then_with(|| {
                let left = field_value(a, &sort.field);
                let right = field_value(b, &sort.field);
                let ordering = compare_values(left.as_deref(), right.as_deref());
                match sort.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            })
        })
    });
}

fn project(record: Record, projection: Projection) -> Record {
    match projection {
        Projection::Full => record,
        Projection::KeysOnly => record.into_key_only(),
    }
}

/// Runs a whole query over an in-process scan given in default (key) order.
///
/// Without an ordering the scan stops as soon as the window is filled.
pub fn run_query<I>(records: I, query: &Query) -> DataStoreResult<Vec<Record>>
where
    I: IntoIterator<Item = DataStoreResult<Record>>,
{
    let take = query.take.unwrap_or(usize::MAX);
    let mut matched = Vec::new();

    if take == 0 {
        return Ok(matched);
    }

    if query.order.is_empty() {
        let mut skipped = 0;
        for record in records {
            let record = record?;
            if !matches_all(&query.conditions, &record)? {
                continue;
            }

            if skipped < query.skip {
                skipped += 1;
                continue;
            }

            matched.push(project(record, query.projection));
            if matched.len() >= take {
                break;
            }
        }

        return Ok(matched);
    }

    for record in records {
        let record = record?;
        if matches_all(&query.conditions, &record)? {
            matched.push(record);
        }
    }

    sort_records(&mut matched, &query.order);

    Ok(matched
        .into_iter()
        .skip(query.skip)
        .take(take)
        .map(|record| project(record, query.projection))
        .collect())
}

/// Applies the in-process parts of `query` to a stream of candidate records.
///
/// `residual` holds the conditions the backend did not apply natively. The ordering,
/// window and projection of `query` are always applied here, so the source stream
/// must deliver full, unwindowed records. With an ordering the whole stream is
/// buffered before the first item is produced.
pub fn refine_stream(source: RecordStream, query: &Query, residual: Vec<Condition>) -> RecordStream {
    let projection = query.projection;
    let skip = query.skip;
    let take = query.take.unwrap_or(usize::MAX);

    let filtered = source.try_filter_map(move |record| {
        future::ready(match matches_all(&residual, &record) {
            Ok(true) => Ok(Some(record)),
            Ok(false) => Ok(None),
            Err(err) => Err(err),
        })
    });

    if query.order.is_empty() {
        return filtered
            .skip(skip)
            .take(take)
            .map_ok(move |record| project(record, projection))
            .boxed();
    }

    let order = query.order.clone();
    stream::once(filtered.try_collect::<Vec<_>>())
        .flat_map(move |collected| {
            let items = match collected {
                Ok(mut records) => {
                    sort_records(&mut records, &order);
                    records
                        .into_iter()
                        .skip(skip)
                        .take(take)
                        .map(|record| Ok(project(record, projection)))
                        .collect::<Vec<_>>()
                }
                Err(err) => vec![Err(err)],
            };
            stream::iter(items)
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{entity::EntityKey, query::Filter};
    use bson::doc;
    use std::sync::Arc;

    fn record(pk: &str, rk: &str, body: bson::Document) -> Record {
        Record::new(EntityKey::new(pk, rk), body)
    }

    fn people() -> Vec<Record> {
        vec![
            record("p", "1", doc! { "name": "ann", "age": 31, "tags": ["a", "b"] }),
            record("p", "2", doc! { "name": "bob", "age": 25_i64, "tags": ["b"] }),
            record("q", "3", doc! { "name": "cid", "age": 40.0, "address": { "city": "oslo" } }),
            record("q", "4", doc! { "name": "dee" }),
        ]
    }

    fn keys(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.key.row_key.as_str()).collect()
    }

    fn eval(expr: Expr, record: &Record) -> bool {
        RecordEvaluator::new(record).evaluate(&expr).unwrap()
    }

    #[test]
    fn numbers_compare_across_integer_and_double() {
        let rows = people();
        assert!(eval(Filter::gt("age", 30), &rows[0]));
        assert!(eval(Filter::lte("age", 25.0), &rows[1]));
        assert!(eval(Filter::eq("age", 40), &rows[2]));
        assert!(!eval(Filter::gt("age", 0), &rows[3]));
    }

    #[test]
    fn large_integers_compare_exactly() {
        let big = record("p", "1", doc! { "n": 9_007_199_254_740_992_i64 });

        assert!(!eval(Filter::eq("n", 9_007_199_254_740_993_i64), &big));
        assert!(eval(Filter::ne("n", 9_007_199_254_740_993_i64), &big));
        assert!(eval(Filter::lt("n", 9_007_199_254_740_993_i64), &big));
        assert!(eval(Filter::eq("n", 9_007_199_254_740_992.0), &big));
        assert!(eval(Filter::gt("n", 1.5), &big));

        let mut rows = vec![
            record("p", "a", doc! { "n": 9_007_199_254_740_993_i64 }),
            record("p", "b", doc! { "n": 9_007_199_254_740_992_i64 }),
        ];
        sort_records(&mut rows, &[Sort { field: "n".into(), direction: SortDirection::Asc }]);
        assert_eq!(keys(&rows), vec!["b", "a"]);
    }

    #[test]
    fn pseudo_fields_and_paths_resolve() {
        let rows = people();
        assert!(eval(Filter::partition("q"), &rows[2]));
        assert!(eval(Filter::row("1"), &rows[0]));
        assert!(eval(Filter::eq("address.city", "oslo"), &rows[2]));
        assert!(eval(Filter::exists("address"), &rows[2]));
        assert!(eval(Filter::not_exists("address"), &rows[0]));
    }

    #[test]
    fn string_and_array_operators() {
        let rows = people();
        assert!(eval(Filter::starts_with("name", "an"), &rows[0]));
        assert!(eval(Filter::ends_with("name", "ob"), &rows[1]));
        assert!(eval(Filter::contains("tags", "b"), &rows[1]));
        assert!(eval(Filter::contains("name", "i"), &rows[2]));
        assert!(eval(Filter::any_of("tags", vec!["x", "a"]), &rows[0]));
        assert!(eval(Filter::any_of("name", vec!["bob", "zed"]), &rows[1]));
        assert!(eval(Filter::none_of("tags", vec!["x"]), &rows[0]));
        assert!(eval(Filter::ne("missing", 1), &rows[0]));
    }

    #[test]
    fn null_equality_matches_missing_fields() {
        let rows = people();
        assert!(eval(Filter::eq("missing", Bson::Null), &rows[0]));
        assert!(!eval(Filter::ne("missing", Bson::Null), &rows[0]));
        assert!(eval(Filter::any_of("missing", vec![Bson::Null, Bson::from(1)]), &rows[0]));
        assert!(!eval(Filter::none_of("missing", vec![Bson::Null]), &rows[0]));
        assert!(eval(Filter::none_of("missing", vec![1, 2]), &rows[0]));
        assert!(!eval(Filter::eq("missing", 1), &rows[0]));
        assert!(!eval(Filter::gte("missing", Bson::Null), &rows[0]));
        assert!(!eval(Filter::contains("missing", "a"), &rows[0]));
        assert!(eval(Filter::not_contains("missing", "a"), &rows[0]));
        assert!(!eval(Filter::eq("name", Bson::Null), &rows[0]));
    }

    #[test]
    fn run_query_filters_sorts_and_windows() {
        let query = Query::builder()
            .filter(Filter::exists("age"))
            .order_by("age", SortDirection::Desc)
            .skip(1)
            .take(1)
            .build();

        let result = run_query(people().into_iter().map(Ok), &query).unwrap();
        assert_eq!(keys(&result), vec!["1"]);
    }

    #[test]
    fn run_query_then_by_breaks_ties() {
        let rows = vec![
            record("p", "1", doc! { "group": 2, "name": "b" }),
            record("p", "2", doc! { "group": 1, "name": "z" }),
            record("p", "3", doc! { "group": 2, "name": "a" }),
        ];
        let query = Query::builder()
            .order_by("group", SortDirection::Asc)
            .then_by("name", SortDirection::Asc)
            .build();

        let result = run_query(rows.into_iter().map(Ok), &query).unwrap();
        assert_eq!(keys(&result), vec!["2", "3", "1"]);
    }

    #[test]
    fn run_query_keys_only_drops_bodies_and_stops_early() {
        let query = Query::builder().take(2).keys_only().build();
        let mut pulled = 0;
        let source = people().into_iter().map(|r| {
            pulled += 1;
            Ok(r)
        });

        let result = run_query(source, &query).unwrap();
        assert_eq!(keys(&result), vec!["1", "2"]);
        assert!(result.iter().all(|r| r.body.is_empty()));
        assert_eq!(pulled, 2);
    }

    #[test]
    fn eval_conditions_run_in_process() {
        let predicate = Condition::Eval(Arc::new(|r: &Record| Ok(r.key.partition_key == "q")));
        let query = Query::filtered([predicate, Filter::exists("age").into()]);

        let result = run_query(people().into_iter().map(Ok), &query).unwrap();
        assert_eq!(keys(&result), vec!["3"]);
    }

    #[tokio::test]
    async fn refine_stream_applies_residual_order_and_window() {
        let query = Query::builder()
            .order_by("name", SortDirection::Desc)
            .take(2)
            .build();
        let residual = vec![Condition::Expr(Filter::ne("name", "dee"))];
        let source = stream::iter(people().into_iter().map(Ok)).boxed();

        let result: Vec<Record> = refine_stream(source, &query, residual)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(keys(&result), vec!["3", "2"]);
    }

    #[tokio::test]
    async fn refine_stream_surfaces_source_errors() {
        let query = Query::builder().order_by("name", SortDirection::Asc).build();
        let source = stream::iter(vec![
            Ok(people().remove(0)),
            Err(DataStoreError::Connection("gone".into())),
        ])
        .boxed();

        let result: DataStoreResult<Vec<Record>> =
            refine_stream(source, &query, Vec::new()).try_collect().await;
        assert!(matches!(result, Err(DataStoreError::Connection(_))));
    }
}
