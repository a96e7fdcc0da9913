//! Query translation from dblayer expressions to MongoDB query documents.
//!
//! Record keys live in a compound `_id` (`{ p: partition, r: row }`), so the key
//! pseudo-fields translate to `_id.p` and `_id.r`. Other field paths are escaped
//! the same way stored keys are.

use bson::{Bson, Document, doc};

use dblayer_core::{
    error::DataStoreError,
    query::{Condition, Expr, FieldOp, PARTITION_KEY_FIELD, QueryVisitor, ROW_KEY_FIELD, Sort, SortDirection},
};

use crate::sanitizer::ValueSanitizer;

pub(crate) const ID_FIELD: &str = "_id";
pub(crate) const PARTITION_FIELD: &str = "p";
pub(crate) const ROW_FIELD: &str = "r";

/// Maps a logical field name to its stored path.
pub(crate) fn field_path(field: &str) -> String {
    match field {
        PARTITION_KEY_FIELD => format!("{ID_FIELD}.{PARTITION_FIELD}"),
        ROW_KEY_FIELD => format!("{ID_FIELD}.{ROW_FIELD}"),
        _ => ValueSanitizer::sanitize_path(field),
    }
}

fn escape_regex(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Translates dblayer query expressions into MongoDB query documents.
pub(crate) struct MongoQueryTranslator;

impl QueryVisitor for MongoQueryTranslator {
    type Output = Document;
    type Error = DataStoreError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        if exprs.is_empty() {
            return Ok(doc! {});
        }

        Ok(doc! {
            "$and": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        if exprs.is_empty() {
            // Matches nothing.
            return Ok(doc! { ID_FIELD: { "$exists": false } });
        }

        Ok(doc! {
            "$or": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            "$nor": [self.visit_expr(expr)?],
        })
    }

    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            field_path(field): { "$exists": should_exist },
        })
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        let path = field_path(field);
        // Key fields are always strings, so they never need the array guard.
        let is_key = field == PARTITION_KEY_FIELD || field == ROW_KEY_FIELD;
        let scalar = |operator: Document| {
            if is_key || matches!(value, Bson::Array(_)) {
                doc! { path.as_str(): operator }
            } else {
                let mut operator = operator;
                operator.insert("$not", doc! { "$type": "array" });
                doc! { path.as_str(): operator }
            }
        };
        let unsupported = |what: &str| {
            DataStoreError::adapter("translate_query", field, format!("{what} requires a string value"))
        };

        Ok(match op {
            FieldOp::Eq => scalar(doc! { "$eq": value }),
            FieldOp::Ne => doc! { "$nor": [scalar(doc! { "$eq": value })] },
            FieldOp::Gt => scalar(doc! { "$gt": value }),
            FieldOp::Gte => scalar(doc! { "$gte": value }),
            FieldOp::Lt => scalar(doc! { "$lt": value }),
            FieldOp::Lte => scalar(doc! { "$lte": value }),
            FieldOp::Contains => contains(&path, value),
            FieldOp::NotContains => doc! { "$nor": [contains(&path, value)] },
            FieldOp::StartsWith => match value {
                Bson::String(s) => scalar(doc! { "$regex": format!("^{}", escape_regex(s)) }),
                _ => return Err(unsupported("StartsWith")),
            },
            FieldOp::EndsWith => match value {
                Bson::String(s) => scalar(doc! { "$regex": format!("{}$", escape_regex(s)) }),
                _ => return Err(unsupported("EndsWith")),
            },
            FieldOp::AnyOf => match value {
                Bson::Array(values) => doc! { path.as_str(): { "$in": values.clone() } },
                other => doc! { path.as_str(): { "$eq": other } },
            },
            FieldOp::NoneOf => match value {
                Bson::Array(values) => doc! { path.as_str(): { "$nin": values.clone() } },
                other => doc! { path.as_str(): { "$ne": other } },
            },
        })
    }
}

/// Substring match on a string field, or an exact element match on an array field.
///
/// A bare `$regex` would also run against the elements of an array.
fn contains(path: &str, value: &Bson) -> Document {
    let element = doc! { path: { "$elemMatch": { "$eq": value } } };
    match value {
        Bson::String(s) => doc! {
            "$or": [
                element,
                { path: { "$regex": escape_regex(s), "$not": { "$type": "array" } } },
            ]
        },
        _ => element,
    }
}

/// A query's conditions split into a native filter and the conditions left for
/// in-process evaluation.
#[derive(Debug, Default)]
pub(crate) struct Translated {
    pub filter: Document,
    pub residual: Vec<Condition>,
}

pub(crate) fn translate_conditions(conditions: &[Condition]) -> Translated {
    let mut native = Vec::new();
    let mut residual = Vec::new();

    for condition in conditions {
        match condition {
            Condition::Expr(expr) => match MongoQueryTranslator.visit_expr(expr) {
                Ok(filter) => native.push(filter),
                Err(_) => residual.push(condition.clone()),
            },
            Condition::Eval(_) => residual.push(condition.clone()),
        }
    }

    let filter = match native.len() {
        0 => Document::new(),
        1 => native.pop().unwrap_or_default(),
        _ => doc! { "$and": native },
    };

    Translated { filter, residual }
}

pub(crate) fn sort_document(order: &[Sort]) -> Document {
    order
        .iter()
        .map(|sort| {
            let direction = match sort.direction {
                SortDirection::Asc => 1,
                SortDirection::Desc => -1,
            };
            (field_path(&sort.field), Bson::Int32(direction))
        })
        .collect()
}
