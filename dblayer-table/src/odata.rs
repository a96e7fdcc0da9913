//! Rendering of structural expressions as OData `$filter` text.
//!
//! Only what the table service can evaluate is rendered: comparisons of top-level
//! properties against scalar literals, prefix matches (as a range), membership
//! lists, and their boolean combinations. Anything else is reported as
//! [`Untranslatable`] so the caller can evaluate it in-process instead.

use bson::{Bson, Uuid, spec::BinarySubtype};
use chrono::SecondsFormat;
use thiserror::Error;

use dblayer_core::{
    error::DataStoreError,
    query::{Condition, Expr, FieldOp, QueryVisitor},
};

/// The expression has no OData form.
#[derive(Debug, Error)]
#[error("no OData form for {0}")]
pub struct Untranslatable(String);

impl From<Untranslatable> for DataStoreError {
    fn from(err: Untranslatable) -> Self {
        DataStoreError::adapter("render_filter", "odata", err)
    }
}

fn untranslatable<T>(what: impl Into<String>) -> Result<T, Untranslatable> {
    Err(Untranslatable(what.into()))
}

/// Renders expressions to OData filter text.
pub struct ODataRenderer;

impl ODataRenderer {
    pub fn render(expr: &Expr) -> Result<String, Untranslatable> {
        ODataRenderer.visit_expr(expr)
    }

    fn property(field: &str) -> Result<&str, Untranslatable> {
        let valid = field
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

        if valid {
            Ok(field)
        } else {
            untranslatable(format!("property name {field:?}"))
        }
    }

    fn literal(value: &Bson) -> Result<String, Untranslatable> {
        match value {
            Bson::String(s) => Ok(format!("'{}'", s.replace('\'', "''"))),
            Bson::Int32(n) => Ok(n.to_string()),
            Bson::Int64(n) => Ok(format!("{n}L")),
            Bson::Double(n) if n.is_finite() => {
                let text = n.to_string();
                if text.contains(['.', 'e', 'E']) {
                    Ok(text)
                } else {
                    Ok(format!("{text}.0"))
                }
            }
            Bson::Boolean(b) => Ok(b.to_string()),
            Bson::DateTime(dt) => Ok(format!(
                "datetime'{}'",
                dt.to_chrono().to_rfc3339_opts(SecondsFormat::Millis, true)
            )),
            Bson::Binary(binary) if binary.subtype == BinarySubtype::Uuid => {
                match <[u8; 16]>::try_from(binary.bytes.as_slice()) {
                    Ok(bytes) => Ok(format!("guid'{}'", Uuid::from_bytes(bytes))),
                    Err(_) => untranslatable("malformed uuid literal"),
                }
            }
            other => untranslatable(format!("{:?} literal", other.element_type())),
        }
    }

    fn comparison(field: &str, op: &str, value: &Bson) -> Result<String, Untranslatable> {
        Ok(format!("{} {op} {}", Self::property(field)?, Self::literal(value)?))
    }

    /// `field ge 'abc' and field lt 'abd'`
    fn prefix_range(field: &str, prefix: &str) -> Result<String, Untranslatable> {
        let mut chars = prefix.chars();
        let Some(last) = chars.next_back() else {
            return untranslatable("empty prefix");
        };
        let Some(next) = char::from_u32(last as u32 + 1) else {
            return untranslatable("prefix upper bound");
        };

        let upper = format!("{}{next}", chars.as_str());
        Ok(format!(
            "({} and {})",
            Self::comparison(field, "ge", &Bson::String(prefix.to_string()))?,
            Self::comparison(field, "lt", &Bson::String(upper))?
        ))
    }

    fn membership(field: &str, values: &Bson, op: &str, joiner: &str) -> Result<String, Untranslatable> {
        let Bson::Array(values) = values else {
            return Self::comparison(field, op, values);
        };

        if values.is_empty() {
            return untranslatable("empty value list");
        }

        let parts = values
            .iter()
            .map(|value| Self::comparison(field, op, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!("({})", parts.join(joiner)))
    }

    fn join(&mut self, exprs: &[Expr], joiner: &str) -> Result<String, Untranslatable> {
        if exprs.is_empty() {
            return untranslatable("empty boolean group");
        }

        let parts = exprs
            .iter()
            .map(|expr| self.visit_expr(expr).map(|text| format!("({text})")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parts.join(joiner))
    }
}

impl QueryVisitor for ODataRenderer {
    type Output = String;
    type Error = Untranslatable;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        self.join(exprs, " and ")
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        self.join(exprs, " or ")
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(format!("not ({})", self.visit_expr(expr)?))
    }

    fn visit_exists(&mut self, field: &str, _should_exist: bool) -> Result<Self::Output, Self::Error> {
        untranslatable(format!("existence test on {field}"))
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        match op {
            FieldOp::Eq => Self::comparison(field, "eq", value),
            FieldOp::Ne => Self::comparison(field, "ne", value),
            FieldOp::Gt => Self::comparison(field, "gt", value),
            FieldOp::Gte => Self::comparison(field, "ge", value),
            FieldOp::Lt => Self::comparison(field, "lt", value),
            FieldOp::Lte => Self::comparison(field, "le", value),
            FieldOp::StartsWith => match value {
                Bson::String(prefix) => Self::prefix_range(field, prefix),
                _ => untranslatable("non-string prefix"),
            },
            FieldOp::AnyOf => Self::membership(field, value, "eq", " or "),
            FieldOp::NoneOf => Self::membership(field, value, "ne", " and "),
            FieldOp::Contains | FieldOp::NotContains | FieldOp::EndsWith => {
                untranslatable(format!("{op:?} on {field}"))
            }
        }
    }
}

/// A query's conditions split into what the service filters and what is left
/// for in-process evaluation.
#[derive(Debug, Default)]
pub struct SplitFilter {
    /// Rendered native filter with the expressions it covers.
    pub native: Option<(String, Expr)>,
    pub residual: Vec<Condition>,
}

/// Splits `conditions` into a native OData filter and residual conditions.
///
/// Top-level conjunctions are split member by member, so one untranslatable
/// member does not pull its siblings out of the native filter.
pub fn split_conditions(conditions: &[Condition]) -> SplitFilter {
    let mut rendered = Vec::new();
    let mut covered = Vec::new();
    let mut residual = Vec::new();

    let mut push = |expr: &Expr| match ODataRenderer::render(expr) {
        Ok(text) => {
            rendered.push(text);
            covered.push(expr.clone());
        }
        Err(_) => residual.push(Condition::Expr(expr.clone())),
    };

    for condition in conditions {
        match condition {
            Condition::Expr(Expr::And(members)) if !members.is_empty() => {
                members.iter().for_each(&mut push);
            }
            Condition::Expr(expr) => push(expr),
            Condition::Eval(_) => {}
        }
    }

    residual.extend(
        conditions
            .iter()
            .filter(|condition| matches!(condition, Condition::Eval(_)))
            .cloned(),
    );

    let native = match rendered.len() {
        0 => None,
        1 => rendered.pop().zip(covered.pop()),
        _ => Some((
            rendered
                .iter()
                .map(|text| format!("({text})"))
                .collect::<Vec<_>>()
                .join(" and "),
            Expr::And(covered),
        )),
    };

    SplitFilter { native, residual }
}
