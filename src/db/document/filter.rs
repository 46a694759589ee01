//! Document filters, ordering and projection.

use std::cmp::Ordering;

use super::collection::{DocumentError, NATIVE_ID_KEY};
use crate::db::models::{FilterOp, SortOrder};
use crate::db::value::{Document, Value};

/// One predicate over a backend key.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub key: String,
    pub op: FilterOp,
    pub value: Value,
}

/// AND of [`Condition`]s; the empty query matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    conditions: Vec<Condition>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    /// Equality on a single key.
    pub fn by_key(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(key, FilterOp::Eq, value)
    }

    pub fn and(mut self, key: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            key: key.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Reject operands a match can never make sense of.
    pub fn validate(&self) -> Result<(), DocumentError> {
        for c in &self.conditions {
            match (c.op, &c.value) {
                (FilterOp::In, Value::Array(_)) => {}
                (FilterOp::In, other) => {
                    return Err(DocumentError::InvalidFilter(format!(
                        "$in on '{}' needs an array, got {}",
                        c.key,
                        other.type_name()
                    )));
                }
                (FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte, Value::Null) => {
                    return Err(DocumentError::InvalidFilter(format!(
                        "cannot order '{}' against null",
                        c.key
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|c| condition_matches(c, doc))
    }
}

fn condition_matches(c: &Condition, doc: &Document) -> bool {
    let field = doc.get(&c.key);
    match c.op {
        FilterOp::Eq => equals(field, &c.value),
        FilterOp::Ne => !equals(field, &c.value),
        FilterOp::In => match &c.value {
            Value::Array(candidates) => candidates.iter().any(|v| equals(field, v)),
            _ => false,
        },
        FilterOp::Gt => ordered(field, &c.value, |o| o == Ordering::Greater),
        FilterOp::Gte => ordered(field, &c.value, |o| o != Ordering::Less),
        FilterOp::Lt => ordered(field, &c.value, |o| o == Ordering::Less),
        FilterOp::Lte => ordered(field, &c.value, |o| o != Ordering::Greater),
    }
}

/// Missing keys equal null.
fn equals(field: Option<&Value>, expected: &Value) -> bool {
    let actual = field.unwrap_or(&Value::Null);
    actual == expected || actual.compare(expected) == Some(Ordering::Equal)
}

fn ordered(field: Option<&Value>, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    field
        .and_then(|actual| actual.compare(bound))
        .is_some_and(accept)
}

/// Stable multi-key sort; missing keys sort as null.
pub fn sort_documents(docs: &mut [Document], keys: &[(String, SortOrder)]) {
    docs.sort_by(|a, b| {
        for (key, order) in keys {
            let left = a.get(key).unwrap_or(&Value::Null);
            let right = b.get(key).unwrap_or(&Value::Null);
            let ord = match order {
                SortOrder::Asc => left.sort_cmp(right),
                SortOrder::Desc => right.sort_cmp(left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Keep only `keys` plus the native identifier.
pub fn project(doc: Document, keys: &[String]) -> Document {
    if keys.is_empty() {
        return doc;
    }
    doc.into_iter()
        .filter(|(k, _)| k == NATIVE_ID_KEY || keys.iter().any(|key| key == k))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(pairs: &[(&str, Value)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn equality_treats_missing_as_null() {
        let d = doc(&[("a", Value::Int(1))]);
        assert!(Query::by_key("b", Value::Null).matches(&d));
        assert!(!Query::by_key("a", Value::Null).matches(&d));
        assert!(Query::all().and("a", FilterOp::Ne, Value::Null).matches(&d));
    }

    #[test]
    fn numbers_match_across_widths() {
        let d = doc(&[("n", Value::UInt(5))]);
        assert!(Query::by_key("n", 5).matches(&d));
        assert!(Query::all().and("n", FilterOp::Gt, 4.5).matches(&d));
        assert!(!Query::all().and("n", FilterOp::Lt, 5).matches(&d));
        assert!(Query::all().and("n", FilterOp::Lte, 5).matches(&d));
    }

    #[test]
    fn ordering_against_missing_or_unrelated_types_never_matches() {
        let d = doc(&[("s", Value::from("x"))]);
        assert!(!Query::all().and("s", FilterOp::Gt, 1).matches(&d));
        assert!(!Query::all().and("missing", FilterOp::Gte, 1).matches(&d));
    }

    #[test]
    fn membership_requires_an_array() {
        let q = Query::all().and("s", FilterOp::In, "x");
        assert!(matches!(q.validate(), Err(DocumentError::InvalidFilter(_))));

        let q = Query::all().and("s", FilterOp::In, Value::Array(vec!["x".into(), "y".into()]));
        assert!(q.validate().is_ok());
        assert!(q.matches(&doc(&[("s", Value::from("y"))])));
    }

    #[test]
    fn sort_applies_keys_in_order() {
        let mut docs = vec![
            doc(&[("g", "b".into()), ("n", Value::Int(1))]),
            doc(&[("g", "a".into()), ("n", Value::Int(2))]),
            doc(&[("g", "b".into()), ("n", Value::Int(3))]),
        ];
        sort_documents(
            &mut docs,
            &[
                ("g".to_string(), SortOrder::Asc),
                ("n".to_string(), SortOrder::Desc),
            ],
        );
        let ns: Vec<_> = docs.iter().map(|d| d["n"].clone()).collect();
        assert_eq!(ns, vec![Value::Int(2), Value::Int(3), Value::Int(1)]);
    }

    #[test]
    fn projection_keeps_identifier() {
        let d = doc(&[
            ("_id", Value::Int(1)),
            ("a", Value::Int(2)),
            ("b", Value::Int(3)),
        ]);
        let p = project(d, &["a".to_string()]);
        assert_eq!(p.len(), 2);
        assert!(p.contains_key("_id"));
        assert!(!p.contains_key("b"));
    }
}
