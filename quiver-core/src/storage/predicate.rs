//! Value predicates applied while reading a field

use crate::FieldValue;
use std::cmp::Ordering;

/// Condition on a decoded value
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(FieldValue),
    Gt(FieldValue),
    Ge(FieldValue),
    Lt(FieldValue),
    Le(FieldValue),
    /// Inclusive on both ends
    Between(FieldValue, FieldValue),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

/// Integers compare exactly; as soon as a float is involved both sides are
/// compared as `f64`. NaN compares to nothing.
fn compare(a: FieldValue, b: FieldValue) -> Option<Ordering> {
    match (a, b) {
        (FieldValue::Integer(a), FieldValue::Integer(b)) => Some(a.cmp(&b)),
        (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
    }
}

impl Predicate {
    pub fn test(&self, value: FieldValue) -> bool {
        match self {
            Predicate::Eq(v) => compare(value, *v) == Some(Ordering::Equal),
            Predicate::Gt(v) => compare(value, *v) == Some(Ordering::Greater),
            Predicate::Ge(v) => matches!(
                compare(value, *v),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Predicate::Lt(v) => compare(value, *v) == Some(Ordering::Less),
            Predicate::Le(v) => matches!(compare(value, *v), Some(Ordering::Less | Ordering::Equal)),
            Predicate::Between(low, high) => {
                Predicate::Ge(*low).test(value) && Predicate::Le(*high).test(value)
            }
            Predicate::And(children) => children.iter().all(|p| p.test(value)),
            Predicate::Or(children) => children.iter().any(|p| p.test(value)),
        }
    }
}
