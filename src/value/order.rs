use std::cmp::Ordering;

use crate::value::server_timestamp::{is_server_timestamp, local_write_time};
use crate::value::{FirestoreValue, ValueKind};

/// Position of a value's type in the cross-type sort order.
pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::Map(_) if is_server_timestamp(value) => 4,
        ValueKind::String(_) => 5,
        ValueKind::Bytes(_) => 6,
        ValueKind::Reference(_) => 7,
        ValueKind::GeoPoint(_) => 8,
        ValueKind::Array(_) => 9,
        ValueKind::Map(_) => 10,
    }
}

/// Total order across all value types; NaN sorts before every other number.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_type = type_order(left);
    let right_type = type_order(right);
    if left_type != right_type {
        return left_type.cmp(&right_type);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_mixed(*a, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_mixed(*b, *a).reverse(),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => a.split('/').cmp(b.split('/')),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            for (l, r) in a.values().iter().zip(b.values()) {
                let ordering = compare_values(l, r);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.values().len().cmp(&b.values().len())
        }
        (ValueKind::Map(_), ValueKind::Map(_)) if left_type == 4 => {
            local_write_time(left).cmp(&local_write_time(right))
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            for ((lk, lv), (rk, rv)) in a.fields().iter().zip(b.fields()) {
                let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.fields().len().cmp(&b.fields().len())
        }
        _ => Ordering::Equal,
    }
}

/// Equality used by filters and array transforms: integers and doubles never match each
/// other, NaN equals NaN, and -0.0 differs from 0.0.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Double(a), ValueKind::Double(b)) => a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan()),
        (ValueKind::Integer(_), ValueKind::Double(_)) | (ValueKind::Double(_), ValueKind::Integer(_)) => false,
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            a.values().len() == b.values().len()
                && a.values().iter().zip(b.values()).all(|(l, r)| values_equal(l, r))
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            a.fields().len() == b.fields().len()
                && a.fields()
                    .iter()
                    .zip(b.fields())
                    .all(|((lk, lv), (rk, rv))| lk == rk && values_equal(lv, rv))
        }
        _ => type_order(left) == type_order(right) && compare_values(left, right) == Ordering::Equal,
    }
}

fn compare_doubles(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    (integer as f64).partial_cmp(&double).unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;
    use crate::value::server_timestamp::pending_server_timestamp;

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(true),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-5),
            FirestoreValue::from_double(1.5),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            pending_server_timestamp(Timestamp::new(0, 0), None),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_array(vec![]),
        ];
        for window in ordered.windows(2) {
            assert_eq!(compare_values(&window[0], &window[1]), Ordering::Less, "{window:?}");
        }
    }

    #[test]
    fn numbers_compare_numerically_but_are_not_equal_across_types() {
        let int = FirestoreValue::from_integer(1);
        let double = FirestoreValue::from_double(1.0);
        assert_eq!(compare_values(&int, &double), Ordering::Equal);
        assert!(!values_equal(&int, &double));
        assert!(values_equal(
            &FirestoreValue::from_double(f64::NAN),
            &FirestoreValue::from_double(f64::NAN)
        ));
    }
}
