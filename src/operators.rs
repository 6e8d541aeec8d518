//! Binary and unary operator evaluation.
//!
//! Comparison follows a fixed type-priority cascade: exact decimal, then
//! double, then boolean, then long, then string. The order is observable for
//! mixed-type operands (`1 = '1.0'` is true through the long arm, `'' = false()`
//! through the boolean arm) and must not be rearranged.

use crate::ast::{BinaryOperator, UnaryOperator};
use crate::datasource::DataSourceNode;
use crate::engine::{XPathValue, string_to_number};
use crate::error::XPathError;
use std::cmp::Ordering;

pub fn evaluate_binary<'a, N>(
    op: BinaryOperator,
    left: XPathValue<N>,
    right: XPathValue<N>,
) -> Result<XPathValue<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    match op {
        BinaryOperator::Or => Ok(XPathValue::Boolean(left.to_bool() || right.to_bool())),
        BinaryOperator::And => Ok(XPathValue::Boolean(left.to_bool() && right.to_bool())),
        BinaryOperator::Equals
        | BinaryOperator::NotEquals
        | BinaryOperator::LessThan
        | BinaryOperator::LessThanOrEqual
        | BinaryOperator::GreaterThan
        | BinaryOperator::GreaterThanOrEqual => compare(op, &left, &right),
        BinaryOperator::Plus => Ok(add(&left, &right)),
        BinaryOperator::Minus => Ok(sub(&left, &right)),
        BinaryOperator::Multiply => Ok(mul(&left, &right)),
        BinaryOperator::Divide => Ok(div(&left, &right)),
        BinaryOperator::Quotient => Ok(quotient(&left, &right)),
        BinaryOperator::Modulo => Ok(modulo(&left, &right)),
    }
}

pub fn evaluate_unary<'a, N>(
    op: UnaryOperator,
    value: XPathValue<N>,
) -> Result<XPathValue<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    match op {
        UnaryOperator::Minus => Ok(negate(&value)),
        UnaryOperator::Not => Ok(XPathValue::Boolean(!value.to_bool())),
        UnaryOperator::Empty => Ok(XPathValue::Boolean(value.is_empty_value())),
    }
}

// --- Comparison ---

/// Node-sets compare existentially: the comparison holds if it holds for any
/// member's string value.
fn compare<'a, N>(
    op: BinaryOperator,
    left: &XPathValue<N>,
    right: &XPathValue<N>,
) -> Result<XPathValue<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    let result = match (left, right) {
        (XPathValue::NodeSet(l), XPathValue::NodeSet(r)) => l.iter().any(|a| {
            let a: XPathValue<N> = XPathValue::String(a.string_value());
            r.iter()
                .any(|b| scalar_compare(op, &a, &XPathValue::String(b.string_value())))
        }),
        (XPathValue::NodeSet(l), other) => l
            .iter()
            .any(|a| scalar_compare(op, &XPathValue::String(a.string_value()), other)),
        (other, XPathValue::NodeSet(r)) => r
            .iter()
            .any(|b| scalar_compare(op, other, &XPathValue::String(b.string_value()))),
        (l, r) => scalar_compare(op, l, r),
    };
    Ok(XPathValue::Boolean(result))
}

fn scalar_compare<'a, N>(op: BinaryOperator, left: &XPathValue<N>, right: &XPathValue<N>) -> bool
where
    N: DataSourceNode<'a> + 'a,
{
    match op {
        BinaryOperator::Equals => scalar_equals(left, right),
        BinaryOperator::NotEquals => !scalar_equals(left, right),
        _ => {
            let ordering = numeric_ordering(left, right);
            match (op, ordering) {
                (_, None) => false,
                (BinaryOperator::LessThan, Some(ord)) => ord == Ordering::Less,
                (BinaryOperator::LessThanOrEqual, Some(ord)) => ord != Ordering::Greater,
                (BinaryOperator::GreaterThan, Some(ord)) => ord == Ordering::Greater,
                (BinaryOperator::GreaterThanOrEqual, Some(ord)) => ord != Ordering::Less,
                _ => false,
            }
        }
    }
}

/// The equality cascade. The arm order is load-bearing; see the module doc.
fn scalar_equals<'a, N>(left: &XPathValue<N>, right: &XPathValue<N>) -> bool
where
    N: DataSourceNode<'a> + 'a,
{
    if matches!(left, XPathValue::Decimal(_)) || matches!(right, XPathValue::Decimal(_)) {
        match (left.to_decimal(), right.to_decimal()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    } else if matches!(left, XPathValue::Double(_)) || matches!(right, XPathValue::Double(_)) {
        left.to_number() == right.to_number()
    } else if matches!(left, XPathValue::Boolean(_)) || matches!(right, XPathValue::Boolean(_)) {
        left.to_bool() == right.to_bool()
    } else if matches!(left, XPathValue::Long(_)) || matches!(right, XPathValue::Long(_)) {
        left.to_long() == right.to_long()
    } else {
        left.to_string() == right.to_string()
    }
}

fn numeric_ordering<'a, N>(left: &XPathValue<N>, right: &XPathValue<N>) -> Option<Ordering>
where
    N: DataSourceNode<'a> + 'a,
{
    if matches!(left, XPathValue::Decimal(_)) || matches!(right, XPathValue::Decimal(_)) {
        if let (Some(a), Some(b)) = (left.to_decimal(), right.to_decimal()) {
            return Some(a.cmp(&b));
        }
    }
    left.to_number().partial_cmp(&right.to_number())
}

// --- Arithmetic ---

fn add<'a, N>(left: &XPathValue<N>, right: &XPathValue<N>) -> XPathValue<N>
where
    N: DataSourceNode<'a> + 'a,
{
    if matches!(left, XPathValue::Decimal(_)) || matches!(right, XPathValue::Decimal(_)) {
        if let (Some(a), Some(b)) = (left.to_decimal(), right.to_decimal()) {
            if let Some(sum) = a.checked_add(b) {
                return XPathValue::Decimal(sum);
            }
        }
    }
    if let (XPathValue::Long(a), XPathValue::Long(b)) = (left, right) {
        return XPathValue::Long(a.wrapping_add(*b));
    }
    XPathValue::Double(left.to_number() + right.to_number())
}

fn sub<'a, N>(left: &XPathValue<N>, right: &XPathValue<N>) -> XPathValue<N>
where
    N: DataSourceNode<'a> + 'a,
{
    if matches!(left, XPathValue::Decimal(_)) || matches!(right, XPathValue::Decimal(_)) {
        if let (Some(a), Some(b)) = (left.to_decimal(), right.to_decimal()) {
            if let Some(diff) = a.checked_sub(b) {
                return XPathValue::Decimal(diff);
            }
        }
    }
    if let (XPathValue::Long(a), XPathValue::Long(b)) = (left, right) {
        return XPathValue::Long(a.wrapping_sub(*b));
    }
    let diff = left.to_number() - right.to_number();
    // a NaN difference is normalized to zero; long-standing observable
    // behavior, covered by a dedicated regression test
    if diff.is_nan() {
        XPathValue::Double(0.0)
    } else {
        XPathValue::Double(diff)
    }
}

fn mul<'a, N>(left: &XPathValue<N>, right: &XPathValue<N>) -> XPathValue<N>
where
    N: DataSourceNode<'a> + 'a,
{
    if matches!(left, XPathValue::Decimal(_)) || matches!(right, XPathValue::Decimal(_)) {
        if let (Some(a), Some(b)) = (left.to_decimal(), right.to_decimal()) {
            if let Some(product) = a.checked_mul(b) {
                return XPathValue::Decimal(product);
            }
        }
    }
    if let (XPathValue::Long(a), XPathValue::Long(b)) = (left, right) {
        return XPathValue::Long(a.wrapping_mul(*b));
    }
    XPathValue::Double(left.to_number() * right.to_number())
}

/// `div` always widens; two integral operands still divide as doubles, and
/// division by zero follows double semantics (infinity, or NaN for 0/0).
fn div<'a, N>(left: &XPathValue<N>, right: &XPathValue<N>) -> XPathValue<N>
where
    N: DataSourceNode<'a> + 'a,
{
    if matches!(left, XPathValue::Decimal(_)) || matches!(right, XPathValue::Decimal(_)) {
        if let (Some(a), Some(b)) = (left.to_decimal(), right.to_decimal()) {
            if let Some(quotient) = a.checked_div(b) {
                return XPathValue::Decimal(quotient);
            }
        }
    }
    XPathValue::Double(left.to_number() / right.to_number())
}

/// `quo` truncates toward zero, in contrast with `div`.
fn quotient<'a, N>(left: &XPathValue<N>, right: &XPathValue<N>) -> XPathValue<N>
where
    N: DataSourceNode<'a> + 'a,
{
    if let (XPathValue::Long(a), XPathValue::Long(b)) = (left, right) {
        if *b != 0 {
            return XPathValue::Long(a.wrapping_div(*b));
        }
    }
    let q = left.to_number() / right.to_number();
    if q.is_finite() {
        XPathValue::Long(q.trunc() as i64)
    } else {
        XPathValue::Double(q)
    }
}

fn modulo<'a, N>(left: &XPathValue<N>, right: &XPathValue<N>) -> XPathValue<N>
where
    N: DataSourceNode<'a> + 'a,
{
    if let (XPathValue::Long(a), XPathValue::Long(b)) = (left, right) {
        if *b != 0 {
            return XPathValue::Long(a.wrapping_rem(*b));
        }
    }
    XPathValue::Double(left.to_number() % right.to_number())
}

/// Unary minus on a string chooses integral or double negation by the
/// presence of a decimal point in the literal.
fn negate<'a, N>(value: &XPathValue<N>) -> XPathValue<N>
where
    N: DataSourceNode<'a> + 'a,
{
    match value {
        XPathValue::Long(v) => XPathValue::Long(v.wrapping_neg()),
        XPathValue::Double(d) => XPathValue::Double(-d),
        XPathValue::Decimal(d) => XPathValue::Decimal(-*d),
        XPathValue::String(s) => {
            if !s.contains('.') {
                if let Ok(v) = s.trim().parse::<i64>() {
                    return XPathValue::Long(v.wrapping_neg());
                }
            }
            XPathValue::Double(-string_to_number(s))
        }
        other => XPathValue::Double(-other.to_number()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::tests::MockNode;
    use rust_decimal::Decimal;

    type V = XPathValue<MockNode<'static>>;

    fn eq(l: V, r: V) -> bool {
        match evaluate_binary(BinaryOperator::Equals, l, r).unwrap() {
            XPathValue::Boolean(b) => b,
            other => panic!("expected boolean, got {:?}", other),
        }
    }

    #[test]
    fn test_equality_cascade() {
        // long arm: strings coerce through double truncation
        assert!(eq(V::Long(1), V::String("1".into())));
        assert!(eq(V::Long(1), V::String("1.0".into())));
        // boolean arm beats the long arm
        assert!(eq(V::Boolean(true), V::Long(1)));
        assert!(eq(V::String("".into()), V::Boolean(false)));
        // double arm
        assert!(eq(V::String("1".into()), V::Double(1.0)));
        assert!(!eq(V::Double(f64::NAN), V::Double(f64::NAN)));
        // decimal arm is exact
        assert!(eq(V::Decimal("1.10".parse::<Decimal>().unwrap()), V::String("1.1".into())));
        // string arm
        assert!(eq(V::String("abc".into()), V::String("abc".into())));
        assert!(!eq(V::String("abc".into()), V::String("abd".into())));
        // null coerces like zero through the numeric arms
        assert!(eq(V::Null, V::Long(0)));
        assert!(!eq(V::Null, V::Long(1)));
    }

    #[test]
    fn test_relational_is_numeric() {
        let less = evaluate_binary(
            BinaryOperator::LessThan,
            V::String("2".into()),
            V::Long(10),
        )
        .unwrap();
        assert_eq!(less, V::Boolean(true));

        // NaN compares false against everything
        let cmp = evaluate_binary(
            BinaryOperator::LessThanOrEqual,
            V::String("abc".into()),
            V::Long(10),
        )
        .unwrap();
        assert_eq!(cmp, V::Boolean(false));
    }

    #[test]
    fn test_div_quo_mod() {
        let d = evaluate_binary(BinaryOperator::Divide, V::Long(7), V::Long(2)).unwrap();
        assert_eq!(d, V::Double(3.5));

        let q = evaluate_binary(BinaryOperator::Quotient, V::Long(7), V::Long(2)).unwrap();
        assert_eq!(q, V::Long(3));

        let m = evaluate_binary(BinaryOperator::Modulo, V::Long(7), V::Long(2)).unwrap();
        assert_eq!(m, V::Long(1));

        let inf = evaluate_binary(BinaryOperator::Divide, V::Long(7), V::Long(0)).unwrap();
        assert_eq!(inf, V::Double(f64::INFINITY));
    }

    #[test]
    fn test_long_and_double_arithmetic() {
        assert_eq!(
            evaluate_binary(BinaryOperator::Plus, V::Long(2), V::Long(3)).unwrap(),
            V::Long(5)
        );
        assert_eq!(
            evaluate_binary(BinaryOperator::Plus, V::Long(2), V::Double(0.5)).unwrap(),
            V::Double(2.5)
        );
        assert_eq!(
            evaluate_binary(BinaryOperator::Multiply, V::String("4".into()), V::Long(2)).unwrap(),
            V::Double(8.0)
        );
    }

    #[test]
    fn test_decimal_arithmetic_avoids_double_rounding() {
        let a = V::Decimal("0.1".parse::<Decimal>().unwrap());
        let b = V::Decimal("0.2".parse::<Decimal>().unwrap());
        let sum = evaluate_binary(BinaryOperator::Plus, a, b).unwrap();
        assert_eq!(sum, V::Decimal("0.3".parse::<Decimal>().unwrap()));
    }

    #[test]
    fn test_subtraction_normalizes_nan_to_zero() {
        // preserved quirk: a NaN difference is zero, but only for subtraction
        let diff =
            evaluate_binary(BinaryOperator::Minus, V::String("abc".into()), V::Long(1)).unwrap();
        assert_eq!(diff, V::Double(0.0));

        let sum =
            evaluate_binary(BinaryOperator::Plus, V::String("abc".into()), V::Long(1)).unwrap();
        match sum {
            V::Double(d) => assert!(d.is_nan()),
            other => panic!("expected double NaN, got {:?}", other),
        }
    }

    #[test]
    fn test_unary_operators() {
        assert_eq!(
            evaluate_unary(UnaryOperator::Minus, V::String("5".into())).unwrap(),
            V::Long(-5)
        );
        assert_eq!(
            evaluate_unary(UnaryOperator::Minus, V::String("5.5".into())).unwrap(),
            V::Double(-5.5)
        );
        assert_eq!(
            evaluate_unary(UnaryOperator::Not, V::Boolean(true)).unwrap(),
            V::Boolean(false)
        );
        assert_eq!(
            evaluate_unary(UnaryOperator::Empty, V::Null).unwrap(),
            V::Boolean(true)
        );
        assert_eq!(
            evaluate_unary(UnaryOperator::Empty, V::String(String::new())).unwrap(),
            V::Boolean(true)
        );
        assert_eq!(
            evaluate_unary(UnaryOperator::Empty, V::NodeSet(vec![])).unwrap(),
            V::Boolean(true)
        );
        assert_eq!(
            evaluate_unary(UnaryOperator::Empty, V::Long(0)).unwrap(),
            V::Boolean(false)
        );
    }
}
