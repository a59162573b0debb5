//! Operators, builtin functions and the native methods of builtin values.
//!
//! Everything here is pure with respect to the interpreter: functions take
//! values and return values or a [`ScriptError`], and the interpreter attaches
//! line numbers and call frames.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::f64::consts::{E, PI};
use std::rc::Rc;

use super::ast::BinaryOp;
use super::capabilities;
use super::value::{values_equal, Dict, DictKey, Record, Value};
use crate::constants::backtest::DEFAULT_KLINE_COUNT;
use crate::constants::sandbox::{MAX_COLLECTION_LEN, MAX_RANGE_LEN};
use crate::error::ScriptError;
use crate::models::{Decision, MarketSnapshot};

const LIST_METHODS: &[&str] = &["append", "pop", "contains"];
const DICT_METHODS: &[&str] = &["get", "keys", "values", "items"];
const STR_METHODS: &[&str] = &["upper", "lower", "startswith"];
const SNAPSHOT_METHODS: &[&str] = &[
    "get_klines",
    "get_indicator",
    "get_flow",
    "get_regime",
    "get_price_change",
];

pub type Keywords = Vec<(String, Value)>;

// ---------------------------------------------------------------------------
// argument helpers
// ---------------------------------------------------------------------------

/// Match positional and keyword arguments to parameter slots.
///
/// The first `required` parameters must be filled; the rest come back as
/// `None` when absent.
pub fn bind_arguments(
    name: &str,
    params: &[&str],
    required: usize,
    positional: Vec<Value>,
    keywords: Keywords,
) -> Result<Vec<Option<Value>>, ScriptError> {
    if positional.len() > params.len() {
        return Err(ScriptError::bad_args(
            name,
            format!(
                "takes {} positional argument(s) but {} were given",
                params.len(),
                positional.len()
            ),
        ));
    }
    let mut slots: Vec<Option<Value>> = vec![None; params.len()];
    for (slot, value) in slots.iter_mut().zip(positional) {
        *slot = Some(value);
    }
    for (key, value) in keywords {
        let Some(idx) = params.iter().position(|p| *p == key) else {
            return Err(ScriptError::bad_args(
                name,
                format!("got an unexpected keyword argument '{}'", key),
            ));
        };
        if slots[idx].is_some() {
            return Err(ScriptError::bad_args(
                name,
                format!("got multiple values for argument '{}'", key),
            ));
        }
        slots[idx] = Some(value);
    }
    if let Some((param, _)) = params
        .iter()
        .zip(&slots)
        .take(required)
        .find(|(_, slot)| slot.is_none())
    {
        return Err(ScriptError::bad_args(
            name,
            format!("missing required argument '{}'", param),
        ));
    }
    Ok(slots)
}

fn exactly<const N: usize>(name: &str, args: Vec<Value>) -> Result<[Value; N], ScriptError> {
    args.try_into().map_err(|args: Vec<Value>| {
        ScriptError::bad_args(
            name,
            format!("takes exactly {} argument(s) ({} given)", N, args.len()),
        )
    })
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), ScriptError> {
    if args.len() < min || args.len() > max {
        return Err(ScriptError::bad_args(
            name,
            format!(
                "takes {} to {} arguments ({} given)",
                min,
                max,
                args.len()
            ),
        ));
    }
    Ok(())
}

fn no_keywords(name: &str, keywords: &Keywords) -> Result<(), ScriptError> {
    if keywords.is_empty() {
        Ok(())
    } else {
        Err(ScriptError::bad_args(name, "takes no keyword arguments"))
    }
}

fn number(name: &str, value: &Value) -> Result<f64, ScriptError> {
    value.as_f64().ok_or_else(|| {
        ScriptError::bad_args(name, format!("must be a number, not '{}'", value.type_name()))
    })
}

fn integer(name: &str, value: &Value) -> Result<i64, ScriptError> {
    match value {
        Value::Int(i) => Ok(*i),
        other => Err(ScriptError::bad_args(
            name,
            format!("expected an int, got '{}'", other.type_name()),
        )),
    }
}

fn string(name: &str, value: Option<Value>) -> Result<String, ScriptError> {
    match value {
        Some(Value::Str(s)) => Ok(s.to_string()),
        Some(other) => Err(ScriptError::bad_args(
            name,
            format!("expected a str, got '{}'", other.type_name()),
        )),
        None => Err(ScriptError::bad_args(name, "missing string argument")),
    }
}

pub fn float_to_int(f: f64) -> Result<i64, ScriptError> {
    if !f.is_finite() {
        return Err(ScriptError::InvalidValue(format!(
            "cannot convert {} to integer",
            f
        )));
    }
    if f < i64::MIN as f64 || f >= i64::MAX as f64 {
        return Err(ScriptError::IntegerOverflow);
    }
    Ok(f as i64)
}

// ---------------------------------------------------------------------------
// operators
// ---------------------------------------------------------------------------

fn operand_error(op: BinaryOp, lhs: &Value, rhs: &Value) -> ScriptError {
    ScriptError::type_mismatch(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        lhs.type_name(),
        rhs.type_name()
    ))
}

/// Ordering of two values; `None` when either side is NaN.
pub fn compare_values(lhs: &Value, rhs: &Value) -> Result<Option<Ordering>, ScriptError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(Some(a.cmp(b))),
        (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
        (Value::Bool(a), Value::Bool(b)) => Ok(Some(a.cmp(b))),
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => Ok(a.partial_cmp(&b)),
            _ => Err(ScriptError::type_mismatch(format!(
                "'<' not supported between instances of '{}' and '{}'",
                lhs.type_name(),
                rhs.type_name()
            ))),
        },
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, ScriptError> {
    match container {
        Value::List(items) => Ok(items.borrow().iter().any(|v| values_equal(v, item))),
        Value::Dict(entries) => {
            let key = DictKey::from_value(item)?;
            Ok(entries.borrow().contains_key(&key))
        }
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(needle.as_ref())),
            other => Err(ScriptError::type_mismatch(format!(
                "'in <str>' requires str as left operand, not '{}'",
                other.type_name()
            ))),
        },
        other => Err(ScriptError::type_mismatch(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn arithmetic(
    op: BinaryOp,
    lhs: &Value,
    rhs: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, ScriptError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => int_op(*a, *b)
            .map(Value::Int)
            .ok_or(ScriptError::IntegerOverflow),
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(float_op(a, b))),
            _ => Err(operand_error(op, lhs, rhs)),
        },
    }
}

/// Floored remainder: the result takes the sign of the divisor.
fn floored_rem_int(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        r.checked_add(b)
    } else {
        Some(r)
    }
}

fn floored_rem_float(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
        r + b
    } else {
        r
    }
}

fn within_limit(kind: &'static str, len: usize) -> Result<(), ScriptError> {
    if len > MAX_COLLECTION_LEN {
        return Err(ScriptError::SizeLimit {
            kind,
            limit: MAX_COLLECTION_LEN,
        });
    }
    Ok(())
}

pub fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ScriptError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(lhs, rhs))),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(lhs, rhs))),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let result = compare_values(lhs, rhs)?.is_some_and(|ord| match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::LtEq => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            });
            Ok(Value::Bool(result))
        }
        BinaryOp::In => contains(rhs, lhs).map(Value::Bool),
        BinaryOp::Add => match (lhs, rhs) {
            (Value::Str(a), Value::Str(b)) => {
                within_limit("string", a.len() + b.len())?;
                Ok(Value::Str(Rc::from(format!("{}{}", a, b))))
            }
            (Value::List(a), Value::List(b)) => {
                within_limit("list", a.borrow().len() + b.borrow().len())?;
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(Value::list(items))
            }
            _ => arithmetic(op, lhs, rhs, i64::checked_add, |a, b| a + b),
        },
        BinaryOp::Sub => arithmetic(op, lhs, rhs, i64::checked_sub, |a, b| a - b),
        BinaryOp::Mul => arithmetic(op, lhs, rhs, i64::checked_mul, |a, b| a * b),
        BinaryOp::Div => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(_), Some(b)) if b == 0.0 => Err(ScriptError::DivisionByZero),
            (Some(a), Some(b)) => Ok(Value::Float(a / b)),
            _ => Err(operand_error(op, lhs, rhs)),
        },
        BinaryOp::Rem => {
            if rhs.as_f64() == Some(0.0) {
                return Err(ScriptError::DivisionByZero);
            }
            arithmetic(op, lhs, rhs, floored_rem_int, floored_rem_float)
        }
    }
}

pub fn negate(value: &Value) -> Result<Value, ScriptError> {
    match value {
        Value::Int(i) => i.checked_neg().map(Value::Int).ok_or(ScriptError::IntegerOverflow),
        Value::Float(f) => Ok(Value::Float(-f)),
        other => Err(ScriptError::type_mismatch(format!(
            "bad operand type for unary -: '{}'",
            other.type_name()
        ))),
    }
}

pub fn index_value(object: &Value, index: &Value) -> Result<Value, ScriptError> {
    match (object, index) {
        (Value::List(items), Value::Int(i)) => {
            let items = items.borrow();
            let idx = normalize_index(*i, items.len())?;
            Ok(items[idx].clone())
        }
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize_index(*i, chars.len())?;
            Ok(Value::str(&chars[idx].to_string()))
        }
        (Value::Dict(entries), key) => {
            let key = DictKey::from_value(key)?;
            entries
                .borrow()
                .get(&key)
                .cloned()
                .ok_or_else(|| ScriptError::KeyNotFound(key.to_value().repr()))
        }
        (Value::List(_) | Value::Str(_), other) => Err(ScriptError::type_mismatch(format!(
            "indices must be integers, not '{}'",
            other.type_name()
        ))),
        (other, _) => Err(ScriptError::type_mismatch(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub fn set_index(object: &Value, index: &Value, value: Value) -> Result<(), ScriptError> {
    match (object, index) {
        (Value::List(items), Value::Int(i)) => {
            let mut items = items.borrow_mut();
            let idx = normalize_index(*i, items.len())?;
            items[idx] = value;
            Ok(())
        }
        (Value::Dict(entries), key) => {
            let key = DictKey::from_value(key)?;
            let mut entries = entries.borrow_mut();
            if !entries.contains_key(&key) {
                within_limit("dict", entries.len() + 1)?;
            }
            entries.insert(key, value);
            Ok(())
        }
        (other, _) => Err(ScriptError::type_mismatch(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn normalize_index(index: i64, len: usize) -> Result<usize, ScriptError> {
    let resolved = if index < 0 {
        index.checked_add(len as i64)
    } else {
        Some(index)
    };
    match resolved {
        Some(i) if i >= 0 && (i as usize) < len => Ok(i as usize),
        _ => Err(ScriptError::IndexOutOfRange { index, len }),
    }
}

// ---------------------------------------------------------------------------
// builtin functions
// ---------------------------------------------------------------------------

/// Builtins other than `print`/`log`, which need the interpreter's log buffer.
pub fn call_builtin(name: &str, args: Vec<Value>, keywords: Keywords) -> Result<Value, ScriptError> {
    match name {
        "sorted" => return sorted(args, keywords),
        "dict" => return dict(args, keywords),
        _ => no_keywords(name, &keywords)?,
    }
    match name {
        "abs" => {
            let [x] = exactly(name, args)?;
            abs(name, &x)
        }
        "min" => extremum(name, args, Ordering::Less),
        "max" => extremum(name, args, Ordering::Greater),
        "sum" => {
            arity(name, &args, 1, 2)?;
            let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
            for item in args[0].iter_items()? {
                total = binary(BinaryOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        "len" => {
            let [x] = exactly(name, args)?;
            let len = match &x {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.borrow().len(),
                Value::Dict(entries) => entries.borrow().len(),
                other => {
                    return Err(ScriptError::type_mismatch(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::Int(len as i64))
        }
        "round" => {
            arity(name, &args, 1, 2)?;
            match (&args[0], args.get(1)) {
                (Value::Int(i), None) => Ok(Value::Int(*i)),
                (x, None) => float_to_int(number(name, x)?.round()).map(Value::Int),
                (x, Some(digits)) => {
                    let x = number(name, x)?;
                    let digits = integer(name, digits)?.clamp(-308, 308) as i32;
                    let scale = 10f64.powi(digits);
                    Ok(Value::Float((x * scale).round() / scale))
                }
            }
        }
        "int" => {
            let [x] = exactly(name, args)?;
            match &x {
                Value::Int(i) => Ok(Value::Int(*i)),
                Value::Float(f) => float_to_int(f.trunc()).map(Value::Int),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    ScriptError::InvalidValue(format!("invalid literal for int(): {}", x.repr()))
                }),
                other => Err(ScriptError::type_mismatch(format!(
                    "int() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))),
            }
        }
        "float" => {
            let [x] = exactly(name, args)?;
            match &x {
                Value::Int(i) => Ok(Value::Float(*i as f64)),
                Value::Float(f) => Ok(Value::Float(*f)),
                Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
                Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                    ScriptError::InvalidValue(format!(
                        "could not convert string to float: {}",
                        x.repr()
                    ))
                }),
                other => Err(ScriptError::type_mismatch(format!(
                    "float() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))),
            }
        }
        "str" => {
            arity(name, &args, 0, 1)?;
            Ok(args
                .first()
                .map(|x| Value::str(&x.to_string()))
                .unwrap_or_else(|| Value::str("")))
        }
        "bool" => {
            arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
        }
        "list" => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                Some(x) => Ok(Value::list(x.iter_items()?)),
                None => Ok(Value::list(Vec::new())),
            }
        }
        "range" => range(args),
        "enumerate" => {
            arity(name, &args, 1, 2)?;
            let start = match args.get(1) {
                Some(v) => integer(name, v)?,
                None => 0,
            };
            let mut out = Vec::new();
            for (i, item) in args[0].iter_items()?.into_iter().enumerate() {
                let idx = start
                    .checked_add(i as i64)
                    .ok_or(ScriptError::IntegerOverflow)?;
                out.push(Value::list(vec![Value::Int(idx), item]));
            }
            Ok(Value::list(out))
        }
        "zip" => {
            let columns = args
                .iter()
                .map(Value::iter_items)
                .collect::<Result<Vec<_>, _>>()?;
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            let rows = (0..len)
                .map(|i| Value::list(columns.iter().map(|col| col[i].clone()).collect()))
                .collect();
            Ok(Value::list(rows))
        }
        "reversed" => {
            let [x] = exactly(name, args)?;
            let mut items = x.iter_items()?;
            items.reverse();
            Ok(Value::list(items))
        }
        "any" => {
            let [x] = exactly(name, args)?;
            Ok(Value::Bool(x.iter_items()?.iter().any(Value::truthy)))
        }
        "all" => {
            let [x] = exactly(name, args)?;
            Ok(Value::Bool(x.iter_items()?.iter().all(Value::truthy)))
        }
        "type" => {
            let [x] = exactly(name, args)?;
            Ok(Value::str(&x.type_name()))
        }
        other => Err(ScriptError::UndefinedName(other.to_string())),
    }
}

fn abs(name: &str, x: &Value) -> Result<Value, ScriptError> {
    match x {
        Value::Int(i) => i.checked_abs().map(Value::Int).ok_or(ScriptError::IntegerOverflow),
        other => Ok(Value::Float(number(name, other)?.abs())),
    }
}

/// `min`/`max` over either one iterable or several arguments.
fn extremum(name: &str, args: Vec<Value>, keep: Ordering) -> Result<Value, ScriptError> {
    let items = if args.len() == 1 {
        args[0].iter_items()?
    } else {
        args
    };
    let mut iter = items.into_iter();
    let Some(mut best) = iter.next() else {
        return Err(ScriptError::bad_args(name, "arg is an empty sequence"));
    };
    for item in iter {
        if compare_values(&item, &best)? == Some(keep) {
            best = item;
        }
    }
    Ok(best)
}

fn sorted(args: Vec<Value>, keywords: Keywords) -> Result<Value, ScriptError> {
    let slots = bind_arguments("sorted", &["iterable", "reverse"], 1, args, keywords)?;
    let mut slots = slots.into_iter();
    let mut items = slots.next().flatten().unwrap_or(Value::None).iter_items()?;
    let reverse = slots.next().flatten().is_some_and(|v| v.truthy());

    let mut failure = None;
    items.sort_by(|a, b| match compare_values(a, b) {
        Ok(ord) => ord.unwrap_or(Ordering::Equal),
        Err(err) => {
            failure.get_or_insert(err);
            Ordering::Equal
        }
    });
    if let Some(err) = failure {
        return Err(err);
    }
    if reverse {
        items.reverse();
    }
    Ok(Value::list(items))
}

fn dict(args: Vec<Value>, keywords: Keywords) -> Result<Value, ScriptError> {
    arity("dict", &args, 0, 1)?;
    let mut entries = Dict::new();
    match args.first() {
        Some(Value::Dict(source)) => entries = source.borrow().clone(),
        Some(pairs) => {
            for pair in pairs.iter_items()? {
                let kv = pair.iter_items()?;
                let [key, value]: [Value; 2] = kv.try_into().map_err(|_| {
                    ScriptError::InvalidValue("dict() sequence elements must be pairs".to_string())
                })?;
                entries.insert(DictKey::from_value(&key)?, value);
            }
        }
        None => {}
    }
    for (key, value) in keywords {
        entries.insert(DictKey::Str(Rc::from(key.as_str())), value);
    }
    Ok(Value::dict(entries))
}

fn range(args: Vec<Value>) -> Result<Value, ScriptError> {
    arity("range", &args, 1, 3)?;
    let ints = args
        .iter()
        .map(|v| integer("range", v))
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(ScriptError::bad_args("range", "takes 1 to 3 arguments")),
    };
    if step == 0 {
        return Err(ScriptError::InvalidValue(
            "range() arg 3 must not be zero".to_string(),
        ));
    }
    let span = if step > 0 {
        i128::from(stop) - i128::from(start)
    } else {
        i128::from(start) - i128::from(stop)
    };
    let step_abs = i128::from(step).abs();
    let len = if span <= 0 { 0 } else { (span + step_abs - 1) / step_abs };
    if len > i128::from(MAX_RANGE_LEN) {
        return Err(ScriptError::InvalidValue(format!(
            "range() too large (limit {})",
            MAX_RANGE_LEN
        )));
    }
    let items = (0..len as i64)
        .map(|i| Value::Int(start + i * step))
        .collect();
    Ok(Value::list(items))
}

// ---------------------------------------------------------------------------
// math module
// ---------------------------------------------------------------------------

pub fn module_attribute(module: &str, name: &str) -> Option<Value> {
    if module != "math" {
        return None;
    }
    match name {
        "pi" => Some(Value::Float(PI)),
        "e" => Some(Value::Float(E)),
        "inf" => Some(Value::Float(f64::INFINITY)),
        _ => capabilities::MATH_FUNCTIONS
            .iter()
            .copied()
            .find(|f| *f == name)
            .map(Value::MathFunction),
    }
}

fn domain_error() -> ScriptError {
    ScriptError::InvalidValue("math domain error".to_string())
}

pub fn call_math(name: &str, args: Vec<Value>, keywords: Keywords) -> Result<Value, ScriptError> {
    no_keywords(name, &keywords)?;
    match name {
        "sqrt" => {
            let [x] = exactly(name, args)?;
            let x = number(name, &x)?;
            if x < 0.0 {
                return Err(domain_error());
            }
            Ok(Value::Float(x.sqrt()))
        }
        "log" => {
            arity(name, &args, 1, 2)?;
            let x = number(name, &args[0])?;
            if x <= 0.0 {
                return Err(domain_error());
            }
            match args.get(1) {
                Some(base) => {
                    let base = number(name, base)?;
                    if base <= 0.0 || base == 1.0 {
                        return Err(domain_error());
                    }
                    Ok(Value::Float(x.ln() / base.ln()))
                }
                None => Ok(Value::Float(x.ln())),
            }
        }
        "log10" => {
            let [x] = exactly(name, args)?;
            let x = number(name, &x)?;
            if x <= 0.0 {
                return Err(domain_error());
            }
            Ok(Value::Float(x.log10()))
        }
        "exp" => {
            let [x] = exactly(name, args)?;
            Ok(Value::Float(number(name, &x)?.exp()))
        }
        "pow" => {
            let [x, y] = exactly(name, args)?;
            Ok(Value::Float(number(name, &x)?.powf(number(name, &y)?)))
        }
        "floor" | "ceil" => {
            let [x] = exactly(name, args)?;
            match x {
                Value::Int(i) => Ok(Value::Int(i)),
                other => {
                    let f = number(name, &other)?;
                    let rounded = if name == "floor" { f.floor() } else { f.ceil() };
                    float_to_int(rounded).map(Value::Int)
                }
            }
        }
        "abs" => {
            let [x] = exactly(name, args)?;
            abs(name, &x)
        }
        "fabs" => {
            let [x] = exactly(name, args)?;
            Ok(Value::Float(number(name, &x)?.abs()))
        }
        other => Err(ScriptError::NoAttribute {
            type_name: "module".to_string(),
            attr: other.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// methods of builtin values
// ---------------------------------------------------------------------------

/// Name of a native method of `receiver`, if it has one called `name`.
pub fn native_method(receiver: &Value, name: &str) -> Option<&'static str> {
    let table = match receiver {
        Value::List(_) => LIST_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Str(_) => STR_METHODS,
        Value::Snapshot(_) => SNAPSHOT_METHODS,
        _ => return None,
    };
    table.iter().copied().find(|m| *m == name)
}

pub fn call_native(
    receiver: &Value,
    method: &str,
    args: Vec<Value>,
    keywords: Keywords,
) -> Result<Value, ScriptError> {
    if let Value::Snapshot(snapshot) = receiver {
        return snapshot_method(snapshot, method, args, keywords);
    }
    no_keywords(method, &keywords)?;
    match (receiver, method) {
        (Value::List(items), "append") => {
            let [x] = exactly(method, args)?;
            let mut items = items.borrow_mut();
            within_limit("list", items.len() + 1)?;
            items.push(x);
            Ok(Value::None)
        }
        (Value::List(items), "pop") => {
            arity(method, &args, 0, 1)?;
            let index = match args.first() {
                Some(v) => integer(method, v)?,
                None => -1,
            };
            let mut items = items.borrow_mut();
            let idx = normalize_index(index, items.len())?;
            Ok(items.remove(idx))
        }
        (Value::List(items), "contains") => {
            let [x] = exactly(method, args)?;
            let found = items.borrow().iter().any(|v| values_equal(v, &x));
            Ok(Value::Bool(found))
        }
        (Value::Dict(entries), "get") => {
            arity(method, &args, 1, 2)?;
            let key = DictKey::from_value(&args[0])?;
            let found = entries.borrow().get(&key).cloned();
            Ok(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
        }
        (Value::Dict(entries), "keys") => {
            exactly::<0>(method, args)?;
            Ok(Value::list(entries.borrow().keys().map(DictKey::to_value).collect()))
        }
        (Value::Dict(entries), "values") => {
            exactly::<0>(method, args)?;
            Ok(Value::list(entries.borrow().values().cloned().collect()))
        }
        (Value::Dict(entries), "items") => {
            exactly::<0>(method, args)?;
            Ok(Value::list(
                entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| Value::list(vec![k.to_value(), v.clone()]))
                    .collect(),
            ))
        }
        (Value::Str(s), "upper") => {
            exactly::<0>(method, args)?;
            Ok(Value::str(&s.to_uppercase()))
        }
        (Value::Str(s), "lower") => {
            exactly::<0>(method, args)?;
            Ok(Value::str(&s.to_lowercase()))
        }
        (Value::Str(s), "startswith") => {
            let [prefix] = exactly(method, args)?;
            let prefix = string(method, Some(prefix))?;
            Ok(Value::Bool(s.starts_with(prefix.as_str())))
        }
        (other, _) => Err(ScriptError::NoAttribute {
            type_name: other.type_name(),
            attr: method.to_string(),
        }),
    }
}

pub fn snapshot_attribute(snapshot: &MarketSnapshot, name: &str) -> Option<Value> {
    let value = match name {
        "available_balance" => Value::Float(snapshot.available_balance),
        "total_equity" => Value::Float(snapshot.total_equity),
        "trigger_symbol" => Value::str(&snapshot.trigger_symbol),
        "trigger_type" => Value::str(&snapshot.trigger_type),
        "prices" => Value::float_map(&snapshot.prices),
        "positions" => Value::dict(
            snapshot
                .positions
                .iter()
                .map(|(symbol, position)| {
                    (
                        DictKey::Str(Rc::from(symbol.as_str())),
                        Value::record(Record::Position(position.clone())),
                    )
                })
                .collect(),
        ),
        _ => return None,
    };
    Some(value)
}

fn snapshot_method(
    snapshot: &MarketSnapshot,
    method: &str,
    args: Vec<Value>,
    keywords: Keywords,
) -> Result<Value, ScriptError> {
    match method {
        "get_klines" => {
            let slots = bind_arguments(method, &["symbol", "period", "count"], 2, args, keywords)?;
            let mut slots = slots.into_iter();
            let symbol = string(method, slots.next().flatten())?;
            let period = string(method, slots.next().flatten())?;
            let count = match slots.next().flatten() {
                None => DEFAULT_KLINE_COUNT,
                Some(Value::Int(n)) if n >= 0 => n as usize,
                Some(other) => {
                    return Err(ScriptError::bad_args(
                        method,
                        format!("count must be a non-negative int, got {}", other.repr()),
                    ))
                }
            };
            let bars = snapshot.data.get_klines(&symbol, &period, count);
            Ok(Value::list(
                bars.into_iter()
                    .map(|k| Value::record(Record::Kline(k)))
                    .collect(),
            ))
        }
        "get_indicator" | "get_flow" => {
            let name_param = if method == "get_indicator" { "indicator" } else { "metric" };
            let slots = bind_arguments(method, &["symbol", name_param, "period"], 3, args, keywords)?;
            let mut slots = slots.into_iter();
            let symbol = string(method, slots.next().flatten())?;
            let name = string(method, slots.next().flatten())?;
            let period = string(method, slots.next().flatten())?;
            let values = if method == "get_indicator" {
                snapshot.data.get_indicator(&symbol, &name, &period)
            } else {
                snapshot.data.get_flow(&symbol, &name, &period)
            };
            Ok(Value::float_map(&values))
        }
        "get_regime" | "get_price_change" => {
            let slots = bind_arguments(method, &["symbol", "period"], 2, args, keywords)?;
            let mut slots = slots.into_iter();
            let symbol = string(method, slots.next().flatten())?;
            let period = string(method, slots.next().flatten())?;
            let record = if method == "get_regime" {
                Record::Regime(snapshot.data.get_regime(&symbol, &period))
            } else {
                Record::PriceChange(snapshot.data.get_price_change(&symbol, &period))
            };
            Ok(Value::record(record))
        }
        other => Err(ScriptError::NoAttribute {
            type_name: "MarketSnapshot".to_string(),
            attr: other.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// `Decision(...)`: keyword arguments only, `action` is accepted for
/// `operation`.
pub fn make_decision(args: Vec<Value>, keywords: Keywords) -> Result<Value, ScriptError> {
    if !args.is_empty() {
        return Err(ScriptError::bad_args(
            "Decision",
            "accepts keyword arguments only",
        ));
    }
    let mut decision = Decision::default();
    for (key, value) in keywords {
        if !set_decision_field(&mut decision, &key, value)? {
            return Err(ScriptError::bad_args(
                "Decision",
                format!("got an unexpected keyword argument '{}'", key),
            ));
        }
    }
    Ok(Value::Decision(Rc::new(RefCell::new(decision))))
}

pub fn decision_field(decision: &Decision, name: &str) -> Option<Value> {
    let optional = |v: Option<f64>| v.map(Value::Float).unwrap_or(Value::None);
    let value = match name {
        "operation" | "action" => Value::str(&decision.operation),
        "symbol" => Value::str(&decision.symbol),
        "target_portion_of_balance" => Value::Float(decision.target_portion_of_balance),
        "leverage" => Value::Int(decision.leverage),
        "max_price" => optional(decision.max_price),
        "min_price" => optional(decision.min_price),
        "time_in_force" => Value::str(&decision.time_in_force),
        "tp_execution" => Value::str(&decision.tp_execution),
        "sl_execution" => Value::str(&decision.sl_execution),
        "reason" => Value::str(&decision.reason),
        "size_usd" => optional(decision.size_usd),
        _ => return None,
    };
    Some(value)
}

/// Returns `false` when `field` is not a Decision field.
pub fn set_decision_field(decision: &mut Decision, field: &str, value: Value) -> Result<bool, ScriptError> {
    let mismatch = |expected: &str, value: &Value| {
        ScriptError::type_mismatch(format!(
            "Decision.{} must be {}, got {}",
            field,
            expected,
            value.type_name()
        ))
    };
    let text = |value: Value| match value {
        Value::Str(s) => Ok(s.to_string()),
        other => Err(mismatch("str", &other)),
    };
    let optional_number = |value: Value| match value {
        Value::None => Ok(None),
        other => other.as_f64().map(Some).ok_or_else(|| mismatch("a number", &other)),
    };

    match field {
        "operation" | "action" => decision.operation = text(value)?,
        "symbol" => decision.symbol = text(value)?,
        "time_in_force" => decision.time_in_force = text(value)?,
        "tp_execution" => decision.tp_execution = text(value)?,
        "sl_execution" => decision.sl_execution = text(value)?,
        "reason" => decision.reason = text(value)?,
        "target_portion_of_balance" => {
            decision.target_portion_of_balance =
                value.as_f64().ok_or_else(|| mismatch("a number", &value))?
        }
        "leverage" => {
            decision.leverage = match value {
                Value::Int(i) => i,
                Value::Float(f) if f.fract() == 0.0 => float_to_int(f)?,
                other => return Err(mismatch("an int", &other)),
            }
        }
        "max_price" => decision.max_price = optional_number(value)?,
        "min_price" => decision.min_price = optional_number(value)?,
        "size_usd" => decision.size_usd = optional_number(value)?,
        _ => return Ok(false),
    }
    Ok(true)
}
