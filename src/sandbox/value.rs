//! Runtime values of the strategy interpreter.
//!
//! Values are single-threaded (`Rc`/`RefCell`): one evaluation runs on one
//! worker and nothing it creates outlives it.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use super::ast::FunctionDef;
use crate::constants::sandbox::MAX_COLLECTION_LEN;
use crate::error::ScriptError;
use crate::models::{Decision, Kline, MarketSnapshot, ParamValue, Position, PriceChange, RegimeInfo};

/// Containers nested deeper than this are printed as `...`.
const MAX_DISPLAY_DEPTH: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DictKey {
    Bool(bool),
    Int(i64),
    Str(Rc<str>),
}

impl DictKey {
    pub fn from_value(value: &Value) -> Result<Self, ScriptError> {
        match value {
            Value::Bool(b) => Ok(DictKey::Bool(*b)),
            Value::Int(i) => Ok(DictKey::Int(*i)),
            Value::Str(s) => Ok(DictKey::Str(s.clone())),
            other => Err(ScriptError::type_mismatch(format!(
                "unhashable type: '{}'",
                other.type_name()
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DictKey::Bool(b) => Value::Bool(*b),
            DictKey::Int(i) => Value::Int(*i),
            DictKey::Str(s) => Value::Str(s.clone()),
        }
    }
}

pub type Dict = BTreeMap<DictKey, Value>;

#[derive(Debug)]
pub struct ClassValue {
    pub name: String,
    pub methods: HashMap<String, Rc<FunctionDef>>,
}

#[derive(Debug)]
pub struct Instance {
    pub class: Rc<ClassValue>,
    pub fields: RefCell<HashMap<String, Value>>,
}

impl Instance {
    pub fn new(class: Rc<ClassValue>) -> Self {
        Self {
            class,
            fields: RefCell::new(HashMap::new()),
        }
    }
}

/// Read-only views over host records.
#[derive(Clone, Debug)]
pub enum Record {
    Position(Position),
    Kline(Kline),
    Regime(RegimeInfo),
    PriceChange(PriceChange),
}

impl Record {
    pub fn type_name(&self) -> &'static str {
        match self {
            Record::Position(_) => "Position",
            Record::Kline(_) => "Kline",
            Record::Regime(_) => "RegimeInfo",
            Record::PriceChange(_) => "PriceChange",
        }
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        let value = match (self, name) {
            (Record::Position(p), "symbol") => Value::str(&p.symbol),
            (Record::Position(p), "side") => Value::str(p.side.as_str()),
            (Record::Position(p), "size") => Value::Float(p.size),
            (Record::Position(p), "entry_price") => Value::Float(p.entry_price),
            (Record::Position(p), "unrealized_pnl") => Value::Float(p.unrealized_pnl),
            (Record::Position(p), "leverage") => Value::Int(p.leverage),
            (Record::Position(p), "liquidation_price") => Value::Float(p.liquidation_price),
            (Record::Kline(k), "timestamp") => Value::Int(k.timestamp),
            (Record::Kline(k), "open") => Value::Float(k.open),
            (Record::Kline(k), "high") => Value::Float(k.high),
            (Record::Kline(k), "low") => Value::Float(k.low),
            (Record::Kline(k), "close") => Value::Float(k.close),
            (Record::Kline(k), "volume") => k.volume.map(Value::Float).unwrap_or(Value::None),
            (Record::Regime(r), "regime") => Value::str(&r.regime),
            (Record::Regime(r), "conf") => Value::Float(r.conf),
            (Record::PriceChange(c), "change_percent") => Value::Float(c.change_percent),
            (Record::PriceChange(c), "change_usd") => Value::Float(c.change_usd),
            _ => return None,
        };
        Some(value)
    }
}

#[derive(Clone, Debug)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Dict(Rc<RefCell<Dict>>),
    Class(Rc<ClassValue>),
    Instance(Rc<Instance>),
    Function(Rc<FunctionDef>),
    BoundMethod {
        receiver: Rc<Instance>,
        method: Rc<FunctionDef>,
    },
    /// Method of a builtin value (`list.append`, `data.get_klines`, ...)
    BoundNative {
        receiver: Box<Value>,
        method: &'static str,
    },
    Builtin(&'static str),
    MathFunction(&'static str),
    Module(&'static str),
    /// Pre-bound vocabulary type such as `Decision` or `ActionType`
    Vocabulary(&'static str),
    Decision(Rc<RefCell<Decision>>),
    Snapshot(Rc<MarketSnapshot>),
    Record(Rc<Record>),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn dict(entries: Dict) -> Value {
        Value::Dict(Rc::new(RefCell::new(entries)))
    }

    pub fn record(record: Record) -> Value {
        Value::Record(Rc::new(record))
    }

    pub fn float_map(map: &HashMap<String, f64>) -> Value {
        Value::dict(
            map.iter()
                .map(|(k, v)| (DictKey::Str(Rc::from(k.as_str())), Value::Float(*v)))
                .collect(),
        )
    }

    pub fn from_param(param: &ParamValue) -> Value {
        match param {
            ParamValue::Bool(b) => Value::Bool(*b),
            ParamValue::Int(i) => Value::Int(*i),
            ParamValue::Float(f) => Value::Float(*f),
            ParamValue::Str(s) => Value::str(s),
        }
    }

    pub fn type_name(&self) -> String {
        let name = match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Class(_) | Value::Vocabulary(_) => "type",
            Value::Instance(inst) => return inst.class.name.clone(),
            Value::Function(_) => "function",
            Value::BoundMethod { .. } => "method",
            Value::BoundNative { .. } | Value::Builtin(_) | Value::MathFunction(_) => {
                "builtin_function"
            }
            Value::Module(_) => "module",
            Value::Decision(_) => "Decision",
            Value::Snapshot(_) => "MarketSnapshot",
            Value::Record(r) => r.type_name(),
        };
        name.to_string()
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Dict(entries) => !entries.borrow().is_empty(),
            _ => true,
        }
    }

    /// Numeric view; bools are not numbers here.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Items of anything `for` can walk: lists, dict keys, string characters.
    pub fn iter_items(&self) -> Result<Vec<Value>, ScriptError> {
        match self {
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Dict(entries) => Ok(entries.borrow().keys().map(DictKey::to_value).collect()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::str(&c.to_string())).collect()),
            other => Err(ScriptError::type_mismatch(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    /// Quoted form used inside containers and error messages.
    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.render(&mut out, true, 0);
        out
    }

    fn render(&self, out: &mut String, quoted: bool, depth: usize) {
        if depth > MAX_DISPLAY_DEPTH || out.len() > MAX_COLLECTION_LEN {
            out.push_str("...");
            return;
        }
        match self {
            Value::None => out.push_str("none"),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::Float(f) => out.push_str(&format_float(*f)),
            Value::Str(s) if quoted => out.push_str(&format!("{:?}", s.as_ref())),
            Value::Str(s) => out.push_str(s),
            Value::List(items) => {
                out.push('[');
                for (i, item) in items.borrow().iter().enumerate() {
                    if out.len() > MAX_COLLECTION_LEN {
                        out.push_str(", ...");
                        break;
                    }
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.render(out, true, depth + 1);
                }
                out.push(']');
            }
            Value::Dict(entries) => {
                out.push('{');
                for (i, (key, value)) in entries.borrow().iter().enumerate() {
                    if out.len() > MAX_COLLECTION_LEN {
                        out.push_str(", ...");
                        break;
                    }
                    if i > 0 {
                        out.push_str(", ");
                    }
                    key.to_value().render(out, true, depth + 1);
                    out.push_str(": ");
                    value.render(out, true, depth + 1);
                }
                out.push('}');
            }
            Value::Class(class) => out.push_str(&format!("<class {}>", class.name)),
            Value::Instance(inst) => out.push_str(&format!("<{} instance>", inst.class.name)),
            Value::Function(func) => out.push_str(&format!("<function {}>", func.name)),
            Value::BoundMethod { receiver, method } => out.push_str(&format!(
                "<method {}.{}>",
                receiver.class.name, method.name
            )),
            Value::BoundNative { receiver, method } => out.push_str(&format!(
                "<method {}.{}>",
                receiver.type_name(),
                method
            )),
            Value::Builtin(name) => out.push_str(&format!("<builtin {}>", name)),
            Value::MathFunction(name) => out.push_str(&format!("<builtin math.{}>", name)),
            Value::Module(name) => out.push_str(&format!("<module {}>", name)),
            Value::Vocabulary(name) => out.push_str(&format!("<type {}>", name)),
            Value::Decision(decision) => {
                let d = decision.borrow();
                out.push_str(&format!(
                    "Decision(operation={:?}, symbol={:?}, target_portion_of_balance={}, leverage={})",
                    d.operation,
                    d.symbol,
                    format_float(d.target_portion_of_balance),
                    d.leverage
                ));
            }
            Value::Snapshot(snapshot) => out.push_str(&format!(
                "<MarketSnapshot {} {}>",
                snapshot.trigger_symbol, snapshot.trigger_type
            )),
            Value::Record(record) => out.push_str(&format!("<{}>", record.type_name())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.render(&mut out, false, 0);
        f.write_str(&out)
    }
}

pub fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

/// Structural equality with int/float cross-comparison.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    equal_at(a, b, 0)
}

fn equal_at(a: &Value, b: &Value, depth: usize) -> bool {
    if depth > MAX_DISPLAY_DEPTH {
        return false;
    }
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            a.as_f64() == b.as_f64()
        }
        (Value::List(x), Value::List(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| equal_at(l, r, depth + 1))
        }
        (Value::Dict(x), Value::Dict(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter().zip(y.iter()).all(|((lk, lv), (rk, rv))| {
                    lk == rk && equal_at(lv, rv, depth + 1)
                })
        }
        (Value::Instance(x), Value::Instance(y)) => Rc::ptr_eq(x, y),
        (Value::Class(x), Value::Class(y)) => Rc::ptr_eq(x, y),
        (Value::Decision(x), Value::Decision(y)) => *x.borrow() == *y.borrow(),
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        (Value::MathFunction(x), Value::MathFunction(y)) => x == y,
        (Value::Vocabulary(x), Value::Vocabulary(y)) => x == y,
        _ => false,
    }
}
