use crate::cidr::Cidr;
use crate::language::types::{LiteralType, LiteralValue};
use crate::regexp::RegExp;
use std::fmt;
use std::net::IpAddr;
use std::rc::Rc;

/// A value on the VM stack, in the globals vector or in a native-call
/// frame. Arrays are constant-pool payloads shared by reference.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Void,
    Boolean(bool),
    Number(i64),
    String(String),
    IPAddress(IpAddr),
    Cidr(Cidr),
    RegExp(RegExp),
    IntArray(Rc<Vec<i64>>),
    StringArray(Rc<Vec<String>>),
    IPAddrArray(Rc<Vec<IpAddr>>),
    CidrArray(Rc<Vec<Cidr>>),
    Handler(usize),
}

impl Value {
    pub fn ty(&self) -> LiteralType {
        match self {
            Value::Void => LiteralType::Void,
            Value::Boolean(_) => LiteralType::Boolean,
            Value::Number(_) => LiteralType::Number,
            Value::String(_) => LiteralType::String,
            Value::IPAddress(_) => LiteralType::IPAddress,
            Value::Cidr(_) => LiteralType::Cidr,
            Value::RegExp(_) => LiteralType::RegExp,
            Value::IntArray(_) => LiteralType::IntArray,
            Value::StringArray(_) => LiteralType::StringArray,
            Value::IPAddrArray(_) => LiteralType::IPAddrArray,
            Value::CidrArray(_) => LiteralType::CidrArray,
            Value::Handler(_) => LiteralType::Handler,
        }
    }

    /// Booleans and numbers are interchangeable truth carriers at the VM
    /// level; everything else is false.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0,
            _ => false,
        }
    }

    pub fn as_number(&self) -> i64 {
        match self {
            Value::Number(n) => *n,
            Value::Boolean(b) => i64::from(*b),
            _ => 0,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<IpAddr> for Value {
    fn from(v: IpAddr) -> Self {
        Value::IPAddress(v)
    }
}

impl From<Cidr> for Value {
    fn from(v: Cidr) -> Self {
        Value::Cidr(v)
    }
}

impl From<RegExp> for Value {
    fn from(v: RegExp) -> Self {
        Value::RegExp(v)
    }
}

impl From<&LiteralValue> for Value {
    fn from(v: &LiteralValue) -> Self {
        match v {
            LiteralValue::Boolean(b) => Value::Boolean(*b),
            LiteralValue::Number(n) => Value::Number(*n),
            LiteralValue::String(s) => Value::String(s.clone()),
            LiteralValue::IPAddress(ip) => Value::IPAddress(*ip),
            LiteralValue::Cidr(c) => Value::Cidr(*c),
            LiteralValue::RegExp(r) => Value::RegExp(r.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("(void)"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Number(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
            Value::IPAddress(v) => write!(f, "{}", v),
            Value::Cidr(v) => write!(f, "{}", v),
            Value::RegExp(v) => write!(f, "{}", v),
            Value::IntArray(v) => write!(f, "{:?}", v),
            Value::StringArray(v) => write!(f, "{:?}", v),
            Value::IPAddrArray(v) => {
                let items: Vec<String> = v.iter().map(|ip| ip.to_string()).collect();
                write!(f, "{:?}", items)
            }
            Value::CidrArray(v) => {
                let items: Vec<String> = v.iter().map(|c| c.to_string()).collect();
                write!(f, "{:?}", items)
            }
            Value::Handler(id) => write!(f, "handler#{}", id),
        }
    }
}
