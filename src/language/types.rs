use crate::cidr::Cidr;
use crate::regexp::RegExp;
use std::fmt;
use std::net::IpAddr;

/// The fixed set of value types a Flow expression can have.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LiteralType {
    Void,
    Boolean,
    Number,
    String,
    IPAddress,
    Cidr,
    RegExp,
    IntArray,
    StringArray,
    IPAddrArray,
    CidrArray,
    Handler,
}

impl LiteralType {
    /// The array type whose elements have this type, if one exists.
    pub fn array_of(self) -> Option<LiteralType> {
        match self {
            LiteralType::Number => Some(LiteralType::IntArray),
            LiteralType::String => Some(LiteralType::StringArray),
            LiteralType::IPAddress => Some(LiteralType::IPAddrArray),
            LiteralType::Cidr => Some(LiteralType::CidrArray),
            _ => None,
        }
    }

    /// One-letter signature code, used when rendering native signatures.
    pub fn signature_code(self) -> char {
        match self {
            LiteralType::Void => 'V',
            LiteralType::Boolean => 'B',
            LiteralType::Number => 'I',
            LiteralType::String => 'S',
            LiteralType::IPAddress => 'P',
            LiteralType::Cidr => 'C',
            LiteralType::RegExp => 'R',
            LiteralType::IntArray => 'i',
            LiteralType::StringArray => 's',
            LiteralType::IPAddrArray => 'p',
            LiteralType::CidrArray => 'c',
            LiteralType::Handler => 'H',
        }
    }
}

impl fmt::Display for LiteralType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LiteralType::Void => "void",
            LiteralType::Boolean => "bool",
            LiteralType::Number => "int",
            LiteralType::String => "string",
            LiteralType::IPAddress => "ip",
            LiteralType::Cidr => "cidr",
            LiteralType::RegExp => "regexp",
            LiteralType::IntArray => "int[]",
            LiteralType::StringArray => "string[]",
            LiteralType::IPAddrArray => "ip[]",
            LiteralType::CidrArray => "cidr[]",
            LiteralType::Handler => "handler",
        };
        f.write_str(name)
    }
}

/// How a `match` statement compares its condition against case labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchClass {
    Same,
    Head,
    Tail,
    RegExp,
}

impl fmt::Display for MatchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchClass::Same => "==",
            MatchClass::Head => "=^",
            MatchClass::Tail => "=$",
            MatchClass::RegExp => "=~",
        };
        f.write_str(name)
    }
}

/// A decoded literal payload, as produced by the lexer and carried on
/// literal AST nodes and native parameter defaults.
#[derive(Clone, Debug, PartialEq)]
pub enum LiteralValue {
    Boolean(bool),
    Number(i64),
    String(String),
    IPAddress(IpAddr),
    Cidr(Cidr),
    RegExp(RegExp),
}

impl LiteralValue {
    pub fn ty(&self) -> LiteralType {
        match self {
            LiteralValue::Boolean(_) => LiteralType::Boolean,
            LiteralValue::Number(_) => LiteralType::Number,
            LiteralValue::String(_) => LiteralType::String,
            LiteralValue::IPAddress(_) => LiteralType::IPAddress,
            LiteralValue::Cidr(_) => LiteralType::Cidr,
            LiteralValue::RegExp(_) => LiteralType::RegExp,
        }
    }
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiteralValue::Boolean(v) => write!(f, "{}", v),
            LiteralValue::Number(v) => write!(f, "{}", v),
            LiteralValue::String(v) => write!(f, "{:?}", v),
            LiteralValue::IPAddress(v) => write!(f, "{}", v),
            LiteralValue::Cidr(v) => write!(f, "{}", v),
            LiteralValue::RegExp(v) => write!(f, "{}", v),
        }
    }
}
