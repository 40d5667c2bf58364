use crate::cidr::Cidr;
use crate::language::types::{LiteralType, LiteralValue};
use crate::regexp::RegExp;
use crate::vm::value::Value;
use std::any::Any;
use std::fmt;
use std::net::IpAddr;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallableKind {
    Function { ret: LiteralType },
    Handler,
}

#[derive(Clone, Debug)]
pub struct ParamDecl {
    pub name: String,
    pub ty: LiteralType,
    pub default: Option<LiteralValue>,
}

/// Declaration half of a native callback: everything the parser needs for
/// overload resolution, independent of the bound closure.
#[derive(Clone, Debug)]
pub struct CallableDecl {
    pub name: String,
    pub kind: CallableKind,
    pub params: Vec<ParamDecl>,
    pub experimental: bool,
}

impl CallableDecl {
    pub fn is_handler(&self) -> bool {
        matches!(self.kind, CallableKind::Handler)
    }

    pub fn return_type(&self) -> LiteralType {
        match self.kind {
            CallableKind::Function { ret } => ret,
            CallableKind::Handler => LiteralType::Boolean,
        }
    }

    pub fn find_param(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    pub fn signature(&self) -> Signature {
        Signature {
            name: self.name.clone(),
            args: self.params.iter().map(|p| p.ty).collect(),
            ret: self.return_type(),
        }
    }
}

/// A callable's shape, used as the linking key between compiled bytecode
/// and registered natives.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Signature {
    pub name: String,
    pub args: Vec<LiteralType>,
    pub ret: LiteralType,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for arg in &self.args {
            write!(f, "{}", arg.signature_code())?;
        }
        write!(f, "){}", self.ret.signature_code())
    }
}

/// Argument view handed to a native callback. Slot 0 is the result slot;
/// arguments are indexed from 1 in declaration order.
pub struct Params<'a> {
    values: &'a mut [Value],
    userdata: Option<&'a mut dyn Any>,
}

impl<'a> Params<'a> {
    pub fn new(values: &'a mut [Value], userdata: Option<&'a mut dyn Any>) -> Self {
        Self { values, userdata }
    }

    pub fn count(&self) -> usize {
        self.values.len().saturating_sub(1)
    }

    pub fn get(&self, index: usize) -> &Value {
        &self.values[index]
    }

    pub fn get_bool(&self, index: usize) -> bool {
        self.values[index].truthy()
    }

    pub fn get_number(&self, index: usize) -> i64 {
        self.values[index].as_number()
    }

    pub fn get_string(&self, index: usize) -> &str {
        match &self.values[index] {
            Value::String(s) => s,
            other => panic!("native argument {} is {}, not a string", index, other.ty()),
        }
    }

    pub fn get_ip(&self, index: usize) -> IpAddr {
        match &self.values[index] {
            Value::IPAddress(ip) => *ip,
            other => panic!("native argument {} is {}, not an ip", index, other.ty()),
        }
    }

    pub fn get_cidr(&self, index: usize) -> Cidr {
        match &self.values[index] {
            Value::Cidr(cidr) => *cidr,
            other => panic!("native argument {} is {}, not a cidr", index, other.ty()),
        }
    }

    pub fn get_regexp(&self, index: usize) -> &RegExp {
        match &self.values[index] {
            Value::RegExp(re) => re,
            other => panic!("native argument {} is {}, not a regexp", index, other.ty()),
        }
    }

    pub fn get_int_array(&self, index: usize) -> &Rc<Vec<i64>> {
        match &self.values[index] {
            Value::IntArray(a) => a,
            other => panic!("native argument {} is {}, not an int[]", index, other.ty()),
        }
    }

    pub fn get_string_array(&self, index: usize) -> &Rc<Vec<String>> {
        match &self.values[index] {
            Value::StringArray(a) => a,
            other => panic!("native argument {} is {}, not a string[]", index, other.ty()),
        }
    }

    pub fn get_handler(&self, index: usize) -> usize {
        match &self.values[index] {
            Value::Handler(id) => *id,
            other => panic!("native argument {} is {}, not a handler", index, other.ty()),
        }
    }

    pub fn set_result(&mut self, value: impl Into<Value>) {
        self.values[0] = value.into();
    }

    pub fn result(&self) -> &Value {
        &self.values[0]
    }

    /// Host-side per-run state, downcast to the concrete type the host
    /// passed into `run_with`.
    pub fn userdata<T: Any>(&mut self) -> Option<&mut T> {
        self.userdata.as_mut()?.downcast_mut::<T>()
    }
}

type NativeFn = Box<dyn Fn(&mut Params)>;

pub struct NativeCallback {
    pub decl: CallableDecl,
    callback: Option<NativeFn>,
}

impl NativeCallback {
    pub fn signature(&self) -> Signature {
        self.decl.signature()
    }

    pub fn is_bound(&self) -> bool {
        self.callback.is_some()
    }

    pub fn invoke(&self, params: &mut Params) {
        if let Some(callback) = &self.callback {
            callback(params);
        }
    }
}

/// Registry of host-provided native functions and handlers.
#[derive(Default)]
pub struct Runtime {
    natives: Vec<NativeCallback>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function(&mut self, name: &str, ret: LiteralType) -> NativeBuilder<'_> {
        self.register(CallableDecl {
            name: name.to_string(),
            kind: CallableKind::Function { ret },
            params: Vec::new(),
            experimental: false,
        })
    }

    pub fn register_handler(&mut self, name: &str) -> NativeBuilder<'_> {
        self.register(CallableDecl {
            name: name.to_string(),
            kind: CallableKind::Handler,
            params: Vec::new(),
            experimental: false,
        })
    }

    fn register(&mut self, decl: CallableDecl) -> NativeBuilder<'_> {
        self.natives.push(NativeCallback {
            decl,
            callback: None,
        });
        NativeBuilder {
            native: self.natives.last_mut().unwrap(),
        }
    }

    pub fn natives(&self) -> &[NativeCallback] {
        &self.natives
    }

    pub fn native(&self, index: usize) -> &NativeCallback {
        &self.natives[index]
    }

    /// Resolves a compiled signature against the registry; handlers and
    /// functions never shadow each other.
    pub fn find(&self, signature: &Signature, handler: bool) -> Option<usize> {
        self.natives
            .iter()
            .position(|n| n.decl.is_handler() == handler && n.signature() == *signature)
    }
}

/// Fluent declaration builder returned by the `register_*` calls.
pub struct NativeBuilder<'a> {
    native: &'a mut NativeCallback,
}

impl<'a> NativeBuilder<'a> {
    pub fn param<T: FlowType>(self, name: &str) -> Self {
        self.native.decl.params.push(ParamDecl {
            name: name.to_string(),
            ty: T::literal_type(),
            default: None,
        });
        self
    }

    pub fn param_with_default<T: FlowDefault>(self, name: &str, value: T) -> Self {
        self.native.decl.params.push(ParamDecl {
            name: name.to_string(),
            ty: T::literal_type(),
            default: Some(value.into_literal()),
        });
        self
    }

    pub fn experimental(self) -> Self {
        self.native.decl.experimental = true;
        self
    }

    pub fn bind(self, callback: impl Fn(&mut Params) + 'static) {
        self.native.callback = Some(Box::new(callback));
    }
}

/// Rust types usable as native parameter types.
pub trait FlowType {
    fn literal_type() -> LiteralType;
}

/// Rust types additionally usable as parameter default values.
pub trait FlowDefault: FlowType {
    fn into_literal(self) -> LiteralValue;
}

impl FlowType for bool {
    fn literal_type() -> LiteralType {
        LiteralType::Boolean
    }
}

impl FlowDefault for bool {
    fn into_literal(self) -> LiteralValue {
        LiteralValue::Boolean(self)
    }
}

impl FlowType for i64 {
    fn literal_type() -> LiteralType {
        LiteralType::Number
    }
}

impl FlowDefault for i64 {
    fn into_literal(self) -> LiteralValue {
        LiteralValue::Number(self)
    }
}

impl FlowType for String {
    fn literal_type() -> LiteralType {
        LiteralType::String
    }
}

impl FlowDefault for String {
    fn into_literal(self) -> LiteralValue {
        LiteralValue::String(self)
    }
}

impl FlowType for &str {
    fn literal_type() -> LiteralType {
        LiteralType::String
    }
}

impl FlowDefault for &str {
    fn into_literal(self) -> LiteralValue {
        LiteralValue::String(self.to_string())
    }
}

impl FlowType for IpAddr {
    fn literal_type() -> LiteralType {
        LiteralType::IPAddress
    }
}

impl FlowDefault for IpAddr {
    fn into_literal(self) -> LiteralValue {
        LiteralValue::IPAddress(self)
    }
}

impl FlowType for Cidr {
    fn literal_type() -> LiteralType {
        LiteralType::Cidr
    }
}

impl FlowDefault for Cidr {
    fn into_literal(self) -> LiteralValue {
        LiteralValue::Cidr(self)
    }
}

impl FlowType for RegExp {
    fn literal_type() -> LiteralType {
        LiteralType::RegExp
    }
}

impl FlowDefault for RegExp {
    fn into_literal(self) -> LiteralValue {
        LiteralValue::RegExp(self)
    }
}

impl FlowType for Vec<i64> {
    fn literal_type() -> LiteralType {
        LiteralType::IntArray
    }
}

impl FlowType for Vec<String> {
    fn literal_type() -> LiteralType {
        LiteralType::StringArray
    }
}

impl FlowType for Vec<IpAddr> {
    fn literal_type() -> LiteralType {
        LiteralType::IPAddrArray
    }
}

impl FlowType for Vec<Cidr> {
    fn literal_type() -> LiteralType {
        LiteralType::CidrArray
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_rendering() {
        let mut runtime = Runtime::new();
        runtime
            .register_function("print", LiteralType::Void)
            .param::<String>("text")
            .bind(|_| {});
        assert_eq!(runtime.native(0).signature().to_string(), "print(S)V");
    }

    #[test]
    fn find_distinguishes_functions_from_handlers() {
        let mut runtime = Runtime::new();
        runtime.register_handler("pass").bind(|p| p.set_result(true));
        let sig = runtime.native(0).signature();
        assert_eq!(runtime.find(&sig, true), Some(0));
        assert_eq!(runtime.find(&sig, false), None);
    }

    #[test]
    fn params_view_is_one_indexed() {
        let mut values = vec![Value::Void, Value::Number(7), Value::String("x".into())];
        let mut params = Params::new(&mut values, None);
        assert_eq!(params.count(), 2);
        assert_eq!(params.get_number(1), 7);
        assert_eq!(params.get_string(2), "x");
        params.set_result(true);
        assert_eq!(params.result(), &Value::Boolean(true));
    }

    #[test]
    fn defaults_are_recorded_on_the_declaration() {
        let mut runtime = Runtime::new();
        runtime
            .register_function("limit", LiteralType::Void)
            .param_with_default::<i64>("max", 10)
            .bind(|_| {});
        let decl = &runtime.native(0).decl;
        assert_eq!(decl.params[0].default, Some(LiteralValue::Number(10)));
    }
}
