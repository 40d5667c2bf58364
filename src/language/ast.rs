use crate::language::span::SourceLocation;
use crate::language::symbols::{ScopeId, SymbolId, SymbolKind, SymbolTable};
use crate::language::types::{LiteralType, LiteralValue, MatchClass};
use crate::vm::instruction::Opcode;
use crate::vm::runtime::CallableKind;

/// One parsed translation unit: the global scope plus imported module
/// names. Handlers and global variables live in the symbol table.
#[derive(Debug)]
pub struct Unit {
    pub scope: ScopeId,
    pub modules: Vec<(String, String)>,
}

#[derive(Clone, Debug)]
pub enum Expr {
    Unary {
        op: Opcode,
        sub: Box<Expr>,
        location: SourceLocation,
    },
    Binary {
        op: Opcode,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        location: SourceLocation,
    },
    Call {
        callee: SymbolId,
        args: ParamList,
        location: SourceLocation,
    },
    RegExpGroup {
        group: i64,
        location: SourceLocation,
    },
    Variable {
        symbol: SymbolId,
        location: SourceLocation,
    },
    HandlerRef {
        symbol: SymbolId,
        location: SourceLocation,
    },
    Literal {
        value: LiteralValue,
        location: SourceLocation,
    },
    Array {
        elements: Vec<Expr>,
        location: SourceLocation,
    },
}

impl Expr {
    pub fn literal(value: LiteralValue, location: SourceLocation) -> Self {
        Expr::Literal { value, location }
    }

    pub fn location(&self) -> &SourceLocation {
        match self {
            Expr::Unary { location, .. }
            | Expr::Binary { location, .. }
            | Expr::Call { location, .. }
            | Expr::RegExpGroup { location, .. }
            | Expr::Variable { location, .. }
            | Expr::HandlerRef { location, .. }
            | Expr::Literal { location, .. }
            | Expr::Array { location, .. } => location,
        }
    }

    pub fn set_location(&mut self, new: SourceLocation) {
        match self {
            Expr::Unary { location, .. }
            | Expr::Binary { location, .. }
            | Expr::Call { location, .. }
            | Expr::RegExpGroup { location, .. }
            | Expr::Variable { location, .. }
            | Expr::HandlerRef { location, .. }
            | Expr::Literal { location, .. }
            | Expr::Array { location, .. } => *location = new,
        }
    }

    /// The static type of this expression. Operators carry their VM opcode,
    /// so the result type falls out of the opcode; everything else comes
    /// from the literal payload or the referenced symbol.
    pub fn ty(&self, symbols: &SymbolTable) -> LiteralType {
        match self {
            Expr::Unary { op, .. } | Expr::Binary { op, .. } => op.result_type(),
            Expr::Call { callee, .. } => match &symbols.symbol(*callee).kind {
                SymbolKind::BuiltinFunction { decl, .. } => match decl.kind {
                    CallableKind::Function { ret } => ret,
                    CallableKind::Handler => LiteralType::Boolean,
                },
                SymbolKind::BuiltinHandler { .. } | SymbolKind::Handler { .. } => {
                    LiteralType::Boolean
                }
                _ => LiteralType::Void,
            },
            Expr::RegExpGroup { .. } => LiteralType::String,
            Expr::Variable { symbol, .. } => match &symbols.symbol(*symbol).kind {
                SymbolKind::Variable { initializer } => initializer.ty(symbols),
                _ => LiteralType::Void,
            },
            Expr::HandlerRef { .. } => LiteralType::Handler,
            Expr::Literal { value, .. } => value.ty(),
            Expr::Array { elements, .. } => elements
                .first()
                .map(|e| e.ty(symbols).array_of().unwrap_or(LiteralType::Void))
                .unwrap_or(LiteralType::Void),
        }
    }
}

#[derive(Debug)]
pub enum Stmt {
    Expr {
        expr: Expr,
        location: SourceLocation,
    },
    Compound {
        body: Vec<Stmt>,
        location: SourceLocation,
    },
    Cond {
        condition: Expr,
        then_stmt: Box<Stmt>,
        else_stmt: Option<Box<Stmt>>,
        location: SourceLocation,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
        location: SourceLocation,
    },
    Match {
        condition: Expr,
        op: MatchClass,
        cases: Vec<MatchCase>,
        else_stmt: Option<Box<Stmt>>,
        location: SourceLocation,
    },
    Assign {
        variable: SymbolId,
        expr: Expr,
        location: SourceLocation,
    },
}

impl Stmt {
    pub fn location(&self) -> &SourceLocation {
        match self {
            Stmt::Expr { location, .. }
            | Stmt::Compound { location, .. }
            | Stmt::Cond { location, .. }
            | Stmt::While { location, .. }
            | Stmt::Match { location, .. }
            | Stmt::Assign { location, .. } => location,
        }
    }
}

#[derive(Debug)]
pub struct MatchCase {
    pub labels: Vec<Expr>,
    pub body: Stmt,
}

/// Call arguments; either all positional or all named.
#[derive(Clone, Debug, Default)]
pub struct ParamList {
    named: bool,
    names: Vec<String>,
    values: Vec<Expr>,
}

impl ParamList {
    pub fn new(named: bool) -> Self {
        Self {
            named,
            names: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn push(&mut self, expr: Expr) {
        self.values.push(expr);
    }

    pub fn push_named(&mut self, name: impl Into<String>, expr: Expr) {
        self.names.push(name.into());
        self.values.push(expr);
    }

    pub fn is_named(&self) -> bool {
        self.named
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[Expr] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Expr> {
        self.values
    }

    pub fn arg_types(&self, symbols: &SymbolTable) -> Vec<LiteralType> {
        self.values.iter().map(|e| e.ty(symbols)).collect()
    }

    pub fn location(&self) -> Option<SourceLocation> {
        let first = self.values.first()?.location().clone();
        let last = self.values.last()?.location();
        Some(first.union(last))
    }
}
