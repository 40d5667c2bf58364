use crate::diagnostics::Report;
use crate::language::ast::{Expr, MatchCase, ParamList, Stmt, Unit};
use crate::language::lexer::Lexer;
use crate::language::span::SourceLocation;
use crate::language::symbols::{Lookup, ScopeId, Symbol, SymbolId, SymbolKind, SymbolTable};
use crate::language::token::Token;
use crate::language::types::{LiteralType, LiteralValue, MatchClass};
use crate::regexp::RegExp;
use crate::vm::instruction::Opcode;
use crate::vm::runtime::Runtime;
use std::io;
use std::path::Path;

/// Grammar features the host may enable per compilation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feature {
    GlobalScope,
    WhileLoop,
}

pub struct ParsedUnit {
    pub unit: Unit,
    pub symbols: SymbolTable,
}

/// Recursive-descent parser with semantic resolution folded into the
/// reduction steps: operator selection over the fixed type-signature
/// tables, implicit casts, and call overload resolution against the
/// runtime's registered natives.
pub struct Parser<'a> {
    features: Vec<Feature>,
    report: &'a mut dyn Report,
    runtime: Option<&'a Runtime>,
    lexer: Lexer,
    symbols: SymbolTable,
    scope_stack: Vec<ScopeId>,
    lambda_counter: usize,
}

// operand type classes for binary operator selection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OpSig {
    Invalid,
    BoolBool,
    NumNum,
    StringString,
    StringRegexp,
    IpIp,
    IpCidr,
    CidrCidr,
}

fn op_sig(lhs: LiteralType, rhs: LiteralType) -> OpSig {
    use LiteralType::*;
    match (lhs, rhs) {
        (Boolean, Boolean) => OpSig::BoolBool,
        (Number, Number) => OpSig::NumNum,
        (String, String) => OpSig::StringString,
        (String, RegExp) => OpSig::StringRegexp,
        (IPAddress, IPAddress) => OpSig::IpIp,
        (IPAddress, Cidr) => OpSig::IpCidr,
        (Cidr, Cidr) => OpSig::CidrCidr,
        _ => OpSig::Invalid,
    }
}

/// Two-level table `(operand type class, token) -> opcode`. Absence means
/// the operator is not defined for those operand types.
fn binary_operator(token: Token, lhs: LiteralType, rhs: LiteralType) -> Option<Opcode> {
    match (op_sig(lhs, rhs), token) {
        (OpSig::BoolBool, Token::Equal) => Some(Opcode::NCMPEQ),
        (OpSig::BoolBool, Token::UnEqual) => Some(Opcode::NCMPNE),
        (OpSig::BoolBool, Token::And) => Some(Opcode::BAND),
        (OpSig::BoolBool, Token::Or) => Some(Opcode::BOR),
        (OpSig::BoolBool, Token::Xor) => Some(Opcode::BXOR),

        (OpSig::NumNum, Token::Plus) => Some(Opcode::NADD),
        (OpSig::NumNum, Token::Minus) => Some(Opcode::NSUB),
        (OpSig::NumNum, Token::Mul) => Some(Opcode::NMUL),
        (OpSig::NumNum, Token::Div) => Some(Opcode::NDIV),
        (OpSig::NumNum, Token::Mod) => Some(Opcode::NREM),
        (OpSig::NumNum, Token::Pow) => Some(Opcode::NPOW),
        (OpSig::NumNum, Token::Shl) => Some(Opcode::NSHL),
        (OpSig::NumNum, Token::Shr) => Some(Opcode::NSHR),
        (OpSig::NumNum, Token::BitAnd) => Some(Opcode::NAND),
        (OpSig::NumNum, Token::BitOr) => Some(Opcode::NOR),
        (OpSig::NumNum, Token::BitXor) => Some(Opcode::NXOR),
        (OpSig::NumNum, Token::Equal) => Some(Opcode::NCMPEQ),
        (OpSig::NumNum, Token::UnEqual) => Some(Opcode::NCMPNE),
        (OpSig::NumNum, Token::LessOrEqual) => Some(Opcode::NCMPLE),
        (OpSig::NumNum, Token::GreaterOrEqual) => Some(Opcode::NCMPGE),
        (OpSig::NumNum, Token::Less) => Some(Opcode::NCMPLT),
        (OpSig::NumNum, Token::Greater) => Some(Opcode::NCMPGT),
        (OpSig::NumNum, Token::And) => Some(Opcode::NAND),
        (OpSig::NumNum, Token::Or) => Some(Opcode::NOR),
        (OpSig::NumNum, Token::Xor) => Some(Opcode::NXOR),

        (OpSig::StringString, Token::Plus) => Some(Opcode::SADD),
        (OpSig::StringString, Token::Equal) => Some(Opcode::SCMPEQ),
        (OpSig::StringString, Token::UnEqual) => Some(Opcode::SCMPNE),
        (OpSig::StringString, Token::LessOrEqual) => Some(Opcode::SCMPLE),
        (OpSig::StringString, Token::GreaterOrEqual) => Some(Opcode::SCMPGE),
        (OpSig::StringString, Token::Less) => Some(Opcode::SCMPLT),
        (OpSig::StringString, Token::Greater) => Some(Opcode::SCMPGT),
        (OpSig::StringString, Token::PrefixMatch) => Some(Opcode::SCMPBEG),
        (OpSig::StringString, Token::SuffixMatch) => Some(Opcode::SCMPEND),
        (OpSig::StringString, Token::In) => Some(Opcode::SCONTAINS),

        (OpSig::StringRegexp, Token::RegexMatch) => Some(Opcode::SREGMATCH),

        (OpSig::IpIp, Token::Equal) => Some(Opcode::PCMPEQ),
        (OpSig::IpIp, Token::UnEqual) => Some(Opcode::PCMPNE),

        (OpSig::IpCidr, Token::In) => Some(Opcode::PINCIDR),

        // cidr-to-cidr operators never made it into the language
        _ => None,
    }
}

/// One-level table for unary conversions: `(source type, target token)`.
/// `NOP` marks the identity conversion.
fn unary_operator(target: Token, source: LiteralType) -> Option<Opcode> {
    use LiteralType::*;
    match (source, target) {
        (Number, Token::Not) => Some(Opcode::NCMPZ),
        (Number, Token::BitNot) => Some(Opcode::NNOT),
        (Number, Token::Minus) => Some(Opcode::NNEG),
        (Number, Token::StringType) => Some(Opcode::N2S),
        (Number, Token::BoolType) => Some(Opcode::NCMPZ),
        (Number, Token::NumberType) => Some(Opcode::NOP),

        (Boolean, Token::Not) => Some(Opcode::BNOT),
        (Boolean, Token::BoolType) => Some(Opcode::NOP),
        (Boolean, Token::StringType) => Some(Opcode::B2S),

        (String, Token::Not) => Some(Opcode::SISEMPTY),
        (String, Token::NumberType) => Some(Opcode::S2N),
        (String, Token::StringType) => Some(Opcode::NOP),

        (IPAddress, Token::StringType) => Some(Opcode::P2S),
        (Cidr, Token::StringType) => Some(Opcode::C2S),
        (RegExp, Token::StringType) => Some(Opcode::R2S),

        _ => None,
    }
}

const UNITS: &[(&str, i64, i64)] = &[
    ("byte", 1, 1),
    ("kbyte", 1024, 1),
    ("mbyte", 1024 * 1024, 1),
    ("gbyte", 1024 * 1024 * 1024, 1),
    ("tbyte", 1024 * 1024 * 1024 * 1024, 1),
    ("bit", 1, 8),
    ("kbit", 1024, 8),
    ("mbit", 1024 * 1024, 8),
    ("gbit", 1024 * 1024 * 1024, 8),
    ("tbit", 1024 * 1024 * 1024 * 1024, 8),
    ("sec", 1, 1),
    ("min", 60, 1),
    ("hour", 60 * 60, 1),
    ("day", 60 * 60 * 24, 1),
    ("week", 60 * 60 * 24 * 7, 1),
    ("month", 60 * 60 * 24 * 30, 1),
    ("year", 60 * 60 * 24 * 365, 1),
];

impl<'a> Parser<'a> {
    pub fn new(
        features: &[Feature],
        report: &'a mut dyn Report,
        runtime: Option<&'a Runtime>,
    ) -> Self {
        Self {
            features: features.to_vec(),
            report,
            runtime,
            lexer: Lexer::new(),
            symbols: SymbolTable::new(),
            scope_stack: Vec::new(),
            lambda_counter: 0,
        }
    }

    pub fn open_string(&mut self, source: &str) {
        self.lexer.open_string(source, &mut *self.report);
    }

    pub fn open_file(&mut self, path: &Path) -> io::Result<()> {
        self.lexer.open_file(path, &mut *self.report)
    }

    // token plumbing

    fn token(&self) -> Token {
        self.lexer.token()
    }

    fn next_token(&mut self) -> Token {
        self.lexer.next_token(&mut *self.report)
    }

    fn location(&self) -> SourceLocation {
        self.lexer.location()
    }

    fn last_location(&self) -> SourceLocation {
        self.lexer.last_location()
    }

    fn end(&self) -> crate::language::span::FilePos {
        self.lexer.end()
    }

    fn expect(&mut self, token: Token) -> bool {
        if self.token() != token {
            let message = format!(
                "Unexpected token '{}' (expected: '{}')",
                self.token(),
                token
            );
            self.report.syntax_error(self.last_location(), message);
            return false;
        }
        true
    }

    fn consume(&mut self, token: Token) -> bool {
        if !self.expect(token) {
            return false;
        }
        self.next_token();
        true
    }

    fn consume_if(&mut self, token: Token) -> bool {
        if self.token() == token {
            self.next_token();
            true
        } else {
            false
        }
    }

    fn consume_one(&mut self, first: Token, second: Token) -> bool {
        if self.token() == first || self.token() == second {
            self.next_token();
            true
        } else {
            self.expect(first)
        }
    }

    fn consume_until(&mut self, token: Token) -> bool {
        loop {
            if self.token() == token {
                self.next_token();
                return true;
            }
            if self.token() == Token::Eof {
                return false;
            }
            self.next_token();
        }
    }

    fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    // scopes

    fn enter_scope(&mut self, name: &str) -> ScopeId {
        let outer = self.scope_stack.last().copied();
        let id = self.symbols.create_scope(name, outer);
        self.scope_stack.push(id);
        id
    }

    fn leave_scope(&mut self) {
        self.scope_stack.pop();
    }

    fn current_scope(&self) -> ScopeId {
        *self.scope_stack.last().unwrap()
    }

    fn global_scope(&self) -> ScopeId {
        *self.scope_stack.first().unwrap()
    }

    // declarations

    pub fn parse(mut self) -> Option<ParsedUnit> {
        let unit_scope = self.enter_scope("unit");
        self.import_runtime();

        let mut modules = Vec::new();
        while self.token() == Token::Import {
            if !self.import_decl(&mut modules) {
                return None;
            }
        }

        loop {
            match self.token() {
                Token::Eof => break,
                Token::Semicolon => {
                    self.next_token();
                }
                Token::Var => {
                    let location = self.location();
                    match self.var_decl_parts() {
                        Some((name, initializer, decl_location)) => {
                            if self.has_feature(Feature::GlobalScope) {
                                self.symbols.declare(
                                    unit_scope,
                                    Symbol {
                                        name,
                                        location: decl_location,
                                        kind: SymbolKind::Variable { initializer },
                                    },
                                );
                            } else {
                                self.report.syntax_error(
                                    location,
                                    "Global-scope feature not enabled.".to_string(),
                                );
                            }
                        }
                        None => {
                            if !self.consume_until(Token::Semicolon) {
                                break;
                            }
                        }
                    }
                }
                Token::Handler | Token::Ident => {
                    let keyword = self.token() == Token::Handler;
                    if self.handler_decl(keyword).is_none()
                        && !self.consume_until(Token::Semicolon)
                    {
                        break;
                    }
                }
                other => {
                    let message = format!("Unexpected token {}. Expected a declaration.", other);
                    self.report.syntax_error(self.last_location(), message);
                    if !self.consume_until(Token::Semicolon) {
                        break;
                    }
                }
            }
        }

        self.leave_scope();
        Some(ParsedUnit {
            unit: Unit {
                scope: unit_scope,
                modules,
            },
            symbols: self.symbols,
        })
    }

    /// Declares a symbol for every native the runtime has registered, so
    /// unqualified identifiers resolve against the host's builtins.
    fn import_runtime(&mut self) {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => return,
        };
        let scope = self.current_scope();
        for (index, native) in runtime.natives().iter().enumerate() {
            let decl = native.decl.clone();
            let kind = if decl.is_handler() {
                SymbolKind::BuiltinHandler {
                    native: index,
                    decl,
                }
            } else {
                SymbolKind::BuiltinFunction {
                    native: index,
                    decl,
                }
            };
            self.symbols.declare(
                scope,
                Symbol {
                    name: runtime.native(index).decl.name.clone(),
                    location: SourceLocation::default(),
                    kind,
                },
            );
        }
    }

    // 'import' NAME_OR_NAMELIST ['from' PATH] ';'
    fn import_decl(&mut self, modules: &mut Vec<(String, String)>) -> bool {
        self.next_token(); // skip 'import'

        let mut names = Vec::new();
        if !self.import_one(&mut names) {
            self.consume_until(Token::Semicolon);
            return false;
        }
        while self.token() == Token::Comma {
            self.next_token();
            if !self.import_one(&mut names) {
                self.consume_until(Token::Semicolon);
                return false;
            }
        }

        let mut path = String::new();
        if self.consume_if(Token::From) {
            path = self.lexer.string_value().to_string();
            if !self.consume_one(Token::String, Token::RawString) {
                self.consume_until(Token::Semicolon);
                return false;
            }

            // resolve relative to the importing file
            if !path.is_empty() && !path.starts_with('/') {
                let base = self.lexer.location().filename;
                if let Some(slash) = base.rfind('/') {
                    path = format!("{}{}", &base[..slash + 1], path);
                }
            }
        }

        for name in names {
            modules.push((name, path.clone()));
        }

        self.consume(Token::Semicolon);
        true
    }

    fn import_one(&mut self, names: &mut Vec<String>) -> bool {
        match self.token() {
            Token::Ident | Token::String | Token::RawString => {
                names.push(self.lexer.string_value().to_string());
                self.next_token();
                true
            }
            Token::RndOpen => {
                self.next_token();
                if !self.import_one(names) {
                    return false;
                }
                while self.token() == Token::Comma {
                    self.next_token();
                    if !self.import_one(names) {
                        return false;
                    }
                }
                self.consume(Token::RndClose)
            }
            other => {
                let message = format!(
                    "Syntax error in import declaration. Unexpected token {}.",
                    other
                );
                self.report.syntax_error(self.last_location(), message);
                false
            }
        }
    }

    // 'var' IDENT '=' EXPR ';'
    fn var_decl_parts(&mut self) -> Option<(String, Expr, SourceLocation)> {
        let mut location = self.location();

        if !self.consume(Token::Var) {
            return None;
        }
        if !self.expect(Token::Ident) {
            return None;
        }
        let name = self.lexer.string_value().to_string();
        self.next_token();

        if !self.consume(Token::Assign) {
            return None;
        }
        let initializer = self.expr()?;
        if initializer.ty(&self.symbols) == LiteralType::Void {
            self.report.type_error(
                self.last_location(),
                format!("Variable '{}' cannot be initialized with a void expression.", name),
            );
            return None;
        }
        let location = location.update(initializer.location().end);
        self.consume(Token::Semicolon);

        Some((name, initializer, location))
    }

    fn var_decl(&mut self) -> Option<SymbolId> {
        let (name, initializer, location) = self.var_decl_parts()?;
        Some(self.symbols.declare(
            self.current_scope(),
            Symbol {
                name,
                location,
                kind: SymbolKind::Variable { initializer },
            },
        ))
    }

    // handlerDecl ::= ['handler'] IDENT (';' | stmt)
    fn handler_decl(&mut self, keyword: bool) -> Option<SymbolId> {
        let mut location = self.location();

        if keyword {
            self.next_token(); // 'handler'
        }

        if !self.expect(Token::Ident) {
            return None;
        }
        let name = self.lexer.string_value().to_string();
        self.next_token();

        if self.consume_if(Token::Semicolon) {
            // forward declaration
            let location = location.update(self.end());
            return Some(self.symbols.declare(
                self.current_scope(),
                Symbol {
                    name,
                    location,
                    kind: SymbolKind::Handler {
                        scope: None,
                        body: None,
                    },
                },
            ));
        }

        let scope = self.enter_scope(&format!("handler-{}", name));
        let body = self.stmt();
        self.leave_scope();
        let body = body?;
        let location = location.update(body.location().end);

        // forward-declared or previously declared?
        if let Some(existing) = self
            .symbols
            .lookup(self.current_scope(), &name, Lookup::Current)
        {
            let (is_handler, has_body) = match &self.symbols.symbol(existing).kind {
                SymbolKind::Handler { body, .. } => (true, body.is_some()),
                _ => (false, false),
            };
            if is_handler {
                if has_body {
                    self.report.type_error(
                        self.last_location(),
                        format!("Redeclaring handler \"{}\"", name),
                    );
                    return None;
                }
                let symbol = self.symbols.symbol_mut(existing);
                symbol.kind = SymbolKind::Handler {
                    scope: Some(scope),
                    body: Some(body),
                };
                symbol.location = location;
                return Some(existing);
            }
        }

        Some(self.symbols.declare(
            self.current_scope(),
            Symbol {
                name,
                location,
                kind: SymbolKind::Handler {
                    scope: Some(scope),
                    body: Some(body),
                },
            },
        ))
    }

    // statements

    fn stmt(&mut self) -> Option<Stmt> {
        match self.token() {
            Token::If => self.if_stmt(),
            Token::While => self.while_stmt(),
            Token::Match => self.match_stmt(),
            Token::Begin => self.compound_stmt(),
            Token::Ident => self.ident_stmt(),
            Token::Semicolon => {
                let mut location = self.location();
                self.next_token();
                Some(Stmt::Compound {
                    body: Vec::new(),
                    location: location.update(self.end()),
                })
            }
            other => {
                let message = format!("Unexpected token {}. Expected a statement instead.", other);
                self.report.syntax_error(self.last_location(), message);
                None
            }
        }
    }

    // ifStmt ::= 'if' expr ['then'] stmt ['else' stmt]
    fn if_stmt(&mut self) -> Option<Stmt> {
        let mut location = self.location();

        self.consume(Token::If);
        let condition = self.expr()?;
        self.consume_if(Token::Then);
        let condition = self.boolify_condition(condition)?;

        let then_stmt = self.stmt()?;
        let else_stmt = if self.consume_if(Token::Else) {
            Some(Box::new(self.stmt()?))
        } else {
            None
        };

        Some(Stmt::Cond {
            condition,
            then_stmt: Box::new(then_stmt),
            else_stmt,
            location: location.update(self.end()),
        })
    }

    // whileStmt ::= 'while' expr stmt
    fn while_stmt(&mut self) -> Option<Stmt> {
        let mut location = self.location();

        self.consume(Token::While);
        let condition = self.expr()?;
        let condition = self.boolify_condition(condition)?;
        let body = self.stmt()?;

        if !self.has_feature(Feature::WhileLoop) {
            self.report
                .syntax_error(location.clone(), "While-loop feature not enabled.".to_string());
        }

        Some(Stmt::While {
            condition,
            body: Box::new(body),
            location: location.update(self.end()),
        })
    }

    /// Conditions must be boolean; a string condition is implicitly
    /// rewritten into `strlen(x) != 0`.
    fn boolify_condition(&mut self, condition: Expr) -> Option<Expr> {
        match condition.ty(&self.symbols) {
            LiteralType::Boolean => Some(condition),
            LiteralType::String => {
                let location = condition.location().clone();
                let length = Expr::Unary {
                    op: Opcode::SLEN,
                    sub: Box::new(condition),
                    location: location.clone(),
                };
                let zero = Expr::literal(LiteralValue::Number(0), location.clone());
                Some(Expr::Binary {
                    op: Opcode::NCMPNE,
                    lhs: Box::new(length),
                    rhs: Box::new(zero),
                    location,
                })
            }
            other => {
                self.report.type_error(
                    self.last_location(),
                    format!(
                        "If expression must be boolean type. Received type {} instead.",
                        other
                    ),
                );
                None
            }
        }
    }

    // matchStmt ::= 'match' expr [MATCH_OP] '{' matchCase* ['else' stmt] '}'
    // matchCase ::= 'on' literalExpr *(',' 'on' literalExpr) stmt
    fn match_stmt(&mut self) -> Option<Stmt> {
        let mut location = self.location();

        if !self.consume(Token::Match) {
            return None;
        }

        let condition = self.add_expr()?;
        let mut match_type = condition.ty(&self.symbols);

        if match_type != LiteralType::String {
            self.report.type_error(
                self.last_location(),
                format!(
                    "Expected match condition type <{}>, found <{}> instead.",
                    LiteralType::String,
                    match_type
                ),
            );
            return None;
        }

        let op = if self.token().is_operator() {
            let op = match self.token() {
                Token::Equal => MatchClass::Same,
                Token::PrefixMatch => MatchClass::Head,
                Token::SuffixMatch => MatchClass::Tail,
                Token::RegexMatch => MatchClass::RegExp,
                other => {
                    self.report.type_error(
                        self.last_location(),
                        format!("Expected match operator, found token <{}> instead.", other),
                    );
                    return None;
                }
            };
            self.next_token();
            op
        } else {
            MatchClass::Same
        };

        if op == MatchClass::RegExp {
            match_type = LiteralType::RegExp;
        }

        if !self.consume(Token::Begin) {
            return None;
        }

        let mut cases = Vec::new();
        loop {
            if !self.consume(Token::On) {
                return None;
            }

            let mut labels = vec![self.literal_expr()?];
            while self.consume_if(Token::Comma) {
                if !self.consume(Token::On) {
                    return None;
                }
                labels.push(self.literal_expr()?);
            }

            for label in &labels {
                let case_type = label.ty(&self.symbols);
                if case_type != match_type {
                    self.report.type_error(
                        self.last_location(),
                        format!(
                            "Type mismatch in match-on statement. Expected <{}> but got <{}>.",
                            match_type, case_type
                        ),
                    );
                    return None;
                }
            }

            let body = self.stmt()?;
            cases.push(MatchCase { labels, body });

            if self.token() != Token::On {
                break;
            }
        }

        let else_stmt = if self.consume_if(Token::Else) {
            Some(Box::new(self.stmt()?))
        } else {
            None
        };

        if !self.consume(Token::End) {
            return None;
        }

        Some(Stmt::Match {
            condition,
            op,
            cases,
            else_stmt,
            location: location.update(self.end()),
        })
    }

    // compoundStmt ::= '{' varDecl* stmt* '}'
    fn compound_stmt(&mut self) -> Option<Stmt> {
        let mut location = self.location();
        self.next_token(); // '{'

        while self.token() == Token::Var {
            self.var_decl()?;
        }

        let mut body = Vec::new();
        loop {
            if self.consume_if(Token::End) {
                return Some(Stmt::Compound {
                    body,
                    location: location.update(self.end()),
                });
            }
            body.push(self.stmt()?);
        }
    }

    // identStmt ::= callStmt | assignStmt
    fn ident_stmt(&mut self) -> Option<Stmt> {
        let mut location = self.location();
        let name = self.lexer.string_value().to_string();
        self.next_token(); // IDENT

        let mut candidates = self
            .symbols
            .lookup_list(self.current_scope(), &name, Lookup::All);
        let callee = match candidates.first().copied() {
            Some(callee) => callee,
            None => {
                // assume a handler defined later in the source
                if self.token() != Token::Semicolon {
                    self.report
                        .type_error(self.last_location(), format!("Unknown symbol '{}'.", name));
                    return None;
                }
                let id = self.symbols.declare(
                    self.global_scope(),
                    Symbol {
                        name,
                        location: location.clone(),
                        kind: SymbolKind::Handler {
                            scope: None,
                            body: None,
                        },
                    },
                );
                candidates.push(id);
                id
            }
        };

        enum CalleeClass {
            Variable { ty: LiteralType },
            Builtin,
            SourceHandler,
            Other,
        }
        let class = match &self.symbols.symbol(callee).kind {
            SymbolKind::Variable { initializer } => CalleeClass::Variable {
                ty: initializer.ty(&self.symbols),
            },
            SymbolKind::BuiltinFunction { .. } | SymbolKind::BuiltinHandler { .. } => {
                CalleeClass::Builtin
            }
            SymbolKind::Handler { .. } => CalleeClass::SourceHandler,
            _ => CalleeClass::Other,
        };

        let stmt = match class {
            CalleeClass::Variable { ty: left_type } => {
                if !self.consume(Token::Assign) {
                    return None;
                }
                let value = self.expr()?;
                let right_type = value.ty(&self.symbols);
                if left_type != right_type {
                    self.report.type_error(
                        self.last_location(),
                        format!(
                            "Type mismatch in assignment. Expected <{}> but got <{}>.",
                            left_type, right_type
                        ),
                    );
                    return None;
                }
                Stmt::Assign {
                    variable: callee,
                    expr: value,
                    location: location.update(self.end()),
                }
            }
            CalleeClass::Builtin => {
                let call = self.call_stmt(&candidates)?;
                Stmt::Expr {
                    location: call.location().clone(),
                    expr: call,
                }
            }
            CalleeClass::SourceHandler => Stmt::Expr {
                expr: Expr::Call {
                    callee,
                    args: ParamList::default(),
                    location: location.clone(),
                },
                location: location.clone(),
            },
            CalleeClass::Other => {
                let name = self.symbols.symbol(callee).name.clone();
                self.report.type_error(
                    self.last_location(),
                    format!("Symbol '{}' is not callable.", name),
                );
                return None;
            }
        };

        if self.token() == Token::If || self.token() == Token::Unless {
            return self.postscript_stmt(stmt);
        }

        if !self.consume(Token::Semicolon) {
            return None;
        }
        Some(stmt)
    }

    // callStmt ::= NAME ['(' paramList ')' | paramList] (';' | 'if' | 'unless')
    fn call_stmt(&mut self, candidates: &[SymbolId]) -> Option<Expr> {
        let callables: Vec<SymbolId> = candidates
            .iter()
            .copied()
            .filter(|&s| self.symbols.symbol(s).callable_decl().is_some())
            .collect();
        if callables.is_empty() {
            self.report
                .type_error(self.last_location(), "Symbol is not callable.".to_string());
            return None;
        }

        let mut params = ParamList::default();
        let mut location = self.location();

        if self.token() == Token::RndOpen {
            self.next_token();
            if self.token() != Token::RndClose {
                params = self.param_list()?;
            }
            location.end = self.last_location().end;
            if !self.consume(Token::RndClose) {
                return None;
            }
        } else if self.token() != Token::Semicolon
            && self.token() != Token::If
            && self.token() != Token::Unless
        {
            params = self.param_list()?;
            if let Some(params_location) = params.location() {
                location.end = params_location.end;
            }
        }

        self.resolve(&callables, params, location)
    }

    /// Overload resolution: a direct signature match wins; otherwise each
    /// candidate is tried with named-argument reordering and defaults
    /// filled from the native's declaration.
    fn resolve(
        &mut self,
        callables: &[SymbolId],
        params: ParamList,
        location: SourceLocation,
    ) -> Option<Expr> {
        for &callee in callables {
            if self.is_direct_match(callee, &params) {
                return Some(Expr::Call {
                    callee,
                    args: params,
                    location,
                });
            }
        }

        let mut matched: Vec<(SymbolId, ParamList)> = Vec::new();
        let mut match_errors: Vec<String> = Vec::new();
        for &callee in callables {
            match self.try_match(callee, &params) {
                Ok(rebuilt) => matched.push((callee, rebuilt)),
                Err(message) => match_errors.push(message),
            }
        }

        if matched.is_empty() {
            let name = &self.symbols.symbol(callables[0]).name;
            let arg_codes: String = params
                .arg_types(&self.symbols)
                .iter()
                .map(|t| t.signature_code())
                .collect();
            let message = format!("No matching signature for {}({}).", name, arg_codes);
            self.report.type_error(self.last_location(), message);
            for message in match_errors {
                self.report.type_error(self.last_location(), message);
            }
            return None;
        }

        if matched.len() > 1 {
            self.report.type_error(
                self.last_location(),
                "Call to builtin is ambiguous.".to_string(),
            );
            return None;
        }

        let (callee, args) = matched.pop().unwrap();
        if let Some(decl) = self.symbols.symbol(callee).callable_decl() {
            if decl.experimental {
                let message = format!("Using experimental builtin API {}.", decl.signature());
                self.report.warning(self.last_location(), message);
            }
        }

        Some(Expr::Call {
            callee,
            args,
            location,
        })
    }

    fn is_direct_match(&self, callee: SymbolId, params: &ParamList) -> bool {
        let decl = match self.symbols.symbol(callee).callable_decl() {
            Some(decl) => decl,
            None => return false,
        };
        if params.is_named() || params.len() != decl.params.len() {
            return false;
        }
        params
            .values()
            .iter()
            .zip(&decl.params)
            .all(|(value, param)| value.ty(&self.symbols) == param.ty)
    }

    fn try_match(&self, callee: SymbolId, params: &ParamList) -> Result<ParamList, String> {
        let decl = match self.symbols.symbol(callee).callable_decl() {
            Some(decl) => decl.clone(),
            None => return Err("not callable".to_string()),
        };
        let signature = decl.signature();

        let mut slots: Vec<Option<Expr>> = vec![None; decl.params.len()];

        if params.is_named() {
            for (name, value) in params.names().iter().zip(params.values()) {
                match decl.find_param(name) {
                    Some(index) => {
                        if slots[index].is_some() {
                            return Err(format!(
                                "Parameter '{}' specified more than once in call to {}.",
                                name, signature
                            ));
                        }
                        slots[index] = Some(value.clone());
                    }
                    None => {
                        return Err(format!(
                            "Signature {} has no parameter named '{}'.",
                            signature, name
                        ));
                    }
                }
            }
        } else {
            if params.len() > decl.params.len() {
                return Err(format!("Too many arguments for {}.", signature));
            }
            for (index, value) in params.values().iter().enumerate() {
                slots[index] = Some(value.clone());
            }
        }

        let mut rebuilt = ParamList::new(false);
        for (index, slot) in slots.into_iter().enumerate() {
            let param = &decl.params[index];
            let value = match slot {
                Some(value) => value,
                None => match &param.default {
                    Some(default) => Expr::literal(default.clone(), self.last_location()),
                    None => {
                        return Err(format!(
                            "Signature {} is missing a value for parameter '{}'.",
                            signature, param.name
                        ));
                    }
                },
            };
            let value_type = value.ty(&self.symbols);
            if value_type != param.ty {
                return Err(format!(
                    "Type mismatch for parameter '{}' of {}: expected <{}>, got <{}>.",
                    param.name, signature, param.ty, value_type
                ));
            }
            rebuilt.push(value);
        }

        Ok(rebuilt)
    }

    // STMT ('if' | 'unless') EXPR ';'
    fn postscript_stmt(&mut self, base: Stmt) -> Option<Stmt> {
        let op = self.token();
        let mut location = self.location();

        self.next_token(); // 'if' | 'unless'

        let mut condition = self.expr()?;

        if op == Token::Unless {
            let ty = condition.ty(&self.symbols);
            match unary_operator(Token::Not, ty) {
                Some(negate) => {
                    condition = Expr::Unary {
                        op: negate,
                        location: condition.location().clone(),
                        sub: Box::new(condition),
                    };
                }
                None => {
                    self.report.type_error(
                        self.last_location(),
                        format!(
                            "Type cast error. No cast implementation found for requested cast from {} to {}.",
                            ty,
                            LiteralType::Boolean
                        ),
                    );
                    return None;
                }
            }
        }

        if !self.consume(Token::Semicolon) {
            return None;
        }

        Some(Stmt::Cond {
            condition,
            then_stmt: Box::new(base),
            else_stmt: None,
            location: location.update(self.end()),
        })
    }

    // expressions, precedence low to high

    fn expr(&mut self) -> Option<Expr> {
        self.logic_expr()
    }

    fn logic_expr(&mut self) -> Option<Expr> {
        let mut lhs = self.not_expr()?;
        loop {
            match self.token() {
                Token::And | Token::Or | Token::Xor => {
                    let op = self.token();
                    self.next_token();
                    let rhs = self.not_expr()?;
                    lhs = self.make_binary(op, lhs, rhs)?;
                }
                _ => return Some(lhs),
            }
        }
    }

    fn not_expr(&mut self) -> Option<Expr> {
        let location = self.location();
        let mut nots = 0usize;
        while self.consume_if(Token::Not) {
            nots += 1;
        }

        let sub = self.rel_expr()?;
        if nots % 2 == 0 {
            return Some(sub);
        }

        let ty = sub.ty(&self.symbols);
        match unary_operator(Token::Not, ty) {
            Some(op) => Some(Expr::Unary {
                op,
                sub: Box::new(sub),
                location,
            }),
            None => {
                self.report.type_error(
                    self.last_location(),
                    format!(
                        "Type cast error in unary 'not'-operator. Invalid source type <{}>.",
                        ty
                    ),
                );
                None
            }
        }
    }

    fn rel_expr(&mut self) -> Option<Expr> {
        let lhs = self.add_expr()?;
        if self.token().is_rel_op() {
            let op = self.token();
            self.next_token();
            let rhs = self.add_expr()?;
            return self.make_binary(op, lhs, rhs);
        }
        Some(lhs)
    }

    fn add_expr(&mut self) -> Option<Expr> {
        let mut lhs = self.mul_expr()?;
        loop {
            match self.token() {
                Token::Plus | Token::Minus => {
                    let op = self.token();
                    self.next_token();
                    let rhs = self.mul_expr()?;
                    lhs = self.make_binary(op, lhs, rhs)?;
                }
                _ => return Some(lhs),
            }
        }
    }

    fn mul_expr(&mut self) -> Option<Expr> {
        let mut lhs = self.pow_expr()?;
        loop {
            match self.token() {
                Token::Mul | Token::Div | Token::Mod | Token::Shl | Token::Shr => {
                    let op = self.token();
                    self.next_token();
                    let rhs = self.pow_expr()?;
                    lhs = self.make_binary(op, lhs, rhs)?;
                }
                _ => return Some(lhs),
            }
        }
    }

    // powExpr ::= negExpr ('**' powExpr)*, right-associative
    fn pow_expr(&mut self) -> Option<Expr> {
        let mut lhs = self.neg_expr()?;
        while self.token() == Token::Pow {
            self.next_token();
            let rhs = self.pow_expr()?;
            lhs = self.make_binary(Token::Pow, lhs, rhs)?;
        }
        Some(lhs)
    }

    fn neg_expr(&mut self) -> Option<Expr> {
        let location = self.location();
        if self.consume_if(Token::Minus) {
            let sub = self.neg_expr()?;
            let ty = sub.ty(&self.symbols);
            return match unary_operator(Token::Minus, ty) {
                Some(op) => Some(Expr::Unary {
                    op,
                    sub: Box::new(sub),
                    location,
                }),
                None => {
                    self.report.type_error(
                        self.last_location(),
                        format!(
                            "Type cast error in unary 'neg'-operator. Invalid source type <{}>.",
                            ty
                        ),
                    );
                    None
                }
            };
        }
        self.bit_not_expr()
    }

    fn bit_not_expr(&mut self) -> Option<Expr> {
        let location = self.location();
        if self.consume_if(Token::BitNot) {
            let sub = self.bit_not_expr()?;
            let ty = sub.ty(&self.symbols);
            return match unary_operator(Token::BitNot, ty) {
                Some(op) => Some(Expr::Unary {
                    op,
                    sub: Box::new(sub),
                    location,
                }),
                None => {
                    self.report.type_error(
                        self.last_location(),
                        format!(
                            "Type cast error in unary 'not'-operator. Invalid source type <{}>.",
                            ty
                        ),
                    );
                    None
                }
            };
        }
        self.primary_expr()
    }

    fn make_binary(&mut self, token: Token, lhs: Expr, rhs: Expr) -> Option<Expr> {
        let left_type = lhs.ty(&self.symbols);
        let right_type = rhs.ty(&self.symbols);
        match binary_operator(token, left_type, right_type) {
            Some(op) => Some(Expr::Binary {
                op,
                location: lhs.location().union(rhs.location()),
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            }),
            None => {
                self.report.type_error(
                    self.last_location(),
                    format!(
                        "Incompatible binary expression operands ({} {} {}).",
                        left_type, token, right_type
                    ),
                );
                None
            }
        }
    }

    // primaryExpr ::= literalExpr | variable | function call | '(' expr ')'
    //               | '[' exprList ']' | castExpr | interpolated string
    //               | '{' stmt* '}' (anonymous handler)
    fn primary_expr(&mut self) -> Option<Expr> {
        match self.token() {
            Token::String
            | Token::RawString
            | Token::Number
            | Token::Boolean
            | Token::IP
            | Token::Cidr
            | Token::RegExp
            | Token::Div => self.literal_expr(),
            Token::RegExpGroup => {
                let group = self.lexer.number_value();
                let mut location = self.location();
                self.consume(Token::RegExpGroup);
                Some(Expr::RegExpGroup {
                    group,
                    location: location.update(self.end()),
                })
            }
            Token::StringType | Token::NumberType | Token::BoolType => self.cast_expr(),
            Token::InterpolatedStringFragment => self.interpolated_str(),
            Token::Ident => self.ident_expr(),
            Token::Begin => self.lambda_expr(),
            Token::RndOpen => {
                let mut location = self.location();
                self.next_token();
                let expr = self.expr();
                self.consume(Token::RndClose);
                let mut expr = expr?;
                expr.set_location(location.update(self.end()));
                Some(expr)
            }
            Token::BrOpen => self.array_expr(),
            other => {
                self.report.syntax_error(
                    self.last_location(),
                    format!("Unexpected token {}", other),
                );
                None
            }
        }
    }

    fn ident_expr(&mut self) -> Option<Expr> {
        let location = self.location();
        let name = self.lexer.string_value().to_string();
        self.next_token();

        let candidates = self
            .symbols
            .lookup_list(self.current_scope(), &name, Lookup::All);
        let symbol = match candidates.first().copied() {
            Some(symbol) => symbol,
            None => {
                // assume a forward-declared handler
                let id = self.symbols.declare(
                    self.global_scope(),
                    Symbol {
                        name,
                        location: location.clone(),
                        kind: SymbolKind::Handler {
                            scope: None,
                            body: None,
                        },
                    },
                );
                return Some(Expr::HandlerRef {
                    symbol: id,
                    location,
                });
            }
        };

        enum IdentClass {
            Variable,
            Handler,
            Function,
            Other,
        }
        let class = match &self.symbols.symbol(symbol).kind {
            SymbolKind::Variable { .. } => IdentClass::Variable,
            SymbolKind::Handler { .. } => IdentClass::Handler,
            SymbolKind::BuiltinFunction { .. } => IdentClass::Function,
            _ => IdentClass::Other,
        };

        match class {
            IdentClass::Variable => Some(Expr::Variable { symbol, location }),
            IdentClass::Handler => Some(Expr::HandlerRef { symbol, location }),
            IdentClass::Function => {
                let callables: Vec<SymbolId> = candidates
                    .into_iter()
                    .filter(|&s| {
                        matches!(
                            self.symbols.symbol(s).kind,
                            SymbolKind::BuiltinFunction { .. }
                        )
                    })
                    .collect();

                let mut params = ParamList::default();
                let mut location = location;
                if self.token() == Token::RndOpen {
                    self.next_token();
                    if self.token() != Token::RndClose {
                        params = self.param_list()?;
                    }
                    location.end = self.last_location().end;
                    if !self.consume(Token::RndClose) {
                        return None;
                    }
                } else if self.token().is_unary_op()
                    || self.token().is_literal()
                    || self.token() == Token::Ident
                    || self.token() == Token::BrOpen
                    || self.token() == Token::RndOpen
                {
                    params = self.param_list()?;
                    if let Some(params_location) = params.location() {
                        location.end = params_location.end;
                    }
                }

                self.resolve(&callables, params, location)
            }
            IdentClass::Other => {
                self.report.type_error(
                    self.last_location(),
                    format!("Unsupported symbol type of \"{}\" in expression.", name),
                );
                None
            }
        }
    }

    // lambda-like inline handler ref
    fn lambda_expr(&mut self) -> Option<Expr> {
        self.lambda_counter += 1;
        let name = format!("__lambda_#{}", self.lambda_counter);
        let mut location = self.location();

        let scope = self.enter_scope(&name);
        let body = self.compound_stmt();
        self.leave_scope();
        let body = body?;
        let location = location.update(body.location().end);

        let symbol = self.symbols.declare(
            self.current_scope(),
            Symbol {
                name,
                location: location.clone(),
                kind: SymbolKind::Handler {
                    scope: Some(scope),
                    body: Some(body),
                },
            },
        );

        Some(Expr::HandlerRef { symbol, location })
    }

    fn array_expr(&mut self) -> Option<Expr> {
        let mut location = self.location();
        self.next_token(); // '['

        let mut elements = Vec::new();
        if self.token() != Token::BrClose {
            elements.push(self.expr()?);
            while self.consume_if(Token::Comma) {
                elements.push(self.expr()?);
            }
        }
        self.consume(Token::BrClose);

        if elements.is_empty() {
            self.report.type_error(
                self.last_location(),
                "Empty arrays are not allowed. Cannot infer element type.".to_string(),
            );
            return None;
        }

        let base_type = elements[0].ty(&self.symbols);
        for element in &elements {
            if element.ty(&self.symbols) != base_type {
                self.report.type_error(
                    self.last_location(),
                    "Mixed element types in array not allowed.".to_string(),
                );
                return None;
            }
        }

        match base_type {
            LiteralType::Number
            | LiteralType::String
            | LiteralType::IPAddress
            | LiteralType::Cidr => {}
            other => {
                self.report.type_error(
                    self.last_location(),
                    format!(
                        "Invalid array expression. Element type {} is not allowed.",
                        other
                    ),
                );
                return None;
            }
        }

        Some(Expr::Array {
            elements,
            location: location.update(self.end()),
        })
    }

    // literalExpr ::= NUMBER [UNIT] | BOOL | STRING | IP_ADDR | IP_CIDR | REGEXP
    fn literal_expr(&mut self) -> Option<Expr> {
        let mut location = self.location();

        match self.token() {
            Token::Div => {
                // '/' in expression position starts a regex literal
                if self.lexer.continue_parse_regex(b'/') {
                    let result = self.make_regexp_literal(location.update(self.end()));
                    self.next_token();
                    result
                } else {
                    self.report.syntax_error(
                        self.last_location(),
                        "Error parsing regular expression.".to_string(),
                    );
                    None
                }
            }
            Token::Number => {
                let mut number = self.lexer.number_value();
                self.next_token();

                if self.token() == Token::Ident {
                    let suffix = self.lexer.string_value().to_string();
                    let singular = suffix.strip_suffix('s').unwrap_or(&suffix);
                    for &(ident, nominator, denominator) in UNITS {
                        if suffix == ident || singular == ident {
                            self.next_token(); // UNIT
                            number = number * nominator / denominator;
                            location.update(self.end());
                            break;
                        }
                    }
                }
                Some(Expr::literal(LiteralValue::Number(number), location))
            }
            Token::Boolean => {
                let value = self.lexer.boolean_value();
                self.next_token();
                Some(Expr::literal(LiteralValue::Boolean(value), location))
            }
            Token::String | Token::RawString => {
                let value = self.lexer.string_value().to_string();
                self.next_token();
                Some(Expr::literal(LiteralValue::String(value), location))
            }
            Token::IP => {
                let value = self.lexer.ip_value();
                self.next_token();
                Some(Expr::literal(LiteralValue::IPAddress(value), location))
            }
            Token::Cidr => {
                let value = self.lexer.cidr_value();
                self.next_token();
                Some(Expr::literal(LiteralValue::Cidr(value), location))
            }
            Token::RegExp => {
                let result = self.make_regexp_literal(location);
                self.next_token();
                result
            }
            other => {
                self.report.type_error(
                    self.last_location(),
                    format!("Expected literal expression, but got {}.", other),
                );
                None
            }
        }
    }

    fn make_regexp_literal(&mut self, location: SourceLocation) -> Option<Expr> {
        match RegExp::new(self.lexer.string_value()) {
            Ok(regexp) => Some(Expr::literal(LiteralValue::RegExp(regexp), location)),
            Err(error) => {
                self.report.syntax_error(
                    self.last_location(),
                    format!("Error parsing regular expression: {}.", error),
                );
                None
            }
        }
    }

    /// `"a #{x} b"` folds into `"a " + string(x) + " b"` with SADD nodes.
    fn interpolated_str(&mut self) -> Option<Expr> {
        let mut location = self.location();
        let mut result = Expr::literal(
            LiteralValue::String(self.lexer.string_value().to_string()),
            location.update(self.end()),
        );
        self.next_token(); // interpolation start

        let fragment = self.expr()?;
        let fragment = self.as_string(fragment)?;
        result = Expr::Binary {
            op: Opcode::SADD,
            location: result.location().union(fragment.location()),
            lhs: Box::new(result),
            rhs: Box::new(fragment),
        };

        while self.token() == Token::InterpolatedStringFragment {
            let text_location = location.update(self.end());
            let text = Expr::literal(
                LiteralValue::String(self.lexer.string_value().to_string()),
                text_location,
            );
            result = Expr::Binary {
                op: Opcode::SADD,
                location: result.location().union(text.location()),
                lhs: Box::new(result),
                rhs: Box::new(text),
            };
            self.next_token();

            let fragment = self.expr()?;
            let fragment = self.as_string(fragment)?;
            result = Expr::Binary {
                op: Opcode::SADD,
                location: result.location().union(fragment.location()),
                lhs: Box::new(result),
                rhs: Box::new(fragment),
            };
        }

        if !self.expect(Token::InterpolatedStringEnd) {
            return None;
        }

        if !self.lexer.string_value().is_empty() {
            let tail = Expr::literal(
                LiteralValue::String(self.lexer.string_value().to_string()),
                location.update(self.end()),
            );
            result = Expr::Binary {
                op: Opcode::SADD,
                location: result.location().union(tail.location()),
                lhs: Box::new(result),
                rhs: Box::new(tail),
            };
        }

        self.next_token(); // skip InterpolatedStringEnd
        Some(result)
    }

    fn as_string(&mut self, expr: Expr) -> Option<Expr> {
        let ty = expr.ty(&self.symbols);
        if ty == LiteralType::String {
            return Some(expr);
        }
        match unary_operator(Token::StringType, ty) {
            Some(Opcode::NOP) => Some(expr),
            Some(op) => Some(Expr::Unary {
                op,
                location: expr.location().clone(),
                sub: Box::new(expr),
            }),
            None => {
                self.report.type_error(
                    self.last_location(),
                    "Cast error in string interpolation.".to_string(),
                );
                None
            }
        }
    }

    // castExpr ::= ('int' | 'string' | 'bool') '(' expr ')'
    fn cast_expr(&mut self) -> Option<Expr> {
        let mut location = self.location();
        let target = self.token();
        self.next_token();

        if !self.consume(Token::RndOpen) {
            return None;
        }
        let sub = self.expr();
        if !self.consume(Token::RndClose) {
            return None;
        }
        let sub = sub?;

        let ty = sub.ty(&self.symbols);
        match unary_operator(target, ty) {
            Some(Opcode::NOP) => Some(sub),
            Some(op) => Some(Expr::Unary {
                op,
                sub: Box::new(sub),
                location: location.update(self.end()),
            }),
            None => {
                self.report.type_error(
                    self.last_location(),
                    format!(
                        "Type cast error. No cast implementation found for requested cast from {} to {}.",
                        ty, target
                    ),
                );
                None
            }
        }
    }

    // paramList ::= namedExpr *(',' namedExpr) | expr *(',' expr)
    fn param_list(&mut self) -> Option<ParamList> {
        if self.token() == Token::NamedParam {
            let mut params = ParamList::new(true);
            let (name, value) = self.named_expr()?;
            params.push_named(name, value);

            while self.token() == Token::Comma {
                self.next_token();
                if self.token() == Token::RndClose {
                    break;
                }
                let (name, value) = self.named_expr()?;
                params.push_named(name, value);
            }
            Some(params)
        } else {
            let mut params = ParamList::new(false);
            params.push(self.expr()?);

            while self.token() == Token::Comma {
                self.next_token();
                if self.token() == Token::RndClose {
                    break;
                }
                params.push(self.expr()?);
            }
            Some(params)
        }
    }

    // namedExpr ::= NAMED_PARAM expr
    fn named_expr(&mut self) -> Option<(String, Expr)> {
        let name = self.lexer.string_value().to_string();
        if !self.consume(Token::NamedParam) {
            return None;
        }
        Some((name, self.expr()?))
    }
}
