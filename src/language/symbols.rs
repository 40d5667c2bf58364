use crate::language::ast::{Expr, Stmt};
use crate::language::span::SourceLocation;
use crate::vm::runtime::CallableDecl;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

/// Whether a lookup searches only the given scope or walks the chain of
/// outer scopes as well.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    Current,
    All,
}

#[derive(Debug)]
pub enum SymbolKind {
    Unit,
    Variable {
        initializer: Expr,
    },
    /// Source handler. `body` is `None` while only forward-declared.
    Handler {
        scope: Option<ScopeId>,
        body: Option<Stmt>,
    },
    BuiltinFunction {
        native: usize,
        decl: CallableDecl,
    },
    BuiltinHandler {
        native: usize,
        decl: CallableDecl,
    },
}

#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    pub location: SourceLocation,
    pub kind: SymbolKind,
}

impl Symbol {
    pub fn is_variable(&self) -> bool {
        matches!(self.kind, SymbolKind::Variable { .. })
    }

    pub fn is_handler(&self) -> bool {
        matches!(self.kind, SymbolKind::Handler { .. })
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self.kind,
            SymbolKind::Handler { .. }
                | SymbolKind::BuiltinFunction { .. }
                | SymbolKind::BuiltinHandler { .. }
        )
    }

    pub fn callable_decl(&self) -> Option<&CallableDecl> {
        match &self.kind {
            SymbolKind::BuiltinFunction { decl, .. } | SymbolKind::BuiltinHandler { decl, .. } => {
                Some(decl)
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Scope {
    pub name: String,
    pub outer: Option<ScopeId>,
    symbols: Vec<SymbolId>,
}

/// Arena of scopes and symbols. Scopes own their symbol lists; all
/// cross-references are ids, so the AST can point at symbols freely.
#[derive(Debug, Default)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_scope(&mut self, name: impl Into<String>, outer: Option<ScopeId>) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope {
            name: name.into(),
            outer,
            symbols: Vec::new(),
        });
        id
    }

    pub fn declare(&mut self, scope: ScopeId, symbol: Symbol) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(symbol);
        self.scopes[scope.0 as usize].symbols.push(id);
        id
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn scope_symbols(&self, id: ScopeId) -> &[SymbolId] {
        &self.scopes[id.0 as usize].symbols
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0 as usize]
    }

    /// First symbol with the given name, searching the scope itself and,
    /// in `Lookup::All` mode, its transitive outer chain.
    pub fn lookup(&self, scope: ScopeId, name: &str, mode: Lookup) -> Option<SymbolId> {
        let mut current = Some(scope);
        while let Some(scope_id) = current {
            let scope = self.scope(scope_id);
            for &sym in &scope.symbols {
                if self.symbol(sym).name == name {
                    return Some(sym);
                }
            }
            if mode == Lookup::Current {
                return None;
            }
            current = scope.outer;
        }
        None
    }

    /// Every symbol with the given name along the lookup chain; overload
    /// sets for builtins come from here.
    pub fn lookup_list(&self, scope: ScopeId, name: &str, mode: Lookup) -> Vec<SymbolId> {
        let mut result = Vec::new();
        let mut current = Some(scope);
        while let Some(scope_id) = current {
            let scope = self.scope(scope_id);
            for &sym in &scope.symbols {
                if self.symbol(sym).name == name {
                    result.push(sym);
                }
            }
            if mode == Lookup::Current {
                break;
            }
            current = scope.outer;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::ast::Expr;
    use crate::language::types::LiteralValue;

    fn number_symbol(name: &str, value: i64) -> Symbol {
        Symbol {
            name: name.to_string(),
            location: SourceLocation::default(),
            kind: SymbolKind::Variable {
                initializer: Expr::Literal {
                    value: LiteralValue::Number(value),
                    location: SourceLocation::default(),
                },
            },
        }
    }

    #[test]
    fn lookup_walks_outer_chain() {
        let mut table = SymbolTable::new();
        let global = table.create_scope("global", None);
        let inner = table.create_scope("inner", Some(global));
        let sym = table.declare(global, number_symbol("x", 1));

        assert_eq!(table.lookup(inner, "x", Lookup::All), Some(sym));
        assert_eq!(table.lookup(inner, "x", Lookup::Current), None);
        assert_eq!(table.lookup(global, "x", Lookup::Current), Some(sym));
    }

    #[test]
    fn shadowed_names_resolve_to_innermost() {
        let mut table = SymbolTable::new();
        let global = table.create_scope("global", None);
        let inner = table.create_scope("inner", Some(global));
        table.declare(global, number_symbol("x", 1));
        let shadow = table.declare(inner, number_symbol("x", 2));

        assert_eq!(table.lookup(inner, "x", Lookup::All), Some(shadow));
        assert_eq!(table.lookup_list(inner, "x", Lookup::All).len(), 2);
    }
}
