use crate::diagnostics::Report;
use crate::ir::{
    BlockId, ConstId, GLOBAL_INIT_HANDLER, HandlerId, InstrId, InstrKind, IrProgram, Operand,
};
use crate::language::ast::{Expr, Stmt, Unit};
use crate::language::symbols::{SymbolId, SymbolKind, SymbolTable};
use crate::language::types::{LiteralType, LiteralValue};
use crate::vm::instruction::Opcode;
use std::collections::{HashMap, HashSet};

/// Lowers a parsed unit into IR. Source-handler calls are inlined at the
/// call site; global-scope variable initializers accumulate into the
/// synthetic `@__global_init__` handler. Returns `None` when any type
/// error was reported.
pub fn generate(unit: &Unit, symbols: &SymbolTable, report: &mut dyn Report) -> Option<IrProgram> {
    let generator = IrGenerator {
        symbols,
        report,
        program: IrProgram::new(),
        handler: None,
        insert_point: None,
        variables: HashMap::new(),
        handler_stack: Vec::new(),
        generated: HashSet::new(),
        pending: Vec::new(),
        errors: 0,
        name_counter: HashMap::new(),
    };
    generator.run(unit)
}

struct IrGenerator<'a> {
    symbols: &'a SymbolTable,
    report: &'a mut dyn Report,
    program: IrProgram,
    handler: Option<HandlerId>,
    insert_point: Option<BlockId>,
    variables: HashMap<SymbolId, InstrId>,
    handler_stack: Vec<SymbolId>,
    generated: HashSet<SymbolId>,
    pending: Vec<SymbolId>,
    errors: usize,
    name_counter: HashMap<String, usize>,
}

impl<'a> IrGenerator<'a> {
    fn run(mut self, unit: &Unit) -> Option<IrProgram> {
        self.program.modules = unit.modules.clone();

        for &symbol in self.symbols.scope_symbols(unit.scope).to_vec().iter() {
            match &self.symbols.symbol(symbol).kind {
                SymbolKind::Variable { .. } => self.gen_global_variable(symbol),
                SymbolKind::Handler { .. } => self.gen_handler_symbol(symbol),
                _ => {}
            }
        }

        // handlers referenced as values (lambdas, handler refs) generate
        // after the handler that referenced them finished
        while let Some(symbol) = self.pending.pop() {
            self.gen_handler_symbol(symbol);
        }

        // finalize the global-init handler, if any variables created one
        if let Some(init) = self.program.find_handler(GLOBAL_INIT_HANDLER) {
            if let Some(entry) = self.program.handler(init).entry_block() {
                self.handler = Some(init);
                self.insert_point = Some(entry);
                self.create_ret_false();
            }
        }

        if self.errors > 0 { None } else { Some(self.program) }
    }

    fn gen_global_variable(&mut self, symbol: SymbolId) {
        let init = self.program.get_or_create_handler(GLOBAL_INIT_HANDLER);
        let entry = match self.program.handler(init).entry_block() {
            Some(entry) => entry,
            None => self.program.create_block(init, "EntryPoint"),
        };
        self.handler = Some(init);
        self.insert_point = Some(entry);
        self.gen_variable(symbol);
    }

    fn gen_handler_symbol(&mut self, symbol: SymbolId) {
        if !self.generated.insert(symbol) {
            return;
        }

        let name = self.symbols.symbol(symbol).name.clone();
        let handler = self.program.get_or_create_handler(&name);
        self.handler = Some(handler);
        let entry = self.make_name("EntryPoint");
        let entry = self.program.create_block(handler, &entry);
        self.insert_point = Some(entry);

        let errors_before = self.errors;
        self.gen_inline(symbol);
        if self.errors > errors_before {
            // aborted mid-handler; sibling handlers still generate
            return;
        }

        self.create_ret_false();

        if let Err(message) = self.program.verify_handler(handler) {
            panic!("IR verification failed for handler {}: {}", name, message);
        }
    }

    /// Emits a handler body into the current insert point, checking the
    /// inline stack to reject direct or indirect recursion.
    fn gen_inline(&mut self, symbol: SymbolId) {
        let symbols = self.symbols;
        let sym = symbols.symbol(symbol);

        if self.handler_stack.contains(&symbol) {
            self.type_error(
                sym.location.clone(),
                format!("Cannot recursively call handler {}.", sym.name),
            );
            return;
        }
        self.handler_stack.push(symbol);

        let (scope, body) = match &sym.kind {
            SymbolKind::Handler { scope, body } => (*scope, body.as_ref()),
            _ => (None, None),
        };

        // local variable declarations first
        if let Some(scope) = scope {
            for &local in symbols.scope_symbols(scope) {
                if symbols.symbol(local).is_variable() {
                    self.gen_variable(local);
                }
            }
        }

        match body {
            Some(body) => self.gen_stmt(body),
            None => self.type_error(
                sym.location.clone(),
                format!(
                    "Forward declared handler '{}' is missing implementation.",
                    sym.name
                ),
            ),
        }

        self.handler_stack.pop();
    }

    fn gen_variable(&mut self, symbol: SymbolId) {
        let symbols = self.symbols;
        let sym = symbols.symbol(symbol);
        let initializer = match &sym.kind {
            SymbolKind::Variable { initializer } => initializer,
            _ => return,
        };

        let ty = initializer.ty(symbols);
        let size = self.program.get_number(1);
        let name = sym.name.clone();
        let alloca = self.append(InstrKind::Alloca, ty, vec![Operand::Const(size)], &name);
        self.variables.insert(symbol, alloca);

        if let Some(value) = self.gen_expr(initializer) {
            self.append(
                InstrKind::Store,
                LiteralType::Void,
                vec![Operand::Instr(alloca), value],
                "",
            );
        }
    }

    fn gen_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expr { expr, .. } => {
                self.gen_expr(expr);
            }
            Stmt::Compound { body, .. } => {
                for stmt in body {
                    self.gen_stmt(stmt);
                }
            }
            Stmt::Cond {
                condition,
                then_stmt,
                else_stmt,
                ..
            } => {
                let true_block = self.create_block("trueBlock");
                let false_block = self.create_block("falseBlock");
                let cont_block = self.create_block("contBlock");

                if let Some(cond) = self.gen_expr(condition) {
                    self.create_cond_br(cond, true_block, false_block);
                }

                self.insert_point = Some(true_block);
                self.gen_stmt(then_stmt);
                self.create_br(cont_block);

                self.insert_point = Some(false_block);
                if let Some(else_stmt) = else_stmt {
                    self.gen_stmt(else_stmt);
                }
                self.create_br(cont_block);

                self.insert_point = Some(cont_block);
            }
            Stmt::While {
                condition, body, ..
            } => {
                let body_block = self.create_block("while.body");
                let cond_block = self.create_block("while.cond");
                let done_block = self.create_block("while.done");

                self.create_br(cond_block);

                self.insert_point = Some(body_block);
                self.gen_stmt(body);
                self.create_br(cond_block);

                self.insert_point = Some(cond_block);
                if let Some(cond) = self.gen_expr(condition) {
                    self.create_cond_br(cond, body_block, done_block);
                }

                self.insert_point = Some(done_block);
            }
            Stmt::Match {
                condition,
                op,
                cases,
                else_stmt,
                ..
            } => {
                let cond = match self.gen_expr(condition) {
                    Some(cond) => cond,
                    None => return,
                };
                let origin = match self.insert_point {
                    Some(block) => block,
                    None => return,
                };
                let cont_block = self.create_block("match.cont");

                let mut case_data: Vec<(ConstId, BlockId)> = Vec::new();
                for case in cases {
                    let case_block = self.create_block("match.case");
                    self.insert_point = Some(case_block);
                    self.gen_stmt(&case.body);
                    self.create_br(cont_block);

                    for label in &case.labels {
                        if let Some(constant) = self.match_label_constant(label) {
                            case_data.push((constant, case_block));
                        }
                    }
                }

                let else_block = match else_stmt {
                    Some(else_stmt) => {
                        let else_block = self.create_block("match.else");
                        self.insert_point = Some(else_block);
                        self.gen_stmt(else_stmt);
                        self.create_br(cont_block);
                        else_block
                    }
                    None => cont_block,
                };

                let mut operands = vec![cond, Operand::Block(else_block)];
                for (label, block) in case_data {
                    operands.push(Operand::Const(label));
                    operands.push(Operand::Block(block));
                }
                self.program
                    .append_instr(origin, InstrKind::Match(*op), LiteralType::Void, operands, "");

                self.insert_point = Some(cont_block);
            }
            Stmt::Assign { variable, expr, .. } => {
                let alloca = match self.variables.get(variable) {
                    Some(&alloca) => alloca,
                    None => {
                        let sym = self.symbols.symbol(*variable);
                        self.type_error(
                            sym.location.clone(),
                            format!("Unknown variable '{}' in assignment.", sym.name),
                        );
                        return;
                    }
                };
                if let Some(value) = self.gen_expr(expr) {
                    self.append(
                        InstrKind::Store,
                        LiteralType::Void,
                        vec![Operand::Instr(alloca), value],
                        "assignment",
                    );
                }
            }
        }
    }

    fn gen_expr(&mut self, expr: &Expr) -> Option<Operand> {
        match expr {
            Expr::Literal { value, .. } => Some(Operand::Const(self.literal_constant(value))),
            Expr::Unary { op, sub, .. } => {
                let value = self.gen_expr(sub)?;
                let name = self.make_name("t");
                let instr = self.append(InstrKind::Unary(*op), op.result_type(), vec![value], &name);
                Some(Operand::Instr(instr))
            }
            Expr::Binary { op, lhs, rhs, .. } if *op == Opcode::BOR => {
                self.gen_short_circuit_or(lhs, rhs)
            }
            Expr::Binary { op, lhs, rhs, .. } => {
                let left = self.gen_expr(lhs)?;
                let right = self.gen_expr(rhs)?;
                let name = self.make_name("t");
                let instr = self.append(
                    InstrKind::Binary(*op),
                    op.result_type(),
                    vec![left, right],
                    &name,
                );
                Some(Operand::Instr(instr))
            }
            Expr::Variable { symbol, location } => {
                let alloca = match self.variables.get(symbol) {
                    Some(&alloca) => alloca,
                    None => {
                        let name = self.symbols.symbol(*symbol).name.clone();
                        self.type_error(
                            location.clone(),
                            format!("Unknown variable '{}'.", name),
                        );
                        return None;
                    }
                };
                let ty = self.program.instr(alloca).ty;
                let name = self.make_name("load");
                let instr =
                    self.append(InstrKind::Load, ty, vec![Operand::Instr(alloca)], &name);
                Some(Operand::Instr(instr))
            }
            Expr::HandlerRef { symbol, .. } => {
                let name = self.symbols.symbol(*symbol).name.clone();
                if !self.generated.contains(symbol) {
                    self.pending.push(*symbol);
                }
                Some(Operand::Const(self.program.get_handler_ref(&name)))
            }
            Expr::RegExpGroup { group, .. } => {
                let group_id = self.program.get_number(*group);
                let name = self.make_name("group");
                let instr = self.append(
                    InstrKind::RegExpGroup,
                    LiteralType::String,
                    vec![Operand::Const(group_id)],
                    &name,
                );
                Some(Operand::Instr(instr))
            }
            Expr::Call {
                callee,
                args,
                location,
            } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args.values() {
                    values.push(self.gen_expr(arg)?);
                }

                match &self.symbols.symbol(*callee).kind {
                    SymbolKind::BuiltinFunction { decl, .. } => {
                        let signature = decl.signature();
                        let ty = decl.return_type();
                        let callee_const = self.program.get_builtin_function(signature);
                        let mut operands = vec![Operand::Const(callee_const)];
                        operands.extend(values);
                        let name = if ty == LiteralType::Void {
                            String::new()
                        } else {
                            self.make_name("call")
                        };
                        let instr = self.append(InstrKind::CallFunction, ty, operands, &name);
                        Some(Operand::Instr(instr))
                    }
                    SymbolKind::BuiltinHandler { decl, .. } => {
                        let signature = decl.signature();
                        let callee_const = self.program.get_builtin_handler(signature);
                        let mut operands = vec![Operand::Const(callee_const)];
                        operands.extend(values);
                        let instr =
                            self.append(InstrKind::InvokeHandler, LiteralType::Void, operands, "");
                        Some(Operand::Instr(instr))
                    }
                    SymbolKind::Handler { .. } => {
                        self.gen_inline(*callee);
                        None
                    }
                    _ => {
                        self.type_error(
                            location.clone(),
                            "Symbol is not callable.".to_string(),
                        );
                        None
                    }
                }
            }
            Expr::Array { elements, location } => {
                let mut constants = Vec::with_capacity(elements.len());
                for element in elements {
                    match self.gen_expr(element)? {
                        Operand::Const(id) => constants.push(id),
                        _ => {
                            self.type_error(
                                location.clone(),
                                "Variable array elements not allowed.".to_string(),
                            );
                            return None;
                        }
                    }
                }
                let ty = expr.ty(self.symbols);
                Some(Operand::Const(self.program.get_array(ty, constants)))
            }
        }
    }

    /// `a || b` becomes an explicit diamond over a boolean stack slot; the
    /// slot itself is the resulting value.
    fn gen_short_circuit_or(&mut self, lhs: &Expr, rhs: &Expr) -> Option<Operand> {
        let left_block = self.create_block("bor.left");
        let right_block = self.create_block("bor.right");
        let cont_block = self.create_block("bor.cont");

        let size = self.program.get_number(1);
        let result = self.append(
            InstrKind::Alloca,
            LiteralType::Boolean,
            vec![Operand::Const(size)],
            "bor",
        );

        let left = self.gen_expr(lhs)?;
        self.create_cond_br(left, left_block, right_block);

        self.insert_point = Some(left_block);
        self.append(
            InstrKind::Store,
            LiteralType::Void,
            vec![Operand::Instr(result), left],
            "bor.left",
        );
        self.create_br(cont_block);

        self.insert_point = Some(right_block);
        let right = self.gen_expr(rhs)?;
        self.append(
            InstrKind::Store,
            LiteralType::Void,
            vec![Operand::Instr(result), right],
            "bor.right",
        );
        self.create_br(cont_block);

        self.insert_point = Some(cont_block);
        Some(Operand::Instr(result))
    }

    fn literal_constant(&mut self, value: &LiteralValue) -> ConstId {
        match value {
            LiteralValue::Boolean(v) => self.program.get_boolean(*v),
            LiteralValue::Number(v) => self.program.get_number(*v),
            LiteralValue::String(v) => self.program.get_string(v),
            LiteralValue::IPAddress(v) => self.program.get_ipaddress(*v),
            LiteralValue::Cidr(v) => self.program.get_cidr(*v),
            LiteralValue::RegExp(v) => self.program.get_regexp(v.clone()),
        }
    }

    fn match_label_constant(&mut self, label: &Expr) -> Option<ConstId> {
        match label {
            Expr::Literal {
                value: LiteralValue::String(s),
                ..
            } => Some(self.program.get_string(s)),
            Expr::Literal {
                value: LiteralValue::RegExp(re),
                ..
            } => Some(self.program.get_regexp(re.clone())),
            other => {
                self.type_error(
                    other.location().clone(),
                    format!(
                        "Invalid literal type <{}> in match case.",
                        other.ty(self.symbols)
                    ),
                );
                None
            }
        }
    }

    // small builder helpers over the arena

    fn append(
        &mut self,
        kind: InstrKind,
        ty: LiteralType,
        operands: Vec<Operand>,
        name: &str,
    ) -> InstrId {
        let block = self
            .insert_point
            .expect("instruction emitted without an insert point");
        self.program.append_instr(block, kind, ty, operands, name)
    }

    fn create_block(&mut self, name: &str) -> BlockId {
        let handler = self.handler.expect("block created outside a handler");
        let name = self.make_name(name);
        self.program.create_block(handler, &name)
    }

    fn create_br(&mut self, target: BlockId) {
        self.append(
            InstrKind::Br,
            LiteralType::Void,
            vec![Operand::Block(target)],
            "",
        );
    }

    fn create_cond_br(&mut self, cond: Operand, on_true: BlockId, on_false: BlockId) {
        self.append(
            InstrKind::CondBr,
            LiteralType::Void,
            vec![cond, Operand::Block(on_true), Operand::Block(on_false)],
            "",
        );
    }

    fn create_ret_false(&mut self) {
        let value = self.program.get_boolean(false);
        self.append(
            InstrKind::Ret,
            LiteralType::Void,
            vec![Operand::Const(value)],
            "",
        );
    }

    fn make_name(&mut self, base: &str) -> String {
        let counter = self.name_counter.entry(base.to_string()).or_insert(0);
        *counter += 1;
        if *counter == 1 {
            base.to_string()
        } else {
            format!("{}{}", base, *counter - 1)
        }
    }

    fn type_error(&mut self, location: crate::language::span::SourceLocation, text: String) {
        self.report.type_error(location, text);
        self.errors += 1;
    }
}
