use crate::cidr::Cidr;
use crate::diagnostics::Report;
use crate::language::types::MatchClass;
use crate::regexp::RegExp;
use crate::vm::instruction::{self, Instruction, Opcode};
use crate::vm::runtime::{Runtime, Signature};
use std::fmt::Write as _;
use std::net::IpAddr;
use std::rc::Rc;

#[derive(Clone, Debug)]
pub struct MatchCaseDef {
    /// Pool index of the label constant; a string for `Same`/`Head`/`Tail`
    /// comparisons, a regexp for `RegExp`.
    pub label: usize,
    pub pc: usize,
}

#[derive(Clone, Debug)]
pub struct MatchDef {
    pub op: MatchClass,
    pub else_pc: usize,
    pub cases: Vec<MatchCaseDef>,
}

/// Interned per-program constants, indexed by bytecode operands.
#[derive(Debug, Default)]
pub struct ConstantPool {
    numbers: Vec<i64>,
    strings: Vec<String>,
    ipaddrs: Vec<IpAddr>,
    cidrs: Vec<Cidr>,
    regexps: Vec<RegExp>,
    int_arrays: Vec<Rc<Vec<i64>>>,
    string_arrays: Vec<Rc<Vec<String>>>,
    ipaddr_arrays: Vec<Rc<Vec<IpAddr>>>,
    cidr_arrays: Vec<Rc<Vec<Cidr>>>,
    match_defs: Vec<MatchDef>,
    native_functions: Vec<Signature>,
    native_handlers: Vec<Signature>,
    pub modules: Vec<(String, String)>,
}

fn find_or_push<T: PartialEq>(table: &mut Vec<T>, value: T) -> usize {
    match table.iter().position(|existing| *existing == value) {
        Some(index) => index,
        None => {
            table.push(value);
            table.len() - 1
        }
    }
}

impl ConstantPool {
    pub fn make_number(&mut self, value: i64) -> usize {
        find_or_push(&mut self.numbers, value)
    }

    pub fn make_string(&mut self, value: &str) -> usize {
        match self.strings.iter().position(|s| s == value) {
            Some(index) => index,
            None => {
                self.strings.push(value.to_string());
                self.strings.len() - 1
            }
        }
    }

    pub fn make_ipaddr(&mut self, value: IpAddr) -> usize {
        find_or_push(&mut self.ipaddrs, value)
    }

    pub fn make_cidr(&mut self, value: Cidr) -> usize {
        find_or_push(&mut self.cidrs, value)
    }

    pub fn make_regexp(&mut self, value: RegExp) -> usize {
        find_or_push(&mut self.regexps, value)
    }

    pub fn make_int_array(&mut self, elements: Vec<i64>) -> usize {
        match self.int_arrays.iter().position(|a| **a == elements) {
            Some(index) => index,
            None => {
                self.int_arrays.push(Rc::new(elements));
                self.int_arrays.len() - 1
            }
        }
    }

    pub fn make_string_array(&mut self, elements: Vec<String>) -> usize {
        match self.string_arrays.iter().position(|a| **a == elements) {
            Some(index) => index,
            None => {
                self.string_arrays.push(Rc::new(elements));
                self.string_arrays.len() - 1
            }
        }
    }

    pub fn make_ipaddr_array(&mut self, elements: Vec<IpAddr>) -> usize {
        match self.ipaddr_arrays.iter().position(|a| **a == elements) {
            Some(index) => index,
            None => {
                self.ipaddr_arrays.push(Rc::new(elements));
                self.ipaddr_arrays.len() - 1
            }
        }
    }

    pub fn make_cidr_array(&mut self, elements: Vec<Cidr>) -> usize {
        match self.cidr_arrays.iter().position(|a| **a == elements) {
            Some(index) => index,
            None => {
                self.cidr_arrays.push(Rc::new(elements));
                self.cidr_arrays.len() - 1
            }
        }
    }

    /// Match definitions are one-per-instruction, never interned.
    pub fn make_match_def(&mut self, def: MatchDef) -> usize {
        self.match_defs.push(def);
        self.match_defs.len() - 1
    }

    pub fn match_def_mut(&mut self, index: usize) -> &mut MatchDef {
        &mut self.match_defs[index]
    }

    pub fn make_native_function(&mut self, signature: Signature) -> usize {
        find_or_push(&mut self.native_functions, signature)
    }

    pub fn make_native_handler(&mut self, signature: Signature) -> usize {
        find_or_push(&mut self.native_handlers, signature)
    }

    pub fn number(&self, index: usize) -> i64 {
        self.numbers[index]
    }

    pub fn string(&self, index: usize) -> &str {
        &self.strings[index]
    }

    pub fn ipaddr(&self, index: usize) -> IpAddr {
        self.ipaddrs[index]
    }

    pub fn cidr(&self, index: usize) -> Cidr {
        self.cidrs[index]
    }

    pub fn regexp(&self, index: usize) -> &RegExp {
        &self.regexps[index]
    }

    pub fn int_array(&self, index: usize) -> &Rc<Vec<i64>> {
        &self.int_arrays[index]
    }

    pub fn string_array(&self, index: usize) -> &Rc<Vec<String>> {
        &self.string_arrays[index]
    }

    pub fn ipaddr_array(&self, index: usize) -> &Rc<Vec<IpAddr>> {
        &self.ipaddr_arrays[index]
    }

    pub fn cidr_array(&self, index: usize) -> &Rc<Vec<Cidr>> {
        &self.cidr_arrays[index]
    }

    pub fn match_def(&self, index: usize) -> &MatchDef {
        &self.match_defs[index]
    }

    pub fn native_function(&self, index: usize) -> &Signature {
        &self.native_functions[index]
    }

    pub fn native_handler(&self, index: usize) -> &Signature {
        &self.native_handlers[index]
    }

    pub fn native_functions(&self) -> &[Signature] {
        &self.native_functions
    }

    pub fn native_handlers(&self) -> &[Signature] {
        &self.native_handlers
    }
}

/// One compiled Flow handler: a linear code vector plus its statically
/// computed operand-stack bound.
#[derive(Debug)]
pub struct Handler {
    pub name: String,
    code: Vec<Instruction>,
    stack_size: usize,
}

impl Handler {
    pub(crate) fn new(name: String, mut code: Vec<Instruction>) -> Self {
        let terminated = code
            .last()
            .map(|&instr| {
                matches!(instruction::opcode(instr), Opcode::EXIT | Opcode::RET)
            })
            .unwrap_or(false);
        if !terminated {
            code.push(instruction::make_instruction(Opcode::EXIT, 0, 0, 0));
        }
        let stack_size = instruction::compute_stack_size(&code);
        Self {
            name,
            code,
            stack_size,
        }
    }

    pub fn code(&self) -> &[Instruction] {
        &self.code
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn disassemble(&self, pool: &ConstantPool) -> String {
        let mut out = format!(
            ".handler {:<27} ; ({} stack size, {} instructions)\n",
            self.name,
            self.stack_size,
            self.code.len()
        );
        out.push_str(&instruction::disassemble(&self.code, "  ", Some(pool)));
        out
    }
}

/// An executable program: the constant pool, the compiled handlers and —
/// after `link` — resolved references to the host's native callbacks.
#[derive(Debug)]
pub struct Program {
    pool: ConstantPool,
    handlers: Vec<Handler>,
    globals_count: usize,
    native_function_refs: Vec<Option<usize>>,
    native_handler_refs: Vec<Option<usize>>,
}

impl Program {
    pub(crate) fn new(pool: ConstantPool, handlers: Vec<Handler>, globals_count: usize) -> Self {
        Self {
            pool,
            handlers,
            globals_count,
            native_function_refs: Vec::new(),
            native_handler_refs: Vec::new(),
        }
    }

    pub fn constants(&self) -> &ConstantPool {
        &self.pool
    }

    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    pub fn handler(&self, index: usize) -> &Handler {
        &self.handlers[index]
    }

    pub fn handler_index(&self, name: &str) -> Option<usize> {
        self.handlers.iter().position(|h| h.name == name)
    }

    pub fn find_handler(&self, name: &str) -> Option<&Handler> {
        self.handlers.iter().find(|h| h.name == name)
    }

    pub fn globals_count(&self) -> usize {
        self.globals_count
    }

    /// Resolves every native signature in the constant pool against the
    /// runtime registry. Unresolved references become `LinkError`s.
    pub fn link(&mut self, runtime: &Runtime, report: &mut dyn Report) {
        self.native_function_refs = self
            .pool
            .native_functions()
            .iter()
            .map(|signature| {
                let resolved = runtime.find(signature, false);
                if resolved.is_none() {
                    report.link_error(format!("Unresolved native function {}.", signature));
                }
                resolved
            })
            .collect();

        self.native_handler_refs = self
            .pool
            .native_handlers()
            .iter()
            .map(|signature| {
                let resolved = runtime.find(signature, true);
                if resolved.is_none() {
                    report.link_error(format!("Unresolved native handler {}.", signature));
                }
                resolved
            })
            .collect();
    }

    pub fn native_function_ref(&self, pool_index: usize) -> Option<usize> {
        self.native_function_refs.get(pool_index).copied().flatten()
    }

    pub fn native_handler_ref(&self, pool_index: usize) -> Option<usize> {
        self.native_handler_refs.get(pool_index).copied().flatten()
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        for handler in &self.handlers {
            let _ = writeln!(out, "{}", handler.disassemble(&self.pool));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::types::LiteralType;
    use crate::vm::instruction::make_instruction;

    #[test]
    fn pool_interns_primitives() {
        let mut pool = ConstantPool::default();
        assert_eq!(pool.make_number(42), pool.make_number(42));
        assert_eq!(pool.make_string("a"), pool.make_string("a"));
        assert_ne!(pool.make_string("a"), pool.make_string("b"));
        assert_eq!(
            pool.make_int_array(vec![1, 2]),
            pool.make_int_array(vec![1, 2])
        );
    }

    #[test]
    fn handler_appends_exit_epilogue() {
        let handler = Handler::new(
            "t".to_string(),
            vec![make_instruction(Opcode::ILOAD, 1, 0, 0), make_instruction(Opcode::POP, 0, 0, 0)],
        );
        let last = *handler.code().last().unwrap();
        assert_eq!(instruction::opcode(last), Opcode::EXIT);
        assert_eq!(instruction::operand_a(last), 0);
    }

    #[test]
    fn link_reports_unresolved_natives() {
        let mut pool = ConstantPool::default();
        pool.make_native_function(Signature {
            name: "missing".to_string(),
            args: vec![LiteralType::String],
            ret: LiteralType::Void,
        });
        let mut program = Program::new(pool, Vec::new(), 0);

        let runtime = Runtime::new();
        let mut report = crate::diagnostics::BufferedReport::new();
        program.link(&runtime, &mut report);
        assert!(report.contains_failures());
        assert!(report.iter().any(|m| m.text.contains("missing(S)V")));
    }
}
