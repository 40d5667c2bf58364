use crate::diagnostics::Report;
use crate::ir::passes::PassManager;
use crate::ir::{GLOBAL_INIT_HANDLER, IrProgram};
use crate::language::irgen;
use crate::language::parser::{Feature, ParsedUnit, Parser};
use crate::language::span::SourceLocation;
use crate::language::types::LiteralType;
use crate::vm::codegen;
use crate::vm::error::RuntimeResult;
use crate::vm::program::Program;
use crate::vm::runner::{NO_QUOTA, Quota, Runner, TraceLogger};
use crate::vm::runtime::{NativeBuilder, Runtime};
use crate::vm::value::Value;
use std::any::Any;
use std::path::Path;

fn reborrow_userdata<'s>(userdata: &'s mut Option<&mut dyn Any>) -> Option<&'s mut dyn Any> {
    match userdata {
        Some(u) => Some(&mut **u),
        None => None,
    }
}

fn reborrow_trace<'s>(trace: &'s mut Option<TraceLogger<'_>>) -> Option<TraceLogger<'s>> {
    match trace {
        Some(t) => Some(&mut **t),
        None => None,
    }
}

/// Convenience API for compiling and running Flow scripts: owns the
/// native-callback registry, the compiled program and the process-lifetime
/// globals vector.
pub struct Interpreter {
    runtime: Runtime,
    program: Option<Program>,
    program_ir: Option<IrProgram>,
    retain_ir: bool,
    debug_transforms: bool,
    globals: Vec<Value>,
    initialized: bool,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            runtime: Runtime::new(),
            program: None,
            program_ir: None,
            retain_ir: false,
            debug_transforms: false,
            globals: Vec::new(),
            initialized: false,
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn register_function(&mut self, name: &str, ret: LiteralType) -> NativeBuilder<'_> {
        self.runtime.register_function(name, ret)
    }

    pub fn register_handler(&mut self, name: &str) -> NativeBuilder<'_> {
        self.runtime.register_handler(name)
    }

    /// Keeps the optimized IR around after code generation, for `dump_ir`.
    pub fn set_retain_ir(&mut self, retain: bool) {
        self.retain_ir = retain;
    }

    /// Enables the pass manager's per-pass debug logging.
    pub fn set_debug_transforms(&mut self, debug: bool) {
        self.debug_transforms = debug;
    }

    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    pub fn ir_program(&self) -> Option<&IrProgram> {
        self.program_ir.as_ref()
    }

    pub fn compile_string(
        &mut self,
        source: &str,
        report: &mut dyn Report,
        optimization_level: i32,
    ) -> bool {
        let parsed = {
            let mut parser = Parser::new(
                &[Feature::GlobalScope, Feature::WhileLoop],
                &mut *report,
                Some(&self.runtime),
            );
            parser.open_string(source);
            parser.parse()
        };
        self.compile(parsed, report, optimization_level)
    }

    pub fn compile_file(
        &mut self,
        path: &Path,
        report: &mut dyn Report,
        optimization_level: i32,
    ) -> bool {
        let parsed = {
            let mut parser = Parser::new(
                &[Feature::GlobalScope, Feature::WhileLoop],
                &mut *report,
                Some(&self.runtime),
            );
            if let Err(error) = parser.open_file(path) {
                report.token_error(
                    SourceLocation::default(),
                    format!("cannot open {}: {}", path.display(), error),
                );
                return false;
            }
            parser.parse()
        };
        self.compile(parsed, report, optimization_level)
    }

    fn compile(
        &mut self,
        parsed: Option<ParsedUnit>,
        report: &mut dyn Report,
        optimization_level: i32,
    ) -> bool {
        let parsed = match parsed {
            Some(parsed) => parsed,
            None => return false,
        };
        if report.contains_failures() {
            return false;
        }

        let mut ir = match irgen::generate(&parsed.unit, &parsed.symbols, report) {
            Some(ir) => ir,
            None => return false,
        };
        if report.contains_failures() {
            return false;
        }

        let mut passes = PassManager::with_optimization_level(optimization_level);
        passes.set_debug(self.debug_transforms);
        passes.run(&mut ir);

        let mut program = codegen::generate(&ir);
        program.link(&self.runtime, report);
        if report.contains_failures() {
            return false;
        }

        self.program_ir = if self.retain_ir { Some(ir) } else { None };
        self.program = Some(program);
        self.globals.clear();
        self.initialized = false;
        true
    }

    /// Runs a handler without userdata, quota or tracing. Returns `false`
    /// when no handler with that name exists.
    pub fn run(&mut self, handler_name: &str) -> RuntimeResult<bool> {
        self.run_with(handler_name, None, NO_QUOTA, None)
    }

    pub fn run_with(
        &mut self,
        handler_name: &str,
        mut userdata: Option<&mut dyn Any>,
        quota: Quota,
        mut trace: Option<TraceLogger<'_>>,
    ) -> RuntimeResult<bool> {
        let program = match &self.program {
            Some(program) => program,
            None => return Ok(false),
        };

        if self.globals.len() < program.globals_count() {
            self.globals.resize(program.globals_count(), Value::Void);
        }

        // global-scope initializers run once per interpreter lifetime,
        // before the first user handler invocation
        if !self.initialized {
            self.initialized = true;
            if let Some(init) = program.find_handler(GLOBAL_INIT_HANDLER) {
                Runner::new(
                    program,
                    &self.runtime,
                    init,
                    &mut self.globals,
                    reborrow_userdata(&mut userdata),
                    NO_QUOTA,
                    reborrow_trace(&mut trace),
                )
                .run()?;
            }
        }

        let handler = match program.find_handler(handler_name) {
            Some(handler) => handler,
            None => return Ok(false),
        };

        Runner::new(
            program,
            &self.runtime,
            handler,
            &mut self.globals,
            userdata,
            quota,
            trace,
        )
        .run()
    }
}
