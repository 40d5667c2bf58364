use clap::{Parser, Subcommand};
use flow_lang::diagnostics::{BufferedReport, DiagnosticKind, Message};
use flow_lang::interpreter::Interpreter;
use flow_lang::language::types::LiteralType;
use flow_lang::vm::instruction;
use miette::{Diagnostic, NamedSource, Report, SourceSpan};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::{env, fs};
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(
    name = "flow",
    version,
    about = "Flow policy language CLI",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compile a Flow script and report diagnostics
    Check {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(short = 'O', long = "optimize", default_value_t = 1)]
        optimize: i32,
    },
    /// Compile a Flow script and run one of its handlers
    Run {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(value_name = "HANDLER", default_value = "main")]
        handler: String,
        #[arg(short = 'O', long = "optimize", default_value_t = 1)]
        optimize: i32,
        /// Print the optimized IR before running
        #[arg(long)]
        dump_ir: bool,
        /// Print the compiled target code before running
        #[arg(long)]
        dump_tc: bool,
        /// Trace every executed instruction to stderr
        #[arg(long)]
        trace: bool,
        /// Abort the run after this many instructions
        #[arg(long)]
        quota: Option<u64>,
        /// Log every optimization pass (also: FLOW_DEBUG_TRANSFORMS=1)
        #[arg(long)]
        debug_transforms: bool,
    },
}

#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
struct CompileDiagnostic {
    #[source_code]
    src: NamedSource<String>,
    #[label("{label}")]
    span: SourceSpan,
    message: String,
    label: String,
}

fn emit_messages(path: &Path, source: &str, report: &BufferedReport) {
    for message in report.iter() {
        if message.location.filename.is_empty() {
            report_plain(message);
            continue;
        }
        let begin = message.location.begin.offset;
        let end = message.location.end.offset.max(begin + 1);
        let diagnostic = CompileDiagnostic {
            src: NamedSource::new(path.display().to_string(), source.to_string()),
            span: (begin, end - begin).into(),
            message: message.text.clone(),
            label: message.kind.to_string(),
        };
        eprintln!("{:?}", Report::new(diagnostic));
    }
}

fn report_plain(message: &Message) {
    if message.kind == DiagnosticKind::Warning {
        eprintln!("Warning: {}", message);
    } else {
        eprintln!("Error: {}", message);
    }
}

fn new_interpreter() -> Interpreter {
    let mut interpreter = Interpreter::new();
    interpreter
        .register_function("print", LiteralType::Void)
        .param::<String>("text")
        .bind(|params| {
            println!("{}", params.get_string(1));
        });
    interpreter
        .register_function("env", LiteralType::String)
        .param::<String>("name")
        .bind(|params| {
            let value = env::var(params.get_string(1)).unwrap_or_default();
            params.set_result(value);
        });
    interpreter
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { file, optimize } => {
            init_tracing(false);
            let mut interpreter = new_interpreter();
            let mut report = BufferedReport::new();
            let ok = interpreter.compile_file(&file, &mut report, optimize);
            let source = fs::read_to_string(&file).unwrap_or_default();
            emit_messages(&file, &source, &report);
            if ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::Run {
            file,
            handler,
            optimize,
            dump_ir,
            dump_tc,
            trace,
            quota,
            debug_transforms,
        } => {
            let debug = debug_transforms
                || env::var("FLOW_DEBUG_TRANSFORMS").map(|v| v == "1").unwrap_or(false);
            init_tracing(debug);

            let mut interpreter = new_interpreter();
            interpreter.set_retain_ir(dump_ir);
            interpreter.set_debug_transforms(debug);

            let mut report = BufferedReport::new();
            if !interpreter.compile_file(&file, &mut report, optimize) {
                let source = fs::read_to_string(&file).unwrap_or_default();
                emit_messages(&file, &source, &report);
                return ExitCode::FAILURE;
            }
            // surviving messages are warnings
            let source = fs::read_to_string(&file).unwrap_or_default();
            emit_messages(&file, &source, &report);

            if dump_ir {
                if let Some(ir) = interpreter.ir_program() {
                    print!("{}", ir.dump());
                }
            }
            if dump_tc {
                if let Some(program) = interpreter.program() {
                    print!("{}", program.dump());
                }
            }

            let mut trace_logger = |instr: u64, ip: usize, sp: usize| {
                eprintln!(
                    "{:4}: {:<24} ; sp={}",
                    ip,
                    instruction::disassemble_instruction(instr, None),
                    sp
                );
            };
            let trace_ref: Option<&mut dyn FnMut(u64, usize, usize)> = if trace {
                Some(&mut trace_logger)
            } else {
                None
            };

            match interpreter.run_with(&handler, None, quota, trace_ref) {
                Ok(decision) => {
                    println!("{} => {}", handler, decision);
                    ExitCode::SUCCESS
                }
                Err(error) => {
                    eprintln!("Runtime error: {}", error);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn init_tracing(debug: bool) {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
}
