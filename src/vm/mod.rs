pub mod codegen;
pub mod error;
pub mod instruction;
pub mod program;
pub mod runner;
pub mod runtime;
pub mod value;
