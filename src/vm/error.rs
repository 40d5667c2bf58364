use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Faults the VM can hit while running a handler. Compilation problems
/// never surface here; they go through the diagnostics report.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("call to unresolved native `{signature}`; was the program linked?")]
    UnresolvedNative { signature: String },
    #[error("stack underflow at instruction {ip}")]
    StackUnderflow { ip: usize },
    #[error("jump to invalid target {target} at instruction {ip}")]
    InvalidJump { ip: usize, target: usize },
}
