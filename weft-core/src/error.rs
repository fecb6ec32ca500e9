//! Error types for the weft middle-end.
//!
//! Passes return `Result<T>`. Structural non-applicability of a rewrite is
//! never an error: those paths return `Option` and fall back. A
//! `CompilerError` means either malformed input IR, a broken invariant
//! inside a pass, or a runtime fault in the reference interpreter.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompilerError {
    /// A pass found the IR in a state that earlier passes should have
    /// ruled out. Aborts the enclosing function.
    #[error("internal compiler error: {0}")]
    InternalError(String),

    /// The input program does not satisfy the IR contract.
    #[error("malformed IR: {0}")]
    IrError(String),

    /// The reference interpreter hit a runtime fault.
    #[error("evaluation error: {0}")]
    EvalError(String),

    /// The verifier rejected the program.
    #[error("verification failed:\n{}", .0.join("\n"))]
    VerifyError(Vec<String>),
}

pub type Result<T> = std::result::Result<T, CompilerError>;

#[macro_export]
macro_rules! err_internal {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::InternalError(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! bail_internal {
    ($($arg:tt)*) => {
        return Err($crate::err_internal!($($arg)*))
    };
}

#[macro_export]
macro_rules! err_ir {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::IrError(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! bail_ir {
    ($($arg:tt)*) => {
        return Err($crate::err_ir!($($arg)*))
    };
}

#[macro_export]
macro_rules! err_eval {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::EvalError(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! bail_eval {
    ($($arg:tt)*) => {
        return Err($crate::err_eval!($($arg)*))
    };
}
