//! Error classes shared by the engine and the bridge
//!
//! Native functions report failure through the engine calling convention: a
//! negative return code selects the error class that gets thrown into the
//! script. Host-facing operations surface failures as [`EngineError`].

use thiserror::Error;

use crate::bridge::BridgeError;

/// Generic error (`Error`).
pub const RET_ERROR: i32 = -1;
/// `EvalError`.
pub const RET_EVAL_ERROR: i32 = -2;
/// `RangeError`.
pub const RET_RANGE_ERROR: i32 = -3;
/// `ReferenceError`.
pub const RET_REFERENCE_ERROR: i32 = -4;
/// `SyntaxError`.
pub const RET_SYNTAX_ERROR: i32 = -5;
/// `TypeError`.
pub const RET_TYPE_ERROR: i32 = -6;

/// Script-visible error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    Eval,
    Range,
    Reference,
    Syntax,
    Type,
}

impl ErrorKind {
    /// Constructor name as seen by scripts.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::Eval => "EvalError",
            ErrorKind::Range => "RangeError",
            ErrorKind::Reference => "ReferenceError",
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Type => "TypeError",
        }
    }

    /// Native return code that raises this class.
    pub fn ret_code(self) -> i32 {
        match self {
            ErrorKind::Error => RET_ERROR,
            ErrorKind::Eval => RET_EVAL_ERROR,
            ErrorKind::Range => RET_RANGE_ERROR,
            ErrorKind::Reference => RET_REFERENCE_ERROR,
            ErrorKind::Syntax => RET_SYNTAX_ERROR,
            ErrorKind::Type => RET_TYPE_ERROR,
        }
    }

    /// Maps a negative native return code back to its class.
    ///
    /// Unknown negative codes fall back to the generic `Error`.
    pub fn from_ret_code(rc: i32) -> Self {
        match rc {
            RET_EVAL_ERROR => ErrorKind::Eval,
            RET_RANGE_ERROR => ErrorKind::Range,
            RET_REFERENCE_ERROR => ErrorKind::Reference,
            RET_SYNTAX_ERROR => ErrorKind::Syntax,
            RET_TYPE_ERROR => ErrorKind::Type,
            _ => ErrorKind::Error,
        }
    }
}

/// Outcome of a protected engine operation.
///
/// Either way exactly one value is left on the value stack: the result on
/// success, the thrown value on error.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    Error,
}

impl ExecStatus {
    pub fn is_success(self) -> bool {
        self == ExecStatus::Success
    }

    pub fn is_error(self) -> bool {
        self == ExecStatus::Error
    }
}

/// Failures surfaced to the host by [`crate::VM::eval_with_suite`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The source failed to parse or threw while running.
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// Applying the evaluated value to the bridging object failed.
    #[error("call failed: {0}")]
    Call(String),

    /// A host reference could not be bridged into the engine.
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl EngineError {
    /// The engine's rendered message, without the failure-kind prefix.
    pub fn message(&self) -> String {
        match self {
            EngineError::Evaluation(msg) | EngineError::Call(msg) => msg.clone(),
            EngineError::Bridge(err) => err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ret_codes_round_trip_through_kinds() {
        for kind in [
            ErrorKind::Error,
            ErrorKind::Eval,
            ErrorKind::Range,
            ErrorKind::Reference,
            ErrorKind::Syntax,
            ErrorKind::Type,
        ] {
            assert!(kind.ret_code() < 0);
            assert_eq!(ErrorKind::from_ret_code(kind.ret_code()), kind);
        }
    }

    #[test]
    fn test_unknown_ret_code_is_generic_error() {
        assert_eq!(ErrorKind::from_ret_code(-42), ErrorKind::Error);
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::Evaluation("SyntaxError: bad".into());
        assert_eq!(err.to_string(), "evaluation failed: SyntaxError: bad");
        assert_eq!(err.message(), "SyntaxError: bad");
    }
}
