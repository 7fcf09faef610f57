// Copyright 2025 The Tensile Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::fmt;
use std::{error, result};

use lazy_static::lazy_static;
use regex::Regex;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError, // will never be produced
    BadName,
    NonConcreteNotation,
    OrderMismatch,
    FormatMismatch,
    RepeatedResultVariable,
    ResultVariableNotInExpression,
    Transposition,
    UnsupportedResultLevel,
    NotYetImplemented,
    UndefinedTensor,
    InternalInvariant,
    Generic,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ErrorCode::*;
        let name = match self {
            NoError => "no_error",
            BadName => "bad_name",
            NonConcreteNotation => "non_concrete_notation",
            OrderMismatch => "order_mismatch",
            FormatMismatch => "format_mismatch",
            RepeatedResultVariable => "repeated_result_variable",
            ResultVariableNotInExpression => "result_variable_not_in_expression",
            Transposition => "transposition",
            UnsupportedResultLevel => "unsupported_result_level",
            NotYetImplemented => "not_yet_implemented",
            UndefinedTensor => "undefined_tensor",
            InternalInvariant => "internal_invariant",
            Generic => "generic",
        };

        write!(f, "{}", name)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input notation or formats violate the lowering contract.
    Expression,
    /// The lowering engine itself reached an inconsistent state.
    Internal,
    /// The emitted code could not be executed.
    Execution,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub(crate) details: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, code: ErrorCode, details: Option<String>) -> Self {
        Error {
            kind,
            code,
            details,
        }
    }

    pub fn get_details(&self) -> Option<String> {
        self.details.clone()
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::Expression => "ExpressionError",
            ErrorKind::Internal => "InternalError",
            ErrorKind::Execution => "ExecutionError",
        };
        match self.details {
            Some(ref details) => write!(f, "{}{{{}: {}}}", kind, self.code, details),
            None => write!(f, "{}{{{}}}", kind, self.code),
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;

#[macro_export]
macro_rules! lower_err {
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error::new(
            ErrorKind::Expression,
            ErrorCode::$code,
            Some($str.to_string()),
        ))
    }};
    ($code:tt) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error::new(ErrorKind::Expression, ErrorCode::$code, None))
    }};
}

#[macro_export]
macro_rules! internal_err {
    ($str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error::new(
            ErrorKind::Internal,
            ErrorCode::InternalInvariant,
            Some($str.to_string()),
        ))
    }};
}

#[macro_export]
macro_rules! exec_err {
    ($str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error::new(
            ErrorKind::Execution,
            ErrorCode::Generic,
            Some($str.to_string()),
        ))
    }};
}

/// Tensor and index variable names share C identifier rules; the emitted IR
/// derives variable names from them, so they must be unambiguous.
pub fn is_valid_name(name: &str) -> bool {
    lazy_static! {
        static ref NAME_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    }
    NAME_RE.is_match(name)
}

#[test]
fn test_is_valid_name() {
    assert!(is_valid_name("B"));
    assert!(is_valid_name("row_sums"));
    assert!(is_valid_name("_t0"));
    assert!(!is_valid_name(""));
    assert!(!is_valid_name("2B"));
    assert!(!is_valid_name("a-b"));
    assert!(!is_valid_name("a b"));
}
