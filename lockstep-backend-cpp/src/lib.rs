#![forbid(unsafe_code)]
#![allow(unused_assignments)]

//! C++ backend.
//!
//! Takes a program that passed the lock-discipline check, with its proxy
//! calls reified, and renders it as C++ against a small runtime header.
//! Inserted locks become scoped guards bound for the enclosing statement;
//! each planned message becomes a message class whose `activate()` performs
//! the all-or-nothing try-lock protocol.

mod emit;
mod runtime;

use lockstep_ast::{Program, Span};
use lockstep_core::{Lowered, ProgramPlan};
use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;

pub use runtime::emit_runtime_h;

#[derive(Debug, Error, Diagnostic)]
#[error("C++ backend error: {message}")]
#[diagnostic(code(lockstep::backend_cpp))]
pub struct CppBackendError {
    pub message: String,
    #[label("here")]
    pub span: Option<Span>,
}

impl CppBackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            span: None,
        }
    }

    pub fn at(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span: Some(span),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EmitOptions {
    /// Emit the runtime header alongside the module.
    pub runtime_header: bool,
    /// Name the module uses to include the runtime header.
    pub header_name: String,
    /// Emit locked accessor functions for dynamic callers.
    pub wrappers: bool,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            runtime_header: true,
            header_name: "lockstep_rt.h".to_string(),
            wrappers: true,
        }
    }
}

#[derive(Debug)]
pub struct CppArtifacts {
    pub runtime_h: Option<String>,
    pub module_cpp: String,
}

/// Render a lowered program. A [`Lowered`] only exists for programs without
/// lock-discipline violations, so nothing unchecked reaches the backend.
pub fn emit_program(lowered: &Lowered, options: &EmitOptions) -> Result<CppArtifacts, CppBackendError> {
    emit_parts(&lowered.checked.program, &lowered.plan, options)
}

fn emit_parts(
    program: &Program,
    plan: &ProgramPlan,
    options: &EmitOptions,
) -> Result<CppArtifacts, CppBackendError> {
    if options.header_name.is_empty() {
        return Err(CppBackendError::new("runtime header name must not be empty"));
    }
    let module_cpp = emit::emit_module_cpp(program, plan, options)?;
    let runtime_h = options.runtime_header.then(emit_runtime_h);
    Ok(CppArtifacts {
        runtime_h,
        module_cpp,
    })
}
