//! Lowering from parsed Ruby syntax trees to `rubra-ir`.
//!
//! The entry points here drive a [`builder::Builder`] over a
//! [`ast::ParseResult`] and hand back the root scope's finished
//! [`InterpreterContext`]. Nested scopes (methods, blocks, class bodies)
//! are built eagerly and registered with the shared [`IrManager`].

#![forbid(unsafe_code)]

use std::time::Duration;

use rubra_ir::{InterpreterContext, IrManager, ScopeId};

pub mod ast;
pub mod builder;

pub use ast::{ParseResult, TreeDialect};

/// Fatal error raised while lowering. Ruby reports jump misuse
/// (`Invalid break`, `Can't escape from eval with redo`, ...) as
/// syntax errors at this stage, so that is the dominant variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("{}:{}: {}", file, line + 1, message)]
    Syntax { file: String, line: u32, message: String },
}

impl BuildError {
    pub fn syntax(file: impl Into<String>, line: u32, message: impl Into<String>) -> BuildError {
        BuildError::Syntax {
            file: file.into(),
            line,
            message: message.into(),
        }
    }
}

/// Knobs that change what the builder emits.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuildOptions {
    /// Emit trace instructions for call/return/class/block events and
    /// keep backtrace information even where it could be elided.
    pub full_trace: bool,
}

/// Wall-clock accounting for one root build.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuildMetrics {
    pub lower_time: Duration,
}

/// A finished root build: the scope handle, its context, and timings.
/// Contexts of nested scopes are reachable through the manager.
#[derive(Debug)]
pub struct BuildOutput {
    pub scope: ScopeId,
    pub context: InterpreterContext,
    pub metrics: BuildMetrics,
}

/// Lower a whole parsed file rooted at a script body.
pub fn build_script(
    manager: &IrManager,
    options: &BuildOptions,
    parse: &ParseResult,
) -> Result<BuildOutput, BuildError> {
    builder::Builder::build_root(manager, options, parse)
}

/// Lower an `eval` string in the context of an existing scope.
pub fn build_eval(
    manager: &IrManager,
    options: &BuildOptions,
    parse: &ParseResult,
    eval_type: builder::EvalType,
    containing_scope: ScopeId,
) -> Result<BuildOutput, BuildError> {
    builder::Builder::build_eval_root(manager, options, parse, eval_type, containing_scope)
}
