//! A streaming text-template engine: templates are scanned into a
//! segment tree, compiled into a renderer program, and executed
//! against a chain of immutable contexts.

mod compiler;
mod context;
mod engine;
mod error;
mod modifiers;
mod parser;
mod renderer;
mod segment;
mod syntax;

// Public exports.
pub use compiler::{
    BlockCompiler, CondExpr, Condition, Compiler, CompilerRegistry, Instr, Program,
    parse_condition,
};
pub use context::Context;
pub use engine::Engine;
pub use error::{
    CoefficientError, CoefficientResult, CompileError, EngineError, ParseError, ParseErrorKind,
    RenderError,
};
pub use modifiers::{ModifierFn, ModifierRegistry};
pub use parser::parse;
pub use renderer::{HelperFn, HelperScope, IoSink, RenderSink};
pub use segment::{BlockSegment, Branch, InterpolationSegment, ParamValue, Segment, SourcePos};
pub use syntax::{BlockRule, ContentKind, Siblings, Syntax};
