use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::CompileError;
use crate::segment::{BlockSegment, ParamValue, Segment};
use crate::syntax::{
    COMMENT_TAG, CONDITIONAL_TAG, DECLARE_TAG, HELPER_TAG, INLINE_TAG, ITERATOR_TAG, PARTIAL_TAG,
};

type CompileResult<T> = Result<T, CompileError>;

/// A compiled, immutable renderer program. Cheap to share between
/// renders through an `Arc`; execution state lives in the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub(crate) instrs: Vec<Instr>,
}

/// One renderer instruction. Bodies that are handed out at render time
/// (declared blocks, helper bodies) are reference-counted so a
/// registry entry never needs to copy instructions.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Text(String),
    Interpolate {
        path: String,
        modifiers: String,
    },
    Helper {
        name: String,
        context: Option<String>,
        params: Option<BTreeMap<String, ParamValue>>,
        body: Option<Arc<Vec<Instr>>>,
        modifiers: String,
    },
    Declare {
        name: String,
        context: Option<String>,
        body: Arc<Vec<Instr>>,
        modifiers: String,
    },
    RenderBlock {
        name: String,
        context: Option<String>,
        modifiers: String,
    },
    Partial {
        name: String,
        context: Option<String>,
    },
    Iterate {
        context: String,
        body: Vec<Instr>,
        modifiers: String,
    },
    Conditional {
        test: Condition,
        context: Option<String>,
        then_body: Vec<Instr>,
        else_body: Option<Vec<Instr>>,
        modifiers: String,
    },
}

/// The test of a conditional block: either plain truthiness of a
/// context path, or a boolean expression over `[path]` terms.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Path(String),
    Expr(CondExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CondExpr {
    Path(String),
    Not(Box<CondExpr>),
    And(Box<CondExpr>, Box<CondExpr>),
    Or(Box<CondExpr>, Box<CondExpr>),
}

/// Turns one block segment into at most one instruction. Registered
/// per tag character; custom tags bring their own implementation.
pub trait BlockCompiler: Send + Sync {
    fn compile(&self, block: &BlockSegment, compiler: &Compiler<'_>)
    -> CompileResult<Option<Instr>>;
}

pub struct CompilerRegistry {
    compilers: BTreeMap<char, Arc<dyn BlockCompiler>>,
}

impl std::fmt::Debug for CompilerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerRegistry")
            .field("tags", &self.compilers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for CompilerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilerRegistry {
    pub fn new() -> Self {
        let mut compilers: BTreeMap<char, Arc<dyn BlockCompiler>> = BTreeMap::new();
        compilers.insert(COMMENT_TAG, Arc::new(CommentCompiler));
        compilers.insert(HELPER_TAG, Arc::new(HelperCompiler));
        compilers.insert(DECLARE_TAG, Arc::new(DeclareCompiler));
        compilers.insert(INLINE_TAG, Arc::new(InlineCompiler));
        compilers.insert(PARTIAL_TAG, Arc::new(PartialCompiler));
        compilers.insert(ITERATOR_TAG, Arc::new(IteratorCompiler));
        compilers.insert(CONDITIONAL_TAG, Arc::new(ConditionalCompiler));
        CompilerRegistry { compilers }
    }

    pub fn register(&mut self, tag: char, compiler: Arc<dyn BlockCompiler>) {
        self.compilers.insert(tag, compiler);
    }

    pub fn unregister(&mut self, tag: char) {
        self.compilers.remove(&tag);
    }

    fn get(&self, tag: char) -> Option<&Arc<dyn BlockCompiler>> {
        self.compilers.get(&tag)
    }
}

/// Compiles a segment tree into a renderer program.
pub fn compile(segments: &[Segment], registry: &CompilerRegistry) -> CompileResult<Program> {
    let compiler = Compiler { registry };
    let instrs = compiler.compile_body(segments)?;
    Ok(Program { instrs })
}

pub struct Compiler<'r> {
    registry: &'r CompilerRegistry,
}

impl Compiler<'_> {
    /// Compiles the segments of one body. Block declarations are
    /// hoisted to the front so a block may be rendered lexically
    /// before its declaration within the same body.
    pub fn compile_body(&self, segments: &[Segment]) -> CompileResult<Vec<Instr>> {
        let mut declarations = Vec::new();
        let mut rest = Vec::new();

        for segment in segments {
            match segment {
                Segment::Text(text) => rest.push(Instr::Text(text.clone())),
                Segment::Interpolation(seg) => rest.push(Instr::Interpolate {
                    path: seg.path.clone(),
                    modifiers: seg.modifiers.clone(),
                }),
                Segment::Block(block) => {
                    let Some(generator) = self.registry.get(block.tag) else {
                        return Err(CompileError::UnknownBlockType {
                            tag: block.tag,
                            line: block.pos.line,
                            column: block.pos.column,
                        });
                    };
                    if let Some(instr) = generator.compile(block, self)? {
                        if matches!(instr, Instr::Declare { .. }) {
                            declarations.push(instr);
                        } else {
                            rest.push(instr);
                        }
                    }
                }
            }
        }

        declarations.extend(rest);
        Ok(declarations)
    }
}

fn reject_params(block: &BlockSegment) -> CompileResult<()> {
    if block.head().params.is_some() {
        return Err(CompileError::ParamsNotAllowed {
            tag: block.tag,
            line: block.pos.line,
            column: block.pos.column,
        });
    }
    Ok(())
}

fn invalid(block: &BlockSegment, message: &str) -> CompileError {
    CompileError::InvalidBlock {
        tag: block.tag,
        line: block.pos.line,
        column: block.pos.column,
        message: message.to_string(),
    }
}

/// `{/{"note"/}}` produces no instruction at all.
struct CommentCompiler;

impl BlockCompiler for CommentCompiler {
    fn compile(
        &self,
        block: &BlockSegment,
        _compiler: &Compiler<'_>,
    ) -> CompileResult<Option<Instr>> {
        reject_params(block)?;
        Ok(None)
    }
}

/// `{&{name:context param=value/}}` or `{&{name}}body{&{/}}`.
struct HelperCompiler;

impl BlockCompiler for HelperCompiler {
    fn compile(
        &self,
        block: &BlockSegment,
        compiler: &Compiler<'_>,
    ) -> CompileResult<Option<Instr>> {
        let head = block.head();
        let name = head
            .name
            .clone()
            .ok_or_else(|| invalid(block, "missing helper name"))?;
        let body = if head.self_closing {
            None
        } else {
            Some(Arc::new(compiler.compile_body(&head.children)?))
        };
        Ok(Some(Instr::Helper {
            name,
            context: head.context.clone(),
            params: head.params.clone(),
            body,
            modifiers: head.modifiers.clone(),
        }))
    }
}

/// `{#{name:context}}body{#{/}}` declares an inline block.
struct DeclareCompiler;

impl BlockCompiler for DeclareCompiler {
    fn compile(
        &self,
        block: &BlockSegment,
        compiler: &Compiler<'_>,
    ) -> CompileResult<Option<Instr>> {
        reject_params(block)?;
        let head = block.head();
        let name = head
            .name
            .clone()
            .ok_or_else(|| invalid(block, "missing block name"))?;
        let body = Arc::new(compiler.compile_body(&head.children)?);
        Ok(Some(Instr::Declare {
            name,
            context: head.context.clone(),
            body,
            modifiers: head.modifiers.clone(),
        }))
    }
}

/// `{+{name:context/}}` renders a previously declared block.
struct InlineCompiler;

impl BlockCompiler for InlineCompiler {
    fn compile(
        &self,
        block: &BlockSegment,
        _compiler: &Compiler<'_>,
    ) -> CompileResult<Option<Instr>> {
        reject_params(block)?;
        let head = block.head();
        let name = head
            .name
            .clone()
            .ok_or_else(|| invalid(block, "missing block name"))?;
        Ok(Some(Instr::RenderBlock {
            name,
            context: head.context.clone(),
            modifiers: head.modifiers.clone(),
        }))
    }
}

/// `{>{"template/name":context/}}` renders another stored template.
struct PartialCompiler;

impl BlockCompiler for PartialCompiler {
    fn compile(
        &self,
        block: &BlockSegment,
        _compiler: &Compiler<'_>,
    ) -> CompileResult<Option<Instr>> {
        reject_params(block)?;
        let head = block.head();
        let name = head
            .literal
            .clone()
            .ok_or_else(|| invalid(block, "missing quoted template name"))?;
        Ok(Some(Instr::Partial {
            name,
            context: head.context.clone(),
        }))
    }
}

/// `{@{context}}body{@{/}}` repeats its body over the resolved value.
struct IteratorCompiler;

impl BlockCompiler for IteratorCompiler {
    fn compile(
        &self,
        block: &BlockSegment,
        compiler: &Compiler<'_>,
    ) -> CompileResult<Option<Instr>> {
        reject_params(block)?;
        let head = block.head();
        let context = head
            .context
            .clone()
            .ok_or_else(|| invalid(block, "missing iteration context"))?;
        let body = compiler.compile_body(&head.children)?;
        Ok(Some(Instr::Iterate {
            context,
            body,
            modifiers: head.modifiers.clone(),
        }))
    }
}

/// `{?{context}}then{?{~}}else{?{/}}`, the test either a context path
/// or a quoted `[path]` expression.
struct ConditionalCompiler;

impl BlockCompiler for ConditionalCompiler {
    fn compile(
        &self,
        block: &BlockSegment,
        compiler: &Compiler<'_>,
    ) -> CompileResult<Option<Instr>> {
        reject_params(block)?;
        let head = block.head();

        let test = match (&head.literal, &head.context) {
            (Some(expression), _) => Condition::Expr(parse_condition(expression)?),
            (None, Some(path)) => Condition::Path(path.clone()),
            (None, None) => return Err(invalid(block, "missing condition")),
        };
        // with an expression test, a context only rebases its paths
        let context = head.literal.as_ref().and(head.context.clone());

        let then_body = compiler.compile_body(&head.children)?;
        let else_body = match block.branches.get(1) {
            Some(branch) => Some(compiler.compile_body(&branch.children)?),
            None => None,
        };

        Ok(Some(Instr::Conditional {
            test,
            context,
            then_body,
            else_body,
            modifiers: head.modifiers.clone(),
        }))
    }
}

/// Parses a conditional expression: `[path]` terms combined with `!`,
/// `&&`, `||` and parentheses.
pub fn parse_condition(expression: &str) -> CompileResult<CondExpr> {
    let mut parser = ExprParser {
        chars: expression.chars().collect(),
        pos: 0,
    };
    let expr = parser
        .parse_or()
        .map_err(|message| CompileError::InvalidCondition {
            expression: expression.to_string(),
            message,
        })?;
    parser.skip_whitespace();
    if parser.pos < parser.chars.len() {
        return Err(CompileError::InvalidCondition {
            expression: expression.to_string(),
            message: format!("unexpected trailing input at offset {}", parser.pos),
        });
    }
    Ok(expr)
}

struct ExprParser {
    chars: Vec<char>,
    pos: usize,
}

impl ExprParser {
    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, expected: char) -> Result<(), String> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(format!("expected `{expected}`, found `{c}`")),
            None => Err(format!("expected `{expected}`, found end of input")),
        }
    }

    fn parse_or(&mut self) -> Result<CondExpr, String> {
        let mut left = self.parse_and()?;
        loop {
            self.skip_whitespace();
            if self.peek() == Some('|') {
                self.eat('|')?;
                self.eat('|')?;
                let right = self.parse_and()?;
                left = CondExpr::Or(Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_and(&mut self) -> Result<CondExpr, String> {
        let mut left = self.parse_not()?;
        loop {
            self.skip_whitespace();
            if self.peek() == Some('&') {
                self.eat('&')?;
                self.eat('&')?;
                let right = self.parse_not()?;
                left = CondExpr::And(Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_not(&mut self) -> Result<CondExpr, String> {
        self.skip_whitespace();
        if self.peek() == Some('!') {
            self.pos += 1;
            let inner = self.parse_not()?;
            return Ok(CondExpr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<CondExpr, String> {
        self.skip_whitespace();
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let inner = self.parse_or()?;
                self.skip_whitespace();
                self.eat(')')?;
                Ok(inner)
            }
            Some('[') => {
                self.pos += 1;
                let mut path = String::new();
                loop {
                    match self.peek() {
                        Some(']') => {
                            self.pos += 1;
                            break;
                        }
                        Some(c) => {
                            path.push(c);
                            self.pos += 1;
                        }
                        None => return Err("unterminated `[path]` term".to_string()),
                    }
                }
                if path.is_empty() {
                    return Err("empty `[path]` term".to_string());
                }
                Ok(CondExpr::Path(path))
            }
            Some(c) => Err(format!("expected `[path]`, `!` or `(`, found `{c}`")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}
