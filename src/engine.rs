use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::debug;

use crate::compiler::{self, BlockCompiler, CompilerRegistry, Program};
use crate::context::Context;
use crate::error::{CoefficientResult, EngineError};
use crate::modifiers::{ModifierFn, ModifierRegistry};
use crate::parser;
use crate::renderer::{self, HelperFn, RenderSink};
use crate::syntax::{BlockRule, Syntax};

/// The template store and rendering entry point.
///
/// Templates are registered as source text and compiled lazily on
/// first render; the compiled program is cached and shared across
/// renders. Helpers, modifiers and custom block types are registered
/// up front, before any rendering happens.
pub struct Engine {
    templates: HashMap<String, String>,
    programs: RwLock<HashMap<String, Arc<Program>>>,
    helpers: HashMap<String, HelperFn>,
    syntax: Syntax,
    modifiers: ModifierRegistry,
    compilers: CompilerRegistry,
    strict_blocks: bool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("templates", &self.templates.keys().collect::<Vec<_>>())
            .field("helpers", &self.helpers.keys().collect::<Vec<_>>())
            .field("strict_blocks", &self.strict_blocks)
            .finish_non_exhaustive()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            templates: HashMap::new(),
            programs: RwLock::new(HashMap::new()),
            helpers: HashMap::new(),
            syntax: Syntax::new(),
            modifiers: ModifierRegistry::new(),
            compilers: CompilerRegistry::new(),
            strict_blocks: false,
        }
    }

    /// Stores a template source under a name. Registering the same
    /// name twice is an error; use [`Engine::replace_template`] to
    /// swap a template out.
    pub fn add_template(
        &mut self,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<(), EngineError> {
        let name = name.into();
        if self.templates.contains_key(&name) {
            return Err(EngineError::TemplateExists { name });
        }
        self.templates.insert(name, source.into());
        Ok(())
    }

    /// Stores a template source, replacing any previous template of
    /// the same name and dropping its cached program.
    pub fn replace_template(&mut self, name: impl Into<String>, source: impl Into<String>) {
        let name = name.into();
        self.programs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name);
        self.templates.insert(name, source.into());
    }

    pub fn remove_template(&mut self, name: &str) -> Result<(), EngineError> {
        if self.templates.remove(name).is_none() {
            return Err(EngineError::MissingTemplate {
                name: name.to_string(),
            });
        }
        self.programs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn template_source(&self, name: &str) -> Option<&str> {
        self.templates.get(name).map(String::as_str)
    }

    pub fn register_helper(&mut self, name: impl Into<String>, helper: HelperFn) {
        self.helpers.insert(name.into(), helper);
    }

    pub fn unregister_helper(&mut self, name: &str) {
        self.helpers.remove(name);
    }

    /// Registers a modifier: the flag becomes valid at parse time and
    /// the transform runs at render time. Already-cached programs stay
    /// valid since flags are resolved during rendering.
    pub fn register_modifier(&mut self, flag: char, modifier: ModifierFn) -> Result<(), EngineError> {
        self.syntax.register_modifier(flag)?;
        self.modifiers.register(flag, modifier);
        Ok(())
    }

    pub fn unregister_modifier(&mut self, flag: char) -> Result<(), EngineError> {
        self.syntax.unregister_modifier(flag)?;
        self.modifiers.unregister(flag);
        Ok(())
    }

    /// Registers a custom block type: its scanning rule and its
    /// instruction generator. Cached programs are dropped because the
    /// grammar changed under them.
    pub fn register_block(
        &mut self,
        tag: char,
        rule: BlockRule,
        block_compiler: Arc<dyn BlockCompiler>,
    ) -> Result<(), EngineError> {
        self.syntax.register_rule(tag, rule)?;
        self.compilers.register(tag, block_compiler);
        self.clear_cache();
        Ok(())
    }

    pub fn unregister_block(&mut self, tag: char) -> Result<(), EngineError> {
        self.syntax.unregister_rule(tag)?;
        self.compilers.unregister(tag);
        self.clear_cache();
        Ok(())
    }

    /// In strict mode rendering an undeclared inline block is an
    /// error; by default it renders nothing.
    pub fn set_strict_blocks(&mut self, strict: bool) {
        self.strict_blocks = strict;
    }

    pub fn syntax(&self) -> &Syntax {
        &self.syntax
    }

    /// Renders a stored template against `data` into a string.
    pub fn render(&self, name: &str, data: Value) -> CoefficientResult<String> {
        let mut output = String::new();
        self.render_to(name, data, &mut output)?;
        Ok(output)
    }

    /// Renders a stored template against `data` into any sink,
    /// streaming output as it is produced.
    pub fn render_to(
        &self,
        name: &str,
        data: Value,
        sink: &mut dyn RenderSink,
    ) -> CoefficientResult<()> {
        let program = self.program_for(name)?;
        let context = Context::new(data);
        renderer::render(self, &program, &context, sink)?;
        Ok(())
    }

    /// Renders a one-off template source without storing it. The
    /// compiled program is not cached, but partials referenced by the
    /// source still resolve against stored templates.
    pub fn render_source(&self, source: &str, data: Value) -> CoefficientResult<String> {
        let segments = parser::parse(source, &self.syntax)?;
        let program = compiler::compile(&segments, &self.compilers)?;
        let context = Context::new(data);
        let mut output = String::new();
        renderer::render(self, &program, &context, &mut output)?;
        Ok(output)
    }

    /// The compiled program for a stored template, compiling and
    /// caching it on first use.
    pub(crate) fn program_for(&self, name: &str) -> CoefficientResult<Arc<Program>> {
        if let Some(program) = self
            .programs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(Arc::clone(program));
        }

        let Some(source) = self.templates.get(name) else {
            return Err(EngineError::MissingTemplate {
                name: name.to_string(),
            }
            .into());
        };

        debug!(template = name, "compiling template");
        let segments = parser::parse(source, &self.syntax)?;
        let program = Arc::new(compiler::compile(&segments, &self.compilers)?);
        self.programs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::clone(&program));
        Ok(program)
    }

    pub(crate) fn helper(&self, name: &str) -> Option<&HelperFn> {
        self.helpers.get(name)
    }

    pub(crate) fn modifiers(&self) -> &ModifierRegistry {
        &self.modifiers
    }

    pub(crate) fn strict_blocks(&self) -> bool {
        self.strict_blocks
    }

    fn clear_cache(&self) {
        self.programs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
