use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::compiler::{CondExpr, Condition, Instr, Program};
use crate::context::{Context, is_truthy};
use crate::engine::Engine;
use crate::error::{CoefficientError, EngineError, RenderError};
use crate::segment::ParamValue;

type RenderResult<T> = Result<T, RenderError>;

/// Partials rendering partials eventually hit this ceiling instead of
/// overflowing the stack.
const MAX_PARTIAL_DEPTH: usize = 64;

/// Receives rendered output incrementally.
pub trait RenderSink {
    fn write_text(&mut self, text: &str) -> RenderResult<()>;
}

impl RenderSink for String {
    fn write_text(&mut self, text: &str) -> RenderResult<()> {
        self.push_str(text);
        Ok(())
    }
}

/// Adapts any [`io::Write`] into a render sink.
#[derive(Debug)]
pub struct IoSink<W: io::Write> {
    inner: W,
}

impl<W: io::Write> IoSink<W> {
    pub fn new(inner: W) -> Self {
        IoSink { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: io::Write> RenderSink for IoSink<W> {
    fn write_text(&mut self, text: &str) -> RenderResult<()> {
        self.inner.write_all(text.as_bytes())?;
        Ok(())
    }
}

/// A helper function registered with the engine. The scope gives
/// access to the resolved context, evaluated parameters, the optional
/// block body, and the output sink.
pub type HelperFn = Box<dyn Fn(&mut HelperScope<'_, '_>) -> RenderResult<()> + Send + Sync>;

pub struct HelperScope<'a, 'e> {
    renderer: &'a mut Renderer<'e>,
    sink: &'a mut dyn RenderSink,
    context: Context,
    params: Option<BTreeMap<String, Value>>,
    body: Option<Arc<Vec<Instr>>>,
}

impl HelperScope<'_, '_> {
    /// The context the helper was invoked with.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The resolved data of the invocation context.
    pub fn data(&self) -> &Value {
        self.context.data()
    }

    /// A parameter value, already evaluated against the caller's
    /// context (quoted parameters become strings).
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.as_ref().and_then(|params| params.get(name))
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn write(&mut self, text: &str) -> RenderResult<()> {
        self.sink.write_text(text)
    }

    /// Renders the helper's block body with the invocation context.
    pub fn render_body(&mut self) -> RenderResult<()> {
        let context = self.context.clone();
        self.render_body_with(&context)
    }

    /// Renders the helper's block body with an explicit context, for
    /// helpers that iterate or rebind data.
    pub fn render_body_with(&mut self, context: &Context) -> RenderResult<()> {
        let Some(body) = self.body.clone() else {
            return Ok(());
        };
        self.renderer.render_body(&body, context, self.sink)
    }
}

/// Executes a compiled program against a context chain. One renderer
/// lives for the duration of a single render call and owns the inline
/// block registry shared by the template and its partials.
pub(crate) struct Renderer<'e> {
    engine: &'e Engine,
    blocks: HashMap<String, BlockEntry>,
    partial_depth: usize,
}

/// A declared inline block: its body, the context chain captured at
/// the point of declaration, and the modifiers declared alongside it.
#[derive(Clone)]
struct BlockEntry {
    body: Arc<Vec<Instr>>,
    context: Context,
    modifiers: String,
}

pub(crate) fn render(
    engine: &Engine,
    program: &Program,
    context: &Context,
    sink: &mut dyn RenderSink,
) -> RenderResult<()> {
    let mut renderer = Renderer {
        engine,
        blocks: HashMap::new(),
        partial_depth: 0,
    };
    renderer.render_body(&program.instrs, context, sink)
}

impl Renderer<'_> {
    fn render_body(
        &mut self,
        instrs: &[Instr],
        context: &Context,
        sink: &mut dyn RenderSink,
    ) -> RenderResult<()> {
        for instr in instrs {
            self.render_instr(instr, context, sink)?;
        }
        Ok(())
    }

    fn render_instr(
        &mut self,
        instr: &Instr,
        context: &Context,
        sink: &mut dyn RenderSink,
    ) -> RenderResult<()> {
        match instr {
            Instr::Text(text) => sink.write_text(text),
            Instr::Interpolate { path, modifiers } => {
                let resolved = context.get_context(path);
                let text = format_value(resolved.data());
                if modifiers.is_empty() {
                    sink.write_text(&text)
                } else {
                    sink.write_text(&self.engine.modifiers().apply(modifiers, &text))
                }
            }
            Instr::Declare {
                name,
                context: declared,
                body,
                modifiers,
            } => {
                let captured = match declared {
                    Some(path) => context.get_context(path),
                    None => context.clone(),
                };
                self.blocks.insert(
                    name.clone(),
                    BlockEntry {
                        body: Arc::clone(body),
                        context: captured,
                        modifiers: modifiers.clone(),
                    },
                );
                Ok(())
            }
            Instr::RenderBlock {
                name,
                context: invoked,
                modifiers,
            } => {
                let Some(entry) = self.blocks.get(name).cloned() else {
                    if self.engine.strict_blocks() {
                        return Err(RenderError::MissingBlock { name: name.clone() });
                    }
                    return Ok(());
                };
                // invocation data lands on top of the chain captured
                // at declaration
                let data = match invoked {
                    Some(path) => context.get_context(path).data().clone(),
                    None => context.data().clone(),
                };
                let render_context = entry.context.push(data);
                // declaration modifiers apply first, then the
                // invocation site's own chain
                self.bracketed(modifiers, sink, |renderer, sink| {
                    renderer.bracketed(&entry.modifiers, sink, |renderer, sink| {
                        renderer.render_body(&entry.body, &render_context, sink)
                    })
                })
            }
            Instr::Partial {
                name,
                context: rebased,
            } => {
                if self.partial_depth >= MAX_PARTIAL_DEPTH {
                    return Err(RenderError::Message(format!(
                        "partial recursion limit exceeded rendering `{name}`"
                    )));
                }
                let program = match self.engine.program_for(name) {
                    Ok(program) => program,
                    Err(CoefficientError::Engine(EngineError::MissingTemplate { name })) => {
                        return Err(RenderError::MissingTemplate { name });
                    }
                    Err(err) => {
                        return Err(RenderError::Partial {
                            name: name.clone(),
                            source: Box::new(err),
                        });
                    }
                };
                let render_context = match rebased {
                    Some(path) => context.get_context(path),
                    None => context.clone(),
                };
                self.partial_depth += 1;
                let result = self.render_body(&program.instrs, &render_context, sink);
                self.partial_depth -= 1;
                result
            }
            Instr::Iterate {
                context: path,
                body,
                modifiers,
            } => {
                let resolved = context.get_context(path);
                self.bracketed(modifiers, sink, |renderer, sink| {
                    renderer.render_iterations(body, &resolved, sink)
                })
            }
            Instr::Conditional {
                test,
                context: rebased,
                then_body,
                else_body,
                modifiers,
            } => {
                let base = match rebased {
                    Some(path) => context.get_context(path),
                    None => context.clone(),
                };
                let truthy = match test {
                    Condition::Path(path) => is_truthy(base.get_context(path).data()),
                    Condition::Expr(expr) => eval_condition(expr, &base),
                };
                let body = if truthy {
                    Some(then_body)
                } else {
                    else_body.as_ref()
                };
                let Some(body) = body else {
                    return Ok(());
                };
                self.bracketed(modifiers, sink, |renderer, sink| {
                    renderer.render_body(body, context, sink)
                })
            }
            Instr::Helper {
                name,
                context: rebased,
                params,
                body,
                modifiers,
            } => {
                let engine = self.engine;
                let Some(helper) = engine.helper(name) else {
                    return Err(RenderError::MissingHelper { name: name.clone() });
                };
                let invoked = match rebased {
                    Some(path) => context.get_context(path),
                    None => context.clone(),
                };
                let params = params.as_ref().map(|params| {
                    params
                        .iter()
                        .map(|(key, value)| {
                            let value = match value {
                                ParamValue::Literal(text) => Value::String(text.clone()),
                                ParamValue::Path(path) => {
                                    context.get_context(path).data().clone()
                                }
                            };
                            (key.clone(), value)
                        })
                        .collect::<BTreeMap<_, _>>()
                });

                self.bracketed(modifiers, sink, |renderer, sink| {
                    let mut scope = HelperScope {
                        renderer,
                        sink,
                        context: invoked,
                        params,
                        body: body.clone(),
                    };
                    helper(&mut scope)
                })
            }
        }
    }

    fn render_iterations(
        &mut self,
        body: &[Instr],
        resolved: &Context,
        sink: &mut dyn RenderSink,
    ) -> RenderResult<()> {
        match resolved.data() {
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    self.render_iteration(body, resolved, index, None, item.clone(), sink)?;
                }
                Ok(())
            }
            Value::Object(entries) => {
                for (index, (key, value)) in entries.iter().enumerate() {
                    self.render_iteration(
                        body,
                        resolved,
                        index,
                        Some(key.clone()),
                        value.clone(),
                        sink,
                    )?;
                }
                Ok(())
            }
            Value::Number(n) => {
                let count = n.as_u64().unwrap_or(0) as usize;
                for index in 0..count {
                    self.render_iteration(body, resolved, index, None, Value::from(index), sink)?;
                }
                Ok(())
            }
            // anything else iterates zero times
            _ => Ok(()),
        }
    }

    /// Pushes two layers per iteration: a record with the position
    /// metadata, then the element value itself, so `{{.}}` is the
    /// element and `{{.index}}` or `{{.key}}` reach one layer up.
    fn render_iteration(
        &mut self,
        body: &[Instr],
        resolved: &Context,
        index: usize,
        key: Option<String>,
        value: Value,
        sink: &mut dyn RenderSink,
    ) -> RenderResult<()> {
        let mut record = Map::new();
        record.insert("index".to_string(), Value::from(index));
        if let Some(key) = key {
            record.insert("key".to_string(), Value::String(key));
        }
        record.insert("value".to_string(), value.clone());

        let context = resolved.push(Value::Object(record)).push(value);
        self.render_body(body, &context, sink)
    }

    /// Runs `render` against a buffer when modifiers are present so
    /// the chain transforms exactly this block's output and nothing
    /// around it.
    fn bracketed<F>(
        &mut self,
        modifiers: &str,
        sink: &mut dyn RenderSink,
        render: F,
    ) -> RenderResult<()>
    where
        F: FnOnce(&mut Self, &mut dyn RenderSink) -> RenderResult<()>,
    {
        if modifiers.is_empty() {
            return render(self, sink);
        }
        let mut buffer = String::new();
        render(self, &mut buffer)?;
        sink.write_text(&self.engine.modifiers().apply(modifiers, &buffer))
    }
}

fn eval_condition(expr: &CondExpr, base: &Context) -> bool {
    match expr {
        CondExpr::Path(path) => is_truthy(base.get_context(path).data()),
        CondExpr::Not(inner) => !eval_condition(inner, base),
        CondExpr::And(left, right) => eval_condition(left, base) && eval_condition(right, base),
        CondExpr::Or(left, right) => eval_condition(left, base) || eval_condition(right, base),
    }
}

/// The textual form of a value interpolated into output. Strings pass
/// through unquoted; compound values serialize as compact JSON.
pub(crate) fn format_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string(value).unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    #[ntest::timeout(100)]
    fn test_truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(0.5)));
        assert!(is_truthy(&json!("no")));
        assert!(is_truthy(&json!([0])));
        assert!(is_truthy(&json!({"a": null})));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_format_value() {
        assert_eq!(format_value(&Value::Null), "");
        assert_eq!(format_value(&json!("plain")), "plain");
        assert_eq!(format_value(&json!(12.5)), "12.5");
        assert_eq!(format_value(&json!(true)), "true");
        assert_eq!(format_value(&json!([1, 2])), "[1,2]");
        assert_eq!(format_value(&json!({"a": 1})), "{\"a\":1}");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_condition_evaluation() {
        let base = Context::new(json!({"a": 1, "b": 0}));
        let expr = crate::compiler::parse_condition("[a] && ![b]").unwrap();
        assert!(eval_condition(&expr, &base));
        let expr = crate::compiler::parse_condition("[b] || [missing]").unwrap();
        assert!(!eval_condition(&expr, &base));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_io_sink_writes_through() {
        let mut sink = IoSink::new(Vec::new());
        sink.write_text("chunk one ").unwrap();
        sink.write_text("chunk two").unwrap();
        assert_eq!(sink.into_inner(), b"chunk one chunk two");
    }
}
