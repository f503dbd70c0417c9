use std::rc::Rc;

use serde_json::{Map, Value};

const PATH_SEP: char = '.';

/// An immutable, path-addressable data-scoping chain.
///
/// A `Context` is one node of a parent-linked cons list over
/// [`serde_json::Value`] data. Navigation never mutates: every scope
/// entry (loop iteration, inline-block invocation, partial include) and
/// every path-resolution step produces a new node sharing the rest of
/// the chain. Cloning is O(1).
#[derive(Debug, Clone)]
pub struct Context {
    node: Rc<Node>,
}

#[derive(Debug)]
struct Node {
    data: Value,
    parent: Option<Context>,
}

impl Context {
    /// Creates a root context over the given data.
    pub fn new(data: Value) -> Self {
        Self {
            node: Rc::new(Node { data, parent: None }),
        }
    }

    /// Returns a new context whose parent is `self`.
    pub fn push(&self, data: Value) -> Self {
        Self {
            node: Rc::new(Node {
                data,
                parent: Some(self.clone()),
            }),
        }
    }

    /// Returns the parent context, or `self` at the root.
    pub fn pop(&self) -> Self {
        self.node.parent.clone().unwrap_or_else(|| self.clone())
    }

    pub fn data(&self) -> &Value {
        &self.node.data
    }

    /// Whether two handles point at the very same chain node.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }

    /// Resolves a dot-separated path against this context, one path
    /// segment at a time.
    ///
    /// An empty segment pops one level (so `".."` inside a path climbs
    /// out of the navigation chain), and the path `"."` returns `self`
    /// unchanged. A numeric key indexes into an array; any other key
    /// map-collects over every element that is an object holding a
    /// truthy value for it, an empty collection collapsing to `{}`
    /// rather than an empty array.
    ///
    /// Each non-empty step pushes a brand-new node, so popping after a
    /// resolution returns to the pre-navigation node, not the semantic
    /// object parent.
    pub fn get_context(&self, path: &str) -> Self {
        if path == "." {
            return self.clone();
        }

        let mut ctx = self.clone();
        for key in path.split(PATH_SEP) {
            if key.is_empty() {
                ctx = ctx.pop();
                continue;
            }

            let data = match ctx.data() {
                Value::Array(items) => match key.parse::<usize>() {
                    // numeric keys index, any other key maps over the
                    // elements
                    Ok(index) => items.get(index).cloned().unwrap_or(Value::Null),
                    Err(_) => {
                        let collected: Vec<Value> = items
                            .iter()
                            .filter_map(|item| item.get(key))
                            .filter(|v| is_truthy(v))
                            .cloned()
                            .collect();
                        if collected.is_empty() {
                            Value::Object(Map::new())
                        } else {
                            Value::Array(collected)
                        }
                    }
                },
                other => other.get(key).cloned().unwrap_or(Value::Null),
            };

            ctx = ctx.push(data);
        }

        ctx
    }

    /// Truthiness used by conditionals: `Null` is false, booleans are
    /// themselves, numbers are non-zero, strings and collections are
    /// non-empty.
    pub fn has_data(&self) -> bool {
        is_truthy(self.data())
    }
}

/// The truthiness predicate shared by conditionals and the array
/// map-collect: absent, false, zero and empty are all falsy.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn persons_context() -> Context {
        Context::new(json!({
            "persons": [
                { "name": { "first": "John", "last": "Smith" } },
                { "name": { "first": "Jane", "last": "Doe" } },
            ],
            "tags": ["Poor", "Average", "Good"],
            "locales": { "en": "English" },
        }))
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_push_and_pop() {
        let ctx = Context::new(json!("foo"));
        let pushed = ctx.push(json!("bar"));

        assert_eq!(pushed.data(), &json!("bar"));
        assert!(!pushed.ptr_eq(&ctx));
        assert!(pushed.pop().ptr_eq(&ctx));

        // Popping past the root is a no-op.
        assert!(ctx.pop().pop().pop().ptr_eq(&ctx));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_dot_path_is_identity() {
        let ctx = persons_context();
        assert!(ctx.get_context(".").ptr_eq(&ctx));
        assert!(ctx.get_context("..").ptr_eq(&ctx));
        assert!(ctx.get_context("......").ptr_eq(&ctx));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_array_map_collection() {
        let ctx = persons_context();

        let names = ctx.get_context("persons.name");
        assert_eq!(names.data().as_array().map(Vec::len), Some(2));

        let firsts = ctx.get_context("persons.name.first");
        assert_eq!(firsts.data(), &json!(["John", "Jane"]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_array_map_collection_skips_falsy_values() {
        let ctx = Context::new(json!({
            "items": [
                { "v": 0 },
                { "v": 1 },
                { "v": "" },
                { "v": false },
                { "v": null },
                { "v": "x" },
            ],
        }));

        assert_eq!(ctx.get_context("items.v").data(), &json!([1, "x"]));

        // an all-falsy collection collapses like an empty one
        let ctx = Context::new(json!({ "items": [{ "v": 0 }, { "v": "" }] }));
        assert_eq!(ctx.get_context("items.v").data(), &json!({}));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_array_numeric_index() {
        let ctx = persons_context();

        assert_eq!(
            ctx.get_context("persons.1.name.first").data(),
            &json!("Jane")
        );
        assert_eq!(ctx.get_context("persons.9").data(), &Value::Null);
        assert_eq!(ctx.get_context("tags.0").data(), &json!("Poor"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_navigation_chain_pops_back() {
        let ctx = persons_context();

        assert!(ctx.get_context("persons").get_context("..").ptr_eq(&ctx));
        assert!(ctx.get_context("persons.name.first...").ptr_eq(&ctx));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_scalar_lookups() {
        let ctx = persons_context();

        assert_eq!(ctx.get_context("tags").data(), &json!(["Poor", "Average", "Good"]));
        assert_eq!(ctx.get_context("locales.en").data(), &json!("English"));
        assert_eq!(
            ctx.get_context("locales.en........locales.en").data(),
            &json!("English")
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_missing_keys_yield_null() {
        let ctx = Context::new(json!({ "index": 0 }));

        assert_eq!(ctx.get_context("index").data(), &json!(0));
        assert_eq!(ctx.get_context("index.foo.bar").data(), &Value::Null);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_empty_collection_collapses_to_object() {
        let ctx = persons_context();
        let missing = ctx.get_context("persons.age");
        assert_eq!(missing.data(), &json!({}));
        assert!(!missing.has_data());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_has_data_truthiness() {
        assert!(!Context::new(Value::Null).has_data());
        assert!(!Context::new(json!(false)).has_data());
        assert!(Context::new(json!(true)).has_data());
        assert!(!Context::new(json!(0)).has_data());
        assert!(Context::new(json!(3)).has_data());
        assert!(!Context::new(json!("")).has_data());
        assert!(Context::new(json!("x")).has_data());
        assert!(!Context::new(json!([])).has_data());
        assert!(!Context::new(json!({})).has_data());
        assert!(Context::new(json!({ "a": 1 })).has_data());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_branching_shares_structure() {
        let ctx = Context::new(json!("foo"));
        let _branch1 = ctx.push(json!("bar1")).push(json!("buz"));
        let _branch2 = ctx.push(json!("bar2")).push(json!("meh"));

        let back = ctx.push(json!("bar")).push(json!("buz")).get_context("..");
        assert_eq!(back.data(), &json!("foo"));
    }
}
