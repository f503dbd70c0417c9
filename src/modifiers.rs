use std::collections::BTreeMap;
use std::fmt;

/// A pure output transform keyed by a single-character flag.
pub type ModifierFn = Box<dyn Fn(&str) -> String + Send + Sync>;

/// The render-time modifier table for one engine instance.
///
/// Parse-time validity of a flag character is tracked separately by
/// [`crate::syntax::Syntax`]; this registry holds the actual transform
/// functions applied to written output.
pub struct ModifierRegistry {
    modifiers: BTreeMap<char, ModifierFn>,
}

impl Default for ModifierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModifierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModifierRegistry")
            .field("flags", &self.modifiers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModifierRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            modifiers: BTreeMap::new(),
        };
        registry.register('e', Box::new(uri_escape));
        registry.register('h', Box::new(html_escape));
        registry.register('j', Box::new(|v| {
            serde_json::to_string(v).unwrap_or_default()
        }));
        registry.register('U', Box::new(|v| v.to_uppercase()));
        registry.register('l', Box::new(|v| v.to_lowercase()));
        registry.register('C', Box::new(capitalize));
        registry
    }

    pub fn register(&mut self, flag: char, modifier: ModifierFn) {
        self.modifiers.insert(flag, modifier);
    }

    pub fn unregister(&mut self, flag: char) {
        self.modifiers.remove(&flag);
    }

    pub fn get(&self, flag: char) -> Option<&ModifierFn> {
        self.modifiers.get(&flag)
    }

    /// Applies a flag chain to a value, left to right in declared
    /// order. Flags without a registered transform pass the value
    /// through unchanged.
    pub fn apply(&self, flags: &str, value: &str) -> String {
        let mut out = value.to_string();
        for flag in flags.chars() {
            if let Some(modifier) = self.get(flag) {
                out = modifier(&out);
            }
        }
        out
    }
}

/// Percent-encodes everything outside the URI-component unreserved set.
fn uri_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '!' | '~' | '*' | '\'' | '('
            | ')' => out.push(c),
            _ => {
                const HEX: &[u8; 16] = b"0123456789ABCDEF";
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    out.push('%');
                    out.push(HEX[usize::from(byte >> 4)] as char);
                    out.push(HEX[usize::from(byte & 0x0f)] as char);
                }
            }
        }
    }
    out
}

fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
