use std::collections::BTreeMap;

use crate::error::EngineError;

/// The content kinds a block's opening tag may carry, in the fixed
/// order the scanner advances through them when a non-delimiter
/// character shows up in a zone that does not accept it.
pub(crate) const CONTENT_ORDER: [ContentKind; 4] = [
    ContentKind::Name,
    ContentKind::Literal,
    ContentKind::Context,
    ContentKind::Params,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Name,
    Literal,
    Context,
    Params,
}

/// How many `~`-joined sibling branches a block type accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Siblings {
    Disallowed,
    Max(usize),
    Unbounded,
}

/// The scanning rule for one block-type tag.
///
/// The scanner is representation-driven: rules describe which content
/// zone opens first and which kinds are valid at all, so new directive
/// kinds only need a rule entry (plus a compiler generator), not new
/// branches in the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRule {
    pub opening_content: ContentKind,
    pub name: bool,
    pub literal: bool,
    pub context: bool,
    pub params: bool,
    pub max_siblings: Siblings,
    pub self_closing: bool,
    pub has_closing_marker: bool,
}

impl BlockRule {
    pub(crate) fn accepts(&self, kind: ContentKind) -> bool {
        match kind {
            ContentKind::Name => self.name,
            ContentKind::Literal => self.literal,
            ContentKind::Context => self.context,
            ContentKind::Params => self.params,
        }
    }
}

pub const COMMENT_TAG: char = '/';
pub const HELPER_TAG: char = '&';
pub const DECLARE_TAG: char = '#';
pub const INLINE_TAG: char = '+';
pub const PARTIAL_TAG: char = '>';
pub const ITERATOR_TAG: char = '@';
pub const CONDITIONAL_TAG: char = '?';

const BUILTIN_RULES: [(char, BlockRule); 7] = [
    (
        COMMENT_TAG,
        BlockRule {
            opening_content: ContentKind::Literal,
            name: false,
            literal: true,
            context: false,
            params: false,
            max_siblings: Siblings::Max(1),
            self_closing: true,
            has_closing_marker: true,
        },
    ),
    (
        HELPER_TAG,
        BlockRule {
            opening_content: ContentKind::Name,
            name: true,
            literal: false,
            context: true,
            params: true,
            max_siblings: Siblings::Unbounded,
            self_closing: true,
            has_closing_marker: true,
        },
    ),
    (
        DECLARE_TAG,
        BlockRule {
            opening_content: ContentKind::Name,
            name: true,
            literal: false,
            context: true,
            params: false,
            max_siblings: Siblings::Disallowed,
            self_closing: true,
            has_closing_marker: true,
        },
    ),
    (
        INLINE_TAG,
        BlockRule {
            opening_content: ContentKind::Name,
            name: true,
            literal: false,
            context: true,
            params: false,
            max_siblings: Siblings::Disallowed,
            self_closing: true,
            has_closing_marker: false,
        },
    ),
    (
        PARTIAL_TAG,
        BlockRule {
            opening_content: ContentKind::Literal,
            name: false,
            literal: true,
            context: true,
            params: false,
            max_siblings: Siblings::Disallowed,
            self_closing: true,
            has_closing_marker: false,
        },
    ),
    (
        ITERATOR_TAG,
        BlockRule {
            opening_content: ContentKind::Context,
            name: false,
            literal: false,
            context: true,
            params: false,
            max_siblings: Siblings::Disallowed,
            self_closing: false,
            has_closing_marker: true,
        },
    ),
    (
        CONDITIONAL_TAG,
        BlockRule {
            opening_content: ContentKind::Literal,
            name: false,
            literal: true,
            context: true,
            params: false,
            max_siblings: Siblings::Max(2),
            self_closing: false,
            has_closing_marker: true,
        },
    ),
];

/// Modifier flags the built-in [`crate::modifiers::ModifierRegistry`]
/// implements out of the box.
pub(crate) const BUILTIN_MODIFIER_FLAGS: [char; 6] = ['e', 'h', 'j', 'U', 'l', 'C'];

fn is_valid_tag(tag: char) -> bool {
    tag.is_ascii_alphanumeric() || "_-*^`´$%<\"µ".contains(tag)
}

fn is_valid_modifier(flag: char) -> bool {
    flag.is_ascii_alphanumeric() || "_-*^`´$&!?#%<>\"µ".contains(flag)
}

/// The parse-time rule tables for one engine instance.
///
/// Owned configuration rather than process-global state, so two engines
/// with different custom block types never interfere.
#[derive(Debug, Clone)]
pub struct Syntax {
    rules: BTreeMap<char, BlockRule>,
    builtin_tags: Vec<char>,
    modifier_flags: Vec<char>,
    builtin_flags: Vec<char>,
}

impl Default for Syntax {
    fn default() -> Self {
        Self::new()
    }
}

impl Syntax {
    pub fn new() -> Self {
        let rules: BTreeMap<char, BlockRule> = BUILTIN_RULES.into_iter().collect();
        let builtin_tags = rules.keys().copied().collect();
        Self {
            rules,
            builtin_tags,
            modifier_flags: BUILTIN_MODIFIER_FLAGS.to_vec(),
            builtin_flags: BUILTIN_MODIFIER_FLAGS.to_vec(),
        }
    }

    pub fn rule(&self, tag: char) -> Option<&BlockRule> {
        self.rules.get(&tag)
    }

    pub fn is_modifier(&self, flag: char) -> bool {
        self.modifier_flags.contains(&flag)
    }

    /// Registers a new block-type tag. Built-in tags and tags outside
    /// the identifier character class are rejected.
    pub fn register_rule(&mut self, tag: char, rule: BlockRule) -> Result<(), EngineError> {
        if !is_valid_tag(tag) {
            return Err(EngineError::InvalidTag { tag });
        }
        if self.rules.contains_key(&tag) {
            return Err(EngineError::TagTaken { tag });
        }
        self.rules.insert(tag, rule);
        Ok(())
    }

    pub fn unregister_rule(&mut self, tag: char) -> Result<(), EngineError> {
        if !is_valid_tag(tag) || self.builtin_tags.contains(&tag) {
            return Err(EngineError::InvalidTag { tag });
        }
        self.rules.remove(&tag);
        Ok(())
    }

    /// Makes a modifier flag valid at parse time. The render-time
    /// transform is registered separately on the engine's modifier
    /// registry.
    pub fn register_modifier(&mut self, flag: char) -> Result<(), EngineError> {
        if !is_valid_modifier(flag) {
            return Err(EngineError::InvalidModifier { flag });
        }
        if self.modifier_flags.contains(&flag) {
            return Err(EngineError::ModifierTaken { flag });
        }
        self.modifier_flags.push(flag);
        Ok(())
    }

    pub fn unregister_modifier(&mut self, flag: char) -> Result<(), EngineError> {
        if !is_valid_modifier(flag) || self.builtin_flags.contains(&flag) {
            return Err(EngineError::InvalidModifier { flag });
        }
        self.modifier_flags.retain(|&f| f != flag);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_rules_present() {
        let syntax = Syntax::new();
        for tag in ['/', '&', '#', '+', '>', '@', '?'] {
            assert!(syntax.rule(tag).is_some(), "missing rule for {tag}");
        }
        assert!(syntax.rule('x').is_none());
    }

    #[test]
    fn test_conditional_rule_shape() {
        let syntax = Syntax::new();
        let rule = syntax.rule('?').unwrap();
        assert_eq!(rule.opening_content, ContentKind::Literal);
        assert_eq!(rule.max_siblings, Siblings::Max(2));
        assert!(!rule.self_closing);
        assert!(rule.has_closing_marker);
    }

    #[test]
    fn test_register_rejects_taken_tag() {
        let mut syntax = Syntax::new();
        let rule = *syntax.rule('&').unwrap();
        assert!(matches!(
            syntax.register_rule('?', rule),
            Err(EngineError::TagTaken { tag: '?' })
        ));
        assert!(matches!(
            syntax.register_rule('{', rule),
            Err(EngineError::InvalidTag { tag: '{' })
        ));
        syntax.register_rule('m', rule).unwrap();
        assert!(syntax.rule('m').is_some());
    }

    #[test]
    fn test_unregister_rejects_builtin() {
        let mut syntax = Syntax::new();
        assert!(syntax.unregister_rule('?').is_err());
        let rule = *syntax.rule('&').unwrap();
        syntax.register_rule('m', rule).unwrap();
        syntax.unregister_rule('m').unwrap();
        assert!(syntax.rule('m').is_none());
    }

    #[test]
    fn test_modifier_registration() {
        let mut syntax = Syntax::new();
        assert!(syntax.is_modifier('e'));
        assert!(!syntax.is_modifier('*'));
        syntax.register_modifier('*').unwrap();
        assert!(syntax.is_modifier('*'));
        assert!(syntax.register_modifier('e').is_err());
        syntax.unregister_modifier('*').unwrap();
        assert!(!syntax.is_modifier('*'));
        assert!(syntax.unregister_modifier('e').is_err());
    }
}
