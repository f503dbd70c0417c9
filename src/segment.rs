use std::collections::BTreeMap;

/// Source position of a segment, for diagnostics.
///
/// `line` is 1-based, `column` is 0-based, both pointing at the first
/// character of the segment. `length` covers the whole segment in bytes
/// (including any nested children) and is filled in when the segment is
/// closed.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourcePos {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
    pub length: usize,
}

/// A block parameter value: either a quoted literal taken verbatim, or
/// a bare token interpreted as a context path resolved at render time.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Literal(String),
    Path(String),
}

/// One node of the parsed template tree.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// A run of literal text, escapes already processed.
    Text(String),
    /// A bare `{{context.path}flags}` write of resolved data.
    Interpolation(InterpolationSegment),
    /// A typed directive block.
    Block(BlockSegment),
}

#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct InterpolationSegment {
    pub path: String,
    /// Output modifier flags in declared order.
    pub modifiers: String,
    pub pos: SourcePos,
}

/// A typed block and its sibling chain.
///
/// The original representation links `~`-joined siblings through
/// `headSegment`/`nextSegment` pointers; here the whole chain is the
/// ordered `branches` vector, with branch 0 as the head.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSegment {
    pub tag: char,
    pub branches: Vec<Branch>,
    pub pos: SourcePos,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Branch {
    pub name: Option<String>,
    pub context: Option<String>,
    pub literal: Option<String>,
    pub params: Option<BTreeMap<String, ParamValue>>,
    pub modifiers: String,
    pub children: Vec<Segment>,
    pub self_closing: bool,
    pub pos: SourcePos,
}

impl BlockSegment {
    /// The head branch of the sibling chain. A block always has at
    /// least one branch by construction.
    pub fn head(&self) -> &Branch {
        &self.branches[0]
    }
}

impl Segment {
    pub fn pos(&self) -> SourcePos {
        match self {
            Self::Text(_) => SourcePos::default(),
            Self::Interpolation(seg) => seg.pos,
            Self::Block(seg) => seg.pos,
        }
    }
}
