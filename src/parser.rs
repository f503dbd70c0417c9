use std::mem;

use crate::error::{ParseError, ParseErrorKind};
use crate::segment::{
    BlockSegment, Branch, InterpolationSegment, ParamValue, Segment, SourcePos,
};
use crate::syntax::{CONTENT_ORDER, ContentKind, Siblings, Syntax};

type ParseResult<T> = Result<T, ParseError>;

/// Parses a template source into its segment tree.
///
/// The scan is a single forward pass with a one-character pushback for
/// parameter-list lookahead. Any error aborts parsing and discards all
/// partial state; a partially-valid tree is never returned.
pub fn parse(input: &str, syntax: &Syntax) -> ParseResult<Vec<Segment>> {
    let mut parser = Parser::new(input, syntax);
    parser.read_text()?;

    if let Some(frame) = parser.frames.last() {
        if parser.in_quote {
            return Err(parser.make_eof_error(ParseErrorKind::UnclosedQuote));
        }
        return Err(parser.make_eof_error(ParseErrorKind::UnclosedBlock {
            tag: frame.tag.unwrap_or('{'),
        }));
    }

    Ok(parser.root)
}

/// An in-progress block: the branch currently being scanned plus any
/// earlier `~`-joined branches already completed.
#[derive(Debug, Default)]
struct Frame {
    tag: Option<char>,
    branches: Vec<Branch>,
    cur: Branch,
    pos: SourcePos,
}

struct Parser<'a, 's> {
    input: &'a str,
    syntax: &'s Syntax,

    /// Byte offset of the next unread character.
    pos: usize,
    /// Line (1-based) of the next unread character.
    line: usize,
    /// Column (0-based) of the next unread character.
    col: usize,
    /// Scanner state just before the most recent read, for pushback and
    /// error positions.
    prev: (usize, usize, usize),

    buffer: String,
    frames: Vec<Frame>,
    root: Vec<Segment>,

    // Zone flags for the block grammar:
    //   {open{name:context param=value param="quote"/}close}
    open_block: bool,
    close_block: bool,
    in_name: bool,
    in_literal: bool,
    in_context: bool,
    in_param: bool,
    in_param_value: bool,
    in_quote: bool,
    escaped: bool,
}

impl<'a, 's> Parser<'a, 's> {
    fn new(input: &'a str, syntax: &'s Syntax) -> Self {
        Parser {
            input,
            syntax,
            pos: 0,
            line: 1,
            col: 0,
            prev: (0, 1, 0),
            buffer: String::new(),
            frames: Vec::new(),
            root: Vec::new(),
            open_block: false,
            close_block: false,
            in_name: false,
            in_literal: false,
            in_context: false,
            in_param: false,
            in_param_value: false,
            in_quote: false,
            escaped: false,
        }
    }

    fn next_char(&mut self) -> Option<char> {
        let c = self.input[self.pos..].chars().next()?;
        self.prev = (self.pos, self.line, self.col);
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    /// Rewinds the scanner by exactly the last character read.
    fn push_back(&mut self) {
        (self.pos, self.line, self.col) = self.prev;
    }

    fn near_text(&self, offset: usize) -> String {
        let mut start = offset.min(self.input.len()).saturating_sub(10);
        while !self.input.is_char_boundary(start) {
            start -= 1;
        }
        self.input[start..].chars().take(24).collect()
    }

    /// An error positioned at the most recently read character.
    fn make_error(&self, kind: ParseErrorKind) -> ParseError {
        let (offset, line, column) = self.prev;
        ParseError {
            kind,
            line,
            column,
            offset,
            near_text: self.near_text(offset),
        }
    }

    /// An error positioned at the end of input.
    fn make_eof_error(&self, kind: ParseErrorKind) -> ParseError {
        ParseError {
            kind,
            line: self.line,
            column: self.col,
            offset: self.pos,
            near_text: self.near_text(self.pos),
        }
    }

    fn has_buffer(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn flush_buffer(&mut self) -> String {
        mem::take(&mut self.buffer)
    }

    fn children_mut(&mut self) -> &mut Vec<Segment> {
        match self.frames.last_mut() {
            Some(frame) => &mut frame.cur.children,
            None => &mut self.root,
        }
    }

    fn flush_text(&mut self) {
        if self.has_buffer() {
            let text = self.flush_buffer();
            self.children_mut().push(Segment::Text(text));
        }
    }

    fn reset_block_state(&mut self) {
        self.open_block = false;
        self.close_block = false;
        self.in_name = false;
        self.in_literal = false;
        self.in_context = false;
    }

    /// Text mode: copy characters verbatim, `\` escaping one character,
    /// an unescaped `{` opening block mode.
    fn read_text(&mut self) -> ParseResult<()> {
        while let Some(c) = self.next_char() {
            match c {
                '\\' => {
                    if self.escaped {
                        self.escaped = false;
                        self.buffer.push(c);
                    } else {
                        self.escaped = true;
                    }
                }
                '{' => {
                    if self.escaped {
                        self.escaped = false;
                        self.buffer.push(c);
                    } else {
                        self.flush_text();
                        self.read_block()?;
                    }
                }
                _ => {
                    self.escaped = false;
                    self.buffer.push(c);
                }
            }
        }
        self.flush_text();
        Ok(())
    }

    /// Block mode: dispatch on the fixed delimiter grammar until the
    /// opening tag (or a whole self-closing block, or a closing marker)
    /// has been consumed.
    fn read_block(&mut self) -> ParseResult<()> {
        let (offset, line, column) = self.prev;
        let pos = SourcePos {
            line,
            column,
            offset,
            length: 0,
        };
        self.frames.push(Frame {
            tag: None,
            branches: Vec::new(),
            cur: Branch {
                pos,
                ..Branch::default()
            },
            pos,
        });
        self.open_block = true;

        while let Some(c) = self.next_char() {
            match c {
                '\\' => {
                    if self.escaped {
                        self.escaped = false;
                        self.buffer.push(c);
                    } else if !self.in_quote
                        && (self.open_block || self.in_name || self.in_context)
                    {
                        return Err(self.make_error(ParseErrorKind::UnexpectedChar { found: c }));
                    } else {
                        self.escaped = true;
                    }
                }
                '{' => {
                    if self.escaped || self.in_quote {
                        self.escaped = false;
                        self.buffer.push(c);
                    } else if self.open_block {
                        self.open_block = false;
                        if self.has_buffer() {
                            self.flush_block_type()?;
                            if self.in_param {
                                self.read_params()?;
                            }
                        } else {
                            self.in_context = true;
                        }
                    } else {
                        return Err(self.make_error(ParseErrorKind::UnexpectedChar { found: c }));
                    }
                }
                '~' => {
                    if self.escaped || self.in_quote {
                        self.escaped = false;
                        self.buffer.push(c);
                    } else if (self.in_name || self.in_literal || self.in_context)
                        && !self.has_buffer()
                    {
                        self.join_segment()?;
                    } else {
                        return Err(self.make_error(ParseErrorKind::UnexpectedChar { found: c }));
                    }
                }
                '"' => {
                    if self.escaped {
                        self.escaped = false;
                        self.buffer.push(c);
                    } else if self.in_literal {
                        if self.in_quote && self.has_buffer() {
                            self.in_quote = false;
                            self.in_name = false;
                            let literal = self.flush_buffer();
                            self.frame_mut().cur.literal = Some(literal);
                        } else if !self.in_quote && self.frame_mut().cur.literal.is_none() {
                            self.in_quote = true;
                        } else {
                            return Err(
                                self.make_error(ParseErrorKind::UnexpectedChar { found: c })
                            );
                        }
                    } else if self.close_block {
                        // may be a modifier flag
                        self.buffer.push(c);
                    } else {
                        return Err(self.make_error(ParseErrorKind::UnexpectedChar { found: c }));
                    }
                }
                ':' => {
                    if self.escaped || self.in_quote {
                        self.escaped = false;
                        self.buffer.push(c);
                    } else if self.in_name || self.in_literal {
                        if self.in_name {
                            self.flush_name()?;
                        } else {
                            self.in_literal = false;
                        }
                        self.in_context = true;
                    } else {
                        return Err(self.make_error(ParseErrorKind::UnexpectedChar { found: c }));
                    }
                }
                ' ' => {
                    if self.escaped || self.in_quote {
                        self.escaped = false;
                        self.buffer.push(c);
                    } else if self.in_name || self.in_context {
                        if self.in_name {
                            if self.has_buffer() {
                                self.flush_name()?;
                            } else {
                                return Err(self.make_error(ParseErrorKind::MissingName));
                            }
                        } else if self.has_buffer() {
                            self.in_context = false;
                            let context = self.flush_buffer();
                            self.frame_mut().cur.context = Some(context);
                        } else {
                            return Err(self.make_error(ParseErrorKind::MissingContext));
                        }
                        self.read_params()?;
                    } else if self.open_block || self.close_block {
                        return Err(self.make_error(ParseErrorKind::UnexpectedChar { found: c }));
                    }
                    // whitespace between zones is ignored
                }
                '/' => {
                    if self.escaped || self.open_block || self.in_quote {
                        self.escaped = false;
                        self.buffer.push(c);
                    } else if self.close_block || self.frame_mut().cur.self_closing {
                        return Err(self.make_error(ParseErrorKind::UnexpectedChar { found: c }));
                    } else if self.is_closing_marker() {
                        return self.close_marked_block();
                    } else {
                        let tag = self.frame_mut().tag;
                        let self_closing = tag
                            .and_then(|t| self.syntax.rule(t))
                            .is_some_and(|rule| rule.self_closing);
                        if !self_closing {
                            return Err(
                                self.make_error(ParseErrorKind::UnexpectedChar { found: c })
                            );
                        }

                        self.frame_mut().cur.self_closing = true;
                        if self.in_name {
                            if self.has_buffer() {
                                self.flush_name()?;
                            } else {
                                return Err(self.make_error(ParseErrorKind::MissingName));
                            }
                        } else if self.in_context {
                            if self.has_buffer() {
                                let context = self.flush_buffer();
                                self.frame_mut().cur.context = Some(context);
                            } else {
                                return Err(self.make_error(ParseErrorKind::MissingContext));
                            }
                        }
                    }
                }
                '}' => {
                    if self.escaped || self.in_quote {
                        self.escaped = false;
                        self.buffer.push(c);
                    } else if self.close_block {
                        if self.has_buffer() {
                            self.flush_modifiers()?;
                        }
                        let done =
                            self.frame_mut().cur.self_closing || self.frame_mut().tag.is_none();
                        if done {
                            let frame = self.frames.pop().unwrap_or_default();
                            let segment = self.finalize_frame(frame);
                            self.children_mut().push(segment);
                        }
                        self.reset_block_state();
                        return Ok(());
                    } else if self.open_block {
                        return Err(self.make_error(ParseErrorKind::UnexpectedChar { found: c }));
                    } else {
                        if self.in_context {
                            if self.has_buffer() {
                                let context = self.flush_buffer();
                                self.frame_mut().cur.context = Some(context);
                            } else if self.frame_mut().cur.context.is_none()
                                && !self.frame_mut().cur.self_closing
                            {
                                return Err(
                                    self.make_error(ParseErrorKind::UnspecifiedContext)
                                );
                            }
                            self.in_context = false;
                        } else if self.in_name && self.frame_mut().cur.name.is_none() {
                            if self.has_buffer() {
                                self.flush_name()?;
                            } else {
                                return Err(self.make_error(ParseErrorKind::UnnamedBlock));
                            }
                        }
                        self.close_block = true;
                        self.flush_buffer();
                    }
                }
                _ => {
                    if self.in_literal && !self.in_quote {
                        // the active zone does not accept bare content,
                        // advance to the next valid content kind
                        self.next_in_content();
                    }
                    self.escaped = false;
                    self.buffer.push(c);
                }
            }
        }

        // EOF inside a block: reported by the caller's stack check.
        Ok(())
    }

    /// Parameter mode: `name=value` pairs separated by whitespace, a
    /// bare value being a context path and a quoted one a literal.
    /// Terminates on an unescaped `/` or `}`, pushing it back for the
    /// block loop to re-observe.
    fn read_params(&mut self) -> ParseResult<()> {
        let mut param_name: Option<String> = None;
        self.in_param = true;

        while let Some(c) = self.next_char() {
            match c {
                '\\' => {
                    if self.escaped {
                        self.escaped = false;
                        self.buffer.push(c);
                    } else if !self.in_quote {
                        return Err(self.make_error(ParseErrorKind::UnexpectedChar { found: c }));
                    } else {
                        self.escaped = true;
                    }
                }
                '=' => {
                    if self.escaped || self.in_quote {
                        self.escaped = false;
                        self.buffer.push(c);
                    } else if self.in_param {
                        self.in_param = false;
                        self.in_param_value = true;
                        param_name = Some(self.flush_buffer());
                    } else {
                        return Err(self.make_error(ParseErrorKind::UnexpectedChar { found: c }));
                    }
                }
                '"' => {
                    if self.escaped {
                        self.escaped = false;
                        self.buffer.push(c);
                    } else if self.in_quote {
                        self.flush_param(&mut param_name, true)?;
                        match self.peek_char() {
                            Some(' ' | '/' | '}') => self.in_param = true,
                            None => {
                                return Err(self.make_eof_error(ParseErrorKind::UnexpectedEof));
                            }
                            Some(other) => {
                                return Err(self.make_error(ParseErrorKind::UnexpectedChar {
                                    found: other,
                                }));
                            }
                        }
                    } else if self.in_param_value {
                        if self.has_buffer() {
                            return Err(
                                self.make_error(ParseErrorKind::UnexpectedChar { found: c })
                            );
                        }
                        self.in_quote = true;
                    } else {
                        return Err(self.make_error(ParseErrorKind::UnexpectedChar { found: c }));
                    }
                }
                '/' | '}' => {
                    if self.escaped || self.in_quote {
                        self.escaped = false;
                        self.buffer.push(c);
                    } else {
                        if self.has_buffer() {
                            if self.in_param {
                                return Err(
                                    self.make_error(ParseErrorKind::MissingParamValue)
                                );
                            }
                            self.flush_param(&mut param_name, false)?;
                        }
                        self.in_param = false;
                        self.in_param_value = false;
                        self.push_back();
                        return Ok(());
                    }
                }
                ' ' => {
                    if self.escaped || self.in_quote {
                        self.escaped = false;
                        self.buffer.push(c);
                    } else if self.in_param_value {
                        self.flush_param(&mut param_name, false)?;
                    }
                    // else ignore whitespace between params
                }
                _ => {
                    self.escaped = false;
                    self.buffer.push(c);
                }
            }
        }

        // EOF mid-params: reported by the caller's stack check.
        Ok(())
    }

    fn frame_mut(&mut self) -> &mut Frame {
        // Invariant: block-mode handlers only run with an open frame.
        debug_assert!(!self.frames.is_empty());
        if self.frames.is_empty() {
            self.frames.push(Frame::default());
        }
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn flush_block_type(&mut self) -> ParseResult<()> {
        let tag_text = self.flush_buffer();
        let mut chars = tag_text.chars();
        let (tag, rule) = match (chars.next(), chars.next()) {
            (Some(tag), None) => match self.syntax.rule(tag) {
                Some(rule) => (tag, *rule),
                None => {
                    return Err(
                        self.make_error(ParseErrorKind::UnknownBlockType { tag: tag_text })
                    );
                }
            },
            _ => {
                return Err(self.make_error(ParseErrorKind::UnknownBlockType { tag: tag_text }));
            }
        };

        self.frame_mut().tag = Some(tag);
        match rule.opening_content {
            ContentKind::Name => self.in_name = true,
            ContentKind::Literal => self.in_literal = true,
            ContentKind::Context => self.in_context = true,
            ContentKind::Params => self.in_param = true,
        }
        Ok(())
    }

    fn flush_name(&mut self) -> ParseResult<()> {
        if self.has_buffer() {
            let allows_name = self
                .frame_mut()
                .tag
                .and_then(|t| self.syntax.rule(t))
                .is_some_and(|rule| rule.name);
            if !allows_name {
                return Err(self.make_error(ParseErrorKind::Message(
                    "Unexpected block name".to_string(),
                )));
            }
            let name = self.flush_buffer();
            self.frame_mut().cur.name = Some(name);
        }
        self.in_name = false;
        Ok(())
    }

    fn flush_modifiers(&mut self) -> ParseResult<()> {
        let modifiers = self.flush_buffer();
        for flag in modifiers.chars() {
            if !self.syntax.is_modifier(flag) {
                return Err(self.make_error(ParseErrorKind::UnknownModifier { flag }));
            }
        }
        self.frame_mut().cur.modifiers = modifiers;
        Ok(())
    }

    fn flush_param(&mut self, param_name: &mut Option<String>, quoted: bool) -> ParseResult<()> {
        let allows_params = self
            .frame_mut()
            .tag
            .and_then(|t| self.syntax.rule(t))
            .is_some_and(|rule| rule.params);
        if !allows_params {
            return Err(self.make_error(ParseErrorKind::ParamsNotAllowed));
        }

        if let Some(name) = param_name.take() {
            self.in_param_value = false;
            self.in_param = true;
            self.in_quote = false;
            let value = self.flush_buffer();
            let value = if quoted {
                ParamValue::Literal(value)
            } else {
                ParamValue::Path(value)
            };
            self.frame_mut()
                .cur
                .params
                .get_or_insert_default()
                .insert(name, value);
        }
        Ok(())
    }

    /// Whether the `/` just read starts a closing marker: nothing has
    /// been captured by the opening tag so far.
    fn is_closing_marker(&mut self) -> bool {
        if self.has_buffer() {
            return false;
        }
        let cur = &self.frame_mut().cur;
        cur.name.is_none()
            && cur.context.is_none()
            && cur.literal.is_none()
            && cur.params.is_none()
    }

    /// Handles `{tag{/}}`: discard the marker frame and close the
    /// enclosing open block of the same tag.
    fn close_marked_block(&mut self) -> ParseResult<()> {
        let marker = self.frames.pop().unwrap_or_default();

        let can_close = marker
            .tag
            .and_then(|t| self.syntax.rule(t))
            .is_some_and(|rule| rule.has_closing_marker);
        if !can_close {
            return Err(self.make_error(ParseErrorKind::UnexpectedChar { found: '/' }));
        }
        if self.next_char() != Some('}') || self.next_char() != Some('}') {
            return Err(self.make_error(ParseErrorKind::UnexpectedChar { found: '/' }));
        }

        match self.frames.last() {
            Some(open) if open.tag == marker.tag => {}
            Some(_) | None => {
                return Err(self.make_error(ParseErrorKind::MismatchedClosing));
            }
        }

        let frame = self.frames.pop().unwrap_or_default();
        let segment = self.finalize_frame(frame);
        self.children_mut().push(segment);
        self.reset_block_state();
        Ok(())
    }

    /// Re-links the freshly-opened segment as the next sibling branch
    /// of the enclosing block of the same type.
    fn join_segment(&mut self) -> ParseResult<()> {
        let next = self.frames.pop().unwrap_or_default();

        let (prev_tag, branch_count, inherited) = match self.frames.last() {
            Some(prev) => (prev.tag, prev.branches.len(), prev.cur.context.clone()),
            None => return Err(self.make_error(ParseErrorKind::SiblingTypeMismatch)),
        };

        let Some(prev_tag) = prev_tag else {
            return Err(self.make_error(ParseErrorKind::InvalidSiblingTarget));
        };
        if Some(prev_tag) != next.tag {
            return Err(self.make_error(ParseErrorKind::SiblingTypeMismatch));
        }
        let max = self
            .syntax
            .rule(prev_tag)
            .map(|rule| rule.max_siblings)
            .unwrap_or(Siblings::Disallowed);
        match max {
            Siblings::Disallowed => {
                return Err(self.make_error(ParseErrorKind::SiblingNotAllowed));
            }
            Siblings::Max(n) if branch_count + 1 >= n => {
                return Err(self.make_error(ParseErrorKind::TooManySiblings));
            }
            Siblings::Max(_) | Siblings::Unbounded => {}
        }

        let prev = self.frame_mut();
        let finished = mem::replace(&mut prev.cur, next.cur);
        prev.branches.push(finished);
        if prev.cur.context.is_none() {
            prev.cur.context = inherited;
        }
        Ok(())
    }

    /// Moves the single active zone flag to the next content kind the
    /// rule accepts, in fixed order; past the last kind all zones go
    /// dark and content is buffered without a home (discarded on close).
    fn next_in_content(&mut self) {
        let Some(rule) = self.frame_mut().tag.and_then(|t| self.syntax.rule(t).copied()) else {
            return;
        };
        let mut in_content = false;
        for kind in CONTENT_ORDER {
            if !rule.accepts(kind) {
                continue;
            }
            let flag = match kind {
                ContentKind::Name => &mut self.in_name,
                ContentKind::Literal => &mut self.in_literal,
                ContentKind::Context => &mut self.in_context,
                ContentKind::Params => &mut self.in_param,
            };
            if *flag {
                *flag = false;
                in_content = true;
            } else if in_content {
                *flag = true;
                in_content = false;
            } else {
                *flag = false;
            }
        }
    }

    fn finalize_frame(&mut self, mut frame: Frame) -> Segment {
        let end = self.pos;
        frame.cur.pos.length = end.saturating_sub(frame.cur.pos.offset);
        let mut pos = frame.pos;
        pos.length = end.saturating_sub(pos.offset);

        match frame.tag {
            None => Segment::Interpolation(InterpolationSegment {
                path: frame.cur.context.unwrap_or_default(),
                modifiers: frame.cur.modifiers,
                pos,
            }),
            Some(tag) => {
                frame.branches.push(frame.cur);
                Segment::Block(BlockSegment {
                    tag,
                    branches: frame.branches,
                    pos,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(input: &str) -> Vec<Segment> {
        let syntax = Syntax::new();
        parse(input, &syntax).unwrap()
    }

    fn parse_err(input: &str) -> ParseError {
        let syntax = Syntax::new();
        parse(input, &syntax).unwrap_err()
    }

    fn block(segment: &Segment) -> &BlockSegment {
        match segment {
            Segment::Block(b) => b,
            _ => panic!("expected block segment, got {segment:?}"),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_empty_input() {
        assert_eq!(parse_ok(""), vec![]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_pure_text() {
        assert_eq!(
            parse_ok("hello world"),
            vec![Segment::Text("hello world".to_string())]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_escaped_open_brace_is_literal() {
        assert_eq!(parse_ok("\\{"), vec![Segment::Text("{".to_string())]);
        assert_eq!(
            parse_ok("a \\{\\{ b"),
            vec![Segment::Text("a {{ b".to_string())]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_escaped_backslash_keeps_following_char() {
        // `\\n` is an escaped backslash followed by a plain `n`.
        assert_eq!(parse_ok("\\\\n"), vec![Segment::Text("\\n".to_string())]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_bare_context() {
        let segments = parse_ok("{{foo.bar}}");
        assert_eq!(segments.len(), 1);
        match &segments[0] {
            Segment::Interpolation(seg) => {
                assert_eq!(seg.path, "foo.bar");
                assert_eq!(seg.modifiers, "");
            }
            other => panic!("expected interpolation, got {other:?}"),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_context_with_modifiers() {
        let segments = parse_ok("<div class=\"{{class}eU}\"></div>");
        assert_eq!(segments.len(), 3);
        match &segments[1] {
            Segment::Interpolation(seg) => {
                assert_eq!(seg.path, "class");
                assert_eq!(seg.modifiers, "eU");
            }
            other => panic!("expected interpolation, got {other:?}"),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_text_around_context() {
        let segments = parse_ok("Hello {{name}}!");
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], Segment::Text("Hello ".to_string()));
        assert_eq!(segments[2], Segment::Text("!".to_string()));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_self_closing_block_declare() {
        let segments = parse_ok("{#{block/}}");
        let seg = block(&segments[0]);
        assert_eq!(seg.tag, '#');
        assert_eq!(seg.branches.len(), 1);
        let head = seg.head();
        assert_eq!(head.name.as_deref(), Some("block"));
        assert_eq!(head.context, None);
        assert!(head.self_closing);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_block_with_context() {
        let segments = parse_ok("{#{block:foo.bar/}}");
        let head = block(&segments[0]).head();
        assert_eq!(head.name.as_deref(), Some("block"));
        assert_eq!(head.context.as_deref(), Some("foo.bar"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_helper_with_context_param() {
        let segments = parse_ok("{&{helper arg=foo/}}");
        let head = block(&segments[0]).head();
        assert_eq!(head.name.as_deref(), Some("helper"));
        let params = head.params.as_ref().unwrap();
        assert_eq!(params.get("arg"), Some(&ParamValue::Path("foo".to_string())));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_helper_with_literal_param() {
        let segments = parse_ok("{&{helper arg=\"foo\"/}}");
        let head = block(&segments[0]).head();
        let params = head.params.as_ref().unwrap();
        assert_eq!(
            params.get("arg"),
            Some(&ParamValue::Literal("foo".to_string()))
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_helper_with_multiple_params() {
        let segments = parse_ok("{&{head prefix=\"# \" title=page.title/}}");
        let head = block(&segments[0]).head();
        let params = head.params.as_ref().unwrap();
        assert_eq!(
            params.get("prefix"),
            Some(&ParamValue::Literal("# ".to_string()))
        );
        assert_eq!(
            params.get("title"),
            Some(&ParamValue::Path("page.title".to_string()))
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_params_rejected_for_plain_blocks() {
        let err = parse_err("{#{block arg=foo/}}");
        assert_eq!(err.kind, ParseErrorKind::ParamsNotAllowed);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_partial_with_literal_name() {
        let segments = parse_ok("{>{\"views/home\":page/}}");
        let seg = block(&segments[0]);
        assert_eq!(seg.tag, '>');
        let head = seg.head();
        assert_eq!(head.literal.as_deref(), Some("views/home"));
        assert_eq!(head.context.as_deref(), Some("page"));
        assert!(head.self_closing);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_comment_block() {
        let segments = parse_ok("a{/{\"note to self\"/}}b");
        assert_eq!(segments.len(), 3);
        let seg = block(&segments[1]);
        assert_eq!(seg.tag, '/');
        assert_eq!(seg.head().literal.as_deref(), Some("note to self"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_iterator_with_children() {
        let segments = parse_ok("{@{items}}x{{.}}{@{/}}");
        let seg = block(&segments[0]);
        assert_eq!(seg.tag, '@');
        let head = seg.head();
        assert_eq!(head.context.as_deref(), Some("items"));
        assert_eq!(head.children.len(), 2);
        assert_eq!(head.children[0], Segment::Text("x".to_string()));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_conditional_branches() {
        let segments = parse_ok("{?{foo}}bar{?{~}}null{?{/}}");
        let seg = block(&segments[0]);
        assert_eq!(seg.tag, '?');
        assert_eq!(seg.branches.len(), 2);
        assert_eq!(seg.branches[0].context.as_deref(), Some("foo"));
        assert_eq!(seg.branches[0].children, vec![Segment::Text("bar".to_string())]);
        assert_eq!(seg.branches[1].children, vec![Segment::Text("null".to_string())]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_conditional_with_expression_literal() {
        let segments = parse_ok("{?{\"[a] && [b]\"}}yes{?{/}}");
        let head = block(&segments[0]).head();
        assert_eq!(head.literal.as_deref(), Some("[a] && [b]"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_third_conditional_branch_fails() {
        let err = parse_err("{?{a}}1{?{~}}2{?{~}}3{?{/}}");
        assert_eq!(err.kind, ParseErrorKind::TooManySiblings);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_custom_sibling_limit() {
        let mut syntax = Syntax::new();
        syntax
            .register_rule(
                'w',
                crate::syntax::BlockRule {
                    opening_content: ContentKind::Context,
                    name: false,
                    literal: false,
                    context: true,
                    params: false,
                    max_siblings: Siblings::Max(2),
                    self_closing: false,
                    has_closing_marker: true,
                },
            )
            .unwrap();

        assert!(parse("{w{a}}1{w{~}}2{w{/}}", &syntax).is_ok());
        let err = parse("{w{a}}1{w{~}}2{w{~}}3{w{/}}", &syntax).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::TooManySiblings);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_sibling_join_type_mismatch() {
        let err = parse_err("{@{items}}{?{~}}x{?{/}}{@{/}}");
        assert_eq!(err.kind, ParseErrorKind::SiblingTypeMismatch);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unclosed_block_is_fatal() {
        let err = parse_err("{#{block}}");
        assert_eq!(err.kind, ParseErrorKind::UnclosedBlock { tag: '#' });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_mismatched_closing_marker() {
        let err = parse_err("{@{items}}{?{/}}");
        assert_eq!(err.kind, ParseErrorKind::MismatchedClosing);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_block_type() {
        let err = parse_err("{z{foo/}}");
        assert_eq!(
            err.kind,
            ParseErrorKind::UnknownBlockType {
                tag: "z".to_string()
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_modifier_flag() {
        let err = parse_err("{{foo}q}");
        assert_eq!(err.kind, ParseErrorKind::UnknownModifier { flag: 'q' });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unterminated_quote() {
        let err = parse_err("{>{\"views/home");
        assert_eq!(err.kind, ParseErrorKind::UnclosedQuote);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_empty_interpolation_fails() {
        let err = parse_err("{{}}");
        assert_eq!(err.kind, ParseErrorKind::UnspecifiedContext);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_error_carries_position_and_excerpt() {
        let err = parse_err("line one\n{z{foo/}}");
        assert_eq!(err.line, 2);
        assert!(err.offset > 8);
        assert!(!err.near_text.is_empty());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_nested_blocks() {
        let segments = parse_ok("{@{rows}}{?{cell}}x{?{/}}{@{/}}");
        let outer = block(&segments[0]);
        assert_eq!(outer.tag, '@');
        let inner = block(&outer.head().children[0]);
        assert_eq!(inner.tag, '?');
        assert_eq!(inner.head().context.as_deref(), Some("cell"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_modifiers_on_block_and_branch() {
        let segments = parse_ok("{#{block}U}foo{#{/}}");
        let head = block(&segments[0]).head();
        assert_eq!(head.modifiers, "U");
        assert_eq!(head.children, vec![Segment::Text("foo".to_string())]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_quoted_param_followed_by_close() {
        let segments = parse_ok("{&{h arg=\"a b\" /}}");
        let head = block(&segments[0]).head();
        assert_eq!(
            head.params.as_ref().unwrap().get("arg"),
            Some(&ParamValue::Literal("a b".to_string()))
        );
        assert!(head.self_closing);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_helper_with_body() {
        let segments = parse_ok("{&{wrap}}inner{&{/}}");
        let seg = block(&segments[0]);
        assert_eq!(seg.tag, '&');
        let head = seg.head();
        assert_eq!(head.name.as_deref(), Some("wrap"));
        assert!(!head.self_closing);
        assert_eq!(head.children, vec![Segment::Text("inner".to_string())]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_source_positions() {
        let segments = parse_ok("ab{{foo}}");
        match &segments[1] {
            Segment::Interpolation(seg) => {
                assert_eq!(seg.pos.line, 1);
                assert_eq!(seg.pos.column, 2);
                assert_eq!(seg.pos.offset, 2);
                assert_eq!(seg.pos.length, 7);
            }
            other => panic!("expected interpolation, got {other:?}"),
        }
    }
}
