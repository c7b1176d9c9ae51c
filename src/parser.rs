use crate::ast::{Argument, AstNode, SubExpr};
use crate::error::{ParseError, ParseErrorKind};
use crate::scan::{
    QuoteState, contains_arithmetic_operator, contains_expression_operator,
};

type ParseResult<T> = Result<T, ParseError>;

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    /// Current line number (1-indexed)
    line: usize,
    /// The starting location of the current line
    line_start_pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Parser {
            input,
            pos: 0,
            line: 1,
            line_start_pos: 0,
        }
    }

    #[inline]
    fn current_column(&self) -> usize {
        self.pos - self.line_start_pos + 1
    }

    #[inline]
    fn make_error(&self, kind: ParseErrorKind) -> ParseError {
        ParseError {
            line: self.line,
            column: self.current_column(),
            kind,
        }
    }

    /// Advances the parser position by char_len bytes, correctly handling
    /// multi-byte characters. Updates line and column numbers if a newline
    /// is encountered.
    #[inline]
    fn advance_by_char(&mut self, current_char: char, char_len: usize) {
        if current_char == '\n' {
            self.line += 1;
            self.line_start_pos = self.pos + char_len;
        }
        self.pos += char_len;
    }

    /// Advances the parser position by `len` bytes. Used for fixed
    /// delimiters, which never contain newlines.
    #[inline]
    fn advance_bytes_no_newline(&mut self, len: usize) {
        self.pos += len;
    }

    fn eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    /// Peek if the remaining input starts with `s`
    fn peek(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }

    /// Consume `s` if the remaining input starts with it.
    /// Assumes `s` does not contain newlines.
    fn consume(&mut self, s: &str) -> bool {
        if self.peek(s) {
            self.advance_bytes_no_newline(s.len());
            true
        } else {
            false
        }
    }

    fn next_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    /// Consume leading whitespace, handling newlines correctly.
    fn consume_whitespace(&mut self) {
        while let Some(c) = self.next_char() {
            if c.is_ascii_whitespace() {
                self.advance_by_char(c, c.len_utf8());
            } else {
                break;
            }
        }
    }

    /// Expect `s` to be the start of the remaining input, consume it or
    /// return Err. Assumes `s` does not contain newlines.
    fn expect(&mut self, s: &str) -> ParseResult<()> {
        if self.consume(s) {
            Ok(())
        } else {
            Err(self.make_error(ParseErrorKind::Expected {
                description: format!(
                    "'{}', found '{}'",
                    s,
                    &self.input[self.pos..std::cmp::min(self.pos + s.len() + 10, self.input.len())]
                ),
            }))
        }
    }

    /// Consume and return an identifier (alphanumeric + '_' + '.' + '-')
    fn consume_identifier(&mut self) -> ParseResult<&'a str> {
        self.consume_whitespace();
        let start = self.pos;
        while let Some(c) = self.next_char() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                self.advance_by_char(c, c.len_utf8());
            } else {
                break;
            }
        }
        if start == self.pos {
            Err(self.make_error(ParseErrorKind::Expected {
                description: "identifier".to_string(),
            }))
        } else {
            Ok(&self.input[start..self.pos])
        }
    }

    /// Partial names additionally admit '@' (for `@partial-block`).
    fn consume_partial_name(&mut self) -> ParseResult<&'a str> {
        self.consume_whitespace();
        let start = self.pos;
        while let Some(c) = self.next_char() {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '@') {
                self.advance_by_char(c, c.len_utf8());
            } else {
                break;
            }
        }
        if start == self.pos {
            Err(self.make_error(ParseErrorKind::Expected {
                description: "partial name".to_string(),
            }))
        } else {
            Ok(&self.input[start..self.pos])
        }
    }

    /// Consume until `stop` appears outside of any string literal.
    /// The stop sequence itself is not consumed.
    fn consume_until(&mut self, stop: &str) -> ParseResult<&'a str> {
        let start = self.pos;
        let mut quotes = QuoteState::new();
        while !self.eof() {
            if !quotes.in_quote() && self.peek(stop) {
                return Ok(&self.input[start..self.pos]);
            }
            let c = match self.next_char() {
                Some(c) => c,
                None => break,
            };
            quotes.update(c);
            self.advance_by_char(c, c.len_utf8());
        }
        Err(self.make_error(ParseErrorKind::unexpected_eof(Some(stop.to_string()))))
    }

    /// Consume until `stop` with no quote handling. Used for comments.
    fn consume_until_raw(&mut self, stop: &str) -> ParseResult<&'a str> {
        let start = self.pos;
        while !self.eof() {
            if self.peek(stop) {
                return Ok(&self.input[start..self.pos]);
            }
            let c = match self.next_char() {
                Some(c) => c,
                None => break,
            };
            self.advance_by_char(c, c.len_utf8());
        }
        Err(self.make_error(ParseErrorKind::unexpected_eof(Some(stop.to_string()))))
    }

    /// Consume a parenthesized span, respecting nested parentheses and
    /// string literals. Assumes the opening '(' was already consumed;
    /// consumes the matching ')'.
    fn consume_balanced_parens(&mut self) -> ParseResult<&'a str> {
        let start = self.pos;
        let mut quotes = QuoteState::new();
        let mut depth = 0usize;
        while !self.eof() {
            let c = match self.next_char() {
                Some(c) => c,
                None => break,
            };
            if !quotes.update(c) {
                if c == '(' {
                    depth += 1;
                } else if c == ')' {
                    if depth == 0 {
                        let span = &self.input[start..self.pos];
                        self.advance_bytes_no_newline(1);
                        return Ok(span);
                    }
                    depth -= 1;
                }
            }
            self.advance_by_char(c, c.len_utf8());
        }
        Err(self.make_error(ParseErrorKind::unexpected_eof(Some(")".to_string()))))
    }

    /// Peek for an `{{else` tag (with optional interior whitespace and a
    /// word boundary, so `{{elsewhere}}` does not match).
    fn peek_else(&self) -> bool {
        let rest = &self.input[self.pos..];
        let Some(rest) = rest.strip_prefix("{{") else {
            return false;
        };
        let rest = rest.trim_start();
        let Some(rest) = rest.strip_prefix("else") else {
            return false;
        };
        !rest
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    /// Consume `{{` + whitespace + `else`. Only call after `peek_else`.
    fn consume_else_prefix(&mut self) -> ParseResult<()> {
        self.expect("{{")?;
        self.consume_whitespace();
        self.expect("else")
    }

    // --- Node parsing ---

    fn parse_node(&mut self) -> ParseResult<AstNode> {
        if self.peek("{{#>") {
            self.parse_partial_block()
        } else if self.peek("{{#*") {
            self.parse_inline_partial()
        } else if self.peek("{{#") {
            self.parse_block_helper()
        } else if self.peek("{{>") {
            self.parse_partial()
        } else if self.peek("{{!") {
            self.parse_comment()
        } else if self.peek("{{") {
            self.parse_expression_tag()
        } else {
            self.parse_text()
        }
    }

    /// Parses a run of literal text until the next tag. `\{{` escapes a
    /// literal brace pair.
    fn parse_text(&mut self) -> ParseResult<AstNode> {
        let mut value = String::new();
        while !self.eof() {
            if self.peek("\\{{") {
                self.advance_bytes_no_newline(1);
                value.push_str("{{");
                self.advance_bytes_no_newline(2);
                continue;
            }
            if self.peek("{{") {
                break;
            }
            let c = match self.next_char() {
                Some(c) => c,
                None => break,
            };
            value.push(c);
            self.advance_by_char(c, c.len_utf8());
        }
        Ok(AstNode::Text { value })
    }

    /// `{{! ... }}` - consumed and discarded.
    fn parse_comment(&mut self) -> ParseResult<AstNode> {
        self.expect("{{!")?;
        self.consume_until_raw("}}")?;
        self.expect("}}")?;
        Ok(AstNode::Comment)
    }

    /// `{{expr}}`, `{{ target = expr }}` or `{{helper args hash=..}}`.
    fn parse_expression_tag(&mut self) -> ParseResult<AstNode> {
        self.expect("{{")?;
        let raw = self.consume_until("}}")?;
        let content = raw.trim();
        if content.is_empty() {
            return Err(self.make_error(ParseErrorKind::Expected {
                description: "expression".to_string(),
            }));
        }

        // Assignment: a top-level bare '=' with a plain dotted identifier
        // on its left. `==`-family operators and hash parameters never
        // qualify because their left side is not a lone identifier.
        if let Some(eq_idx) = find_bare_equals(raw) {
            let target = raw[..eq_idx].trim();
            if is_assignment_target(target) {
                let value = raw[eq_idx + 1..].trim();
                if value.is_empty() {
                    return Err(self.make_error(ParseErrorKind::Expected {
                        description: "expression after '='".to_string(),
                    }));
                }
                self.expect("}}")?;
                return Ok(AstNode::Assignment {
                    target: target.to_string(),
                    value: value.to_string(),
                });
            }
        }

        let node = self.classify_expression_tag(content)?;
        self.expect("}}")?;
        Ok(node)
    }

    fn classify_expression_tag(&self, content: &str) -> ParseResult<AstNode> {
        if content.starts_with('(') && content.ends_with(')') && content.len() >= 2 {
            let sub = parse_subexpression(&content[1..content.len() - 1])
                .map_err(|msg| self.make_error(ParseErrorKind::Message(msg)))?;
            return Ok(AstNode::Subexpression(sub));
        }
        if contains_expression_operator(content) || contains_arithmetic_operator(content) {
            return Ok(AstNode::Expression {
                expression: content.to_string(),
            });
        }
        let tokens = tokenize_span(content)
            .map_err(|msg| self.make_error(ParseErrorKind::Message(msg)))?;
        if tokens.len() <= 1 {
            return Ok(AstNode::Expression {
                expression: content.to_string(),
            });
        }
        let name = tokens[0];
        if !is_identifier_like(name) {
            // e.g. a leading string literal; let the evaluator have it.
            return Ok(AstNode::Expression {
                expression: content.to_string(),
            });
        }
        let rest = content[name.len()..].trim();
        let (args, hash) = parse_call_arguments(rest)
            .map_err(|msg| self.make_error(ParseErrorKind::Message(msg)))?;
        Ok(AstNode::HelperExpression {
            name: name.to_string(),
            args,
            hash,
        })
    }

    /// `{{#name args hash=..}}...{{else}}...{{/name}}` or the
    /// self-closing `{{#name args/}}`.
    fn parse_block_helper(&mut self) -> ParseResult<AstNode> {
        self.expect("{{#")?;
        let name = self.consume_identifier()?.to_string();
        let raw = self.consume_until("}}")?;
        let trimmed = raw.trim();
        let (span, self_closing) = match trimmed.strip_suffix('/') {
            Some(stripped) => (stripped.trim(), true),
            None => (trimmed, false),
        };
        let (args, hash) = parse_call_arguments(span)
            .map_err(|msg| self.make_error(ParseErrorKind::Message(msg)))?;
        self.expect("}}")?;

        if self_closing {
            return Ok(AstNode::BlockHelper {
                name,
                args,
                hash,
                children: Vec::new(),
                inverse: None,
                self_closing: true,
            });
        }

        let (children, inverse) = self.parse_block_body(&name)?;
        Ok(AstNode::BlockHelper {
            name,
            args,
            hash,
            children,
            inverse,
            self_closing: false,
        })
    }

    /// Parses a block body up to and including its `{{/close_name}}`,
    /// desugaring `{{else if cond}}` chains into nested synthetic `if`
    /// block helpers hung off the inverse.
    fn parse_block_body(
        &mut self,
        close_name: &str,
    ) -> ParseResult<(Vec<AstNode>, Option<Vec<AstNode>>)> {
        let mut children = Vec::new();
        loop {
            if self.eof() {
                return Err(self.make_error(ParseErrorKind::unexpected_eof(Some(format!(
                    "{{{{/{}}}}}",
                    close_name
                )))));
            }
            if self.peek("{{/") {
                self.consume_close_tag(close_name)?;
                return Ok((children, None));
            }
            if self.peek_else() {
                self.consume_else_prefix()?;
                self.consume_whitespace();
                if self.peek_word("if") {
                    self.expect("if")?;
                    let condition = self.consume_until("}}")?.trim().to_string();
                    self.expect("}}")?;
                    let (nested_children, nested_inverse) = self.parse_block_body(close_name)?;
                    let nested = AstNode::BlockHelper {
                        name: "if".to_string(),
                        args: vec![Argument::Expression(condition)],
                        hash: Vec::new(),
                        children: nested_children,
                        inverse: nested_inverse,
                        self_closing: false,
                    };
                    return Ok((children, Some(vec![nested])));
                }
                self.expect("}}")?;
                let inverse = self.parse_inverse_body(close_name)?;
                return Ok((children, Some(inverse)));
            }
            children.push(self.parse_node()?);
        }
    }

    /// The plain `{{else}}` body, terminated by the block's close tag.
    fn parse_inverse_body(&mut self, close_name: &str) -> ParseResult<Vec<AstNode>> {
        let mut nodes = Vec::new();
        loop {
            if self.eof() {
                return Err(self.make_error(ParseErrorKind::unexpected_eof(Some(format!(
                    "{{{{/{}}}}}",
                    close_name
                )))));
            }
            if self.peek("{{/") {
                self.consume_close_tag(close_name)?;
                return Ok(nodes);
            }
            if self.peek_else() {
                return Err(self.make_error(ParseErrorKind::Message(
                    "duplicate '{{else}}' in block".to_string(),
                )));
            }
            nodes.push(self.parse_node()?);
        }
    }

    fn peek_word(&self, word: &str) -> bool {
        if !self.peek(word) {
            return false;
        }
        !self.input[self.pos + word.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    fn consume_close_tag(&mut self, close_name: &str) -> ParseResult<()> {
        self.expect("{{/")?;
        let found = self.consume_partial_name()?;
        if found != close_name {
            let found = found.to_string();
            return Err(self.make_error(ParseErrorKind::UnexpectedToken {
                expected: format!("'{{{{/{}}}}}'", close_name),
                found: format!("'{{{{/{}}}}}'", found),
            }));
        }
        self.consume_whitespace();
        self.expect("}}")
    }

    /// `{{> name}}`, `{{> name ctx hash=..}}` or `{{> (expr)}}`.
    fn parse_partial(&mut self) -> ParseResult<AstNode> {
        self.expect("{{>")?;
        self.consume_whitespace();
        let (name, dynamic) = self.consume_partial_target()?;
        let raw = self.consume_until("}}")?;
        let (context, hash) = parse_partial_params(raw)
            .map_err(|msg| self.make_error(ParseErrorKind::Message(msg)))?;
        self.expect("}}")?;
        Ok(AstNode::Partial {
            name,
            dynamic,
            context,
            hash,
        })
    }

    /// `{{#> name}}...failover...{{/name}}`. Partial blocks take a
    /// literal name; their body is the failover content.
    fn parse_partial_block(&mut self) -> ParseResult<AstNode> {
        self.expect("{{#>")?;
        self.consume_whitespace();
        let name = self.consume_partial_name()?.to_string();
        let raw = self.consume_until("}}")?;
        let (context, hash) = parse_partial_params(raw)
            .map_err(|msg| self.make_error(ParseErrorKind::Message(msg)))?;
        self.expect("}}")?;

        let mut children = Vec::new();
        loop {
            if self.eof() {
                return Err(self.make_error(ParseErrorKind::unexpected_eof(Some(format!(
                    "{{{{/{}}}}}",
                    name
                )))));
            }
            if self.peek("{{/") {
                self.consume_close_tag(&name)?;
                break;
            }
            if self.peek_else() {
                return Err(self.make_error(ParseErrorKind::Message(
                    "'{{else}}' is not valid in a partial block".to_string(),
                )));
            }
            children.push(self.parse_node()?);
        }
        Ok(AstNode::PartialBlock {
            name,
            dynamic: false,
            context,
            hash,
            children,
        })
    }

    fn consume_partial_target(&mut self) -> ParseResult<(String, bool)> {
        if self.consume("(") {
            let expr = self.consume_balanced_parens()?;
            Ok((expr.trim().to_string(), true))
        } else {
            Ok((self.consume_partial_name()?.to_string(), false))
        }
    }

    /// `{{#*inline "name"}}...{{/inline}}`. The `inline` keyword is
    /// required; anything else is fatal.
    fn parse_inline_partial(&mut self) -> ParseResult<AstNode> {
        self.expect("{{#*")?;
        let keyword = self.consume_identifier()?;
        if keyword != "inline" {
            let keyword = keyword.to_string();
            return Err(self.make_error(ParseErrorKind::UnknownKeyword { keyword }));
        }
        self.consume_whitespace();
        let quote = if self.consume("\"") {
            '"'
        } else if self.consume("'") {
            '\''
        } else {
            return Err(self.make_error(ParseErrorKind::Expected {
                description: "quoted inline partial name".to_string(),
            }));
        };
        let name = self.consume_until_raw(&quote.to_string())?.to_string();
        self.advance_bytes_no_newline(1);
        self.consume_whitespace();
        self.expect("}}")?;

        let mut children = Vec::new();
        loop {
            if self.eof() {
                return Err(self.make_error(ParseErrorKind::unexpected_eof(Some(
                    "{{/inline}}".to_string(),
                ))));
            }
            if self.peek("{{/") {
                self.consume_close_tag("inline")?;
                break;
            }
            children.push(self.parse_node()?);
        }
        Ok(AstNode::InlinePartial { name, children })
    }
}

/// The remainder of a partial tag: an optional context expression
/// followed by hash parameters.
fn parse_partial_params(raw: &str) -> Result<(Option<String>, Vec<(String, Argument)>), String> {
    let span = raw.trim();
    if span.is_empty() {
        return Ok((None, Vec::new()));
    }
    let tokens = tokenize_span(span)?;
    let mut context = None;
    let mut hash = Vec::new();
    for token in tokens {
        if let Some((key, value)) = split_hash_token(token)? {
            hash.push((key, value));
        } else if context.is_none() {
            context = Some(token.to_string());
        } else {
            return Err(format!("unexpected extra partial argument '{}'", token));
        }
    }
    Ok((context, hash))
}

/// Scan for a bare top-level '=' (an assignment, not part of a
/// comparison operator).
fn find_bare_equals(text: &str) -> Option<usize> {
    let mut quotes = QuoteState::new();
    let mut depth = 0usize;
    let mut prev: Option<char> = None;
    for (idx, c) in text.char_indices() {
        if quotes.update(c) {
            prev = Some(c);
            continue;
        }
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '=' if depth == 0 => {
                let next = text[idx + 1..].chars().next();
                if next != Some('=') && !matches!(prev, Some('=' | '!' | '<' | '>')) {
                    return Some(idx);
                }
            }
            _ => {}
        }
        prev = Some(c);
    }
    None
}

fn is_assignment_target(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let mut chars = text.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    text.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn is_identifier_like(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '@')
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '@'))
}

/// Split an argument span into whitespace-separated tokens, keeping
/// quoted strings and parenthesized subexpressions whole.
fn tokenize_span(span: &str) -> Result<Vec<&str>, String> {
    let mut tokens = Vec::new();
    let mut quotes = QuoteState::new();
    let mut depth = 0usize;
    let mut start: Option<usize> = None;
    for (idx, c) in span.char_indices() {
        if quotes.update(c) {
            if start.is_none() {
                start = Some(idx);
            }
            continue;
        }
        match c {
            '(' => {
                depth += 1;
                if start.is_none() {
                    start = Some(idx);
                }
            }
            ')' => {
                if depth == 0 {
                    return Err("unbalanced ')' in arguments".to_string());
                }
                depth -= 1;
            }
            c if c.is_whitespace() && depth == 0 => {
                if let Some(s) = start.take() {
                    tokens.push(&span[s..idx]);
                }
            }
            _ => {
                if start.is_none() {
                    start = Some(idx);
                }
            }
        }
    }
    if quotes.in_quote() {
        return Err("unterminated string literal in arguments".to_string());
    }
    if depth != 0 {
        return Err("unbalanced '(' in arguments".to_string());
    }
    if let Some(s) = start {
        tokens.push(&span[s..]);
    }
    Ok(tokens)
}

/// If `token` is a `key=value` hash parameter, split it. Returns
/// `Ok(None)` for positional arguments.
fn split_hash_token(token: &str) -> Result<Option<(String, Argument)>, String> {
    let Some(eq_idx) = find_bare_equals(token) else {
        return Ok(None);
    };
    let key = &token[..eq_idx];
    if !is_identifier_like(key) {
        return Ok(None);
    }
    let value = &token[eq_idx + 1..];
    if value.is_empty() {
        return Err(format!("missing value for hash parameter '{}'", key));
    }
    Ok(Some((key.to_string(), parse_argument_token(value)?)))
}

fn parse_argument_token(token: &str) -> Result<Argument, String> {
    if token.starts_with('(') && token.ends_with(')') && token.len() >= 2 {
        return Ok(Argument::Sub(parse_subexpression(
            &token[1..token.len() - 1],
        )?));
    }
    Ok(Argument::Expression(token.to_string()))
}

/// `(helperName arg...)` - same shape as a helper call, nesting freely.
fn parse_subexpression(inner: &str) -> Result<SubExpr, String> {
    let inner = inner.trim();
    if inner.is_empty() {
        return Err("empty subexpression".to_string());
    }
    let name_end = inner
        .find(|c: char| c.is_whitespace())
        .unwrap_or(inner.len());
    let name = &inner[..name_end];
    if !is_identifier_like(name) {
        return Err(format!("invalid helper name '{}' in subexpression", name));
    }
    let (args, hash) = parse_call_arguments(inner[name_end..].trim())?;
    Ok(SubExpr {
        name: name.to_string(),
        args,
        hash,
    })
}

/// Parse a helper argument span into positional arguments and hash
/// parameters.
///
/// A span containing a top-level comparison or boolean operator is a
/// single full expression argument (`{{#if age > 18}}`), never a
/// word-by-word token list; the scan respects string literals and
/// parenthesized subexpressions.
fn parse_call_arguments(span: &str) -> Result<(Vec<Argument>, Vec<(String, Argument)>), String> {
    let span = span.trim();
    if span.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    if contains_expression_operator(span) {
        return Ok((
            vec![Argument::Expression(span.to_string())],
            Vec::new(),
        ));
    }
    let mut args = Vec::new();
    let mut hash = Vec::new();
    for token in tokenize_span(span)? {
        if let Some((key, value)) = split_hash_token(token)? {
            hash.push((key, value));
        } else {
            args.push(parse_argument_token(token)?);
        }
    }
    Ok((args, hash))
}

/// Parse a template into its AST. Parsing is all-or-nothing: any
/// malformed tag aborts with a positioned error.
pub(crate) fn parse(input: &str) -> Result<AstNode, ParseError> {
    parse_internal(input, None)
}

/// Like [`parse`], but records the line/column of each top-level node
/// for best-effort source maps.
pub(crate) fn parse_with_spans(
    input: &str,
    spans: &mut Vec<(usize, usize)>,
) -> Result<AstNode, ParseError> {
    parse_internal(input, Some(spans))
}

fn parse_internal(
    input: &str,
    mut spans: Option<&mut Vec<(usize, usize)>>,
) -> Result<AstNode, ParseError> {
    if input.is_empty() {
        return Ok(AstNode::Root(vec![]));
    }
    let mut parser = Parser::new(input);
    let mut nodes = Vec::new();
    while !parser.eof() {
        if parser.peek("{{/") {
            return Err(parser.make_error(ParseErrorKind::UnexpectedToken {
                expected: "an opening tag".to_string(),
                found: "a closing tag".to_string(),
            }));
        }
        if parser.peek_else() {
            return Err(parser.make_error(ParseErrorKind::Message(
                "'{{else}}' outside of a block".to_string(),
            )));
        }
        let position = (parser.line, parser.current_column());
        let node = parser.parse_node()?;
        if let AstNode::Text { value } = &node {
            if value.is_empty() {
                continue;
            }
        }
        if let Some(spans) = spans.as_mut() {
            spans.push(position);
        }
        nodes.push(node);
    }
    Ok(AstNode::Root(nodes))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Helper macros for quick AST node creation in tests
    macro_rules! text {
        ($value:expr) => {
            AstNode::Text {
                value: $value.to_string(),
            }
        };
    }
    macro_rules! expr {
        ($expression:expr) => {
            AstNode::Expression {
                expression: $expression.to_string(),
            }
        };
    }
    macro_rules! arg {
        ($expression:expr) => {
            Argument::Expression($expression.to_string())
        };
    }

    fn root(ast: AstNode) -> Vec<AstNode> {
        match ast {
            AstNode::Root(nodes) => nodes,
            other => panic!("expected Root, got {:?}", other),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_empty_input() {
        assert_eq!(parse("").unwrap(), AstNode::Root(vec![]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_simple_text() {
        assert_eq!(
            parse("hello world").unwrap(),
            AstNode::Root(vec![text!("hello world")])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_simple_expression() {
        assert_eq!(parse("{{name}}").unwrap(), AstNode::Root(vec![expr!("name")]));
        assert_eq!(
            parse("{{ name }}").unwrap(),
            AstNode::Root(vec![expr!("name")])
        );
        assert_eq!(
            parse("{{ user.name }}").unwrap(),
            AstNode::Root(vec![expr!("user.name")])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_text_and_expression() {
        assert_eq!(
            parse("Hello {{name}}!").unwrap(),
            AstNode::Root(vec![text!("Hello "), expr!("name"), text!("!")])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_escaped_braces() {
        assert_eq!(
            parse(r"literal \{{name}} here").unwrap(),
            AstNode::Root(vec![text!("literal {{name}} here")])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_operator_expression() {
        assert_eq!(
            parse("{{age > 18}}").unwrap(),
            AstNode::Root(vec![expr!("age > 18")])
        );
        assert_eq!(
            parse("{{price * quantity}}").unwrap(),
            AstNode::Root(vec![expr!("price * quantity")])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_assignment() {
        assert_eq!(
            parse("{{ x = 5 }}").unwrap(),
            AstNode::Root(vec![AstNode::Assignment {
                target: "x".to_string(),
                value: "5".to_string(),
            }])
        );
        assert_eq!(
            parse("{{ user.profile.name = `Dr. ${name}` }}").unwrap(),
            AstNode::Root(vec![AstNode::Assignment {
                target: "user.profile.name".to_string(),
                value: "`Dr. ${name}`".to_string(),
            }])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_comparison_is_not_assignment() {
        assert_eq!(
            parse("{{ a == b }}").unwrap(),
            AstNode::Root(vec![expr!("a == b")])
        );
        assert_eq!(
            parse(r#"{{ tier === "gold" }}"#).unwrap(),
            AstNode::Root(vec![expr!(r#"tier === "gold""#)])
        );
        assert_eq!(
            parse("{{ a >= b }}").unwrap(),
            AstNode::Root(vec![expr!("a >= b")])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_helper_expression() {
        let nodes = root(parse(r#"{{format date "%Y" zone=tz}}"#).unwrap());
        assert_eq!(
            nodes,
            vec![AstNode::HelperExpression {
                name: "format".to_string(),
                args: vec![arg!("date"), arg!(r#""%Y""#)],
                hash: vec![("zone".to_string(), arg!("tz"))],
            }]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_block_helper_simple() {
        let nodes = root(parse("{{#if active}}yes{{/if}}").unwrap());
        assert_eq!(
            nodes,
            vec![AstNode::BlockHelper {
                name: "if".to_string(),
                args: vec![arg!("active")],
                hash: vec![],
                children: vec![text!("yes")],
                inverse: None,
                self_closing: false,
            }]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_block_helper_comparison_argument() {
        // The whole span is one argument, not three tokens.
        let nodes = root(parse("{{#if age > 18}}adult{{/if}}").unwrap());
        match &nodes[0] {
            AstNode::BlockHelper { args, .. } => {
                assert_eq!(args, &vec![arg!("age > 18")]);
            }
            other => panic!("expected BlockHelper, got {:?}", other),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_block_helper_quoted_operator_is_not_comparison() {
        let nodes = root(parse(r#"{{#label "a > b" size=2}}x{{/label}}"#).unwrap());
        match &nodes[0] {
            AstNode::BlockHelper { args, hash, .. } => {
                assert_eq!(args, &vec![arg!(r#""a > b""#)]);
                assert_eq!(hash, &vec![("size".to_string(), arg!("2"))]);
            }
            other => panic!("expected BlockHelper, got {:?}", other),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_self_closing_block() {
        let nodes = root(parse("{{#refresh token limit=3/}}").unwrap());
        assert_eq!(
            nodes,
            vec![AstNode::BlockHelper {
                name: "refresh".to_string(),
                args: vec![arg!("token")],
                hash: vec![("limit".to_string(), arg!("3"))],
                children: vec![],
                inverse: None,
                self_closing: true,
            }]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_block_with_else() {
        let nodes = root(parse("{{#if a}}A{{else}}B{{/if}}").unwrap());
        assert_eq!(
            nodes,
            vec![AstNode::BlockHelper {
                name: "if".to_string(),
                args: vec![arg!("a")],
                hash: vec![],
                children: vec![text!("A")],
                inverse: Some(vec![text!("B")]),
                self_closing: false,
            }]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_else_if_chain_desugars_to_nested_ifs() {
        let nodes = root(parse("{{#if a}}A{{else if b}}B{{else}}C{{/if}}").unwrap());
        assert_eq!(
            nodes,
            vec![AstNode::BlockHelper {
                name: "if".to_string(),
                args: vec![arg!("a")],
                hash: vec![],
                children: vec![text!("A")],
                inverse: Some(vec![AstNode::BlockHelper {
                    name: "if".to_string(),
                    args: vec![arg!("b")],
                    hash: vec![],
                    children: vec![text!("B")],
                    inverse: Some(vec![text!("C")]),
                    self_closing: false,
                }]),
                self_closing: false,
            }]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_long_else_if_chain() {
        let nodes =
            root(parse("{{#if a}}1{{else if b}}2{{else if c}}3{{/if}}").unwrap());
        let AstNode::BlockHelper { inverse, .. } = &nodes[0] else {
            panic!("expected BlockHelper");
        };
        let inverse = inverse.as_ref().expect("first inverse");
        let AstNode::BlockHelper { inverse: second, .. } = &inverse[0] else {
            panic!("expected nested if");
        };
        let second = second.as_ref().expect("second inverse");
        let AstNode::BlockHelper { args, inverse: last, .. } = &second[0] else {
            panic!("expected innermost if");
        };
        assert_eq!(args, &vec![arg!("c")]);
        assert!(last.is_none(), "chain without a final else ends open");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_subexpression_argument() {
        let nodes = root(parse("{{#with (lookup users id)}}x{{/with}}").unwrap());
        let AstNode::BlockHelper { args, .. } = &nodes[0] else {
            panic!("expected BlockHelper");
        };
        assert_eq!(
            args,
            &vec![Argument::Sub(SubExpr {
                name: "lookup".to_string(),
                args: vec![arg!("users"), arg!("id")],
                hash: vec![],
            })]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_nested_subexpressions() {
        let nodes = root(parse("{{concat (upper (trim name)) tail}}").unwrap());
        assert_eq!(
            nodes,
            vec![AstNode::HelperExpression {
                name: "concat".to_string(),
                args: vec![
                    Argument::Sub(SubExpr {
                        name: "upper".to_string(),
                        args: vec![Argument::Sub(SubExpr {
                            name: "trim".to_string(),
                            args: vec![arg!("name")],
                            hash: vec![],
                        })],
                        hash: vec![],
                    }),
                    arg!("tail"),
                ],
                hash: vec![],
            }]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_top_level_subexpression() {
        let nodes = root(parse("{{(touch state)}}").unwrap());
        assert_eq!(
            nodes,
            vec![AstNode::Subexpression(SubExpr {
                name: "touch".to_string(),
                args: vec![arg!("state")],
                hash: vec![],
            })]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_subexpression_hash_value() {
        let nodes = root(parse("{{#card title=(concat a b)}}x{{/card}}").unwrap());
        let AstNode::BlockHelper { hash, .. } = &nodes[0] else {
            panic!("expected BlockHelper");
        };
        assert_eq!(
            hash,
            &vec![(
                "title".to_string(),
                Argument::Sub(SubExpr {
                    name: "concat".to_string(),
                    args: vec![arg!("a"), arg!("b")],
                    hash: vec![],
                })
            )]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_partial_forms() {
        assert_eq!(
            parse("{{> header}}").unwrap(),
            AstNode::Root(vec![AstNode::Partial {
                name: "header".to_string(),
                dynamic: false,
                context: None,
                hash: vec![],
            }])
        );
        assert_eq!(
            parse("{{> nav.main-menu}}").unwrap(),
            AstNode::Root(vec![AstNode::Partial {
                name: "nav.main-menu".to_string(),
                dynamic: false,
                context: None,
                hash: vec![],
            }])
        );
        assert_eq!(
            parse("{{> @partial-block}}").unwrap(),
            AstNode::Root(vec![AstNode::Partial {
                name: "@partial-block".to_string(),
                dynamic: false,
                context: None,
                hash: vec![],
            }])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_partial_with_context_and_hash() {
        assert_eq!(
            parse(r#"{{> card user title="Profile"}}"#).unwrap(),
            AstNode::Root(vec![AstNode::Partial {
                name: "card".to_string(),
                dynamic: false,
                context: Some("user".to_string()),
                hash: vec![("title".to_string(), arg!(r#""Profile""#))],
            }])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_dynamic_partial() {
        assert_eq!(
            parse("{{> (which) }}").unwrap(),
            AstNode::Root(vec![AstNode::Partial {
                name: "which".to_string(),
                dynamic: true,
                context: None,
                hash: vec![],
            }])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_partial_block() {
        let nodes = root(parse("{{#> frame}}Fallback{{/frame}}").unwrap());
        assert_eq!(
            nodes,
            vec![AstNode::PartialBlock {
                name: "frame".to_string(),
                dynamic: false,
                context: None,
                hash: vec![],
                children: vec![text!("Fallback")],
            }]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_inline_partial() {
        let nodes = root(parse(r#"{{#*inline "row"}}<li>{{this}}</li>{{/inline}}"#).unwrap());
        assert_eq!(
            nodes,
            vec![AstNode::InlinePartial {
                name: "row".to_string(),
                children: vec![text!("<li>"), expr!("this"), text!("</li>")],
            }]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_inline_partial_requires_keyword() {
        let err = parse(r#"{{#*outline "row"}}x{{/outline}}"#).unwrap_err();
        assert!(matches!(
            err.kind,
            ParseErrorKind::UnknownKeyword { ref keyword } if keyword == "outline"
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_comment_produces_no_output_node() {
        assert_eq!(
            parse("a{{! ignore me }}b").unwrap(),
            AstNode::Root(vec![text!("a"), AstNode::Comment, text!("b")])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unclosed_expression_is_fatal() {
        let err = parse("{{name").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnexpectedEOF { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_empty_expression_is_fatal() {
        let err = parse("{{}}").unwrap_err();
        assert!(matches!(
            err.kind,
            ParseErrorKind::Expected { ref description } if description == "expression"
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unclosed_block_is_fatal() {
        let err = parse("{{#if a}}text").unwrap_err();
        assert!(matches!(
            err.kind,
            ParseErrorKind::UnexpectedEOF { ref expected_what } if expected_what.contains("{{/if}}")
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_mismatched_close_is_fatal() {
        let err = parse("{{#if a}}text{{/each}}").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnexpectedToken { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unexpected_close_is_fatal() {
        let err = parse("text{{/if}}").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnexpectedToken { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_stray_else_is_fatal() {
        let err = parse("a{{else}}b").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::Message(_)));
        // ...but an identifier that merely starts with "else" is fine.
        assert_eq!(
            parse("{{elsewhere}}").unwrap(),
            AstNode::Root(vec![expr!("elsewhere")])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_error_positions() {
        let err = parse("line one\n{{#if a}}x").unwrap_err();
        assert_eq!(err.line, 2);
        let err = parse("{{bad").unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.column, 6);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_quoted_close_delimiter_is_not_syntactic() {
        let nodes = root(parse(r#"{{greet name suffix="}}"}}"#).unwrap());
        assert_eq!(
            nodes,
            vec![AstNode::HelperExpression {
                name: "greet".to_string(),
                args: vec![arg!("name")],
                hash: vec![("suffix".to_string(), arg!(r#""}}""#))],
            }]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_nested_blocks() {
        let nodes = root(
            parse("{{#each items}}{{#if this}}{{this}}{{/if}}{{/each}}").unwrap(),
        );
        let AstNode::BlockHelper { name, children, .. } = &nodes[0] else {
            panic!("expected BlockHelper");
        };
        assert_eq!(name, "each");
        assert!(matches!(&children[0], AstNode::BlockHelper { name, .. } if name == "if"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_spans_cover_top_level_nodes() {
        let mut spans = Vec::new();
        let ast = parse_with_spans("Hello {{name}}!\n{{age}}", &mut spans).unwrap();
        let nodes = root(ast);
        assert_eq!(nodes.len(), 4);
        assert_eq!(spans.len(), 4);
        assert_eq!(spans[0], (1, 1));
        assert_eq!(spans[1], (1, 7));
        assert_eq!(spans[3], (2, 1));
    }
}
