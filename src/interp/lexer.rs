//! Tokenizer for the snippet language.
//!
//! Produces a flat token stream with explicit `Newline`, `Indent` and
//! `Dedent` markers so the parser never has to look at whitespace.
//! Byte spans are kept on every token (and comments are recorded
//! separately) so the response renderer can highlight the source.

use super::error::{EvalError, EvalResult};

pub const KEYWORDS: &[&str] = &[
    "and", "as", "break", "continue", "def", "elif", "else", "False", "for", "from", "if",
    "import", "in", "is", "None", "not", "or", "pass", "raise", "return", "True", "while",
    "with",
];

/// Operators, longest first so the scanner can match greedily.
const OPERATORS: &[&str] = &[
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "->", "(",
    ")", "[", "]", "{", "}", ",", ":", ".", "=", "<", ">", "+", "-", "*", "/", "%",
];

/// One piece of an f-string.
#[derive(Debug, Clone, PartialEq)]
pub enum FPart {
    Lit(String),
    Expr {
        source: String,
        /// `!r` or `!s`
        conversion: Option<char>,
        /// Text after the top-level `:` (e.g. `.2f`)
        spec: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    FStr(Vec<FPart>),
    Kw(&'static str),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
    /// Byte offsets into the source (`start..end`).
    pub start: usize,
    pub end: usize,
}

/// Output of [`tokenize`].
#[derive(Debug, Default)]
pub struct Lexed {
    pub tokens: Vec<Token>,
    /// Byte spans of `#` comments.
    pub comments: Vec<(usize, usize)>,
}

pub fn tokenize(src: &str) -> EvalResult<Lexed> {
    Lexer::new(src).run()
}

struct Lexer<'a> {
    src: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    at_line_start: bool,
    out: Lexed,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().collect(),
            pos: 0,
            line: 1,
            depth: 0,
            indents: vec![0],
            at_line_start: true,
            out: Lexed::default(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|&(_, c)| c)
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).map(|&(_, c)| c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|&(i, _)| i)
            .unwrap_or(self.src.len())
    }

    fn push(&mut self, tok: Tok, start: usize) {
        let end = self.offset();
        self.out.tokens.push(Token {
            tok,
            line: self.line,
            start,
            end,
        });
    }

    fn last_is_newline(&self) -> bool {
        matches!(
            self.out.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline)
        )
    }

    fn run(mut self) -> EvalResult<Lexed> {
        while self.pos < self.chars.len() {
            if self.at_line_start && self.depth == 0 {
                if self.indentation()? {
                    continue;
                }
            }
            let Some(c) = self.peek() else { break };
            let start = self.offset();
            match c {
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        if !self.last_is_newline() {
                            self.push(Tok::Newline, start);
                        }
                        self.at_line_start = true;
                    }
                    self.line += 1;
                }
                '#' => self.comment(),
                ';' => {
                    self.pos += 1;
                    if !self.last_is_newline() {
                        self.push(Tok::Newline, start);
                    }
                }
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\\' if self.peek_at(1) == Some('\r') && self.peek_at(2) == Some('\n') => {
                    self.pos += 3;
                    self.line += 1;
                }
                '"' | '\'' => {
                    let text = self.string(false)?;
                    self.push(Tok::Str(text), start);
                }
                c if c.is_ascii_digit() => self.number(start)?,
                '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => {
                    self.number(start)?
                }
                c if c.is_alphabetic() || c == '_' => self.word(start)?,
                _ => self.operator(start)?,
            }
        }

        if self.depth > 0 {
            return Err(EvalError::syntax(
                "unexpected EOF while parsing (unclosed bracket)",
                self.line,
            ));
        }
        let end = self.src.len();
        if !self.last_is_newline() {
            self.push(Tok::Newline, end);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent, end);
        }
        self.push(Tok::Eof, end);
        Ok(self.out)
    }

    /// Handles leading whitespace of a logical line. Returns true when the
    /// line was blank (or comment-only) and has been consumed entirely.
    fn indentation(&mut self) -> EvalResult<bool> {
        let start = self.offset();
        let mut col = 0;
        while let Some(c) = self.peek() {
            match c {
                ' ' => col += 1,
                '\t' => col += 8 - col % 8,
                '\x0c' => col = 0,
                _ => break,
            }
            self.pos += 1;
        }
        match self.peek() {
            None => return Ok(true),
            Some('\n') => {
                self.pos += 1;
                self.line += 1;
                return Ok(true);
            }
            Some('\r') if self.peek_at(1) == Some('\n') => {
                self.pos += 2;
                self.line += 1;
                return Ok(true);
            }
            Some('#') => {
                self.comment();
                return Ok(true);
            }
            _ => {}
        }

        self.at_line_start = false;
        let top = *self.indents.last().unwrap_or(&0);
        if col > top {
            self.indents.push(col);
            self.push(Tok::Indent, start);
        } else if col < top {
            while col < *self.indents.last().unwrap_or(&0) {
                self.indents.pop();
                self.push(Tok::Dedent, start);
            }
            if col != *self.indents.last().unwrap_or(&0) {
                return Err(EvalError::syntax(
                    "unindent does not match any outer indentation level",
                    self.line,
                ));
            }
        }
        Ok(false)
    }

    fn comment(&mut self) {
        let start = self.offset();
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
        let end = self.offset();
        self.out.comments.push((start, end));
    }

    fn word(&mut self, start: usize) -> EvalResult<()> {
        let begin = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let word: String = self.chars[begin..self.pos].iter().map(|&(_, c)| c).collect();

        // String prefixes: r"...", f"...", rf"..."
        if matches!(self.peek(), Some('"') | Some('\'')) {
            let lower = word.to_ascii_lowercase();
            if matches!(lower.as_str(), "r" | "f" | "rf" | "fr" | "u") {
                let raw = lower.contains('r');
                let text = self.string(raw)?;
                if lower.contains('f') {
                    let parts = split_fstring(&text, self.line)?;
                    self.push(Tok::FStr(parts), start);
                } else {
                    self.push(Tok::Str(text), start);
                }
                return Ok(());
            }
        }

        match KEYWORDS.iter().find(|&&k| k == word) {
            Some(&kw) => self.push(Tok::Kw(kw), start),
            None => self.push(Tok::Name(word), start),
        }
        Ok(())
    }

    fn number(&mut self, start: usize) -> EvalResult<()> {
        let line = self.line;

        if self.peek() == Some('0') {
            let radix = match self.peek_at(1) {
                Some('x') | Some('X') => Some(16),
                Some('o') | Some('O') => Some(8),
                Some('b') | Some('B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.pos += 2;
                let digits = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
                let digits = digits.replace('_', "");
                let value = i64::from_str_radix(&digits, radix)
                    .map_err(|_| EvalError::syntax(format!("invalid number literal '{digits}'"), line))?;
                self.push(Tok::Int(value), start);
                return Ok(());
            }
        }

        let mut text = self.take_while(|c| c.is_ascii_digit() || c == '_');
        let mut is_float = false;
        if self.peek() == Some('.') && !self.peek_at(1).is_some_and(|c| c.is_alphabetic() || c == '_') {
            self.pos += 1;
            text.push('.');
            text.push_str(&self.take_while(|c| c.is_ascii_digit() || c == '_'));
            is_float = true;
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let sign = matches!(self.peek_at(1), Some('+') | Some('-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                text.push('e');
                if sign {
                    text.push(self.peek_at(1).unwrap_or('+'));
                }
                self.pos += digit_at;
                text.push_str(&self.take_while(|c| c.is_ascii_digit()));
                is_float = true;
            }
        }

        let text = text.replace('_', "");
        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| EvalError::syntax(format!("invalid number literal '{text}'"), line))?;
            self.push(Tok::Float(value), start);
        } else {
            let value: i64 = text.parse().map_err(|_| {
                EvalError::new(
                    super::error::ErrorKind::OverflowError,
                    format!("integer literal too large: {text}"),
                )
                .at_line(line)
            })?;
            self.push(Tok::Int(value), start);
        }
        Ok(())
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            out.push(c);
            self.pos += 1;
        }
        out
    }

    /// Reads a quoted string starting at the opening quote and returns its
    /// decoded contents.
    fn string(&mut self, raw: bool) -> EvalResult<String> {
        let quote = self.peek().unwrap_or('"');
        let start_line = self.line;
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(EvalError::syntax("unterminated string literal", start_line));
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    return Ok(out);
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.pos += 3;
                    return Ok(out);
                }
                out.push(c);
                self.pos += 1;
                continue;
            }
            if c == '\n' {
                if !triple {
                    return Err(EvalError::syntax("unterminated string literal", start_line));
                }
                self.line += 1;
                out.push(c);
                self.pos += 1;
                continue;
            }
            if c == '\\' {
                let Some(next) = self.peek_at(1) else {
                    return Err(EvalError::syntax("unterminated string literal", start_line));
                };
                self.pos += 2;
                if next == '\n' {
                    self.line += 1;
                    if raw {
                        out.push('\\');
                        out.push('\n');
                    }
                    continue;
                }
                if raw {
                    out.push('\\');
                    out.push(next);
                    continue;
                }
                match next {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    '\\' => out.push('\\'),
                    '\'' => out.push('\''),
                    '"' => out.push('"'),
                    other => {
                        out.push('\\');
                        out.push(other);
                    }
                }
                continue;
            }
            out.push(c);
            self.pos += 1;
        }
    }

    fn operator(&mut self, start: usize) -> EvalResult<()> {
        let rest = &self.src[start..];
        let Some(&op) = OPERATORS.iter().find(|op| rest.starts_with(*op)) else {
            let c = self.peek().unwrap_or('?');
            return Err(EvalError::syntax(
                format!("invalid character '{c}'"),
                self.line,
            ));
        };
        match op {
            "(" | "[" | "{" => self.depth += 1,
            ")" | "]" | "}" => {
                if self.depth == 0 {
                    return Err(EvalError::syntax(format!("unmatched '{op}'"), self.line));
                }
                self.depth -= 1;
            }
            _ => {}
        }
        self.pos += op.chars().count();
        self.push(Tok::Op(op), start);
        Ok(())
    }
}

/// Splits decoded f-string text into literal and `{expression}` parts.
fn split_fstring(text: &str, line: usize) -> EvalResult<Vec<FPart>> {
    let chars: Vec<char> = text.chars().collect();
    let mut parts = Vec::new();
    let mut lit = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '{' {
            if chars.get(i + 1) == Some(&'{') {
                lit.push('{');
                i += 2;
                continue;
            }
            if !lit.is_empty() {
                parts.push(FPart::Lit(std::mem::take(&mut lit)));
            }
            i += 1;
            let mut depth = 0usize;
            let mut quote: Option<char> = None;
            let mut expr = String::new();
            let mut conversion = None;
            let mut spec: Option<String> = None;
            loop {
                let Some(&c) = chars.get(i) else {
                    return Err(EvalError::syntax("f-string: expecting '}'", line));
                };
                i += 1;
                if let Some(q) = quote {
                    if c == q {
                        quote = None;
                    }
                    push_part(&mut expr, &mut spec, c);
                    continue;
                }
                match c {
                    '\'' | '"' if spec.is_none() => {
                        quote = Some(c);
                        expr.push(c);
                    }
                    '(' | '[' | '{' => {
                        depth += 1;
                        push_part(&mut expr, &mut spec, c);
                    }
                    ')' | ']' => {
                        depth = depth.saturating_sub(1);
                        push_part(&mut expr, &mut spec, c);
                    }
                    '}' if depth > 0 => {
                        depth -= 1;
                        push_part(&mut expr, &mut spec, c);
                    }
                    '}' => break,
                    '!' if depth == 0
                        && spec.is_none()
                        && matches!(chars.get(i), Some('r') | Some('s'))
                        && matches!(chars.get(i + 1), Some(':') | Some('}')) =>
                    {
                        conversion = chars.get(i).copied();
                        i += 1;
                    }
                    ':' if depth == 0 && spec.is_none() => spec = Some(String::new()),
                    _ => push_part(&mut expr, &mut spec, c),
                }
            }
            if expr.trim().is_empty() {
                return Err(EvalError::syntax(
                    "f-string: empty expression not allowed",
                    line,
                ));
            }
            parts.push(FPart::Expr {
                source: expr.trim().to_string(),
                conversion,
                spec,
            });
        } else if c == '}' {
            if chars.get(i + 1) == Some(&'}') {
                lit.push('}');
                i += 2;
                continue;
            }
            return Err(EvalError::syntax(
                "f-string: single '}' is not allowed",
                line,
            ));
        } else {
            lit.push(c);
            i += 1;
        }
    }
    if !lit.is_empty() {
        parts.push(FPart::Lit(lit));
    }
    Ok(parts)
}

fn push_part(expr: &mut String, spec: &mut Option<String>, c: char) {
    match spec {
        Some(s) => s.push(c),
        None => expr.push(c),
    }
}
