//! Bracket-delimited string templates with pluggable fields.
//!
//! A pattern mixes literal text with field references. Each field reference
//! is resolved by the first registered [`Field`] whose key matches the field
//! name, and replaced by whatever that field's function returns:
//!
//! ```text
//! img_[image name, %e]_[001]      literal "img_", field "image name" with
//!                                 argument "%e", literal "_", field "001"
//! ```
//!
//! ## Syntax
//!
//! | Input | Meaning |
//! |-------|---------|
//! | `[name]` | Field with no arguments |
//! | `[name, a, b]` | Field with arguments `a` and `b` (edge whitespace trimmed) |
//! | `[name, [a, b]]` | One argument `a, b` (brackets keep commas and spaces) |
//! | `[[`, `]]` | Literal `[` and `]` |
//! | `]` alone | Literal `]` |
//! | `[` with no closing `]` | The rest of the string is kept as typed |
//!
//! Inside a bracketed argument, `[[` and `]]` are literal brackets, a lone
//! `[` nests one level and a lone `]` closes one level.
//!
//! ## Failure
//!
//! Substitution never fails. A field that matches no key, gets the wrong
//! number of arguments, or whose function returns an error is left in the
//! output exactly as written. A half-typed pattern in a preview therefore
//! renders as itself instead of crashing.
//!
//! ## State
//!
//! Field functions are `FnMut` closures owned by the pattern, so a counter
//! captured in a field keeps advancing across repeated
//! [`substitute`](StringPattern::substitute) calls on the same instance.

use regex::Regex;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PatternError {
    #[error("field \"{0}\" accepts keyword arguments, which patterns cannot pass")]
    KeywordVariadic(String),
    #[error("a field must have at least a name")]
    EmptyField,
}

/// Error returned by a field function. The field is left unsubstituted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct FieldError(pub String);

impl FieldError {
    pub fn new(message: impl Into<String>) -> Self {
        FieldError(message.into())
    }
}

/// The arguments a field function accepts after the field name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    pub required: usize,
    /// Defaults for the optional arguments that follow the required ones.
    pub defaults: Vec<String>,
    /// Accepts any number of extra arguments.
    pub variadic: bool,
    pub keyword_variadic: bool,
}

impl Signature {
    /// No arguments.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn required(mut self, count: usize) -> Self {
        self.required = count;
        self
    }

    pub fn optional<I, S>(mut self, defaults: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.defaults = defaults.into_iter().map(Into::into).collect();
        self
    }

    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    pub fn keyword_variadic(mut self) -> Self {
        self.keyword_variadic = true;
        self
    }

    /// Fill in defaults for missing optional arguments. `None` when the
    /// argument count does not fit.
    pub(crate) fn bind(&self, args: &[String]) -> Option<Vec<String>> {
        let positional = self.required + self.defaults.len();
        if args.len() < self.required || (!self.variadic && args.len() > positional) {
            return None;
        }
        let mut bound = args.to_vec();
        if bound.len() < positional {
            let missing = positional - bound.len();
            let skip = self.defaults.len() - missing;
            bound.extend(self.defaults.iter().skip(skip).cloned());
        }
        Some(bound)
    }
}

enum FieldKey {
    Regex(Regex),
    Literal(String),
}

impl FieldKey {
    /// Keys are regexes anchored at the start only, so `a+` also matches
    /// `aab`. A key that is not a valid regex only matches itself.
    fn new(key: &str) -> Self {
        match Regex::new(&format!("^(?:{key})")) {
            Ok(re) => FieldKey::Regex(re),
            Err(_) => FieldKey::Literal(key.to_string()),
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            FieldKey::Regex(re) => re.is_match(name),
            FieldKey::Literal(key) => key == name,
        }
    }
}

type FieldFn<C> = Box<dyn FnMut(&C, &str, &[String]) -> Result<String, FieldError>>;

/// A field: key, accepted arguments, and the function producing its text.
///
/// The function receives the substitution context, the field name as
/// written in the pattern, and the bound arguments.
pub struct Field<C> {
    key: String,
    matcher: FieldKey,
    signature: Signature,
    func: FieldFn<C>,
}

impl<C> Field<C> {
    pub fn new<F>(key: &str, signature: Signature, func: F) -> Self
    where
        F: FnMut(&C, &str, &[String]) -> Result<String, FieldError> + 'static,
    {
        Self {
            key: key.to_string(),
            matcher: FieldKey::new(key),
            signature,
            func: Box::new(func),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// One piece of a parsed pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Field {
        name: String,
        args: Vec<String>,
        /// The reference exactly as written, brackets included.
        raw: String,
        /// Char index of the opening `[`.
        start: usize,
        /// Char index of the closing `]`.
        end: usize,
    },
}

/// Input to [`StringPattern::reconstruct_pattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternPiece {
    Text(String),
    /// Field name followed by its arguments.
    Field(Vec<String>),
}

pub struct StringPattern<C> {
    pattern: String,
    parts: Vec<Part>,
    fields: Vec<Field<C>>,
}

impl<C> StringPattern<C> {
    pub fn new(pattern: &str, fields: Vec<Field<C>>) -> Result<Self, PatternError> {
        if let Some(field) = fields.iter().find(|f| f.signature.keyword_variadic) {
            return Err(PatternError::KeywordVariadic(field.key.clone()));
        }
        Ok(Self {
            pattern: pattern.to_string(),
            parts: parse(pattern),
            fields,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Render the pattern, calling field functions with `context`.
    pub fn substitute(&mut self, context: &C) -> String {
        let mut output = String::with_capacity(self.pattern.len());
        for part in &self.parts {
            match part {
                Part::Literal(text) => output.push_str(text),
                Part::Field { name, args, raw, .. } => {
                    match substitute_field(&mut self.fields, context, name, args) {
                        Some(value) => output.push_str(&value),
                        None => output.push_str(raw),
                    }
                }
            }
        }
        output
    }

    /// Name of the field whose brackets contain char offset `position`
    /// (just after the `[` up to and including the `]`).
    ///
    /// Escaped brackets and unterminated fields never count as fields.
    pub fn get_field_at_position(pattern: &str, position: isize) -> Option<String> {
        if position < 0 {
            return None;
        }
        let position = position as usize;
        parse(pattern).into_iter().find_map(|part| match part {
            Part::Field { name, start, end, .. } if start < position && position <= end => Some(name),
            _ => None,
        })
    }

    /// Build an escaped pattern string from text and field pieces.
    ///
    /// Brackets in text are doubled. Arguments containing commas, brackets,
    /// or edge whitespace are wrapped in brackets. A bracketed last argument
    /// is followed by a `,` so its closing `]` is not read as an escape.
    pub fn reconstruct_pattern(pieces: &[PatternPiece]) -> Result<String, PatternError> {
        let mut pattern = String::new();
        for piece in pieces {
            match piece {
                PatternPiece::Text(text) => pattern.push_str(&escape(text)),
                PatternPiece::Field(field) => {
                    let (name, args) = field.split_first().ok_or(PatternError::EmptyField)?;
                    pattern.push('[');
                    pattern.push_str(name);
                    let mut last_bracketed = false;
                    for arg in args {
                        let arg = reconstruct_arg(arg);
                        last_bracketed = arg.starts_with('[');
                        pattern.push_str(", ");
                        pattern.push_str(&arg);
                    }
                    if last_bracketed {
                        pattern.push(',');
                    }
                    pattern.push(']');
                }
            }
        }
        Ok(pattern)
    }

    /// Parse the inside of a field reference, e.g. `"image name, %e"`.
    pub fn parse_field(field: &str) -> (String, Vec<String>) {
        let chars: Vec<char> = field.chars().chain(std::iter::once(']')).collect();
        match parse_field_body(&chars, 0) {
            Some((name, args, _)) => (name, args),
            None => (field.trim().to_string(), Vec::new()),
        }
    }
}

fn substitute_field<C>(fields: &mut [Field<C>], context: &C, name: &str, args: &[String]) -> Option<String> {
    let field = fields.iter_mut().find(|f| f.matcher.matches(name))?;
    let bound = field.signature.bind(args)?;
    match (field.func)(context, name, &bound) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(field = name, error = %e, "field left unsubstituted");
            None
        }
    }
}

fn escape(text: &str) -> String {
    text.replace('[', "[[").replace(']', "]]")
}

fn reconstruct_arg(arg: &str) -> String {
    let needs_brackets = arg.contains([',', '[', ']']) || arg.trim() != arg;
    if needs_brackets {
        format!("[{}]", escape(arg))
    } else {
        arg.to_string()
    }
}

// ============================================================================
// Parsing
// ============================================================================

fn parse(pattern: &str) -> Vec<Part> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        let next = chars.get(i + 1).copied();
        match chars[i] {
            '[' if next == Some('[') => {
                literal.push('[');
                i += 2;
            }
            '[' => match parse_field_body(&chars, i + 1) {
                Some((name, args, end)) => {
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(Part::Field {
                        name,
                        args,
                        raw: chars[i..=end].iter().collect(),
                        start: i,
                        end,
                    });
                    i = end + 1;
                }
                None => {
                    literal.extend(&chars[i..]);
                    break;
                }
            },
            ']' if next == Some(']') => {
                literal.push(']');
                i += 2;
            }
            c => {
                literal.push(c);
                i += 1;
            }
        }
    }
    if !literal.is_empty() {
        parts.push(Part::Literal(literal));
    }
    parts
}

enum Segment {
    Plain(String),
    Bracketed(String),
}

#[derive(Default)]
struct Token {
    segments: Vec<Segment>,
    plain: String,
}

impl Token {
    fn flush_plain(&mut self) {
        if !self.plain.is_empty() {
            self.segments.push(Segment::Plain(std::mem::take(&mut self.plain)));
        }
    }

    /// Rendered text, and whether any part of it was bracketed.
    fn finish(mut self) -> (String, bool) {
        self.flush_plain();
        let bracketed = self.segments.iter().any(|s| matches!(s, Segment::Bracketed(_)));
        let last = self.segments.len().saturating_sub(1);
        let mut text = String::new();
        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Bracketed(s) => text.push_str(s),
                Segment::Plain(s) => {
                    let mut s = s.as_str();
                    if index == 0 {
                        s = s.trim_start();
                    }
                    if index == last {
                        s = s.trim_end();
                    }
                    text.push_str(s);
                }
            }
        }
        (text, bracketed)
    }
}

/// Parse a field body starting after its opening `[`. Returns the name, the
/// arguments, and the index of the closing `]`, or `None` if unterminated.
fn parse_field_body(chars: &[char], start: usize) -> Option<(String, Vec<String>, usize)> {
    let mut tokens: Vec<(String, bool)> = Vec::new();
    let mut token = Token::default();
    let mut bracket = String::new();
    let mut depth = 1;
    let mut i = start;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if depth == 1 {
            match c {
                ']' => {
                    tokens.push(token.finish());
                    return Some(finish_tokens(tokens, i));
                }
                '[' => {
                    token.flush_plain();
                    depth = 2;
                }
                ',' => tokens.push(std::mem::take(&mut token).finish()),
                c => token.plain.push(c),
            }
            i += 1;
            continue;
        }

        match c {
            '[' if next == Some('[') => {
                bracket.push('[');
                i += 2;
            }
            ']' if next == Some(']') => {
                bracket.push(']');
                i += 2;
            }
            '[' => {
                bracket.push('[');
                depth += 1;
                i += 1;
            }
            ']' => {
                depth -= 1;
                if depth == 1 {
                    token.segments.push(Segment::Bracketed(std::mem::take(&mut bracket)));
                } else {
                    bracket.push(']');
                }
                i += 1;
            }
            c => {
                bracket.push(c);
                i += 1;
            }
        }
    }
    None
}

fn finish_tokens(mut tokens: Vec<(String, bool)>, end: usize) -> (String, Vec<String>, usize) {
    // a trailing comma leaves an empty last token
    if matches!(tokens.last(), Some((text, false)) if text.is_empty()) {
        tokens.pop();
    }
    let mut texts = tokens.into_iter().map(|(text, _)| text);
    let name = texts.next().unwrap_or_default();
    (name, texts.collect(), end)
}
