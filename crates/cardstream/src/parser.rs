//! Best-effort parsing of a growing buffer into a list of entities.
//!
//! The buffer is expected to become a JSON array of objects, possibly after
//! some prose. Every intermediate state of a streamed array is handled: the
//! parser keeps the elements that are complete and drops a trailing element
//! that was cut off. Running out of input is never an error; only input that
//! can no longer become a valid array is reported as invalid.

use serde_json::{Map, Number, Value};

use crate::entity::Entity;

const DEFAULT_MAX_DEPTH: usize = 64;

/// Why a buffer can never resolve to a list of entities.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unexpected character {found:?} at byte {offset}")]
    UnexpectedChar { found: char, offset: usize },
    #[error("invalid escape sequence at byte {offset}")]
    InvalidEscape { offset: usize },
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("nesting deeper than {0} levels")]
    DepthExceeded(usize),
    #[error("element {index} is not an object")]
    NotAnObject { index: usize },
}

/// Outcome of one parse attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// At least the listed entities are known. `complete` is set once the
    /// closing bracket has been seen.
    Entities { entities: Vec<Entity>, complete: bool },
    /// No structured content yet; more input may change that.
    NotYetParseable,
    /// The content has a shape the caller cannot use.
    Invalid(ParseError),
}

/// Recursive-descent parser tolerant of truncated input.
#[derive(Debug, Clone)]
pub struct TolerantParser {
    max_depth: usize,
}

impl Default for TolerantParser {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl TolerantParser {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Parses the current buffer.
    ///
    /// Text before the first `[` is discarded. Anything after the closing
    /// bracket is ignored.
    pub fn parse(&self, buffer: &str) -> ParseOutcome {
        let Some(start) = buffer.find('[') else {
            return ParseOutcome::NotYetParseable;
        };
        let mut cursor = Cursor {
            input: &buffer[start..],
            pos: 0,
            base: start,
            max_depth: self.max_depth,
        };
        let (values, complete) = match cursor.top_level_array() {
            Ok(parsed) => parsed,
            Err(err) => return ParseOutcome::Invalid(err),
        };
        if values.is_empty() && !complete {
            return ParseOutcome::NotYetParseable;
        }
        let mut entities = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            match Entity::try_from(value) {
                Ok(entity) => entities.push(entity),
                Err(_) => return ParseOutcome::Invalid(ParseError::NotAnObject { index }),
            }
        }
        ParseOutcome::Entities { entities, complete }
    }
}

/// Parses with default limits.
pub fn parse_entities(buffer: &str) -> ParseOutcome {
    TolerantParser::default().parse(buffer)
}

enum Halt {
    /// Input ended inside a value.
    Truncated,
    Invalid(ParseError),
}

impl From<ParseError> for Halt {
    fn from(err: ParseError) -> Self {
        Halt::Invalid(err)
    }
}

type Step<T> = Result<T, Halt>;

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
    /// Offset of `input` inside the caller's buffer, for error reporting.
    base: usize,
    max_depth: usize,
}

impl<'a> Cursor<'a> {
    #[inline]
    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    #[inline]
    fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\t' | b'\n' | b'\r') = self.peek() {
            self.pos += 1;
        }
    }

    fn unexpected_char(&self) -> ParseError {
        let found = self.input[self.pos..].chars().next().unwrap_or('\0');
        ParseError::UnexpectedChar {
            found,
            offset: self.base + self.pos,
        }
    }

    fn unexpected(&self) -> Halt {
        Halt::Invalid(self.unexpected_char())
    }

    /// Returns the complete elements and whether `]` was reached.
    fn top_level_array(&mut self) -> Result<(Vec<Value>, bool), ParseError> {
        let mut items = Vec::new();
        self.pos += 1;
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Ok((items, false)),
                Some(b']') => return Ok((items, true)),
                _ => {}
            }
            match self.value(1) {
                Ok(value) => items.push(value),
                Err(Halt::Truncated) => return Ok((items, false)),
                Err(Halt::Invalid(err)) => return Err(err),
            }
            self.skip_whitespace();
            match self.peek() {
                None => return Ok((items, false)),
                Some(b',') => self.pos += 1,
                Some(b']') => return Ok((items, true)),
                Some(_) => return Err(self.unexpected_char()),
            }
        }
    }

    fn value(&mut self, depth: usize) -> Step<Value> {
        if depth > self.max_depth {
            return Err(ParseError::DepthExceeded(self.max_depth).into());
        }
        self.skip_whitespace();
        match self.peek() {
            None => Err(Halt::Truncated),
            Some(b'{') => self.object(depth + 1),
            Some(b'[') => self.array(depth + 1),
            Some(b'"') => self.string().map(Value::String),
            Some(b't') => self.literal("true", Value::Bool(true)),
            Some(b'f') => self.literal("false", Value::Bool(false)),
            Some(b'n') => self.literal("null", Value::Null),
            Some(b'-' | b'0'..=b'9') => self.number(),
            Some(_) => Err(self.unexpected()),
        }
    }

    fn object(&mut self, depth: usize) -> Step<Value> {
        if depth > self.max_depth {
            return Err(ParseError::DepthExceeded(self.max_depth).into());
        }
        let mut map = Map::new();
        self.pos += 1;
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(Halt::Truncated),
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Value::Object(map));
                }
                Some(b'"') => {}
                Some(_) => return Err(self.unexpected()),
            }
            let key = self.string()?;
            self.skip_whitespace();
            match self.peek() {
                None => return Err(Halt::Truncated),
                Some(b':') => self.pos += 1,
                Some(_) => return Err(self.unexpected()),
            }
            let value = self.value(depth)?;
            map.insert(key, value);
            self.skip_whitespace();
            match self.peek() {
                None => return Err(Halt::Truncated),
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Value::Object(map));
                }
                Some(_) => return Err(self.unexpected()),
            }
        }
    }

    fn array(&mut self, depth: usize) -> Step<Value> {
        if depth > self.max_depth {
            return Err(ParseError::DepthExceeded(self.max_depth).into());
        }
        let mut items = Vec::new();
        self.pos += 1;
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(Halt::Truncated),
                Some(b']') => {
                    self.pos += 1;
                    return Ok(Value::Array(items));
                }
                _ => {}
            }
            items.push(self.value(depth)?);
            self.skip_whitespace();
            match self.peek() {
                None => return Err(Halt::Truncated),
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Ok(Value::Array(items));
                }
                Some(_) => return Err(self.unexpected()),
            }
        }
    }

    fn string(&mut self) -> Step<String> {
        self.pos += 1;
        let mut out = String::new();
        let mut run_start = self.pos;
        loop {
            match self.peek() {
                None => return Err(Halt::Truncated),
                Some(b'"') => {
                    out.push_str(&self.input[run_start..self.pos]);
                    self.pos += 1;
                    return Ok(out);
                }
                Some(b'\\') => {
                    out.push_str(&self.input[run_start..self.pos]);
                    self.escape(&mut out)?;
                    run_start = self.pos;
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn escape(&mut self, out: &mut String) -> Step<()> {
        let offset = self.base + self.pos;
        self.pos += 1;
        let Some(code) = self.peek() else {
            return Err(Halt::Truncated);
        };
        self.pos += 1;
        let ch = match code {
            b'"' => '"',
            b'\\' => '\\',
            b'/' => '/',
            b'b' => '\u{0008}',
            b'f' => '\u{000C}',
            b'n' => '\n',
            b'r' => '\r',
            b't' => '\t',
            b'u' => return self.unicode_escape(out, offset),
            _ => return Err(ParseError::InvalidEscape { offset }.into()),
        };
        out.push(ch);
        Ok(())
    }

    fn hex4(&mut self, offset: usize) -> Step<u32> {
        let Some(digits) = self.input.get(self.pos..self.pos + 4) else {
            if self.input[self.pos..].bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(Halt::Truncated);
            }
            return Err(ParseError::InvalidEscape { offset }.into());
        };
        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseError::InvalidEscape { offset }.into());
        }
        let code = u32::from_str_radix(digits, 16)
            .map_err(|_| Halt::Invalid(ParseError::InvalidEscape { offset }))?;
        self.pos += 4;
        Ok(code)
    }

    fn unicode_escape(&mut self, out: &mut String, offset: usize) -> Step<()> {
        let high = self.hex4(offset)?;
        if !(0xD800..0xDC00).contains(&high) {
            out.push(char::from_u32(high).unwrap_or(char::REPLACEMENT_CHARACTER));
            return Ok(());
        }
        let rest = &self.input[self.pos..];
        if rest.len() < 2 && "\\u".starts_with(rest) {
            return Err(Halt::Truncated);
        }
        if !rest.starts_with("\\u") {
            out.push(char::REPLACEMENT_CHARACTER);
            return Ok(());
        }
        let checkpoint = self.pos;
        self.pos += 2;
        let low = self.hex4(offset)?;
        if (0xDC00..0xE000).contains(&low) {
            let combined = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
            out.push(char::from_u32(combined).unwrap_or(char::REPLACEMENT_CHARACTER));
        } else {
            out.push(char::REPLACEMENT_CHARACTER);
            self.pos = checkpoint;
        }
        Ok(())
    }

    fn literal(&mut self, word: &'static str, value: Value) -> Step<Value> {
        let rest = &self.input[self.pos..];
        if rest.starts_with(word) {
            self.pos += word.len();
            return Ok(value);
        }
        if rest.len() < word.len() && word.starts_with(rest) {
            return Err(Halt::Truncated);
        }
        Err(self.unexpected())
    }

    fn number(&mut self) -> Step<Value> {
        let start = self.pos;
        while let Some(b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E') = self.peek() {
            self.pos += 1;
        }
        if self.peek().is_none() {
            // the number may still be growing
            return Err(Halt::Truncated);
        }
        let text = &self.input[start..self.pos];
        serde_json::from_str::<Number>(text)
            .map(Value::Number)
            .map_err(|_| Halt::Invalid(ParseError::InvalidNumber(text.to_string())))
    }
}
