//! Parser and evaluator for discovery predicates.
//!
//! Grammar (keywords are lowercase, whitespace is free):
//!
//! ```text
//! expr    := term ( "or" term )*
//! term    := factor ( "and" factor )*
//! factor  := "not" factor | "(" expr ")" | compare | call
//! compare := field ( "=" | "!=" ) literal
//! call    := ( "starts-with" | "contains" ) "(" field "," literal ")"
//! literal := '...' | "..." | number
//! ```
//!
//! Only the descriptor fields listed in [`QueryField`] can be referenced.
//! Queries longer than [`MAX_QUERY_LEN`] bytes or nested deeper than
//! [`MAX_DEPTH`] levels are rejected, so a hostile datagram cannot make an
//! outlet burn CPU or stack.

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

use crate::domain::stream_info::StreamInfo;

/// Longest accepted query text in bytes.
pub const MAX_QUERY_LEN: usize = 4096;

/// Deepest accepted nesting of `not` and parentheses.
pub const MAX_DEPTH: usize = 32;

/// Errors raised for malformed predicates.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryParseError {
    #[error("query is empty")]
    Empty,

    #[error("query is longer than {max} bytes")]
    TooLong { max: usize },

    #[error("unexpected character {found:?} at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },

    #[error("unterminated string literal starting at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("unknown field {0:?}")]
    UnknownField(String),

    #[error("expected {expected} at offset {offset}")]
    Expected {
        expected: &'static str,
        offset: usize,
    },

    #[error("unexpected end of query, expected {0}")]
    UnexpectedEnd(&'static str),

    #[error("query nests deeper than {max} levels")]
    TooDeep { max: usize },

    #[error("value {0:?} contains both quote characters")]
    UnquotableValue(String),
}

/// Descriptor fields a query may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryField {
    Name,
    Type,
    SourceId,
    Uid,
    SessionId,
    Hostname,
    ChannelFormat,
    ChannelCount,
    NominalSrate,
}

impl QueryField {
    /// Parses a field name as written in queries.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "name" => Some(QueryField::Name),
            "type" => Some(QueryField::Type),
            "source_id" => Some(QueryField::SourceId),
            "uid" => Some(QueryField::Uid),
            "session_id" => Some(QueryField::SessionId),
            "hostname" => Some(QueryField::Hostname),
            "channel_format" => Some(QueryField::ChannelFormat),
            "channel_count" => Some(QueryField::ChannelCount),
            "nominal_srate" => Some(QueryField::NominalSrate),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QueryField::Name => "name",
            QueryField::Type => "type",
            QueryField::SourceId => "source_id",
            QueryField::Uid => "uid",
            QueryField::SessionId => "session_id",
            QueryField::Hostname => "hostname",
            QueryField::ChannelFormat => "channel_format",
            QueryField::ChannelCount => "channel_count",
            QueryField::NominalSrate => "nominal_srate",
        }
    }

    fn is_numeric(self) -> bool {
        matches!(self, QueryField::ChannelCount | QueryField::NominalSrate)
    }

    fn text(self, info: &StreamInfo) -> Cow<'_, str> {
        match self {
            QueryField::Name => Cow::Borrowed(info.name()),
            QueryField::Type => Cow::Borrowed(info.content_type()),
            QueryField::SourceId => Cow::Borrowed(info.source_id()),
            QueryField::Uid => Cow::Borrowed(info.uid()),
            QueryField::SessionId => Cow::Borrowed(info.session_id()),
            QueryField::Hostname => Cow::Borrowed(info.hostname()),
            QueryField::ChannelFormat => Cow::Borrowed(info.channel_format().name()),
            QueryField::ChannelCount => Cow::Owned(info.channel_count().to_string()),
            QueryField::NominalSrate => Cow::Owned(info.nominal_srate().to_string()),
        }
    }

    fn number(self, info: &StreamInfo) -> f64 {
        match self {
            QueryField::ChannelCount => info.channel_count() as f64,
            _ => info.nominal_srate(),
        }
    }
}

/// Parsed predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        field: QueryField,
        negated: bool,
        value: String,
    },
    StartsWith {
        field: QueryField,
        prefix: String,
    },
    Contains {
        field: QueryField,
        needle: String,
    },
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    /// Evaluates the predicate against a descriptor.
    pub fn evaluate(&self, info: &StreamInfo) -> bool {
        match self {
            Predicate::Compare {
                field,
                negated,
                value,
            } => {
                let equal = match (field.is_numeric(), value.parse::<f64>()) {
                    (true, Ok(number)) => field.number(info) == number,
                    _ => field.text(info) == value.as_str(),
                };
                equal != *negated
            }
            Predicate::StartsWith { field, prefix } => field.text(info).starts_with(prefix.as_str()),
            Predicate::Contains { field, needle } => field.text(info).contains(needle.as_str()),
            Predicate::Not(inner) => !inner.evaluate(info),
            Predicate::And(a, b) => a.evaluate(info) && b.evaluate(info),
            Predicate::Or(a, b) => a.evaluate(info) || b.evaluate(info),
        }
    }
}

/// Quotes a literal with whichever quote character it does not contain.
///
/// # Errors
///
/// [`QueryParseError::UnquotableValue`] when it contains both.
pub fn quote_literal(value: &str) -> Result<String, QueryParseError> {
    if !value.contains('\'') {
        Ok(format!("'{value}'"))
    } else if !value.contains('"') {
        Ok(format!("\"{value}\""))
    } else {
        Err(QueryParseError::UnquotableValue(value.to_string()))
    }
}

/// Canonical, fully parenthesized text that parses back to the same tree.
impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Literals come from the parser, so they never contain both quote
        // characters and quoting cannot fail here.
        let quoted = |v: &str| quote_literal(v).unwrap_or_else(|_| format!("'{v}'"));
        match self {
            Predicate::Compare {
                field,
                negated,
                value,
            } => {
                let op = if *negated { "!=" } else { "=" };
                write!(f, "{}{op}{}", field.name(), quoted(value))
            }
            Predicate::StartsWith { field, prefix } => {
                write!(f, "starts-with({},{})", field.name(), quoted(prefix))
            }
            Predicate::Contains { field, needle } => {
                write!(f, "contains({},{})", field.name(), quoted(needle))
            }
            Predicate::Not(inner) => write!(f, "not ({inner})"),
            Predicate::And(a, b) => write!(f, "({a} and {b})"),
            Predicate::Or(a, b) => write!(f, "({a} or {b})"),
        }
    }
}

// ── Tokenizer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Literal(String),
    Eq,
    NotEq,
    LParen,
    RParen,
    Comma,
}

fn tokenize(text: &str) -> Result<Vec<(Token, usize)>, QueryParseError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | ',' | '=' => {
                chars.next();
                let token = match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    _ => Token::Eq,
                };
                tokens.push((token, offset));
            }
            '!' => {
                chars.next();
                match chars.next() {
                    Some((_, '=')) => tokens.push((Token::NotEq, offset)),
                    _ => return Err(QueryParseError::UnexpectedChar { found: '!', offset }),
                }
            }
            '\'' | '"' => {
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some((_, q)) if q == c => break,
                        Some((_, other)) => literal.push(other),
                        None => return Err(QueryParseError::UnterminatedString { offset }),
                    }
                }
                tokens.push((Token::Literal(literal), offset));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let mut number = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_alphanumeric() || matches!(d, '.' | '-' | '+') {
                        number.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Literal(number), offset));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' || d == '-' {
                        word.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Word(word), offset));
            }
            other => return Err(QueryParseError::UnexpectedChar { found: other, offset }),
        }
    }
    Ok(tokens)
}

// ── Recursive-descent parser ──────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, o)| *o).unwrap_or(0)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn peek_word(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w == word)
    }

    fn expect(&mut self, wanted: Token, expected: &'static str) -> Result<(), QueryParseError> {
        let offset = self.offset();
        match self.next() {
            Some(t) if t == wanted => Ok(()),
            Some(_) => Err(QueryParseError::Expected { expected, offset }),
            None => Err(QueryParseError::UnexpectedEnd(expected)),
        }
    }

    fn descend(&mut self) -> Result<(), QueryParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(QueryParseError::TooDeep { max: MAX_DEPTH });
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Predicate, QueryParseError> {
        let mut left = self.term()?;
        while self.peek_word("or") {
            self.next();
            let right = self.term()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Predicate, QueryParseError> {
        let mut left = self.factor()?;
        while self.peek_word("and") {
            self.next();
            let right = self.factor()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Predicate, QueryParseError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.expr()?;
                self.expect(Token::RParen, "')'")?;
                self.depth -= 1;
                Ok(inner)
            }
            Some(Token::Word(word)) if word == "not" => {
                self.descend()?;
                let inner = self.factor()?;
                self.depth -= 1;
                Ok(Predicate::Not(Box::new(inner)))
            }
            Some(Token::Word(word)) if word == "starts-with" || word == "contains" => {
                self.expect(Token::LParen, "'('")?;
                let field = self.field()?;
                self.expect(Token::Comma, "','")?;
                let value = self.literal()?;
                self.expect(Token::RParen, "')'")?;
                Ok(if word == "contains" {
                    Predicate::Contains {
                        field,
                        needle: value,
                    }
                } else {
                    Predicate::StartsWith {
                        field,
                        prefix: value,
                    }
                })
            }
            Some(Token::Word(word)) => {
                let field = QueryField::from_name(&word).ok_or(QueryParseError::UnknownField(word))?;
                let op_offset = self.offset();
                let negated = match self.next() {
                    Some(Token::Eq) => false,
                    Some(Token::NotEq) => true,
                    Some(_) => {
                        return Err(QueryParseError::Expected {
                            expected: "'=' or '!='",
                            offset: op_offset,
                        })
                    }
                    None => return Err(QueryParseError::UnexpectedEnd("'=' or '!='")),
                };
                let value = self.literal()?;
                Ok(Predicate::Compare {
                    field,
                    negated,
                    value,
                })
            }
            Some(_) => Err(QueryParseError::Expected {
                expected: "a field, 'not' or '('",
                offset,
            }),
            None => Err(QueryParseError::UnexpectedEnd("a field, 'not' or '('")),
        }
    }

    fn field(&mut self) -> Result<QueryField, QueryParseError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Word(word)) => {
                QueryField::from_name(&word).ok_or(QueryParseError::UnknownField(word))
            }
            Some(_) => Err(QueryParseError::Expected {
                expected: "a field name",
                offset,
            }),
            None => Err(QueryParseError::UnexpectedEnd("a field name")),
        }
    }

    fn literal(&mut self) -> Result<String, QueryParseError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Literal(value)) => Ok(value),
            Some(_) => Err(QueryParseError::Expected {
                expected: "a quoted value or number",
                offset,
            }),
            None => Err(QueryParseError::UnexpectedEnd("a quoted value or number")),
        }
    }
}

/// Parses a predicate.
///
/// # Errors
///
/// [`QueryParseError`] describing the first problem found.
pub fn parse_predicate(text: &str) -> Result<Predicate, QueryParseError> {
    if text.len() > MAX_QUERY_LEN {
        return Err(QueryParseError::TooLong { max: MAX_QUERY_LEN });
    }
    if text.trim().is_empty() {
        return Err(QueryParseError::Empty);
    }

    let mut parser = Parser {
        tokens: tokenize(text)?,
        pos: 0,
        depth: 0,
    };
    let predicate = parser.expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(QueryParseError::Expected {
            expected: "end of query",
            offset: parser.offset(),
        });
    }
    Ok(predicate)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
