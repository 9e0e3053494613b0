//! Discovery queries.
//!
//! A [`Query`] is a parsed predicate plus its canonical text.  Resolvers
//! build one, send the canonical text in every query wave, and outlets parse
//! it again on receipt.  Parsing happens before any network I/O on the
//! resolver side, so a malformed predicate fails synchronously.
//!
//! Every query a resolver sends is scoped to one session id.  User
//! predicates are parsed on their own first and then combined with the
//! session clause at the tree level, so a predicate such as
//! `name='a') or (type='b'` cannot escape the session scope.

pub mod cache;
pub mod parser;

use crate::domain::stream_info::StreamInfo;

pub use cache::QueryCache;
pub use parser::{parse_predicate, quote_literal, Predicate, QueryField, QueryParseError};

/// A parsed, canonicalized discovery predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    text: String,
    root: Predicate,
}

impl Query {
    /// Parses `text` as a predicate.
    ///
    /// # Errors
    ///
    /// [`QueryParseError`] for malformed input.
    pub fn parse(text: &str) -> Result<Self, QueryParseError> {
        let root = parse_predicate(text)?;
        Ok(Self {
            text: root.to_string(),
            root,
        })
    }

    /// Canonical text, as sent on the wire.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn predicate(&self) -> &Predicate {
        &self.root
    }

    /// `true` if `info` satisfies the predicate.
    pub fn matches(&self, info: &StreamInfo) -> bool {
        self.root.evaluate(info)
    }

    /// Stable 64-bit id of the query text (FNV-1a).
    ///
    /// Discovery replies echo it so a resolver can ignore replies meant for
    /// other resolvers sharing the host.
    pub fn id(&self) -> u64 {
        query_id(&self.text)
    }
}

/// FNV-1a hash of a query text.
pub fn query_id(text: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    text.bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

fn session_clause(session_id: &str) -> Result<Predicate, QueryParseError> {
    Ok(Predicate::Compare {
        field: QueryField::SessionId,
        negated: false,
        value: checked_literal(session_id)?,
    })
}

fn checked_literal(value: &str) -> Result<String, QueryParseError> {
    quote_literal(value)?;
    Ok(value.to_string())
}

fn scoped(session_id: &str, inner: Option<Predicate>) -> Result<Query, QueryParseError> {
    let session = session_clause(session_id)?;
    let root = match inner {
        Some(predicate) => Predicate::And(Box::new(session), Box::new(predicate)),
        None => session,
    };
    Ok(Query {
        text: root.to_string(),
        root,
    })
}

/// Builds the query for "every stream in `session_id` matching `predicate`".
///
/// An empty or absent predicate matches every stream of the session.
///
/// # Errors
///
/// [`QueryParseError`] if the predicate is malformed.
pub fn build_query(session_id: &str, predicate: Option<&str>) -> Result<Query, QueryParseError> {
    let inner = match predicate.map(str::trim) {
        None | Some("") => None,
        Some(text) => Some(parse_predicate(text)?),
    };
    scoped(session_id, inner)
}

/// Builds the query for "every stream in `session_id` whose `field` equals
/// `value`".
///
/// # Errors
///
/// [`QueryParseError::UnknownField`] for fields queries cannot reference and
/// [`QueryParseError::UnquotableValue`] for values containing both quotes.
pub fn build_field_query(
    session_id: &str,
    field: &str,
    value: &str,
) -> Result<Query, QueryParseError> {
    let field =
        QueryField::from_name(field).ok_or_else(|| QueryParseError::UnknownField(field.into()))?;
    let predicate = Predicate::Compare {
        field,
        negated: false,
        value: checked_literal(value)?,
    };
    scoped(session_id, Some(predicate))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::channel_format::ChannelFormat;

    fn make_info(session: &str) -> StreamInfo {
        let mut info =
            StreamInfo::new("fullinfo", "unittest", 1, 1.0, ChannelFormat::Int8, "fullinfo1234")
                .expect("valid");
        info.set_session_id(session);
        info
    }

    #[test]
    fn test_build_field_query_scopes_to_session() {
        // Arrange
        let query = build_field_query("lab-a", "name", "fullinfo").expect("build");

        // Act / Assert
        assert!(query.matches(&make_info("lab-a")));
        assert!(!query.matches(&make_info("lab-b")));
        assert_eq!(query.text(), "(session_id='lab-a' and name='fullinfo')");
    }

    #[test]
    fn test_build_query_without_predicate_matches_whole_session() {
        let query = build_query("default", None).expect("build");

        assert!(query.matches(&make_info("default")));
        assert!(!query.matches(&make_info("other")));
    }

    #[test]
    fn test_build_query_cannot_escape_session_scope() {
        // Arrange – an attempt to close the session clause early
        let result = build_query("lab-a", Some("name='x') or (type='unittest'"));

        // Assert – rejected as malformed, not silently widened
        assert!(result.is_err());
    }

    #[test]
    fn test_build_query_wraps_disjunction() {
        // Arrange
        let query = build_query("lab-a", Some("name='nope' or type='unittest'")).expect("build");

        // Act / Assert
        assert!(query.matches(&make_info("lab-a")));
        assert!(!query.matches(&make_info("lab-b")));
    }

    #[test]
    fn test_build_field_query_rejects_unknown_field() {
        assert_eq!(
            build_field_query("s", "desc", "x"),
            Err(QueryParseError::UnknownField("desc".to_string()))
        );
    }

    #[test]
    fn test_canonical_text_reparses_to_same_query() {
        let query = build_query("s", Some("starts-with(name,'full')")).expect("build");

        let reparsed = Query::parse(query.text()).expect("reparse");

        assert_eq!(reparsed, query);
        assert_eq!(reparsed.id(), query.id());
    }

    #[test]
    fn test_query_id_differs_between_queries() {
        let a = build_field_query("s", "name", "a").expect("build");
        let b = build_field_query("s", "name", "b").expect("build");

        assert_ne!(a.id(), b.id());
    }
}
