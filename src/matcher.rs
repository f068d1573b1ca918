use std::{fmt, sync::Arc};

use serde_json::Value;

use crate::{options::Options, tape::Tape};

/// Compares an incoming tape (first) with a stored one (second) along one dimension.
pub type TapeComparator = Arc<dyn Fn(&Tape, &Tape) -> bool + Send + Sync>;

/// Replacement comparators, one per matching dimension. `None` keeps the default.
#[derive(Clone, Default)]
pub struct MatcherOverrides {
    pub method: Option<TapeComparator>,
    pub url: Option<TapeComparator>,
    pub headers: Option<TapeComparator>,
    pub body: Option<TapeComparator>,
}

impl fmt::Debug for MatcherOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatcherOverrides")
            .field("method", &self.method.is_some())
            .field("url", &self.url.is_some())
            .field("headers", &self.headers.is_some())
            .field("body", &self.body.is_some())
            .finish()
    }
}

/// Boolean request equivalence used by the tape store. There is no scoring: the first stored
/// tape that matches on every dimension wins.
pub struct TapeMatcher<'a> {
    options: &'a Options,
}

impl<'a> TapeMatcher<'a> {
    pub fn new(options: &'a Options) -> Self {
        Self { options }
    }

    pub fn same_as(&self, candidate: &Tape, stored: &Tape) -> bool {
        let overrides = &self.options.matchers;
        check(overrides.method.as_ref(), candidate, stored, same_method)
            && check(overrides.url.as_ref(), candidate, stored, same_url)
            && check(overrides.headers.as_ref(), candidate, stored, |a, b| {
                self.same_headers(a, b)
            })
            && check(overrides.body.as_ref(), candidate, stored, same_body)
    }

    /// Only `match_headers` are compared, minus anything in `ignore_headers`. A header present on
    /// one side only is a mismatch.
    fn same_headers(&self, candidate: &Tape, stored: &Tape) -> bool {
        self.options
            .match_headers
            .iter()
            .filter(|name| {
                !self
                    .options
                    .ignore_headers
                    .iter()
                    .any(|ignored| ignored.eq_ignore_ascii_case(name))
            })
            .all(|name| candidate.req.headers.get_all(name) == stored.req.headers.get_all(name))
    }
}

fn check(
    comparator: Option<&TapeComparator>,
    candidate: &Tape,
    stored: &Tape,
    default: impl FnOnce(&Tape, &Tape) -> bool,
) -> bool {
    match comparator {
        Some(comparator) => comparator(candidate, stored),
        None => default(candidate, stored),
    }
}

fn same_method(candidate: &Tape, stored: &Tape) -> bool {
    candidate.req.method.eq_ignore_ascii_case(&stored.req.method)
}

fn same_url(candidate: &Tape, stored: &Tape) -> bool {
    candidate.req.url == stored.req.url
}

fn same_body(candidate: &Tape, stored: &Tape) -> bool {
    candidate.req.body == stored.req.body
}

/// Body comparator that accepts any pair of bodies.
pub fn ignore_body() -> TapeComparator {
    Arc::new(|_: &Tape, _: &Tape| true)
}

/// Structural JSON comparison; object key order and whitespace are irrelevant. Bodies that are
/// not both valid JSON fall back to byte equality.
pub fn json_body() -> TapeComparator {
    Arc::new(|candidate: &Tape, stored: &Tape| {
        match (
            serde_json::from_slice::<Value>(&candidate.req.body),
            serde_json::from_slice::<Value>(&stored.req.body),
        ) {
            (Ok(left), Ok(right)) => left == right,
            _ => candidate.req.body == stored.req.body,
        }
    })
}
