use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

/// Classification of [`RouterError`] without carrying the payload.
///
/// `NullArgument` is never actually constructed as a `RouterError` — it
/// signals a contract violation by the embedding code and is raised via
/// `expect`/`debug_assert!` at the call site instead, same as a programmer
/// error anywhere else in this crate.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// A caller passed a reserved sentinel (`TxId` of `0`) where a real
    /// transaction id was required.
    NullArgument,
    /// Outbound dispatch reached a message variant the tagging switch does
    /// not recognize.
    UnsupportedMessage,
    /// A configured duration (e.g. `lookup_timeout`) was negative.
    InvalidInterval,
    /// An unsubscribe referenced a key with no live subscription and
    /// `non_exist_subscription_as_error` is set.
    NonExistSubscription,
}

#[derive(Debug)]
pub struct RouterError {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl RouterError {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self { kind, source: Some(Box::new(source)), backtrace: Backtrace::capture() }
    }

    fn bare(kind: Kind) -> Self {
        Self { kind, source: None, backtrace: Backtrace::capture() }
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn unsupported_message(message_type: &str) -> Self {
        UnsupportedMessage { message_type: message_type.to_owned() }.into()
    }

    #[must_use]
    pub fn invalid_interval(field: &str) -> Self {
        InvalidInterval { field: field.to_owned() }.into()
    }

    #[must_use]
    pub fn non_exist_subscription(tx_id: u64) -> Self {
        NonExistSubscription { tx_id }.into()
    }

    /// Programmer-error path for a sentinel (zero) `TxId` reaching a place that
    /// requires a real one. Kept as a constructor (rather than a bare `panic!`
    /// at call sites) so the `Kind::NullArgument` classification stays in one
    /// place; callers still `.expect(...)` on the `Result` this yields.
    #[must_use]
    pub fn null_argument(what: &str) -> Self {
        let mut err = Self::bare(Kind::NullArgument);
        err.source = Some(Box::new(Validation { reason: format!("{what} must not be null") }));
        err
    }
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for RouterError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
struct Validation {
    reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

#[non_exhaustive]
#[derive(Debug)]
pub struct UnsupportedMessage {
    pub message_type: String,
}

impl fmt::Display for UnsupportedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "outbound tagging does not understand message type {}", self.message_type)
    }
}

impl StdError for UnsupportedMessage {}

impl From<UnsupportedMessage> for RouterError {
    fn from(err: UnsupportedMessage) -> Self {
        RouterError::with_source(Kind::UnsupportedMessage, err)
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct InvalidInterval {
    pub field: String,
}

impl fmt::Display for InvalidInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} must be a non-negative duration", self.field)
    }
}

impl StdError for InvalidInterval {}

impl From<InvalidInterval> for RouterError {
    fn from(err: InvalidInterval) -> Self {
        RouterError::with_source(Kind::InvalidInterval, err)
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct NonExistSubscription {
    pub tx_id: u64,
}

impl fmt::Display for NonExistSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsubscribe for tx {} references no live subscription", self.tx_id)
    }
}

impl StdError for NonExistSubscription {}

impl From<NonExistSubscription> for RouterError {
    fn from(err: NonExistSubscription) -> Self {
        RouterError::with_source(Kind::NonExistSubscription, err)
    }
}
