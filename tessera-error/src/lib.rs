//! Error handling for the Tessera workspace.
//!
//! All crates in the workspace report failures through [`TesseraError`] and
//! the [`TesseraResult`] alias. Errors are constructed with the
//! [`tessera_err`] and [`tessera_bail`] macros, and invariant violations are
//! raised with [`tessera_panic`]. The [`TesseraExpect`] and [`TesseraUnwrap`]
//! extension traits replace bare `expect`/`unwrap` in non-test code so that
//! panics carry a formatted engine error.

use std::borrow::Cow;
use std::fmt::{Display, Formatter};

/// A wrapper around a string error message.
///
/// Static messages are held as `&'static str` without allocating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrString(Cow<'static, str>);

impl<T> From<T> for ErrString
where
    T: Into<Cow<'static, str>>,
{
    fn from(msg: T) -> Self {
        Self(msg.into())
    }
}

impl Display for ErrString {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl AsRef<str> for ErrString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The top-level error type for the Tessera storage engine.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TesseraError {
    /// The URI scheme is not recognized, or the backend serving it is not
    /// enabled in this build/configuration.
    #[error("unsupported scheme: {0}")]
    SchemeUnsupported(ErrString),
    /// An opaque failure reported by the underlying storage backend.
    #[error("backend error: {0}")]
    Backend(ErrString),
    #[error("not found: {0}")]
    NotFound(ErrString),
    #[error("already exists: {0}")]
    AlreadyExists(ErrString),
    /// Moves between different URI schemes are not supported.
    #[error("cross-scheme move is not supported: {0}")]
    CrossSchemeMove(ErrString),
    /// Append mode is not available on the addressed backend.
    #[error("append is not supported: {0}")]
    AppendUnsupported(ErrString),
    /// A file lock was released without a matching acquisition, or the
    /// process-wide lock registry found its refcount out of balance.
    #[error("filelock consistency: {0}")]
    LockConsistency(ErrString),
    /// The task was cancelled before or during execution.
    #[error("cancelled: {0}")]
    Cancelled(ErrString),
    #[error("invalid argument: {0}")]
    InvalidArgument(ErrString),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[cfg(feature = "object_store")]
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),
}

pub type TesseraResult<T> = Result<T, TesseraError>;

/// Construct a [`TesseraError`].
///
/// `tessera_err!(Variant: "format", args..)` builds the named variant;
/// the variant-less form defaults to [`TesseraError::InvalidArgument`].
#[macro_export]
macro_rules! tessera_err {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::TesseraError::$variant($crate::ErrString::from(format!($fmt $(, $arg)*)))
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::tessera_err!(InvalidArgument: $fmt $(, $arg)*)
    };
}

/// Return early with a [`TesseraError`], as [`tessera_err`] constructs it.
#[macro_export]
macro_rules! tessera_bail {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        return Err($crate::tessera_err!($variant: $fmt $(, $arg)*))
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        return Err($crate::tessera_err!($fmt $(, $arg)*))
    };
}

/// Panic on a violated invariant with a formatted message.
#[macro_export]
macro_rules! tessera_panic {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        panic!("{}", format!($fmt $(, $arg)*))
    };
}

/// `expect` with a message, for `Option`s and `TesseraResult`s whose failure
/// is an engine invariant violation rather than a recoverable error.
pub trait TesseraExpect {
    type Output;

    fn tessera_expect(self, msg: &str) -> Self::Output;
}

impl<T> TesseraExpect for Option<T> {
    type Output = T;

    fn tessera_expect(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => tessera_panic!("expected a value: {}", msg),
        }
    }
}

impl<T> TesseraExpect for TesseraResult<T> {
    type Output = T;

    fn tessera_expect(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(e) => tessera_panic!("{}: {}", msg, e),
        }
    }
}

/// `unwrap` for results whose error converts into [`TesseraError`].
pub trait TesseraUnwrap {
    type Output;

    fn tessera_unwrap(self) -> Self::Output;
}

impl<T, E: Into<TesseraError>> TesseraUnwrap for Result<T, E> {
    type Output = T;

    fn tessera_unwrap(self) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                let e: TesseraError = e.into();
                tessera_panic!("{}", e)
            }
        }
    }
}
