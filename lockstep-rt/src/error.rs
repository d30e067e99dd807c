use thiserror::Error;

/// Misuse of runtime objects. Lock contention is never an error; it shows
/// up as [`Activation::Deferred`](crate::Activation::Deferred).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("no result has been delivered yet")]
    ResultPending,

    #[error("expected a {expected} result, found a {found} result")]
    ResultCategory {
        expected: &'static str,
        found: &'static str,
    },

    #[error("result does not hold a value of type {0}")]
    ResultType(&'static str),
}
