use thiserror::Error;

/// Error returned by a user-supplied cost, dynamics, or path-constraint function.
pub type UserError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while building, transcribing, or solving a problem.
///
/// A solve that runs but fails to converge is not an error; it is reported
/// through [`Solution::success`](crate::Solution::success).
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing builder input, detected when it is supplied.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A query was made before [`Problem::initialize`](crate::Problem::initialize).
    #[error("problem is not initialized: {0} requires initialize() to be called first")]
    NotInitialized(&'static str),

    /// A vector handed to an evaluation has the wrong length.
    #[error("evaluation error: {what} has length {got}, expected {expected}")]
    Evaluation {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// A wrapped user function failed; the message is kept verbatim.
    #[error("user function error: {0}")]
    UserFunction(String),

    /// The orchestrator was misused, e.g. solving before configuration.
    #[error("solve error: {0}")]
    Solve(String),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub(crate) fn check_len(what: &'static str, expected: usize, got: usize) -> Result<()> {
        if expected != got {
            return Err(Error::Evaluation {
                what,
                expected,
                got,
            });
        }
        Ok(())
    }
}

impl From<UserError> for Error {
    fn from(err: UserError) -> Self {
        Error::UserFunction(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
