use thiserror::Error;

/// Canonical result for the execution core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors flowing through BIt pipelines.
///
/// `Clone` is required: a BIt that failed re-throws the same captured cause on
/// every later call, and fan-out operators forward one cause to many queues.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Failure raised by an upstream producer (network, parse, storage).
    #[error("source error: {0}")]
    Source(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// The consumer closed the pipeline before it was exhausted.
    #[error("cancelled by consumer")]
    Cancelled,

    /// The BIt protocol was violated (bad limits, use after close, ...).
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal invariant failed: {0}")]
    Invariant(String),

    /// A primary failure plus further failures observed while closing.
    #[error("{primary} (+{} suppressed)", .suppressed.len())]
    Suppressed {
        primary: Box<Error>,
        suppressed: Vec<Error>,
    },
}

impl Error {
    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::Source(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Wrap `self` to attach context without hiding the cause.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context and suppression wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            Error::Suppressed { primary, .. } => primary.root(),
            other => other,
        }
    }

    /// True when the pipeline ended because its consumer closed it, as opposed
    /// to an upstream failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }
}

/// Accumulates close-time failures: the first becomes the primary, the rest
/// are attached as suppressed.
#[derive(Debug, Default)]
pub struct CloseErrors {
    primary: Option<Error>,
    suppressed: Vec<Error>,
}

impl CloseErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        if self.primary.is_none() {
            self.primary = Some(err);
        } else {
            self.suppressed.push(err);
        }
    }

    /// Record the error half of `res`, if any.
    pub fn record(&mut self, res: Result<()>) {
        if let Err(e) = res {
            self.push(e);
        }
    }

    /// Take over every error recorded by `other`, after those already held.
    pub fn absorb(&mut self, other: CloseErrors) {
        if let Some(p) = other.primary {
            self.push(p);
        }
        for e in other.suppressed {
            self.push(e);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_none()
    }

    pub fn finish(self) -> Result<()> {
        match self.primary {
            None => Ok(()),
            Some(primary) if self.suppressed.is_empty() => Err(primary),
            Some(primary) => Err(Error::Suppressed {
                primary: Box::new(primary),
                suppressed: self.suppressed,
            }),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}
