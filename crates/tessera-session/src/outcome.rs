//! Explicit outcome of a unit of work.

/// How a unit of work ended. The only input to the commit/rollback decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<E> {
    /// The work completed normally.
    Success,
    /// The work failed with `E`.
    Failed(E),
}

/// Terminal transaction action derived from an [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Make the changes durable.
    Commit,
    /// Discard the changes.
    Rollback,
}

impl<E> Outcome<E> {
    /// `Success` commits, `Failed` rolls back.
    pub fn decision(&self) -> Decision {
        match self {
            Outcome::Success => Decision::Commit,
            Outcome::Failed(_) => Decision::Rollback,
        }
    }

    /// Whether this is `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Maps the failure value, leaving `Success` untouched.
    pub fn map_err<F, O>(self, op: O) -> Outcome<F>
    where
        O: FnOnce(E) -> F,
    {
        match self {
            Outcome::Success => Outcome::Success,
            Outcome::Failed(err) => Outcome::Failed(op(err)),
        }
    }
}

impl<T, E> From<&Result<T, E>> for Decision {
    fn from(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Decision::Commit,
            Err(_) => Decision::Rollback,
        }
    }
}
