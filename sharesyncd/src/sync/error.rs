use sharesync_core::RemoteError;
use thiserror::Error;

use super::local::LocalError;
use super::ops::OpError;
use super::paths::PathError;
use super::store::StoreError;

/// Share-level error. [`SyncError::kind`] collapses it onto the handling
/// categories the foreground layer cares about.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("the share view is out of date, refresh and try again")]
    StaleView,
    #[error("{0}")]
    IllegalOperation(String),
    #[error("{0} is being transferred, wait for the transfer to finish")]
    InTransfer(String),
    #[error("server rejected the request: {0}")]
    ServerRejected(String),
    #[error("inconsistent server operation: {0}")]
    PermanentProtocolFailure(String),
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    #[error("local filesystem error: {0}")]
    Local(#[from] LocalError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("invalid path: {0}")]
    Path(#[from] PathError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Cancelled,
    StaleView,
    IllegalOperation,
    InTransfer,
    ServerRejected,
    PermanentProtocolFailure,
    Generic,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::StaleView => ErrorKind::StaleView,
            SyncError::IllegalOperation(_) | SyncError::Path(_) => ErrorKind::IllegalOperation,
            SyncError::InTransfer(_) => ErrorKind::InTransfer,
            SyncError::ServerRejected(_) => ErrorKind::ServerRejected,
            SyncError::PermanentProtocolFailure(_) => ErrorKind::PermanentProtocolFailure,
            SyncError::Remote(err) if err.classification() == sharesync_core::RemoteErrorClass::Rejected => {
                ErrorKind::ServerRejected
            }
            SyncError::Store(_) | SyncError::Local(_) | SyncError::Io(_) | SyncError::Remote(_) => {
                ErrorKind::Generic
            }
        }
    }

    /// Whether the user is shown nothing at all.
    pub fn is_silent(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

impl From<OpError> for SyncError {
    fn from(err: OpError) -> Self {
        SyncError::PermanentProtocolFailure(err.to_string())
    }
}

/// What the user picked when a foreground step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Skip,
    Overwrite,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptAnswer {
    pub choice: Choice,
    pub apply_to_all: bool,
}

/// Modal decision maker consulted by foreground operations.
pub trait Prompt: Send {
    fn choose(&mut self, path: &str, error: &SyncError) -> PromptAnswer;
}

/// Threads a remembered "apply to all" answer through one batch operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefaultAction {
    remembered: Option<Choice>,
}

impl DefaultAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remembered(&self) -> Option<Choice> {
        self.remembered
    }

    /// Returns the remembered choice, or asks the prompt and remembers the
    /// answer if the user ticked "apply to all". Silent errors never reach the
    /// prompt and always cancel.
    pub fn resolve(&mut self, prompt: &mut dyn Prompt, path: &str, error: &SyncError) -> Choice {
        if error.is_silent() {
            return Choice::Cancel;
        }
        if let Some(choice) = self.remembered {
            return choice;
        }
        let answer = prompt.choose(path, error);
        if answer.apply_to_all {
            self.remembered = Some(answer.choice);
        }
        answer.choice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(Vec<PromptAnswer>, usize);

    impl Prompt for Scripted {
        fn choose(&mut self, _path: &str, _error: &SyncError) -> PromptAnswer {
            self.1 += 1;
            self.0.remove(0)
        }
    }

    #[test]
    fn apply_to_all_is_remembered_for_the_rest_of_the_batch() {
        let mut prompt = Scripted(
            vec![PromptAnswer {
                choice: Choice::Skip,
                apply_to_all: true,
            }],
            0,
        );
        let mut action = DefaultAction::new();
        let err = SyncError::InTransfer("a.txt".into());
        assert_eq!(action.resolve(&mut prompt, "a.txt", &err), Choice::Skip);
        assert_eq!(action.resolve(&mut prompt, "b.txt", &err), Choice::Skip);
        assert_eq!(prompt.1, 1);
    }

    #[test]
    fn cancelled_never_prompts() {
        let mut prompt = Scripted(Vec::new(), 0);
        let mut action = DefaultAction::new();
        assert_eq!(
            action.resolve(&mut prompt, "a", &SyncError::Cancelled),
            Choice::Cancel
        );
        assert_eq!(prompt.1, 0);
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(SyncError::StaleView.kind(), ErrorKind::StaleView);
        assert_eq!(
            SyncError::Io(std::io::Error::other("x")).kind(),
            ErrorKind::Generic
        );
        assert_eq!(
            SyncError::from(OpError::SelfParent).kind(),
            ErrorKind::PermanentProtocolFailure
        );
    }
}
