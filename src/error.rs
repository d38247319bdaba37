use nix::errno::Errno;
use thiserror::Error;

/// Protocol error category, first field of every `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Invalid,
    Limit,
    NotFound,
    State,
    Io,
    Internal,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Invalid => "invalid",
            Category::Limit => "limit",
            Category::NotFound => "not-found",
            Category::State => "state",
            Category::Io => "io",
            Category::Internal => "internal",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed command. Rendered as `error\tCATEGORY\tDETAIL` on the issuing
/// controller; never tears anything down.
#[derive(Debug, Error)]
#[error("{category}\t{detail}")]
pub struct CmdError {
    pub category: Category,
    pub detail: String,
}

impl CmdError {
    pub fn new(category: Category, detail: impl Into<String>) -> Self {
        Self {
            category,
            detail: detail.into(),
        }
    }

    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::new(Category::Invalid, detail)
    }

    pub fn limit(detail: impl Into<String>) -> Self {
        Self::new(Category::Limit, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(Category::NotFound, detail)
    }

    pub fn state(detail: impl Into<String>) -> Self {
        Self::new(Category::State, detail)
    }
}

impl From<Errno> for CmdError {
    fn from(e: Errno) -> Self {
        Self::new(Category::Io, e.desc())
    }
}

impl From<std::io::Error> for CmdError {
    fn from(e: std::io::Error) -> Self {
        Self::new(Category::Io, e.to_string())
    }
}
