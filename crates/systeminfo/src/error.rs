use core::fmt;
use std::io;
use std::num::ParseIntError;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    path: PathBuf,
    source: ErrorSource,
}

impl Error {
    pub(crate) fn unreadable(error: io::Error, path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            source: ErrorSource::Io(error),
        }
    }

    pub(crate) fn unparseable(error: ParseIntError, path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            source: ErrorSource::Parse(error),
        }
    }

    /// The sysfs file which could not be read or parsed.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug)]
enum ErrorSource {
    Io(io::Error),
    Parse(ParseIntError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ErrorSource::Io(e) => write!(f, "unable to read {}: {e}", self.path.display()),
            ErrorSource::Parse(e) => write!(f, "unable to parse {}: {e}", self.path.display()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.source {
            ErrorSource::Io(e) => Some(e),
            ErrorSource::Parse(e) => Some(e),
        }
    }
}
