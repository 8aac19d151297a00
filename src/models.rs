use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// Runtime configuration assembled by the CLI layer.
#[derive(Debug, Clone)]
pub(crate) struct WatchConfig {
    pub(crate) root: PathBuf,
    pub(crate) ignored_dirs: Vec<String>
}

#[derive(Debug)]
pub(crate) struct Error {
    pub(crate) msg: String
}

impl Error {
    pub fn new<T: AsRef<str>>(msg: T) -> Self {
        Error { msg: msg.as_ref().to_string() }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::new(format!("I/O: {value}"))
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(value: nix::errno::Errno) -> Self {
        Error::new(format!("{value}"))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msg)
    }
}
