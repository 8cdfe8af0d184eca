// Every herald error records which broker subsystem it surfaced in,
// carries a backtrace from its construction site, and is reported into
// tracing exactly once -- at construction. Worker loops can therefore
// match on a Result, drop the connection or skip the job, and move on
// without re-logging the cause.

use backtrace_error::DynBacktraceError;
use std::borrow::Cow;
use std::fmt;
use tracing::error;

/// The subsystem an error surfaced in. Carried in the log line and the
/// Display form so an operator can tell a wedged store apart from a
/// flaky cluster without reading backtraces.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Site {
    Config,
    Store,
    Consensus,
    Net,
    Admin,
    /// Process wiring and anything that belongs to no single subsystem;
    /// also where bare `?` conversions of foreign errors land.
    Broker,
}

impl Site {
    pub fn as_str(&self) -> &'static str {
        match self {
            Site::Config => "config",
            Site::Store => "store",
            Site::Consensus => "consensus",
            Site::Net => "net",
            Site::Admin => "admin",
            Site::Broker => "broker",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    site: Site,
    cause: DynBacktraceError,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn at<E>(site: Site, cause: E) -> Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        error!(site = site.as_str(), "{:?}", cause);
        Error {
            site,
            cause: DynBacktraceError::from(cause),
        }
    }

    pub fn site(&self) -> Site {
        self.site
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:?}", self.site.as_str(), self.cause)
    }
}

// Bare `?` on a foreign error lands in the catch-all site; fallible calls
// inside a subsystem should go through `Locate::at` (or `err`) instead so
// the log line names where things went wrong.
impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(cause: E) -> Error {
        Error::at(Site::Broker, cause)
    }
}

/// An ad-hoc error with a fixed message, tagged with its subsystem.
pub fn err(site: Site, msg: impl Into<Cow<'static, str>>) -> Error {
    Error::at(site, TextError(msg.into()))
}

struct TextError(Cow<'static, str>);

impl fmt::Debug for TextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for TextError {}

/// Tags the error side of a foreign Result with the subsystem it
/// surfaced in.
pub trait Locate<T> {
    fn at(self, site: Site) -> Result<T>;
}

impl<T, E> Locate<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn at(self, site: Site) -> Result<T> {
        self.map_err(|e| Error::at(site, e))
    }
}
