use snafu::Snafu;

/// The taxonomy from the design: the core only ever branches on `NotFound` and
/// `Unprocessable`, everything else is either logged-and-bubbled or fatal.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum Error {
    #[snafu(display("http error calling the forge: {}", source))]
    Http { source: reqwest::Error },

    #[snafu(display("forge responded {}: {}", code, msg))]
    Forge { code: u16, msg: String },

    #[snafu(display("not found: {}", what))]
    NotFound { what: String },

    #[snafu(display("ambiguous reference: {}", what))]
    Ambiguous { what: String },

    #[snafu(display("unprocessable: {}", what))]
    Unprocessable { what: String },

    #[snafu(display("timed out: {}", what))]
    Timeout { what: String },

    #[snafu(display("{}", msg))]
    Message { msg: String },

    #[snafu(display("configuration error: {}", msg))]
    Config { msg: String },
}

impl Error {
    /// The HTTP-like status code carried by this error, when it has one. Mirrors the
    /// `{code, name}` shape the design says every forge error carries (ForgeClient, §4.1).
    pub fn http_code(&self) -> Option<u16> {
        match self {
            Error::Forge { code, .. } => Some(*code),
            Error::NotFound { .. } => Some(404),
            Error::Unprocessable { .. } => Some(422),
            Error::Ambiguous { .. } => Some(300),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_unprocessable(&self) -> bool {
        matches!(self, Error::Unprocessable { .. })
    }

    pub fn message(msg: impl Into<String>) -> Error {
        Error::Message { msg: msg.into() }
    }
}
