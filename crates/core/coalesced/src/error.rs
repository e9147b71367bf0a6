use std::fmt;

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
/// Key construction error.
pub enum Error {
    /// Argument at `position` (zero-based) has no structural encoding
    Encode { position: usize, message: String },
    /// Integer too wide to be represented exactly as a number key
    InexactNumber(i128),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Encode { position, message } => {
                write!(f, "Unable to encode argument {position} into a key: {message}")
            }
            Error::InexactNumber(value) => {
                write!(f, "Number {value} cannot be represented exactly as a key")
            }
        }
    }
}

impl std::error::Error for Error {}
