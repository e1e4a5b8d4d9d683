use std::io;

#[derive(Debug)]
pub enum StreamError {
    /// I/O operation on a closed stream.
    Closed,
    /// Bytes handed to the stream were not valid UTF-8 text.
    NotText(std::str::Utf8Error),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Closed => write!(f, "I/O operation on closed stream"),
            StreamError::NotText(e) => write!(f, "write() argument must be text: {}", e),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamError::Closed => None,
            StreamError::NotText(e) => Some(e),
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match err {
            StreamError::Closed => io::ErrorKind::BrokenPipe,
            StreamError::NotText(_) => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}
