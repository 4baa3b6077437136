//! Error classification shared by the pipeline's error types.

/// ErrorKind は失敗の運用分類
///
/// - Transient: infrastructure hiccup (store or queue unreachable); the loop
///   keeps going and the next iteration tries again.
/// - Conflict: another writer got there first; expected under multiple
///   scanner instances.
/// - Permanent: retrying the same input cannot succeed (bad payload, bad
///   configuration, programming error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Conflict,
    Permanent,
}

impl ErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Permanent => "permanent",
        };
        f.write_str(s)
    }
}
