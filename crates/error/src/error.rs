pub type Result<T> = std::result::Result<T, Error>;
impl<T> From<Error> for Result<T> {
    fn from(e: Error) -> Self {
        Err(e)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Invalid user input, such as the null owner identity.
    InvalidInput(String),
    /// A bounded lock acquisition gave up before the lock became available.
    Timeout(String),
}

impl std::error::Error for Error {}
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::Timeout(msg) => write!(f, "Timed out: {}", msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::InvalidInput("owner id 0".to_string()).to_string(),
            "Invalid input: owner id 0"
        );
        assert_eq!(
            Error::Timeout("write lock on \"f\"".to_string()).to_string(),
            "Timed out: write lock on \"f\""
        );
    }

    #[test]
    fn test_error_into_result() {
        let result: Result<()> = Error::Timeout("x".to_string()).into();
        assert_eq!(result, Err(Error::Timeout("x".to_string())));
    }
}
