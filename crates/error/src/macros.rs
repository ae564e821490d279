/// Constructs a [`crate::Error::InvalidInput`] for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::Error::InvalidInput(format!($($args)*)).into() };
}

/// Constructs a [`crate::Error::Timeout`] for the given format string.
#[macro_export]
macro_rules! errtimeout {
    ($($args:tt)*) => { $crate::Error::Timeout(format!($($args)*)).into() };
}
