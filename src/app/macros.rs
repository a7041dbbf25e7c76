/// Return early with an `io::Error`, `InvalidData` unless a kind is given.
macro_rules! io_error {
    ($kind:ident, $($arg:tt)+) => {
        return Err(std::io::Error::new(
            std::io::ErrorKind::$kind,
            format!($($arg)+),
        ))
    };
    ($($arg:tt)+) => {
        io_error!(InvalidData, $($arg)+)
    };
}
