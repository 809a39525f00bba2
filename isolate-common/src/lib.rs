pub mod config;
pub mod tracing;

/// Implemented by error types that are safe to forward to a remote
/// caller. `Display`/`Debug` often leak internal detail (file paths,
/// repo errors); `to_safe_string` is the string that is allowed to
/// cross the RPC boundary.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;
}
