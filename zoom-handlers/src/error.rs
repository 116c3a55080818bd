//! Handler dispatch errors.

use zoom_core::ConfigError;

/// Errors raised while dispatching a named handler (spec.md §4.4, §6, §7).
///
/// These are reported through the host's control-plane error channel; a
/// failed dispatch never has partial effect on monitor state.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// No handler is registered under this name.
    #[error("unknown handler {0:?}")]
    UnknownHandler(String),

    /// The handler exists but not in the direction requested.
    #[error("handler {name:?} has no {dir} side")]
    WrongDirection { name: String, dir: &'static str },

    /// A write handler's argument string could not be parsed.
    #[error("invalid arguments for handler {name:?}: {detail}")]
    BadArgument { name: String, detail: String },

    /// Setting an annotation or the memory cap failed at the monitor
    /// level (e.g. memory exhausted while allocating along the
    /// annotation path).
    #[error(transparent)]
    Config(#[from] ConfigError),
}
