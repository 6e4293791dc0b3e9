use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TalusError>;

/// Errors surfaced by arena operations.
///
/// `NotEnoughSpace` and `WrongReadPosition` are the two outcomes callers are
/// expected to handle; `Invalid` and `Corruption` indicate misuse or a
/// damaged arena.
#[derive(Debug, Error)]
pub enum TalusError {
    /// The requested write cannot be satisfied and no in-flight writer holds
    /// space that could change that.
    #[error("not enough space")]
    NotEnoughSpace,
    /// The key is unknown: never issued, already freed, or invented.
    #[error("wrong read position index")]
    WrongReadPosition,
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("corruption: {0}")]
    Corruption(&'static str),
}
