pub mod errors;
pub mod events;
pub mod records;

pub use errors::{CleanupReason, CleanupWarning, SpriteError, SpriteErrorKind};
