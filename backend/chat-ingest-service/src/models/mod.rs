pub mod event;
pub mod message;

pub use event::{ChatMessageEvent, ValidatedEvent};
pub use message::{Message, PersistOutcome};
