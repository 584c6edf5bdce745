//! Domain model (event record, transport message, error taxonomy).

pub mod event;
pub mod message;
pub mod errors;

pub use self::event::{EventCandidate, EventRecord};
pub use self::message::{PublishAck, Topic, TransportMessage};
pub use self::errors::{
    DeadLetterError, DecodeError, LogError, PublishError, StorageError, StorageErrorKind,
    ValidationError, ValidationRule,
};
