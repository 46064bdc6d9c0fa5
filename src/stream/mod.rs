//! Replication stream messages and their decoding.

pub mod builder;
pub mod decoder;
pub mod types;


pub use builder::StreamBuilder;
pub use decoder::{DecodedMessage, StreamDecoder};
pub use types::{ChangeOperation, StreamMessage, WireRow};
