//! Messaging channel I/O.

pub mod messaging;

pub use messaging::{DeliveryAck, HttpMessagingClient, MediaBlob, MessagingTransport};
