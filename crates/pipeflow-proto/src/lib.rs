//! Wire messages and converters for pipeflow.
//!
//! This crate contains:
//! - Protobuf message types exchanged between Manager and Workers
//! - Converters between wire types and domain types

pub mod convert;
pub mod pb;

pub use convert::ProtoError;
pub use pb::envelope::Payload;
pub use pb::Envelope;
