//! ACL letter model: agent identifiers, messages, envelopes and wire codecs

pub mod codec;
pub mod envelope;
pub mod message;

pub use envelope::{BaseEnvelope, Envelope, Letter, Representation};
pub use message::{AclMessage, AgentId, Performative};
