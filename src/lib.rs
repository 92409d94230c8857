//! FIPA-style message transport service
//!
//! Every agent process runs a router that accepts letters, resolves each
//! intended receiver through a service directory and either delivers
//! locally through registered handlers or forwards the letter over one of
//! its wire transports. Routers on different hosts cooperate so that any
//! agent can reach any other agent by logical name.
//!
//! The pieces, bottom up:
//!
//! - [`acl`]: agent identifiers, messages, envelopes and the wire codecs
//! - [`directory`]: the local service directory and the discovery-backed
//!   distributed variant
//! - [`transport`]: the tcp and udt transports behind a shared connection
//!   cache and pump
//! - [`router`]: the message transport service tying the above together

pub mod acl;
pub mod directory;
pub mod error;
pub mod router;
pub mod transport;

pub use acl::{AclMessage, AgentId, Envelope, Letter, Performative, Representation};
pub use directory::{
    DistributedServiceDirectory, Field, InMemoryDiscovery, ServiceDirectory,
    ServiceDirectoryEntry, ServiceLocation, ServiceLocator,
};
pub use error::{Error, Result};
pub use router::{
    Directory, MessageTransport, MessageTransportHandler, AGENT_MANAGEMENT_ONTOLOGY,
    INTERNAL_ERROR_LANGUAGE, JADE_PROXY_SIGNATURE, MTS_SERVICE_SIGNATURE,
};
pub use transport::{
    Address, Configuration, Transport, TransportType, MAX_MESSAGE_SIZE_BYTES,
    RECEIVE_BUFFER_SIZE_BYTES,
};
