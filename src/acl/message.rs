//! Agent identifiers and ACL messages

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an agent: a logical name plus the transport addresses under
/// which the agent (or its message transport service) can be reached.
///
/// Equality and hashing consider the name only. Addresses are routing hints
/// that vary between hops of the same logical agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentId {
    pub name: String,
    pub addresses: Vec<String>,
}

impl AgentId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addresses: Vec::new(),
        }
    }

    pub fn with_addresses(name: impl Into<String>, addresses: Vec<String>) -> Self {
        Self {
            name: name.into(),
            addresses,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_address(&mut self, address: impl Into<String>) {
        self.addresses.push(address.into());
    }
}

impl PartialEq for AgentId {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for AgentId {}

impl std::hash::Hash for AgentId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for AgentId {
    fn from(name: &str) -> Self {
        AgentId::new(name)
    }
}

/// FIPA communicative acts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Performative {
    AcceptProposal,
    Agree,
    Cancel,
    CallForProposal,
    Confirm,
    Disconfirm,
    Failure,
    Inform,
    InformIf,
    InformRef,
    NotUnderstood,
    Propagate,
    Propose,
    Proxy,
    QueryIf,
    QueryRef,
    Refuse,
    RejectProposal,
    Request,
    RequestWhen,
    RequestWhenever,
    Subscribe,
}

impl Performative {
    pub fn as_str(&self) -> &'static str {
        match self {
            Performative::AcceptProposal => "accept-proposal",
            Performative::Agree => "agree",
            Performative::Cancel => "cancel",
            Performative::CallForProposal => "cfp",
            Performative::Confirm => "confirm",
            Performative::Disconfirm => "disconfirm",
            Performative::Failure => "failure",
            Performative::Inform => "inform",
            Performative::InformIf => "inform-if",
            Performative::InformRef => "inform-ref",
            Performative::NotUnderstood => "not-understood",
            Performative::Propagate => "propagate",
            Performative::Propose => "propose",
            Performative::Proxy => "proxy",
            Performative::QueryIf => "query-if",
            Performative::QueryRef => "query-ref",
            Performative::Refuse => "refuse",
            Performative::RejectProposal => "reject-proposal",
            Performative::Request => "request",
            Performative::RequestWhen => "request-when",
            Performative::RequestWhenever => "request-whenever",
            Performative::Subscribe => "subscribe",
        }
    }
}

impl fmt::Display for Performative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An agent communication language message, the payload of a letter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclMessage {
    pub performative: Performative,
    pub sender: AgentId,
    pub receivers: Vec<AgentId>,
    pub reply_to: Vec<AgentId>,
    pub content: String,
    pub language: String,
    pub encoding: String,
    pub ontology: String,
    pub protocol: String,
    pub conversation_id: String,
    pub reply_with: String,
    pub in_reply_to: String,
}

impl AclMessage {
    pub fn new(performative: Performative) -> Self {
        Self {
            performative,
            sender: AgentId::default(),
            receivers: Vec::new(),
            reply_to: Vec::new(),
            content: String::new(),
            language: String::new(),
            encoding: String::new(),
            ontology: String::new(),
            protocol: String::new(),
            conversation_id: String::new(),
            reply_with: String::new(),
            in_reply_to: String::new(),
        }
    }

    pub fn add_receiver(&mut self, receiver: AgentId) {
        self.receivers.push(receiver);
    }

    pub fn set_all_receivers(&mut self, receivers: Vec<AgentId>) {
        self.receivers = receivers;
    }
}
