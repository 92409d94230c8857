//! Letters: a base envelope, overlay envelopes and the message payload

use super::message::{AclMessage, AgentId};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Wire representation of an envelope or message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Representation {
    /// Compact binary form, the default between cooperating transport services
    Bitefficient,
    /// Human-readable s-expression form
    StringRep,
    /// XML form, used towards foreign proxy peers
    Xml,
}

impl Representation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Representation::Bitefficient => "fipa.acl.rep.bitefficient.std",
            Representation::StringRep => "fipa.acl.rep.string.std",
            Representation::Xml => "fipa.acl.rep.xml.std",
        }
    }

    pub fn from_str_name(name: &str) -> Result<Self> {
        match name {
            "fipa.acl.rep.bitefficient.std" => Ok(Representation::Bitefficient),
            "fipa.acl.rep.string.std" => Ok(Representation::StringRep),
            "fipa.acl.rep.xml.std" => Ok(Representation::Xml),
            other => Err(Error::InvalidArgument(format!(
                "unknown acl representation '{}'",
                other
            ))),
        }
    }
}

/// The effective (or initial) envelope of a letter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseEnvelope {
    pub from: Option<AgentId>,
    pub to: Vec<AgentId>,
    pub intended_receivers: Vec<AgentId>,
    pub acl_representation: Option<Representation>,
    pub payload_length: Option<usize>,
}

impl BaseEnvelope {
    /// Receivers of the current hop. Falls back to `to` when no envelope set
    /// dedicated intended receivers, as the FIPA envelope rules require.
    pub fn intended_receivers(&self) -> &[AgentId] {
        if self.intended_receivers.is_empty() {
            &self.to
        } else {
            &self.intended_receivers
        }
    }

    pub fn from_agent(&self) -> Option<&AgentId> {
        self.from.as_ref()
    }
}

/// An overlay envelope. Unset fields inherit from the envelopes below it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Option<AgentId>,
    pub to: Option<Vec<AgentId>>,
    pub intended_receivers: Option<Vec<AgentId>>,
    pub acl_representation: Option<Representation>,
    pub payload_length: Option<usize>,
}

impl Envelope {
    pub fn overriding_receivers(receivers: Vec<AgentId>) -> Self {
        Envelope {
            intended_receivers: Some(receivers),
            ..Envelope::default()
        }
    }
}

/// A letter: base envelope, ordered overlays, the serialized message payload
/// and the delivery path collected while the letter travels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Letter {
    base: BaseEnvelope,
    extra: Vec<Envelope>,
    payload: Vec<u8>,
    delivery_path: Vec<AgentId>,
}

impl Letter {
    /// Wrap a message into a fresh letter using the given payload
    /// representation.
    pub fn new(message: AclMessage, representation: Representation) -> Result<Self> {
        let payload = super::codec::encode_message(&message, representation)?;
        let base = BaseEnvelope {
            from: Some(message.sender.clone()),
            to: message.receivers.clone(),
            intended_receivers: Vec::new(),
            acl_representation: Some(representation),
            payload_length: Some(payload.len()),
        };
        Ok(Letter {
            base,
            extra: Vec::new(),
            payload,
            delivery_path: Vec::new(),
        })
    }

    pub fn base_envelope(&self) -> &BaseEnvelope {
        &self.base
    }

    pub(crate) fn replace_base(&mut self, base: BaseEnvelope) {
        self.base = base;
    }

    pub fn extra_envelopes(&self) -> &[Envelope] {
        &self.extra
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn delivery_path(&self) -> &[AgentId] {
        &self.delivery_path
    }

    /// Append an agent to the delivery path.
    pub fn stamp(&mut self, agent: AgentId) {
        self.delivery_path.push(agent);
    }

    pub fn has_stamp(&self, agent: &AgentId) -> bool {
        self.delivery_path.contains(agent)
    }

    pub fn delivery_path_string(&self) -> String {
        self.delivery_path
            .iter()
            .map(|agent| agent.name.as_str())
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Left-to-right fold of the base envelope and all overlays.
    pub fn flattened(&self) -> BaseEnvelope {
        let mut effective = self.base.clone();
        for envelope in &self.extra {
            if let Some(from) = &envelope.from {
                effective.from = Some(from.clone());
            }
            if let Some(to) = &envelope.to {
                effective.to = to.clone();
            }
            if let Some(receivers) = &envelope.intended_receivers {
                effective.intended_receivers = receivers.clone();
            }
            if let Some(representation) = envelope.acl_representation {
                effective.acl_representation = Some(representation);
            }
            if let Some(length) = envelope.payload_length {
                effective.payload_length = Some(length);
            }
        }
        effective
    }

    /// Copy of this letter whose intended receivers are exactly the given
    /// agent. Used for the per-receiver fan-out.
    pub fn create_dedicated_envelope(&self, agent: AgentId) -> Letter {
        let mut dedicated = self.clone();
        dedicated
            .extra
            .push(Envelope::overriding_receivers(vec![agent]));
        dedicated
    }

    pub fn add_extra_envelope(&mut self, envelope: Envelope) {
        self.extra.push(envelope);
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    /// Decode the message carried in the payload, using the effective
    /// representation of the flattened envelope.
    pub fn message(&self) -> Result<AclMessage> {
        let representation = self
            .flattened()
            .acl_representation
            .unwrap_or(Representation::Bitefficient);
        super::codec::decode_message(&self.payload, representation)
    }
}
