//! The message transport service: a per-agent router for letters
//!
//! A `MessageTransport` stamps every letter it touches, resolves each
//! intended receiver through the service directory, delivers locally
//! through registered handlers or forwards over one of its active
//! transports, and answers total delivery failure with a FAILURE letter to
//! the original sender.

use crate::acl::{codec, AclMessage, AgentId, Envelope, Letter, Performative, Representation};
use crate::directory::{
    DistributedServiceDirectory, Field, ServiceDirectory, ServiceDirectoryEntry, ServiceLocation,
    ServiceLocator,
};
use crate::error::{Error, Result};
use crate::transport::{
    Address, Configuration, ObserverFuture, Transport, TransportStatus, TransportType,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Signature published by every cooperating message transport service.
pub const MTS_SERVICE_SIGNATURE: &str = "fipa::services::transports::MessageTransport";

/// Signature of a Jade proxy peer; letters to it travel as XML envelopes.
pub const JADE_PROXY_SIGNATURE: &str = "JadeProxyAgent";

/// Ontology marking agent-management traffic, including failure reports.
pub const AGENT_MANAGEMENT_ONTOLOGY: &str = "fipa-agent-management";

/// Language slot of the inner failure description.
pub const INTERNAL_ERROR_LANGUAGE: &str = "internal-error";

/// Local delivery callback: receives the receiver name and the letter,
/// returns whether it accepted the delivery.
pub type MessageTransportHandler = Arc<dyn Fn(&str, &Letter) -> bool + Send + Sync>;

/// The directory a router resolves receivers against.
#[derive(Clone)]
pub enum Directory {
    Local(Arc<ServiceDirectory>),
    Distributed(Arc<DistributedServiceDirectory>),
}

impl Directory {
    pub async fn register(&self, entry: ServiceDirectoryEntry) -> Result<()> {
        match self {
            Directory::Local(directory) => directory.register(entry).await,
            Directory::Distributed(directory) => directory.register(entry).await,
        }
    }

    pub async fn deregister(&self, regex: &str, field: Field) -> Result<()> {
        match self {
            Directory::Local(directory) => directory.deregister(regex, field).await,
            Directory::Distributed(directory) => directory.deregister(regex, field).await,
        }
    }

    pub async fn search(
        &self,
        regex: &str,
        field: Field,
        throw_if_empty: bool,
    ) -> Result<Vec<ServiceDirectoryEntry>> {
        match self {
            Directory::Local(directory) => directory.search(regex, field, throw_if_empty).await,
            Directory::Distributed(directory) => {
                directory.search(regex, field, throw_if_empty).await
            }
        }
    }
}

impl From<Arc<ServiceDirectory>> for Directory {
    fn from(directory: Arc<ServiceDirectory>) -> Self {
        Directory::Local(directory)
    }
}

impl From<Arc<DistributedServiceDirectory>> for Directory {
    fn from(directory: Arc<DistributedServiceDirectory>) -> Self {
        Directory::Distributed(directory)
    }
}

/// Local delivery handlers in insertion order; the order is the priority.
#[derive(Default)]
struct HandlerRegistry {
    handlers: HashMap<String, MessageTransportHandler>,
    priority: Vec<String>,
}

pub struct MessageTransport {
    agent_id: AgentId,
    directory: Directory,
    representation: Representation,
    service_signature: String,
    accepted_signatures: RwLock<HashSet<String>>,
    transports: RwLock<BTreeMap<TransportType, Arc<Transport>>>,
    endpoints: RwLock<Vec<ServiceLocation>>,
    handlers: RwLock<HandlerRegistry>,
    configurations: RwLock<Vec<Configuration>>,
    // Handed to transport observers so received frames find their way back
    // without keeping the router alive
    self_ref: Weak<MessageTransport>,
}

impl MessageTransport {
    pub fn new(agent_id: AgentId, directory: impl Into<Directory>) -> Arc<Self> {
        Self::with_representation(agent_id, directory, Representation::Bitefficient)
    }

    /// Router with a non-default representation for the letters it emits
    /// itself.
    pub fn with_representation(
        agent_id: AgentId,
        directory: impl Into<Directory>,
        representation: Representation,
    ) -> Arc<Self> {
        let service_signature = MTS_SERVICE_SIGNATURE.to_string();
        let mut accepted_signatures = HashSet::new();
        accepted_signatures.insert(service_signature.clone());
        accepted_signatures.insert(JADE_PROXY_SIGNATURE.to_string());
        let directory = directory.into();
        Arc::new_cyclic(|self_ref| Self {
            agent_id,
            directory,
            representation,
            service_signature,
            accepted_signatures: RwLock::new(accepted_signatures),
            transports: RwLock::new(BTreeMap::new()),
            endpoints: RwLock::new(Vec::new()),
            handlers: RwLock::new(HandlerRegistry::default()),
            configurations: RwLock::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn service_signature(&self) -> &str {
        &self.service_signature
    }

    pub fn service_directory(&self) -> Directory {
        self.directory.clone()
    }

    pub async fn transport_endpoints(&self) -> Vec<ServiceLocation> {
        self.endpoints.read().await.clone()
    }

    /// Accept a further signature type during forwarding decisions.
    pub async fn add_accepted_signature(&self, signature: impl Into<String>) {
        self.accepted_signatures
            .write()
            .await
            .insert(signature.into());
    }

    /// Record a transport configuration; it applies when a transport of the
    /// matching type is activated.
    pub async fn add_configuration(&self, configuration: Configuration) -> Result<()> {
        configuration.validate()?;
        self.configurations.write().await.push(configuration);
        Ok(())
    }

    /// Create, configure and start a transport of the given type and hook
    /// it into this router. The transport's addresses extend the endpoint
    /// list under the router's service signature.
    pub async fn activate_transport(&self, transport_type: TransportType) -> Result<()> {
        if self.transports.read().await.contains_key(&transport_type) {
            return Err(Error::AlreadyActive(transport_type.to_string()));
        }

        let transport = Arc::new(Transport::new(transport_type));
        let configuration = {
            let configurations = self.configurations.read().await;
            configurations
                .iter()
                .find(|config| config.transport_type == transport_type.as_str())
                .cloned()
        }
        .unwrap_or_else(|| Configuration::new(transport_type));

        transport.set_ttl(configuration.ttl).await;
        transport
            .start(configuration.listening_port, configuration.maximum_clients)
            .await?;

        let weak = self.self_ref.clone();
        transport
            .register_observer(Arc::new(move |data: Vec<u8>| {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(router) => router.handle_data(data).await,
                        None => Ok(()),
                    }
                }) as ObserverFuture
            }))
            .await;

        let addresses = transport.addresses().await?;
        {
            let mut endpoints = self.endpoints.write().await;
            for address in addresses {
                endpoints.push(ServiceLocation::new(
                    address.to_string(),
                    self.service_signature.clone(),
                ));
            }
        }

        let mut transports = self.transports.write().await;
        if transports.contains_key(&transport_type) {
            return Err(Error::AlreadyActive(transport_type.to_string()));
        }
        info!(
            "'{}' activated {} transport",
            self.agent_id, transport_type
        );
        transports.insert(transport_type, transport);
        Ok(())
    }

    pub async fn activate_transports(&self, transport_types: &[TransportType]) -> Result<()> {
        for transport_type in transport_types {
            self.activate_transport(*transport_type).await?;
        }
        Ok(())
    }

    /// Activate every built-in transport whose flag bit is set.
    pub async fn activate_transports_by_flags(&self, flags: u8) -> Result<()> {
        for transport_type in TransportType::ALL {
            if flags & transport_type.flag() != 0 {
                self.activate_transport(transport_type).await?;
            }
        }
        Ok(())
    }

    pub async fn activate_transports_by_name(&self, names: &[String]) -> Result<()> {
        for name in names {
            let transport_type = TransportType::from_str_name(name)?;
            self.activate_transport(transport_type).await?;
        }
        Ok(())
    }

    pub async fn transport_status(&self, transport_type: TransportType) -> Option<TransportStatus> {
        let transports = self.transports.read().await;
        match transports.get(&transport_type) {
            Some(transport) => Some(transport.status().await),
            None => None,
        }
    }

    async fn active_transports(&self) -> Vec<Arc<Transport>> {
        self.transports.read().await.values().cloned().collect()
    }

    /// Register a local delivery handler. Insertion order defines the
    /// priority during delivery.
    pub async fn register_message_transport(
        &self,
        name: impl Into<String>,
        handler: MessageTransportHandler,
    ) -> Result<()> {
        let name = name.into();
        let mut registry = self.handlers.write().await;
        if registry.handlers.contains_key(&name) {
            return Err(Error::DuplicateEntry(name));
        }
        if !registry.priority.contains(&name) {
            registry.priority.push(name.clone());
        }
        registry.handlers.insert(name, handler);
        Ok(())
    }

    pub async fn deregister_message_transport(&self, name: &str) -> Result<()> {
        let mut registry = self.handlers.write().await;
        if registry.handlers.remove(name).is_none() {
            return Err(Error::NotFound(format!("message transport '{}'", name)));
        }
        registry.priority.retain(|existing| existing != name);
        Ok(())
    }

    pub async fn modify_message_transport(
        &self,
        name: &str,
        handler: MessageTransportHandler,
    ) -> Result<()> {
        let mut registry = self.handlers.write().await;
        if !registry.handlers.contains_key(name) {
            return Err(Error::NotFound(format!("message transport '{}'", name)));
        }
        registry.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    /// Register a client reachable through this router: its directory entry
    /// points at this router's endpoints.
    pub async fn register_client(&self, name: &str, description: &str) -> Result<()> {
        let locations = self.endpoints.read().await.clone();
        if locations.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "cannot register client '{}': no transport endpoints exist yet",
                name
            )));
        }
        let entry = ServiceDirectoryEntry::new(
            name,
            &self.service_signature,
            ServiceLocator::from(locations),
            description,
        );
        self.directory.register(entry).await
    }

    pub async fn deregister_client(&self, name: &str) -> Result<()> {
        self.directory.deregister(name, Field::Name).await
    }

    /// Pump every active transport until no further frame arrives.
    pub async fn trigger(&self) {
        for transport in self.active_transports().await {
            if let Err(err) = transport.update(true).await {
                warn!(
                    "'{}': update of {} transport failed: {}",
                    self.agent_id,
                    transport.transport_type(),
                    err
                );
            }
        }
    }

    /// Entry point for raw frames arriving from a transport.
    async fn handle_data(self: Arc<Self>, data: Vec<u8>) -> Result<()> {
        let letter = codec::decode_letter(&data, Representation::Bitefficient)?;
        debug!("'{}' received a letter", self.agent_id);
        self.handle(letter).await;
        Ok(())
    }

    /// Route one letter: stamp it, detect loops and internal traffic,
    /// forward to every intended receiver, and answer total failure with an
    /// error letter to the original sender.
    pub async fn handle(&self, mut letter: Letter) {
        // An already stamped letter went through this router before
        if letter.has_stamp(&self.agent_id) {
            info!(
                "'{}' received an already stamped letter, dropping it",
                self.agent_id
            );
            return;
        }
        letter.stamp(self.agent_id.clone());

        if self.handle_internal_communication(&letter) {
            return;
        }

        let remaining = self.forward(&letter).await;
        if !remaining.is_empty() {
            self.handle_error(&letter).await;
        }
    }

    /// Letters addressed to this router itself are consumed here.
    fn handle_internal_communication(&self, letter: &Letter) -> bool {
        if !letter.base_envelope().to.contains(&self.agent_id) {
            return false;
        }
        match letter.message() {
            Ok(message) if message.ontology == AGENT_MANAGEMENT_ONTOLOGY => {
                debug!(
                    "'{}' received agent management message: '{}'",
                    self.agent_id, message.content
                );
            }
            Ok(message) => {
                debug!(
                    "'{}' received external message, content ignored: '{}'",
                    self.agent_id, message.content
                );
            }
            Err(err) => {
                warn!(
                    "'{}' could not decode internal message: {}",
                    self.agent_id, err
                );
            }
        }
        true
    }

    /// Try to deliver or forward the letter to every intended receiver.
    /// Returns the receivers that could not be served.
    async fn forward(&self, letter: &Letter) -> Vec<AgentId> {
        let flattened = letter.flattened();
        let receivers = flattened.intended_receivers().to_vec();
        let sender_name = flattened
            .from_agent()
            .map(|agent| agent.name().to_string());
        let mut remaining = receivers.clone();

        for receiver in &receivers {
            let receiver_name = receiver.name();
            debug!(
                "'{}': delivering or forwarding to '{}'",
                self.agent_id, receiver_name
            );
            let dedicated = letter.create_dedicated_envelope(receiver.clone());

            // The $ anchors the name so that prefixes do not match
            let entries = match self
                .directory
                .search(&format!("{}$", receiver_name), Field::Name, false)
                .await
            {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(
                        "'{}': directory lookup for '{}' failed: {}",
                        self.agent_id, receiver_name, err
                    );
                    continue;
                }
            };

            if entries.is_empty() {
                if self.local_forward(receiver_name, letter).await {
                    remove_from_list(receiver, &mut remaining);
                } else {
                    warn!(
                        "'{}': could neither deliver nor forward to '{}', it is globally and locally unknown",
                        self.agent_id, receiver_name
                    );
                    // Any cached connection for this receiver is stale now
                    for transport in self.active_transports().await {
                        transport.cleanup(receiver_name).await;
                    }
                }
                continue;
            }

            if entries.len() > 1 {
                warn!(
                    "'{}': receiver '{}' has multiple directory entries, cannot disambiguate",
                    self.agent_id, receiver_name
                );
            }

            'entries: for entry in &entries {
                // Suppress broadcast back to the sender
                if Some(entry.name()) == sender_name.as_deref() {
                    debug!(
                        "'{}': skipping '{}', it is the envelope sender",
                        self.agent_id,
                        entry.name()
                    );
                    continue;
                }
                for location in entry.locator().locations() {
                    match self.forward_to(entry.name(), location, &dedicated).await {
                        Ok(()) => {
                            remove_from_list(receiver, &mut remaining);
                            break 'entries;
                        }
                        Err(err) => {
                            warn!(
                                "'{}': could not send letter to '{}' via {}: {}",
                                self.agent_id,
                                entry.name(),
                                location,
                                err
                            );
                        }
                    }
                }
            }
        }

        remaining
    }

    /// Deliver one dedicated letter to one service location.
    async fn forward_to(
        &self,
        name: &str,
        location: &ServiceLocation,
        letter: &Letter,
    ) -> Result<()> {
        let address = Address::from_string(location.service_address()).map_err(|err| {
            Error::Transport(format!(
                "address '{}' for receiver '{}': {}",
                location.service_address(),
                name,
                err
            ))
        })?;

        if self.is_local(location).await {
            if self.local_forward(name, letter).await {
                return Ok(());
            }
            return Err(Error::Transport(format!(
                "local delivery to '{}' failed",
                name
            )));
        }

        let transport_type = TransportType::from_str_name(&address.protocol)
            .map_err(|_| Error::ProtocolNotActive(address.protocol.clone()))?;
        let transport = self
            .transports
            .read()
            .await
            .get(&transport_type)
            .cloned()
            .ok_or_else(|| Error::ProtocolNotActive(address.protocol.clone()))?;

        {
            let accepted = self.accepted_signatures.read().await;
            if !accepted.contains(location.signature_type()) {
                return Err(Error::SignatureRejected {
                    receiver: name.to_string(),
                    signature_type: location.signature_type().to_string(),
                });
            }
        }

        let data = self.serialize_for_peer(location, letter).await?;
        transport.send(name, &address, &data).await
    }

    /// Wire form of the letter for the peer behind `location`. A Jade proxy
    /// receives an XML envelope whose payload is the string-form message;
    /// everyone else receives the compact form.
    async fn serialize_for_peer(
        &self,
        location: &ServiceLocation,
        letter: &Letter,
    ) -> Result<Vec<u8>> {
        if location.signature_type() != JADE_PROXY_SIGNATURE {
            return codec::encode_letter(letter, self.representation);
        }

        let message = letter.message()?;
        let content = codec::message_to_string(&message);

        let mut sender = message.sender.clone();
        for endpoint in self.endpoints.read().await.iter() {
            sender.add_address(endpoint.service_address().to_string());
        }

        let mut jade_letter = letter.clone();
        jade_letter.add_extra_envelope(Envelope {
            from: Some(sender),
            acl_representation: Some(Representation::StringRep),
            payload_length: Some(content.len()),
            ..Envelope::default()
        });
        jade_letter.set_payload(content.into_bytes());
        codec::encode_letter(&jade_letter, Representation::Xml)
    }

    async fn is_local(&self, location: &ServiceLocation) -> bool {
        self.endpoints.read().await.contains(location)
    }

    /// Walk the local handlers in priority order until one accepts the
    /// letter. The handlers run without any router lock held.
    async fn local_forward(&self, receiver_name: &str, letter: &Letter) -> bool {
        let handlers: Vec<MessageTransportHandler> = {
            let registry = self.handlers.read().await;
            registry
                .priority
                .iter()
                .filter_map(|name| registry.handlers.get(name).cloned())
                .collect()
        };
        for handler in handlers {
            if handler(receiver_name, letter) {
                debug!("delivered letter to '{}' locally", receiver_name);
                return true;
            }
        }
        false
    }

    /// Report delivery failure back to the original sender. The failure
    /// letter is forwarded once; its own failure is only logged.
    async fn handle_error(&self, letter: &Letter) {
        let flattened = letter.flattened();
        let mut inner = AclMessage::new(Performative::Inform);
        inner.sender = flattened.from_agent().cloned().unwrap_or_default();
        inner.receivers = flattened.intended_receivers().to_vec();
        inner.language = INTERNAL_ERROR_LANGUAGE.to_string();
        inner.content = format!(
            "description: message delivery failed\ndelivery path: {}",
            letter.delivery_path_string()
        );
        let description = codec::message_to_string(&inner);

        let original = match letter.message() {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    "'{}': cannot build failure report, original message unreadable: {}",
                    self.agent_id, err
                );
                return;
            }
        };
        let error_message = self.create_internal_error_message(&original, description);
        let conversation_id = error_message.conversation_id.clone();

        let mut error_letter = match Letter::new(error_message, self.representation) {
            Ok(letter) => letter,
            Err(err) => {
                warn!("'{}': cannot encode failure report: {}", self.agent_id, err);
                return;
            }
        };
        error_letter.stamp(self.agent_id.clone());

        let remaining = self.forward(&error_letter).await;
        for receiver in remaining {
            warn!(
                "'{}': forwarding of error to '{}' failed, conversation id: {}",
                self.agent_id,
                receiver.name(),
                conversation_id
            );
        }
    }

    /// FAILURE response towards the sender of a message that could not be
    /// delivered.
    fn create_internal_error_message(
        &self,
        message: &AclMessage,
        description: String,
    ) -> AclMessage {
        let mut error = AclMessage::new(Performative::Failure);
        error.add_receiver(message.sender.clone());
        error.sender = self.agent_id.clone();
        error.conversation_id = message.conversation_id.clone();
        error.in_reply_to = message.reply_with.clone();
        error.protocol = message.protocol.clone();
        error.ontology = AGENT_MANAGEMENT_ONTOLOGY.to_string();
        error.content = description;
        error
    }

    /// Rebuild the endpoint list from one named interface.
    pub async fn set_transport_endpoints(&self, interface: &str) -> Result<()> {
        let mut locations = Vec::new();
        for transport in self.active_transports().await {
            let address = transport.address(interface).await?;
            locations.push(ServiceLocation::new(
                address.to_string(),
                self.service_signature.clone(),
            ));
        }
        *self.endpoints.write().await = locations;
        Ok(())
    }
}

fn remove_from_list(agent: &AgentId, agents: &mut Vec<AgentId>) {
    if let Some(position) = agents.iter().position(|existing| existing == agent) {
        agents.remove(position);
    }
}
