//! Wire transports
//!
//! A `Transport` owns a non-blocking listener, the connections accepted
//! from it and a cache of outgoing connections keyed by receiver name. The
//! host drives it with `update`, which accepts and reads without blocking
//! and hands every completed frame to the registered observers.

pub mod tcp;
pub mod udt;

pub use udt::{MAX_MESSAGE_SIZE_BYTES, RECEIVE_BUFFER_SIZE_BYTES};

use crate::error::{Error, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

lazy_static! {
    static ref ADDRESS_PATTERN: Regex = Regex::new(r"^([^:]+)://([^:]+):([0-9]{1,5})$").unwrap();
}

/// Communication endpoint: protocol, host and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub protocol: String,
    pub ip: String,
    pub port: u16,
}

impl Address {
    pub fn new(ip: impl Into<String>, port: u16, protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            ip: ip.into(),
            port,
        }
    }

    /// Parse the canonical `<proto>://<ip>:<port>` form.
    pub fn from_string(address: &str) -> Result<Self> {
        let captures = ADDRESS_PATTERN.captures(address).ok_or_else(|| {
            Error::InvalidArgument(format!("address '{}' malformatted", address))
        })?;
        let port: u32 = captures[3]
            .parse()
            .map_err(|err| Error::InvalidArgument(format!("address '{}': {}", address, err)))?;
        if port > u16::MAX as u32 {
            return Err(Error::InvalidArgument(format!(
                "address '{}': port {} out of range",
                address, port
            )));
        }
        Ok(Self {
            protocol: captures[1].to_string(),
            ip: captures[2].to_string(),
            port: port as u16,
        })
    }

    /// Total order over (ip, port, protocol), usable as a map key. Note
    /// that equality deliberately ignores the protocol, so two addresses
    /// may be equal yet order apart.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        (&self.ip, self.port, &self.protocol).cmp(&(&other.ip, other.port, &other.protocol))
    }
}

impl PartialEq for Address {
    /// Endpoint equality: two different protocols on the same ip and port
    /// collide.
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for Address {}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.ip, self.port)
    }
}

/// Supported transport kinds. The set is open; these are the built-ins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportType {
    Udt,
    Tcp,
}

impl TransportType {
    pub const ALL: [TransportType; 2] = [TransportType::Udt, TransportType::Tcp];

    /// Flag bits for the mask-based activation call.
    pub const UDT_FLAG: u8 = 0b01;
    pub const TCP_FLAG: u8 = 0b10;
    pub const ALL_FLAGS: u8 = 0b11;

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Udt => "udt",
            TransportType::Tcp => "tcp",
        }
    }

    pub const fn flag(self) -> u8 {
        match self {
            TransportType::Udt => TransportType::UDT_FLAG,
            TransportType::Tcp => TransportType::TCP_FLAG,
        }
    }

    pub fn from_str_name(name: &str) -> Result<Self> {
        match name {
            "udt" => Ok(TransportType::Udt),
            "tcp" => Ok(TransportType::Tcp),
            other => Err(Error::InvalidArgument(format!(
                "unknown transport type '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-transport settings supplied by the embedding application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub transport_type: String,
    /// 0 lets the OS choose
    pub listening_port: u16,
    pub maximum_clients: u32,
    /// Send deadline in milliseconds; negative means unlimited
    pub ttl: i64,
}

impl Configuration {
    pub fn new(transport_type: TransportType) -> Self {
        Self {
            transport_type: transport_type.as_str().to_string(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        TransportType::from_str_name(&self.transport_type)?;
        Ok(())
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            transport_type: String::new(),
            listening_port: 0,
            maximum_clients: 50,
            ttl: -1,
        }
    }
}

/// Lifecycle of a transport inside the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Uninitialized,
    Listening,
    Error,
}

/// Future returned by an observer invocation.
pub type ObserverFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Callback receiving every completed incoming frame. Observers run on the
/// task driving `update`, after the transport released its internal lock,
/// so an observer may send through this or any other transport; it should
/// not block indefinitely, since that stalls the whole pump.
pub type Observer = Arc<dyn Fn(Vec<u8>) -> ObserverFuture + Send + Sync>;

enum Listener {
    Tcp(tcp::TcpListenerState),
    Udt(udt::UdtListenerState),
}

impl Listener {
    fn port(&self) -> Result<u16> {
        match self {
            Listener::Tcp(listener) => listener.port(),
            Listener::Udt(listener) => listener.port(),
        }
    }
}

enum Incoming {
    Tcp(tcp::TcpIncoming),
    Udt(udt::UdtIncoming),
}

enum OutgoingConnection {
    Tcp(tcp::TcpOutgoing),
    Udt(udt::UdtOutgoing),
}

impl OutgoingConnection {
    async fn send(&mut self, data: &[u8], ttl: i64) -> Result<()> {
        match self {
            OutgoingConnection::Tcp(connection) => connection.send(data).await,
            OutgoingConnection::Udt(connection) => connection.send(data, ttl, true).await,
        }
    }
}

/// One cached outgoing connection together with the address it was
/// established for.
struct CachedConnection {
    address: Address,
    connection: OutgoingConnection,
}

struct State {
    status: TransportStatus,
    listener: Option<Listener>,
    incoming: Vec<Incoming>,
    outgoing: HashMap<String, CachedConnection>,
    ttl: i64,
}

impl State {
    async fn accept_pending(&mut self) {
        match &mut self.listener {
            Some(Listener::Tcp(listener)) => {
                for connection in listener.accept_pending().await {
                    self.incoming.push(Incoming::Tcp(connection));
                }
            }
            Some(Listener::Udt(listener)) => {
                for connection in listener.accept_pending().await {
                    self.incoming.push(Incoming::Udt(connection));
                }
            }
            None => {}
        }
    }

    /// One read pass over all incoming connections. Completed frames are
    /// appended to `frames`; dead connections are dropped.
    async fn read_pass(&mut self, frames: &mut Vec<Vec<u8>>) -> usize {
        let mut found = 0;
        let mut index = 0;
        while index < self.incoming.len() {
            let (mut new_frames, keep) = match &mut self.incoming[index] {
                Incoming::Tcp(connection) => connection.read_available().await,
                Incoming::Udt(connection) => connection.read_available().await,
            };
            found += new_frames.len();
            frames.append(&mut new_frames);
            if keep {
                index += 1;
            } else {
                self.incoming.remove(index);
            }
        }
        found
    }
}

async fn establish(
    transport_type: TransportType,
    address: &Address,
) -> Result<OutgoingConnection> {
    match transport_type {
        TransportType::Tcp => Ok(OutgoingConnection::Tcp(
            tcp::TcpOutgoing::connect(&address.ip, address.port).await?,
        )),
        TransportType::Udt => Ok(OutgoingConnection::Udt(
            udt::UdtOutgoing::connect(&address.ip, address.port).await?,
        )),
    }
}

/// A wire transport with its listener, incoming connections, outgoing
/// connection cache and observers.
pub struct Transport {
    transport_type: TransportType,
    state: Mutex<State>,
    observers: Mutex<Vec<Observer>>,
    _runtime: Option<udt::RuntimeGuard>,
}

impl Transport {
    pub fn new(transport_type: TransportType) -> Self {
        let runtime = match transport_type {
            TransportType::Udt => Some(udt::RuntimeGuard::acquire()),
            TransportType::Tcp => None,
        };
        Self {
            transport_type,
            state: Mutex::new(State {
                status: TransportStatus::Uninitialized,
                listener: None,
                incoming: Vec::new(),
                outgoing: HashMap::new(),
                ttl: -1,
            }),
            observers: Mutex::new(Vec::new()),
            _runtime: runtime,
        }
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    pub async fn status(&self) -> TransportStatus {
        self.state.lock().await.status
    }

    /// Open the listener. Port 0 lets the OS choose.
    pub async fn start(&self, port: u16, max_clients: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.listener.is_some() {
            return Err(Error::AlreadyActive(self.transport_type.to_string()));
        }
        let listener = match self.transport_type {
            TransportType::Tcp => tcp::TcpListenerState::bind(port, max_clients)
                .await
                .map(Listener::Tcp),
            TransportType::Udt => udt::UdtListenerState::bind(port, max_clients)
                .await
                .map(Listener::Udt),
        };
        match listener {
            Ok(listener) => {
                info!(
                    "{} transport listening on port {}",
                    self.transport_type,
                    listener.port().unwrap_or(0)
                );
                state.listener = Some(listener);
                state.status = TransportStatus::Listening;
                Ok(())
            }
            Err(err) => {
                state.status = TransportStatus::Error;
                Err(err)
            }
        }
    }

    /// Send deadline applied to every outgoing message, in milliseconds.
    pub async fn set_ttl(&self, ttl: i64) {
        self.state.lock().await.ttl = ttl;
    }

    /// One pump step: accept pending connections, then read every incoming
    /// connection. With `read_all` the step repeats until an entire pass
    /// completes no frame. Observers are notified in registration order
    /// once the internal lock is released.
    pub async fn update(&self, read_all: bool) -> Result<()> {
        let mut frames: Vec<Vec<u8>> = Vec::new();
        {
            let mut state = self.state.lock().await;
            loop {
                state.accept_pending().await;
                let found = state.read_pass(&mut frames).await;
                if found == 0 || !read_all {
                    break;
                }
            }
        }
        if frames.is_empty() {
            return Ok(());
        }
        let observers = self.observers.lock().await.clone();
        for frame in frames {
            for observer in &observers {
                if let Err(err) = observer(frame.clone()).await {
                    warn!("{} transport observer failed: {}", self.transport_type, err);
                }
            }
        }
        Ok(())
    }

    /// Send `data` to the receiver at `address`, reusing the cached
    /// connection when its address still matches. One failed write evicts
    /// the cache entry and retries with a fresh connection; a second
    /// failure is reported.
    pub async fn send(&self, receiver: &str, address: &Address, data: &[u8]) -> Result<()> {
        if self.transport_type == TransportType::Udt && data.len() > udt::MAX_MESSAGE_SIZE_BYTES {
            return Err(Error::TooLarge {
                size: data.len(),
                limit: udt::MAX_MESSAGE_SIZE_BYTES,
            });
        }
        let mut state = self.state.lock().await;
        let ttl = state.ttl;
        let mut last_error: Option<Error> = None;
        for _attempt in 0..2 {
            let stale = state
                .outgoing
                .get(receiver)
                .map_or(false, |cached| cached.address != *address);
            if stale {
                debug!("evicting stale connection for '{}'", receiver);
                state.outgoing.remove(receiver);
            }
            if !state.outgoing.contains_key(receiver) {
                match establish(self.transport_type, address).await {
                    Ok(connection) => {
                        state.outgoing.insert(
                            receiver.to_string(),
                            CachedConnection {
                                address: address.clone(),
                                connection,
                            },
                        );
                    }
                    Err(err) => {
                        debug!("connecting to {} failed: {}", address, err);
                        last_error = Some(err);
                        continue;
                    }
                }
            }
            if let Some(cached) = state.outgoing.get_mut(receiver) {
                match cached.connection.send(data, ttl).await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        debug!("sending to '{}' at {} failed: {}", receiver, address, err);
                        state.outgoing.remove(receiver);
                        last_error = Some(err);
                    }
                }
            }
        }
        let cause = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "unknown cause".to_string());
        Err(Error::Transport(format!(
            "sending to '{}' at {} failed: {}",
            receiver, address, cause
        )))
    }

    /// Drop any cached outgoing connection for the receiver.
    pub async fn cleanup(&self, receiver: &str) {
        let mut state = self.state.lock().await;
        if state.outgoing.remove(receiver).is_some() {
            debug!("dropped cached connection for '{}'", receiver);
        }
    }

    pub async fn register_observer(&self, observer: Observer) {
        self.observers.lock().await.push(observer);
    }

    /// Listening port, once started.
    pub async fn port(&self) -> Result<u16> {
        let state = self.state.lock().await;
        match &state.listener {
            Some(listener) => listener.port(),
            None => Err(Error::Transport(format!(
                "{} transport is not listening",
                self.transport_type
            ))),
        }
    }

    /// This transport's address on every interface carrying a non-loopback
    /// IPv4 address. Hosts with no such interface fall back to loopback so
    /// that a single-host setup still has an endpoint.
    pub async fn addresses(&self) -> Result<Vec<Address>> {
        let port = self.port().await?;
        let interfaces = local_ip_address::list_afinet_netifas()
            .map_err(|err| Error::Transport(format!("interface enumeration failed: {}", err)))?;
        let mut addresses = Vec::new();
        let mut loopback = None;
        for (_name, ip) in interfaces {
            if let IpAddr::V4(ip) = ip {
                if ip.is_loopback() {
                    loopback.get_or_insert(ip);
                } else {
                    addresses.push(Address::new(
                        ip.to_string(),
                        port,
                        self.transport_type.as_str(),
                    ));
                }
            }
        }
        if addresses.is_empty() {
            if let Some(ip) = loopback {
                addresses.push(Address::new(
                    ip.to_string(),
                    port,
                    self.transport_type.as_str(),
                ));
            }
        }
        Ok(addresses)
    }

    /// This transport's address on one named interface.
    pub async fn address(&self, interface: &str) -> Result<Address> {
        let port = self.port().await?;
        let interfaces = local_ip_address::list_afinet_netifas()
            .map_err(|err| Error::Transport(format!("interface enumeration failed: {}", err)))?;
        for (name, ip) in interfaces {
            if name == interface {
                if let IpAddr::V4(ip) = ip {
                    return Ok(Address::new(
                        ip.to_string(),
                        port,
                        self.transport_type.as_str(),
                    ));
                }
            }
        }
        Err(Error::NotFound(format!(
            "no IPv4 address on interface '{}'",
            interface
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trip() {
        let address = Address::from_string("udt://10.0.0.1:9000").unwrap();
        assert_eq!(address.protocol, "udt");
        assert_eq!(address.ip, "10.0.0.1");
        assert_eq!(address.port, 9000);
        assert_eq!(
            Address::from_string(&address.to_string()).unwrap(),
            address
        );
    }

    #[test]
    fn address_rejects_malformed_input() {
        assert!(matches!(
            Address::from_string("udt://10.0.0.1:999999"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Address::from_string("udt://10.0.0.1:70000"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Address::from_string("udt://10.0.0.1"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Address::from_string("10.0.0.1:9000"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn address_equality_ignores_protocol() {
        let udt = Address::new("10.0.0.1", 9000, "udt");
        let tcp = Address::new("10.0.0.1", 9000, "tcp");
        assert_eq!(udt, tcp);
        assert_ne!(udt.total_cmp(&tcp), Ordering::Equal);
        assert_ne!(udt, Address::new("10.0.0.1", 9001, "udt"));
    }

    #[test]
    fn transport_type_names_and_flags() {
        assert_eq!(TransportType::from_str_name("udt").unwrap(), TransportType::Udt);
        assert_eq!(TransportType::from_str_name("tcp").unwrap(), TransportType::Tcp);
        assert!(TransportType::from_str_name("sctp").is_err());
        assert_eq!(
            TransportType::UDT_FLAG | TransportType::TCP_FLAG,
            TransportType::ALL_FLAGS
        );
    }

    #[test]
    fn configuration_defaults() {
        let config = Configuration::new(TransportType::Tcp);
        assert_eq!(config.transport_type, "tcp");
        assert_eq!(config.listening_port, 0);
        assert_eq!(config.maximum_clients, 50);
        assert_eq!(config.ttl, -1);
        config.validate().unwrap();

        let broken = Configuration {
            transport_type: "carrier-pigeon".to_string(),
            ..Configuration::default()
        };
        assert!(broken.validate().is_err());
    }
}
