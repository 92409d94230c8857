//! End-to-end routing: local delivery across two routers, failure
//! reporting, loop prevention and the foreign-proxy wire format.

use fipa_services::acl::{codec, AclMessage, AgentId, Letter, Performative, Representation};
use fipa_services::directory::{
    ServiceDirectory, ServiceDirectoryEntry, ServiceLocation, ServiceLocator,
};
use fipa_services::{
    MessageTransport, TransportType, AGENT_MANAGEMENT_ONTOLOGY, JADE_PROXY_SIGNATURE,
    MTS_SERVICE_SIGNATURE,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

type Deliveries = Arc<Mutex<Vec<(String, Letter)>>>;

fn letter(sender: &str, receiver: &str, content: &str) -> Letter {
    let mut message = AclMessage::new(Performative::Inform);
    message.sender = AgentId::new(sender);
    message.add_receiver(AgentId::new(receiver));
    message.content = content.to_string();
    message.conversation_id = format!("conv-{}-{}", sender, receiver);
    Letter::new(message, Representation::Bitefficient).unwrap()
}

/// Register a collecting local handler that accepts (or refuses) every
/// delivery.
async fn register_collector(router: &MessageTransport, accept: bool) -> Deliveries {
    let deliveries: Deliveries = Arc::new(Mutex::new(Vec::new()));
    let sink = deliveries.clone();
    router
        .register_message_transport(
            "collector",
            Arc::new(move |receiver: &str, letter: &Letter| {
                sink.lock()
                    .unwrap()
                    .push((receiver.to_string(), letter.clone()));
                accept
            }),
        )
        .await
        .unwrap();
    deliveries
}

async fn pump_until<F: Fn() -> bool>(routers: &[&MessageTransport], done: F) -> bool {
    for _ in 0..200 {
        for router in routers {
            router.trigger().await;
        }
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

async fn pair_of_routers(
    transport_type: TransportType,
) -> (Arc<MessageTransport>, Arc<MessageTransport>) {
    let directory = Arc::new(ServiceDirectory::new());
    let m0 = MessageTransport::new(AgentId::new("mts-0"), directory.clone());
    let m1 = MessageTransport::new(AgentId::new("mts-1"), directory);
    m0.activate_transport(transport_type).await.unwrap();
    m1.activate_transport(transport_type).await.unwrap();
    m0.register_client("c0", "client of mts-0").await.unwrap();
    m1.register_client("c1", "client of mts-1").await.unwrap();
    (m0, m1)
}

#[tokio::test]
async fn single_hop_delivery_over_udt() {
    let (m0, m1) = pair_of_routers(TransportType::Udt).await;
    let deliveries = register_collector(&m1, true).await;

    m0.handle(letter("c0", "c1", "hello")).await;

    assert!(
        pump_until(&[m0.as_ref(), m1.as_ref()], || !deliveries.lock().unwrap().is_empty()).await,
        "letter never reached the remote handler"
    );
    let (receiver, delivered) = deliveries.lock().unwrap()[0].clone();
    assert_eq!(receiver, "c1");
    let message = delivered.message().unwrap();
    assert_eq!(message.content, "hello");
    // The letter crossed both routers
    assert!(delivered.has_stamp(&AgentId::new("mts-0")));
    assert!(delivered.has_stamp(&AgentId::new("mts-1")));
}

#[tokio::test]
async fn single_hop_delivery_over_tcp() {
    let (m0, m1) = pair_of_routers(TransportType::Tcp).await;
    let deliveries = register_collector(&m1, true).await;

    m0.handle(letter("c0", "c1", "hello over tcp")).await;

    assert!(
        pump_until(&[m0.as_ref(), m1.as_ref()], || !deliveries.lock().unwrap().is_empty()).await,
        "letter never reached the remote handler"
    );
    let (receiver, delivered) = deliveries.lock().unwrap()[0].clone();
    assert_eq!(receiver, "c1");
    assert_eq!(delivered.message().unwrap().content, "hello over tcp");
}

#[tokio::test]
async fn failed_delivery_reports_back_to_the_sender() {
    let (m0, m1) = pair_of_routers(TransportType::Udt).await;
    // m1 refuses every delivery, m0 collects what comes back
    let refused = register_collector(&m1, false).await;
    let reports = register_collector(&m0, true).await;

    m0.handle(letter("c0", "c1", "will not arrive")).await;

    assert!(
        pump_until(&[m0.as_ref(), m1.as_ref()], || !reports.lock().unwrap().is_empty()).await,
        "failure report never reached the sender"
    );
    assert!(!refused.lock().unwrap().is_empty());

    let (receiver, report) = reports.lock().unwrap()[0].clone();
    assert_eq!(receiver, "c0");
    let message = report.message().unwrap();
    assert_eq!(message.performative, Performative::Failure);
    assert_eq!(message.ontology, AGENT_MANAGEMENT_ONTOLOGY);
    assert_eq!(message.receivers, vec![AgentId::new("c0")]);
    assert_eq!(message.sender, AgentId::new("mts-1"));
    assert_eq!(message.conversation_id, "conv-c0-c1");
    assert!(message.content.contains("description: message delivery failed"));
    assert!(message.content.contains("delivery path"));
}

#[tokio::test]
async fn partial_failure_reports_all_original_receivers() {
    let directory = Arc::new(ServiceDirectory::new());
    let router = MessageTransport::new(AgentId::new("mts-partial"), directory.clone());
    router.activate_transport(TransportType::Tcp).await.unwrap();
    router.register_client("good", "deliverable client").await.unwrap();
    let deliveries = register_collector(&router, true).await;

    // "bad" lives behind an address nothing listens on
    directory
        .register(ServiceDirectoryEntry::new(
            "bad",
            MTS_SERVICE_SIGNATURE,
            ServiceLocator::from(vec![ServiceLocation::new(
                "tcp://127.0.0.1:1",
                MTS_SERVICE_SIGNATURE,
            )]),
            "unreachable peer",
        ))
        .await
        .unwrap();

    let mut message = AclMessage::new(Performative::Inform);
    message.sender = AgentId::new("c0");
    message.add_receiver(AgentId::new("good"));
    message.add_receiver(AgentId::new("bad"));
    message.content = "partial".to_string();
    let outgoing = Letter::new(message, Representation::Bitefficient).unwrap();

    router.handle(outgoing).await;

    // "good" got the original letter, the sender got the failure report
    let delivered = deliveries.lock().unwrap().clone();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].0, "good");
    assert_eq!(delivered[0].1.message().unwrap().content, "partial");

    assert_eq!(delivered[1].0, "c0");
    let report = delivered[1].1.message().unwrap();
    assert_eq!(report.performative, Performative::Failure);
    // The inner description lists the complete intended-receiver set of
    // the failed letter, not only the receiver that failed
    assert!(report.content.contains(
        ":receiver (set (agent-identifier :name good) (agent-identifier :name bad))"
    ));
    assert!(report.content.contains("description: message delivery failed"));
}

#[tokio::test]
async fn stamped_letters_are_dropped_silently() {
    let directory = Arc::new(ServiceDirectory::new());
    let router = MessageTransport::new(AgentId::new("mts-loop"), directory);
    router.activate_transport(TransportType::Udt).await.unwrap();
    router.register_client("client", "local client").await.unwrap();
    let deliveries = register_collector(&router, true).await;

    let mut stamped = letter("origin", "client", "looped");
    stamped.stamp(AgentId::new("mts-loop"));
    router.handle(stamped).await;

    // Nothing is forwarded and no error letter is synthesized
    for _ in 0..10 {
        router.trigger().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(deliveries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn broadcast_to_self_is_suppressed() {
    let directory = Arc::new(ServiceDirectory::new());
    let router = MessageTransport::new(AgentId::new("mts-solo"), directory);
    router.activate_transport(TransportType::Udt).await.unwrap();
    router.register_client("echo", "talks to itself").await.unwrap();
    let deliveries = register_collector(&router, true).await;

    // The only receiver equals the sender, so the entry is skipped and the
    // delivery fails; the failure report is the only letter the local
    // handler ever sees
    router.handle(letter("echo", "echo", "hello myself")).await;

    assert!(
        pump_until(&[router.as_ref()], || !deliveries.lock().unwrap().is_empty()).await,
        "failure report never delivered"
    );
    let delivered = deliveries.lock().unwrap().clone();
    for (_, report) in &delivered {
        let message = report.message().unwrap();
        assert_eq!(message.performative, Performative::Failure);
        assert_ne!(message.content, "hello myself");
    }
}

#[tokio::test]
async fn letters_to_the_router_itself_are_internal() {
    let directory = Arc::new(ServiceDirectory::new());
    let router = MessageTransport::new(AgentId::new("mts-self"), directory);
    router.activate_transport(TransportType::Udt).await.unwrap();
    router.register_client("client", "local client").await.unwrap();
    let deliveries = register_collector(&router, true).await;

    let mut message = AclMessage::new(Performative::Inform);
    message.sender = AgentId::new("client");
    message.add_receiver(AgentId::new("mts-self"));
    message.ontology = AGENT_MANAGEMENT_ONTOLOGY.to_string();
    message.content = "ping".to_string();
    let internal = Letter::new(message, Representation::Bitefficient).unwrap();

    router.handle(internal).await;

    // Consumed by the router, never handed to local handlers
    for _ in 0..10 {
        router.trigger().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(deliveries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn jade_peers_receive_xml_envelopes() {
    // A raw listener plays the Jade proxy
    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = proxy.local_addr().unwrap().port();

    let directory = Arc::new(ServiceDirectory::new());
    let router = MessageTransport::new(AgentId::new("mts-jade"), directory.clone());
    router.activate_transport(TransportType::Tcp).await.unwrap();

    directory
        .register(ServiceDirectoryEntry::new(
            "jade-agent",
            JADE_PROXY_SIGNATURE,
            ServiceLocator::from(vec![ServiceLocation::new(
                format!("tcp://127.0.0.1:{}", proxy_port),
                JADE_PROXY_SIGNATURE,
            )]),
            "foreign proxy peer",
        ))
        .await
        .unwrap();

    let outgoing = letter("c0", "jade-agent", "hello jade");
    let expected_payload = codec::message_to_string(&outgoing.message().unwrap());
    router.handle(outgoing).await;

    // One letter per connection: read to EOF
    let (mut stream, _) = proxy.accept().await.unwrap();
    let mut wire = Vec::new();
    stream.read_to_end(&mut wire).await.unwrap();

    let text = String::from_utf8(wire.clone()).unwrap();
    assert!(text.starts_with("<?xml"));

    let parsed = codec::decode_letter(&wire, Representation::Xml).unwrap();
    let extra = parsed.extra_envelopes().last().unwrap();
    assert_eq!(extra.acl_representation, Some(Representation::StringRep));
    assert_eq!(extra.payload_length, Some(expected_payload.len()));
    assert_eq!(parsed.payload(), expected_payload.as_bytes());
    // The proxy-facing envelope carries this router's endpoints as sender
    // addresses
    let sender = extra.from.clone().unwrap();
    assert_eq!(sender.name(), "c0");
    let endpoints = router.transport_endpoints().await;
    assert_eq!(sender.addresses.len(), endpoints.len());

    // The dedicated envelope narrows delivery to the proxy agent
    let receivers = parsed.flattened().intended_receivers().to_vec();
    assert_eq!(receivers, vec![AgentId::new("jade-agent")]);
}

#[tokio::test]
async fn unknown_signatures_are_rejected() {
    let directory = Arc::new(ServiceDirectory::new());
    let router = MessageTransport::new(AgentId::new("mts-guard"), directory.clone());
    router.activate_transport(TransportType::Tcp).await.unwrap();
    let reports = register_collector(&router, true).await;

    // The listener never sees a connection: the signature check fires first
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    directory
        .register(ServiceDirectoryEntry::new(
            "stranger",
            "UnknownSignature",
            ServiceLocator::from(vec![ServiceLocation::new(
                format!("tcp://127.0.0.1:{}", port),
                "UnknownSignature",
            )]),
            "peer with unknown signature",
        ))
        .await
        .unwrap();

    router.handle(letter("c0", "stranger", "should be rejected")).await;

    // The rejected peer is never contacted
    let mut accepted = false;
    tokio::select! {
        _ = listener.accept() => { accepted = true; }
        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
    }
    assert!(!accepted, "rejected peer was contacted anyway");

    // The failure report finds no directory entry for c0 and falls back to
    // local delivery
    let delivered = reports.lock().unwrap().clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, "c0");
    let message = delivered[0].1.message().unwrap();
    assert_eq!(message.performative, Performative::Failure);
    assert!(message.content.contains("description: message delivery failed"));
}

#[tokio::test]
async fn double_activation_fails() {
    let directory = Arc::new(ServiceDirectory::new());
    let router = MessageTransport::new(AgentId::new("mts-twice"), directory);
    router.activate_transport(TransportType::Udt).await.unwrap();
    assert!(matches!(
        router.activate_transport(TransportType::Udt).await,
        Err(fipa_services::Error::AlreadyActive(_))
    ));
    // The other transport type is still available
    router.activate_transport(TransportType::Tcp).await.unwrap();
}
