//! End-to-end test over real UDP sockets: bind a listener, run a policy,
//! exchange packets with a client socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use radius::types::{CodeSet, NullVerifier, PacketCode};
use radius::unlang::{
    parse_sections, CompileCtx, Dictionary, PolicyCatalog, ReturnCode, SectionKind, VirtualServer,
};
use radius::{
    HeaderOnlyCodec, ListenerConfig, MapRegistry, ModuleRegistry, Server, StaticClient,
    StaticModule, WorkerContext,
};

fn listener_config() -> ListenerConfig {
    ListenerConfig {
        ipaddr: Some("127.0.0.1".parse().unwrap()),
        ipv4addr: None,
        ipv6addr: None,
        interface: None,
        port: Some(0),
        port_name: None,
        recv_buff: None,
        cleanup_delay: 5,
        connected: false,
        max_connections: None,
        dynamic_clients: None,
        priority: HashMap::new(),
    }
}

fn policy() -> Arc<VirtualServer> {
    let mut modules = ModuleRegistry::new();
    modules.register(StaticModule::new("accept_all", ReturnCode::Ok));

    let maps = MapRegistry::new();
    let policies = PolicyCatalog::new();
    let dict = Dictionary::core();
    let ctx = CompileCtx {
        modules: &modules,
        maps: &maps,
        policies: &policies,
        dict: &dict,
    };

    let src = r#"
authorize {
  accept_all
}
authenticate {
  accept_all
}
"#;

    let mut server = VirtualServer::new("default");
    for section in parse_sections(src).unwrap() {
        let kind = SectionKind::from_name(&section.name1).unwrap();
        let tree = ctx.compile(&section, kind).unwrap();
        server.add_section(kind, None, tree);
    }
    Arc::new(server)
}

fn access_request(id: u8, authenticator: u8) -> Vec<u8> {
    let mut buf = vec![1, id, 0, 20];
    buf.extend_from_slice(&[authenticator; 16]);
    buf
}

#[tokio::test]
async fn access_request_round_trip_with_duplicates() {
    let worker_ctx = Arc::new(WorkerContext {
        server: policy(),
        dynamic_server: None,
        codec: Arc::new(HeaderOnlyCodec),
        dict: Arc::new(Dictionary::core()),
        max_request_time: Duration::from_secs(5),
    });

    let statics = vec![StaticClient {
        network: "127.0.0.1/32".parse().unwrap(),
        secret: "abc".into(),
        shortname: "local".into(),
        require_message_authenticator: false,
        use_connected: false,
    }];

    let server = Server::bind(
        &listener_config(),
        statics,
        CodeSet::new([PacketCode::AccessRequest]),
        Arc::new(NullVerifier),
        worker_ctx,
        2,
    )
    .unwrap();

    let addr = server.local_addr();
    tokio::spawn(server.run());

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(addr).await.unwrap();

    let request = access_request(0x2a, 7);
    let mut buf = [0u8; 4096];

    // Initial exchange.
    client.send(&request).await.unwrap();
    let len = timeout(Duration::from_secs(5), client.recv(&mut buf))
        .await
        .expect("reply within deadline")
        .unwrap();
    let first_reply = buf[..len].to_vec();
    assert_eq!(first_reply[0], PacketCode::AccessAccept as u8);
    assert_eq!(first_reply[1], 0x2a);

    // Retransmissions are answered from the reply cache, byte-identical.
    for _ in 0..3 {
        client.send(&request).await.unwrap();
        let len = timeout(Duration::from_secs(5), client.recv(&mut buf))
            .await
            .expect("cached reply within deadline")
            .unwrap();
        assert_eq!(&buf[..len], &first_reply[..]);
    }
}

#[tokio::test]
async fn packets_from_unknown_sources_are_ignored() {
    let worker_ctx = Arc::new(WorkerContext {
        server: policy(),
        dynamic_server: None,
        codec: Arc::new(HeaderOnlyCodec),
        dict: Arc::new(Dictionary::core()),
        max_request_time: Duration::from_secs(5),
    });

    // No static clients and no dynamic networks: everything is unknown.
    let server = Server::bind(
        &listener_config(),
        Vec::new(),
        CodeSet::new([PacketCode::AccessRequest]),
        Arc::new(NullVerifier),
        worker_ctx,
        1,
    )
    .unwrap();

    let addr = server.local_addr();
    tokio::spawn(server.run());

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(addr).await.unwrap();
    client.send(&access_request(1, 1)).await.unwrap();

    let mut buf = [0u8; 64];
    let result = timeout(Duration::from_millis(300), client.recv(&mut buf)).await;
    assert!(result.is_err(), "unknown client must get no reply");
}
