//! In-process clusters wired over memory channels.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};

use fleetgrid_cluster::snapshot::epoch_millis;
use fleetgrid_cluster::{
    ChannelIdSequence, ChannelMessage, ChannelMessageTarget, ChannelRef,
    ClusterMessageListener, DataSyncHandler, MemoryChannel, Messenger, NodeServer,
    NodeServerProvider, Packet, PacketHandler, ServiceConfiguration, ServiceDirectory,
    ServiceFactory, ServiceInfo, ServiceRegistry,
};
use fleetgrid_state::{HostAndPort, NodeIdentity, StateStore};
use fleetgrid_task::Task;

// ── Fixture ────────────────────────────────────────────────────────

struct Node {
    name: String,
    provider: Arc<NodeServerProvider>,
    services: Arc<ServiceDirectory>,
    messenger: Arc<Messenger>,
    listener: Arc<ClusterMessageListener>,
}

fn identity(name: &str) -> NodeIdentity {
    NodeIdentity::new(name, vec![HostAndPort::new("127.0.0.1", 1410)])
}

struct EchoFactory {
    node: String,
}

impl ServiceFactory for EchoFactory {
    fn create_service(&self, config: ServiceConfiguration) -> Task<Option<ServiceInfo>> {
        let name = format!("{}-1", config.task);
        Task::completed(Some(
            ServiceInfo::new(name, &self.node, config.task).with_environment(config.environment),
        ))
    }
}

/// A started node knowing `peers`, with `startup_time` deciding seniority.
fn node(name: &str, startup_time: u64, peers: &[&str]) -> Node {
    let store = StateStore::open_in_memory().unwrap();
    for peer in peers {
        store.put_cluster_node(&identity(peer)).unwrap();
    }
    let services = Arc::new(ServiceDirectory::new(name));
    let prefix = name.to_string();
    let provider = NodeServerProvider::builder(identity(name), store, services.clone())
        .with_startup_time(startup_time)
        .with_command_executor(Arc::new(move |line: &str| vec![format!("{prefix}: {line}")]))
        .with_service_factory(Arc::new(EchoFactory {
            node: name.to_string(),
        }))
        .build()
        .unwrap();
    provider.local_node().start();

    let messenger = Arc::new(Messenger::new(provider.clone()));
    let listener = Arc::new(ClusterMessageListener::new(messenger.clone()));
    Node {
        name: name.to_string(),
        provider,
        services,
        messenger,
        listener,
    }
}

/// Connect two nodes with a channel pair, each end bound to its listener.
fn connect(ids: &ChannelIdSequence, a: &Node, b: &Node) {
    let (a_end, b_end) = MemoryChannel::pair(ids, &b.name, &a.name);
    a_end.bind(a.listener.clone());
    b_end.bind(b.listener.clone());
    assert!(a.provider.accept_connection(&identity(&b.name), a_end));
    assert!(b.provider.accept_connection(&identity(&a.name), b_end));
}

/// node-1 (youngest), node-2 (oldest) and node-3, fully meshed.
fn three_nodes(ids: &ChannelIdSequence) -> Vec<Node> {
    let nodes = vec![
        node("node-1", 300, &["node-2", "node-3"]),
        node("node-2", 100, &["node-1", "node-3"]),
        node("node-3", 200, &["node-1", "node-2"]),
    ];
    connect(ids, &nodes[0], &nodes[1]);
    connect(ids, &nodes[0], &nodes[2]);
    connect(ids, &nodes[1], &nodes[2]);
    nodes
}

fn two_nodes(ids: &ChannelIdSequence) -> (Node, Node) {
    let first = node("node-1", 200, &["node-2"]);
    let second = node("node-2", 100, &["node-1"]);
    connect(ids, &first, &second);
    (first, second)
}

fn tick_all(nodes: &[&Node]) {
    for node in nodes {
        node.provider.tick();
    }
}

/// A game service process answering queries with its own name.
#[derive(Default)]
struct ServiceEndpoint {
    name: String,
    received: Mutex<Vec<String>>,
}

impl ServiceEndpoint {
    fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }
}

impl PacketHandler for ServiceEndpoint {
    fn handle_packet(&self, _channel: &ChannelRef, packet: Packet) {
        if let Ok(message) = packet.decode_message() {
            self.received.lock().push(message.message().to_string());
        }
    }

    fn handle_query(&self, channel: &ChannelRef, packet: Packet) -> Task<Packet> {
        self.handle_packet(channel, packet);
        let answer = ChannelMessage::builder("lobby", "pong")
            .sender(&self.name)
            .content(self.name.clone().into_bytes())
            .build();
        Task::completed(Packet::query_response(&[answer]).unwrap())
    }
}

/// Host a service called `name` in group `lobby` on `node`.
fn host_service(ids: &ChannelIdSequence, node: &Node, name: &str) -> Arc<ServiceEndpoint> {
    let endpoint = Arc::new(ServiceEndpoint {
        name: name.to_string(),
        ..Default::default()
    });
    let (node_end, service_end) = MemoryChannel::pair(ids, name, &node.name);
    node_end.bind(node.listener.clone());
    service_end.bind(endpoint.clone());
    node.services.register_local(
        ServiceInfo::new(name, &node.name, "lobby").with_groups(&["lobby"]),
        Some(node_end as ChannelRef),
    );
    endpoint
}

fn bodies(answers: &[ChannelMessage]) -> Vec<String> {
    let mut bodies: Vec<String> = answers
        .iter()
        .map(|m| String::from_utf8_lossy(&m.content().content()).into_owned())
        .collect();
    bodies.sort();
    bodies
}

// ── Membership ─────────────────────────────────────────────────────

#[test]
fn heartbeat_makes_peers_available_and_elects_the_oldest() {
    let nodes = three_nodes(&ChannelIdSequence::new());
    for node in &nodes {
        assert_eq!(node.provider.head_node_name(), node.name);
        assert_eq!(node.provider.available_node_servers().len(), 1);
    }

    tick_all(&nodes.iter().collect::<Vec<_>>());

    for node in &nodes {
        assert_eq!(node.provider.available_node_servers().len(), 3);
        assert_eq!(node.provider.head_node_name(), "node-2");
    }
    assert!(nodes[1].provider.local_node().is_head_node());
    assert!(nodes[0].provider.node("node-2").unwrap().is_head_node());
}

#[test]
fn snapshots_carry_the_peer_state() {
    let (first, second) = two_nodes(&ChannelIdSequence::new());
    tick_all(&[&first, &second]);

    let seen = first.provider.remote_node("node-2").unwrap().snapshot().unwrap();
    assert_eq!(seen.identity.unique_id, "node-2");
    assert_eq!(seen.startup_time, 100);

    let before = seen.creation_time;
    second.provider.tick();
    let remote = first.provider.remote_node("node-2").unwrap();
    assert!(remote.snapshot().unwrap().creation_time > before);
    assert_eq!(remote.last_snapshot().unwrap().creation_time, before);
}

#[test]
fn idle_peer_is_evicted_on_both_sides() {
    let (first, second) = two_nodes(&ChannelIdSequence::new());
    tick_all(&[&first, &second]);
    first
        .services
        .update_service(ServiceInfo::new("lobby-7", "node-2", "lobby"));
    assert_eq!(first.provider.head_node_name(), "node-2");

    let evicted = first
        .provider
        .check_for_dead_nodes_at(epoch_millis() + 31_000);

    assert_eq!(evicted, vec!["node-2"]);
    assert!(first.services.service("lobby-7").is_none());
    assert_eq!(first.provider.head_node_name(), "node-1");
    // Closing the channel tells the other side too.
    let back = second.provider.remote_node("node-1").unwrap();
    assert!(!back.is_connected());
    assert!(!back.is_available());
}

#[test]
fn fresh_peer_survives_the_dead_node_check() {
    let (first, second) = two_nodes(&ChannelIdSequence::new());
    tick_all(&[&first, &second]);

    assert!(first.provider.check_for_dead_nodes().is_empty());
    assert!(first.provider.remote_node("node-2").unwrap().is_available());
}

#[test]
fn closing_a_provider_hands_the_head_role_over() {
    let (first, second) = two_nodes(&ChannelIdSequence::new());
    tick_all(&[&first, &second]);
    assert_eq!(first.provider.head_node_name(), "node-2");

    second.provider.close();

    assert_eq!(first.provider.head_node_name(), "node-1");
    assert!(!first.provider.has_any_connection());
}

#[test]
fn known_node_changes_reach_every_peer() {
    let (first, second) = two_nodes(&ChannelIdSequence::new());

    first.provider.add_node(identity("node-9")).unwrap();
    assert!(second.provider.remote_node("node-9").is_some());
    assert!(second.provider.store().get_cluster_node("node-9").unwrap().is_some());

    first.provider.remove_node("node-9").unwrap();
    assert!(second.provider.remote_node("node-9").is_none());
    assert!(second.provider.store().get_cluster_node("node-9").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_loops_connect_the_cluster() {
    let (first, second) = two_nodes(&ChannelIdSequence::new());
    let loops = [
        first.provider.spawn_heartbeat(Duration::from_secs(1)),
        second.provider.spawn_heartbeat(Duration::from_secs(1)),
    ];

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(first.provider.head_node_name(), "node-2");
    assert_eq!(second.provider.available_node_servers().len(), 2);

    first.provider.close();
    second.provider.close();
    for handle in loops {
        handle.await.unwrap();
    }
}

// ── Node operations ────────────────────────────────────────────────

#[test]
fn command_line_runs_on_the_peer() {
    let (first, _second) = two_nodes(&ChannelIdSequence::new());

    let output = first
        .provider
        .node("node-2")
        .unwrap()
        .run_command("services list")
        .get()
        .unwrap();

    assert_eq!(output, vec!["node-2: services list"]);
}

#[test]
fn service_is_created_by_the_peer_factory() {
    let (first, _second) = two_nodes(&ChannelIdSequence::new());
    let config = ServiceConfiguration {
        task: "lobby".into(),
        groups: vec!["lobby".into()],
        environment: "minecraft".into(),
        properties: Default::default(),
    };

    let created = first
        .provider
        .node("node-2")
        .unwrap()
        .service_factory()
        .create_service(config)
        .get()
        .unwrap()
        .unwrap();

    assert_eq!(created.name, "lobby-1");
    assert_eq!(created.node, "node-2");
    assert_eq!(created.environment, "minecraft");
}

#[test]
fn drain_request_shows_up_in_the_next_snapshot() {
    let (first, second) = two_nodes(&ChannelIdSequence::new());
    tick_all(&[&first, &second]);
    let remote = first.provider.node("node-2").unwrap();
    assert!(!remote.is_draining());

    remote.drain(true);
    assert!(second.provider.local_node().is_draining());

    second.provider.tick();
    assert!(remote.is_draining());
}

#[test]
fn shutdown_request_runs_the_peer_hooks() {
    let (first, second) = two_nodes(&ChannelIdSequence::new());
    let stopped = Arc::new(Mutex::new(false));
    let flag = stopped.clone();
    second.provider.local_node().on_shutdown(move || *flag.lock() = true);

    first.provider.node("node-2").unwrap().shutdown();

    assert!(*stopped.lock());
    assert!(!second.provider.local_node().is_available());
}

// ── Messaging ──────────────────────────────────────────────────────

#[test]
fn group_query_collects_answers_from_every_node() {
    let ids = ChannelIdSequence::new();
    let nodes = three_nodes(&ids);
    let lobby_1 = host_service(&ids, &nodes[0], "lobby-1");
    let lobby_2 = host_service(&ids, &nodes[1], "lobby-2");
    // node-1 learned about lobby-2 through lifecycle replication.
    nodes[0]
        .services
        .update_service(ServiceInfo::new("lobby-2", "node-2", "lobby").with_groups(&["lobby"]));
    nodes[1]
        .services
        .update_service(ServiceInfo::new("lobby-1", "node-1", "lobby").with_groups(&["lobby"]));

    let query = ChannelMessage::builder("lobby", "ping")
        .target(ChannelMessageTarget::group("lobby"))
        .build();
    let answers = nodes[0].messenger.send_query_blocking(query);

    assert_eq!(bodies(&answers), vec!["lobby-1", "lobby-2"]);
    assert_eq!(lobby_1.received(), vec!["ping"]);
    assert_eq!(lobby_2.received(), vec!["ping"]);
}

#[test]
fn broadcast_reaches_each_service_once() {
    let ids = ChannelIdSequence::new();
    let (first, second) = two_nodes(&ids);
    let lobby_1 = host_service(&ids, &first, "lobby-1");
    let lobby_2 = host_service(&ids, &second, "lobby-2");

    first.messenger.send(
        ChannelMessage::builder("announcements", "restart")
            .target(ChannelMessageTarget::All)
            .content(&b"in 5 minutes"[..])
            .build(),
    );

    assert_eq!(lobby_1.received(), vec!["restart"]);
    assert_eq!(lobby_2.received(), vec!["restart"]);
}

#[test]
fn message_to_several_nodes_is_delivered_once_per_node() {
    let ids = ChannelIdSequence::new();
    let nodes = three_nodes(&ids);
    let delivered = Arc::new(Mutex::new(Vec::new()));
    for node in &nodes {
        let delivered = delivered.clone();
        let name = node.name.clone();
        node.listener.add_handler(move |message: &ChannelMessage| -> Option<ChannelMessage> {
            if message.channel() == "lobby" {
                delivered.lock().push(name.clone());
            }
            None
        });
    }

    nodes[0].messenger.send(
        ChannelMessage::builder("lobby", "ping")
            .target(ChannelMessageTarget::node("node-2"))
            .target(ChannelMessageTarget::node("node-3"))
            .build(),
    );

    let mut delivered = delivered.lock().clone();
    delivered.sort();
    assert_eq!(delivered, vec!["node-2", "node-3"]);
}

#[test]
fn node_query_without_peer_channel_answers_empty() {
    let first = node("node-1", 100, &["node-2"]);

    let answers = first.messenger.send_query_blocking(
        ChannelMessage::builder("lobby", "ping")
            .target(ChannelMessageTarget::node("node-2"))
            .build(),
    );

    assert!(answers.is_empty());
}

#[test]
fn application_handler_answers_remote_queries() {
    let (first, second) = two_nodes(&ChannelIdSequence::new());
    second.listener.add_handler(|message: &ChannelMessage| {
        (message.channel() == "stats").then(|| {
            ChannelMessage::builder("stats", "players")
                .json(&json!({ "online": 42 }))
                .unwrap()
                .build()
        })
    });

    let answers = first.messenger.send_query_blocking(
        ChannelMessage::builder("stats", "count")
            .target(ChannelMessageTarget::node("node-2"))
            .build(),
    );

    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].json::<Value>().unwrap(), json!({ "online": 42 }));
}

#[test]
fn lost_node_services_are_reported_to_local_services() {
    let ids = ChannelIdSequence::new();
    let (first, second) = two_nodes(&ids);
    let lobby_1 = host_service(&ids, &first, "lobby-1");
    first
        .services
        .update_service(ServiceInfo::new("lobby-2", "node-2", "lobby"));
    tick_all(&[&first, &second]);

    first.provider.remote_node("node-2").unwrap().close();

    assert!(first.services.service("lobby-2").is_none());
    assert!(lobby_1.received().contains(&"update_service_lifecycle".to_string()));
}

// ── Data sync ──────────────────────────────────────────────────────

/// One shared value per key.
struct Slot {
    key: &'static str,
    value: Mutex<Option<Value>>,
}

impl Slot {
    fn new(key: &'static str, value: Option<Value>) -> Arc<Self> {
        Arc::new(Self {
            key,
            value: Mutex::new(value),
        })
    }

    fn get(&self) -> Option<Value> {
        self.value.lock().clone()
    }
}

impl DataSyncHandler for Slot {
    fn key(&self) -> &str {
        self.key
    }

    fn name(&self, _value: &Value) -> String {
        self.key.to_string()
    }

    fn data(&self) -> Vec<Value> {
        self.get().into_iter().collect()
    }

    fn current(&self, _incoming: &Value) -> Option<Value> {
        self.get()
    }

    fn write(&self, value: Value) {
        *self.value.lock() = Some(value);
    }
}

#[test]
fn sync_keeps_peer_values_on_conflict_and_fills_gaps() {
    let (first, second) = two_nodes(&ChannelIdSequence::new());
    let motd_1 = Slot::new("motd", Some(json!("welcome")));
    let rules_1 = Slot::new("rules", Some(json!("no griefing")));
    let motd_2 = Slot::new("motd", Some(json!("hello")));
    let rules_2 = Slot::new("rules", None);
    first.provider.data_sync().register_handler(motd_1.clone());
    first.provider.data_sync().register_handler(rules_1.clone());
    second.provider.data_sync().register_handler(motd_2.clone());
    second.provider.data_sync().register_handler(rules_2.clone());

    let applied = first
        .provider
        .remote_node("node-2")
        .unwrap()
        .sync_cluster_data(false)
        .get()
        .unwrap();

    assert_eq!(applied, 1);
    assert_eq!(motd_1.get(), Some(json!("hello")));
    assert_eq!(motd_2.get(), Some(json!("hello")));
    assert_eq!(rules_2.get(), Some(json!("no griefing")));
}

#[test]
fn forced_sync_overwrites_every_peer() {
    let nodes = three_nodes(&ChannelIdSequence::new());
    let slots: Vec<_> = ["one", "two", "three"]
        .iter()
        .map(|v| Slot::new("motd", Some(json!(v))))
        .collect();
    for (node, slot) in nodes.iter().zip(&slots) {
        node.provider.data_sync().register_handler(slot.clone());
    }

    nodes[2].provider.sync_data_into_cluster().unwrap();

    for slot in &slots {
        assert_eq!(slot.get(), Some(json!("three")));
    }
}
