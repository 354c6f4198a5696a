use std::net;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time;

use vbus::socket::{OsSockets, SocketApi};

pub type Inbox = mpsc::Receiver<(vbus::NodeId, Box<[u8]>)>;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `f` until it returns true, panicking after `timeout_ms`.
pub fn wait_until<F: Fn() -> bool>(timeout_ms: u64, f: F) {
    let deadline = time::Instant::now() + time::Duration::from_millis(timeout_ms);

    while !f() {
        assert!(time::Instant::now() < deadline, "timed out waiting for condition");
        thread::sleep(time::Duration::from_millis(5));
    }
}

pub fn router_config(port: u16) -> vbus::server::Config {
    vbus::server::Config {
        port,
        ..Default::default()
    }
}

pub fn client_config(port: u16) -> vbus::client::Config {
    vbus::client::Config {
        router_addr: net::SocketAddrV4::new(net::Ipv4Addr::LOCALHOST, port),
    }
}

pub fn start_router(port: u16) -> Arc<vbus::Manager> {
    start_router_on(port, Arc::new(OsSockets))
}

pub fn start_router_on(port: u16, sockets: Arc<dyn SocketApi>) -> Arc<vbus::Manager> {
    vbus::Manager::start(router_config(port), sockets).expect("failed to start router")
}

/// Connects a node whose received messages are delivered to the returned channel.
pub fn connect_node(port: u16, id: vbus::NodeId) -> (vbus::Node, Inbox) {
    connect_node_on(port, id, Arc::new(OsSockets))
}

pub fn connect_node_on(
    port: u16,
    id: vbus::NodeId,
    sockets: Arc<dyn SocketApi>,
) -> (vbus::Node, Inbox) {
    let (tx, rx) = mpsc::channel();

    let node = vbus::Node::connect(id, client_config(port), sockets, move |src, data| {
        let _ = tx.send((src, data));
    })
    .expect("failed to connect node");

    (node, rx)
}

/// Waits until the router has registered every id in `ids`.
pub fn wait_registered(router: &vbus::Manager, ids: &[vbus::NodeId]) {
    wait_until(2000, || {
        let connected = router.connected_ids();
        ids.iter().all(|id| connected.contains(id))
    });
}

pub fn random_bytes(size: usize) -> Box<[u8]> {
    (0..size)
        .map(|_| rand::random::<u8>())
        .collect::<Vec<_>>()
        .into_boxed_slice()
}
