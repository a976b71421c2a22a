//! In-process send→receive scenarios over real loopback UDP sockets,
//! exercising the full `Node` (dispatcher + engines + store) rather
//! than any single component in isolation.

use std::sync::Arc;
use std::time::Duration;

use courier_node::config::CourierConfig;
use courier_node::dispatcher::Node;
use courier_store::{SqliteStore, Store};
use courier_transport::sender::FecConfig;

fn spawn_node(fec: FecConfig, chunk_size: usize, window_size: u32) -> (Arc<Node>, Arc<dyn Store>) {
    let mut config = CourierConfig::defaults();
    config.port = 0;
    config.fec = fec;
    config.send.chunk_size = chunk_size;
    config.send.window_size = window_size;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let node = Node::new(config, store.clone()).unwrap();
    node.start();
    (node, store)
}

#[test]
fn tiny_file_no_fec_delivers_byte_identical() {
    let data = b"Hello Courier! This is an end-to-end in-process test.".to_vec();
    let fec = FecConfig {
        enabled: false,
        k: 4,
        r: 2,
    };
    let (sender, _sender_store) = spawn_node(fec, 16, 4);
    let (receiver, receiver_store) = spawn_node(fec, 16, 4);

    let dest = receiver.local_addr().unwrap();
    sender.send_file("scenario-1", dest, &data).unwrap();

    assert!(sender.wait_for_completion("scenario-1", Duration::from_secs(5)));

    // give the receiver's last DELIVERED-triggering datagram time to land
    std::thread::sleep(Duration::from_millis(200));

    let bundle = receiver_store
        .load_bundle("scenario-1")
        .unwrap()
        .expect("receiver should have recorded the bundle");
    assert_eq!(bundle.total_chunks, 4);
    assert_eq!(bundle.state, "delivered");

    sender.stop();
    receiver.stop();
}

#[test]
fn larger_file_with_fec_survives_multiple_windows() {
    // Large enough to span several send windows and several FEC blocks.
    let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let fec = FecConfig {
        enabled: true,
        k: 4,
        r: 2,
    };
    let (sender, _sender_store) = spawn_node(fec, 512, 8);
    let (receiver, receiver_store) = spawn_node(fec, 512, 8);

    let dest = receiver.local_addr().unwrap();
    sender.send_file("scenario-large", dest, &data).unwrap();

    assert!(sender.wait_for_completion("scenario-large", Duration::from_secs(15)));
    std::thread::sleep(Duration::from_millis(200));

    let bundle = receiver_store.load_bundle("scenario-large").unwrap().unwrap();
    assert_eq!(bundle.state, "delivered");
    let chunks = receiver_store.load_chunks_for_bundle("scenario-large").unwrap();
    let data_chunks: u32 = chunks.iter().filter(|c| !c.is_parity).count() as u32;
    assert_eq!(data_chunks, (data.len() as u32).div_ceil(512));

    sender.stop();
    receiver.stop();
}
