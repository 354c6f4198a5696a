#[allow(dead_code)]
mod common;

use std::thread;
use std::time;

use rand::Rng;

const RECV_TIMEOUT: time::Duration = time::Duration::from_millis(5000);

#[test]
fn concurrent_senders() {
    common::init_logger();

    let port = 18831;
    let receiver_id = 100;
    let sender_ids = [1, 2, 3];
    let message_size = 16 * 1024;

    let router = common::start_router(port);

    let (receiver, inbox) = common::connect_node(port, receiver_id);

    let senders: Vec<_> = sender_ids
        .iter()
        .map(|&id| common::connect_node(port, id).0)
        .collect();

    common::wait_registered(&router, &[1, 2, 3, receiver_id]);

    let payloads: Vec<_> = sender_ids
        .iter()
        .map(|_| common::random_bytes(message_size))
        .collect();

    let threads: Vec<_> = senders
        .into_iter()
        .zip(payloads.iter().cloned())
        .map(|(node, payload)| {
            thread::spawn(move || {
                node.send_message(&payload, receiver_id, false).unwrap();
                node
            })
        })
        .collect();

    let mut digests = Vec::new();

    for _ in 0..sender_ids.len() {
        let (src, data) = inbox.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(data.len(), message_size);
        digests.push((src, md5::compute(&data)));
    }

    digests.sort_by_key(|&(src, _)| src);

    for ((&id, payload), (src, digest)) in sender_ids.iter().zip(payloads.iter()).zip(digests) {
        assert_eq!(src, id);
        assert_eq!(digest, md5::compute(payload));
    }

    for thread in threads {
        thread.join().unwrap().close();
    }

    receiver.close();
    router.stop();
}

#[test]
fn sequential_messages() {
    common::init_logger();

    let port = 18832;
    let message_count = 200;

    let router = common::start_router(port);

    let (sender, _) = common::connect_node(port, 20);
    let (receiver, inbox) = common::connect_node(port, 21);

    common::wait_registered(&router, &[20, 21]);

    let mut rng = rand::thread_rng();

    let mut sent = md5::Context::new();

    for _ in 0..message_count {
        let payload = common::random_bytes(rng.gen_range(1..=300));
        sender.send_message(&payload, 21, false).unwrap();
        sent.consume(&payload);
    }

    let mut received = md5::Context::new();

    for _ in 0..message_count {
        let (src, data) = inbox.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(src, 20);
        received.consume(&data);
    }

    assert_eq!(sent.compute(), received.compute());

    sender.close();
    receiver.close();
    router.stop();
}

#[test]
fn two_way_bulk_transfer() {
    common::init_logger();

    let port = 18833;
    let message_count = 4;
    let message_size = 256 * 1024;
    let timeout = time::Duration::from_secs(30);

    let router = common::start_router(port);

    let (a, a_inbox) = common::connect_node(port, 1);
    let (b, b_inbox) = common::connect_node(port, 2);

    common::wait_registered(&router, &[1, 2]);

    // Both directions at once, large enough to fill every socket buffer on the path
    let threads: Vec<_> = [(a, 2), (b, 1)]
        .into_iter()
        .map(|(node, dst)| {
            thread::spawn(move || {
                let mut digest = md5::Context::new();

                for _ in 0..message_count {
                    let payload = common::random_bytes(message_size);
                    node.send_message(&payload, dst, false).unwrap();
                    digest.consume(&payload);
                }

                (node, digest.compute())
            })
        })
        .collect();

    let mut received = Vec::new();

    for (inbox, src) in [(&b_inbox, 1), (&a_inbox, 2)] {
        let mut digest = md5::Context::new();

        for _ in 0..message_count {
            let (from, data) = inbox.recv_timeout(timeout).unwrap();
            assert_eq!(from, src);
            assert_eq!(data.len(), message_size);
            digest.consume(&data);
        }

        received.push(digest.compute());
    }

    for (thread, digest) in threads.into_iter().zip(received) {
        let (node, sent) = thread.join().unwrap();
        assert_eq!(sent, digest);
        node.close();
    }

    router.stop();
}
