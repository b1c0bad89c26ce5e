// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use proptest::prelude::*;

use crate::clock::Clock;

fn ring(capacity: usize) -> UdpLogRing {
    UdpLogRing::new(Arc::new(Clock::new()), capacity)
}

#[test]
fn datagram_splits_into_nonempty_lines() {
    let ring = ring(16);
    ring.ingest("10.0.0.2:5555", b"boot\r\nready\n\n");
    let lines = ring.query(0, None, 100);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].line, "boot");
    assert_eq!(lines[1].line, "ready");
    assert_eq!(lines[0].source, "10.0.0.2:5555");
}

#[test]
fn capacity_drops_oldest() {
    let ring = ring(3);
    for i in 0..5 {
        ring.ingest("src", format!("line {i}\n").as_bytes());
    }
    let lines = ring.query(0, None, 100);
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0].line, "line 2");
    assert_eq!(lines[2].line, "line 4");
}

#[test]
fn query_filters_by_source() {
    let ring = ring(16);
    ring.ingest("10.0.0.2:4242", b"from two\n");
    ring.ingest("10.0.0.3:4242", b"from three\n");

    let lines = ring.query(0, Some("10.0.0.3"), 100);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].line, "from three");
}

#[test]
fn query_applies_limit_keeping_newest() {
    let ring = ring(16);
    for i in 0..6 {
        ring.ingest("src", format!("line {i}\n").as_bytes());
    }
    let lines = ring.query(0, None, 2);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].line, "line 4");
    assert_eq!(lines[1].line, "line 5");
}

#[test]
fn clear_empties_the_ring() {
    let ring = ring(16);
    ring.ingest("src", b"something\n");
    assert!(!ring.is_empty());
    ring.clear();
    assert!(ring.is_empty());
}

#[tokio::test]
async fn receive_loop_ingests_datagrams() -> anyhow::Result<()> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let addr = socket.local_addr()?;
    let ring = Arc::new(UdpLogRing::new(Arc::new(Clock::new()), 64));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run(socket, Arc::clone(&ring), cancel.clone()));

    let sender = UdpSocket::bind("127.0.0.1:0").await?;
    sender.send_to(b"hello from dut\n", addr).await?;

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while ring.is_empty() && std::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let lines = ring.query(0, None, 10);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].line, "hello from dut");

    cancel.cancel();
    let _ = task.await;
    Ok(())
}

proptest! {
    /// The ring never exceeds its capacity, whatever arrives.
    #[test]
    fn ring_never_exceeds_capacity(
        datagrams in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..64),
            0..50,
        )
    ) {
        let ring = ring(8);
        for datagram in &datagrams {
            ring.ingest("src", datagram);
        }
        prop_assert!(ring.len() <= 8);
    }
}
