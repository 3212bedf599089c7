//! End-to-end scenarios against a live Redis. Ignored by default (`cargo test -- --ignored`)
//! since they need `AMI_TEST_REDIS_URL` (or `redis://127.0.0.1:6379` by default) pointed at a
//! disposable Redis/Redis Cluster instance.

use std::sync::Arc;
use std::time::Duration;

use ami::config::{ConsumerOptions, ProducerOptions};
use ami::redis::Store;
use ami::{Consumer, ErrorNotifier, Message, Producer};

fn redis_url() -> String {
    std::env::var("AMI_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn unique_queue(tag: &str) -> String {
    // Date.now()/rand aren't needed here: the test process id plus a fixed tag is unique enough
    // across concurrent `cargo test` runs against a shared throwaway Redis.
    format!("ami_it_{tag}_{}", std::process::id())
}

struct Silent;
impl ErrorNotifier for Silent {
    fn notify(&self, err: &ami::AmiError) {
        eprintln!("notifier saw: {err}");
    }
}

async fn drain(rx: &mut tokio::sync::mpsc::Receiver<Message>, n: usize, timeout: Duration) -> Vec<Message> {
    let mut out = Vec::with_capacity(n);
    let deadline = tokio::time::Instant::now() + timeout;
    while out.len() < n {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(m)) => out.push(m),
            _ => break,
        }
    }
    out
}

#[tokio::test]
#[ignore]
async fn send_then_receive_round_trip() {
    let store = Store::connect(&redis_url()).await.expect("connect");
    let queue = unique_queue("roundtrip");

    let producer = Producer::new(ProducerOptions::new(&queue).shards_count(2), store.clone())
        .await
        .expect("producer");
    let mut consumer = Consumer::new(ConsumerOptions::new(&queue, "c1").shards_count(2), store)
        .await
        .expect("consumer");
    let mut rx = consumer.start().expect("start");

    for i in 0..25 {
        producer.send(format!("msg-{i}")).await.expect("send");
    }
    producer.close().await.expect("close producer");

    let received = drain(&mut rx, 25, Duration::from_secs(5)).await;
    assert_eq!(received.len(), 25);

    let mut bodies: Vec<String> = received.iter().map(|m| m.body.clone()).collect();
    bodies.sort();
    let mut expected: Vec<String> = (0..25).map(|i| format!("msg-{i}")).collect();
    expected.sort();
    assert_eq!(bodies, expected);

    for m in received {
        consumer.ack(m).await.expect("ack");
    }

    consumer.stop().await.expect("stop");
    consumer.close().await.expect("close consumer");
}

#[tokio::test]
#[ignore]
async fn unacked_messages_redeliver_on_restart() {
    let store = Store::connect(&redis_url()).await.expect("connect");
    let queue = unique_queue("redeliver");

    let producer = Producer::new(ProducerOptions::new(&queue).shards_count(1), store.clone())
        .await
        .expect("producer");
    producer.send("never-acked".to_string()).await.expect("send");
    producer.close().await.expect("close producer");

    // First consumer reads the message but crashes before acking: dropping it without stop()
    // leaves the entry pending in the consumer group, exactly like a process crash.
    let mut first = Consumer::new(
        ConsumerOptions::new(&queue, "same-name").shards_count(1),
        store.clone(),
    )
    .await
    .expect("first consumer");
    let mut rx1 = first.start().expect("start");
    let got = drain(&mut rx1, 1, Duration::from_secs(5)).await;
    assert_eq!(got.len(), 1);
    drop(rx1);
    drop(first);

    // A second consumer under the same name replays the backlog from 0-0 and sees it again.
    let mut second = Consumer::new(ConsumerOptions::new(&queue, "same-name").shards_count(1), store)
        .await
        .expect("second consumer");
    let mut rx2 = second.start().expect("start");
    let redelivered = drain(&mut rx2, 1, Duration::from_secs(5)).await;
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].body, "never-acked");

    second.ack(redelivered.into_iter().next().unwrap()).await.expect("ack");
    second.stop().await.expect("stop");
    second.close().await.expect("close");
}

#[tokio::test]
#[ignore]
async fn shard_fanout_spreads_across_streams() {
    let store = Store::connect(&redis_url()).await.expect("connect");
    let queue = unique_queue("fanout");
    let shards = 4;

    let producer = Producer::new(ProducerOptions::new(&queue).shards_count(shards), store.clone())
        .await
        .expect("producer");
    for i in 0..shards * 5 {
        producer.send(format!("m-{i}")).await.expect("send");
    }
    producer.close().await.expect("close producer");

    let mut consumer = Consumer::new(ConsumerOptions::new(&queue, "fanout-reader").shards_count(shards), store)
        .await
        .expect("consumer");
    let mut rx = consumer.start().expect("start");
    let received = drain(&mut rx, (shards * 5) as usize, Duration::from_secs(5)).await;
    assert_eq!(received.len() as u32, shards * 5);

    let distinct_streams: std::collections::HashSet<String> =
        received.iter().map(|m| m.stream.clone()).collect();
    assert!(distinct_streams.len() > 1, "messages should spread across more than one shard stream");

    for m in received {
        consumer.ack(m).await.expect("ack");
    }
    consumer.stop().await.expect("stop");
    consumer.close().await.expect("close");
}

#[tokio::test]
#[ignore]
async fn close_without_stop_still_flushes_pending_acks() {
    let store = Store::connect(&redis_url()).await.expect("connect");
    let queue = unique_queue("ackflush");

    let producer = Producer::new(ProducerOptions::new(&queue).shards_count(1), store.clone())
        .await
        .expect("producer");
    producer.send("to-ack".to_string()).await.expect("send");
    producer.close().await.expect("close producer");

    let mut consumer = Consumer::new(ConsumerOptions::new(&queue, "acker").shards_count(1), store.clone())
        .await
        .expect("consumer");
    let mut rx = consumer.start().expect("start");
    let got = drain(&mut rx, 1, Duration::from_secs(5)).await;
    assert_eq!(got.len(), 1);

    consumer.ack(got.into_iter().next().unwrap()).await.expect("ack");
    consumer.stop().await.expect("stop");
    // close() must wait for the ack batcher to flush the queued ack before returning.
    consumer.close().await.expect("close");

    // A fresh consumer under the same name sees no backlog: the prior entry was XACK+XDEL'd.
    let mut verifier = Consumer::with_notifier(
        ConsumerOptions::new(&queue, "acker").shards_count(1).no_block(),
        store,
        Arc::new(Silent),
    )
    .await
    .expect("verifier");
    let mut vrx = verifier.start().expect("start");
    let leftovers = drain(&mut vrx, 1, Duration::from_millis(500)).await;
    assert!(leftovers.is_empty(), "prior ack should have removed the entry from the backlog");

    verifier.stop().await.expect("stop");
    verifier.close().await.expect("close");
}

#[tokio::test]
#[ignore]
async fn malformed_entry_is_self_acked_and_skipped() {
    use redis::AsyncCommands;

    let store = Store::connect(&redis_url()).await.expect("connect");
    let queue = unique_queue("malformed");

    let consumer = Consumer::new(ConsumerOptions::new(&queue, "c1").shards_count(1), store.clone())
        .await
        .expect("consumer bootstraps the shard/group");

    // Write a raw entry with the wrong field name directly, bypassing the Producer, to simulate
    // a foreign writer or a schema mismatch.
    let stream = ami::naming::shard_stream(&queue, 0);
    let mut raw = redis::Client::open(redis_url()).unwrap().get_multiplexed_async_connection().await.unwrap();
    let _: String = raw.xadd(&stream, "*", &[("wrong_field", "oops")]).await.unwrap();

    let producer = Producer::new(ProducerOptions::new(&queue).shards_count(1), store)
        .await
        .expect("producer");
    producer.send("good".to_string()).await.expect("send");
    producer.close().await.expect("close producer");

    let mut consumer = consumer;
    let mut rx = consumer.start().expect("start");
    let received = drain(&mut rx, 1, Duration::from_secs(5)).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].body, "good");

    consumer.ack(received.into_iter().next().unwrap()).await.expect("ack");
    consumer.stop().await.expect("stop");
    consumer.close().await.expect("close");
}

#[tokio::test]
#[ignore]
async fn concurrent_producers_interleave_safely() {
    let store = Store::connect(&redis_url()).await.expect("connect");
    let queue = unique_queue("concurrent");

    let p1 = Producer::new(ProducerOptions::new(&queue).shards_count(2), store.clone())
        .await
        .expect("producer 1");
    let p2 = Producer::new(ProducerOptions::new(&queue).shards_count(2), store.clone())
        .await
        .expect("producer 2");

    let h1 = tokio::spawn(async move {
        for i in 0..20 {
            p1.send(format!("p1-{i}")).await.unwrap();
        }
        p1.close().await.unwrap();
    });
    let h2 = tokio::spawn(async move {
        for i in 0..20 {
            p2.send(format!("p2-{i}")).await.unwrap();
        }
        p2.close().await.unwrap();
    });
    h1.await.unwrap();
    h2.await.unwrap();

    let mut consumer = Consumer::new(ConsumerOptions::new(&queue, "c1").shards_count(2), store)
        .await
        .expect("consumer");
    let mut rx = consumer.start().expect("start");
    let received = drain(&mut rx, 40, Duration::from_secs(5)).await;
    assert_eq!(received.len(), 40);

    for m in received {
        consumer.ack(m).await.expect("ack");
    }
    consumer.stop().await.expect("stop");
    consumer.close().await.expect("close");
}
