use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use pubsub_engine::frame;
use pubsub_engine::{Broker, BrokerConfig, ErrorKind, Message, Record, SizeAgePolicy};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn config(dir: &TempDir) -> BrokerConfig {
    BrokerConfig {
        fsync: false,
        ..BrokerConfig::with_data_dir(dir.path())
    }
}

async fn read_n(broker: &Broker, topic: &str, from: u64, n: usize) -> Vec<Message> {
    let mut reader = broker.stream_from(topic, from, CancellationToken::new()).unwrap();
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let msg = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        out.push(msg);
    }
    out
}

#[tokio::test]
async fn restart_reproduces_topics_and_next_offsets() {
    let dir = TempDir::new().unwrap();
    let policy = Arc::new(SizeAgePolicy {
        max_bytes: Some(64),
        max_age: None,
    });
    let before = {
        let broker = Broker::open_with_roll_policy(config(&dir), policy.clone())
            .await
            .unwrap();
        for i in 0..10 {
            broker
                .append("alpha", vec![Record::new("k", format!("alpha-{i}"))])
                .await
                .unwrap();
        }
        broker.append("beta", vec![Record::value("only")]).await.unwrap();
        broker.create_topic("gamma").await.unwrap();
        let snapshot: Vec<(String, u64)> = broker
            .topic_names()
            .into_iter()
            .map(|name| {
                let next = broker.topic(&name).unwrap().next_offset();
                (name, next)
            })
            .collect();
        snapshot
    };
    assert_eq!(
        before,
        vec![("alpha".to_string(), 10), ("beta".to_string(), 1), ("gamma".to_string(), 0)]
    );

    for _ in 0..2 {
        let broker = Broker::open_with_roll_policy(config(&dir), policy.clone())
            .await
            .unwrap();
        let after: Vec<(String, u64)> = broker
            .topic_names()
            .into_iter()
            .map(|name| {
                let next = broker.topic(&name).unwrap().next_offset();
                (name, next)
            })
            .collect();
        assert_eq!(after, before);

        let alpha = read_n(&broker, "alpha", 0, 10).await;
        for (i, msg) in alpha.iter().enumerate() {
            assert_eq!(msg.offset, i as u64);
            assert_eq!(msg.value, format!("alpha-{i}"));
        }
    }

    let broker = Broker::open(config(&dir)).await.unwrap();
    assert_eq!(broker.append("alpha", vec![Record::value("next")]).await.unwrap(), 10..11);
    assert!(broker.topic("alpha").unwrap().segments().len() > 1);
}

#[tokio::test]
async fn torn_tail_is_truncated_on_open() {
    let dir = TempDir::new().unwrap();
    {
        let broker = Broker::open(config(&dir)).await.unwrap();
        broker
            .append("torn", vec![Record::value("a"), Record::value("b")])
            .await
            .unwrap();
    }

    let path = dir.path().join("torn/000000000000.pubsub");
    let good_len = std::fs::metadata(&path).unwrap().len();
    let partial = frame::encode(&Message {
        offset: 2,
        key: Default::default(),
        value: "interrupted".into(),
    })
    .unwrap();
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&partial[..partial.len() / 2]).unwrap();
    drop(file);

    let broker = Broker::open(config(&dir)).await.unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
    assert_eq!(broker.topic("torn").unwrap().next_offset(), 2);

    assert_eq!(broker.append("torn", vec![Record::value("c")]).await.unwrap(), 2..3);
    let values: Vec<_> = read_n(&broker, "torn", 0, 3)
        .await
        .into_iter()
        .map(|m| m.value)
        .collect();
    assert_eq!(values, ["a", "b", "c"]);
}

#[tokio::test]
async fn checksum_failure_in_active_segment_fails_startup() {
    let dir = TempDir::new().unwrap();
    {
        let broker = Broker::open(config(&dir)).await.unwrap();
        broker.append("bad", vec![Record::value("payload")]).await.unwrap();
    }
    let path = dir.path().join("bad/000000000000.pubsub");
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    std::fs::write(&path, bytes).unwrap();

    let err = Broker::open(config(&dir)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptFrame);
}

#[tokio::test]
async fn foreign_files_in_topic_dir_are_ignored() {
    let dir = TempDir::new().unwrap();
    {
        let broker = Broker::open(config(&dir)).await.unwrap();
        broker.append("mixed", vec![Record::value("x")]).await.unwrap();
    }
    std::fs::write(dir.path().join("mixed/README"), b"not a segment").unwrap();
    std::fs::write(dir.path().join("mixed/000000000005.tmp"), b"junk").unwrap();

    let broker = Broker::open(config(&dir)).await.unwrap();
    let topic = broker.topic("mixed").unwrap();
    assert_eq!(topic.segments().len(), 1);
    assert_eq!(topic.next_offset(), 1);
}
