//! Originator -> relay -> broker -> consumer -> store, on in-process
//! broker and store doubles.

use std::{net::SocketAddr, time::Duration};

use chrono::Utc;
use consumer::{PersistenceConsumer, RetryLedger, SessionEnd};
use postgresdb::{MemoryStore, MemoryStoreConnector};
use relaycore::{
    token::{TokenSigner, TokenVerifier},
    Algorithm, BackoffPolicy, ChecksumAlgorithm, Connector, Datagram, MemoryBroker, MemoryConnector, Message,
    SignedEnvelope,
};
use tokio_util::sync::CancellationToken;
use udp::{Forwarder, Outcome, RejectionKind, RelayGateway, Verifier};
use udpclient::{message_text, Signer};

const SECRET: &[u8] = b"pipeline-secret";
const Q: &str = "udp_messages";
const DLQ: &str = "udp_messages.dead";

fn peer() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 40_000))
}

fn backoff() -> BackoffPolicy {
    BackoffPolicy::fixed(Duration::from_millis(100))
}

fn signer(secret: &[u8]) -> Signer {
    Signer::new(TokenSigner::new(secret.to_vec(), Algorithm::HS256), ChecksumAlgorithm::Md5)
}

fn signed_text(client_id: i64, text: &str) -> Vec<u8> {
    signer(SECRET)
        .sign(&Message::new(client_id, text), Utc::now())
        .unwrap()
        .to_bytes()
        .unwrap()
}

fn signed(client_id: i64, counter: u64) -> Vec<u8> {
    signed_text(client_id, &message_text(counter))
}

async fn relay(broker: &MemoryBroker) -> RelayGateway<MemoryConnector> {
    let verifier = Verifier::new(TokenVerifier::new(SECRET.to_vec(), Algorithm::HS256), ChecksumAlgorithm::Md5);
    let mut forwarder = Forwarder::new(Connector::new(broker.connector(Q, 1), backoff()), Q);
    forwarder.connect().await;
    RelayGateway::new(verifier, forwarder)
}

fn persistence(
    store: &MemoryStore,
    broker: &MemoryBroker,
    max_attempts: u32,
) -> PersistenceConsumer<MemoryStoreConnector, MemoryConnector> {
    PersistenceConsumer::new(
        Connector::new(store.connector(), backoff()),
        Connector::new(broker.connector(Q, 1), backoff()),
        DLQ,
    )
    .with_ledger(RetryLedger::new(max_attempts))
}

async fn drain(consumer: &mut PersistenceConsumer<MemoryStoreConnector, MemoryConnector>) -> SessionEnd {
    let store = consumer.connect_store().await;
    let mut channel = consumer.connect_broker().await;
    consumer.run_session(&store, &mut channel, &CancellationToken::new()).await
}

#[tokio::test]
async fn signed_message_reaches_the_table_unchanged() {
    let (broker, store) = (MemoryBroker::new(), MemoryStore::new());
    let mut gateway = relay(&broker).await;

    let payload = signed_text(1, "hello");
    assert_eq!(gateway.handle(Datagram::new(peer(), payload.clone())).await, Outcome::Forwarded);
    assert_eq!(broker.messages(Q), vec![payload.clone()]);

    let mut consumer = persistence(&store, &broker, 5);
    assert!(matches!(drain(&mut consumer).await, SessionEnd::Drained));

    let sent = SignedEnvelope::from_slice(&payload).unwrap();
    let rows = store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].client_id, 1);
    assert_eq!(rows[0].text, "hello");
    assert_eq!(rows[0].token, sent.token);
    assert_eq!(rows[0].checksum, sent.checksum);
    assert_eq!(broker.queue_len(Q), 0);
    assert_eq!(broker.unacked_len(), 0);
}

#[tokio::test]
async fn rejected_datagrams_never_reach_the_broker() {
    let broker = MemoryBroker::new();
    let mut gateway = relay(&broker).await;

    let mut tampered = SignedEnvelope::from_slice(&signed(1, 1)).unwrap();
    tampered.text.push('!');
    let forged = signer(b"someone-else").sign(&Message::new(1, "hi"), Utc::now()).unwrap();
    let stale = signer(SECRET)
        .sign(&Message::new(1, "hi"), Utc::now() - chrono::Duration::minutes(5))
        .unwrap();

    let cases = [
        (tampered.to_bytes().unwrap(), RejectionKind::IntegrityFailed),
        (forged.to_bytes().unwrap(), RejectionKind::AuthFailed),
        (stale.to_bytes().unwrap(), RejectionKind::AuthFailed),
        (b"not json at all".to_vec(), RejectionKind::InvalidInput),
        (br#"{"client_id":1,"text":"no token"}"#.to_vec(), RejectionKind::AuthFailed),
        (b"[1, 2, 3]".to_vec(), RejectionKind::InvalidInput),
    ];
    for (payload, kind) in cases {
        assert_eq!(gateway.handle(Datagram::new(peer(), payload)).await, Outcome::Rejected(kind));
    }

    assert_eq!(broker.published(), 0);
    assert_eq!(gateway.stats().dropped(), 6);
}

#[tokio::test]
async fn broker_blip_during_publish_is_republished_once() {
    let (broker, store) = (MemoryBroker::new(), MemoryStore::new());
    let mut gateway = relay(&broker).await;

    broker.fail_next_publishes(1);
    assert_eq!(gateway.handle(Datagram::new(peer(), signed(3, 1))).await, Outcome::Republished);
    assert_eq!(gateway.handle(Datagram::new(peer(), signed(3, 2))).await, Outcome::Forwarded);

    let mut consumer = persistence(&store, &broker, 5);
    drain(&mut consumer).await;

    let texts: Vec<_> = store.rows().into_iter().map(|r| r.text).collect();
    assert_eq!(texts, vec![message_text(1), message_text(2)]);
    assert_eq!(gateway.stats().republished, 1);
}

#[tokio::test]
async fn valid_but_unstorable_message_ends_up_dead_lettered() {
    let (broker, store) = (MemoryBroker::new(), MemoryStore::new());
    let mut gateway = relay(&broker).await;

    let oversized = signed(i64::from(i32::MAX) + 1, 1);
    assert_eq!(gateway.handle(Datagram::new(peer(), oversized.clone())).await, Outcome::Forwarded);
    assert_eq!(gateway.handle(Datagram::new(peer(), signed(9, 2))).await, Outcome::Forwarded);

    let mut consumer = persistence(&store, &broker, 3);
    drain(&mut consumer).await;

    assert_eq!(broker.messages(DLQ), vec![oversized]);
    assert_eq!(store.rows().len(), 1);
    assert_eq!(store.rows()[0].client_id, 9);
    assert_eq!(consumer.stats().dead_lettered, 1);
    assert!(consumer.ledger().is_empty());
}

#[tokio::test]
async fn nothing_published_before_the_first_consumer_session_is_lost() {
    let (broker, store) = (MemoryBroker::new(), MemoryStore::new());
    // Only queues someone declared keep what is published to them.
    broker.discard_undeclared();
    let mut gateway = relay(&broker).await;

    let poison = signed(i64::from(i32::MAX) + 1, 1);
    assert_eq!(gateway.handle(Datagram::new(peer(), signed(4, 1))).await, Outcome::Forwarded);
    assert_eq!(gateway.handle(Datagram::new(peer(), poison.clone())).await, Outcome::Forwarded);

    let mut consumer = persistence(&store, &broker, 2);
    drain(&mut consumer).await;

    assert_eq!(broker.discarded(), 0);
    assert_eq!(store.rows().len(), 1);
    assert_eq!(store.rows()[0].client_id, 4);
    assert_eq!(broker.messages(DLQ), vec![poison]);
}

#[tokio::test(start_paused = true)]
async fn messages_queue_up_while_the_store_is_down() {
    let (broker, store) = (MemoryBroker::new(), MemoryStore::new());
    let mut gateway = relay(&broker).await;
    store.set_available(false);

    let cancel = CancellationToken::new();
    let mut consumer = persistence(&store, &broker, 5);
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };

    for counter in 1..=3 {
        gateway.handle(Datagram::new(peer(), signed(2, counter))).await;
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(broker.queue_len(Q), 3);
    assert!(store.rows().is_empty());

    store.set_available(true);
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();
    let stats = task.await.unwrap();

    assert_eq!(store.rows().len(), 3);
    assert_eq!(stats.inserted, 3);
    assert_eq!(broker.queue_len(Q), 0);
}
