mod common;

use common::{sender_config, shared_key_pem, MockCloud};
use crypto_replicator::{DeliverySender, EncryptedEnvelope, HybridEncryptor, Operation};
use serde_json::json;

fn envelope(table: &str, n: u64) -> EncryptedEnvelope {
    let (public_pem, _) = shared_key_pem();
    HybridEncryptor::from_public_pem("key-delivery", public_pem)
        .unwrap()
        .encrypt(&json!({"id": n}), table, Operation::Insert)
        .unwrap()
}

#[tokio::test]
async fn test_posts_each_envelope_with_bearer_token() {
    let cloud = MockCloud::start(&[]).await;
    let mut sender = DeliverySender::new(sender_config(Some(cloud.url()), 2, 3));
    sender.connect().unwrap();

    let first = envelope("orders", 1);
    let second = envelope("payments", 2);
    assert!(sender.send(first.clone()).await.unwrap().is_none());
    let result = sender.send(second.clone()).await.unwrap().unwrap();

    assert_eq!(result.sent_count, 2);
    assert!(result.success());

    let requests = cloud.requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/envelopes");
        assert_eq!(request.header("authorization"), Some("Bearer test-token"));
        assert_eq!(request.header("content-type"), Some("application/json"));
    }

    // FIFO order, byte-exact envelopes
    assert_eq!(EncryptedEnvelope::deserialize(&requests[0].body).unwrap(), first);
    assert_eq!(EncryptedEnvelope::deserialize(&requests[1].body).unwrap(), second);
    assert_ne!(
        requests[0].header("idempotency-key"),
        requests[1].header("idempotency-key")
    );
}

#[tokio::test]
async fn test_trailing_slash_in_base_url() {
    let cloud = MockCloud::start(&[]).await;
    let mut sender = DeliverySender::new(sender_config(Some(format!("{}/", cloud.url())), 1, 0));
    sender.connect().unwrap();

    sender.send(envelope("orders", 1)).await.unwrap();
    assert_eq!(cloud.requests()[0].path, "/envelopes");
}

#[tokio::test]
async fn test_retries_server_error_then_succeeds() {
    let cloud = MockCloud::start(&[503, 429]).await;
    let mut sender = DeliverySender::new(sender_config(Some(cloud.url()), 10, 3));
    sender.connect().unwrap();

    sender.send(envelope("orders", 1)).await.unwrap();
    let result = sender.flush().await.unwrap();

    assert_eq!(result.sent_count, 1);
    assert_eq!(result.failed_count, 0);

    let requests = cloud.requests();
    assert_eq!(requests.len(), 3);
    let key = requests[0].header("idempotency-key").unwrap();
    assert!(requests.iter().all(|r| r.header("idempotency-key") == Some(key)));
    assert!(requests.windows(2).all(|w| w[0].body == w[1].body));
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let cloud = MockCloud::start(&[400]).await;
    let mut sender = DeliverySender::new(sender_config(Some(cloud.url()), 10, 3));
    sender.connect().unwrap();

    sender.send(envelope("orders", 1)).await.unwrap();
    sender.send(envelope("orders", 2)).await.unwrap();
    let result = sender.flush().await.unwrap();

    // the first envelope fails outright, the second still goes out
    assert_eq!(result.sent_count, 1);
    assert_eq!(result.failed_count, 1);
    assert!(result.errors[0].contains("400"), "{:?}", result.errors);
    assert_eq!(cloud.requests().len(), 2);
    assert_eq!(sender.buffered(), 0);
}

#[tokio::test]
async fn test_exhausted_retries_drop_envelope() {
    let cloud = MockCloud::start(&[500, 502, 504]).await;
    let mut sender = DeliverySender::new(sender_config(Some(cloud.url()), 10, 2));
    sender.connect().unwrap();

    sender.send(envelope("orders", 1)).await.unwrap();
    let result = sender.flush().await.unwrap();

    assert_eq!(result.sent_count, 0);
    assert_eq!(result.failed_count, 1);
    assert_eq!(cloud.requests().len(), 3);
    assert_eq!(sender.buffered(), 0);
    assert_eq!(sender.stats().failed, 1);

    // nothing is re-queued
    assert_eq!(sender.flush().await.unwrap().total(), 0);
    assert_eq!(cloud.requests().len(), 3);
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_after_retries() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let mut sender = DeliverySender::new(sender_config(Some(url), 10, 1));
    sender.connect().unwrap();
    sender.send(envelope("orders", 1)).await.unwrap();

    let result = sender.flush().await.unwrap();
    assert_eq!(result.failed_count, 1);
    assert!(result.errors[0].contains("request failed"), "{:?}", result.errors);
}

#[tokio::test]
async fn test_disconnect_flushes_remaining() {
    let cloud = MockCloud::start(&[]).await;
    let mut sender = DeliverySender::new(sender_config(Some(cloud.url()), 100, 0));
    sender.connect().unwrap();

    for n in 0..3 {
        sender.send(envelope("orders", n)).await.unwrap();
    }
    assert!(cloud.requests().is_empty());

    let result = sender.disconnect().await.unwrap();
    assert_eq!(result.sent_count, 3);
    assert_eq!(cloud.requests().len(), 3);
    assert!(!sender.is_connected());
}
