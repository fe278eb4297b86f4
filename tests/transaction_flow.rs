//! End-to-end transaction scenarios against a mocked peer
//! (`8. TESTABLE PROPERTIES`, scenarios S1-S4, S6).

use std::collections::HashMap;

use s2s_client::{Client, ClientConfig, DataPacket, PortRef, RemoteClusterConfig, S2SError, TransactionState};
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Echoes the CRC32-IEEE of the request body back as decimal text, exactly
/// as the real server computes its side of the checksum protocol.
struct EchoChecksum;

impl Respond for EchoChecksum {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&request.body);
        ResponseTemplate::new(202).set_body_string(hasher.finalize().to_string())
    }
}

/// Always returns a checksum that cannot match the client's (S2).
struct WrongChecksum;

impl Respond for WrongChecksum {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        ResponseTemplate::new(202).set_body_string("1")
    }
}

fn commit_response() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "flowFileSent": 1,
        "durationMillis": 5,
        "message": serde_json::Value::Null,
        "shouldBackoff": false
    }))
}

async fn mount_peers(server: &MockServer, peers: Vec<(&MockServer, u64)>) {
    let body = json!({
        "peers": peers
            .into_iter()
            .map(|(s, count)| {
                let uri = Url::parse(&s.uri()).unwrap();
                json!({
                    "hostname": uri.host_str().unwrap(),
                    "port": uri.port().unwrap(),
                    "secure": false,
                    "flowFileCount": count,
                })
            })
            .collect::<Vec<_>>(),
    });
    Mock::given(method("GET"))
        .and(path("/site-to-site/peers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_create_transaction(server: &MockServer, port_id: &str, tx_path: &str, ttl_secs: u64) {
    let location = format!("{}{}", server.uri(), tx_path);
    Mock::given(method("POST"))
        .and(path(format!("/data-transfer/input-ports/{port_id}/transactions")))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Location", location.as_str())
                .insert_header("Server-Side-Transaction-Ttl", ttl_secs.to_string().as_str()),
        )
        .mount(server)
        .await;
}

fn single_cluster_config(server: &MockServer, port: PortRef) -> ClientConfig {
    let cluster = RemoteClusterConfig::single(Url::parse(&server.uri()).unwrap()).unwrap();
    ClientConfig::new(vec![cluster], port).unwrap()
}

/// S1: happy path, single packet, checksum matches, transaction completes.
#[tokio::test]
async fn s1_happy_path_single_packet() {
    let server = MockServer::start().await;
    mount_peers(&server, vec![(&server, 0)]).await;

    let tx_path = "/data-transfer/input-ports/p1/transactions/42";
    mount_create_transaction(&server, "p1", tx_path, 30).await;

    Mock::given(method("POST"))
        .and(path(format!("{tx_path}/flow-files")))
        .respond_with(EchoChecksum)
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path(tx_path))
        .respond_with(commit_response())
        .mount(&server)
        .await;

    let config = single_cluster_config(&server, PortRef::Id("p1".to_owned()));
    let client = Client::new(config).unwrap();
    let mut tx = client.create_transaction().await.unwrap();

    let mut attrs = HashMap::new();
    attrs.insert("filename".to_owned(), "a".to_owned());
    tx.send_data(DataPacket::new(attrs, b"hi".as_ref())).await.unwrap();
    assert_eq!(tx.state(), TransactionState::DataExchanged);

    let result = tx.confirm_and_complete().await.unwrap();
    assert_eq!(result.packets_transferred, 1);
    assert_eq!(tx.state(), TransactionState::Completed);
}

/// S1 variant: confirming with zero packets sent is a legal empty batch.
#[tokio::test]
async fn confirm_with_zero_packets_confirms_an_empty_batch() {
    let server = MockServer::start().await;
    mount_peers(&server, vec![(&server, 0)]).await;
    let tx_path = "/data-transfer/input-ports/p1/transactions/1";
    mount_create_transaction(&server, "p1", tx_path, 30).await;

    Mock::given(method("POST"))
        .and(path(format!("{tx_path}/flow-files")))
        .respond_with(EchoChecksum)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(tx_path))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({
                "flowFileSent": 0, "durationMillis": 1, "message": serde_json::Value::Null, "shouldBackoff": false
            })),
        )
        .mount(&server)
        .await;

    let config = single_cluster_config(&server, PortRef::Id("p1".to_owned()));
    let client = Client::new(config).unwrap();
    let mut tx = client.create_transaction().await.unwrap();

    let result = tx.confirm_and_complete().await.unwrap();
    assert_eq!(result.packets_transferred, 0);
    assert_eq!(tx.state(), TransactionState::Completed);
}

/// S2: server checksum differs from the client's; transaction ends ERROR
/// with `checksumMismatch`, having issued `commit(BAD_CHECKSUM)`.
#[tokio::test]
async fn s2_checksum_mismatch_ends_in_error() {
    let server = MockServer::start().await;
    mount_peers(&server, vec![(&server, 0)]).await;
    let tx_path = "/data-transfer/input-ports/p1/transactions/7";
    mount_create_transaction(&server, "p1", tx_path, 30).await;

    Mock::given(method("POST"))
        .and(path(format!("{tx_path}/flow-files")))
        .respond_with(WrongChecksum)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(tx_path))
        .respond_with(commit_response())
        .mount(&server)
        .await;

    let config = single_cluster_config(&server, PortRef::Id("p1".to_owned()));
    let client = Client::new(config).unwrap();
    let mut tx = client.create_transaction().await.unwrap();

    tx.send_data(DataPacket::from_string("payload")).await.unwrap();
    let err = tx.confirm_and_complete().await.unwrap_err();
    assert!(matches!(err, S2SError::ChecksumMismatch { .. }));
    assert_eq!(tx.state(), TransactionState::Error);
}

/// S3: the first-chosen peer's `createTransaction` returns 503; the pool
/// marks it failed and the facade retries against the second peer.
#[tokio::test]
async fn s3_peer_failover_on_create_transaction() {
    let p1 = MockServer::start().await;
    let p2 = MockServer::start().await;
    // p1 has the lower flowFileCount so selection deterministically tries it first.
    mount_peers(&p1, vec![(&p1, 0), (&p2, 5)]).await;

    Mock::given(method("POST"))
        .and(path("/data-transfer/input-ports/p1/transactions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&p1)
        .await;

    let tx_path = "/data-transfer/input-ports/p1/transactions/99";
    mount_create_transaction(&p2, "p1", tx_path, 30).await;
    Mock::given(method("POST"))
        .and(path(format!("{tx_path}/flow-files")))
        .respond_with(EchoChecksum)
        .mount(&p2)
        .await;
    Mock::given(method("DELETE"))
        .and(path(tx_path))
        .respond_with(commit_response())
        .mount(&p2)
        .await;

    let cluster = RemoteClusterConfig::single(Url::parse(&p1.uri()).unwrap()).unwrap();
    let config = ClientConfig::new(vec![cluster], PortRef::Id("p1".to_owned())).unwrap();
    let client = Client::new(config).unwrap();

    let mut tx = client.create_transaction().await.unwrap();
    let p2_uri = Url::parse(&p2.uri()).unwrap();
    assert_eq!(tx.peer().host(), p2_uri.host_str().unwrap());
    assert_eq!(tx.peer().port(), p2_uri.port());

    let result = tx.confirm_and_complete().await.unwrap();
    assert_eq!(result.packets_transferred, 1);
}

/// S4: canceling mid-stream issues `commit(CANCEL)` and further `sendData`
/// calls fail with `illegalState`.
#[tokio::test]
async fn s4_cancel_mid_stream() {
    let server = MockServer::start().await;
    mount_peers(&server, vec![(&server, 0)]).await;
    let tx_path = "/data-transfer/input-ports/p1/transactions/3";
    mount_create_transaction(&server, "p1", tx_path, 30).await;

    Mock::given(method("POST"))
        .and(path(format!("{tx_path}/flow-files")))
        .respond_with(EchoChecksum)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(tx_path))
        .respond_with(commit_response())
        .mount(&server)
        .await;

    let config = single_cluster_config(&server, PortRef::Id("p1".to_owned()));
    let client = Client::new(config).unwrap();
    let mut tx = client.create_transaction().await.unwrap();

    for i in 0..3 {
        tx.send_data(DataPacket::from_string(format!("packet-{i}"))).await.unwrap();
    }
    assert_eq!(tx.state(), TransactionState::DataExchanged);

    tx.cancel().await;
    assert_eq!(tx.state(), TransactionState::Canceled);

    let err = tx.send_data(DataPacket::from_string("late")).await.unwrap_err();
    assert!(matches!(err, S2SError::IllegalState { operation: "sendData", .. }));
}

/// S6: with only `portName` configured, the facade resolves and caches the
/// `portId` via `GET /site-to-site` before creating a transaction.
#[tokio::test]
async fn s6_resolves_port_id_from_port_name() {
    let server = MockServer::start().await;
    mount_peers(&server, vec![(&server, 0)]).await;

    Mock::given(method("GET"))
        .and(path("/site-to-site"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "inputPorts": [{"id": "xyz", "name": "in1"}]
        })))
        .mount(&server)
        .await;

    let tx_path = "/data-transfer/input-ports/xyz/transactions/1";
    mount_create_transaction(&server, "xyz", tx_path, 30).await;
    Mock::given(method("POST"))
        .and(path(format!("{tx_path}/flow-files")))
        .respond_with(EchoChecksum)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(tx_path))
        .respond_with(commit_response())
        .mount(&server)
        .await;

    let config = single_cluster_config(&server, PortRef::Name("in1".to_owned()));
    let client = Client::new(config).unwrap();
    let mut tx = client.create_transaction().await.unwrap();
    assert_eq!(tx.port_id(), "xyz");

    tx.send_data(DataPacket::from_string("x")).await.unwrap();
    tx.confirm_and_complete().await.unwrap();
}

/// A `DataPacket` built from a real file-backed stream (`PayloadSource::Stream`)
/// round-trips through the encoder the same as an in-memory one.
#[tokio::test]
async fn sends_a_file_backed_stream_packet() {
    let server = MockServer::start().await;
    mount_peers(&server, vec![(&server, 0)]).await;
    let tx_path = "/data-transfer/input-ports/p1/transactions/5";
    mount_create_transaction(&server, "p1", tx_path, 30).await;

    Mock::given(method("POST"))
        .and(path(format!("{tx_path}/flow-files")))
        .respond_with(EchoChecksum)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(tx_path))
        .respond_with(commit_response())
        .mount(&server)
        .await;

    let payload = b"streamed from a real file on disk";
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, payload).unwrap();
    let reader = tokio::fs::File::open(file.path()).await.unwrap();

    let config = single_cluster_config(&server, PortRef::Id("p1".to_owned()));
    let client = Client::new(config).unwrap();
    let mut tx = client.create_transaction().await.unwrap();

    let mut attrs = HashMap::new();
    attrs.insert("filename".to_owned(), "from-disk.bin".to_owned());
    tx.send_data(DataPacket::from_stream(attrs, reader, payload.len() as u64))
        .await
        .unwrap();

    let result = tx.confirm_and_complete().await.unwrap();
    assert_eq!(result.packets_transferred, 1);
}
