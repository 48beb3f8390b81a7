//! End-to-end flows over the TLS listener with a throwaway certificate.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use sbm::{
    ClientSocket, Message, ServerConfig, ServerSocket, TlsClientOptions, TlsServerOptions,
    TlsTransport, SERVER_ID,
};

/// Write a fresh self-signed certificate and key into `dir`.
fn self_signed_material(dir: &tempfile::TempDir) -> TlsServerOptions {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

    let cert_file: PathBuf = dir.path().join("cert.pem");
    let key_file: PathBuf = dir.path().join("key.pem");
    std::fs::write(&cert_file, certified.cert.pem()).unwrap();
    std::fs::write(&key_file, certified.key_pair.serialize_pem()).unwrap();

    TlsServerOptions {
        cert_file,
        key_file,
    }
}

#[tokio::test]
async fn tls_echo_round_trip_with_unverified_peer() {
    let dir = tempfile::tempdir().unwrap();
    let server = ServerSocket::new(ServerConfig::tls("127.0.0.1:0", self_signed_material(&dir)));
    server.on_client_connected(|client| async move {
        client.dispatcher().on_request("echo", |msg: Message| async move {
            let data = msg.data.clone().unwrap_or_default();
            Ok(Some(Message::from_reply(&msg, data)))
        });
    });
    let addr = server.start().await.unwrap();

    // Self-signed server certificate: the client must opt out of
    // verification to connect.
    let client = ClientSocket::new(Arc::new(TlsTransport::new(
        addr.to_string(),
        TlsClientOptions::insecure("localhost"),
    )));
    client.connect().await.unwrap();

    let request = Message::new("echo", json!("over tls"));
    let request_id = request.message_id;
    let reply = client.send_request(request).await.unwrap();

    assert_eq!(reply.reply_to, Some(request_id));
    assert_eq!(reply.data, Some(json!("over tls")));
    assert_eq!(reply.sender_id, SERVER_ID);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn secure_websocket_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let server = ServerSocket::new(ServerConfig::websocket_tls(
        "127.0.0.1:0",
        self_signed_material(&dir),
    ));
    server.on_client_connected(|client| async move {
        client.dispatcher().on_request("echo", |msg: Message| async move {
            let data = msg.data.clone().unwrap_or_default();
            Ok(Some(Message::from_reply(&msg, data)))
        });
    });
    let addr = server.start().await.unwrap();

    let client = ClientSocket::new(Arc::new(sbm::WsTransport::with_tls(
        format!("wss://{addr}/"),
        TlsClientOptions::insecure("localhost"),
    )));
    client.connect().await.unwrap();

    let reply = client
        .send_request(Message::new("echo", json!("over wss")))
        .await
        .unwrap();
    assert_eq!(reply.data, Some(json!("over wss")));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn tls_server_requires_certificate_material() {
    let options = TlsServerOptions {
        cert_file: PathBuf::from("/definitely/missing/cert.pem"),
        key_file: PathBuf::from("/definitely/missing/key.pem"),
    };
    let server = ServerSocket::new(ServerConfig::tls("127.0.0.1:0", options));
    assert!(server.start().await.is_err());
}

#[tokio::test]
async fn verifying_client_rejects_self_signed_server() {
    let dir = tempfile::tempdir().unwrap();
    let server = ServerSocket::new(ServerConfig::tls("127.0.0.1:0", self_signed_material(&dir)));
    let addr = server.start().await.unwrap();

    let client = ClientSocket::new(Arc::new(TlsTransport::new(
        addr.to_string(),
        TlsClientOptions::new("localhost"),
    )));
    // Verification failure is unrecoverable and must not burn retries.
    assert!(client.connect().await.is_err());

    server.shutdown().await;
}
