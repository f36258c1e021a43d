use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pipeline_plugin::{
    ConnectionType, PeerConnectionInformation, PluginError, PluginRegistration, RegistrationReply,
    RegistrationResponse,
    manager_client::{PluginManagerConnection, TcpPluginManagerConnection},
    registration::{Registrar, serve_registrations},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
};

struct OnlyKnown;

#[async_trait]
impl Registrar for OnlyKnown {
    async fn register(&self, request: PluginRegistration) -> RegistrationResponse {
        if request.id != "known" {
            return RegistrationResponse::rejected(format!("unknown plugin `{}`", request.id));
        }
        RegistrationResponse::Accepted(RegistrationReply {
            id: request.id,
            kind: request.kind,
            peer: PeerConnectionInformation::connect("127.0.0.1:9000"),
        })
    }
}

async fn start() -> (String, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let token = CancellationToken::new();
    tokio::spawn(serve_registrations(listener, Arc::new(OnlyKnown), token.clone()));
    (address, token)
}

#[tokio::test]
async fn client_receives_peer_information() {
    let (address, token) = start().await;
    let client = TcpPluginManagerConnection::new(format!("tcp://{address}"));
    let peer = client
        .request_config(&PluginRegistration::new("known", ConnectionType::Pull))
        .await
        .unwrap();
    assert_eq!(peer, PeerConnectionInformation::connect("127.0.0.1:9000"));

    let err = client
        .request_config(&PluginRegistration::new("stranger", ConnectionType::Push))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Registration(msg) if msg.contains("stranger")));
    token.cancel();
}

#[tokio::test]
async fn malformed_lines_get_an_error_reply() {
    let (address, token) = start().await;
    let stream = TcpStream::connect(address).await.unwrap();
    let mut framed = Framed::new(stream, LinesCodec::new());

    framed.send("{\"id\": \"known\"}").await.unwrap();
    let reply: RegistrationResponse =
        serde_json::from_str(&framed.next().await.unwrap().unwrap()).unwrap();
    assert!(matches!(reply, RegistrationResponse::Rejected { error } if error.starts_with("Invalid Request")));

    // the connection stays usable after a bad request
    framed.send("{\"id\": \"known\", \"type\": \"push\"}").await.unwrap();
    let reply: RegistrationResponse =
        serde_json::from_str(&framed.next().await.unwrap().unwrap()).unwrap();
    assert!(matches!(reply, RegistrationResponse::Accepted(r) if r.kind == ConnectionType::Push));
    token.cancel();
}

#[tokio::test]
async fn unreachable_manager_fails_after_retries() {
    let client = TcpPluginManagerConnection::new("127.0.0.1:1")
        .with_retries(2, std::time::Duration::from_millis(10));
    let err = client
        .request_config(&PluginRegistration::new("known", ConnectionType::Pull))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Transport(_)));
}

#[tokio::test]
async fn silent_manager_times_out_and_is_retried() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = accepted.clone();
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            held.push(stream);
        }
    });

    let client = TcpPluginManagerConnection::new(address)
        .with_retries(1, std::time::Duration::from_millis(10))
        .with_request_timeout(std::time::Duration::from_millis(100));
    let err = client
        .request_config(&PluginRegistration::new("known", ConnectionType::Pull))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Timeout(100)));
    assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 2);
    silent.abort();
}
