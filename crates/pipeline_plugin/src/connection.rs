//! TCP data plane between neighbouring stages.
//!
//! Every frame is length delimited and starts with a kind byte followed by the
//! UTF-8 payload:
//!
//! * `0` data
//! * `1` data, the sender waits for an acknowledgement
//! * `2` acknowledgement, empty payload
//!
//! A bound pull side accepts any number of producers and merges them. A bound
//! push side serves the most recently connected consumer. Connecting sides
//! retry until the peer shows up or the stage is cancelled.

use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::{
    codec::{Framed, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::{message::PeerConnectionInformation, plugin::PluginError};

pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(100);

type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

// -----------------------------------------------------------------------------
// Frames
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    DataAckRequested,
    Ack,
}

impl FrameKind {
    fn as_byte(self) -> u8 {
        match self {
            FrameKind::Data => 0,
            FrameKind::DataAckRequested => 1,
            FrameKind::Ack => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FrameKind::Data),
            1 => Some(FrameKind::DataAckRequested),
            2 => Some(FrameKind::Ack),
            _ => None,
        }
    }
}

pub fn encode_frame(kind: FrameKind, payload: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_u8(kind.as_byte());
    buf.put_slice(payload.as_bytes());
    buf.freeze()
}

pub fn decode_frame(frame: BytesMut) -> Result<(FrameKind, String), PluginError> {
    let Some((&first, rest)) = frame.split_first() else {
        return Err(PluginError::Protocol("empty frame".into()));
    };
    let kind = FrameKind::from_byte(first)
        .ok_or_else(|| PluginError::Protocol(format!("unknown frame kind {first}")))?;
    let payload = std::str::from_utf8(rest)
        .map_err(|e| PluginError::Protocol(format!("payload is not UTF-8: {e}")))?;
    Ok((kind, payload.to_string()))
}

/// Accepts both `host:port` and `tcp://host:port`.
pub fn normalize_address(address: &str) -> &str {
    address.strip_prefix("tcp://").unwrap_or(address)
}

// -----------------------------------------------------------------------------
// Channel traits
// -----------------------------------------------------------------------------

#[async_trait]
pub trait Inbound: Send {
    /// Next message, `Ok(None)` once the upstream has finished.
    async fn pull(&mut self) -> Result<Option<String>, PluginError>;
}

#[async_trait]
pub trait Outbound: Send {
    async fn push(&mut self, message: String) -> Result<(), PluginError>;
}

#[async_trait]
impl Inbound for mpsc::Receiver<String> {
    async fn pull(&mut self) -> Result<Option<String>, PluginError> {
        Ok(self.recv().await)
    }
}

#[async_trait]
impl Outbound for mpsc::Sender<String> {
    async fn push(&mut self, message: String) -> Result<(), PluginError> {
        self.send(message)
            .await
            .map_err(|_| PluginError::Closed("receiver dropped".into()))
    }
}

// -----------------------------------------------------------------------------
// Connect helpers
// -----------------------------------------------------------------------------

/// Connects to `address`, retrying every [`RECONNECT_INTERVAL`] until it works
/// or `token` is cancelled.
pub async fn connect_with_retry(
    address: &str,
    token: &CancellationToken,
) -> Result<TcpStream, PluginError> {
    let address = normalize_address(address);
    let mut attempts = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Err(PluginError::Closed(format!("cancelled while connecting to {address}")));
            }
            result = TcpStream::connect(address) => match result {
                Ok(stream) => {
                    debug!(address, attempts, "connected");
                    return Ok(stream);
                }
                Err(e) => {
                    attempts += 1;
                    if attempts % 50 == 1 {
                        debug!(address, error = %e, "peer not reachable yet, retrying");
                    }
                }
            }
        }
        tokio::select! {
            _ = token.cancelled() => {}
            _ = sleep(RECONNECT_INTERVAL) => {}
        }
    }
}

pub async fn bind(address: &str) -> Result<TcpListener, PluginError> {
    let address = normalize_address(address);
    TcpListener::bind(address).await.map_err(|e| {
        PluginError::Transport(std::io::Error::new(
            e.kind(),
            format!("cannot bind {address}: {e}"),
        ))
    })
}

async fn send_or_cancel<T>(tx: &mpsc::Sender<T>, item: T, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

// -----------------------------------------------------------------------------
// Pull side
// -----------------------------------------------------------------------------

struct Delivery {
    payload: String,
    ack: Option<oneshot::Sender<()>>,
}

type DeliveryResult = Result<Delivery, PluginError>;

/// Receiving end of a stage. Frames are buffered up to `buffer_size` messages.
pub struct PipelinePull {
    rx: mpsc::Receiver<DeliveryResult>,
    pending_ack: Option<oneshot::Sender<()>>,
    local_addr: Option<SocketAddr>,
    acceptor: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
    token: CancellationToken,
}

impl PipelinePull {
    pub async fn open(
        peer: &PeerConnectionInformation,
        buffer_size: usize,
        token: CancellationToken,
    ) -> Result<Self, PluginError> {
        let address = peer
            .address
            .as_deref()
            .ok_or_else(|| PluginError::Configuration("pull side has no address".into()))?;
        let token = token.child_token();
        let (tx, rx) = mpsc::channel(buffer_size.max(1));

        if peer.is_bind {
            let listener = bind(address).await?;
            let local_addr = listener.local_addr().ok();
            info!(address, "accepting producers");
            let acceptor = token.child_token();
            let task = tokio::spawn(accept_producers(listener, tx, acceptor.clone(), token.clone()));
            Ok(Self {
                rx,
                pending_ack: None,
                local_addr,
                acceptor: Some(acceptor),
                tasks: vec![task],
                token,
            })
        } else {
            let stream = connect_with_retry(address, &token).await?;
            info!(address, "connected to producer");
            let peer = address.to_string();
            let task = tokio::spawn(read_frames(stream, tx, token.clone(), peer, true));
            Ok(Self {
                rx,
                pending_ack: None,
                local_addr: None,
                acceptor: None,
                tasks: vec![task],
                token,
            })
        }
    }

    /// Address the pull side is bound to, when it binds.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// For a bound pull side: cancelling the returned token stops accepting
    /// producers, after which the pull side ends once every connected producer
    /// has closed its connection.
    pub fn acceptor_token(&self) -> Option<CancellationToken> {
        self.acceptor.clone()
    }

    fn release_ack(&mut self) {
        if let Some(ack) = self.pending_ack.take() {
            let _ = ack.send(());
        }
    }
}

#[async_trait]
impl Inbound for PipelinePull {
    async fn pull(&mut self) -> Result<Option<String>, PluginError> {
        // asking for the next message acknowledges the previous one
        self.release_ack();
        match self.rx.recv().await {
            Some(Ok(delivery)) => {
                self.pending_ack = delivery.ack;
                Ok(Some(delivery.payload))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

impl Drop for PipelinePull {
    fn drop(&mut self) {
        self.token.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn accept_producers(
    listener: TcpListener,
    tx: mpsc::Sender<DeliveryResult>,
    acceptor: CancellationToken,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = acceptor.cancelled() => {
                debug!("no longer accepting producers");
                break;
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "producer connected");
                tokio::spawn(read_frames(
                    stream,
                    tx.clone(),
                    token.clone(),
                    peer.to_string(),
                    false,
                ));
            }
            Err(e) => warn!(error = %e, "failed to accept producer"),
        }
    }
}

/// Reads frames from one producer. With `propagate_errors` a broken connection
/// is reported to the stage; otherwise only that producer is dropped.
async fn read_frames(
    stream: TcpStream,
    tx: mpsc::Sender<DeliveryResult>,
    token: CancellationToken,
    peer: String,
    propagate_errors: bool,
) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = framed.next() => next,
        };
        let frame = match next {
            None => {
                debug!(peer, "producer closed the connection");
                break;
            }
            Some(Ok(frame)) => decode_frame(frame),
            Some(Err(e)) => Err(PluginError::Transport(e)),
        };
        match frame {
            Ok((FrameKind::Data, payload)) => {
                if !send_or_cancel(&tx, Ok(Delivery { payload, ack: None }), &token).await {
                    break;
                }
            }
            Ok((FrameKind::DataAckRequested, payload)) => {
                let (ack_tx, ack_rx) = oneshot::channel();
                let delivery = Delivery {
                    payload,
                    ack: Some(ack_tx),
                };
                if !send_or_cancel(&tx, Ok(delivery), &token).await {
                    break;
                }
                let acknowledged = tokio::select! {
                    biased;
                    _ = token.cancelled() => false,
                    ack = ack_rx => ack.is_ok(),
                };
                if !acknowledged {
                    break;
                }
                if let Err(e) = framed.send(encode_frame(FrameKind::Ack, "")).await {
                    warn!(peer, error = %e, "failed to acknowledge message");
                    break;
                }
            }
            Ok((FrameKind::Ack, _)) => warn!(peer, "ignoring acknowledgement on a pull channel"),
            Err(e) => {
                if propagate_errors {
                    let _ = send_or_cancel(&tx, Err(e), &token).await;
                } else {
                    warn!(peer, error = %e, "dropping producer");
                }
                break;
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Push side
// -----------------------------------------------------------------------------

enum PushTarget {
    Connected(FramedStream),
    Bound {
        consumers: mpsc::Receiver<FramedStream>,
        current: Option<FramedStream>,
        acceptor: JoinHandle<()>,
    },
}

/// Sending end of a stage.
pub struct PipelinePush {
    target: PushTarget,
    local_addr: Option<SocketAddr>,
    token: CancellationToken,
}

impl PipelinePush {
    pub async fn open(
        peer: &PeerConnectionInformation,
        token: CancellationToken,
    ) -> Result<Self, PluginError> {
        let address = peer
            .address
            .as_deref()
            .ok_or_else(|| PluginError::Configuration("push side has no address".into()))?;
        let token = token.child_token();

        if peer.is_bind {
            let listener = bind(address).await?;
            let local_addr = listener.local_addr().ok();
            info!(address, "waiting for consumers");
            let (tx, consumers) = mpsc::channel(8);
            let acceptor = tokio::spawn(accept_consumers(listener, tx, token.clone()));
            Ok(Self {
                target: PushTarget::Bound {
                    consumers,
                    current: None,
                    acceptor,
                },
                local_addr,
                token,
            })
        } else {
            let stream = connect_with_retry(address, &token).await?;
            info!(address, "connected to consumer");
            Ok(Self {
                target: PushTarget::Connected(Framed::new(stream, LengthDelimitedCodec::new())),
                local_addr: None,
                token,
            })
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl Outbound for PipelinePush {
    async fn push(&mut self, message: String) -> Result<(), PluginError> {
        let frame = encode_frame(FrameKind::Data, &message);
        match &mut self.target {
            PushTarget::Connected(framed) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Err(PluginError::Closed("stage cancelled".into())),
                    sent = framed.send(frame) => sent.map_err(PluginError::Transport),
                }
            }
            PushTarget::Bound {
                consumers, current, ..
            } => loop {
                while let Ok(newer) = consumers.try_recv() {
                    *current = Some(newer);
                }
                if current.is_none() {
                    let next = tokio::select! {
                        biased;
                        _ = self.token.cancelled() => None,
                        next = consumers.recv() => next,
                    };
                    match next {
                        Some(consumer) => *current = Some(consumer),
                        None => return Err(PluginError::Closed("stage cancelled".into())),
                    }
                }
                let Some(consumer) = current.as_mut() else {
                    continue;
                };
                match consumer.send(frame.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(error = %e, "consumer went away, waiting for another one");
                        *current = None;
                    }
                }
            },
        }
    }
}

impl Drop for PipelinePush {
    fn drop(&mut self) {
        self.token.cancel();
        if let PushTarget::Bound { acceptor, .. } = &self.target {
            acceptor.abort();
        }
    }
}

async fn accept_consumers(
    listener: TcpListener,
    tx: mpsc::Sender<FramedStream>,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "consumer connected");
                let framed = Framed::new(stream, LengthDelimitedCodec::new());
                if !send_or_cancel(&tx, framed, &token).await {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "failed to accept consumer"),
        }
    }
}

// -----------------------------------------------------------------------------
// Acknowledged push
// -----------------------------------------------------------------------------

/// One connection to a consumer that acknowledges every message it takes.
pub struct AckedPush {
    framed: FramedStream,
    peer: String,
}

impl AckedPush {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send_request(&mut self, message: &str) -> Result<(), PluginError> {
        self.framed
            .send(encode_frame(FrameKind::DataAckRequested, message))
            .await
            .map_err(PluginError::Transport)
    }

    pub async fn await_ack(&mut self, wait: Duration) -> Result<(), PluginError> {
        let next = timeout(wait, self.framed.next())
            .await
            .map_err(|_| PluginError::Timeout(wait.as_millis() as u64))?;
        match next {
            None => Err(PluginError::Closed(format!("{} disconnected", self.peer))),
            Some(Err(e)) => Err(PluginError::Transport(e)),
            Some(Ok(frame)) => match decode_frame(frame)? {
                (FrameKind::Ack, _) => Ok(()),
                (kind, _) => Err(PluginError::Protocol(format!(
                    "expected an acknowledgement from {}, got {kind:?}",
                    self.peer
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_kinds_survive_encoding() {
        let frame = encode_frame(FrameKind::DataAckRequested, "{\"a\":1}");
        assert_eq!(frame[0], 1);
        let (kind, payload) = decode_frame(BytesMut::from(&frame[..])).unwrap();
        assert_eq!(kind, FrameKind::DataAckRequested);
        assert_eq!(payload, "{\"a\":1}");
    }

    #[test]
    fn rejects_bad_frames() {
        assert!(decode_frame(BytesMut::new()).is_err());
        assert!(decode_frame(BytesMut::from(&[9u8, b'x'][..])).is_err());
        assert!(decode_frame(BytesMut::from(&[0u8, 0xff, 0xfe][..])).is_err());
    }

    #[test]
    fn tcp_scheme_is_optional() {
        assert_eq!(normalize_address("tcp://127.0.0.1:5000"), "127.0.0.1:5000");
        assert_eq!(normalize_address("localhost:5000"), "localhost:5000");
    }

    #[tokio::test]
    async fn connect_gives_up_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let err = connect_with_retry("127.0.0.1:1", &token).await.unwrap_err();
        assert!(matches!(err, PluginError::Closed(_)));
    }

    #[tokio::test]
    async fn bound_push_feeds_connecting_pull() {
        let token = CancellationToken::new();
        let mut push = PipelinePush::open(&PeerConnectionInformation::bind("127.0.0.1:0"), token.clone())
            .await
            .unwrap();
        let address = push.local_addr().unwrap().to_string();

        let mut pull = PipelinePull::open(&PeerConnectionInformation::connect(address), 16, token.clone())
            .await
            .unwrap();

        push.push("first".into()).await.unwrap();
        push.push("second".into()).await.unwrap();
        assert_eq!(pull.pull().await.unwrap().as_deref(), Some("first"));
        assert_eq!(pull.pull().await.unwrap().as_deref(), Some("second"));

        drop(push);
        token.cancel();
    }

    #[tokio::test]
    async fn connect_pull_ends_when_producer_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let producer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            framed.send(encode_frame(FrameKind::Data, "only")).await.unwrap();
        });

        let mut pull = PipelinePull::open(
            &PeerConnectionInformation::connect(address),
            4,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        producer.await.unwrap();
        assert_eq!(pull.pull().await.unwrap().as_deref(), Some("only"));
        assert_eq!(pull.pull().await.unwrap(), None);
    }

    #[tokio::test]
    async fn bound_pull_merges_producers() {
        let token = CancellationToken::new();
        let mut pull = PipelinePull::open(&PeerConnectionInformation::bind("127.0.0.1:0"), 16, token.clone())
            .await
            .unwrap();
        let address = pull.local_addr().unwrap().to_string();

        for name in ["a", "b"] {
            let mut push = PipelinePush::open(&PeerConnectionInformation::connect(address.clone()), token.clone())
                .await
                .unwrap();
            push.push(name.to_string()).await.unwrap();
        }

        let mut seen = vec![
            pull.pull().await.unwrap().unwrap(),
            pull.pull().await.unwrap().unwrap(),
        ];
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);
        token.cancel();
    }

    #[tokio::test]
    async fn bound_pull_ends_after_acceptor_stops_and_producers_leave() {
        let token = CancellationToken::new();
        let mut pull = PipelinePull::open(&PeerConnectionInformation::bind("127.0.0.1:0"), 16, token.clone())
            .await
            .unwrap();
        let address = pull.local_addr().unwrap().to_string();
        let acceptor = pull.acceptor_token().unwrap();

        let mut push = PipelinePush::open(&PeerConnectionInformation::connect(address), token.clone())
            .await
            .unwrap();
        push.push("head".into()).await.unwrap();
        assert_eq!(pull.pull().await.unwrap().as_deref(), Some("head"));

        push.push("tail".into()).await.unwrap();
        acceptor.cancel();
        drop(push);

        assert_eq!(pull.pull().await.unwrap().as_deref(), Some("tail"));
        let end = timeout(Duration::from_secs(5), pull.pull()).await.unwrap();
        assert_eq!(end.unwrap(), None);
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn ack_is_sent_when_the_next_message_is_requested() {
        let token = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let consumer_token = token.clone();
        let consumer = tokio::spawn(async move {
            let mut pull = PipelinePull::open(&PeerConnectionInformation::connect(address), 1, consumer_token)
                .await
                .unwrap();
            let first = pull.pull().await.unwrap();
            let second = pull.pull().await.unwrap();
            (first, second)
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut worker = AckedPush::new(stream);
        worker.send_request("one").await.unwrap();
        worker.send_request("two").await.unwrap();
        worker.await_ack(Duration::from_secs(5)).await.unwrap();

        let (first, second) = consumer.await.unwrap();
        assert_eq!(first.as_deref(), Some("one"));
        assert_eq!(second.as_deref(), Some("two"));
        token.cancel();
    }

    #[tokio::test]
    async fn missing_ack_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let _silent = tokio::spawn(async move {
            let stream = TcpStream::connect(address).await.unwrap();
            sleep(Duration::from_secs(2)).await;
            drop(stream);
        });
        let (stream, _) = listener.accept().await.unwrap();
        let mut worker = AckedPush::new(stream);
        worker.send_request("hello").await.unwrap();
        let err = worker.await_ack(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, PluginError::Timeout(50)));
    }
}
