//! A single multiplexed socket to one cluster node (spec §4.B): owns the stream, serializes
//! writes, and correlates out-of-order responses by opaque.
//!
//! Grounded in two teacher pieces that each cover half of this: `cmap/establish.rs`'s
//! connect-then-handshake split (`make_stream` then a HELLO/auth sequence, surfaced here as
//! [`Connection::open`]'s call into [`run_handshake`]), and `cmap/manager.rs`'s
//! request-enum-plus-mpsc-inbox actor shape (here, [`ConnectionMessage`] and
//! [`ConnectionActor::run`]). The teacher pools many short-lived connections per server and reads
//! one response per write; this crate keeps a single long-lived connection per node and must
//! correlate many in-flight requests against out-of-order replies, so the reader runs as its own
//! task (cancellation-unsafe partial reads never compete with the inbox in a `select!`) and hands
//! complete frames to the actor over a channel.

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::auth;
use crate::error::{Error, ErrorKind, KvStatus, Result};
use crate::options::Credential;
use crate::runtime::{self, stream::AsyncStream};
pub(crate) use crate::runtime::stream::StreamOptions;
use crate::wire::frame::{Datatype, KvFrame, HEADER_LEN};
use crate::wire::opcode::Opcode;

/// Memcached-binary-protocol HELLO feature codes this crate negotiates. Values match the
/// documented wire protocol, not anything invented for this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
enum HelloFeature {
    MutationSeqno = 0x04,
    Xattr = 0x06,
    Xerror = 0x07,
    SelectBucket = 0x08,
    Json = 0x0b,
    Duplex = 0x0c,
    ClustermapChangeNotification = 0x0d,
    AltRequestSupport = 0x11,
    SyncReplication = 0x12,
    Collections = 0x13,
}

/// What a connection's handshake negotiated, needed by the bucket session and the per-command
/// encoders (spec §4.B, §4.A `EncodeContext`).
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct HandshakeOutcome {
    pub(crate) collections_enabled: bool,
    pub(crate) durability_enabled: bool,
    pub(crate) mutation_tokens_enabled: bool,
    pub(crate) clustermap_notification_enabled: bool,
}

/// Everything [`Connection::open`] needs to establish and authenticate one socket.
#[derive(Clone)]
pub(crate) struct ConnectOptions {
    pub(crate) stream: StreamOptions,
    pub(crate) credential: Credential,
    /// Bucket to `SELECT_BUCKET` into once authenticated, if any (a cluster-level connection,
    /// used only for management/bootstrap traffic, selects none).
    pub(crate) bucket: Option<String>,
    pub(crate) enable_mutation_tokens: bool,
    pub(crate) enable_clustermap_notification: bool,
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, frame: &KvFrame) -> Result<()> {
    writer.write_all(&frame.encode()).await?;
    Ok(())
}

async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<KvFrame> {
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = KvFrame::decode_header(&header_buf)?;
    let mut body = vec![0u8; header.total_body_len as usize];
    reader.read_exact(&mut body).await?;
    KvFrame::decode_body(header, body, 0)
}

fn hello_request(features: &[HelloFeature]) -> KvFrame {
    let mut value = Vec::with_capacity(features.len() * 2);
    for feature in features {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, *feature as u16);
        value.extend_from_slice(&buf);
    }
    KvFrame::request(
        Opcode::Hello as u8,
        0,
        0,
        0,
        Datatype::RAW,
        Vec::new(),
        Vec::new(),
        b"clusterkv".to_vec(),
        value,
    )
}

fn no_body_request(opcode: Opcode, key: Vec<u8>, value: Vec<u8>) -> KvFrame {
    KvFrame::request(opcode as u8, 0, 0, 0, Datatype::RAW, Vec::new(), Vec::new(), key, value)
}

/// Runs HELLO, SASL, and (if requested) SELECT_BUCKET sequentially over `stream`, before any
/// concurrent request traffic exists. Spec §4.B.
async fn run_handshake(stream: &mut AsyncStream, options: &ConnectOptions) -> Result<HandshakeOutcome> {
    let mut requested = vec![
        HelloFeature::Xattr,
        HelloFeature::Xerror,
        HelloFeature::SelectBucket,
        HelloFeature::Json,
        HelloFeature::Duplex,
        HelloFeature::AltRequestSupport,
        HelloFeature::SyncReplication,
        HelloFeature::Collections,
    ];
    if options.enable_mutation_tokens {
        requested.push(HelloFeature::MutationSeqno);
    }
    if options.enable_clustermap_notification {
        requested.push(HelloFeature::ClustermapChangeNotification);
    }

    write_frame(stream, &hello_request(&requested)).await?;
    let hello_response = read_frame(stream).await?;
    if !hello_response.status().is_success() {
        return Err(Error::from_kv_status(hello_response.status()));
    }
    let negotiated: Vec<u16> = hello_response
        .value
        .chunks_exact(2)
        .map(BigEndian::read_u16)
        .collect();
    let has = |feature: HelloFeature| negotiated.contains(&(feature as u16));

    write_frame(stream, &no_body_request(Opcode::SaslListMechs, Vec::new(), Vec::new())).await?;
    let mechs_response = read_frame(stream).await?;
    if !mechs_response.status().is_success() {
        return Err(Error::from_kv_status(mechs_response.status()));
    }
    let advertised = String::from_utf8_lossy(&mechs_response.value).into_owned();
    let mechanism = auth::Mechanism::select(&advertised)?;

    match mechanism {
        auth::Mechanism::Plain => {
            let payload = auth::plain_payload(&options.credential.username, &options.credential.password);
            let frame = no_body_request(Opcode::SaslAuth, mechanism.wire_name().as_bytes().to_vec(), payload);
            write_frame(stream, &frame).await?;
            let response = read_frame(stream).await?;
            if !response.status().is_success() {
                return Err(Error::from_kv_status(response.status()));
            }
        }
        auth::Mechanism::ScramSha1 | auth::Mechanism::ScramSha256 => {
            let conversation =
                auth::ScramConversation::new(mechanism, &options.credential.username, &options.credential.password)?;
            let first_frame = no_body_request(
                Opcode::SaslAuth,
                mechanism.wire_name().as_bytes().to_vec(),
                conversation.client_first(),
            );
            write_frame(stream, &first_frame).await?;
            let server_first = read_frame(stream).await?;

            if server_first.status().is_auth_continue() {
                let (client_final_payload, expected_signature) = conversation.client_final(&server_first.value)?;
                let step_frame = no_body_request(
                    Opcode::SaslStep,
                    mechanism.wire_name().as_bytes().to_vec(),
                    client_final_payload,
                );
                write_frame(stream, &step_frame).await?;
                let final_response = read_frame(stream).await?;
                if !final_response.status().is_success() {
                    return Err(Error::from_kv_status(final_response.status()));
                }
                conversation.verify_server_final(&final_response.value, &expected_signature)?;
            } else if !server_first.status().is_success() {
                return Err(Error::from_kv_status(server_first.status()));
            }
        }
    }

    if let Some(bucket) = &options.bucket {
        let frame = no_body_request(Opcode::SelectBucket, bucket.as_bytes().to_vec(), Vec::new());
        write_frame(stream, &frame).await?;
        let response = read_frame(stream).await?;
        if !response.status().is_success() {
            return Err(if response.status() == KvStatus::KeyNotFound {
                Error::new(ErrorKind::BucketNotFound { name: bucket.clone() })
            } else {
                Error::from_kv_status(response.status())
            });
        }
    }

    Ok(HandshakeOutcome {
        collections_enabled: has(HelloFeature::Collections),
        durability_enabled: has(HelloFeature::SyncReplication),
        mutation_tokens_enabled: has(HelloFeature::MutationSeqno),
        clustermap_notification_enabled: has(HelloFeature::ClustermapChangeNotification),
    })
}

enum ConnectionMessage {
    Dispatch {
        frame: KvFrame,
        reply: oneshot::Sender<Result<KvFrame>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to a running connection actor. Cheaply [`Clone`]-able; the actor task runs until every
/// clone is dropped or [`Self::close`] is called.
#[derive(Clone)]
pub(crate) struct Connection {
    sender: mpsc::Sender<ConnectionMessage>,
}

impl Connection {
    /// Connects, runs the handshake, and spawns the reader and actor tasks. The returned receiver
    /// yields frames the server pushed unsolicited (opaque `0`): cluster-map-change
    /// notifications, in this crate's vocabulary (spec §4.C).
    pub(crate) async fn open(
        options: ConnectOptions,
    ) -> Result<(Self, HandshakeOutcome, mpsc::UnboundedReceiver<KvFrame>)> {
        let mut stream = AsyncStream::connect(options.stream.clone()).await?;
        let outcome = run_handshake(&mut stream, &options).await?;

        let (read_half, write_half) = tokio::io::split(stream);
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let reader_handle = runtime::spawn(read_loop(read_half, frame_tx));

        let (inbox_tx, inbox_rx) = mpsc::channel(256);
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        let actor = ConnectionActor {
            write_half,
            frame_rx,
            inbox: inbox_rx,
            pending: HashMap::new(),
            push_tx,
            reader_handle,
        };
        runtime::spawn(actor.run());

        Ok((Self { sender: inbox_tx }, outcome, push_rx))
    }

    /// Sends `frame` and awaits the matching response by opaque. `frame.opaque` must already be
    /// set to a value unique among this connection's in-flight requests; the caller (the bucket
    /// session) owns opaque assignment since it is shared across every connection it manages.
    pub(crate) async fn dispatch(&self, frame: KvFrame) -> Result<KvFrame> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::Dispatch { frame, reply: reply_tx })
            .await
            .map_err(|_| Error::request_canceled())?;
        reply_rx.await.map_err(|_| Error::request_canceled())?
    }

    /// Gracefully drains in-flight requests (failing them with `request_canceled`) and stops the
    /// actor and reader tasks. Waits for the actor to confirm it has stopped.
    pub(crate) async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.sender.send(ConnectionMessage::Shutdown { ack: ack_tx }).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn read_loop(mut read_half: ReadHalf<AsyncStream>, frame_tx: mpsc::Sender<Result<KvFrame>>) {
    loop {
        let frame = read_frame(&mut read_half).await;
        let is_err = frame.is_err();
        if frame_tx.send(frame).await.is_err() || is_err {
            return;
        }
    }
}

struct ConnectionActor {
    write_half: WriteHalf<AsyncStream>,
    frame_rx: mpsc::Receiver<Result<KvFrame>>,
    inbox: mpsc::Receiver<ConnectionMessage>,
    pending: HashMap<u32, oneshot::Sender<Result<KvFrame>>>,
    push_tx: mpsc::UnboundedSender<KvFrame>,
    reader_handle: runtime::AsyncJoinHandle<()>,
}

impl ConnectionActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.inbox.recv() => {
                    match msg {
                        Some(ConnectionMessage::Dispatch { frame, reply }) => {
                            let opaque = frame.opaque;
                            if let Err(e) = self.write_half.write_all(&frame.encode()).await {
                                let _ = reply.send(Err(Error::from(e)));
                                self.fail_all_pending(Error::request_canceled());
                                break;
                            }
                            self.pending.insert(opaque, reply);
                        }
                        Some(ConnectionMessage::Shutdown { ack }) => {
                            self.fail_all_pending(Error::request_canceled());
                            let _ = ack.send(());
                            break;
                        }
                        None => {
                            self.fail_all_pending(Error::request_canceled());
                            break;
                        }
                    }
                }
                incoming = self.frame_rx.recv() => {
                    match incoming {
                        Some(Ok(frame)) => self.route_incoming(frame),
                        Some(Err(e)) => {
                            self.fail_all_pending(e);
                            break;
                        }
                        None => {
                            self.fail_all_pending(Error::internal("connection reader task ended unexpectedly"));
                            break;
                        }
                    }
                }
            }
        }
        self.reader_handle.abort();
    }

    fn route_incoming(&mut self, frame: KvFrame) {
        if frame.opaque == 0 {
            let _ = self.push_tx.send(frame);
            return;
        }
        if let Some(reply) = self.pending.remove(&frame.opaque) {
            let _ = reply.send(Ok(frame));
            return;
        }
        // A response to a request this connection already gave up on (deadline elapsed, retry
        // re-dispatched elsewhere).
        debug!(opaque = frame.opaque, "dropping response for unknown opaque");
    }

    fn fail_all_pending(&mut self, err: Error) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hello_request_encodes_feature_codes_as_big_endian_u16s() {
        let frame = hello_request(&[HelloFeature::Collections, HelloFeature::Json]);
        assert_eq!(frame.value, vec![0x00, 0x13, 0x00, 0x0b]);
        assert_eq!(frame.key, b"clusterkv");
    }

    #[test]
    fn no_body_request_carries_key_and_value_with_empty_extras() {
        let frame = no_body_request(Opcode::SaslAuth, b"PLAIN".to_vec(), b"\0u\0p".to_vec());
        assert_eq!(frame.key, b"PLAIN");
        assert_eq!(frame.value, b"\0u\0p");
        assert!(frame.extras.is_empty());
    }
}
