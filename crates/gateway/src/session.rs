//! Per-connection session state and the frame-level pump core.
//!
//! The socket loop in `proxy.rs` stays thin: it reads raw bytes into
//! [`Session::ingest`], drains complete frames with [`Session::drain`],
//! writes out whatever [`Session::take_outgoing`] returns, and runs
//! [`Session::tick_encryption`] at the end of each iteration. Everything
//! protocol-shaped lives here, which also makes the whole handshake
//! drivable from plain unit tests.

use std::borrow::Cow;

use mcgate_proto::cipher::StreamCipher;
use mcgate_proto::codec;
use mcgate_proto::error::{ProtoError, Result};
use mcgate_proto::keys::{self, KeyBroker, SHARED_SECRET_LEN};
use mcgate_proto::packet::{
    Direction, EncryptionRequest, EncryptionResponse, Packet, PacketBody, PacketId, Phase,
    VarBytes,
};

use crate::trace::TraceWriter;

/// Frames logged per session before the rx log goes quiet.
const FRAME_TRACE_LIMIT: usize = 64;

/// Outputs of one PLAY-phase dispatch: packets continuing toward the peer
/// and packets turned back toward the originating side.
#[derive(Debug, Default)]
pub struct PacketQueues {
    pub forward: Vec<Packet>,
    pub retour: Vec<Packet>,
}

/// The registry hook for PLAY traffic. The default forwards untouched;
/// implementations may rewrite packets, drop them, or answer with synthetic
/// traffic on the retour queue.
pub trait Handler: Send {
    fn handle(&mut self, packet: Packet, queues: &mut PacketQueues) {
        queues.forward.push(packet);
    }
}

/// The default handler: splice everything through unchanged.
pub struct Forwarder;

impl Handler for Forwarder {}

/// An EncryptionResponse that has been rewritten but must not be forwarded
/// until the session-join call has completed, because the upstream verifies
/// the join before honoring the response.
#[derive(Debug)]
pub struct PendingJoin {
    /// The recomputed `serverId` digest for the join body.
    pub digest: String,
    /// The rewritten packet payload (id varint plus body), not yet framed.
    pub frame_body: Vec<u8>,
}

pub struct Session {
    phase: Phase,
    /// Compression threshold; negative means disabled.
    comptr: i32,
    broker: Option<KeyBroker>,
    server_id: String,
    client_secret: Option<[u8; SHARED_SECRET_LEN]>,
    response_pending: bool,
    response_done: bool,
    /// Set when the handshake completes; consumed by `tick_encryption` one
    /// pump iteration later so the final handshake frame leaves plaintext.
    enable_encryption: bool,
    encryption_active: bool,
    client_cipher: Option<StreamCipher>,
    server_cipher: Option<StreamCipher>,

    // decoded receive buffers, one per socket
    cs_rx: Vec<u8>,
    ms_rx: Vec<u8>,
    // plaintext transmit buffers; encrypted in place at flush time
    cs_tx: Vec<u8>,
    ms_tx: Vec<u8>,

    handler: Box<dyn Handler>,
    trace: Option<TraceWriter>,
    frames_logged: usize,
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            comptr: -1,
            broker: None,
            server_id: String::new(),
            client_secret: None,
            response_pending: false,
            response_done: false,
            enable_encryption: false,
            encryption_active: false,
            client_cipher: None,
            server_cipher: None,
            cs_rx: Vec::new(),
            ms_rx: Vec::new(),
            cs_tx: Vec::new(),
            ms_tx: Vec::new(),
            handler: Box::new(Forwarder),
            trace: None,
            frames_logged: 0,
        }
    }

    pub fn with_handler(handler: Box<dyn Handler>) -> Self {
        let mut session = Self::new();
        session.handler = handler;
        session
    }

    pub fn set_trace(&mut self, trace: TraceWriter) {
        self.trace = Some(trace);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn compression_threshold(&self) -> i32 {
        self.comptr
    }

    pub fn encryption_active(&self) -> bool {
        self.encryption_active
    }

    /// Appends raw socket bytes to the decoded receive buffer, decrypting
    /// in place once the channel cipher is engaged.
    pub fn ingest(&mut self, from_client: bool, data: &[u8]) {
        let mut chunk = data.to_vec();
        if self.encryption_active {
            let cipher = if from_client {
                self.client_cipher.as_mut()
            } else {
                self.server_cipher.as_mut()
            };
            if let Some(cipher) = cipher {
                cipher.decrypt(&mut chunk);
            }
        }
        let rx = if from_client {
            &mut self.cs_rx
        } else {
            &mut self.ms_rx
        };
        rx.extend_from_slice(&chunk);
    }

    /// Extracts and processes complete frames from one side's receive
    /// buffer. Returns early with a [`PendingJoin`] when an
    /// EncryptionResponse has been rewritten: the caller must complete the
    /// join call and hand the frame back through
    /// [`Session::complete_encryption_response`] before draining further.
    pub fn drain(&mut self, from_client: bool) -> Result<Option<PendingJoin>> {
        loop {
            let (header, len) = {
                let rx = if from_client { &self.cs_rx } else { &self.ms_rx };
                match codec::next_frame(rx)? {
                    Some(frame) => frame,
                    None => return Ok(None),
                }
            };
            let payload: Vec<u8> = {
                let rx = if from_client {
                    &mut self.cs_rx
                } else {
                    &mut self.ms_rx
                };
                let payload = rx[header..header + len].to_vec();
                rx.drain(..header + len);
                payload
            };

            if let Some(trace) = self.trace.as_mut() {
                if let Err(err) = trace.record(from_client, &payload) {
                    eprintln!("gateway.trace.write_failed error={err}");
                }
            }

            if self.phase == Phase::Play {
                self.process_play_frame(from_client, &payload)?;
            } else if let Some(pending) = self.process_handshake_frame(from_client, &payload)? {
                return Ok(Some(pending));
            }
        }
    }

    /// Queues the rewritten EncryptionResponse toward the upstream and arms
    /// the encryption latch. Called after the session-join POST finished
    /// (in whatever way; a rejected join is the upstream's problem).
    pub fn complete_encryption_response(&mut self, frame_body: Vec<u8>) {
        self.queue_login_body(false, &frame_body, "encryption_response");
        self.response_pending = false;
        self.response_done = true;
        self.enable_encryption = true;
    }

    /// Takes one side's pending transmit bytes, cipher-applied if active.
    pub fn take_outgoing(&mut self, to_client: bool) -> Vec<u8> {
        let mut buf = if to_client {
            std::mem::take(&mut self.cs_tx)
        } else {
            std::mem::take(&mut self.ms_tx)
        };
        if !buf.is_empty() && self.encryption_active {
            let cipher = if to_client {
                self.client_cipher.as_mut()
            } else {
                self.server_cipher.as_mut()
            };
            if let Some(cipher) = cipher {
                cipher.encrypt(&mut buf);
            }
        }
        buf
    }

    /// The one-tick encryption delay: runs at the end of a pump iteration,
    /// after the flush, so the EncryptionResponse goes out in plaintext.
    /// `encryption_active` is monotonic from here on.
    pub fn tick_encryption(&mut self) {
        if !self.enable_encryption {
            return;
        }
        let (Some(client_secret), Some(broker)) = (self.client_secret, self.broker.as_ref())
        else {
            eprintln!("gateway.session.latch_without_keys");
            return;
        };
        self.client_cipher = Some(StreamCipher::new(&client_secret));
        self.server_cipher = Some(StreamCipher::new(broker.upstream_secret()));
        self.enable_encryption = false;
        self.encryption_active = true;
        println!("gateway.session.encryption_active");
    }

    /// Queues a synthetic packet toward either side, obeying the current
    /// compression envelope. `to_client` picks the destination socket.
    pub fn inject(&mut self, to_client: bool, packet: &Packet) -> Result<()> {
        self.queue_packet(to_client, packet)
    }

    fn log_frame(&mut self, packet: &Packet, len: usize) {
        if self.frames_logged < FRAME_TRACE_LIMIT {
            self.frames_logged += 1;
            println!("gateway.session.rx len={len} {}", packet.dump());
        }
    }

    fn process_handshake_frame(
        &mut self,
        from_client: bool,
        payload: &[u8],
    ) -> Result<Option<PendingJoin>> {
        let body: Cow<'_, [u8]> = if self.comptr >= 0 {
            Cow::Owned(codec::unwrap_compressed(payload)?)
        } else {
            Cow::Borrowed(payload)
        };
        let direction = if from_client {
            Direction::Serverbound
        } else {
            Direction::Clientbound
        };
        let packet = Packet::decode(direction, self.phase, &body)?;
        self.log_frame(&packet, payload.len());

        match &packet.body {
            PacketBody::Handshake(hs) => {
                let next = Phase::from_next_state(hs.next_state.0).ok_or_else(|| {
                    ProtoError::HandshakeFailed(format!(
                        "handshake next_state {} out of range",
                        hs.next_state.0
                    ))
                })?;
                println!(
                    "gateway.session.handshake protocol={} server={}:{} next_state={}",
                    hs.protocol_version.0, hs.server_address.0, hs.server_port, hs.next_state.0
                );
                self.phase = next;
                self.queue_raw(from_client, payload);
            }

            PacketBody::EncryptionRequest(request) => {
                if self.broker.is_some() {
                    return Err(ProtoError::HandshakeFailed(
                        "duplicate encryption request".to_string(),
                    ));
                }
                println!(
                    "gateway.session.encryption_request server_id={:?} key_len={} token_len={}",
                    request.server_id.0,
                    request.public_key.0.len(),
                    request.verify_token.0.len()
                );
                let broker =
                    KeyBroker::from_server_key(&request.public_key.0, &request.verify_token.0)?;
                self.server_id = request.server_id.0.clone();

                // Same packet, but carrying the gateway's key material.
                let rewritten = EncryptionRequest {
                    server_id: request.server_id.clone(),
                    public_key: VarBytes(broker.proxy_public_der().to_vec()),
                    verify_token: VarBytes(broker.client_token().to_vec()),
                };
                let substituted = Packet::synthetic(
                    Direction::Clientbound,
                    Phase::Login,
                    PacketId::ENCRYPTION_REQUEST,
                    PacketBody::EncryptionRequest(rewritten),
                );
                let mut frame_body = Vec::new();
                substituted.encode(&mut frame_body)?;
                self.queue_login_body(true, &frame_body, "encryption_request");
                self.broker = Some(broker);
            }

            PacketBody::EncryptionResponse(response) => {
                if self.response_pending || self.response_done {
                    return Err(ProtoError::HandshakeFailed(
                        "duplicate encryption response".to_string(),
                    ));
                }
                let broker = self.broker.as_ref().ok_or_else(|| {
                    ProtoError::HandshakeFailed(
                        "encryption response before encryption request".to_string(),
                    )
                })?;
                let client_secret = broker.unwrap_client_secret(&response.shared_secret.0)?;
                broker.verify_client_token(&response.verify_token.0)?;
                self.client_secret = Some(client_secret);

                let (wrapped_secret, wrapped_token) = broker.wrap_for_upstream()?;
                let substituted = Packet::synthetic(
                    Direction::Serverbound,
                    Phase::Login,
                    PacketId::ENCRYPTION_RESPONSE,
                    PacketBody::EncryptionResponse(EncryptionResponse {
                        shared_secret: VarBytes(wrapped_secret),
                        verify_token: VarBytes(wrapped_token),
                    }),
                );
                let mut frame_body = Vec::new();
                substituted.encode(&mut frame_body)?;

                let digest = keys::join_digest(
                    &self.server_id,
                    broker.upstream_secret(),
                    broker.server_public_der(),
                );
                println!(
                    "gateway.session.join_digest server_id={:?} digest={digest}",
                    self.server_id
                );
                self.response_pending = true;
                return Ok(Some(PendingJoin { digest, frame_body }));
            }

            PacketBody::SetCompression(sc) => {
                println!(
                    "gateway.session.set_compression threshold={}",
                    sc.threshold.0
                );
                // Forward first: the toggle applies from the next frame on.
                self.queue_raw(from_client, payload);
                self.comptr = sc.threshold.0;
            }

            PacketBody::LoginSuccess(success) => {
                println!(
                    "gateway.session.login_success uuid={} username={}",
                    success.uuid.0, success.username.0
                );
                self.phase = Phase::Play;
                self.queue_raw(from_client, payload);
            }

            // LoginStart, Disconnect, the STATUS exchange, and anything
            // unregistered pass through untouched.
            _ => self.queue_raw(from_client, payload),
        }
        Ok(None)
    }

    fn process_play_frame(&mut self, from_client: bool, payload: &[u8]) -> Result<()> {
        let body: Cow<'_, [u8]> = if self.comptr >= 0 {
            Cow::Owned(codec::unwrap_compressed(payload)?)
        } else {
            Cow::Borrowed(payload)
        };
        let direction = if from_client {
            Direction::Serverbound
        } else {
            Direction::Clientbound
        };
        let packet = match Packet::decode(direction, Phase::Play, &body) {
            Ok(packet) => packet,
            Err(err) => {
                // A registered packet with a body we cannot read. Keep the
                // splice intact and pass the original bytes along.
                eprintln!(
                    "gateway.session.decode_failed side={} error={err}",
                    direction.tag()
                );
                self.queue_raw(from_client, payload);
                return Ok(());
            }
        };
        self.log_frame(&packet, payload.len());

        let mut queues = PacketQueues::default();
        self.handler.handle(packet, &mut queues);
        for packet in &queues.forward {
            self.queue_packet(!from_client, packet)?;
        }
        for packet in &queues.retour {
            self.queue_packet(from_client, packet)?;
        }
        Ok(())
    }

    /// Re-emits a received frame payload verbatim toward the peer.
    fn queue_raw(&mut self, from_client: bool, payload: &[u8]) {
        let tx = if from_client {
            &mut self.ms_tx
        } else {
            &mut self.cs_tx
        };
        codec::write_frame_raw(payload, tx);
    }

    /// Frames a rewritten login packet. Once the compression toggle is on,
    /// handshake frames still go out plaintext under a zero-length marker.
    fn queue_login_body(&mut self, to_client: bool, body: &[u8], what: &str) {
        let comptr = self.comptr;
        let tx = if to_client {
            &mut self.cs_tx
        } else {
            &mut self.ms_tx
        };
        if comptr >= 0 {
            println!("gateway.session.pseudo_compressed packet={what}");
            codec::write_frame_plain_marked(body, tx);
        } else {
            codec::write_frame_raw(body, tx);
        }
    }

    /// Encodes and frames a packet toward one side under the current
    /// compression envelope.
    fn queue_packet(&mut self, to_client: bool, packet: &Packet) -> Result<()> {
        let mut body = Vec::new();
        packet.encode(&mut body)?;
        let comptr = self.comptr;
        let tx = if to_client {
            &mut self.cs_tx
        } else {
            &mut self.ms_tx
        };
        codec::write_frame(&body, comptr, tx)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
