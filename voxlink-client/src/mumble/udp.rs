//! UDP ping and voice transport
//!
//! Mumble shares one UDP port with the control channel's TCP port. A
//! dedicated task probes it: every 5 s it sends a `[0x20 | timestamp]`
//! datagram and waits up to 2 s for the echo, polling in 100 ms steps so
//! shutdown is never delayed. One echo latches `udp_available` and voice
//! switches to encrypted datagrams; three straight timeouts without any
//! echo ever arriving reports UDP as unusable (once) and voice stays on
//! the TCP tunnel.
//!
//! Non-ping datagrams on the socket are encrypted voice: they are opened
//! with the OCB state and fed to the same ingress path as tunneled
//! packets. A failed open flags the crypto state and asks the server for
//! a fresh CryptSetup, once per outage.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use log::{debug, info, warn};
use prost::Message;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Duration, Instant};

use voxlink_common::proto;
use voxlink_common::protocol::MessageType;
use voxlink_common::voice::{decode_udp_ping, encode_udp_ping};

use crate::error::ClientError;
use crate::mumble::client::{ControlCommand, Shared, VoiceIngress};
use crate::mumble::types::MumbleEvent;

/// Interval between pings
const PING_INTERVAL: Duration = Duration::from_secs(5);

/// How long to wait for an echo before counting a timeout
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Receive poll granularity; bounds shutdown latency
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Consecutive timeouts before UDP is reported unusable
const MAX_TIMEOUTS: u32 = 3;

/// Receive buffer; voice datagrams are far smaller than this
const RECV_BUFFER_SIZE: usize = 2048;

/// Bind and connect the shared voice/ping socket
pub(crate) async fn open_voice_socket(server: SocketAddr) -> Result<UdpSocket, ClientError> {
    let bind_addr = if server.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| ClientError::Connect(format!("UDP bind failed: {}", e)))?;
    socket
        .connect(server)
        .await
        .map_err(|e| ClientError::Connect(format!("UDP connect failed: {}", e)))?;
    Ok(socket)
}

/// The pinger task: probes reachability and receives encrypted voice
pub(crate) async fn run_pinger(
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    ingress_tx: UnboundedSender<VoiceIngress>,
    control_tx: UnboundedSender<ControlCommand>,
) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    let mut next_ping = Instant::now();
    let mut echo_deadline: Option<Instant> = None;
    let mut consecutive_timeouts = 0u32;
    let mut ever_succeeded = false;
    let mut failure_reported = false;

    while shared.running.load(Ordering::SeqCst) {
        if Instant::now() >= next_ping {
            let packet = encode_udp_ping(shared.elapsed_micros());
            if let Err(e) = socket.send(&packet).await {
                debug!("UDP ping send failed: {}", e);
            }
            if echo_deadline.is_none() {
                echo_deadline = Some(Instant::now() + PING_TIMEOUT);
            }
            next_ping = Instant::now() + PING_INTERVAL;
        }

        match tokio::time::timeout(POLL_INTERVAL, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                // An encrypted voice datagram can start with any byte;
                // only an exact 9-byte echo is a ping reply.
                let ping_reply = if len == 9 {
                    decode_udp_ping(&buf[..len])
                } else {
                    None
                };
                if let Some(sent_micros) = ping_reply {
                    let latency_ms =
                        shared.elapsed_micros().saturating_sub(sent_micros) as f32 / 1000.0;
                    if !shared.udp_available.swap(true, Ordering::SeqCst) {
                        info!("UDP reachable, voice switching to datagrams");
                    }
                    echo_deadline = None;
                    consecutive_timeouts = 0;
                    ever_succeeded = true;
                    failure_reported = false;
                    shared.emit(MumbleEvent::UdpAvailability {
                        available: true,
                        latency_ms,
                    });
                } else {
                    handle_voice_datagram(&shared, &ingress_tx, &control_tx, &buf[..len]);
                }
            }
            Ok(Err(e)) => {
                debug!("UDP receive failed: {}", e);
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Err(_) => {
                // Poll window elapsed with nothing to read
            }
        }

        if let Some(deadline) = echo_deadline {
            if Instant::now() >= deadline {
                echo_deadline = None;
                consecutive_timeouts += 1;
                if consecutive_timeouts >= MAX_TIMEOUTS && !ever_succeeded && !failure_reported {
                    failure_reported = true;
                    shared.udp_available.store(false, Ordering::SeqCst);
                    warn!("UDP unreachable after {} pings, voice stays tunneled", MAX_TIMEOUTS);
                    shared.emit(MumbleEvent::UdpAvailability {
                        available: false,
                        latency_ms: 0.0,
                    });
                }
            }
        }
    }
}

/// Open an encrypted voice datagram and forward it to ingress
///
/// A tag mismatch flags the crypto state; the first failure of an outage
/// asks the server for a fresh CryptSetup.
pub(crate) fn handle_voice_datagram(
    shared: &Shared,
    ingress_tx: &UnboundedSender<VoiceIngress>,
    control_tx: &UnboundedSender<ControlCommand>,
    datagram: &[u8],
) {
    let result = {
        let mut crypto = shared.crypto.lock().expect("crypto lock poisoned");
        if !crypto.is_valid() {
            None
        } else {
            Some(crypto.decrypt(datagram))
        }
    };

    match result {
        Some(Ok(plain)) => {
            shared
                .counters
                .voice_packets
                .fetch_add(1, Ordering::Relaxed);
            let _ = ingress_tx.send(VoiceIngress::Packet(Bytes::from(plain)));
        }
        Some(Err(e)) => {
            shared
                .counters
                .bad_voice_packets
                .fetch_add(1, Ordering::Relaxed);
            debug!("dropped undecryptable datagram: {}", e);

            let needs_resync = shared
                .crypto
                .lock()
                .expect("crypto lock poisoned")
                .needs_resync();
            if needs_resync && !shared.resync_requested.swap(true, Ordering::SeqCst) {
                // An empty CryptSetup asks the server to resend nonces
                let request = proto::CryptSetup::default();
                let _ = control_tx.send(ControlCommand::Send(
                    MessageType::CryptSetup,
                    Bytes::from(request.encode_to_vec()),
                ));
                shared.emit(MumbleEvent::CryptoResyncRequested);
            }
        }
        None => {
            shared
                .counters
                .bad_voice_packets
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use voxlink_common::voice::{UDP_PING_HEADER, VoicePacket};

    use crate::crypto::CryptState;

    use super::*;

    const KEY: [u8; 16] = [9u8; 16];
    const CLIENT_NONCE: [u8; 16] = [1u8; 16];
    const SERVER_NONCE: [u8; 16] = [2u8; 16];

    struct Harness {
        shared: Arc<Shared>,
        event_rx: UnboundedReceiver<MumbleEvent>,
        ingress_tx: UnboundedSender<VoiceIngress>,
        ingress_rx: UnboundedReceiver<VoiceIngress>,
        control_tx: UnboundedSender<ControlCommand>,
        control_rx: UnboundedReceiver<ControlCommand>,
    }

    fn harness() -> Harness {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Harness {
            shared: Arc::new(Shared::new_for_test(event_tx)),
            event_rx,
            ingress_tx,
            ingress_rx,
            control_tx,
            control_rx,
        }
    }

    /// A keyed server-side crypt state matching the harness's client
    fn server_crypto() -> CryptState {
        let mut state = CryptState::new();
        // The server encrypts with what the client decrypts with
        state.init(&KEY, &SERVER_NONCE, &CLIENT_NONCE);
        state
    }

    fn key_client(shared: &Shared) {
        shared
            .crypto
            .lock()
            .unwrap()
            .init(&KEY, &CLIENT_NONCE, &SERVER_NONCE);
    }

    #[test]
    fn test_datagram_decrypts_to_ingress() {
        let mut h = harness();
        key_client(&h.shared);

        let packet = VoicePacket {
            codec: voxlink_common::voice::CODEC_OPUS,
            target: 0,
            session: Some(3),
            sequence: 1,
            payload: Bytes::from_static(&[1, 2, 3]),
            end_of_transmission: false,
        };
        let sealed = server_crypto().encrypt(&packet.to_bytes()).unwrap();

        handle_voice_datagram(&h.shared, &h.ingress_tx, &h.control_tx, &sealed);

        let forwarded = h.ingress_rx.try_recv().expect("nothing forwarded");
        match forwarded {
            VoiceIngress::Packet(bytes) => {
                let parsed = VoicePacket::from_bytes(&bytes).unwrap();
                assert_eq!(parsed.session, Some(3));
                assert_eq!(&parsed.payload[..], &[1, 2, 3]);
            }
            other => panic!("unexpected ingress input: {:?}", other),
        }
    }

    #[test]
    fn test_bad_tag_requests_resync_once() {
        let mut h = harness();
        key_client(&h.shared);

        let mut sealed = server_crypto().encrypt(b"some voice packet").unwrap();
        sealed[1] ^= 0xFF; // corrupt the tag

        handle_voice_datagram(&h.shared, &h.ingress_tx, &h.control_tx, &sealed);
        handle_voice_datagram(&h.shared, &h.ingress_tx, &h.control_tx, &sealed);

        // Exactly one CryptSetup request despite two failures
        let command = h.control_rx.try_recv().expect("no resync request");
        assert!(matches!(
            command,
            ControlCommand::Send(MessageType::CryptSetup, _)
        ));
        assert!(h.control_rx.try_recv().is_err());

        let event = h.event_rx.try_recv().unwrap();
        assert_eq!(event, MumbleEvent::CryptoResyncRequested);

        assert!(h.ingress_rx.try_recv().is_err());
    }

    #[test]
    fn test_datagram_before_keying_dropped() {
        let mut h = harness();

        handle_voice_datagram(&h.shared, &h.ingress_tx, &h.control_tx, &[0u8; 32]);
        assert!(h.ingress_rx.try_recv().is_err());
        assert!(h.control_rx.try_recv().is_err());
        assert_eq!(
            h.shared.counters.bad_voice_packets.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_ping_echo_latches_udp_available() {
        let mut h = harness();
        h.shared.running.store(true, Ordering::SeqCst);

        // Fake server: echo any ping datagram back verbatim
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let Ok((len, from)) = server.recv_from(&mut buf).await else {
                    break;
                };
                if buf[0] == UDP_PING_HEADER {
                    let _ = server.send_to(&buf[..len], from).await;
                }
            }
        });

        let socket = Arc::new(open_voice_socket(server_addr).await.unwrap());
        let pinger = tokio::spawn(run_pinger(
            socket,
            h.shared.clone(),
            h.ingress_tx.clone(),
            h.control_tx.clone(),
        ));

        let event = tokio::time::timeout(Duration::from_secs(5), h.event_rx.recv())
            .await
            .expect("no availability event")
            .unwrap();
        match event {
            MumbleEvent::UdpAvailability {
                available,
                latency_ms,
            } => {
                assert!(available);
                assert!(latency_ms >= 0.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(h.shared.udp_available.load(Ordering::SeqCst));

        h.shared.running.store(false, Ordering::SeqCst);
        let _ = tokio::time::timeout(Duration::from_secs(1), pinger).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_reports_unreachable_once() {
        let mut h = harness();
        h.shared.running.store(true, Ordering::SeqCst);

        // Socket pointed at a black hole: bind a peer and never reply
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = Arc::new(open_voice_socket(peer.local_addr().unwrap()).await.unwrap());

        let pinger = tokio::spawn(run_pinger(
            socket,
            h.shared.clone(),
            h.ingress_tx.clone(),
            h.control_tx.clone(),
        ));

        // Three 5s ping cycles under paused time
        let event = tokio::time::timeout(Duration::from_secs(60), h.event_rx.recv())
            .await
            .expect("no failure report")
            .unwrap();
        assert_eq!(
            event,
            MumbleEvent::UdpAvailability {
                available: false,
                latency_ms: 0.0,
            }
        );
        assert!(!h.shared.udp_available.load(Ordering::SeqCst));

        // The report fires once; give it two more cycles to misbehave
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(h.event_rx.try_recv().is_err());

        h.shared.running.store(false, Ordering::SeqCst);
        let _ = tokio::time::timeout(Duration::from_secs(1), pinger).await;
    }
}
