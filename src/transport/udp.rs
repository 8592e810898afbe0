//! UDP 전송
//!
//! 데이터그램 = 송신 피어 ID (8바이트 big-endian) + 프레임.
//! 주소록은 정적으로 등록하며, 모르는 피어에게서 데이터그램이 오면 주소록에 추가하고
//! PeerFound 를 올림. 수신 큐가 가득 차면 수신 루프가 기다리며, 그동안 도착한 데이터그램은 소켓 버퍼에서 버려질 수 있음

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{EventReceiver, Transport, TransportEvent};
use crate::config::Config;
use crate::error::TransportError;
use crate::message::PeerId;

/// 송신자 ID 접두사 길이
const PEER_PREFIX_LEN: usize = 8;

/// UDP 기반 전송
#[derive(Debug, Clone)]
pub struct UdpTransport {
    local: PeerId,
    socket: Arc<UdpSocket>,
    peers: Arc<DashMap<PeerId, SocketAddr>>,
    events: mpsc::Sender<TransportEvent>,
    running: Arc<AtomicBool>,
}

impl UdpTransport {
    /// 소켓 바인드 후 수신 태스크 시작
    pub async fn bind(local: PeerId, bind_addr: SocketAddr, config: &Config) -> Result<(Self, EventReceiver), TransportError> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let (events, events_rx) = mpsc::channel(config.transport_queue_size.max(1));
        let peers = Arc::new(DashMap::new());
        let running = Arc::new(AtomicBool::new(true));

        info!("UDP transport for {} bound on {}", local, socket.local_addr()?);

        let transport = Self {
            local,
            socket: socket.clone(),
            peers: peers.clone(),
            events: events.clone(),
            running: running.clone(),
        };

        let buf_size = config.recv_buffer_size.max(PEER_PREFIX_LEN + 1);
        tokio::spawn(async move {
            let mut buf = vec![0u8; buf_size];

            while running.load(Ordering::SeqCst) {
                match tokio::time::timeout(Duration::from_millis(10), socket.recv_from(&mut buf)).await {
                    Ok(Ok((len, addr))) => {
                        if len < PEER_PREFIX_LEN {
                            debug!("Short datagram from {} ({} bytes)", addr, len);
                            continue;
                        }
                        let mut prefix = [0u8; PEER_PREFIX_LEN];
                        prefix.copy_from_slice(&buf[..PEER_PREFIX_LEN]);
                        let from = PeerId(u64::from_be_bytes(prefix));
                        if from == local {
                            continue;
                        }

                        if peers.insert(from, addr).is_none() {
                            info!("UDP peer {} discovered at {}", from, addr);
                            if events.send(TransportEvent::PeerFound(from)).await.is_err() {
                                break;
                            }
                        }

                        let frame = Bytes::copy_from_slice(&buf[PEER_PREFIX_LEN..len]);
                        if events.send(TransportEvent::Received { from, frame }).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        warn!("UDP receive error on {}: {}", local, e);
                    }
                    Err(_) => {
                        // 타임아웃, 계속
                    }
                }
            }
            debug!("UDP receive loop for {} stopped", local);
        });

        Ok((transport, events_rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// 주소록에 피어 등록
    pub fn add_peer(&self, peer: PeerId, addr: SocketAddr) {
        if peer == self.local {
            return;
        }
        if self.peers.insert(peer, addr).is_none() {
            self.announce(TransportEvent::PeerFound(peer));
        }
    }

    /// 주소록에서 피어 삭제
    pub fn remove_peer(&self, peer: PeerId) {
        if self.peers.remove(&peer).is_some() {
            self.announce(TransportEvent::PeerLost(peer));
        }
    }

    /// 수신 태스크 정지
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn announce(&self, event: TransportEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!("UDP membership event for {} dropped: {}", self.local, e);
        }
    }

    fn datagram(&self, frame: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(PEER_PREFIX_LEN + frame.len());
        buf.put_u64(self.local.as_u64());
        buf.put_slice(frame);
        buf.freeze()
    }
}

impl Transport for UdpTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn send_to(&self, peer: PeerId, frame: Bytes) -> Result<(), TransportError> {
        let addr = *self
            .peers
            .get(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?
            .value();
        self.socket.try_send_to(&self.datagram(&frame), addr)?;
        Ok(())
    }

    fn broadcast(&self, frame: Bytes) -> Result<usize, TransportError> {
        let datagram = self.datagram(&frame);
        let targets: Vec<(PeerId, SocketAddr)> = self.peers.iter().map(|p| (*p.key(), *p.value())).collect();

        let mut sent = 0;
        for (peer, addr) in targets {
            match self.socket.try_send_to(&datagram, addr) {
                Ok(_) => sent += 1,
                Err(e) => warn!("Broadcast to {} ({}) failed: {}", peer, addr, e),
            }
        }
        Ok(sent)
    }

    fn peers(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| *p.key()).collect()
    }
}
