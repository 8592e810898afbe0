//! 메모리 내 전송
//!
//! 한 프로세스 안의 여러 피어를 공유 브로커로 연결함. 테스트와 시뮬레이션용.
//! 손실률을 지정하면 프레임을 무작위로 버림. 수신 큐가 가득 찬 피어로 가는 프레임도 버려짐

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use super::{EventReceiver, Transport, TransportEvent};
use crate::config::Config;
use crate::error::TransportError;
use crate::message::PeerId;

#[derive(Debug)]
struct NetworkInner {
    members: DashMap<PeerId, mpsc::Sender<TransportEvent>>,
    loss_rate: f64,
    queue_size: usize,
}

/// 공유 네트워크 브로커
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// 손실 없는 네트워크
    pub fn new() -> Self {
        Self::with_loss(0.0)
    }

    /// 프레임마다 `loss_rate` 확률로 버리는 네트워크
    pub fn with_loss(loss_rate: f64) -> Self {
        Self::with_options(loss_rate, Config::default().transport_queue_size)
    }

    /// 손실률과 피어별 수신 큐 크기 지정
    pub fn with_options(loss_rate: f64, queue_size: usize) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                members: DashMap::new(),
                loss_rate: loss_rate.clamp(0.0, 1.0),
                queue_size: queue_size.max(1),
            }),
        }
    }

    /// 피어 참여
    ///
    /// 기존 멤버에게는 새 피어의 PeerFound, 새 피어에게는 기존 멤버들의 PeerFound 가 전달됨
    pub fn join(&self, peer: PeerId) -> (MemoryTransport, EventReceiver) {
        let (tx, rx) = mpsc::channel(self.inner.queue_size);

        for member in self.inner.members.iter() {
            let _ = member.value().try_send(TransportEvent::PeerFound(peer));
            let _ = tx.try_send(TransportEvent::PeerFound(*member.key()));
        }
        self.inner.members.insert(peer, tx);
        debug!("MemoryNetwork: {} joined ({} members)", peer, self.inner.members.len());

        let transport = MemoryTransport {
            local: peer,
            network: self.clone(),
        };
        (transport, rx)
    }

    /// 피어 이탈, 남은 멤버에게 PeerLost 전달
    pub fn leave(&self, peer: PeerId) {
        if self.inner.members.remove(&peer).is_some() {
            for member in self.inner.members.iter() {
                let _ = member.value().try_send(TransportEvent::PeerLost(peer));
            }
            debug!("MemoryNetwork: {} left", peer);
        }
    }

    pub fn members(&self) -> Vec<PeerId> {
        self.inner.members.iter().map(|m| *m.key()).collect()
    }

    fn deliver(&self, from: PeerId, to: PeerId, frame: Bytes) -> Result<(), TransportError> {
        let member = self
            .inner
            .members
            .get(&to)
            .ok_or(TransportError::UnknownPeer(to))?;

        if self.inner.loss_rate > 0.0 && rand::thread_rng().gen_bool(self.inner.loss_rate) {
            trace!("MemoryNetwork: dropped frame {} -> {}", from, to);
            return Ok(());
        }

        match member.value().try_send(TransportEvent::Received { from, frame }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                trace!("MemoryNetwork: queue of {} full, dropped frame from {}", to, from);
                Err(TransportError::QueueFull(to))
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::ChannelClosed),
        }
    }
}

/// 메모리 네트워크의 피어 하나에 묶인 전송
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    local: PeerId,
    network: MemoryNetwork,
}

impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn send_to(&self, peer: PeerId, frame: Bytes) -> Result<(), TransportError> {
        if peer == self.local {
            return Err(TransportError::UnknownPeer(peer));
        }
        self.network.deliver(self.local, peer, frame)
    }

    fn broadcast(&self, frame: Bytes) -> Result<usize, TransportError> {
        let targets = self.peers();
        for peer in &targets {
            // 중간에 이탈한 피어는 무시
            if let Err(e) = self.network.deliver(self.local, *peer, frame.clone()) {
                debug!("MemoryNetwork: broadcast to {} failed: {}", peer, e);
            }
        }
        Ok(targets.len())
    }

    fn peers(&self) -> Vec<PeerId> {
        self.network
            .members()
            .into_iter()
            .filter(|p| *p != self.local)
            .collect()
    }
}
