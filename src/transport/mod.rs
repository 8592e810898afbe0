//! 전송 계층
//!
//! 피어 ID 로 주소를 지정하는 순서/신뢰성 보장 없는 유니캐스트와 브로드캐스트.
//! 피어 발견/이탈은 [`TransportEvent`] 로 보고됨

pub mod memory;
pub mod udp;

use bytes::Bytes;

use crate::error::TransportError;
use crate::message::PeerId;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use udp::UdpTransport;

/// 전송 계층이 올려 보내는 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerFound(PeerId),
    PeerLost(PeerId),
    Received { from: PeerId, frame: Bytes },
}

/// 이벤트 수신기
pub type EventReceiver = tokio::sync::mpsc::Receiver<TransportEvent>;

/// 바이트 전송 인터페이스
///
/// 모든 전송은 fire-and-forget. 성공 반환은 큐에 넣었다는 뜻일 뿐 도착을 보장하지 않음
pub trait Transport: Send + Sync {
    /// 이 전송에 묶인 로컬 피어
    fn local_peer(&self) -> PeerId;

    /// 피어 하나에게 전송
    fn send_to(&self, peer: PeerId, frame: Bytes) -> Result<(), TransportError>;

    /// 연결된 모든 피어에게 전송, 보낸 피어 수 반환
    fn broadcast(&self, frame: Bytes) -> Result<usize, TransportError>;

    /// 현재 연결된 피어
    fn peers(&self) -> Vec<PeerId>;
}
