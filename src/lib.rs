//! # coframe
//!
//! 공간 드로잉 피어들 사이의 좌표계 정렬과 타입 RPC 교환
//!
//! ## 핵심 특징
//! - **리더 없는 쌍 정렬**: 두 피어가 같은 물리 위치를 손가락으로 찍어 대응점을 모으고,
//!   피어 ID 비교로 호스트/클라이언트 역할을 결정
//! - **강체 변환 추정**: LU 최소제곱 후 극분해로 회전만 남김, 역변환은 Gauss-Jordan
//! - **메시 합류**: 새 피어와 정렬한 피어가 기존 변환과 합성하여 나머지 피어와의 변환을 배포
//! - **타입 RPC**: 닫힌 메서드 어휘, 로컬 우선 디스패치, 실패 시 에러 엔벨로프 회신
//! - **전송 독립**: 메모리 브로커와 UDP, 순서/도착 보장 없음

pub mod codec;
pub mod config;
pub mod context;
pub mod drawing;
pub mod error;
pub mod matrix;
pub mod message;
pub mod node;
pub mod peer;
pub mod registry;
pub mod router;
pub mod session;
pub mod solver;
pub mod stats;
pub mod transport;

pub use config::Config;
pub use context::{Effect, PeerContext, PeerEvent};
pub use drawing::{DrawingModel, Stroke, StrokeCanvas};
pub use error::{Error, Result};
pub use matrix::{Matrix4, Vec3};
pub use message::{Method, Param, PeerId, RequestEnvelope};
pub use node::{NodeSnapshot, PeerNode};
pub use peer::Peer;
pub use registry::TransformRegistry;
pub use router::{DispatchScope, RpcRouter};
pub use session::{AlignmentSession, AlignmentState, Role};
pub use solver::RigidSolution;
pub use stats::RpcStats;
pub use transport::{MemoryNetwork, Transport, TransportEvent, UdpTransport};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 매직 넘버 (프레임 식별용)
pub const MAGIC_NUMBER: u32 = 0x4346_524D; // "CFRM"

/// 협상당 기본 샘플 쌍 수
pub const DEFAULT_SAMPLE_LIMIT: usize = 4;

/// 샘플 요청 후 캡처까지 기본 대기 시간 (밀리초)
pub const DEFAULT_SAMPLE_DELAY_MS: u64 = 3000;

/// 특이 행렬 판정 기준
pub const SINGULAR_EPSILON: f64 = 1e-8;
