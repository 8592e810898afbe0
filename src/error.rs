//! 에러 타입 정의

use thiserror::Error;

use crate::message::{Method, PeerId};
use crate::session::AlignmentState;

/// 엔벨로프 디코딩 에러
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("프레임이 너무 짧음: {len} bytes")]
    FrameTooShort { len: usize },

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    InvalidMagicNumber { expected: u32, got: u32 },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("페이로드 길이 불일치: header={declared}, actual={actual}")]
    PayloadLength { declared: u32, actual: usize },

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("헤더 직렬화 에러: {0}")]
    Header(#[from] bincode::Error),

    #[error("JSON 에러: {0}")]
    Json(#[from] serde_json::Error),

    /// method 와 param 이 서로 다른 연산을 가리킴
    #[error("유효하지 않은 파라미터: method={method}, param={param}")]
    InvalidParameter { method: Method, param: Method },
}

/// 라우터 디스패치 에러
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("등록되지 않은 메서드: {0}")]
    UnknownMethod(Method),

    #[error("요청 불일치: method={method}, param={param}")]
    InvalidRequest { method: Method, param: Method },
}

/// 아핀 행렬 계산 에러
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("샘플 부족: required {required}, got {got}")]
    InsufficientSamples { required: usize, got: usize },

    #[error("샘플 수 불일치: A={a}, B={b}")]
    MismatchedSamples { a: usize, b: usize },

    /// 대응점이 한 직선 위에 있거나 한 점에 모여 있음
    #[error("퇴화된 대응점: 독립 방향 {directions}개")]
    Degenerate { directions: usize },

    #[error("특이 행렬: |pivot|={pivot:e} < {epsilon:e}")]
    Singular { pivot: f64, epsilon: f64 },

    #[error("유한하지 않은 값 포함")]
    NonFinite,
}

/// 전송 에러 (재시도 없음)
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("알 수 없는 피어: {0}")]
    UnknownPeer(PeerId),

    #[error("수신 큐 가득 참: {0}")]
    QueueFull(PeerId),

    #[error("전송 채널 종료")]
    ChannelClosed,
}

/// 좌표 정렬 프로토콜 에러
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("예상치 못한 상태: {state:?} 에서 {operation} 불가")]
    UnexpectedState {
        state: AlignmentState,
        operation: &'static str,
    },

    #[error("상대 피어가 선택되지 않음")]
    NoCounterpart,

    #[error("자기 자신은 상대 피어가 될 수 없음: {0}")]
    SelfSelection(PeerId),

    #[error("협상 대상이 아닌 피어: {0}")]
    UnexpectedPeer(PeerId),

    #[error("아직 계산된 아핀 행렬이 없음")]
    NotSolved,

    #[error("최근 손가락 위치 없음")]
    NoFingertipPose,
}

/// 드로잉 모델 에러
#[derive(Error, Debug)]
pub enum DrawingError {
    #[error("알 수 없는 색상: {0}")]
    UnknownColor(String),

    #[error("알 수 없는 도구: {0}")]
    UnknownTool(String),

    #[error("스트로크 없음: {0}")]
    UnknownStroke(uuid::Uuid),
}

/// coframe 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Drawing(#[from] DrawingError),

    #[error("인코딩 에러: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("프레임 헤더 직렬화 에러: {0}")]
    Frame(#[from] bincode::Error),

    #[error("노드 종료")]
    NodeStopped,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
