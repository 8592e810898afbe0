//! 피어 설정

use std::time::Duration;

use crate::{DEFAULT_SAMPLE_DELAY_MS, DEFAULT_SAMPLE_LIMIT, SINGULAR_EPSILON};

/// coframe 피어 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 협상 한 번에 수집할 샘플 쌍의 수
    pub sample_limit: usize,

    /// 샘플 요청 후 손가락 위치를 캡처하기까지의 대기 시간 (밀리초)
    pub sample_delay_ms: u64,

    /// 피벗/대각 성분이 이 값보다 작으면 특이 행렬로 판정
    pub singular_epsilon: f64,

    /// 호스트 가이드 위치 오프셋 (미터)
    /// 2, 3, 4번째 샘플을 첫 샘플 기준 +Y, +X, +Z 방향으로 안내
    pub guide_offset: f64,

    /// 액터 명령 큐 크기
    pub command_queue_size: usize,

    /// 이벤트 큐 크기
    pub event_queue_size: usize,

    /// 전송 계층 수신 큐 크기 (가득 차면 프레임을 버림)
    pub transport_queue_size: usize,

    /// UDP 수신 버퍼 크기
    pub recv_buffer_size: usize,

    /// 피어 연결이 끊기면 등록된 변환도 함께 삭제
    pub forget_lost_peers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_limit: DEFAULT_SAMPLE_LIMIT,
            sample_delay_ms: DEFAULT_SAMPLE_DELAY_MS, // 약 3초
            singular_epsilon: SINGULAR_EPSILON,
            guide_offset: 0.3,
            command_queue_size: 1000,
            event_queue_size: 256,
            transport_queue_size: 1024,
            recv_buffer_size: 64 * 1024,
            forget_lost_peers: false,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 캡처 대기 시간
    pub fn sample_delay(&self) -> Duration {
        Duration::from_millis(self.sample_delay_ms)
    }

    /// 빠른 캡처용 설정 (테스트, 시뮬레이션)
    pub fn quick_capture() -> Self {
        Self {
            sample_delay_ms: 20,
            command_queue_size: 256,
            event_queue_size: 1024,
            ..Self::default()
        }
    }

    /// 정밀 정렬용 설정
    /// 샘플을 더 많이 모아 잡음 영향을 줄임
    pub fn precise() -> Self {
        Self {
            sample_limit: 8,
            sample_delay_ms: 4000,
            ..Self::default()
        }
    }

    /// 샘플 수 변경
    pub fn with_sample_limit(mut self, sample_limit: usize) -> Self {
        self.sample_limit = sample_limit.max(crate::solver::MIN_SAMPLES);
        self
    }
}
