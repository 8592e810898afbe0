//! RPC 통계

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::message::Method;

/// 라우터 통계
#[derive(Debug, Clone)]
pub struct RpcStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 전송한 엔벨로프 수 (브로드캐스트는 1회로 계산)
    pub sent_envelopes: u64,

    /// 전송한 바이트 (브로드캐스트는 수신 피어 수만큼)
    pub sent_bytes: u64,

    /// 수신한 엔벨로프 수
    pub received_envelopes: u64,

    /// 수신한 바이트
    pub received_bytes: u64,

    /// 로컬/원격 핸들러 실패 수
    pub handler_failures: u64,

    /// 디코딩 실패 수
    pub decode_failures: u64,

    /// 전송 실패 수
    pub send_failures: u64,

    /// 원격으로 돌려보낸 에러 엔벨로프 수
    pub error_replies: u64,

    /// 메서드별 수신 횟수
    pub received_by_method: HashMap<Method, u64>,

    /// 마지막 송수신 시간
    pub last_activity: Option<Instant>,
}

impl Default for RpcStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            sent_envelopes: 0,
            sent_bytes: 0,
            received_envelopes: 0,
            received_bytes: 0,
            handler_failures: 0,
            decode_failures: 0,
            send_failures: 0,
            error_replies: 0,
            received_by_method: HashMap::new(),
            last_activity: None,
        }
    }

    /// 송신 기록
    pub fn record_sent(&mut self, bytes: usize, fanout: usize) {
        self.sent_envelopes += 1;
        self.sent_bytes += (bytes * fanout) as u64;
        self.last_activity = Some(Instant::now());
    }

    /// 수신 기록
    pub fn record_received(&mut self, method: Method, bytes: usize) {
        self.received_envelopes += 1;
        self.received_bytes += bytes as u64;
        *self.received_by_method.entry(method).or_insert(0) += 1;
        self.last_activity = Some(Instant::now());
    }

    pub fn record_handler_failure(&mut self) {
        self.handler_failures += 1;
    }

    pub fn record_decode_failure(&mut self, bytes: usize) {
        self.decode_failures += 1;
        self.received_bytes += bytes as u64;
    }

    pub fn record_send_failure(&mut self) {
        self.send_failures += 1;
    }

    pub fn record_error_reply(&mut self) {
        self.error_replies += 1;
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 수신 엔벨로프 중 실패 비율
    pub fn failure_rate(&self) -> f64 {
        let total = self.received_envelopes + self.decode_failures;
        if total == 0 {
            return 0.0;
        }
        (self.handler_failures + self.decode_failures) as f64 / total as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} ({} B) | Received: {} ({} B) | Failures: handler {}, decode {}, send {} | Inbound failure rate: {:.1}% | Error replies: {}",
            self.elapsed().as_secs_f64(),
            self.sent_envelopes,
            self.sent_bytes,
            self.received_envelopes,
            self.received_bytes,
            self.handler_failures,
            self.decode_failures,
            self.send_failures,
            self.failure_rate() * 100.0,
            self.error_replies,
        )
    }
}
