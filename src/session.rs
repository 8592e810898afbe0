//! 좌표 정렬 세션
//!
//! 두 피어 사이의 협상 하나를 표현하는 상태 머신.
//! 역할은 피어 ID 비교로 결정됨 (작은 쪽이 호스트, 큰 쪽이 클라이언트).
//! 호스트가 캡처한 포즈는 `A`, 클라이언트가 캡처한 포즈는 `B` 에 쌓임

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::matrix::{Matrix4, Vec3};
use crate::message::PeerId;
use crate::registry::PendingOnboarding;
use crate::solver::{self, RigidSolution};

/// 정렬 진행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlignmentState {
    /// 대기
    #[default]
    Initial,
    /// 상대 피어 선택 중
    Selecting,
    /// 호스트로서 샘플 수집 중
    AcquiringAsHost,
    /// 클라이언트로서 샘플 수집 중
    AcquiringAsClient,
    /// 샘플 수집 완료, 확정 대기
    Confirming,
    /// 변환 등록 완료
    Prepared,
}

impl AlignmentState {
    pub fn is_acquiring(&self) -> bool {
        matches!(self, AlignmentState::AcquiringAsHost | AlignmentState::AcquiringAsClient)
    }
}

/// 협상 내 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Host,
    Client,
}

impl Role {
    /// ID 비교로 역할 결정
    ///
    /// 양쪽이 각자 계산해도 항상 서로 반대 역할이 나옴
    pub fn elect(me: PeerId, other: PeerId) -> std::result::Result<Role, ProtocolError> {
        match me.cmp(&other) {
            std::cmp::Ordering::Greater => Ok(Role::Client),
            std::cmp::Ordering::Less => Ok(Role::Host),
            std::cmp::Ordering::Equal => Err(ProtocolError::SelfSelection(me)),
        }
    }

    pub fn opposite(self) -> Role {
        match self {
            Role::Host => Role::Client,
            Role::Client => Role::Host,
        }
    }

    /// 이 역할이 캡처한 샘플이 들어갈 목록
    pub fn side(self) -> SampleSide {
        match self {
            Role::Host => SampleSide::A,
            Role::Client => SampleSide::B,
        }
    }

    pub fn acquiring_state(self) -> AlignmentState {
        match self {
            Role::Host => AlignmentState::AcquiringAsHost,
            Role::Client => AlignmentState::AcquiringAsClient,
        }
    }
}

/// 샘플 목록 구분
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleSide {
    /// 호스트 좌표계
    A,
    /// 클라이언트 좌표계
    B,
}

/// 대응 포즈 샘플 (크기 제한)
#[derive(Debug, Clone)]
pub struct SampleSet {
    a: Vec<Matrix4>,
    b: Vec<Matrix4>,
    limit: usize,
}

impl SampleSet {
    pub fn new(limit: usize) -> Self {
        Self {
            a: Vec::with_capacity(limit),
            b: Vec::with_capacity(limit),
            limit,
        }
    }

    /// 샘플 추가, 이미 가득 찬 목록이면 false
    pub fn push(&mut self, side: SampleSide, pose: Matrix4) -> bool {
        let limit = self.limit;
        let list = match side {
            SampleSide::A => &mut self.a,
            SampleSide::B => &mut self.b,
        };
        if list.len() >= limit {
            return false;
        }
        list.push(pose);
        true
    }

    pub fn a(&self) -> &[Matrix4] {
        &self.a
    }

    pub fn b(&self) -> &[Matrix4] {
        &self.b
    }

    pub fn get(&self, side: SampleSide) -> &[Matrix4] {
        match side {
            SampleSide::A => &self.a,
            SampleSide::B => &self.b,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 완성된 샘플 쌍 수
    pub fn pairs(&self) -> usize {
        self.a.len().min(self.b.len())
    }

    pub fn is_complete(&self) -> bool {
        self.a.len() >= self.limit && self.b.len() >= self.limit
    }

    pub fn clear(&mut self) {
        self.a.clear();
        self.b.clear();
    }
}

/// 샘플 기록 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleOutcome {
    pub side: SampleSide,
    /// 목록이 이미 가득 차서 버려졌으면 false
    pub accepted: bool,
    pub pairs: usize,
    /// 이 샘플로 Confirming 에 진입했는지
    pub entered_confirming: bool,
}

/// 진행 상황 스냅샷
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentProgress {
    pub state: AlignmentState,
    pub other_peer_id: Option<PeerId>,
    pub a_count: usize,
    pub b_count: usize,
    pub sample_limit: usize,
    pub capture_requested: bool,
}

/// 협상 세션
#[derive(Debug, Clone)]
pub struct AlignmentSession {
    my_peer_id: PeerId,
    other_peer_id: Option<PeerId>,
    state: AlignmentState,
    samples: SampleSet,
    capture_requested: bool,
    solution: Option<RigidSolution>,
    pending: Vec<PendingOnboarding>,
    /// 협상이 새로 시작되거나 리셋될 때마다 증가, 예약된 캡처를 구분하는 키
    generation: u64,
}

impl AlignmentSession {
    pub fn new(my_peer_id: PeerId, sample_limit: usize) -> Self {
        Self {
            my_peer_id,
            other_peer_id: None,
            state: AlignmentState::Initial,
            samples: SampleSet::new(sample_limit),
            capture_requested: false,
            solution: None,
            pending: Vec::new(),
            generation: 0,
        }
    }

    pub fn my_peer_id(&self) -> PeerId {
        self.my_peer_id
    }

    pub fn other_peer_id(&self) -> Option<PeerId> {
        self.other_peer_id
    }

    pub fn state(&self) -> AlignmentState {
        self.state
    }

    pub fn samples(&self) -> &SampleSet {
        &self.samples
    }

    pub fn capture_requested(&self) -> bool {
        self.capture_requested
    }

    pub fn solution(&self) -> Option<&RigidSolution> {
        self.solution.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self) -> Option<Role> {
        self.other_peer_id
            .and_then(|other| Role::elect(self.my_peer_id, other).ok())
    }

    pub fn progress(&self) -> AlignmentProgress {
        AlignmentProgress {
            state: self.state,
            other_peer_id: self.other_peer_id,
            a_count: self.samples.a().len(),
            b_count: self.samples.b().len(),
            sample_limit: self.samples.limit(),
            capture_requested: self.capture_requested,
        }
    }

    /// 새 협상 시작 (자기 ID 설정)
    pub fn init_my_peer(&mut self, my_peer_id: PeerId) {
        let generation = self.generation + 1;
        *self = Self::new(my_peer_id, self.samples.limit());
        self.generation = generation;
    }

    /// 상대 피어 설정
    pub fn init_other_peer(&mut self, other: PeerId) -> std::result::Result<Role, ProtocolError> {
        if self.state.is_acquiring() || self.state == AlignmentState::Confirming {
            return Err(self.unexpected("initOtherPeer"));
        }
        let role = Role::elect(self.my_peer_id, other)?;
        self.other_peer_id = Some(other);
        Ok(role)
    }

    /// 초기 상태로 되돌림
    pub fn reset(&mut self) {
        self.state = AlignmentState::Initial;
        self.other_peer_id = None;
        self.clear_negotiation();
    }

    /// 상태 강제 설정
    pub fn set_state(&mut self, state: AlignmentState) -> std::result::Result<(), ProtocolError> {
        match state {
            AlignmentState::Initial => {
                self.reset();
                return Ok(());
            }
            AlignmentState::Selecting => {
                if self.state != AlignmentState::Selecting {
                    self.other_peer_id = None;
                    self.clear_negotiation();
                }
            }
            AlignmentState::AcquiringAsHost | AlignmentState::AcquiringAsClient => {
                if self.other_peer_id.is_none() {
                    return Err(ProtocolError::NoCounterpart);
                }
                if !self.state.is_acquiring() {
                    self.clear_negotiation();
                }
            }
            AlignmentState::Confirming | AlignmentState::Prepared => {
                self.capture_requested = false;
            }
        }
        self.state = state;
        Ok(())
    }

    /// 샘플 캡처 요청 표시 (acquiring 상태에서만)
    pub fn request_capture(&mut self) -> std::result::Result<u64, ProtocolError> {
        if !self.state.is_acquiring() {
            return Err(self.unexpected("requestTransform"));
        }
        self.capture_requested = true;
        Ok(self.generation)
    }

    /// `captured_by` 피어가 캡처한 포즈 기록
    pub fn record_sample(
        &mut self,
        captured_by: PeerId,
        pose: Matrix4,
    ) -> std::result::Result<SampleOutcome, ProtocolError> {
        if !self.state.is_acquiring() {
            return Err(self.unexpected("setTransform"));
        }
        let other = self.other_peer_id.ok_or(ProtocolError::NoCounterpart)?;
        let role = Role::elect(self.my_peer_id, other)?;

        let capturer_role = if captured_by == self.my_peer_id {
            role
        } else if captured_by == other {
            role.opposite()
        } else {
            return Err(ProtocolError::UnexpectedPeer(captured_by));
        };

        self.capture_requested = false;
        Ok(self.push(capturer_role.side(), pose))
    }

    /// 지정한 목록에 직접 기록
    pub fn push_sample(
        &mut self,
        side: SampleSide,
        pose: Matrix4,
    ) -> std::result::Result<SampleOutcome, ProtocolError> {
        if !self.state.is_acquiring() {
            return Err(self.unexpected(match side {
                SampleSide::A => "setATransform",
                SampleSide::B => "setBTransform",
            }));
        }
        Ok(self.push(side, pose))
    }

    fn push(&mut self, side: SampleSide, pose: Matrix4) -> SampleOutcome {
        let accepted = self.samples.push(side, pose);
        if !accepted {
            debug!("Sample list {:?} already full ({}), dropping", side, self.samples.limit());
        }

        let entered_confirming = self.samples.is_complete();
        if entered_confirming {
            self.state = AlignmentState::Confirming;
        }

        SampleOutcome {
            side,
            accepted,
            pairs: self.samples.pairs(),
            entered_confirming,
        }
    }

    /// 수집한 샘플로 A→B, B→A 계산
    pub fn solve(&mut self, epsilon: f64) -> Result<&RigidSolution> {
        if self.state != AlignmentState::Confirming {
            return Err(self.unexpected("clacAffineMatrix").into());
        }
        let solution = solver::solve_pair(self.samples.a(), self.samples.b(), epsilon)?;
        Ok(self.solution.insert(solution))
    }

    /// 로컬 좌표계 → 상대 좌표계 변환
    pub fn local_to_other(&self) -> std::result::Result<(PeerId, Matrix4), ProtocolError> {
        let other = self.other_peer_id.ok_or(ProtocolError::NoCounterpart)?;
        let solution = self.solution.as_ref().ok_or(ProtocolError::NotSolved)?;
        let m = match Role::elect(self.my_peer_id, other)? {
            Role::Host => solution.a_to_b,
            Role::Client => solution.b_to_a,
        };
        Ok((other, m))
    }

    /// 호스트가 다음 샘플을 찍을 위치
    ///
    /// 첫 샘플 기준으로 2, 3, 4번째는 각각 +Y, +X, +Z 방향으로 `offset` 만큼
    pub fn guide_position(&self, offset: f64) -> Option<Vec3> {
        if self.role() != Some(Role::Host) {
            return None;
        }
        let own = self.samples.a();
        let first = own.first()?.position();
        let delta = match own.len() {
            1 => Vec3::new(0.0, offset, 0.0),
            2 => Vec3::new(offset, 0.0, 0.0),
            3 => Vec3::new(0.0, 0.0, offset),
            _ => Vec3::ZERO,
        };
        Some(first + delta)
    }

    pub fn set_pending(&mut self, pending: Vec<PendingOnboarding>) {
        self.pending = pending;
    }

    pub fn pending(&self) -> &[PendingOnboarding] {
        &self.pending
    }

    pub fn take_pending(&mut self) -> Vec<PendingOnboarding> {
        std::mem::take(&mut self.pending)
    }

    fn clear_negotiation(&mut self) {
        self.samples.clear();
        self.capture_requested = false;
        self.solution = None;
        self.pending.clear();
        self.generation += 1;
    }

    fn unexpected(&self, operation: &'static str) -> ProtocolError {
        ProtocolError::UnexpectedState {
            state: self.state,
            operation,
        }
    }
}
