//! 피어 (동기 코어)
//!
//! 컨텍스트와 라우터를 묶어 운영자 조작(설정 시작, 상대 선택, 샘플링, 확정, 드로잉)을
//! 요청 엔벨로프로 바꿔 디스패치함. 네트워크 왕복을 기다리는 연산은 없음.
//! 지연 캡처 예약 같은 부수 효과는 [`Peer::take_effects`] 로 꺼내 소유자가 처리함

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::context::{Effect, PeerContext};
use crate::drawing::{DrawingModel, Stroke};
use crate::error::{Error, ProtocolError, Result};
use crate::matrix::{Matrix4, Vec3};
use crate::message::*;
use crate::registry::TransformRegistry;
use crate::router::RpcRouter;
use crate::session::{AlignmentProgress, AlignmentState, Role};
use crate::stats::RpcStats;
use crate::transport::{Transport, TransportEvent};

/// 피어 하나
#[derive(Debug)]
pub struct Peer {
    ctx: PeerContext,
    router: RpcRouter,
}

impl Peer {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        let peer_id = transport.local_peer();
        Self {
            ctx: PeerContext::new(peer_id, config),
            router: RpcRouter::new(transport),
        }
    }

    /// 드로잉 모델을 지정해서 생성
    pub fn with_drawing(config: Config, transport: Arc<dyn Transport>, drawing: Box<dyn DrawingModel>) -> Self {
        let peer_id = transport.local_peer();
        Self {
            ctx: PeerContext::with_drawing(peer_id, config, drawing),
            router: RpcRouter::new(transport),
        }
    }

    pub fn id(&self) -> PeerId {
        self.ctx.peer_id
    }

    pub fn context(&self) -> &PeerContext {
        &self.ctx
    }

    pub fn router(&self) -> &RpcRouter {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut RpcRouter {
        &mut self.router
    }

    pub fn registry(&self) -> &TransformRegistry {
        &self.ctx.registry
    }

    pub fn progress(&self) -> AlignmentProgress {
        self.ctx.alignment.progress()
    }

    pub fn stats(&self) -> RpcStats {
        self.router.stats().read().clone()
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        self.ctx.take_effects()
    }

    // ---- alignment ----

    /// 손 추적기 입력
    pub fn update_fingertip(&mut self, pose: Matrix4) {
        self.ctx.latest_fingertip = Some(pose);
    }

    /// 설정 시작: 새 세션을 만들고 Selecting 으로
    pub fn begin_setup(&mut self) -> Result<()> {
        let me = self.id();
        self.local(Param::InitMyPeer(PeerIdParam { peer_id: me }))?;
        self.local(Param::SetState(SetStateParam {
            state: AlignmentState::Selecting,
        }))
    }

    /// 상대 선택, 선출된 역할의 acquiring 상태로 진입
    pub fn select_peer(&mut self, other: PeerId) -> Result<Role> {
        let state = self.ctx.alignment.state();
        if state != AlignmentState::Selecting {
            return Err(ProtocolError::UnexpectedState {
                state,
                operation: "selectPeer",
            }
            .into());
        }

        self.local(Param::InitOtherPeer(PeerIdParam { peer_id: other }))?;
        let role = Role::elect(self.id(), other)?;
        self.local(Param::SetState(SetStateParam {
            state: role.acquiring_state(),
        }))?;
        info!("{}: paired with {} as {:?}", self.id(), other, role);
        Ok(role)
    }

    /// 호스트가 샘플 한 쌍을 요청
    ///
    /// 양쪽 모두 지연 캡처가 예약됨
    pub fn request_sample(&mut self) -> Result<()> {
        let state = self.ctx.alignment.state();
        if self.ctx.alignment.role() != Some(Role::Host) || state != AlignmentState::AcquiringAsHost {
            return Err(ProtocolError::UnexpectedState {
                state,
                operation: "requestTransform",
            }
            .into());
        }
        let other = self.counterpart()?;
        let envelope = self.ctx.request(Param::RequestTransform(EmptyParam {}));
        self.router.send_request_to(&mut self.ctx, &envelope, other)
    }

    /// 예약된 캡처 실행
    ///
    /// 그 사이 세션이 리셋되었거나 acquiring 상태가 아니면 `Ok(false)`
    pub fn on_capture(&mut self, generation: u64) -> Result<bool> {
        if generation != self.ctx.alignment.generation() || !self.ctx.alignment.state().is_acquiring() {
            debug!("{}: stale capture (generation {}) ignored", self.id(), generation);
            return Ok(false);
        }
        self.capture_sample()?;
        Ok(true)
    }

    /// 현재 손가락 포즈를 샘플로 기록하고 상대에게 전송
    pub fn capture_sample(&mut self) -> Result<()> {
        let pose = self.ctx.latest_fingertip.ok_or(ProtocolError::NoFingertipPose)?;
        let other = self.counterpart()?;
        let envelope = self.ctx.request(Param::SetTransform(SetTransformParam {
            peer_id: self.id(),
            matrix: pose.to_wire(),
        }));
        self.router.send_request_to(&mut self.ctx, &envelope, other)
    }

    /// 확정
    ///
    /// 아핀 행렬을 계산하고, 상대와의 변환을 등록한 뒤 기존 피어들과의 합성 변환을 양쪽에 보냄.
    /// 계산이 실패하면 Confirming 에 머무름
    pub fn confirm(&mut self) -> Result<Matrix4> {
        self.local(Param::CalcAffineMatrix(EmptyParam {}))?;
        let (other, local_to_other) = self.ctx.alignment.local_to_other()?;

        self.local(Param::PrepareBroadcastNewUserAffineMatrix(NewPeerParam { new_peer_id: other }))?;
        let pending = self.ctx.alignment.take_pending();
        self.ctx.register_transform(other, local_to_other)?;

        for pair in &pending {
            let to_newcomer = self.ctx.request(Param::SetNewUserAffineMatrix(SetNewUserAffineMatrixParam {
                new_peer_id: pair.already_peer_id,
                affine_matrix: pair.new_to_already.to_wire(),
            }));
            if let Err(e) = self.router.send_request_to(&mut self.ctx, &to_newcomer, pair.new_peer_id) {
                warn!("{}: onboarding {} -> {} not sent: {}", self.id(), pair.new_peer_id, pair.already_peer_id, e);
            }

            let to_already = self.ctx.request(Param::SetNewUserAffineMatrix(SetNewUserAffineMatrixParam {
                new_peer_id: pair.new_peer_id,
                affine_matrix: pair.already_to_new.to_wire(),
            }));
            if let Err(e) = self.router.send_request_to(&mut self.ctx, &to_already, pair.already_peer_id) {
                warn!("{}: onboarding {} -> {} not sent: {}", self.id(), pair.already_peer_id, pair.new_peer_id, e);
            }
        }

        self.local(Param::SetState(SetStateParam {
            state: AlignmentState::Prepared,
        }))?;
        info!("{}: alignment with {} prepared ({} peers onboarded)", self.id(), other, pending.len());
        Ok(local_to_other)
    }

    /// 설정 중단, 상대에게도 리셋 요청
    pub fn abort_setup(&mut self) -> Result<()> {
        let negotiating = matches!(
            self.ctx.alignment.state(),
            AlignmentState::AcquiringAsHost | AlignmentState::AcquiringAsClient | AlignmentState::Confirming
        );
        let Some(other) = self.ctx.alignment.other_peer_id().filter(|_| negotiating) else {
            return self.local(Param::ResetPeer(EmptyParam {}));
        };

        let envelope = self.ctx.request(Param::ResetPeer(EmptyParam {}));
        match self.router.send_request_to(&mut self.ctx, &envelope, other) {
            Err(Error::Transport(e)) => {
                warn!("{}: reset not delivered to {}: {}", self.id(), other, e);
                Ok(())
            }
            result => result,
        }
    }

    /// 다음 샘플을 찍을 위치 (호스트만)
    pub fn guide_position(&self) -> Option<Vec3> {
        self.ctx.alignment.guide_position(self.ctx.config.guide_offset)
    }

    // ---- painting ----

    /// 스트로크에 점 추가
    ///
    /// 로컬 모델에 추가한 뒤, 정렬된 피어마다 그 좌표계로 옮겨 유니캐스트
    pub fn draw_point(&mut self, stroke_id: Uuid, point: Vec3) -> Result<usize> {
        self.local(Param::AddStrokePoint(StrokePointParam {
            stroke_id,
            point: point.to_wire(),
        }))?;

        let mut sent = 0;
        for (peer, m) in self.aligned_peers() {
            let envelope = self.ctx.request(Param::AddStrokePoint(StrokePointParam {
                stroke_id,
                point: m.transform_point(point).to_wire(),
            }));
            match self.router.send_request_to(&mut self.ctx, &envelope, peer) {
                Ok(()) => sent += 1,
                Err(e) => debug!("{}: point for {} dropped: {}", self.id(), peer, e),
            }
        }
        Ok(sent)
    }

    pub fn finish_stroke(&mut self, stroke_id: Uuid) -> Result<usize> {
        self.share(Param::FinishStroke(StrokeIdParam { stroke_id }))
    }

    /// 붓 설정은 좌표계와 무관하므로 연결된 모든 피어에게 브로드캐스트
    pub fn set_stroke_color(&mut self, color: &str) -> Result<usize> {
        self.broadcast(Param::SetStrokeColor(StrokeColorParam {
            stroke_color_name: color.to_string(),
        }))
    }

    pub fn change_line_width(&mut self, tool: &str) -> Result<usize> {
        self.broadcast(Param::ChangeFingerLineWidth(ToolParam {
            tool_name: tool.to_string(),
        }))
    }

    pub fn remove_stroke(&mut self, stroke_id: Uuid) -> Result<usize> {
        self.share(Param::RemoveStroke(StrokeIdParam { stroke_id }))
    }

    pub fn remove_all_strokes(&mut self) -> Result<usize> {
        self.share(Param::RemoveAllStroke(EmptyParam {}))
    }

    /// 불러온 스트로크를 임시 목록에 넣고 정렬된 피어들과 공유
    pub fn share_strokes(&mut self, strokes: Vec<Stroke>) -> Result<usize> {
        self.local(Param::AddStrokes(StrokesParam {
            strokes: strokes.clone(),
        }))?;
        self.send_transformed(&strokes, |strokes| Param::AddStrokes(StrokesParam { strokes }))
    }

    /// 임시 스트로크 전부 확정
    pub fn confirm_shared_strokes(&mut self) -> Result<usize> {
        let strokes = self.ctx.drawing.tmp_strokes();
        self.local(Param::ConfirmTmpStrokes(StrokesParam {
            strokes: strokes.clone(),
        }))?;
        self.send_transformed(&strokes, |strokes| Param::ConfirmTmpStrokes(StrokesParam { strokes }))
    }

    pub fn strokes(&self) -> Vec<Stroke> {
        self.ctx.drawing.strokes()
    }

    // ---- membership ----

    /// 레지스트리에서 피어 삭제
    pub fn forget_peer(&mut self, peer: PeerId) -> bool {
        self.ctx.forget_transform(peer)
    }

    pub fn on_peer_found(&mut self, peer: PeerId) {
        debug!("{}: peer {} found", self.id(), peer);
    }

    /// 피어 이탈
    ///
    /// 협상 중인 상대였으면 세션을 리셋하고, 설정에 따라 레지스트리에서도 지움
    pub fn on_peer_lost(&mut self, peer: PeerId) -> Result<()> {
        let state = self.ctx.alignment.state();
        if self.ctx.alignment.other_peer_id() == Some(peer) && state != AlignmentState::Prepared {
            warn!("{}: counterpart {} lost during {:?}, resetting", self.id(), peer, state);
            self.local(Param::ResetPeer(EmptyParam {}))?;
        }
        if self.ctx.config.forget_lost_peers {
            self.forget_peer(peer);
        }
        Ok(())
    }

    /// 수신 프레임 처리
    pub fn handle_frame(&mut self, from: PeerId, frame: &[u8]) -> Result<RequestEnvelope> {
        let envelope = self.router.receive_request(&mut self.ctx, frame)?;
        if envelope.origin_peer_id != from {
            debug!("{}: {} relayed by {} for {}", self.id(), envelope.method, from, envelope.origin_peer_id);
        }
        Ok(envelope)
    }

    /// 전송 이벤트 처리
    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::PeerFound(peer) => {
                self.on_peer_found(peer);
                Ok(())
            }
            TransportEvent::PeerLost(peer) => self.on_peer_lost(peer),
            TransportEvent::Received { from, frame } => self.handle_received(from, frame),
        }
    }

    fn handle_received(&mut self, from: PeerId, frame: Bytes) -> Result<()> {
        self.handle_frame(from, &frame).map(|_| ())
    }

    // ---- internal ----

    fn local(&mut self, param: Param) -> Result<()> {
        self.router.dispatch_local(&mut self.ctx, &param)
    }

    fn counterpart(&self) -> Result<PeerId> {
        Ok(self.ctx.alignment.other_peer_id().ok_or(ProtocolError::NoCounterpart)?)
    }

    fn aligned_peers(&self) -> Vec<(PeerId, Matrix4)> {
        self.ctx.registry.iter().map(|(peer, m)| (peer, *m)).collect()
    }

    fn broadcast(&mut self, param: Param) -> Result<usize> {
        let envelope = self.ctx.request(param);
        self.router.send_request(&mut self.ctx, &envelope)
    }

    /// 로컬 실행 후 정렬된 피어들에게 그대로 전달
    fn share(&mut self, param: Param) -> Result<usize> {
        let envelope = self.ctx.request(param);
        let targets: Vec<PeerId> = self.ctx.registry.peers().collect();
        self.router.send_request_to_peers(&mut self.ctx, &envelope, &targets)
    }

    fn send_transformed<F>(&mut self, strokes: &[Stroke], make: F) -> Result<usize>
    where
        F: Fn(Vec<Stroke>) -> Param,
    {
        let mut sent = 0;
        for (peer, m) in self.aligned_peers() {
            let transformed = strokes.iter().map(|s| s.transformed(&m)).collect();
            let envelope = self.ctx.request(make(transformed));
            match self.router.send_request_to(&mut self.ctx, &envelope, peer) {
                Ok(()) => sent += 1,
                Err(e) => debug!("{}: strokes for {} dropped: {}", self.id(), peer, e),
            }
        }
        Ok(sent)
    }
}
