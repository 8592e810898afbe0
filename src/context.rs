//! 피어 세션 컨텍스트
//!
//! 라우터 핸들러가 변경하는 모든 상태(정렬 세션, 변환 레지스트리, 드로잉 모델)를
//! 하나로 묶음. 전역 상태가 없으므로 한 프로세스에 여러 피어를 둘 수 있음.
//!
//! 핸들러는 네트워크를 직접 건드리지 않고, 지연 캡처 예약이나 이벤트 알림 같은
//! 부수 효과를 [`Effect`] 로 쌓아 둠. 소유 액터가 디스패치 후 꺼내서 처리함

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::drawing::{DrawingModel, StrokeCanvas};
use crate::error::{ProtocolError, Result};
use crate::matrix::{Matrix4, Vec3, WireMatrix};
use crate::message::*;
use crate::registry::TransformRegistry;
use crate::session::{AlignmentSession, AlignmentState, SampleSide};

/// 외부로 알리는 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    StateChanged {
        from: AlignmentState,
        to: AlignmentState,
    },
    CaptureRequested,
    SampleRecorded {
        captured_by: PeerId,
        side: SampleSide,
        pairs: usize,
    },
    TransformResolved {
        peer: PeerId,
        local_to_peer: Matrix4,
    },
    PeerForgotten(PeerId),
    RemoteError {
        origin: PeerId,
        message: String,
    },
}

/// 핸들러가 남기는 부수 효과
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// `delay` 후 손가락 포즈 캡처 (generation 이 바뀌면 무효)
    ScheduleCapture { generation: u64, delay: Duration },
    /// 예약된 캡처 취소
    CancelCapture,
    Notify(PeerEvent),
}

/// 피어 하나의 세션 컨텍스트
pub struct PeerContext {
    pub peer_id: PeerId,
    pub config: Config,
    pub alignment: AlignmentSession,
    pub registry: TransformRegistry,
    pub drawing: Box<dyn DrawingModel>,
    /// 손 추적기가 마지막으로 보고한 검지 끝 포즈
    pub latest_fingertip: Option<Matrix4>,
    pub last_remote_error: Option<(PeerId, String)>,
    effects: Vec<Effect>,
}

impl PeerContext {
    pub fn new(peer_id: PeerId, config: Config) -> Self {
        Self::with_drawing(peer_id, config, Box::new(StrokeCanvas::new()))
    }

    pub fn with_drawing(peer_id: PeerId, config: Config, drawing: Box<dyn DrawingModel>) -> Self {
        Self {
            peer_id,
            alignment: AlignmentSession::new(peer_id, config.sample_limit),
            registry: TransformRegistry::new(config.singular_epsilon),
            drawing,
            latest_fingertip: None,
            last_remote_error: None,
            effects: Vec::new(),
            config,
        }
    }

    /// 이 피어가 보내는 요청 생성
    pub fn request(&self, param: Param) -> RequestEnvelope {
        RequestEnvelope::new(self.peer_id, param)
    }

    pub fn push_effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub fn notify(&mut self, event: PeerEvent) {
        self.effects.push(Effect::Notify(event));
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// 레지스트리에 변환 등록
    pub fn register_transform(&mut self, peer: PeerId, local_to_peer: Matrix4) -> Result<()> {
        self.registry.insert(peer, local_to_peer)?;
        info!("Transform resolved: {} -> {}", self.peer_id, peer);
        self.notify(PeerEvent::TransformResolved { peer, local_to_peer });
        Ok(())
    }

    /// 레지스트리에서 변환 삭제
    pub fn forget_transform(&mut self, peer: PeerId) -> bool {
        let removed = self.registry.remove(peer).is_some();
        if removed {
            info!("Transform forgotten: {}", peer);
            self.notify(PeerEvent::PeerForgotten(peer));
        }
        removed
    }

    // ---- alignment ----

    pub fn init_my_peer(&mut self, param: &PeerIdParam) -> Result<()> {
        if param.peer_id != self.peer_id {
            return Err(ProtocolError::UnexpectedPeer(param.peer_id).into());
        }
        self.alignment.init_my_peer(param.peer_id);
        self.push_effect(Effect::CancelCapture);
        Ok(())
    }

    pub fn init_other_peer(&mut self, param: &PeerIdParam) -> Result<()> {
        let role = self.alignment.init_other_peer(param.peer_id)?;
        debug!("Counterpart {} selected, role {:?}", param.peer_id, role);
        Ok(())
    }

    pub fn reset_peer(&mut self) -> Result<()> {
        self.alignment.reset();
        self.push_effect(Effect::CancelCapture);
        Ok(())
    }

    pub fn request_transform(&mut self) -> Result<()> {
        let generation = self.alignment.request_capture()?;
        self.push_effect(Effect::ScheduleCapture {
            generation,
            delay: self.config.sample_delay(),
        });
        self.notify(PeerEvent::CaptureRequested);
        Ok(())
    }

    pub fn set_transform(&mut self, param: &SetTransformParam) -> Result<()> {
        let pose = Matrix4::from_wire(&param.matrix);
        let outcome = self.alignment.record_sample(param.peer_id, pose)?;
        if outcome.accepted {
            info!(
                "Sample from {} recorded in {:?} ({}/{} pairs)",
                param.peer_id,
                outcome.side,
                outcome.pairs,
                self.alignment.samples().limit()
            );
            self.notify(PeerEvent::SampleRecorded {
                captured_by: param.peer_id,
                side: outcome.side,
                pairs: outcome.pairs,
            });
        }
        Ok(())
    }

    pub fn set_side_transform(&mut self, side: SampleSide, matrix: &WireMatrix) -> Result<()> {
        let outcome = self.alignment.push_sample(side, Matrix4::from_wire(matrix))?;
        if outcome.accepted {
            let captured_by = match (self.alignment.role(), side) {
                (Some(role), side) if role.side() == side => self.peer_id,
                _ => self.alignment.other_peer_id().unwrap_or(self.peer_id),
            };
            self.notify(PeerEvent::SampleRecorded {
                captured_by,
                side,
                pairs: outcome.pairs,
            });
        }
        Ok(())
    }

    pub fn calc_affine_matrix(&mut self) -> Result<()> {
        let epsilon = self.config.singular_epsilon;
        let solution = self.alignment.solve(epsilon)?;
        info!("Affine matrix solved, rms error {:.4} m", solution.rms_error);
        Ok(())
    }

    pub fn set_state(&mut self, param: &SetStateParam) -> Result<()> {
        self.alignment.set_state(param.state)?;
        if param.state == AlignmentState::Initial {
            self.push_effect(Effect::CancelCapture);
        }
        Ok(())
    }

    pub fn set_new_user_affine_matrix(&mut self, param: &SetNewUserAffineMatrixParam) -> Result<()> {
        self.register_transform(param.new_peer_id, Matrix4::from_wire(&param.affine_matrix))
    }

    pub fn prepare_broadcast_new_user_affine_matrix(&mut self, param: &NewPeerParam) -> Result<()> {
        let (other, local_to_other) = self.alignment.local_to_other()?;
        if other != param.new_peer_id {
            return Err(ProtocolError::UnexpectedPeer(param.new_peer_id).into());
        }
        let pending = self.registry.prepare_onboarding(other, &local_to_other)?;
        debug!("{} onboarding pairs prepared for {}", pending.len(), other);
        self.alignment.set_pending(pending);
        Ok(())
    }

    // ---- painting ----

    pub fn set_stroke_color(&mut self, author: PeerId, param: &StrokeColorParam) -> Result<()> {
        Ok(self.drawing.set_stroke_color(author, &param.stroke_color_name)?)
    }

    pub fn remove_all_stroke(&mut self) -> Result<()> {
        self.drawing.remove_all();
        Ok(())
    }

    pub fn remove_stroke(&mut self, param: &StrokeIdParam) -> Result<()> {
        Ok(self.drawing.remove_stroke(param.stroke_id)?)
    }

    pub fn add_stroke_point(&mut self, author: PeerId, param: &StrokePointParam) -> Result<()> {
        self.drawing
            .add_point(author, param.stroke_id, Vec3::from_wire(&param.point));
        Ok(())
    }

    pub fn add_strokes(&mut self, param: &StrokesParam) -> Result<()> {
        self.drawing.add_tmp_strokes(param.strokes.clone());
        Ok(())
    }

    pub fn finish_stroke(&mut self, author: PeerId, param: &StrokeIdParam) -> Result<()> {
        Ok(self.drawing.finish_stroke(author, param.stroke_id)?)
    }

    pub fn change_finger_line_width(&mut self, author: PeerId, param: &ToolParam) -> Result<()> {
        Ok(self.drawing.change_line_width(author, &param.tool_name)?)
    }

    pub fn confirm_tmp_strokes(&mut self, param: &StrokesParam) -> Result<()> {
        self.drawing.confirm_tmp_strokes(param.strokes.clone());
        Ok(())
    }

    // ---- error ----

    pub fn error(&mut self, origin: PeerId, param: &ErrorParam) -> Result<()> {
        warn!("Remote error from {}: {}", origin, param.error_message);
        self.last_remote_error = Some((origin, param.error_message.clone()));
        self.notify(PeerEvent::RemoteError {
            origin,
            message: param.error_message.clone(),
        });
        Ok(())
    }
}

impl std::fmt::Debug for PeerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerContext")
            .field("peer_id", &self.peer_id)
            .field("alignment", &self.alignment)
            .field("registry", &self.registry)
            .field("effects", &self.effects.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(id: u64) -> PeerContext {
        PeerContext::new(PeerId(id), Config::default())
    }

    #[test]
    fn test_request_transform_schedules_capture() {
        let mut ctx = context(1);
        assert!(ctx.request_transform().is_err());
        assert!(ctx.take_effects().is_empty());

        ctx.alignment.set_state(AlignmentState::Selecting).unwrap();
        ctx.init_other_peer(&PeerIdParam { peer_id: PeerId(2) }).unwrap();
        ctx.alignment.set_state(AlignmentState::AcquiringAsHost).unwrap();
        ctx.request_transform().unwrap();

        let effects = ctx.take_effects();
        assert!(matches!(
            effects[0],
            Effect::ScheduleCapture { delay, .. } if delay == Duration::from_secs(3)
        ));
        assert_eq!(effects[1], Effect::Notify(PeerEvent::CaptureRequested));
        assert!(ctx.alignment.capture_requested());
    }

    #[test]
    fn test_reset_cancels_capture() {
        let mut ctx = context(1);
        ctx.reset_peer().unwrap();
        assert_eq!(ctx.take_effects(), vec![Effect::CancelCapture]);
    }

    #[test]
    fn test_init_my_peer_rejects_foreign_id() {
        let mut ctx = context(1);
        assert!(ctx.init_my_peer(&PeerIdParam { peer_id: PeerId(5) }).is_err());
        ctx.init_my_peer(&PeerIdParam { peer_id: PeerId(1) }).unwrap();
        assert_eq!(ctx.alignment.state(), AlignmentState::Initial);
    }

    #[test]
    fn test_remote_error_recorded() {
        let mut ctx = context(1);
        ctx.error(PeerId(3), &ErrorParam {
            error_message: "nope".into(),
        })
        .unwrap();
        assert_eq!(ctx.last_remote_error, Some((PeerId(3), "nope".to_string())));
    }

    #[test]
    fn test_new_user_matrix_stored() {
        let mut ctx = context(1);
        let m = Matrix4::translation(Vec3::new(1.0, 0.0, 0.0));
        ctx.set_new_user_affine_matrix(&SetNewUserAffineMatrixParam {
            new_peer_id: PeerId(4),
            affine_matrix: m.to_wire(),
        })
        .unwrap();
        assert_eq!(ctx.registry.get(PeerId(4)), Some(&m));
        assert!(ctx.forget_transform(PeerId(4)));
        assert!(!ctx.forget_transform(PeerId(4)));
    }
}
