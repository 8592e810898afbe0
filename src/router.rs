//! RPC 라우터
//!
//! `(scope, method)` 마다 핸들러 하나. 로컬 핸들러가 먼저 실행된 뒤에만 프레임을 전송 계층에 넘김.
//! 수신 핸들러가 실패하면 요청을 보낸 피어에게 `error` 엔벨로프를 돌려보냄

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::codec;
use crate::context::{PeerContext, PeerEvent};
use crate::error::{DispatchError, Error, Result};
use crate::message::*;
use crate::session::SampleSide;
use crate::stats::RpcStats;
use crate::transport::Transport;

/// 핸들러 집합 구분
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchScope {
    /// 브로드캐스트 송신 시 로컬 실행
    Broadcast,
    /// 유니캐스트 송신 시 로컬 실행
    Unicast,
    /// 원격 수신
    Receive,
}

impl DispatchScope {
    pub const ALL: [DispatchScope; 3] = [
        DispatchScope::Broadcast,
        DispatchScope::Unicast,
        DispatchScope::Receive,
    ];
}

impl fmt::Display for DispatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchScope::Broadcast => write!(f, "broadcast"),
            DispatchScope::Unicast => write!(f, "unicast"),
            DispatchScope::Receive => write!(f, "receive"),
        }
    }
}

/// 핸들러 (컨텍스트, 요청 원점 피어, 파라미터)
pub type Handler = Box<dyn Fn(&mut PeerContext, PeerId, &Param) -> Result<()> + Send + Sync>;

/// 유니캐스트 송신 시 로컬에서 아무것도 하지 않는 메서드
///
/// 수신 피어 좌표계로 변환된 페이로드이거나 응답용 메시지
pub const UNICAST_LOCAL_NOOPS: [Method; 5] = [
    Method::Painting(PaintingMethod::AddStrokePoint),
    Method::Painting(PaintingMethod::AddStrokes),
    Method::Painting(PaintingMethod::ConfirmTmpStrokes),
    Method::Alignment(AlignmentMethod::SetNewUserAffineMatrix),
    Method::Error(ErrorMethod::Error),
];

/// `Param` 변형 하나를 받는 핸들러 생성, 다른 변형이 오면 `InvalidRequest`
macro_rules! route {
    ($method:expr, $variant:ident, |$ctx:ident, $origin:pat_param, $p:pat_param| $body:expr) => {{
        let expected: Method = $method;
        let handler: Handler = Box::new(move |$ctx: &mut PeerContext, origin: PeerId, param: &Param| {
            let $origin = origin;
            match param {
                Param::$variant($p) => $body,
                other => Err(DispatchError::InvalidRequest {
                    method: expected,
                    param: other.method(),
                }
                .into()),
            }
        });
        handler
    }};
}

fn noop() -> Handler {
    Box::new(|_: &mut PeerContext, _: PeerId, _: &Param| Ok(()))
}

/// 모든 메서드의 기본 핸들러
fn default_handler(method: Method) -> Handler {
    use AlignmentMethod as A;
    use PaintingMethod as P;

    match method {
        Method::Alignment(A::InitMyPeer) => route!(method, InitMyPeer, |ctx, _, p| ctx.init_my_peer(p)),
        Method::Alignment(A::InitOtherPeer) => {
            route!(method, InitOtherPeer, |ctx, _, p| ctx.init_other_peer(p))
        }
        Method::Alignment(A::ResetPeer) => route!(method, ResetPeer, |ctx, _, _| ctx.reset_peer()),
        Method::Alignment(A::RequestTransform) => {
            route!(method, RequestTransform, |ctx, _, _| ctx.request_transform())
        }
        Method::Alignment(A::SetTransform) => route!(method, SetTransform, |ctx, _, p| ctx.set_transform(p)),
        Method::Alignment(A::SetATransform) => {
            route!(method, SetATransform, |ctx, _, p| ctx.set_side_transform(SampleSide::A, &p.a))
        }
        Method::Alignment(A::SetBTransform) => {
            route!(method, SetBTransform, |ctx, _, p| ctx.set_side_transform(SampleSide::B, &p.b))
        }
        Method::Alignment(A::CalcAffineMatrix) => {
            route!(method, CalcAffineMatrix, |ctx, _, _| ctx.calc_affine_matrix())
        }
        Method::Alignment(A::SetState) => route!(method, SetState, |ctx, _, p| ctx.set_state(p)),
        Method::Alignment(A::SetNewUserAffineMatrix) => {
            route!(method, SetNewUserAffineMatrix, |ctx, _, p| ctx.set_new_user_affine_matrix(p))
        }
        Method::Alignment(A::PrepareBroadcastNewUserAffineMatrix) => route!(
            method,
            PrepareBroadcastNewUserAffineMatrix,
            |ctx, _, p| ctx.prepare_broadcast_new_user_affine_matrix(p)
        ),

        Method::Painting(P::SetStrokeColor) => {
            route!(method, SetStrokeColor, |ctx, origin, p| ctx.set_stroke_color(origin, p))
        }
        Method::Painting(P::RemoveAllStroke) => {
            route!(method, RemoveAllStroke, |ctx, _, _| ctx.remove_all_stroke())
        }
        Method::Painting(P::RemoveStroke) => route!(method, RemoveStroke, |ctx, _, p| ctx.remove_stroke(p)),
        Method::Painting(P::AddStrokePoint) => {
            route!(method, AddStrokePoint, |ctx, origin, p| ctx.add_stroke_point(origin, p))
        }
        Method::Painting(P::AddStrokes) => route!(method, AddStrokes, |ctx, _, p| ctx.add_strokes(p)),
        Method::Painting(P::FinishStroke) => {
            route!(method, FinishStroke, |ctx, origin, p| ctx.finish_stroke(origin, p))
        }
        Method::Painting(P::ChangeFingerLineWidth) => route!(method, ChangeFingerLineWidth, |ctx, origin, p| {
            ctx.change_finger_line_width(origin, p)
        }),
        Method::Painting(P::ConfirmTmpStrokes) => {
            route!(method, ConfirmTmpStrokes, |ctx, _, p| ctx.confirm_tmp_strokes(p))
        }

        Method::Error(ErrorMethod::Error) => route!(method, Error, |ctx, origin, p| ctx.error(origin, p)),
    }
}

/// RPC 라우터
pub struct RpcRouter {
    routes: HashMap<(DispatchScope, Method), Handler>,
    transport: Arc<dyn Transport>,
    stats: Arc<RwLock<RpcStats>>,
}

impl RpcRouter {
    /// 기본 핸들러를 모두 등록한 라우터
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let mut router = Self::empty(transport);
        for scope in DispatchScope::ALL {
            for method in Method::all() {
                let handler = if scope == DispatchScope::Unicast && UNICAST_LOCAL_NOOPS.contains(&method) {
                    noop()
                } else {
                    default_handler(method)
                };
                router.add(scope, method, handler);
            }
        }
        router
    }

    /// 핸들러가 없는 라우터
    pub fn empty(transport: Arc<dyn Transport>) -> Self {
        Self {
            routes: HashMap::new(),
            transport,
            stats: Arc::new(RwLock::new(RpcStats::new())),
        }
    }

    /// 핸들러 등록 (기존 핸들러 교체)
    pub fn add(&mut self, scope: DispatchScope, method: Method, handler: Handler) {
        self.routes.insert((scope, method), handler);
    }

    pub fn remove(&mut self, scope: DispatchScope, method: Method) -> Option<Handler> {
        self.routes.remove(&(scope, method))
    }

    pub fn has_route(&self, scope: DispatchScope, method: Method) -> bool {
        self.routes.contains_key(&(scope, method))
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn stats(&self) -> Arc<RwLock<RpcStats>> {
        self.stats.clone()
    }

    /// 핸들러 실행
    ///
    /// 정렬 상태가 바뀌면 `StateChanged` 이벤트를 남김
    pub fn dispatch(&self, scope: DispatchScope, ctx: &mut PeerContext, origin: PeerId, param: &Param) -> Result<()> {
        let method = param.method();
        let handler = self
            .routes
            .get(&(scope, method))
            .ok_or(DispatchError::UnknownMethod(method))?;

        let before = ctx.alignment.state();
        let result = handler(&mut *ctx, origin, param);
        let after = ctx.alignment.state();

        if before != after {
            info!("{}: state {:?} -> {:?} ({})", ctx.peer_id, before, after, method);
            ctx.notify(PeerEvent::StateChanged { from: before, to: after });
        }

        if let Err(e) = &result {
            self.stats.write().record_handler_failure();
            debug!("{} handler {} from {} failed: {}", scope, method, origin, e);
        }
        result
    }

    /// 네트워크 없이 로컬에서만 실행
    pub fn dispatch_local(&self, ctx: &mut PeerContext, param: &Param) -> Result<()> {
        let origin = ctx.peer_id;
        self.dispatch(DispatchScope::Broadcast, ctx, origin, param)
    }

    /// 로컬 실행 후 연결된 모든 피어에게 전송, 보낸 피어 수 반환
    pub fn send_request(&self, ctx: &mut PeerContext, envelope: &RequestEnvelope) -> Result<usize> {
        self.dispatch(DispatchScope::Broadcast, ctx, envelope.origin_peer_id, &envelope.param)?;

        let frame = codec::encode(envelope)?;
        let len = frame.len();
        match self.transport.broadcast(frame) {
            Ok(sent) => {
                self.stats.write().record_sent(len, sent);
                debug!("Broadcast {} to {} peers ({} bytes)", envelope.method, sent, len);
                Ok(sent)
            }
            Err(e) => {
                self.stats.write().record_send_failure();
                warn!("Broadcast {} failed: {}", envelope.method, e);
                Err(e.into())
            }
        }
    }

    /// 로컬 실행(유니캐스트 핸들러) 후 `target` 하나에게 전송
    pub fn send_request_to(&self, ctx: &mut PeerContext, envelope: &RequestEnvelope, target: PeerId) -> Result<()> {
        self.dispatch(DispatchScope::Unicast, ctx, envelope.origin_peer_id, &envelope.param)?;
        self.forward_to(envelope, target)
    }

    /// 로컬 실행 후 `targets` 에게만 전송, 보낸 피어 수 반환
    ///
    /// 로컬 핸들러는 한 번만 실행됨. 개별 전송 실패는 건너뜀
    pub fn send_request_to_peers(
        &self,
        ctx: &mut PeerContext,
        envelope: &RequestEnvelope,
        targets: &[PeerId],
    ) -> Result<usize> {
        self.dispatch(DispatchScope::Broadcast, ctx, envelope.origin_peer_id, &envelope.param)?;
        Ok(targets
            .iter()
            .filter(|target| self.forward_to(envelope, **target).is_ok())
            .count())
    }

    /// 로컬 실행 없이 `target` 에게 전송
    ///
    /// 이미 로컬에서 처리한 요청을 여러 피어에게 나눠 보낼 때 사용
    pub fn forward_to(&self, envelope: &RequestEnvelope, target: PeerId) -> Result<()> {
        let frame = codec::encode(envelope)?;
        let len = frame.len();
        match self.transport.send_to(target, frame) {
            Ok(()) => {
                self.stats.write().record_sent(len, 1);
                debug!("Sent {} to {} ({} bytes)", envelope.method, target, len);
                Ok(())
            }
            Err(e) => {
                self.stats.write().record_send_failure();
                warn!("Send {} to {} failed: {}", envelope.method, target, e);
                Err(e.into())
            }
        }
    }

    /// 수신 프레임 처리
    ///
    /// 핸들러 실패 시 원점 피어에게 에러 엔벨로프를 보내고 원래 에러를 반환.
    /// `error` 요청의 실패는 되돌려 보내지 않음
    pub fn receive_request(&self, ctx: &mut PeerContext, frame: &[u8]) -> Result<RequestEnvelope> {
        let envelope = match codec::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.write().record_decode_failure(frame.len());
                warn!("{}: dropping undecodable frame ({} bytes): {}", ctx.peer_id, frame.len(), e);
                return Err(e.into());
            }
        };
        self.stats.write().record_received(envelope.method, frame.len());

        let origin = envelope.origin_peer_id;
        if let Err(e) = self.dispatch(DispatchScope::Receive, ctx, origin, &envelope.param) {
            if !envelope.method.is_error() && origin != ctx.peer_id {
                self.reply_error(ctx, origin, &envelope, &e);
            }
            return Err(e);
        }
        Ok(envelope)
    }

    fn reply_error(&self, ctx: &PeerContext, origin: PeerId, failed: &RequestEnvelope, cause: &Error) {
        let reply = ctx.request(Param::error(format!("{} failed: {}", failed.method, cause)));
        info!("{}: replying error for {} to {}", ctx.peer_id, failed.method, origin);
        if self.forward_to(&reply, origin).is_ok() {
            self.stats.write().record_error_reply();
        }
    }
}

impl fmt::Debug for RpcRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcRouter")
            .field("routes", &self.routes.len())
            .field("local_peer", &self.transport.local_peer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ProtocolError;
    use crate::matrix::Vec3;
    use crate::session::AlignmentState;
    use crate::transport::{EventReceiver, MemoryNetwork, TransportEvent};
    use uuid::Uuid;

    struct Node {
        ctx: PeerContext,
        router: RpcRouter,
        rx: EventReceiver,
    }

    fn mesh(ids: &[u64]) -> Vec<Node> {
        let network = MemoryNetwork::new();
        let mut nodes: Vec<Node> = ids
            .iter()
            .map(|&id| {
                let (transport, rx) = network.join(PeerId(id));
                Node {
                    ctx: PeerContext::new(PeerId(id), Config::default()),
                    router: RpcRouter::new(Arc::new(transport)),
                    rx,
                }
            })
            .collect();
        // 참여 알림 비우기
        for node in &mut nodes {
            while node.rx.try_recv().is_ok() {}
        }
        nodes
    }

    fn next_frame(rx: &mut EventReceiver) -> Option<bytes::Bytes> {
        match rx.try_recv() {
            Ok(TransportEvent::Received { frame, .. }) => Some(frame),
            _ => None,
        }
    }

    #[test]
    fn test_dispatch_is_total() {
        let nodes = mesh(&[1]);
        for scope in DispatchScope::ALL {
            for method in Method::all() {
                assert!(nodes[0].router.has_route(scope, method), "{} {}", scope, method);
            }
        }
    }

    #[test]
    fn test_unregistered_method_is_typed_error() {
        let mut nodes = mesh(&[1]);
        let node = &mut nodes[0];
        let method = Method::Painting(PaintingMethod::RemoveAllStroke);
        assert!(node.router.remove(DispatchScope::Receive, method).is_some());

        let result = node.router.dispatch(
            DispatchScope::Receive,
            &mut node.ctx,
            PeerId(2),
            &Param::RemoveAllStroke(EmptyParam {}),
        );
        assert!(matches!(
            result,
            Err(Error::Dispatch(DispatchError::UnknownMethod(m))) if m == method
        ));
    }

    #[test]
    fn test_mismatched_handler_rejects_param() {
        let mut nodes = mesh(&[1]);
        let node = &mut nodes[0];
        let method = Method::Painting(PaintingMethod::RemoveAllStroke);
        node.router.add(
            DispatchScope::Receive,
            method,
            default_handler(Method::Error(ErrorMethod::Error)),
        );

        let result = node.router.dispatch(
            DispatchScope::Receive,
            &mut node.ctx,
            PeerId(2),
            &Param::RemoveAllStroke(EmptyParam {}),
        );
        assert!(matches!(
            result,
            Err(Error::Dispatch(DispatchError::InvalidRequest { .. }))
        ));
    }

    #[test]
    fn test_local_failure_blocks_send() {
        let mut nodes = mesh(&[1, 2]);
        let (a, rest) = nodes.split_at_mut(1);
        let a = &mut a[0];

        // Initial 상태에서는 샘플 요청 불가
        let envelope = a.ctx.request(Param::RequestTransform(EmptyParam {}));
        let result = a.router.send_request_to(&mut a.ctx, &envelope, PeerId(2));
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::UnexpectedState { .. }))
        ));
        assert!(next_frame(&mut rest[0].rx).is_none());
        assert_eq!(a.router.stats().read().sent_envelopes, 0);
    }

    #[test]
    fn test_broadcast_runs_local_handler_first() {
        let mut nodes = mesh(&[1, 2, 3]);
        let (a, rest) = nodes.split_at_mut(1);
        let a = &mut a[0];

        let envelope = a.ctx.request(Param::SetStrokeColor(StrokeColorParam {
            stroke_color_name: "red".into(),
        }));
        assert_eq!(a.router.send_request(&mut a.ctx, &envelope).unwrap(), 2);

        for node in rest.iter_mut() {
            let frame = next_frame(&mut node.rx).unwrap();
            let received = node.router.receive_request(&mut node.ctx, &frame).unwrap();
            assert_eq!(received, envelope);
        }

        // 로컬에서도 같은 색으로 그려짐
        let stroke = Uuid::new_v4();
        a.ctx.drawing.add_point(PeerId(1), stroke, Vec3::ZERO);
        assert_eq!(a.ctx.drawing.strokes()[0].color, "red");
    }

    #[test]
    fn test_send_to_peers_reaches_only_targets() {
        let mut nodes = mesh(&[1, 2, 3]);
        let stroke_id = Uuid::new_v4();
        nodes[0].ctx.drawing.add_point(PeerId(1), stroke_id, Vec3::ZERO);

        let (a, rest) = nodes.split_at_mut(1);
        let a = &mut a[0];
        let envelope = a.ctx.request(Param::FinishStroke(StrokeIdParam { stroke_id }));
        let sent = a
            .router
            .send_request_to_peers(&mut a.ctx, &envelope, &[PeerId(3), PeerId(9)])
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(a.ctx.drawing.strokes().len(), 1);
        assert_eq!(a.router.stats().read().send_failures, 1);

        assert!(next_frame(&mut rest[0].rx).is_none());
        let frame = next_frame(&mut rest[1].rx).unwrap();
        assert_eq!(codec::decode(&frame).unwrap(), envelope);
    }

    #[test]
    fn test_unicast_noop_leaves_local_model() {
        let mut nodes = mesh(&[1, 2]);
        let (a, rest) = nodes.split_at_mut(1);
        let (a, b) = (&mut a[0], &mut rest[0]);

        let stroke_id = Uuid::new_v4();
        let envelope = a.ctx.request(Param::AddStrokePoint(StrokePointParam {
            stroke_id,
            point: [0.1, 0.2, 0.3],
        }));
        a.router.send_request_to(&mut a.ctx, &envelope, PeerId(2)).unwrap();
        assert!(a.ctx.drawing.strokes().is_empty());

        let frame = next_frame(&mut b.rx).unwrap();
        b.router.receive_request(&mut b.ctx, &frame).unwrap();
        assert_eq!(b.ctx.drawing.active_stroke(PeerId(1)), Some(stroke_id));
    }

    #[test]
    fn test_failure_replies_error_once() {
        let mut nodes = mesh(&[1, 2]);
        let (a, rest) = nodes.split_at_mut(1);
        let (a, b) = (&mut a[0], &mut rest[0]);

        let envelope = a.ctx.request(Param::RemoveStroke(StrokeIdParam {
            stroke_id: Uuid::new_v4(),
        }));
        a.router.send_request_to(&mut a.ctx, &envelope, PeerId(2)).unwrap_err();

        // 로컬 실패로 전송되지 않았으므로 직접 프레임을 만들어 보냄
        let frame = codec::encode(&envelope).unwrap();
        assert!(b.router.receive_request(&mut b.ctx, &frame).is_err());
        assert_eq!(b.router.stats().read().error_replies, 1);

        let reply = next_frame(&mut a.rx).unwrap();
        let received = a.router.receive_request(&mut a.ctx, &reply).unwrap();
        assert!(received.method.is_error());
        assert_eq!(a.ctx.last_remote_error.as_ref().map(|(p, _)| *p), Some(PeerId(2)));

        // 에러 수신은 다시 에러를 만들지 않음
        assert!(next_frame(&mut b.rx).is_none());
    }

    #[test]
    fn test_state_change_is_notified() {
        let mut nodes = mesh(&[1]);
        let node = &mut nodes[0];
        node.router
            .dispatch_local(
                &mut node.ctx,
                &Param::SetState(SetStateParam {
                    state: AlignmentState::Selecting,
                }),
            )
            .unwrap();

        assert!(node.ctx.take_effects().contains(&crate::context::Effect::Notify(
            PeerEvent::StateChanged {
                from: AlignmentState::Initial,
                to: AlignmentState::Selecting,
            }
        )));
    }

    #[test]
    fn test_corrupted_frame_counts_decode_failure() {
        let mut nodes = mesh(&[1]);
        let node = &mut nodes[0];
        assert!(node.router.receive_request(&mut node.ctx, b"garbage").is_err());
        assert_eq!(node.router.stats().read().decode_failures, 1);
    }
}
