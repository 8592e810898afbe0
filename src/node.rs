//! 피어 노드 (tokio 액터)
//!
//! [`Peer`] 를 단일 태스크가 소유하고, 운영자 조작과 전송 이벤트를 명령 큐로 받아 순서대로 처리함.
//! 지연 캡처는 세대 번호를 가진 sleep 태스크로 예약하며 리셋 시 abort 됨.
//! 외부에는 진행 상황/통계/레지스트리 스냅샷과 [`PeerEvent`] 채널을 노출

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::context::{Effect, PeerEvent};
use crate::drawing::Stroke;
use crate::error::{Error, Result};
use crate::matrix::{Matrix4, Vec3};
use crate::message::PeerId;
use crate::peer::Peer;
use crate::session::{AlignmentProgress, AlignmentState, Role};
use crate::stats::RpcStats;
use crate::transport::{EventReceiver, Transport, TransportEvent};

/// 이벤트 채널 수신기 타입
pub type PeerEventReceiver = mpsc::Receiver<PeerEvent>;

/// 스냅샷을 갱신한 뒤에 호출자에게 결과를 돌려주는 응답
type Reply = Box<dyn FnOnce() + Send>;

type PeerCall = Box<dyn FnOnce(&mut Peer) -> Reply + Send>;

/// 내부 명령
enum NodeCmd {
    Call(PeerCall),
    Transport(TransportEvent),
    Capture(u64),
    Stop,
}

/// 노드 상태 스냅샷 (명령 처리 후, 호출 응답 전에 갱신)
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub progress: AlignmentProgress,
    pub stats: RpcStats,
    pub registry: Vec<(PeerId, Matrix4)>,
}

impl NodeSnapshot {
    fn of(peer: &Peer) -> Self {
        Self {
            progress: peer.progress(),
            stats: peer.stats(),
            registry: peer.registry().iter().map(|(p, m)| (p, *m)).collect(),
        }
    }

    pub fn transform_to(&self, peer: PeerId) -> Option<Matrix4> {
        self.registry.iter().find(|(p, _)| *p == peer).map(|(_, m)| *m)
    }
}

/// 노드 내부 상태 (단일 태스크에서만 접근)
struct NodeInner {
    peer: Peer,
    cmd_tx: mpsc::Sender<NodeCmd>,
    events_tx: mpsc::Sender<PeerEvent>,
    snapshot: Arc<RwLock<NodeSnapshot>>,
    capture: Option<JoinHandle<()>>,
}

impl NodeInner {
    fn handle(&mut self, cmd: NodeCmd) {
        let reply = match cmd {
            NodeCmd::Call(call) => Some(call(&mut self.peer)),
            NodeCmd::Transport(event) => {
                if let Err(e) = self.peer.handle_transport_event(event) {
                    debug!("{}: inbound request failed: {}", self.peer.id(), e);
                }
                None
            }
            NodeCmd::Capture(generation) => {
                match self.peer.on_capture(generation) {
                    Ok(true) => debug!("{}: sample captured (generation {})", self.peer.id(), generation),
                    Ok(false) => {}
                    Err(e) => warn!("{}: capture failed: {}", self.peer.id(), e),
                }
                None
            }
            NodeCmd::Stop => None,
        };
        self.apply_effects();
        *self.snapshot.write() = NodeSnapshot::of(&self.peer);

        // 응답을 받은 호출자는 항상 갱신된 스냅샷을 봄
        if let Some(reply) = reply {
            reply();
        }
    }

    fn apply_effects(&mut self) {
        for effect in self.peer.take_effects() {
            match effect {
                Effect::ScheduleCapture { generation, delay } => self.schedule_capture(generation, delay),
                Effect::CancelCapture => self.cancel_capture(),
                Effect::Notify(event) => {
                    if let Err(e) = self.events_tx.try_send(event) {
                        debug!("{}: event dropped: {}", self.peer.id(), e);
                    }
                }
            }
        }
    }

    fn schedule_capture(&mut self, generation: u64, delay: Duration) {
        self.cancel_capture();
        let cmd_tx = self.cmd_tx.clone();
        self.capture = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(NodeCmd::Capture(generation)).await;
        }));
        debug!("{}: capture scheduled in {:?}", self.peer.id(), delay);
    }

    fn cancel_capture(&mut self) {
        if let Some(handle) = self.capture.take() {
            handle.abort();
        }
    }
}

/// 노드 핸들 (외부에서 제어용)
#[derive(Clone)]
pub struct PeerNode {
    peer_id: PeerId,
    cmd_tx: mpsc::Sender<NodeCmd>,
    snapshot: Arc<RwLock<NodeSnapshot>>,
    running: Arc<AtomicBool>,
}

impl PeerNode {
    /// 노드 시작
    ///
    /// `transport_rx` 는 전송 계층의 이벤트 수신기
    pub fn start(
        config: Config,
        transport: Arc<dyn Transport>,
        transport_rx: EventReceiver,
    ) -> (Self, PeerEventReceiver) {
        Self::start_with(Peer::new(config.clone(), transport), config, transport_rx)
    }

    /// 미리 만든 피어로 시작
    pub fn start_with(peer: Peer, config: Config, mut transport_rx: EventReceiver) -> (Self, PeerEventReceiver) {
        let peer_id = peer.id();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<NodeCmd>(config.command_queue_size.max(1));
        let (events_tx, events_rx) = mpsc::channel::<PeerEvent>(config.event_queue_size.max(1));

        let snapshot = Arc::new(RwLock::new(NodeSnapshot::of(&peer)));
        let running = Arc::new(AtomicBool::new(true));

        info!("Peer node {} started", peer_id);

        // 전송 이벤트 전달 태스크
        let cmd_tx_forward = cmd_tx.clone();
        let running_forward = running.clone();
        tokio::spawn(async move {
            while let Some(event) = transport_rx.recv().await {
                if !running_forward.load(Ordering::SeqCst) {
                    break;
                }
                if cmd_tx_forward.send(NodeCmd::Transport(event)).await.is_err() {
                    break;
                }
            }
        });

        // 메인 처리 태스크
        let mut inner = NodeInner {
            peer,
            cmd_tx: cmd_tx.clone(),
            events_tx,
            snapshot: snapshot.clone(),
            capture: None,
        };
        let running_main = running.clone();

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let stop = matches!(cmd, NodeCmd::Stop);
                inner.handle(cmd);
                if stop {
                    break;
                }
            }

            inner.cancel_capture();
            running_main.store(false, Ordering::SeqCst);
            info!("Peer node {} stopped | {}", inner.peer.id(), inner.peer.stats().summary());
        });

        let node = Self {
            peer_id,
            cmd_tx,
            snapshot,
            running,
        };
        (node, events_rx)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// 액터 태스크에서 피어 조작 실행
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Peer) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let call: PeerCall = Box::new(move |peer: &mut Peer| {
            let result = f(peer);
            let reply: Reply = Box::new(move || {
                let _ = reply_tx.send(result);
            });
            reply
        });
        self.cmd_tx
            .send(NodeCmd::Call(call))
            .await
            .map_err(|_| Error::NodeStopped)?;
        reply_rx.await.map_err(|_| Error::NodeStopped)
    }

    // ---- alignment ----

    pub async fn update_fingertip(&self, pose: Matrix4) -> Result<()> {
        self.call(move |peer| peer.update_fingertip(pose)).await
    }

    pub async fn begin_setup(&self) -> Result<()> {
        self.call(|peer| peer.begin_setup()).await?
    }

    pub async fn select_peer(&self, other: PeerId) -> Result<Role> {
        self.call(move |peer| peer.select_peer(other)).await?
    }

    pub async fn request_sample(&self) -> Result<()> {
        self.call(|peer| peer.request_sample()).await?
    }

    pub async fn confirm(&self) -> Result<Matrix4> {
        self.call(|peer| peer.confirm()).await?
    }

    pub async fn abort_setup(&self) -> Result<()> {
        self.call(|peer| peer.abort_setup()).await?
    }

    pub async fn guide_position(&self) -> Result<Option<Vec3>> {
        self.call(|peer| peer.guide_position()).await
    }

    // ---- painting ----

    pub async fn draw_point(&self, stroke_id: Uuid, point: Vec3) -> Result<usize> {
        self.call(move |peer| peer.draw_point(stroke_id, point)).await?
    }

    pub async fn finish_stroke(&self, stroke_id: Uuid) -> Result<usize> {
        self.call(move |peer| peer.finish_stroke(stroke_id)).await?
    }

    pub async fn set_stroke_color(&self, color: &str) -> Result<usize> {
        let color = color.to_string();
        self.call(move |peer| peer.set_stroke_color(&color)).await?
    }

    pub async fn change_line_width(&self, tool: &str) -> Result<usize> {
        let tool = tool.to_string();
        self.call(move |peer| peer.change_line_width(&tool)).await?
    }

    pub async fn remove_stroke(&self, stroke_id: Uuid) -> Result<usize> {
        self.call(move |peer| peer.remove_stroke(stroke_id)).await?
    }

    pub async fn remove_all_strokes(&self) -> Result<usize> {
        self.call(|peer| peer.remove_all_strokes()).await?
    }

    pub async fn share_strokes(&self, strokes: Vec<Stroke>) -> Result<usize> {
        self.call(move |peer| peer.share_strokes(strokes)).await?
    }

    pub async fn confirm_shared_strokes(&self) -> Result<usize> {
        self.call(|peer| peer.confirm_shared_strokes()).await?
    }

    pub async fn strokes(&self) -> Result<Vec<Stroke>> {
        self.call(|peer| peer.strokes()).await
    }

    // ---- membership ----

    pub async fn forget_peer(&self, other: PeerId) -> Result<bool> {
        self.call(move |peer| peer.forget_peer(other)).await
    }

    // ---- snapshot ----

    pub fn snapshot(&self) -> NodeSnapshot {
        self.snapshot.read().clone()
    }

    pub fn progress(&self) -> AlignmentProgress {
        self.snapshot.read().progress
    }

    pub fn stats(&self) -> RpcStats {
        self.snapshot.read().stats.clone()
    }

    pub fn transform_to(&self, peer: PeerId) -> Option<Matrix4> {
        self.snapshot.read().transform_to(peer)
    }

    /// 스냅샷이 조건을 만족할 때까지 대기, 시간 초과면 false
    pub async fn wait_until<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&NodeSnapshot) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition(&self.snapshot.read()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_for_state(&self, state: AlignmentState, timeout: Duration) -> bool {
        self.wait_until(timeout, |snapshot| snapshot.progress.state == state).await
    }

    /// 정지
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(NodeCmd::Stop).await;
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PeerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerNode")
            .field("peer_id", &self.peer_id)
            .field("running", &self.is_running())
            .finish()
    }
}
