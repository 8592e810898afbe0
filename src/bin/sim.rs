//! coframe 시뮬레이터
//!
//! 한 프로세스 안에서 N 개의 피어를 띄우고, 각 피어에게 임의의 로컬 좌표계를 준 뒤
//! 손가락 터치를 흉내 내어 쌍 정렬과 메시 합류를 진행함. 끝나면 각 변환의 실제 오차를 보고
//!
//! 사용법:
//!   cargo run --release --bin coframe-sim -- [OPTIONS]
//!
//! 예시:
//!   # 피어 4개, 메모리 네트워크
//!   cargo run --release --bin coframe-sim -- --peers 4
//!
//!   # 루프백 UDP, 손가락 위치 잡음 2mm
//!   cargo run --release --bin coframe-sim -- --udp --noise 0.002

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use coframe::node::PeerEventReceiver;
use coframe::transport::EventReceiver;
use coframe::{
    AlignmentState, Config, Matrix4, MemoryNetwork, PeerId, PeerNode, Transport, UdpTransport, Vec3,
};

/// 시뮬레이션 설정
struct SimConfig {
    peers: usize,
    loss: f64,
    udp: bool,
    noise: f64,
    retries: usize,
    config: Config,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            peers: 3,
            loss: 0.0,
            udp: false,
            noise: 0.0,
            retries: 3,
            config: Config::quick_capture(),
        }
    }
}

fn parse_args() -> SimConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = SimConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--peers" | "-n" => {
                if i + 1 < args.len() {
                    config.peers = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--loss" | "-l" => {
                if i + 1 < args.len() {
                    config.loss = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--udp" | "-u" => {
                config.udp = true;
            }
            "--noise" => {
                if i + 1 < args.len() {
                    config.noise = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--samples" | "-s" => {
                if i + 1 < args.len() {
                    let samples = args[i + 1].parse().expect("유효한 숫자 필요");
                    config.config = config.config.with_sample_limit(samples);
                    i += 1;
                }
            }
            "--delay" | "-d" => {
                if i + 1 < args.len() {
                    config.config.sample_delay_ms = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--retries" => {
                if i + 1 < args.len() {
                    config.retries = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"coframe-sim - 좌표계 정렬 시뮬레이터

사용법:
  cargo run --release --bin coframe-sim -- [OPTIONS]

옵션:
  -n, --peers <N>        피어 수 (기본: 3)
  -l, --loss <RATE>      메모리 네트워크 프레임 손실률 0.0~1.0 (기본: 0)
  -u, --udp              루프백 UDP 사용
  --noise <METERS>       손가락 위치 잡음 범위 (기본: 0)
  -s, --samples <N>      협상당 샘플 쌍 수 (기본: 4)
  -d, --delay <MS>       캡처 대기 시간 (기본: 20)
  --retries <N>          쌍 정렬 재시도 횟수 (기본: 3)
  -h, --help             이 도움말 출력

로그 레벨은 RUST_LOG 로 조정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

/// 시뮬레이션 피어
struct SimPeer {
    node: PeerNode,
    /// 월드 좌표계 → 이 피어의 로컬 좌표계
    frame: Matrix4,
    _events: PeerEventReceiver,
}

impl SimPeer {
    fn touch(&self, world: Vec3, noise: f64) -> Matrix4 {
        let mut local = self.frame.transform_point(world);
        if noise > 0.0 {
            let mut rng = rand::thread_rng();
            local = local
                + Vec3::new(
                    rng.gen_range(-noise..=noise),
                    rng.gen_range(-noise..=noise),
                    rng.gen_range(-noise..=noise),
                );
        }
        Matrix4::translation(local)
    }
}

fn random_frame() -> Matrix4 {
    let mut rng = rand::thread_rng();
    let t = Vec3::new(rng.gen_range(-3.0..3.0), rng.gen_range(-0.5..0.5), rng.gen_range(-3.0..3.0));
    Matrix4::translation(t) * Matrix4::rotation_y(rng.gen_range(-3.1..3.1)) * Matrix4::rotation_x(rng.gen_range(-0.1..0.1))
}

async fn spawn_peers(sim: &SimConfig) -> Result<Vec<SimPeer>, Box<dyn std::error::Error>> {
    let mut ids: Vec<PeerId> = (0..sim.peers).map(|_| PeerId::random()).collect();
    ids.sort();

    let mut endpoints: Vec<(Arc<dyn Transport>, EventReceiver)> = Vec::new();
    if sim.udp {
        let bind: SocketAddr = "127.0.0.1:0".parse()?;
        let mut udp = Vec::new();
        for id in &ids {
            udp.push(UdpTransport::bind(*id, bind, &sim.config).await?);
        }
        let mut addrs: Vec<(PeerId, SocketAddr)> = Vec::new();
        for (transport, _) in &udp {
            addrs.push((transport.local_peer(), transport.local_addr()?));
        }
        for (transport, _) in &udp {
            for (peer, addr) in &addrs {
                transport.add_peer(*peer, *addr);
            }
        }
        for (transport, rx) in udp {
            endpoints.push((Arc::new(transport), rx));
        }
    } else {
        let network = MemoryNetwork::with_options(sim.loss, sim.config.transport_queue_size);
        for id in &ids {
            let (transport, rx) = network.join(*id);
            endpoints.push((Arc::new(transport), rx));
        }
    }

    let mut peers = Vec::new();
    for (index, (transport, rx)) in endpoints.into_iter().enumerate() {
        let (node, events) = PeerNode::start(sim.config.clone(), transport, rx);
        // 첫 피어의 로컬 좌표계를 월드로 둠
        let frame = if index == 0 { Matrix4::IDENTITY } else { random_frame() };
        peers.push(SimPeer {
            node,
            frame,
            _events: events,
        });
    }
    Ok(peers)
}

/// 두 피어 정렬, 성공하면 true
async fn align_pair(a: &SimPeer, b: &SimPeer, sim: &SimConfig) -> coframe::Result<bool> {
    let (host, client) = if a.node.peer_id() < b.node.peer_id() { (a, b) } else { (b, a) };
    let wait = sim.config.sample_delay() * 10 + Duration::from_millis(500);

    host.node.begin_setup().await?;
    client.node.begin_setup().await?;
    host.node.select_peer(client.node.peer_id()).await?;
    client.node.select_peer(host.node.peer_id()).await?;

    let origin = {
        let mut rng = rand::thread_rng();
        Vec3::new(rng.gen_range(-0.5..0.5), rng.gen_range(0.8..1.4), rng.gen_range(-0.8..-0.3))
    };

    for round in 1..=sim.config.sample_limit {
        // 호스트 가이드 위치를 월드 좌표로 옮겨 두 사람이 같은 곳을 찍음
        let world = match host.node.guide_position().await? {
            Some(guide) if round <= 4 => host.frame.inverse(sim.config.singular_epsilon)?.transform_point(guide),
            _ => {
                let mut rng = rand::thread_rng();
                origin + Vec3::new(rng.gen_range(-0.3..0.3), rng.gen_range(-0.3..0.3), rng.gen_range(-0.3..0.3))
            }
        };

        host.node.update_fingertip(host.touch(world, sim.noise)).await?;
        client.node.update_fingertip(client.touch(world, sim.noise)).await?;
        host.node.request_sample().await?;

        let done = |s: &coframe::NodeSnapshot| {
            s.progress.state == AlignmentState::Confirming
                || (s.progress.a_count >= round && s.progress.b_count >= round)
        };
        if !host.node.wait_until(wait, done).await || !client.node.wait_until(wait, done).await {
            warn!("Round {} between {} and {} timed out", round, host.node.peer_id(), client.node.peer_id());
            host.node.abort_setup().await?;
            return Ok(false);
        }
    }

    for side in [host, client] {
        if !side.node.wait_for_state(AlignmentState::Confirming, wait).await {
            host.node.abort_setup().await?;
            return Ok(false);
        }
    }

    host.node.confirm().await?;
    client.node.confirm().await?;
    // 합류 변환 전달 대기
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(true)
}

/// 등록된 변환과 실제 좌표계 관계의 최대 오차 (미터)
fn residual(from: &SimPeer, to: &SimPeer, registered: &Matrix4, epsilon: f64) -> Option<f64> {
    let world_to_from_inv = from.frame.inverse(epsilon).ok()?;
    let probes = [
        Vec3::new(0.0, 1.0, -0.5),
        Vec3::new(0.5, 1.5, -0.5),
        Vec3::new(-0.5, 1.2, 0.5),
    ];
    probes
        .iter()
        .map(|&local| {
            let world = world_to_from_inv.transform_point(local);
            registered.transform_point(local).distance(to.frame.transform_point(world))
        })
        .reduce(f64::max)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let sim = parse_args();
    if sim.peers < 2 {
        return Err("피어는 2개 이상 필요".into());
    }

    info!(
        "coframe-sim starting: {} peers, {} transport, loss {:.2}, noise {} m, {} samples",
        sim.peers,
        if sim.udp { "UDP" } else { "memory" },
        sim.loss,
        sim.noise,
        sim.config.sample_limit
    );

    let peers = spawn_peers(&sim).await?;

    // 첫 피어가 나머지 피어를 차례로 맞이함
    for index in 1..peers.len() {
        let mut aligned = false;
        for attempt in 1..=sim.retries.max(1) {
            match align_pair(&peers[0], &peers[index], &sim).await {
                Ok(true) => {
                    aligned = true;
                    break;
                }
                Ok(false) => warn!("Alignment attempt {} with peer {} failed", attempt, index),
                Err(e) => warn!("Alignment attempt {} with peer {} failed: {}", attempt, index, e),
            }
        }
        if !aligned {
            warn!("Peer {} ({}) left unaligned", index, peers[index].node.peer_id());
        }
    }

    println!();
    println!("═══ Registry residuals ═══");
    let mut worst: f64 = 0.0;
    let mut missing = 0;
    for from in &peers {
        for to in &peers {
            if from.node.peer_id() == to.node.peer_id() {
                continue;
            }
            match from.node.transform_to(to.node.peer_id()) {
                Some(m) => {
                    let error = residual(from, to, &m, sim.config.singular_epsilon).unwrap_or(f64::NAN);
                    worst = worst.max(error);
                    println!("  {} -> {}: {:.6} m", from.node.peer_id(), to.node.peer_id(), error);
                }
                None => {
                    missing += 1;
                    println!("  {} -> {}: missing", from.node.peer_id(), to.node.peer_id());
                }
            }
        }
    }
    println!("Worst residual: {:.6} m, missing transforms: {}", worst, missing);

    println!();
    println!("═══ RPC statistics ═══");
    for peer in &peers {
        println!("  {}: {}", peer.node.peer_id(), peer.node.stats().summary());
        peer.node.stop().await;
    }

    Ok(())
}
