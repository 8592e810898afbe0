//! 피어별 변환 레지스트리
//!
//! `registry[P]` 는 로컬 좌표계의 점을 피어 P 좌표계로 옮기는 변환.
//! 새 피어가 메시에 합류하면 기존 항목과 합성하여 나머지 피어와의 변환을 만듦

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::SolverError;
use crate::matrix::Matrix4;
use crate::message::PeerId;

/// 합류 피어에게 전달할 변환 쌍
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingOnboarding {
    pub new_peer_id: PeerId,
    pub already_peer_id: PeerId,
    /// 새 피어 좌표계 → 기존 피어 좌표계
    pub new_to_already: Matrix4,
    /// 기존 피어 좌표계 → 새 피어 좌표계
    pub already_to_new: Matrix4,
}

/// 변환 레지스트리
///
/// 역행렬이 없는 행렬은 저장하지 않음
#[derive(Debug, Clone)]
pub struct TransformRegistry {
    entries: BTreeMap<PeerId, Matrix4>,
    epsilon: f64,
}

impl TransformRegistry {
    pub fn new(epsilon: f64) -> Self {
        Self {
            entries: BTreeMap::new(),
            epsilon,
        }
    }

    /// 변환 등록, 이전 값이 있으면 반환
    pub fn insert(&mut self, peer: PeerId, local_to_peer: Matrix4) -> Result<Option<Matrix4>, SolverError> {
        local_to_peer.inverse(self.epsilon)?;
        debug!("Registry: {} registered", peer);
        Ok(self.entries.insert(peer, local_to_peer))
    }

    pub fn get(&self, peer: PeerId) -> Option<&Matrix4> {
        self.entries.get(&peer)
    }

    pub fn remove(&mut self, peer: PeerId) -> Option<Matrix4> {
        self.entries.remove(&peer)
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.entries.contains_key(&peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &Matrix4)> {
        self.entries.iter().map(|(peer, m)| (*peer, m))
    }

    /// 새 피어 합류 준비
    ///
    /// `newcomer→P = (local→P)·(newcomer→local)`, `P→newcomer` 는 그 역행렬.
    /// 하나라도 역행렬이 없으면 전체가 실패하고 레지스트리는 변하지 않음
    pub fn prepare_onboarding(
        &self,
        newcomer: PeerId,
        local_to_newcomer: &Matrix4,
    ) -> Result<Vec<PendingOnboarding>, SolverError> {
        let newcomer_to_local = local_to_newcomer.inverse(self.epsilon)?;

        self.entries
            .iter()
            .filter(|(peer, _)| **peer != newcomer)
            .map(|(peer, local_to_peer)| -> Result<PendingOnboarding, SolverError> {
                let new_to_already = *local_to_peer * newcomer_to_local;
                let already_to_new = new_to_already.inverse(self.epsilon)?;
                Ok(PendingOnboarding {
                    new_peer_id: newcomer,
                    already_peer_id: *peer,
                    new_to_already,
                    already_to_new,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::Vec3;

    const EPS: f64 = 1e-8;

    /// 월드 → 피어 로컬 좌표계
    fn frame(yaw: f64, t: Vec3) -> Matrix4 {
        Matrix4::rotation_y(yaw) * Matrix4::translation(t)
    }

    fn between(from: &Matrix4, to: &Matrix4) -> Matrix4 {
        *to * from.inverse(EPS).unwrap()
    }

    #[test]
    fn test_onboarding_with_three_existing_peers() {
        let local = frame(0.0, Vec3::new(0.0, 0.0, 0.0));
        let existing = [
            (PeerId(2), frame(0.4, Vec3::new(1.0, 0.0, 0.0))),
            (PeerId(3), frame(-1.2, Vec3::new(0.0, 0.0, 2.5))),
            (PeerId(4), frame(2.9, Vec3::new(-3.0, 0.1, 0.4))),
        ];
        let newcomer = (PeerId(9), frame(1.7, Vec3::new(0.5, -0.2, -1.0)));

        let mut registry = TransformRegistry::new(EPS);
        for (peer, f) in &existing {
            registry.insert(*peer, between(&local, f)).unwrap();
        }

        let pending = registry
            .prepare_onboarding(newcomer.0, &between(&local, &newcomer.1))
            .unwrap();
        assert_eq!(pending.len(), 3);

        for (entry, (peer, f)) in pending.iter().zip(existing.iter()) {
            assert_eq!(entry.new_peer_id, newcomer.0);
            assert_eq!(entry.already_peer_id, *peer);
            assert!(entry.new_to_already.approx_eq(&between(&newcomer.1, f), 1e-9));
            assert!(entry.already_to_new.approx_eq(&between(f, &newcomer.1), 1e-9));
            assert!((entry.new_to_already * entry.already_to_new).approx_eq(&Matrix4::IDENTITY, 1e-9));
        }
    }

    #[test]
    fn test_onboarding_skips_newcomer_entry() {
        let mut registry = TransformRegistry::new(EPS);
        registry.insert(PeerId(2), Matrix4::rotation_z(0.3)).unwrap();
        registry.insert(PeerId(9), Matrix4::rotation_x(0.3)).unwrap();

        let pending = registry.prepare_onboarding(PeerId(9), &Matrix4::IDENTITY).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].already_peer_id, PeerId(2));
    }

    #[test]
    fn test_singular_matrix_never_stored() {
        let mut registry = TransformRegistry::new(EPS);
        let mut singular = Matrix4::IDENTITY;
        singular.0[1] = [0.0; 4];

        assert!(matches!(
            registry.insert(PeerId(2), singular),
            Err(SolverError::Singular { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failed_composition_leaves_registry_untouched() {
        let mut registry = TransformRegistry::new(EPS);
        registry.insert(PeerId(2), Matrix4::IDENTITY).unwrap();

        let singular = Matrix4::scale(0.0);
        assert!(registry.prepare_onboarding(PeerId(9), &singular).is_err());
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(PeerId(9)));
    }

    #[test]
    fn test_remove_entry() {
        let mut registry = TransformRegistry::new(EPS);
        registry.insert(PeerId(2), Matrix4::IDENTITY).unwrap();
        assert!(registry.remove(PeerId(2)).is_some());
        assert!(registry.remove(PeerId(2)).is_none());
        assert_eq!(registry.peers().count(), 0);
    }
}
