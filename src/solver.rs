//! 아핀 행렬 계산
//!
//! 두 피어가 같은 물리적 위치에서 캡처한 손가락 포즈 쌍 `A`, `B` 로부터
//! `M · Aᵢ ≈ Bᵢ` 를 최소제곱으로 만족하는 강체 변환을 구함
//!
//! 1. 동차 좌표 정규방정식을 LU 분해 + 전진/후진 대입으로 풂
//! 2. 3x3 선형 블록을 SVD 기반 극분해하여 회전 성분 `R = U·Vᵀ` 만 남김
//! 3. 역방향 변환은 가우스-조르단 역행렬로 구함

use crate::error::SolverError;
use crate::matrix::{Matrix4, Vec3};

/// 계산에 필요한 최소 샘플 수
pub const MIN_SAMPLES: usize = 3;

/// 기하 판정용 상대 허용 오차
const GEOMETRY_TOLERANCE: f64 = 1e-6;

/// 야코비 회전 최대 반복 횟수
const JACOBI_MAX_SWEEPS: usize = 64;

type Mat3 = [[f64; 3]; 3];

/// 양방향 강체 변환 결과
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidSolution {
    /// A 좌표계 → B 좌표계
    pub a_to_b: Matrix4,
    /// B 좌표계 → A 좌표계 (`a_to_b` 의 역행렬)
    pub b_to_a: Matrix4,
    /// A 를 B 로 옮겼을 때의 RMS 잔차 (미터)
    pub rms_error: f64,
}

/// A→B 변환을 계산하고 역행렬로 B→A 를 구함
pub fn solve_pair(a: &[Matrix4], b: &[Matrix4], epsilon: f64) -> Result<RigidSolution, SolverError> {
    let a_to_b = solve_rigid(a, b, epsilon)?;
    let b_to_a = a_to_b.inverse(epsilon)?;
    let rms_error = rms_residual(&a_to_b, a, b);
    Ok(RigidSolution {
        a_to_b,
        b_to_a,
        rms_error,
    })
}

/// 포즈 샘플 `a` 를 `b` 로 옮기는 최적 강체 변환 계산
pub fn solve_rigid(a: &[Matrix4], b: &[Matrix4], epsilon: f64) -> Result<Matrix4, SolverError> {
    if a.len() != b.len() {
        return Err(SolverError::MismatchedSamples { a: a.len(), b: b.len() });
    }
    if a.len() < MIN_SAMPLES {
        return Err(SolverError::InsufficientSamples {
            required: MIN_SAMPLES,
            got: a.len(),
        });
    }

    let pa: Vec<Vec3> = a.iter().map(Matrix4::position).collect();
    let pb: Vec<Vec3> = b.iter().map(Matrix4::position).collect();
    if !pa.iter().chain(pb.iter()).all(|p| p.is_finite()) {
        return Err(SolverError::NonFinite);
    }

    let (design_a, design_b) = design_points(&pa, &pb)?;
    let affine = least_squares_affine(&design_a, &design_b, epsilon)?;

    // 스케일/전단 제거
    let rotation = polar_rotation(affine.linear(), epsilon)?;

    // 회전이 고정된 상태에서의 최적 평행이동
    let translation = centroid(&pb) - apply3(&rotation, centroid(&pa));

    Ok(Matrix4::from_parts(rotation, translation))
}

/// `m` 으로 `a` 를 옮겼을 때 `b` 와의 RMS 거리
pub fn rms_residual(m: &Matrix4, a: &[Matrix4], b: &[Matrix4]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(sa, sb)| {
            let d = m.transform_point(sa.position()) - sb.position();
            d.dot(d)
        })
        .sum();
    (sum / n as f64).sqrt()
}

/// 점 집합이 펼치는 독립 방향 수 (0..=3)
pub fn independent_directions(points: &[Vec3]) -> usize {
    analyze(points).directions
}

struct Spread {
    directions: usize,
    /// 가장 넓은 삼각형을 이루는 인덱스 (0번 점 기준)
    pair: Option<(usize, usize)>,
}

fn analyze(points: &[Vec3]) -> Spread {
    let Some(&origin) = points.first() else {
        return Spread { directions: 0, pair: None };
    };

    let extent = points.iter().map(|p| p.distance(origin)).fold(0.0, f64::max);
    if extent <= f64::MIN_POSITIVE {
        return Spread { directions: 0, pair: None };
    }

    let mut best: Option<(usize, usize, f64)> = None;
    for j in 1..points.len() {
        for k in (j + 1)..points.len() {
            let area = (points[j] - origin).cross(points[k] - origin).norm();
            if best.map_or(true, |(_, _, a)| area > a) {
                best = Some((j, k, area));
            }
        }
    }

    let Some((j, k, area)) = best.filter(|(_, _, area)| *area > GEOMETRY_TOLERANCE * extent * extent) else {
        return Spread { directions: 1, pair: None };
    };

    let normal = (points[j] - origin).cross(points[k] - origin) * (1.0 / area);
    let off_plane = points
        .iter()
        .map(|p| normal.dot(*p - origin).abs())
        .fold(0.0, f64::max);

    Spread {
        directions: if off_plane > GEOMETRY_TOLERANCE * extent { 3 } else { 2 },
        pair: Some((j, k)),
    }
}

/// 최소제곱에 사용할 대응점 목록
///
/// 평면 위의 대응점(샘플 3개 포함)은 정규방정식이 특이해지므로
/// 두 집합 각각의 평면 법선 방향으로 가상 대응점을 하나 추가
fn design_points(pa: &[Vec3], pb: &[Vec3]) -> Result<(Vec<Vec3>, Vec<Vec3>), SolverError> {
    let spread_a = analyze(pa);
    let spread_b = analyze(pb);
    let directions = spread_a.directions.min(spread_b.directions);
    if directions < 2 {
        return Err(SolverError::Degenerate { directions });
    }

    let mut design_a = pa.to_vec();
    let mut design_b = pb.to_vec();

    if spread_a.directions == 2 {
        let (j, k) = spread_a.pair.ok_or(SolverError::Degenerate { directions: 1 })?;
        let normal_a = (pa[j] - pa[0]).cross(pa[k] - pa[0]);
        let normal_b = (pb[j] - pb[0]).cross(pb[k] - pb[0]);
        let (len_a, len_b) = (normal_a.norm(), normal_b.norm());
        if len_a <= f64::MIN_POSITIVE || len_b <= f64::MIN_POSITIVE {
            return Err(SolverError::Degenerate { directions: 1 });
        }
        // |n| 은 면적 차원이므로 제곱근으로 나눠 길이 차원으로 맞춤
        design_a.push(centroid(pa) + normal_a * (1.0 / len_a.sqrt()));
        design_b.push(centroid(pb) + normal_b * (1.0 / len_b.sqrt()));
    }

    Ok((design_a, design_b))
}

/// 정규방정식 `(PᵀP)·X = PᵀQ` 로 4x4 아핀 행렬을 구함
///
/// P 의 행은 `[x, y, z, 1]`, Q 의 행은 `[x', y', z', 0]`
fn least_squares_affine(a: &[Vec3], b: &[Vec3], epsilon: f64) -> Result<Matrix4, SolverError> {
    let mut normal = [[0.0f64; 4]; 4];
    let mut rhs = [[0.0f64; 4]; 4];

    for (p, q) in a.iter().zip(b.iter()) {
        let row_p = [p.x, p.y, p.z, 1.0];
        let row_q = [q.x, q.y, q.z, 0.0];
        for j in 0..4 {
            for k in 0..4 {
                normal[j][k] += row_p[j] * row_p[k];
                rhs[j][k] += row_p[j] * row_q[k];
            }
        }
    }

    let x = Lu::decompose(normal, epsilon)?.solve(&rhs);

    // M = Xᵀ
    let mut m = [[0.0f64; 4]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = x[j][i];
        }
    }
    m[3] = [0.0, 0.0, 0.0, 1.0];
    Ok(Matrix4(m))
}

/// 부분 피벗팅 LU 분해 (`P·A = L·U`)
struct Lu {
    /// 단위 하삼각 L(대각 제외)과 U 를 합쳐 저장
    lu: [[f64; 4]; 4],
    perm: [usize; 4],
}

impl Lu {
    fn decompose(mut a: [[f64; 4]; 4], epsilon: f64) -> Result<Self, SolverError> {
        let mut perm = [0, 1, 2, 3];

        for i in 0..4 {
            let pivot_row = (i..4)
                .max_by(|&r, &s| a[r][i].abs().total_cmp(&a[s][i].abs()))
                .unwrap_or(i);
            let pivot = a[pivot_row][i];
            if !pivot.is_finite() {
                return Err(SolverError::NonFinite);
            }
            if pivot.abs() < epsilon {
                return Err(SolverError::Singular {
                    pivot: pivot.abs(),
                    epsilon,
                });
            }
            a.swap(i, pivot_row);
            perm.swap(i, pivot_row);

            for r in (i + 1)..4 {
                let factor = a[r][i] / pivot;
                a[r][i] = factor;
                for c in (i + 1)..4 {
                    a[r][c] -= factor * a[i][c];
                }
            }
        }

        Ok(Self { lu: a, perm })
    }

    fn solve(&self, rhs: &[[f64; 4]; 4]) -> [[f64; 4]; 4] {
        let lu = &self.lu;

        // 전진 대입 L·Y = P·B
        let mut y = [[0.0f64; 4]; 4];
        for i in 0..4 {
            for k in 0..4 {
                let dot: f64 = (0..i).map(|j| lu[i][j] * y[j][k]).sum();
                y[i][k] = rhs[self.perm[i]][k] - dot;
            }
        }

        // 후진 대입 U·X = Y
        let mut x = [[0.0f64; 4]; 4];
        for i in (0..4).rev() {
            for k in 0..4 {
                let dot: f64 = ((i + 1)..4).map(|j| lu[i][j] * x[j][k]).sum();
                x[i][k] = (y[i][k] - dot) / lu[i][i];
            }
        }
        x
    }
}

/// 극분해의 직교 인자 `R = U·Vᵀ`
///
/// `LᵀL = V·Σ²·Vᵀ` 의 고유분해로 `V`, `Σ` 를 얻고 `U = L·V·Σ⁻¹`.
/// 반사 성분(det < 0)은 가장 작은 특이값 방향을 뒤집어 제거
fn polar_rotation(l: Mat3, epsilon: f64) -> Result<Mat3, SolverError> {
    let (eigenvalues, v) = symmetric_eigen(mul3(&transpose3(&l), &l));

    let mut sigma = [0.0f64; 3];
    for i in 0..3 {
        sigma[i] = eigenvalues[i].max(0.0).sqrt();
    }
    let (min_index, min_sigma) = sigma
        .iter()
        .copied()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or((0, 0.0));
    if !min_sigma.is_finite() {
        return Err(SolverError::NonFinite);
    }
    if min_sigma < epsilon {
        return Err(SolverError::Singular {
            pivot: min_sigma,
            epsilon,
        });
    }

    let lv = mul3(&l, &v);
    let mut u = [[0.0f64; 3]; 3];
    for i in 0..3 {
        for c in 0..3 {
            u[i][c] = lv[i][c] / sigma[c];
        }
    }

    let mut r = mul3(&u, &transpose3(&v));
    if det3(&r) < 0.0 {
        for row in u.iter_mut() {
            row[min_index] = -row[min_index];
        }
        r = mul3(&u, &transpose3(&v));
    }
    Ok(r)
}

/// 대칭 3x3 행렬의 야코비 고유분해 (고유값, 고유벡터 열)
fn symmetric_eigen(mut a: Mat3) -> ([f64; 3], Mat3) {
    let mut v = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    let scale: f64 = a.iter().flatten().map(|x| x * x).sum();

    for _ in 0..JACOBI_MAX_SWEEPS {
        let off = a[0][1] * a[0][1] + a[0][2] * a[0][2] + a[1][2] * a[1][2];
        if off <= f64::EPSILON * f64::EPSILON * scale {
            break;
        }

        for (p, q) in [(0, 1), (0, 2), (1, 2)] {
            if a[p][q] == 0.0 {
                continue;
            }
            let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
            let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
            let c = 1.0 / (t * t + 1.0).sqrt();
            let s = t * c;

            for k in 0..3 {
                let (akp, akq) = (a[k][p], a[k][q]);
                a[k][p] = c * akp - s * akq;
                a[k][q] = s * akp + c * akq;
            }
            for k in 0..3 {
                let (apk, aqk) = (a[p][k], a[q][k]);
                a[p][k] = c * apk - s * aqk;
                a[q][k] = s * apk + c * aqk;
            }
            for row in v.iter_mut() {
                let (vkp, vkq) = (row[p], row[q]);
                row[p] = c * vkp - s * vkq;
                row[q] = s * vkp + c * vkq;
            }
        }
    }

    ([a[0][0], a[1][1], a[2][2]], v)
}

fn centroid(points: &[Vec3]) -> Vec3 {
    let sum = points.iter().fold(Vec3::ZERO, |acc, p| acc + *p);
    sum * (1.0 / points.len().max(1) as f64)
}

fn apply3(m: &Mat3, p: Vec3) -> Vec3 {
    Vec3::new(
        m[0][0] * p.x + m[0][1] * p.y + m[0][2] * p.z,
        m[1][0] * p.x + m[1][1] * p.y + m[1][2] * p.z,
        m[2][0] * p.x + m[2][1] * p.y + m[2][2] * p.z,
    )
}

fn mul3(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut r = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            r[i][j] = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    r
}

fn transpose3(m: &Mat3) -> Mat3 {
    let mut t = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            t[j][i] = m[i][j];
        }
    }
    t
}

fn det3(m: &Mat3) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EPS: f64 = crate::SINGULAR_EPSILON;

    fn poses(points: &[Vec3]) -> Vec<Matrix4> {
        points.iter().map(|p| Matrix4::translation(*p)).collect()
    }

    fn tetrahedron() -> Vec<Vec3> {
        vec![
            Vec3::new(0.10, 1.20, -0.40),
            Vec3::new(0.10, 1.50, -0.40),
            Vec3::new(0.40, 1.20, -0.40),
            Vec3::new(0.10, 1.20, -0.10),
        ]
    }

    fn transformed(m: &Matrix4, points: &[Vec3]) -> Vec<Vec3> {
        points.iter().map(|p| m.transform_point(*p)).collect()
    }

    fn assert_orthonormal(m: &Matrix4) {
        let l = m.linear();
        let rrt = mul3(&l, &transpose3(&l));
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((rrt[i][j] - expected).abs() < 1e-9, "RRᵀ[{i}][{j}] = {}", rrt[i][j]);
            }
        }
        assert!((det3(&l) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_identity_law() {
        let a = poses(&tetrahedron());
        let m = solve_rigid(&a, &a, EPS).unwrap();
        assert!(m.approx_eq(&Matrix4::IDENTITY, 1e-9), "{:?}", m);
    }

    #[test]
    fn test_recovers_known_rigid_transform() {
        let truth = Matrix4::translation(Vec3::new(1.5, -0.2, 0.8)) * Matrix4::rotation_y(0.9) * Matrix4::rotation_x(0.2);
        let a = tetrahedron();
        let b = transformed(&truth, &a);

        let solution = solve_pair(&poses(&a), &poses(&b), EPS).unwrap();
        assert!(solution.a_to_b.approx_eq(&truth, 1e-9));
        assert!(solution.rms_error < 1e-9);
        assert!((solution.a_to_b * solution.b_to_a).approx_eq(&Matrix4::IDENTITY, 1e-9));
    }

    #[test]
    fn test_three_samples_are_enough() {
        let truth = Matrix4::translation(Vec3::new(-0.3, 0.0, 2.0)) * Matrix4::rotation_z(-0.4);
        let a: Vec<Vec3> = tetrahedron().into_iter().take(3).collect();
        let b = transformed(&truth, &a);

        let m = solve_rigid(&poses(&a), &poses(&b), EPS).unwrap();
        assert!(m.approx_eq(&truth, 1e-9), "{:?}", m);
    }

    #[test]
    fn test_coplanar_four_samples() {
        let truth = Matrix4::rotation_y(1.1) * Matrix4::translation(Vec3::new(0.0, 0.5, 0.5));
        let a = vec![
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.3, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.3),
            Vec3::new(0.3, 1.0, 0.3),
        ];
        let b = transformed(&truth, &a);

        let m = solve_rigid(&poses(&a), &poses(&b), EPS).unwrap();
        assert!(m.approx_eq(&truth, 1e-9));
    }

    #[test]
    fn test_scale_distortion_is_discarded() {
        let rotation = Matrix4::rotation_z(0.6) * Matrix4::rotation_x(-0.25);
        let a = tetrahedron();
        let b = transformed(&(Matrix4::scale(2.0) * rotation), &a);

        let m = solve_rigid(&poses(&a), &poses(&b), EPS).unwrap();
        assert_orthonormal(&m);
        assert!(Matrix4::from_parts(m.linear(), Vec3::ZERO).approx_eq(&rotation, 1e-9));
    }

    #[test]
    fn test_shear_is_discarded() {
        let mut shear = Matrix4::IDENTITY;
        shear.0[0][1] = 0.3;
        let a = tetrahedron();
        let b = transformed(&shear, &a);

        let m = solve_rigid(&poses(&a), &poses(&b), EPS).unwrap();
        assert_orthonormal(&m);
    }

    #[test]
    fn test_reflection_is_not_returned() {
        let mut mirror = Matrix4::IDENTITY;
        mirror.0[0][0] = -1.0;
        let a = tetrahedron();
        let b = transformed(&mirror, &a);

        let m = solve_rigid(&poses(&a), &poses(&b), EPS).unwrap();
        assert_orthonormal(&m);
    }

    #[test]
    fn test_collinear_samples_rejected() {
        let a: Vec<Vec3> = (0..4).map(|i| Vec3::new(0.1 * i as f64, 1.0, 0.0)).collect();
        match solve_rigid(&poses(&a), &poses(&a), EPS) {
            Err(SolverError::Degenerate { directions }) => assert_eq!(directions, 1),
            other => panic!("expected degenerate, got {:?}", other),
        }
    }

    #[test]
    fn test_repeated_point_rejected() {
        let a = vec![Vec3::new(0.2, 1.0, 0.0); 4];
        assert_eq!(
            solve_rigid(&poses(&a), &poses(&a), EPS),
            Err(SolverError::Degenerate { directions: 0 })
        );
    }

    #[test]
    fn test_insufficient_and_mismatched_samples() {
        let a = poses(&tetrahedron());
        assert_eq!(
            solve_rigid(&a[..2], &a[..2], EPS),
            Err(SolverError::InsufficientSamples { required: 3, got: 2 })
        );
        assert_eq!(
            solve_rigid(&a, &a[..3], EPS),
            Err(SolverError::MismatchedSamples { a: 4, b: 3 })
        );
    }

    #[test]
    fn test_independent_directions() {
        let t = tetrahedron();
        assert_eq!(independent_directions(&t), 3);
        assert_eq!(independent_directions(&t[..3]), 2);
        assert_eq!(independent_directions(&t[..2]), 1);
        assert_eq!(independent_directions(&t[..1]), 0);
    }

    #[test]
    fn test_noisy_samples_stay_rigid() {
        let truth = Matrix4::translation(Vec3::new(0.2, 0.0, -1.0)) * Matrix4::rotation_y(-2.0);
        let a = tetrahedron();
        let noise = [
            Vec3::new(0.004, -0.002, 0.001),
            Vec3::new(-0.003, 0.001, 0.002),
            Vec3::new(0.001, 0.003, -0.004),
            Vec3::new(-0.002, -0.001, 0.003),
        ];
        let b: Vec<Vec3> = transformed(&truth, &a)
            .into_iter()
            .zip(noise)
            .map(|(p, n)| p + n)
            .collect();

        let solution = solve_pair(&poses(&a), &poses(&b), EPS).unwrap();
        assert_orthonormal(&solution.a_to_b);
        assert!(solution.a_to_b.approx_eq(&truth, 0.05));
        assert!(solution.rms_error < 0.02);
    }

    proptest! {
        #[test]
        fn prop_inverse_law(
            yaw in -3.1f64..3.1,
            pitch in -1.5f64..1.5,
            roll in -3.1f64..3.1,
            tx in -5.0f64..5.0,
            ty in -5.0f64..5.0,
            tz in -5.0f64..5.0,
            jitter in proptest::collection::vec(-0.05f64..0.05, 12),
        ) {
            let truth = Matrix4::translation(Vec3::new(tx, ty, tz))
                * Matrix4::rotation_y(yaw)
                * Matrix4::rotation_x(pitch)
                * Matrix4::rotation_z(roll);
            let a: Vec<Vec3> = tetrahedron()
                .into_iter()
                .enumerate()
                .map(|(i, p)| p + Vec3::new(jitter[3 * i], jitter[3 * i + 1], jitter[3 * i + 2]))
                .collect();
            let b = transformed(&truth, &a);

            let forward = solve_rigid(&poses(&a), &poses(&b), EPS).unwrap();
            let backward = solve_rigid(&poses(&b), &poses(&a), EPS).unwrap();

            prop_assert!(forward.approx_eq(&truth, 1e-6));
            prop_assert!((forward * backward).approx_eq(&Matrix4::IDENTITY, 1e-6));
            prop_assert!((forward * forward.inverse(EPS).unwrap()).approx_eq(&Matrix4::IDENTITY, 1e-9));
        }
    }
}
