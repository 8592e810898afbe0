//! 3차원 벡터와 4x4 동차 변환 행렬
//!
//! 행 우선(row-major) 표기, 열 벡터 규약: `p' = M · p`.
//! 평행이동 성분은 3번째 열(`m[0..3][3]`)에 위치

use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

use crate::error::SolverError;

/// 전송용 행렬 (행 우선 f32)
pub type WireMatrix = [[f32; 4]; 4];

/// 전송용 좌표
pub type WirePoint = [f32; 3];

/// 3차원 벡터
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, other: Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: Vec3) -> Vec3 {
        Vec3 {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    pub fn norm(self) -> f64 {
        self.dot(self).sqrt()
    }

    pub fn distance(self, other: Vec3) -> f64 {
        (self - other).norm()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn from_wire(p: &WirePoint) -> Self {
        Self::new(p[0] as f64, p[1] as f64, p[2] as f64)
    }

    pub fn to_wire(self) -> WirePoint {
        [self.x as f32, self.y as f32, self.z as f32]
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f64) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// 4x4 동차 변환 행렬
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix4(pub [[f64; 4]; 4]);

impl Default for Matrix4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Matrix4 {
    pub const IDENTITY: Matrix4 = Matrix4([
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]);

    /// 평행이동 행렬
    pub fn translation(t: Vec3) -> Self {
        let mut m = Self::IDENTITY;
        m.set_position(t);
        m
    }

    /// 3x3 선형 블록과 평행이동으로 구성
    pub fn from_parts(linear: [[f64; 3]; 3], t: Vec3) -> Self {
        let mut m = Self::translation(t);
        m.set_linear(linear);
        m
    }

    /// X축 회전
    pub fn rotation_x(angle: f64) -> Self {
        let (s, c) = angle.sin_cos();
        Self::from_parts([[1.0, 0.0, 0.0], [0.0, c, -s], [0.0, s, c]], Vec3::ZERO)
    }

    /// Y축 회전
    pub fn rotation_y(angle: f64) -> Self {
        let (s, c) = angle.sin_cos();
        Self::from_parts([[c, 0.0, s], [0.0, 1.0, 0.0], [-s, 0.0, c]], Vec3::ZERO)
    }

    /// Z축 회전
    pub fn rotation_z(angle: f64) -> Self {
        let (s, c) = angle.sin_cos();
        Self::from_parts([[c, -s, 0.0], [s, c, 0.0], [0.0, 0.0, 1.0]], Vec3::ZERO)
    }

    /// 균일 스케일
    pub fn scale(factor: f64) -> Self {
        let mut m = Self::IDENTITY;
        for i in 0..3 {
            m.0[i][i] = factor;
        }
        m
    }

    pub fn from_wire(w: &WireMatrix) -> Self {
        let mut m = [[0.0; 4]; 4];
        for (i, row) in w.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                m[i][j] = *v as f64;
            }
        }
        Matrix4(m)
    }

    pub fn to_wire(&self) -> WireMatrix {
        let mut w = [[0.0f32; 4]; 4];
        for i in 0..4 {
            for j in 0..4 {
                w[i][j] = self.0[i][j] as f32;
            }
        }
        w
    }

    /// 포즈의 위치 (평행이동 성분)
    pub fn position(&self) -> Vec3 {
        Vec3::new(self.0[0][3], self.0[1][3], self.0[2][3])
    }

    pub fn set_position(&mut self, t: Vec3) {
        self.0[0][3] = t.x;
        self.0[1][3] = t.y;
        self.0[2][3] = t.z;
    }

    /// 좌상단 3x3 선형 블록
    pub fn linear(&self) -> [[f64; 3]; 3] {
        let mut l = [[0.0; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                l[i][j] = self.0[i][j];
            }
        }
        l
    }

    pub fn set_linear(&mut self, l: [[f64; 3]; 3]) {
        for i in 0..3 {
            for j in 0..3 {
                self.0[i][j] = l[i][j];
            }
        }
    }

    pub fn transpose(&self) -> Self {
        let mut t = [[0.0; 4]; 4];
        for i in 0..4 {
            for j in 0..4 {
                t[j][i] = self.0[i][j];
            }
        }
        Matrix4(t)
    }

    /// 점 변환 (w = 1)
    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        let m = &self.0;
        Vec3::new(
            m[0][0] * p.x + m[0][1] * p.y + m[0][2] * p.z + m[0][3],
            m[1][0] * p.x + m[1][1] * p.y + m[1][2] * p.z + m[1][3],
            m[2][0] * p.x + m[2][1] * p.y + m[2][2] * p.z + m[2][3],
        )
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().flatten().all(|v| v.is_finite())
    }

    /// 성분별 최대 절대 오차
    pub fn max_abs_diff(&self, other: &Matrix4) -> f64 {
        self.0
            .iter()
            .flatten()
            .zip(other.0.iter().flatten())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    pub fn approx_eq(&self, other: &Matrix4, tolerance: f64) -> bool {
        self.max_abs_diff(other) <= tolerance
    }

    /// 가우스-조르단 소거법으로 역행렬 계산
    ///
    /// 부분 피벗팅을 사용하며, 피벗 절대값이 `epsilon` 미만이면
    /// 값을 보정하지 않고 `SolverError::Singular` 를 반환
    pub fn inverse(&self, epsilon: f64) -> Result<Matrix4, SolverError> {
        if !self.is_finite() {
            return Err(SolverError::NonFinite);
        }

        // 확대 행렬 [M | I]
        let mut aug = [[0.0f64; 8]; 4];
        for i in 0..4 {
            aug[i][..4].copy_from_slice(&self.0[i]);
            aug[i][4 + i] = 1.0;
        }

        for col in 0..4 {
            let pivot_row = (col..4)
                .max_by(|&a, &b| aug[a][col].abs().total_cmp(&aug[b][col].abs()))
                .unwrap_or(col);
            let pivot = aug[pivot_row][col];
            if pivot.abs() < epsilon {
                return Err(SolverError::Singular {
                    pivot: pivot.abs(),
                    epsilon,
                });
            }
            aug.swap(col, pivot_row);

            for v in aug[col].iter_mut() {
                *v /= pivot;
            }

            for row in 0..4 {
                if row == col {
                    continue;
                }
                let factor = aug[row][col];
                if factor == 0.0 {
                    continue;
                }
                for k in 0..8 {
                    aug[row][k] -= factor * aug[col][k];
                }
            }
        }

        let mut inv = [[0.0; 4]; 4];
        for i in 0..4 {
            inv[i].copy_from_slice(&aug[i][4..]);
        }
        Ok(Matrix4(inv))
    }
}

impl Mul for Matrix4 {
    type Output = Matrix4;

    fn mul(self, rhs: Matrix4) -> Matrix4 {
        let mut r = [[0.0; 4]; 4];
        for i in 0..4 {
            for j in 0..4 {
                r[i][j] = (0..4).map(|k| self.0[i][k] * rhs.0[k][j]).sum();
            }
        }
        Matrix4(r)
    }
}
