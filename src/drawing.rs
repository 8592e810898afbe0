//! 드로잉 모델
//!
//! RPC 핸들러가 변경하는 스트로크 상태. 렌더링과 메시 생성은 외부 담당이며,
//! 여기서는 점 목록과 색상/두께만 관리함

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::DrawingError;
use crate::matrix::{Matrix4, Vec3, WirePoint};
use crate::message::PeerId;

/// 사용 가능한 색상
pub const PALETTE: [&str; 10] = [
    "white", "black", "brown", "red", "orange", "yellow", "green", "cyan", "blue", "magenta",
];

/// 도구 이름과 선 두께 (미터)
pub const TOOLS: [(&str, f32); 3] = [("small", 0.005), ("medium", 0.01), ("large", 0.02)];

const DEFAULT_COLOR: &str = "white";
const DEFAULT_LINE_WIDTH: f32 = 0.01;

/// 스트로크 (전송 형식 겸용)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Stroke {
    pub id: Uuid,
    pub color: String,
    pub line_width: f32,
    pub points: Vec<WirePoint>,
}

impl Stroke {
    pub fn new(id: Uuid, brush: &Brush) -> Self {
        Self {
            id,
            color: brush.color.clone(),
            line_width: brush.line_width,
            points: Vec::new(),
        }
    }

    /// 모든 점을 `m` 으로 옮긴 사본
    pub fn transformed(&self, m: &Matrix4) -> Stroke {
        Stroke {
            points: self
                .points
                .iter()
                .map(|p| m.transform_point(Vec3::from_wire(p)).to_wire())
                .collect(),
            ..self.clone()
        }
    }
}

/// 작성자별 현재 색상과 두께
#[derive(Debug, Clone, PartialEq)]
pub struct Brush {
    pub color: String,
    pub line_width: f32,
}

impl Default for Brush {
    fn default() -> Self {
        Self {
            color: DEFAULT_COLOR.to_string(),
            line_width: DEFAULT_LINE_WIDTH,
        }
    }
}

/// 드로잉 모델 인터페이스
///
/// 점 좌표는 항상 이 모델을 가진 피어의 로컬 좌표계 기준
pub trait DrawingModel: Send {
    fn set_stroke_color(&mut self, author: PeerId, color: &str) -> Result<(), DrawingError>;

    fn change_line_width(&mut self, author: PeerId, tool: &str) -> Result<(), DrawingError>;

    /// 작성 중인 스트로크
    fn active_stroke(&self, author: PeerId) -> Option<Uuid>;

    fn add_point(&mut self, author: PeerId, stroke_id: Uuid, point: Vec3);

    fn finish_stroke(&mut self, author: PeerId, stroke_id: Uuid) -> Result<(), DrawingError>;

    fn remove_stroke(&mut self, stroke_id: Uuid) -> Result<(), DrawingError>;

    fn remove_all(&mut self);

    /// 불러온 스트로크를 임시 목록에 추가
    fn add_tmp_strokes(&mut self, strokes: Vec<Stroke>);

    /// 임시 스트로크를 확정 목록으로 이동
    fn confirm_tmp_strokes(&mut self, strokes: Vec<Stroke>);

    /// 확정 + 작성 중 스트로크
    fn strokes(&self) -> Vec<Stroke>;

    fn tmp_strokes(&self) -> Vec<Stroke>;
}

/// 메모리 내 스트로크 캔버스
#[derive(Debug, Default)]
pub struct StrokeCanvas {
    brushes: HashMap<PeerId, Brush>,
    active: HashMap<PeerId, Stroke>,
    finished: Vec<Stroke>,
    tmp: Vec<Stroke>,
}

impl StrokeCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn brush(&self, author: PeerId) -> Brush {
        self.brushes.get(&author).cloned().unwrap_or_default()
    }

    fn store_finished(&mut self, stroke: Stroke) {
        if stroke.points.is_empty() {
            return;
        }
        match self.finished.iter_mut().find(|s| s.id == stroke.id) {
            Some(existing) => *existing = stroke,
            None => self.finished.push(stroke),
        }
    }
}

impl DrawingModel for StrokeCanvas {
    fn set_stroke_color(&mut self, author: PeerId, color: &str) -> Result<(), DrawingError> {
        if !PALETTE.contains(&color) {
            return Err(DrawingError::UnknownColor(color.to_string()));
        }
        self.brushes.entry(author).or_default().color = color.to_string();
        Ok(())
    }

    fn change_line_width(&mut self, author: PeerId, tool: &str) -> Result<(), DrawingError> {
        let (_, width) = TOOLS
            .iter()
            .find(|(name, _)| *name == tool)
            .ok_or_else(|| DrawingError::UnknownTool(tool.to_string()))?;
        self.brushes.entry(author).or_default().line_width = *width;
        Ok(())
    }

    fn active_stroke(&self, author: PeerId) -> Option<Uuid> {
        self.active.get(&author).map(|s| s.id)
    }

    fn add_point(&mut self, author: PeerId, stroke_id: Uuid, point: Vec3) {
        // 같은 작성자의 다른 스트로크가 열려 있으면 먼저 닫음
        if self.active.get(&author).is_some_and(|s| s.id != stroke_id) {
            if let Some(previous) = self.active.remove(&author) {
                debug!("Stroke {} implicitly finished", previous.id);
                self.store_finished(previous);
            }
        }

        let brush = self.brush(author);
        self.active
            .entry(author)
            .or_insert_with(|| Stroke::new(stroke_id, &brush))
            .points
            .push(point.to_wire());
    }

    fn finish_stroke(&mut self, author: PeerId, stroke_id: Uuid) -> Result<(), DrawingError> {
        match self.active.remove(&author) {
            Some(stroke) if stroke.id == stroke_id => {
                self.store_finished(stroke);
                Ok(())
            }
            Some(other) => {
                self.active.insert(author, other);
                Err(DrawingError::UnknownStroke(stroke_id))
            }
            None => Err(DrawingError::UnknownStroke(stroke_id)),
        }
    }

    fn remove_stroke(&mut self, stroke_id: Uuid) -> Result<(), DrawingError> {
        let before = self.finished.len() + self.tmp.len() + self.active.len();
        self.finished.retain(|s| s.id != stroke_id);
        self.tmp.retain(|s| s.id != stroke_id);
        self.active.retain(|_, s| s.id != stroke_id);

        if self.finished.len() + self.tmp.len() + self.active.len() == before {
            return Err(DrawingError::UnknownStroke(stroke_id));
        }
        Ok(())
    }

    fn remove_all(&mut self) {
        self.finished.clear();
        self.tmp.clear();
        self.active.clear();
    }

    fn add_tmp_strokes(&mut self, strokes: Vec<Stroke>) {
        for stroke in strokes {
            match self.tmp.iter_mut().find(|s| s.id == stroke.id) {
                Some(existing) => *existing = stroke,
                None => self.tmp.push(stroke),
            }
        }
    }

    fn confirm_tmp_strokes(&mut self, strokes: Vec<Stroke>) {
        for stroke in strokes {
            self.tmp.retain(|s| s.id != stroke.id);
            self.store_finished(stroke);
        }
    }

    fn strokes(&self) -> Vec<Stroke> {
        self.finished
            .iter()
            .chain(self.active.values())
            .cloned()
            .collect()
    }

    fn tmp_strokes(&self) -> Vec<Stroke> {
        self.tmp.clone()
    }
}
