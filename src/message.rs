//! RPC 메시지 정의
//!
//! 엔벨로프는 `{id, originPeerId, method, param}` 구조이며,
//! `method` 는 `{엔티티: 연산}`, `param` 은 `{연산: 필드}` 형태의 단일 키 객체

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::drawing::Stroke;
use crate::matrix::{WireMatrix, WirePoint};
use crate::session::AlignmentState;

/// 피어 식별자
///
/// 라우팅 키이자 역할 결정 기준 (큰 쪽이 클라이언트)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl PeerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// 임의 식별자 생성 (충돌은 고려하지 않음)
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// 좌표 정렬 연산
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlignmentMethod {
    InitMyPeer,
    InitOtherPeer,
    ResetPeer,
    RequestTransform,
    SetTransform,
    SetATransform,
    SetBTransform,
    /// 전송 이름은 기존 클라이언트와의 호환을 위해 `clacAffineMatrix`
    #[serde(rename = "clacAffineMatrix")]
    CalcAffineMatrix,
    SetState,
    SetNewUserAffineMatrix,
    PrepareBroadcastNewUserAffineMatrix,
}

impl AlignmentMethod {
    pub const ALL: [AlignmentMethod; 11] = [
        AlignmentMethod::InitMyPeer,
        AlignmentMethod::InitOtherPeer,
        AlignmentMethod::ResetPeer,
        AlignmentMethod::RequestTransform,
        AlignmentMethod::SetTransform,
        AlignmentMethod::SetATransform,
        AlignmentMethod::SetBTransform,
        AlignmentMethod::CalcAffineMatrix,
        AlignmentMethod::SetState,
        AlignmentMethod::SetNewUserAffineMatrix,
        AlignmentMethod::PrepareBroadcastNewUserAffineMatrix,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlignmentMethod::InitMyPeer => "initMyPeer",
            AlignmentMethod::InitOtherPeer => "initOtherPeer",
            AlignmentMethod::ResetPeer => "resetPeer",
            AlignmentMethod::RequestTransform => "requestTransform",
            AlignmentMethod::SetTransform => "setTransform",
            AlignmentMethod::SetATransform => "setATransform",
            AlignmentMethod::SetBTransform => "setBTransform",
            AlignmentMethod::CalcAffineMatrix => "clacAffineMatrix",
            AlignmentMethod::SetState => "setState",
            AlignmentMethod::SetNewUserAffineMatrix => "setNewUserAffineMatrix",
            AlignmentMethod::PrepareBroadcastNewUserAffineMatrix => "prepareBroadcastNewUserAffineMatrix",
        }
    }
}

/// 드로잉 연산
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PaintingMethod {
    SetStrokeColor,
    RemoveAllStroke,
    RemoveStroke,
    AddStrokePoint,
    AddStrokes,
    FinishStroke,
    ChangeFingerLineWidth,
    ConfirmTmpStrokes,
}

impl PaintingMethod {
    pub const ALL: [PaintingMethod; 8] = [
        PaintingMethod::SetStrokeColor,
        PaintingMethod::RemoveAllStroke,
        PaintingMethod::RemoveStroke,
        PaintingMethod::AddStrokePoint,
        PaintingMethod::AddStrokes,
        PaintingMethod::FinishStroke,
        PaintingMethod::ChangeFingerLineWidth,
        PaintingMethod::ConfirmTmpStrokes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaintingMethod::SetStrokeColor => "setStrokeColor",
            PaintingMethod::RemoveAllStroke => "removeAllStroke",
            PaintingMethod::RemoveStroke => "removeStroke",
            PaintingMethod::AddStrokePoint => "addStrokePoint",
            PaintingMethod::AddStrokes => "addStrokes",
            PaintingMethod::FinishStroke => "finishStroke",
            PaintingMethod::ChangeFingerLineWidth => "changeFingerLineWidth",
            PaintingMethod::ConfirmTmpStrokes => "confirmTmpStrokes",
        }
    }
}

/// 에러 채널 연산
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorMethod {
    Error,
}

/// RPC 메서드 (엔티티별로 태깅됨)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    Alignment(AlignmentMethod),
    Painting(PaintingMethod),
    Error(ErrorMethod),
}

impl Method {
    /// 인식 가능한 모든 메서드
    pub fn all() -> impl Iterator<Item = Method> {
        AlignmentMethod::ALL
            .into_iter()
            .map(Method::Alignment)
            .chain(PaintingMethod::ALL.into_iter().map(Method::Painting))
            .chain(std::iter::once(Method::Error(ErrorMethod::Error)))
    }

    pub fn entity(&self) -> &'static str {
        match self {
            Method::Alignment(_) => "alignment",
            Method::Painting(_) => "painting",
            Method::Error(_) => "error",
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            Method::Alignment(m) => m.as_str(),
            Method::Painting(m) => m.as_str(),
            Method::Error(ErrorMethod::Error) => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Method::Error(_))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity(), self.operation())
    }
}

/// 필드 없는 파라미터 (`{}`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyParam {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PeerIdParam {
    pub peer_id: PeerId,
}

/// 손가락 포즈 샘플
///
/// `peer_id` 는 포즈를 캡처한 피어
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SetTransformParam {
    pub peer_id: PeerId,
    pub matrix: WireMatrix,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetATransformParam {
    #[serde(rename = "A")]
    pub a: WireMatrix,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetBTransformParam {
    #[serde(rename = "B")]
    pub b: WireMatrix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetStateParam {
    pub state: AlignmentState,
}

/// 새로 참여한 피어 좌표계로의 변환
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SetNewUserAffineMatrixParam {
    pub new_peer_id: PeerId,
    pub affine_matrix: WireMatrix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewPeerParam {
    pub new_peer_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StrokeColorParam {
    pub stroke_color_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StrokeIdParam {
    pub stroke_id: Uuid,
}

/// 스트로크 점 추가 (수신 피어 좌표계 기준)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StrokePointParam {
    pub stroke_id: Uuid,
    pub point: WirePoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StrokesParam {
    pub strokes: Vec<Stroke>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ToolParam {
    pub tool_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ErrorParam {
    pub error_message: String,
}

/// RPC 파라미터
///
/// 외부 태깅된 합 타입이라 디코딩 시 우선순위 탐색 없이 키로 바로 결정됨
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Param {
    InitMyPeer(PeerIdParam),
    InitOtherPeer(PeerIdParam),
    ResetPeer(EmptyParam),
    RequestTransform(EmptyParam),
    SetTransform(SetTransformParam),
    SetATransform(SetATransformParam),
    SetBTransform(SetBTransformParam),
    #[serde(rename = "clacAffineMatrix")]
    CalcAffineMatrix(EmptyParam),
    SetState(SetStateParam),
    SetNewUserAffineMatrix(SetNewUserAffineMatrixParam),
    PrepareBroadcastNewUserAffineMatrix(NewPeerParam),

    SetStrokeColor(StrokeColorParam),
    RemoveAllStroke(EmptyParam),
    RemoveStroke(StrokeIdParam),
    AddStrokePoint(StrokePointParam),
    AddStrokes(StrokesParam),
    FinishStroke(StrokeIdParam),
    ChangeFingerLineWidth(ToolParam),
    ConfirmTmpStrokes(StrokesParam),

    Error(ErrorParam),
}

impl Param {
    /// 파라미터가 가리키는 메서드
    pub fn method(&self) -> Method {
        use AlignmentMethod as A;
        use PaintingMethod as P;

        match self {
            Param::InitMyPeer(_) => Method::Alignment(A::InitMyPeer),
            Param::InitOtherPeer(_) => Method::Alignment(A::InitOtherPeer),
            Param::ResetPeer(_) => Method::Alignment(A::ResetPeer),
            Param::RequestTransform(_) => Method::Alignment(A::RequestTransform),
            Param::SetTransform(_) => Method::Alignment(A::SetTransform),
            Param::SetATransform(_) => Method::Alignment(A::SetATransform),
            Param::SetBTransform(_) => Method::Alignment(A::SetBTransform),
            Param::CalcAffineMatrix(_) => Method::Alignment(A::CalcAffineMatrix),
            Param::SetState(_) => Method::Alignment(A::SetState),
            Param::SetNewUserAffineMatrix(_) => Method::Alignment(A::SetNewUserAffineMatrix),
            Param::PrepareBroadcastNewUserAffineMatrix(_) => {
                Method::Alignment(A::PrepareBroadcastNewUserAffineMatrix)
            }
            Param::SetStrokeColor(_) => Method::Painting(P::SetStrokeColor),
            Param::RemoveAllStroke(_) => Method::Painting(P::RemoveAllStroke),
            Param::RemoveStroke(_) => Method::Painting(P::RemoveStroke),
            Param::AddStrokePoint(_) => Method::Painting(P::AddStrokePoint),
            Param::AddStrokes(_) => Method::Painting(P::AddStrokes),
            Param::FinishStroke(_) => Method::Painting(P::FinishStroke),
            Param::ChangeFingerLineWidth(_) => Method::Painting(P::ChangeFingerLineWidth),
            Param::ConfirmTmpStrokes(_) => Method::Painting(P::ConfirmTmpStrokes),
            Param::Error(_) => Method::Error(ErrorMethod::Error),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Param::Error(ErrorParam {
            error_message: message.into(),
        })
    }
}

/// RPC 요청 엔벨로프
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestEnvelope {
    pub id: Uuid,
    pub origin_peer_id: PeerId,
    pub method: Method,
    pub param: Param,
}

impl RequestEnvelope {
    /// 새 요청 생성 (method 는 param 에서 결정)
    pub fn new(origin_peer_id: PeerId, param: Param) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin_peer_id,
            method: param.method(),
            param,
        }
    }

    /// method 와 param 이 같은 연산을 가리키는지 확인
    pub fn is_consistent(&self) -> bool {
        self.method == self.param.method()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_wire_shape() {
        let method = Method::Alignment(AlignmentMethod::SetTransform);
        assert_eq!(
            serde_json::to_value(method).unwrap(),
            serde_json::json!({"alignment": "setTransform"})
        );

        let calc = Method::Alignment(AlignmentMethod::CalcAffineMatrix);
        assert_eq!(
            serde_json::to_value(calc).unwrap(),
            serde_json::json!({"alignment": "clacAffineMatrix"})
        );

        let error = Method::Error(ErrorMethod::Error);
        assert_eq!(serde_json::to_value(error).unwrap(), serde_json::json!({"error": "error"}));
    }

    #[test]
    fn test_param_wire_shape() {
        let param = Param::SetATransform(SetATransformParam {
            a: [[1.0, 0.0, 0.0, 0.5], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0]],
        });
        let value = serde_json::to_value(&param).unwrap();
        assert_eq!(value["setATransform"]["A"][0][3], 0.5);

        let reset = serde_json::to_value(Param::ResetPeer(EmptyParam {})).unwrap();
        assert_eq!(reset, serde_json::json!({"resetPeer": {}}));

        let error = serde_json::to_value(Param::error("boom")).unwrap();
        assert_eq!(error, serde_json::json!({"error": {"errorMessage": "boom"}}));
    }

    #[test]
    fn test_every_method_display_is_unique() {
        let names: std::collections::HashSet<String> = Method::all().map(|m| m.to_string()).collect();
        assert_eq!(names.len(), Method::all().count());
        assert_eq!(Method::all().count(), 20);
    }

    #[test]
    fn test_envelope_method_follows_param() {
        let envelope = RequestEnvelope::new(PeerId(7), Param::RemoveAllStroke(EmptyParam {}));
        assert_eq!(envelope.method, Method::Painting(PaintingMethod::RemoveAllStroke));
        assert!(envelope.is_consistent());
    }

    #[test]
    fn test_peer_id_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&PeerId(42)).unwrap(), "42");
        assert!(PeerId(1) < PeerId(2));
    }
}
