//! 엔벨로프 코덱
//!
//! 본문은 JSON, 앞에 bincode 고정 길이 헤더(매직, 버전, 길이, CRC32)를 붙임

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, Result};
use crate::message::RequestEnvelope;
use crate::{MAGIC_NUMBER, PROTOCOL_VERSION};

/// 헤더 길이 (magic 4 + version 1 + payload_len 4 + crc32 4)
pub const FRAME_HEADER_LEN: usize = 13;

/// 프레임 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// 매직 넘버
    pub magic: u32,

    /// 프로토콜 버전
    pub version: u8,

    /// JSON 본문 길이
    pub payload_len: u32,

    /// JSON 본문 CRC32
    pub crc32: u32,
}

impl FrameHeader {
    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            payload_len: payload.len() as u32,
            crc32: crc32fast::hash(payload),
        }
    }
}

/// 엔벨로프를 JSON 으로 직렬화
pub fn encode_json(envelope: &RequestEnvelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// JSON 을 엔벨로프로 역직렬화
///
/// 알 수 없는 키나 필드는 JSON 에러, method/param 불일치는 `InvalidParameter`
pub fn decode_json(payload: &[u8]) -> std::result::Result<RequestEnvelope, DecodeError> {
    let envelope: RequestEnvelope = serde_json::from_slice(payload)?;
    if !envelope.is_consistent() {
        return Err(DecodeError::InvalidParameter {
            method: envelope.method,
            param: envelope.param.method(),
        });
    }
    Ok(envelope)
}

/// 전송용 프레임 생성
pub fn encode(envelope: &RequestEnvelope) -> Result<Bytes> {
    let payload = encode_json(envelope)?;
    let header = bincode::serialize(&FrameHeader::for_payload(&payload))?;

    let mut buf = BytesMut::with_capacity(header.len() + payload.len());
    buf.put_slice(&header);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// 프레임 검증 후 엔벨로프 디코딩
pub fn decode(frame: &[u8]) -> std::result::Result<RequestEnvelope, DecodeError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(DecodeError::FrameTooShort { len: frame.len() });
    }

    let header: FrameHeader = bincode::deserialize(&frame[..FRAME_HEADER_LEN])?;
    if header.magic != MAGIC_NUMBER {
        return Err(DecodeError::InvalidMagicNumber {
            expected: MAGIC_NUMBER,
            got: header.magic,
        });
    }
    if header.version != PROTOCOL_VERSION {
        return Err(DecodeError::InvalidVersion {
            expected: PROTOCOL_VERSION,
            got: header.version,
        });
    }

    let payload = &frame[FRAME_HEADER_LEN..];
    if payload.len() != header.payload_len as usize {
        return Err(DecodeError::PayloadLength {
            declared: header.payload_len,
            actual: payload.len(),
        });
    }

    let crc = crc32fast::hash(payload);
    if crc != header.crc32 {
        return Err(DecodeError::CrcMismatch {
            expected: header.crc32,
            got: crc,
        });
    }

    decode_json(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use proptest::prelude::*;

    use crate::drawing::Stroke;
    use crate::matrix::{WireMatrix, WirePoint};
    use crate::message::*;
    use crate::session::AlignmentState;

    fn matrix() -> WireMatrix {
        [[1.0, 0.0, 0.0, 0.1], [0.0, 1.0, 0.0, 1.2], [0.0, 0.0, 1.0, -0.3], [0.0, 0.0, 0.0, 1.0]]
    }

    fn stroke() -> Stroke {
        Stroke {
            id: uuid::Uuid::new_v4(),
            color: "red".into(),
            line_width: 0.01,
            points: vec![[0.0, 1.0, 2.0], [0.5, 1.0, 2.0]],
        }
    }

    /// 모든 메서드의 파라미터 하나씩
    fn one_of_each() -> Vec<Param> {
        let peer = PeerId(0x2a);
        let stroke_id = uuid::Uuid::new_v4();
        vec![
            Param::InitMyPeer(PeerIdParam { peer_id: peer }),
            Param::InitOtherPeer(PeerIdParam { peer_id: PeerId(7) }),
            Param::ResetPeer(EmptyParam {}),
            Param::RequestTransform(EmptyParam {}),
            Param::SetTransform(SetTransformParam { peer_id: peer, matrix: matrix() }),
            Param::SetATransform(SetATransformParam { a: matrix() }),
            Param::SetBTransform(SetBTransformParam { b: matrix() }),
            Param::CalcAffineMatrix(EmptyParam {}),
            Param::SetState(SetStateParam {
                state: AlignmentState::AcquiringAsHost,
            }),
            Param::SetNewUserAffineMatrix(SetNewUserAffineMatrixParam {
                new_peer_id: PeerId(99),
                affine_matrix: matrix(),
            }),
            Param::PrepareBroadcastNewUserAffineMatrix(NewPeerParam { new_peer_id: PeerId(99) }),
            Param::SetStrokeColor(StrokeColorParam {
                stroke_color_name: "cyan".into(),
            }),
            Param::RemoveAllStroke(EmptyParam {}),
            Param::RemoveStroke(StrokeIdParam { stroke_id }),
            Param::AddStrokePoint(StrokePointParam {
                stroke_id,
                point: [0.25, 1.5, -0.75],
            }),
            Param::AddStrokes(StrokesParam { strokes: vec![stroke()] }),
            Param::FinishStroke(StrokeIdParam { stroke_id }),
            Param::ChangeFingerLineWidth(ToolParam {
                tool_name: "thick".into(),
            }),
            Param::ConfirmTmpStrokes(StrokesParam {
                strokes: vec![stroke(), stroke()],
            }),
            Param::error("샘플 수 부족"),
        ]
    }

    #[test]
    fn test_frame_round_trip() {
        let params = one_of_each();
        let methods: HashSet<Method> = params.iter().map(Param::method).collect();
        assert_eq!(methods, Method::all().collect::<HashSet<_>>());

        for param in params {
            let envelope = RequestEnvelope::new(PeerId(0x2a), param);
            let frame = encode(&envelope).unwrap();
            let decoded = decode(&frame).unwrap();
            assert_eq!(decoded, envelope);
        }
    }

    // 16 으로 나눈 정수라 JSON 을 거쳐도 f32 값이 그대로 유지됨
    fn wire_scalar() -> impl Strategy<Value = f32> {
        (-4000i32..4000).prop_map(|v| v as f32 / 16.0)
    }

    fn wire_matrix() -> impl Strategy<Value = WireMatrix> {
        prop::array::uniform4(prop::array::uniform4(wire_scalar()))
    }

    fn wire_point() -> impl Strategy<Value = WirePoint> {
        prop::array::uniform3(wire_scalar())
    }

    fn peer_id() -> impl Strategy<Value = PeerId> {
        any::<u64>().prop_map(PeerId)
    }

    fn stroke_id() -> impl Strategy<Value = uuid::Uuid> {
        any::<u128>().prop_map(uuid::Uuid::from_u128)
    }

    fn text() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9 가-힣]{0,16}"
    }

    fn strokes() -> impl Strategy<Value = Vec<Stroke>> {
        prop::collection::vec(
            (stroke_id(), text(), wire_scalar(), prop::collection::vec(wire_point(), 0..4)).prop_map(
                |(id, color, line_width, points)| Stroke {
                    id,
                    color,
                    line_width,
                    points,
                },
            ),
            0..3,
        )
    }

    fn state() -> impl Strategy<Value = AlignmentState> {
        prop::sample::select(vec![
            AlignmentState::Initial,
            AlignmentState::Selecting,
            AlignmentState::AcquiringAsHost,
            AlignmentState::AcquiringAsClient,
            AlignmentState::Confirming,
            AlignmentState::Prepared,
        ])
    }

    fn param() -> impl Strategy<Value = Param> {
        prop_oneof![
            peer_id().prop_map(|peer_id| Param::InitMyPeer(PeerIdParam { peer_id })),
            peer_id().prop_map(|peer_id| Param::InitOtherPeer(PeerIdParam { peer_id })),
            Just(Param::ResetPeer(EmptyParam {})),
            Just(Param::RequestTransform(EmptyParam {})),
            (peer_id(), wire_matrix()).prop_map(|(peer_id, matrix)| Param::SetTransform(SetTransformParam { peer_id, matrix })),
            wire_matrix().prop_map(|a| Param::SetATransform(SetATransformParam { a })),
            wire_matrix().prop_map(|b| Param::SetBTransform(SetBTransformParam { b })),
            Just(Param::CalcAffineMatrix(EmptyParam {})),
            state().prop_map(|state| Param::SetState(SetStateParam { state })),
            (peer_id(), wire_matrix()).prop_map(|(new_peer_id, affine_matrix)| {
                Param::SetNewUserAffineMatrix(SetNewUserAffineMatrixParam {
                    new_peer_id,
                    affine_matrix,
                })
            }),
            peer_id().prop_map(|new_peer_id| Param::PrepareBroadcastNewUserAffineMatrix(NewPeerParam { new_peer_id })),
            text().prop_map(|stroke_color_name| Param::SetStrokeColor(StrokeColorParam { stroke_color_name })),
            Just(Param::RemoveAllStroke(EmptyParam {})),
            stroke_id().prop_map(|stroke_id| Param::RemoveStroke(StrokeIdParam { stroke_id })),
            (stroke_id(), wire_point()).prop_map(|(stroke_id, point)| Param::AddStrokePoint(StrokePointParam { stroke_id, point })),
            strokes().prop_map(|strokes| Param::AddStrokes(StrokesParam { strokes })),
            stroke_id().prop_map(|stroke_id| Param::FinishStroke(StrokeIdParam { stroke_id })),
            text().prop_map(|tool_name| Param::ChangeFingerLineWidth(ToolParam { tool_name })),
            strokes().prop_map(|strokes| Param::ConfirmTmpStrokes(StrokesParam { strokes })),
            text().prop_map(|message| Param::error(message)),
        ]
    }

    proptest! {
        #[test]
        fn prop_any_envelope_survives_frame(origin in peer_id(), param in param()) {
            let envelope = RequestEnvelope::new(origin, param);
            let frame = encode(&envelope).unwrap();
            prop_assert_eq!(decode(&frame).unwrap(), envelope);
        }
    }

    #[test]
    fn test_header_length_is_fixed() {
        let envelope = RequestEnvelope::new(PeerId(1), Param::ResetPeer(EmptyParam {}));
        let frame = encode(&envelope).unwrap();
        let json = encode_json(&envelope).unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_LEN + json.len());
    }

    #[test]
    fn test_mismatched_method_and_param() {
        let json = serde_json::json!({
            "id": uuid::Uuid::new_v4(),
            "originPeerId": 3,
            "method": {"painting": "removeStroke"},
            "param": {"resetPeer": {}}
        });
        let err = decode_json(json.to_string().as_bytes()).unwrap_err();
        match err {
            DecodeError::InvalidParameter { method, param } => {
                assert_eq!(method, Method::Painting(PaintingMethod::RemoveStroke));
                assert_eq!(param, Method::Alignment(AlignmentMethod::ResetPeer));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_shapes_rejected() {
        let unknown_method = serde_json::json!({
            "id": uuid::Uuid::new_v4(),
            "originPeerId": 3,
            "method": {"alignment": "teleport"},
            "param": {"resetPeer": {}}
        });
        assert!(matches!(
            decode_json(unknown_method.to_string().as_bytes()),
            Err(DecodeError::Json(_))
        ));

        let extra_field = serde_json::json!({
            "id": uuid::Uuid::new_v4(),
            "originPeerId": 3,
            "method": {"alignment": "initMyPeer"},
            "param": {"initMyPeer": {"peerId": 3, "extra": true}}
        });
        assert!(matches!(
            decode_json(extra_field.to_string().as_bytes()),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_corrupted_frames() {
        let envelope = RequestEnvelope::new(PeerId(5), Param::RemoveAllStroke(EmptyParam {}));
        let frame = encode(&envelope).unwrap().to_vec();

        assert!(matches!(decode(&frame[..8]), Err(DecodeError::FrameTooShort { len: 8 })));

        let mut bad_magic = frame.clone();
        bad_magic[0] ^= 0xFF;
        assert!(matches!(decode(&bad_magic), Err(DecodeError::InvalidMagicNumber { .. })));

        let mut bad_body = frame.clone();
        let last = bad_body.len() - 2;
        bad_body[last] ^= 0x01;
        assert!(matches!(decode(&bad_body), Err(DecodeError::CrcMismatch { .. })));

        let truncated = &frame[..frame.len() - 1];
        assert!(matches!(decode(truncated), Err(DecodeError::PayloadLength { .. })));
    }
}
