use crate::{model_service::RawDetection, taxonomy::Taxonomy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("model emitted class index {class_index} outside the taxonomy of {taxonomy_len} classes")]
pub struct UnknownClassIndexError {
    pub class_index: usize,
    pub taxonomy_len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBoxRecord {
    pub bbox_id: u32,
    pub class_name: String,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionResponse {
    pub boxes: Vec<BoundingBoxRecord>,
}

impl DetectionResponse {
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub code: u16,
    pub message: String,
    pub request_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: ErrorDetail,
}

impl ErrorReply {
    pub fn new(request_id: u64, kind: &str, code: u16, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                kind: kind.to_string(),
                code,
                message: message.into(),
                request_id,
            },
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

pub fn encode(
    detections: &[RawDetection],
    taxonomy: &Taxonomy,
) -> Result<DetectionResponse, UnknownClassIndexError> {
    let boxes = detections
        .iter()
        .zip(1u32..)
        .map(|(detection, bbox_id)| {
            let class_name = taxonomy
                .name(detection.class_index)
                .ok_or(UnknownClassIndexError {
                    class_index: detection.class_index,
                    taxonomy_len: taxonomy.len(),
                })?;
            Ok(BoundingBoxRecord {
                bbox_id,
                class_name: class_name.to_string(),
                x1: detection.x1,
                y1: detection.y1,
                x2: detection.x2,
                y2: detection.y2,
            })
        })
        .collect::<Result<Vec<_>, UnknownClassIndexError>>()?;

    Ok(DetectionResponse { boxes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taxonomy() -> Taxonomy {
        Taxonomy::new(vec![
            "person".to_string(),
            "bicycle".to_string(),
            "car".to_string(),
        ])
        .unwrap()
    }

    fn detection(class_index: usize, x1: f32) -> RawDetection {
        RawDetection {
            class_index,
            score: 0.9,
            x1,
            y1: 2.5,
            x2: x1 + 10.0,
            y2: 1.0,
        }
    }

    #[test]
    fn test_encode_assigns_sequential_ids_in_model_order() {
        let detections = vec![detection(2, 30.0), detection(0, 10.0), detection(2, 20.0)];

        let response = encode(&detections, &taxonomy()).unwrap();

        let ids: Vec<u32> = response.boxes.iter().map(|b| b.bbox_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let names: Vec<&str> = response.boxes.iter().map(|b| b.class_name.as_str()).collect();
        assert_eq!(names, vec!["car", "person", "car"]);
        assert_eq!(response.boxes[0].x1, 30.0);
        assert_eq!(response.boxes[1].x1, 10.0);
    }

    #[test]
    fn test_encode_passes_coordinates_through_verbatim() {
        let response = encode(&[detection(1, 5.0)], &taxonomy()).unwrap();

        let record = &response.boxes[0];
        assert_eq!((record.x1, record.y1, record.x2, record.y2), (5.0, 2.5, 15.0, 1.0));
    }

    #[test]
    fn test_encode_empty_scene() {
        let response = encode(&[], &taxonomy()).unwrap();

        assert!(response.is_empty());
        assert_eq!(response.to_json().unwrap(), b"[]");
    }

    #[test]
    fn test_encode_unknown_class_index() {
        let err = encode(&[detection(0, 1.0), detection(7, 1.0)], &taxonomy()).unwrap_err();

        assert_eq!(
            err,
            UnknownClassIndexError {
                class_index: 7,
                taxonomy_len: 3
            }
        );
    }

    #[test]
    fn test_response_wire_format() {
        let response = encode(&[detection(0, 1.5)], &taxonomy()).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&response.to_json().unwrap()).unwrap();

        assert_eq!(
            json,
            serde_json::json!([{
                "bbox_id": 1,
                "class_name": "person",
                "x1": 1.5,
                "y1": 2.5,
                "x2": 11.5,
                "y2": 1.0
            }])
        );
    }

    #[test]
    fn test_error_reply_wire_format() {
        let reply = ErrorReply::new(42, "decode_error", 400, "unrecognized image format");

        let json: serde_json::Value = serde_json::from_slice(&reply.to_json().unwrap()).unwrap();

        assert_eq!(json["error"]["kind"], "decode_error");
        assert_eq!(json["error"]["code"], 400);
        assert_eq!(json["error"]["request_id"], 42);
    }
}
