//! Worker message protocol
//!
//! Requests are `{id, op, ...params}`; responses are `{id, result}` or
//! `{id, error, code?}`. Id `-1` addresses no pending request and is used
//! for the ready handshake.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{FaceError, Result};
use crate::service::types::DetectionMode;
use crate::types::Detection;

/// Id that addresses no pending request
pub const UNADDRESSED_ID: i64 = -1;

/// Operations a worker context understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    Detect,
    DetectFromPixels,
    Embedding,
    Embeddings,
    Segment,
    SegmentFromPixels,
    Dispose,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Detect => "detect",
            Op::DetectFromPixels => "detectFromPixels",
            Op::Embedding => "embedding",
            Op::Embeddings => "embeddings",
            Op::Segment => "segment",
            Op::SegmentFromPixels => "segmentFromPixels",
            Op::Dispose => "dispose",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: i64,
    pub op: Op,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl WorkerRequest {
    /// `params` must be a JSON object or null
    pub fn new(id: i64, op: Op, params: Value) -> Result<Self> {
        let params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(FaceError::invalid(format!(
                    "request params must be an object, got {}",
                    other
                )))
            }
        };
        Ok(Self { id, op, params })
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.params.clone();
        map.insert("id".into(), json!(self.id));
        map.insert("op".into(), json!(self.op));
        Value::Object(map)
    }

    /// Deserialize the params into a typed struct
    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.params.clone())).map_err(|e| {
            FaceError::invalid(format!("bad params for {}: {}", self.op.as_str(), e))
        })
    }
}

/// Error as carried in a response
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub message: String,
    pub code: Option<String>,
}

impl RemoteError {
    pub fn into_error(self) -> FaceError {
        FaceError::from_remote(self.code.as_deref(), self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    pub id: i64,
    pub outcome: std::result::Result<Value, RemoteError>,
}

impl WorkerResponse {
    pub fn ok(id: i64, result: Value) -> Self {
        Self { id, outcome: Ok(result) }
    }

    pub fn err(id: i64, error: &FaceError) -> Self {
        Self {
            id,
            outcome: Err(RemoteError {
                message: error.to_string(),
                code: Some(error.code().to_string()),
            }),
        }
    }

    pub fn to_value(&self) -> Value {
        match &self.outcome {
            Ok(result) => json!({ "id": self.id, "result": result }),
            Err(RemoteError { message, code: Some(code) }) => {
                json!({ "id": self.id, "error": message, "code": code })
            }
            Err(RemoteError { message, code: None }) => json!({ "id": self.id, "error": message }),
        }
    }

    /// Parse a response; `None` when it is not a well-formed response
    ///
    /// A non-string `error` is kept as its JSON text.
    pub fn parse(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let id = obj.get("id")?.as_i64()?;

        if let Some(error) = obj.get("error") {
            let message = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let code = obj.get("code").and_then(Value::as_str).map(str::to_owned);
            return Some(Self {
                id,
                outcome: Err(RemoteError { message, code }),
            });
        }

        let result = obj.get("result")?.clone();
        Some(Self { id, outcome: Ok(result) })
    }

    pub fn into_result(self) -> Result<Value> {
        self.outcome.map_err(RemoteError::into_error)
    }
}

/// First message a worker sends after setup
#[derive(Debug)]
pub enum Handshake {
    Ready,
    Failed(FaceError),
}

pub fn ready_message() -> Value {
    json!({ "id": UNADDRESSED_ID, "ready": true })
}

pub fn handshake_failure(error: &FaceError) -> Value {
    WorkerResponse::err(UNADDRESSED_ID, error).to_value()
}

/// Recognize a handshake message; anything else yields `None`
pub fn parse_handshake(value: &Value) -> Option<Handshake> {
    if value.get("id").and_then(Value::as_i64) != Some(UNADDRESSED_ID) {
        return None;
    }
    if value.get("ready").and_then(Value::as_bool) == Some(true) {
        return Some(Handshake::Ready);
    }
    let response = WorkerResponse::parse(value)?;
    match response.outcome {
        Err(remote) => Some(Handshake::Failed(remote.into_error())),
        Ok(_) => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectParams {
    pub image: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DetectionMode>,
}

/// Raw RGBA pixels, for `detectFromPixels` and `segmentFromPixels`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixelParams {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DetectionMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingParams {
    pub image: Vec<u8>,
    pub detection: Detection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsParams {
    pub image: Vec<u8>,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentParams {
    pub image: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_flat() {
        let params = serde_json::to_value(PixelParams {
            width: 2,
            height: 1,
            pixels: vec![0; 8],
            mode: None,
        })
        .unwrap();
        let request = WorkerRequest::new(7, Op::DetectFromPixels, params).unwrap();
        let value = request.to_value();

        assert_eq!(value["id"], 7);
        assert_eq!(value["op"], "detectFromPixels");
        assert_eq!(value["width"], 2);

        let back: WorkerRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, request);
        let typed: PixelParams = back.params().unwrap();
        assert_eq!(typed.pixels.len(), 8);
    }

    #[test]
    fn test_bad_params() {
        assert!(WorkerRequest::new(1, Op::Detect, json!([1, 2])).is_err());
        let request = WorkerRequest::new(1, Op::Detect, Value::Null).unwrap();
        let err = request.params::<DetectParams>().unwrap_err();
        assert!(matches!(err, FaceError::InvalidArgument(_)));
    }

    #[test]
    fn test_op_names_match_serde() {
        for op in [Op::Detect, Op::Embeddings, Op::SegmentFromPixels, Op::Dispose] {
            assert_eq!(serde_json::to_value(op).unwrap(), op.as_str());
        }
    }

    #[test]
    fn test_response_parsing() {
        let ok = WorkerResponse::parse(&json!({"id": 3, "result": {"a": 1}})).unwrap();
        assert_eq!(ok.id, 3);
        assert_eq!(ok.into_result().unwrap()["a"], 1);

        let err = WorkerResponse::parse(&json!({"id": 4, "error": "boom"})).unwrap();
        assert!(matches!(err.into_result(), Err(FaceError::Worker(m)) if m == "boom"));

        let null_result = WorkerResponse::parse(&json!({"id": 5, "result": null})).unwrap();
        assert_eq!(null_result.outcome, Ok(Value::Null));

        assert!(WorkerResponse::parse(&json!({"result": 1})).is_none());
        assert!(WorkerResponse::parse(&json!({"id": "x", "result": 1})).is_none());
        assert!(WorkerResponse::parse(&json!({"id": 1})).is_none());
        assert!(WorkerResponse::parse(&json!("hello")).is_none());
    }

    #[test]
    fn test_error_code_round_trip() {
        let value = WorkerResponse::err(9, &FaceError::Disposed).to_value();
        assert_eq!(value["code"], "disposed");
        let parsed = WorkerResponse::parse(&value).unwrap();
        assert!(matches!(parsed.into_result(), Err(FaceError::Disposed)));
    }

    #[test]
    fn test_handshake() {
        assert!(matches!(parse_handshake(&ready_message()), Some(Handshake::Ready)));

        let failed = handshake_failure(&FaceError::ModelNotFound("face_detection".into()));
        match parse_handshake(&failed) {
            Some(Handshake::Failed(FaceError::ModelNotFound(m))) => assert_eq!(m, "face_detection"),
            other => panic!("unexpected {:?}", other),
        }

        assert!(parse_handshake(&json!({"id": 0, "ready": true})).is_none());
        assert!(parse_handshake(&json!({"id": -1, "result": 1})).is_none());
    }
}
