//! Wire messages exchanged with the external processing engine.
//!
//! Request: `{"id": 7, "method": "find_peaks", "params": {...}}`
//! Response: `{"id": 7, "result": ...}` or `{"id": 7, "error": "..."}`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::BridgeError;

/// The only methods the engine may be asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMethod {
    GetCsvFiles,
    LoadPatientFile,
    LoadLabels,
    SaveLabels,
    LoadDoneFiles,
    ToggleDoneFile,
    LoadReviewFiles,
    FindPeaks,
    GetSegment,
    CalculateDerivative,
    FindOnsetCompression,
    FindUpslope,
}

impl EngineMethod {
    pub const ALL: [EngineMethod; 12] = [
        EngineMethod::GetCsvFiles,
        EngineMethod::LoadPatientFile,
        EngineMethod::LoadLabels,
        EngineMethod::SaveLabels,
        EngineMethod::LoadDoneFiles,
        EngineMethod::ToggleDoneFile,
        EngineMethod::LoadReviewFiles,
        EngineMethod::FindPeaks,
        EngineMethod::GetSegment,
        EngineMethod::CalculateDerivative,
        EngineMethod::FindOnsetCompression,
        EngineMethod::FindUpslope,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineMethod::GetCsvFiles => "get_csv_files",
            EngineMethod::LoadPatientFile => "load_patient_file",
            EngineMethod::LoadLabels => "load_labels",
            EngineMethod::SaveLabels => "save_labels",
            EngineMethod::LoadDoneFiles => "load_done_files",
            EngineMethod::ToggleDoneFile => "toggle_done_file",
            EngineMethod::LoadReviewFiles => "load_review_files",
            EngineMethod::FindPeaks => "find_peaks",
            EngineMethod::GetSegment => "get_segment",
            EngineMethod::CalculateDerivative => "calculate_derivative",
            EngineMethod::FindOnsetCompression => "find_onset_compression",
            EngineMethod::FindUpslope => "find_upslope",
        }
    }
}

impl fmt::Display for EngineMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineMethod {
    type Err = BridgeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EngineMethod::ALL
            .into_iter()
            .find(|method| method.as_str() == value)
            .ok_or_else(|| BridgeError::MethodNotAllowed(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl RpcResponse {
    /// `None` when the message has no usable integer `id`; such messages
    /// cannot be correlated and are dropped by the caller.
    pub fn from_value(message: &Value) -> Option<Self> {
        let object = message.as_object()?;
        let id = object.get("id")?.as_u64()?;
        Some(Self {
            id,
            result: object.get("result").cloned(),
            error: object.get("error").filter(|error| !error.is_null()).cloned(),
        })
    }

    pub fn into_result(self) -> Result<Value, BridgeError> {
        match self.error {
            Some(Value::String(message)) => Err(BridgeError::Remote(message)),
            Some(other) => Err(BridgeError::Remote(other.to_string())),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whitelist_accepts_known_methods_only() {
        for method in EngineMethod::ALL {
            assert_eq!(method.as_str().parse::<EngineMethod>(), Ok(method));
        }
        assert_eq!(
            "os_system".parse::<EngineMethod>(),
            Err(BridgeError::MethodNotAllowed("os_system".into()))
        );
        assert!("FIND_PEAKS".parse::<EngineMethod>().is_err());
    }

    #[test]
    fn responses_need_an_integer_id() {
        assert!(RpcResponse::from_value(&json!({"result": 1})).is_none());
        assert!(RpcResponse::from_value(&json!({"id": "3", "result": 1})).is_none());
        assert!(RpcResponse::from_value(&json!({"id": -1, "result": 1})).is_none());
        assert!(RpcResponse::from_value(&json!([1, 2])).is_none());
    }

    #[test]
    fn error_field_wins_over_result() {
        let failed = RpcResponse::from_value(&json!({"id": 4, "error": "Unknown method"})).unwrap();
        assert_eq!(failed.into_result(), Err(BridgeError::Remote("Unknown method".into())));

        let ok = RpcResponse::from_value(&json!({"id": 5, "result": [1, 2], "error": null})).unwrap();
        assert_eq!(ok.into_result(), Ok(json!([1, 2])));

        let empty = RpcResponse::from_value(&json!({"id": 6})).unwrap();
        assert_eq!(empty.into_result(), Ok(Value::Null));
    }

    #[test]
    fn request_serializes_flat() {
        let request = RpcRequest {
            id: 9,
            method: EngineMethod::FindPeaks.to_string(),
            params: json!({"segment_index": 2}),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"id": 9, "method": "find_peaks", "params": {"segment_index": 2}})
        );
    }
}
