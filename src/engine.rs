//! Typed wrappers over the whitelisted engine methods.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::bridge::{BridgeError, EngineMethod, RpcBridge};
use crate::models::Recording;
use crate::persistence::DoneToggle;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PeakResult {
    #[serde(default)]
    pub systolic: Vec<i64>,
    #[serde(default)]
    pub diastolic: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SegmentData {
    pub columns: Vec<String>,
    pub data: Vec<Vec<Option<f64>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnsetParams {
    /// Samples before a systolic peak searched for a second-derivative peak.
    pub window: u32,
    /// Subtracted from each onset found.
    pub offset: u32,
}

impl Default for OnsetParams {
    fn default() -> Self {
        Self {
            window: 30,
            offset: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMethod {
    Percentile,
    Std,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpslopeParams {
    pub threshold_method: ThresholdMethod,
    pub threshold_value: f64,
    pub min_distance: u32,
    pub max_distance: u32,
}

impl Default for UpslopeParams {
    fn default() -> Self {
        Self {
            threshold_method: ThresholdMethod::Percentile,
            threshold_value: 75.0,
            min_distance: 0,
            max_distance: 50,
        }
    }
}

#[derive(Clone)]
pub struct EngineClient {
    bridge: Arc<RpcBridge>,
}

impl EngineClient {
    pub fn new(bridge: Arc<RpcBridge>) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &Arc<RpcBridge> {
        &self.bridge
    }

    async fn invoke<T: DeserializeOwned>(
        &self,
        method: EngineMethod,
        params: Value,
    ) -> Result<T, BridgeError> {
        let result = self.bridge.call_method(method, params).await?;
        serde_json::from_value(result)
            .map_err(|err| BridgeError::Decode(format!("{method}: {err}")))
    }

    pub async fn list_files(&self, folder: &str) -> Result<Vec<String>, BridgeError> {
        self.invoke(EngineMethod::GetCsvFiles, json!({ "folder": folder }))
            .await
    }

    pub async fn load_patient_file(
        &self,
        filename: &str,
        folder: &str,
    ) -> Result<Recording, BridgeError> {
        self.invoke(
            EngineMethod::LoadPatientFile,
            json!({ "filename": filename, "folder": folder }),
        )
        .await
    }

    pub async fn get_segment(
        &self,
        recording: &Recording,
        segment_index: u32,
        segment_length: u32,
    ) -> Result<SegmentData, BridgeError> {
        let file_data = json!({ "columns": recording.columns, "data": recording.data });
        self.invoke(
            EngineMethod::GetSegment,
            json!({
                "file_data": file_data,
                "segment_index": segment_index,
                "segment_length": segment_length,
            }),
        )
        .await
    }

    pub async fn find_peaks(
        &self,
        signal: &[f64],
        segment_index: u32,
    ) -> Result<PeakResult, BridgeError> {
        self.invoke(
            EngineMethod::FindPeaks,
            json!({ "signal_data": signal, "segment_index": segment_index }),
        )
        .await
    }

    pub async fn calculate_derivative(&self, signal: &[f64]) -> Result<Vec<f64>, BridgeError> {
        self.invoke(
            EngineMethod::CalculateDerivative,
            json!({ "signal_data": signal }),
        )
        .await
    }

    pub async fn find_onset_compression(
        &self,
        signal: &[f64],
        systolic_peaks: &[u32],
        params: OnsetParams,
    ) -> Result<Vec<i64>, BridgeError> {
        self.invoke(
            EngineMethod::FindOnsetCompression,
            json!({
                "signal_data": signal,
                "systolic_peaks": systolic_peaks,
                "window": params.window,
                "offset": params.offset,
            }),
        )
        .await
    }

    pub async fn find_upslope(
        &self,
        signal: &[f64],
        systolic_peaks: &[u32],
        params: UpslopeParams,
    ) -> Result<Vec<i64>, BridgeError> {
        self.invoke(
            EngineMethod::FindUpslope,
            json!({
                "signal_data": signal,
                "systolic_peaks": systolic_peaks,
                "threshold_method": params.threshold_method,
                "threshold_value": params.threshold_value,
                "min_distance": params.min_distance,
                "max_distance": params.max_distance,
            }),
        )
        .await
    }

    pub async fn load_labels(
        &self,
        filename: &str,
        labeler_name: &str,
        labels_directory: &str,
    ) -> Result<Value, BridgeError> {
        self.invoke(
            EngineMethod::LoadLabels,
            json!({
                "filename": filename,
                "labeler_name": labeler_name,
                "labels_directory": labels_directory,
            }),
        )
        .await
    }

    pub async fn save_labels(
        &self,
        filename: &str,
        labeler_name: &str,
        labels_directory: &str,
        labels: &Value,
    ) -> Result<(), BridgeError> {
        let _: Value = self
            .invoke(
                EngineMethod::SaveLabels,
                json!({
                    "filename": filename,
                    "labeler_name": labeler_name,
                    "labels_directory": labels_directory,
                    "labels": labels,
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn load_done_files(
        &self,
        labeler_name: &str,
        labels_directory: &str,
    ) -> Result<Vec<String>, BridgeError> {
        self.invoke(
            EngineMethod::LoadDoneFiles,
            json!({ "labeler_name": labeler_name, "labels_directory": labels_directory }),
        )
        .await
    }

    pub async fn toggle_done_file(
        &self,
        filename: &str,
        labeler_name: &str,
        labels_directory: &str,
    ) -> Result<DoneToggle, BridgeError> {
        self.invoke(
            EngineMethod::ToggleDoneFile,
            json!({
                "filename": filename,
                "labeler_name": labeler_name,
                "labels_directory": labels_directory,
            }),
        )
        .await
    }

    pub async fn load_review_files(
        &self,
        labeler_name: &str,
        labels_directory: &str,
    ) -> Result<Vec<String>, BridgeError> {
        self.invoke(
            EngineMethod::LoadReviewFiles,
            json!({ "labeler_name": labeler_name, "labels_directory": labels_directory }),
        )
        .await
    }
}
