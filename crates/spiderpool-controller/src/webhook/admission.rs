use super::field::ErrorList;
use serde::{Deserialize, Serialize};

/// The standard admission-review envelope served on the webhook endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionReview {
    #[serde(rename = "apiVersion", default = "admission_api_version")]
    pub api_version: String,
    #[serde(default = "admission_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

fn admission_api_version() -> String {
    "admission.k8s.io/v1".to_string()
}

fn admission_kind() -> String {
    "AdmissionReview".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    #[serde(default)]
    pub uid: String,
    /// CREATE, UPDATE, or DELETE
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionStatus {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl AdmissionReview {
    /// An allowed response echoing the request UID
    pub fn allow(uid: &str) -> Self {
        Self::respond(AdmissionResponse {
            uid: uid.to_string(),
            allowed: true,
            status: None,
        })
    }

    /// A denial carrying every field error; internal errors surface as
    /// retriable (HTTP 500), validation failures as terminal (422).
    pub fn deny(uid: &str, errors: &ErrorList) -> Self {
        let retriable = errors.iter().any(|e| e.is_retriable());
        let message = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Self::respond(AdmissionResponse {
            uid: uid.to_string(),
            allowed: false,
            status: Some(AdmissionStatus {
                message,
                code: Some(if retriable { 500 } else { 422 }),
            }),
        })
    }

    fn respond(response: AdmissionResponse) -> Self {
        Self {
            api_version: admission_api_version(),
            kind: admission_kind(),
            request: None,
            response: Some(response),
        }
    }
}
