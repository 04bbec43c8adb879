use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of `POST /api/recognize`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RecognizeRequest {
    #[serde(default)]
    pub image: Option<String>,
}

/// Success envelope returned by `/api/recognize`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RecognizeResponse {
    pub success: bool,
    pub text: String,
}

impl RecognizeResponse {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: text.into(),
        }
    }
}

/// Failure envelope shared by every endpoint.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub endpoints: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
