use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// JSON document published to the error topic when an invocation fails
/// terminally.
///
/// The field names are part of the connector contract (consumers of the
/// error topic parse this document), so they are pinned with serde renames
/// rather than following Rust naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "FunctionHTTPRequest")]
    pub request: FunctionHttpRequest,
    #[serde(rename = "FunctionHTTPResponse")]
    pub response: FunctionHttpResponse,
}

/// Echo of the request the connector attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionHttpRequest {
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "HTTPEndpoint")]
    pub http_endpoint: String,
    #[serde(rename = "Headers")]
    pub headers: HashMap<String, Vec<String>>,
}

/// What came back, or didn't. `status_code` is 500 when no response was
/// ever received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionHttpResponse {
    #[serde(rename = "ResponseBody")]
    pub response_body: String,
    #[serde(rename = "StatusCode")]
    pub status_code: u16,
    #[serde(rename = "ErrorString")]
    pub error_string: String,
}
