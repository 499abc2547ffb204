//! Framing and response encoding shared by `serve` and `load`.
//!
//! Each request is one length-delimited frame carrying the raw payload.
//! Each response is one length-delimited frame carrying a JSON [`WireResponse`].

use disk_write_bench::{RequestError, TestResponse, WriteOutcome};
use tokio_util::codec::LengthDelimitedCodec;

pub(crate) const DEFAULT_MAX_FRAME_BYTES: usize = 8 << 20;

pub(crate) fn codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) struct WireResponse {
    pub(crate) cpu_usage: String,
    pub(crate) error: Option<WireError>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) struct WireError {
    pub(crate) code: String,
    pub(crate) message: String,
}

impl WireResponse {
    pub(crate) fn new(response: TestResponse, res: Result<WriteOutcome, RequestError>) -> Self {
        WireResponse {
            cpu_usage: response.cpu_usage,
            error: res.err().map(|e| WireError {
                code: e.code().to_owned(),
                message: e.to_string(),
            }),
        }
    }
}
