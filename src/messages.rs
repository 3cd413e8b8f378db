// What the engine sends over the websocket.
// Text frames are JSON `{"type": "<kind>", "data": {..}}`; binary frames are preview images.

use anyhow::{bail, Result};
use base64::Engine;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    #[serde(rename = "status")]
    Status(StatusData),
    #[serde(rename = "execution_start")]
    ExecutionStart(PromptData),
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),
    /// A node started executing. `node` is None once the whole prompt is done.
    #[serde(rename = "executing")]
    Executing(ExecutingData),
    /// Step progress inside a long-running node.
    #[serde(rename = "progress")]
    Progress(ProgressData),
    #[serde(rename = "executed")]
    Executed(ExecutedData),
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptData {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    pub output: serde_json::Value,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: Option<String>,
}

/// Fails on malformed JSON and on message types we don't know; callers log and move on.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// A decoded binary preview frame.
#[derive(Clone, PartialEq, Eq)]
pub struct PreviewImage {
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for PreviewImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewImage")
            .field("mime", &self.mime)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl PreviewImage {
    /// Frame layout: u32 event type, u32 image format (1 = JPEG, 2 = PNG), both big-endian,
    /// then the encoded image.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < 8 {
            bail!("preview frame too short ({} bytes)", frame.len());
        }
        let format = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let mime = match format {
            1 => "image/jpeg",
            _ => "image/png",
        };
        Ok(PreviewImage {
            mime,
            bytes: frame[8..].to_vec(),
        })
    }

    pub fn data_uri(&self) -> String {
        data_uri(self.mime, &self.bytes)
    }
}

pub fn data_uri(mime: &str, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}
