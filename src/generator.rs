// Talks to the ComfyUI engine.
// A generation submits one workflow, follows the websocket until the engine says the prompt is
// done, then pulls the result images out of the history. Everything is reported as a stream of
// GenerationEvents that ends in Completed or Error.

use std::{future::Future, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_stream::try_stream;
use futures::{select, FutureExt, Stream, StreamExt};
use log::{debug, info, trace, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_retry::{strategy::ExponentialBackoff, Retry};
use tokio_tungstenite as ws;
use tungstenite::Message;
use uuid::Uuid;

use crate::{
    config::BackendConfig,
    flow_generator::{NodeId, Workflow, OUTPUT_TITLE, PREVIEW_TITLE},
    messages::{data_uri, parse_message, ComfyUIMessage, PreviewImage},
    params::Params,
};

/// generate() returns a stream of these.
#[derive(Debug)]
pub enum GenerationEvent {
    /// The engine accepted the workflow under this prompt id.
    Queued(String),
    /// Step progress as the engine reports it.
    Progress { step: u32, total: u32 },
    /// A preview image. `step` is our own running count, capped at `total`.
    Preview {
        kind: PreviewKind,
        step: u32,
        total: u32,
        image: PreviewImage,
    },
    /// Generation has completed.
    Completed(Vec<GeneratedImage>),
    /// Something broke.
    /// The generator has stopped.
    Error(anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreviewKind {
    /// Intermediate sampler output.
    Step,
    /// The preprocessed ControlNet reference image.
    Preprocessor,
}

#[derive(Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub filename: String,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for GeneratedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GeneratedImage({}, {} bytes)", self.filename, self.data.len())
    }
}

/// Where the engine stored an output image; the query for /view.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// Steps the progress bar should count to: the main pass, plus the hi-res pass when enabled.
pub fn expected_steps(params: &Params) -> u32 {
    let mut steps = params.i64_or("steps", 20);
    if params.is_set("hf_enable") {
        steps = steps.saturating_add(params.i64_or("hf_steps", 15));
    }
    u32::try_from(steps.max(0)).unwrap_or(u32::MAX)
}

/// Follows the websocket messages of one prompt.
struct ExecutionTracker {
    prompt_id: String,
    preview_node: Option<String>,
    /// The preview node is executing, so the next binary frame is its image.
    expecting_preprocessor: bool,
    step: u32,
    total: u32,
    done: bool,
}

impl ExecutionTracker {
    fn new(prompt_id: String, preview_node: Option<NodeId>, total: u32) -> Self {
        Self {
            prompt_id,
            preview_node: preview_node.map(|id| id.to_string()),
            expecting_preprocessor: false,
            step: 0,
            total,
            done: false,
        }
    }

    fn on_text(&mut self, text: &str) -> Result<Option<GenerationEvent>> {
        let message = match parse_message(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring websocket message ({}): {}", e, text);
                return Ok(None);
            }
        };
        match message {
            ComfyUIMessage::Executing(data) => {
                match data.node {
                    None if data.prompt_id.as_deref() == Some(self.prompt_id.as_str()) => self.done = true,
                    None => {}
                    node => self.expecting_preprocessor = node == self.preview_node,
                }
                Ok(None)
            }
            ComfyUIMessage::Progress(data) => {
                self.step = data.value;
                Ok(Some(GenerationEvent::Progress {
                    step: data.value,
                    total: data.max,
                }))
            }
            ComfyUIMessage::ExecutionStart(data) => {
                if data.prompt_id == self.prompt_id {
                    debug!("Prompt {} started executing", data.prompt_id);
                }
                Ok(None)
            }
            ComfyUIMessage::ExecutionCached(data) => {
                if data.prompt_id == self.prompt_id {
                    debug!("Prompt {} reuses {} cached nodes", data.prompt_id, data.nodes.len());
                }
                Ok(None)
            }
            ComfyUIMessage::Executed(data) => {
                trace!("Node {} of prompt {} finished: {}", data.node, data.prompt_id, data.output);
                Ok(None)
            }
            ComfyUIMessage::ExecutionError(data) if data.prompt_id == self.prompt_id => {
                warn!(
                    "Prompt {} raised {}",
                    data.prompt_id,
                    data.exception_type.as_deref().unwrap_or("an exception")
                );
                bail!(
                    "{} (node {}) failed: {}",
                    data.node_type.as_deref().unwrap_or("node"),
                    data.node_id.as_deref().unwrap_or("?"),
                    data.exception_message
                );
            }
            ComfyUIMessage::Status(data) => {
                debug!("Queue remaining: {}", data.status.exec_info.queue_remaining);
                Ok(None)
            }
            ComfyUIMessage::ExecutionError(data) => {
                trace!("Ignoring error from prompt {}", data.prompt_id);
                Ok(None)
            }
        }
    }

    fn on_binary(&mut self, frame: &[u8]) -> Option<GenerationEvent> {
        let image = match PreviewImage::parse(frame) {
            Ok(image) => image,
            Err(e) => {
                warn!("Bad preview frame: {:#}", e);
                return None;
            }
        };
        let kind = if std::mem::take(&mut self.expecting_preprocessor) {
            PreviewKind::Preprocessor
        } else {
            // Tiny frames are placeholders, not real steps.
            if image.bytes.len() > 100 {
                self.step += 1;
            }
            PreviewKind::Step
        };
        Some(GenerationEvent::Preview {
            kind,
            step: self.step.min(self.total),
            total: self.total,
            image,
        })
    }
}

/// Feeds websocket frames through `tracker` until the engine reports the prompt done.
/// Ends early, without an error, when the socket closes. Fails when `deadline` fires first.
fn follow_prompt<'a, S, E, D>(
    frames: &'a mut S,
    tracker: &'a mut ExecutionTracker,
    deadline: D,
    timeout_secs: u64,
) -> impl Stream<Item = Result<GenerationEvent>> + 'a
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
    D: Future + 'a,
{
    try_stream! {
        let mut deadline = Box::pin(deadline).fuse();
        while !tracker.done {
            let msg = select! {
                msg = frames.next().fuse() => Some(msg),
                _ = deadline => None,
            };
            let Some(msg) = msg else {
                warn!("Prompt {} timed out after {}s", tracker.prompt_id, timeout_secs);
                Err::<(), _>(anyhow!("timed out after {}s waiting for the engine", timeout_secs))?;
                break;
            };
            match msg {
                None | Some(Ok(Message::Close(_))) => {
                    warn!("Websocket closed before prompt {} finished", tracker.prompt_id);
                    break;
                }
                Some(Err(e)) => {
                    Err::<(), _>(e).context("websocket error")?;
                }
                Some(Ok(Message::Text(text))) => {
                    trace!("Got websocket message: {}", text);
                    if let Some(event) = tracker.on_text(&text)? {
                        yield event;
                    }
                }
                Some(Ok(Message::Binary(frame))) => {
                    trace!("Got {} byte binary frame", frame.len());
                    if let Some(event) = tracker.on_binary(&frame) {
                        yield event;
                    }
                }
                Some(Ok(other)) => trace!("Ignoring {:?}", other),
            }
        }
    }
}

/// Picks the result images out of one history entry (`history[prompt_id]`).
///
/// The node titled OUTPUT_TITLE wins. Without it, every node with images counts, except the
/// preprocessor preview when some other node produced images too.
pub fn find_output_images(entry: &Value) -> Vec<ImageRef> {
    let Some(outputs) = entry.get("outputs").and_then(Value::as_object) else {
        return vec![];
    };
    // The submitted node table is the third element of the "prompt" array.
    let nodes = entry
        .get("prompt")
        .and_then(|p| p.get(2))
        .and_then(Value::as_object);
    let title_of = |id: &str| {
        nodes
            .and_then(|n| n.get(id))
            .and_then(|n| n.pointer("/_meta/title"))
            .and_then(Value::as_str)
    };
    let images_of = |output: &Value| -> Option<Vec<ImageRef>> {
        output
            .get("images")
            .and_then(|i| serde_json::from_value::<Vec<ImageRef>>(i.clone()).ok())
    };

    let saver = nodes.and_then(|n| n.keys().find(|id| title_of(id) == Some(OUTPUT_TITLE)));
    if let Some(images) = saver.and_then(|id| outputs.get(id)).and_then(images_of) {
        return images;
    }
    warn!("No {} output, falling back to every node with images", OUTPUT_TITLE);

    let with_images: Vec<(&String, Vec<ImageRef>)> = outputs
        .iter()
        .filter_map(|(id, output)| images_of(output).map(|images| (id, images)))
        .collect();
    let other_images = with_images.iter().any(|(id, _)| title_of(id) != Some(PREVIEW_TITLE));
    with_images
        .into_iter()
        .filter(|(id, _)| !(other_images && title_of(id) == Some(PREVIEW_TITLE)))
        .flat_map(|(_, images)| images)
        .collect()
}

/// Sampler and scheduler names out of `/object_info/KSampler`.
pub fn parse_sampler_lists(info: &Value) -> Result<(Vec<String>, Vec<String>)> {
    let required = info
        .pointer("/KSampler/input/required")
        .context("object_info has no KSampler inputs")?;
    let names = |key: &str| -> Result<Vec<String>> {
        let list = required
            .get(key)
            .and_then(|v| v.get(0))
            .and_then(Value::as_array)
            .with_context(|| format!("object_info has no {} list", key))?;
        Ok(list.iter().filter_map(Value::as_str).map(str::to_owned).collect())
    };
    Ok((names("sampler_name")?, names("scheduler")?))
}

fn image_mime(filename: &str) -> &'static str {
    let lower = filename.to_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/png"
    }
}

fn progress_message(step: u32, total: u32) -> Value {
    let percent = if total > 0 { step * 100 / total } else { 0 };
    json!({ "type": "progress", "progress": percent, "current_step": step, "total_steps": total })
}

/// The JSON messages a relay forwards to its client for one event.
pub fn relay_messages(event: &GenerationEvent) -> Vec<Value> {
    match event {
        GenerationEvent::Queued(_) => vec![],
        GenerationEvent::Progress { step, total } => vec![progress_message(*step, *total)],
        GenerationEvent::Preview { kind, step, total, image } => {
            let kind = match kind {
                PreviewKind::Step => "preview_image",
                PreviewKind::Preprocessor => "controlnet_preprocessor_preview",
            };
            vec![
                progress_message(*step, *total),
                json!({ "type": kind, "image": image.data_uri() }),
            ]
        }
        GenerationEvent::Completed(images) => match images.first() {
            Some(image) => vec![json!({
                "type": "result",
                "image": data_uri(image_mime(&image.filename), &image.data),
            })],
            None => vec![json!({ "type": "error", "message": "engine returned no images" })],
        },
        GenerationEvent::Error(e) => vec![json!({ "type": "error", "message": format!("{:#}", e) })],
    }
}

pub struct ComfyClient {
    backend: BackendConfig,
    http: reqwest::Client,
    client_id: String,
}

impl ComfyClient {
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            http: reqwest::Client::new(),
            client_id: Uuid::new_v4().to_string(),
        }
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            bail!("engine returned {}: {}", status, body);
        }
        Ok(response)
    }

    /// Queues a workflow and returns its prompt id.
    pub async fn submit(&self, workflow: &Workflow) -> Result<String> {
        #[derive(Deserialize)]
        struct SubmitResponse {
            prompt_id: String,
        }

        let body = json!({ "prompt": workflow.to_json(), "client_id": self.client_id });
        let retry_strategy = ExponentialBackoff::from_millis(50)
            .max_delay(Duration::from_secs(2))
            .take(self.backend.retries);
        let response = Retry::spawn(retry_strategy, || async {
            let response = self
                .http
                .post(self.backend.http_url("/prompt"))
                .json(&body)
                .send()
                .await
                .context("failed to send prompt")?;
            let text = Self::ensure_success(response)
                .await?
                .text()
                .await
                .context("failed to read response")?;
            trace!("Response: {}", text);
            serde_json::from_str::<SubmitResponse>(&text).context("failed to parse response")
        })
        .await
        .context("Ran out of retries")?;
        debug!("Got prompt ID {}", response.prompt_id);
        Ok(response.prompt_id)
    }

    pub async fn history(&self, prompt_id: &str) -> Result<Value> {
        let response = self
            .http
            .get(self.backend.http_url(&format!("/history/{}", prompt_id)))
            .send()
            .await
            .context("failed to fetch history")?;
        Self::ensure_success(response)
            .await?
            .json()
            .await
            .context("failed to parse history")
    }

    pub async fn view(&self, image: &ImageRef) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(self.backend.http_url("/view"))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.folder_type.as_str()),
            ])
            .send()
            .await
            .context("failed to download image")?;
        let bytes = Self::ensure_success(response)
            .await?
            .bytes()
            .await
            .context("failed to read image")?;
        Ok(bytes.to_vec())
    }

    /// Stops whatever the engine is running right now.
    pub async fn interrupt(&self) -> Result<()> {
        let response = self
            .http
            .post(self.backend.http_url("/interrupt"))
            .send()
            .await
            .context("failed to send interrupt")?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    pub async fn samplers(&self) -> Result<(Vec<String>, Vec<String>)> {
        let response = self
            .http
            .get(self.backend.http_url("/object_info/KSampler"))
            .send()
            .await
            .context("failed to fetch object_info")?;
        let info: Value = Self::ensure_success(response)
            .await?
            .json()
            .await
            .context("failed to parse object_info")?;
        parse_sampler_lists(&info)
    }

    /// Runs one workflow to completion.
    /// Dropping the stream closes the websocket and discards any previews not yet read.
    pub fn generate<'a>(&'a self, workflow: &'a Workflow, total_steps: u32) -> impl Stream<Item = GenerationEvent> + 'a {
        try_stream! {
            // Connect first so no message for our prompt can be missed.
            let (mut ws_client, _) = ws::connect_async(self.backend.ws_url(&self.client_id))
                .await
                .context("failed to connect to websocket")?;
            let prompt_id = self.submit(workflow).await?;
            info!("Queued prompt {} ({} nodes)", prompt_id, workflow.len());
            yield GenerationEvent::Queued(prompt_id.clone());

            let mut tracker = ExecutionTracker::new(prompt_id.clone(), workflow.preview_node(), total_steps);
            let timeout = self.backend.timeout_secs;
            let deadline = futures_time::task::sleep(futures_time::time::Duration::from_secs(timeout));
            {
                let mut events = Box::pin(follow_prompt(&mut ws_client, &mut tracker, deadline, timeout));
                while let Some(event) = events.next().await {
                    yield event?;
                }
            }
            if let Err(e) = ws_client.close(None).await {
                debug!("Websocket close failed: {}", e);
            }

            let history = self.history(&prompt_id).await?;
            let entry = history.get(&prompt_id).context("history has no entry for our prompt")?;
            let refs = find_output_images(entry);
            if refs.is_empty() {
                Err::<(), _>(anyhow!("prompt {} produced no images", prompt_id))?;
            }
            let mut images = Vec::new();
            for image in refs {
                let data = self.view(&image).await?;
                images.push(GeneratedImage { filename: image.filename, data });
            }
            info!("Prompt {} finished with {} images", prompt_id, images.len());
            yield GenerationEvent::Completed(images);
        }.map(|r| r.unwrap_or_else(GenerationEvent::Error))
    }
}
