// Flow generator
//
// Basically this provides a type-safe way to generate ComfyUI node graphs.
// Nodes live in an append-only arena: id N is stored at index N-1, ids start at 1 and are never
// reused. A reference can only point at a node that is already in the arena, so construction order
// is a topological order and the graph can't contain a cycle.

use std::{collections::BTreeMap, fmt};

use anyhow::{bail, Result};
use serde::{ser::SerializeSeq, Serialize, Serializer};
use serde_json::Value;

use crate::utils;

/// Title of the single node whose images are the generation result.
pub const OUTPUT_TITLE: &str = "FINAL_IMAGE_SAVER_NODE";
/// Title of the node that previews the ControlNet preprocessor output.
pub const PREVIEW_TITLE: &str = "CN Preprocessor Preview";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    #[cfg(test)]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Reference to output `slot` of this node.
    pub fn output(self, slot: u32) -> NodeRef {
        NodeRef { node: self, slot }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An edge: output `slot` of node `node`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeRef {
    pub node: NodeId,
    pub slot: u32,
}

// The engine wants ["<id>", slot].
impl Serialize for NodeRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&self.node.to_string())?;
        seq.serialize_element(&self.slot)?;
        seq.end()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Input {
    Ref(NodeRef),
    Literal(Value),
}

impl Input {
    pub fn as_node_ref(&self) -> Option<NodeRef> {
        match self {
            Input::Ref(r) => Some(*r),
            Input::Literal(_) => None,
        }
    }

    #[cfg(test)]
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Input::Literal(v) => Some(v),
            Input::Ref(_) => None,
        }
    }
}

/// Conversion used by the `inputs!` macro.
pub trait IntoInput {
    fn into_input(self) -> Input;
}

impl IntoInput for NodeRef {
    fn into_input(self) -> Input {
        Input::Ref(self)
    }
}

impl IntoInput for Value {
    fn into_input(self) -> Input {
        Input::Literal(self)
    }
}

impl IntoInput for &str {
    fn into_input(self) -> Input {
        Input::Literal(Value::from(self))
    }
}

impl IntoInput for String {
    fn into_input(self) -> Input {
        Input::Literal(Value::from(self))
    }
}

impl IntoInput for f64 {
    fn into_input(self) -> Input {
        Input::Literal(Value::from(self))
    }
}

impl IntoInput for i64 {
    fn into_input(self) -> Input {
        Input::Literal(Value::from(self))
    }
}

impl IntoInput for bool {
    fn into_input(self) -> Input {
        Input::Literal(Value::from(self))
    }
}

pub type Inputs = BTreeMap<String, Input>;

/// Builds an `Inputs` map: `inputs! { "model" => model_ref, "ratio" => 0.5 }`.
macro_rules! inputs {
    ($($key:literal => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut map = $crate::flow_generator::Inputs::new();
        $(
            map.insert(
                $key.to_string(),
                $crate::flow_generator::IntoInput::into_input($value),
            );
        )*
        map
    }};
}

#[derive(Clone, Debug, PartialEq, Serialize)]
struct Meta {
    title: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Node {
    pub class_type: String,
    pub inputs: Inputs,
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    meta: Option<Meta>,
}

#[cfg(test)]
impl Node {
    pub fn title(&self) -> Option<&str> {
        self.meta.as_ref().map(|m| m.title.as_str())
    }

    pub fn input(&self, name: &str) -> Option<&Input> {
        self.inputs.get(name)
    }

    /// Every reference among this node's inputs.
    pub fn references(&self) -> impl Iterator<Item = NodeRef> + '_ {
        self.inputs.values().filter_map(Input::as_node_ref)
    }
}

/// The logical signals modules pass to each other through the flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Model,
    Clip,
    Vae,
    Positive,
    Negative,
    Latent,
    Pixels,
    StepsCfg,
    ModelName,
}

/// Request-scoped builder state: the node arena plus the frontier reference of every channel.
#[derive(Debug, Default)]
pub struct Flow {
    nodes: Vec<Node>,
    channels: BTreeMap<Channel, NodeRef>,
    preview_node: Option<NodeId>,
    output_node: Option<NodeId>,
}

impl Flow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node and returns its id plus a reference to its first output.
    pub fn add_node(
        &mut self,
        class_type: &str,
        inputs: Inputs,
        title: Option<&str>,
    ) -> Result<(NodeId, NodeRef)> {
        let next = self.nodes.len() as u32 + 1;
        for (name, input) in inputs.iter() {
            if let Some(r) = input.as_node_ref() {
                if r.node.0 == 0 || r.node.0 >= next {
                    bail!(
                        "{} input {:?} references node {} which does not exist yet",
                        class_type,
                        name,
                        r.node
                    );
                }
            }
        }
        self.nodes.push(Node {
            class_type: class_type.to_owned(),
            inputs,
            meta: title.map(|t| Meta { title: t.to_owned() }),
        });
        let id = NodeId(next);
        Ok((id, id.output(0)))
    }

    /// Explicit reference to output `slot` of an existing node.
    pub fn output(&self, id: NodeId, slot: u32) -> Result<NodeRef> {
        if id.0 == 0 || id.0 as usize > self.nodes.len() {
            bail!("node {} does not exist", id);
        }
        Ok(id.output(slot))
    }

    /// The current frontier of `channel`. Reading an unwritten channel means a module ran out of order.
    pub fn read(&self, channel: Channel) -> Result<NodeRef> {
        match self.channels.get(&channel) {
            Some(r) => Ok(*r),
            None => bail!("{:?} channel read before any module wrote it", channel),
        }
    }

    pub fn peek(&self, channel: Channel) -> Option<NodeRef> {
        self.channels.get(&channel).copied()
    }

    pub fn write(&mut self, channel: Channel, r: NodeRef) {
        self.channels.insert(channel, r);
    }

    pub fn set_preview_node(&mut self, id: NodeId) {
        self.preview_node = Some(id);
    }

    pub fn set_output_node(&mut self, id: NodeId) {
        self.output_node = Some(id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn finish(self) -> Workflow {
        Workflow {
            nodes: self.nodes,
            preview_node: self.preview_node,
            output_node: self.output_node,
        }
    }
}

/// A finished node table, ready to submit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Workflow {
    nodes: Vec<Node>,
    preview_node: Option<NodeId>,
    output_node: Option<NodeId>,
}

impl Workflow {
    #[cfg(test)]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        (id.0 as usize).checked_sub(1).and_then(|i| self.nodes.get(i))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32 + 1), n))
    }

    #[cfg(test)]
    pub fn nodes_of_type<'a>(&'a self, class_type: &'a str) -> impl Iterator<Item = (NodeId, &'a Node)> {
        self.nodes().filter(move |(_, n)| n.class_type == class_type)
    }

    pub fn preview_node(&self) -> Option<NodeId> {
        self.preview_node
    }

    pub fn output_node(&self) -> Option<NodeId> {
        self.output_node
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The engine's wire format: `{"<id>": {"class_type", "inputs", "_meta"?}}`.
    pub fn to_json(&self) -> Value {
        let map = self
            .nodes()
            .map(|(id, node)| {
                let node = serde_json::to_value(node).expect("nodes always serialize");
                (id.to_string(), node)
            })
            .collect::<serde_json::Map<_, _>>();
        Value::Object(map)
    }

    /// blake3 hash of the serialized table; equal for equal workflows.
    pub fn fingerprint(&self) -> String {
        utils::hash(&self.to_json().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_sequential() {
        let mut flow = Flow::new();
        let (a, a_out) = flow.add_node("CheckpointLoaderSimple", inputs! { "ckpt_name" => "anime.safetensors" }, None).unwrap();
        let (b, _) = flow.add_node("CLIPTextEncode", inputs! { "clip" => a.output(1), "text" => "I love anime" }, None).unwrap();
        let (c, _) = flow.add_node("Foo", inputs! { "model" => a_out }, Some("foo")).unwrap();
        assert_eq!((a.get(), b.get(), c.get()), (1, 2, 3));
        assert_eq!(a_out, NodeRef { node: a, slot: 0 });
        assert_eq!(flow.len(), 3);
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let mut flow = Flow::new();
        let (a, _) = flow.add_node("A", inputs! {}, None).unwrap();
        let ghost = NodeId(a.get() + 1).output(0);
        assert!(flow.add_node("B", inputs! { "x" => ghost }, None).is_err());
        // The failed add didn't consume an id.
        let (b, _) = flow.add_node("B", inputs! { "x" => a.output(0) }, None).unwrap();
        assert_eq!(b.get(), 2);
        assert!(flow.output(NodeId(7), 0).is_err());
        assert_eq!(flow.output(a, 3).unwrap().slot, 3);
    }

    #[test]
    fn test_channels() {
        let mut flow = Flow::new();
        assert!(flow.read(Channel::Model).is_err());
        assert_eq!(flow.peek(Channel::Latent), None);
        let (a, a_out) = flow.add_node("A", inputs! {}, None).unwrap();
        flow.write(Channel::Model, a_out);
        flow.write(Channel::Clip, a.output(1));
        assert_eq!(flow.read(Channel::Model).unwrap(), a_out);
        let (_, b_out) = flow.add_node("B", inputs! { "model" => a_out }, None).unwrap();
        flow.write(Channel::Model, b_out);
        assert_eq!(flow.read(Channel::Model).unwrap(), b_out);
        assert_eq!(flow.read(Channel::Clip).unwrap().slot, 1);
    }

    #[test]
    fn test_wire_format() {
        let mut flow = Flow::new();
        let (a, _) = flow.add_node("CheckpointLoaderSimple", inputs! { "ckpt_name" => "x.safetensors" }, Some("Load Checkpoint")).unwrap();
        let (b, _) = flow.add_node("KSampler", inputs! { "clip" => a.output(1), "steps" => 20i64, "cfg" => 7.5, "zsnr" => false }, None).unwrap();
        flow.set_output_node(b);
        let workflow = flow.finish();
        assert_eq!(workflow.output_node(), Some(b));
        assert_eq!(workflow.preview_node(), None);
        assert_eq!(
            workflow.to_json(),
            json!({
                "1": {
                    "class_type": "CheckpointLoaderSimple",
                    "inputs": { "ckpt_name": "x.safetensors" },
                    "_meta": { "title": "Load Checkpoint" },
                },
                "2": {
                    "class_type": "KSampler",
                    "inputs": { "clip": ["1", 1], "steps": 20, "cfg": 7.5, "zsnr": false },
                },
            })
        );
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let build = |text: &str| {
            let mut flow = Flow::new();
            flow.add_node("CLIPTextEncode", inputs! { "text" => text }, None).unwrap();
            flow.finish()
        };
        assert_eq!(build("a").fingerprint(), build("a").fingerprint());
        assert_ne!(build("a").fingerprint(), build("b").fingerprint());
        assert!(Workflow::default().is_empty());
    }
}
