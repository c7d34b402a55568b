//! Graph intermediate representation.
//!
//! The IR is deliberately small: a graph is a vector of nodes, a node is an
//! op name plus string input references and a typed attribute map, and
//! constants embed their payload as a [`TensorLiteral`]. Shapes that are not
//! fully known are carried as [`PartialShape`] with `-1` marking an unknown
//! axis and an absent dimension vector marking an unknown rank.

use std::collections::HashMap;
use std::fmt;

use half::f16;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::GraphError;

/// Element type of a graph tensor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum DataType {
    /// 32-bit float.
    Float32,
    /// 16-bit float.
    Float16,
    /// 64-bit float.
    Float64,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit signed integer.
    Int32,
    /// 16-bit signed integer.
    Int16,
    /// 8-bit signed integer.
    Int8,
    /// 8-bit unsigned integer.
    Uint8,
    /// Boolean.
    Bool,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size_of(&self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Float16 => 2,
            DataType::Float64 => 8,
            DataType::Int64 => 8,
            DataType::Int32 => 4,
            DataType::Int16 => 2,
            DataType::Int8 => 1,
            DataType::Uint8 => 1,
            DataType::Bool => 1,
        }
    }
}

/// Statically inferred tensor shape, possibly incomplete.
///
/// The rank itself can be unknown. Within a known rank, `-1` marks an axis
/// whose size is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialShape {
    dims: Option<Vec<i64>>,
}

impl PartialShape {
    /// Shape with a known rank. Unknown axes are passed as `-1`.
    pub fn new(dims: Vec<i64>) -> Self {
        Self { dims: Some(dims) }
    }

    /// Shape of unknown rank.
    pub fn unknown() -> Self {
        Self { dims: None }
    }

    /// Rank, if known.
    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(Vec::len)
    }

    /// Axis sizes, if the rank is known.
    pub fn dims(&self) -> Option<&[i64]> {
        self.dims.as_deref()
    }

    /// True when the rank and every axis size are known.
    pub fn is_fully_defined(&self) -> bool {
        match &self.dims {
            Some(dims) => dims.iter().all(|d| *d >= 0),
            None => false,
        }
    }
}

impl fmt::Display for PartialShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dims {
            None => write!(f, "<unknown rank>"),
            Some(dims) => {
                write!(f, "[")?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    if *d < 0 {
                        write!(f, "?")?;
                    } else {
                        write!(f, "{d}")?;
                    }
                }
                write!(f, "]")
            }
        }
    }
}

/// Payload of a dense tensor literal.
///
/// A payload of length one combined with a larger declared shape is a
/// repeated scalar. `Raw` carries native-endian bytes of the declared dtype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralData {
    /// 32-bit float values.
    Floats(Vec<f32>),
    /// 32-bit integer values. Narrower integer dtypes also use this form.
    Ints(Vec<i32>),
    /// 16-bit float values.
    Halves(Vec<f16>),
    /// Untyped bytes, one element every `dtype.size_of()` bytes.
    Raw(Vec<u8>),
}

/// Dense tensor constant embedded in a node attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorLiteral {
    /// Element type of the literal.
    pub dtype: DataType,
    /// Declared shape. Empty for a scalar.
    pub shape: Vec<i64>,
    /// Element payload.
    pub data: LiteralData,
}

impl TensorLiteral {
    /// Number of elements the declared shape holds. A scalar has one.
    pub fn num_elements(&self) -> i64 {
        self.shape.iter().product()
    }
}

/// Typed value of a node attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// UTF-8 string.
    String(String),
    /// Single integer.
    Int(i64),
    /// Integer list.
    Ints(Vec<i64>),
    /// Single float.
    Float(f32),
    /// Float list.
    Floats(Vec<f32>),
    /// Boolean flag.
    Bool(bool),
    /// Element type.
    Type(DataType),
    /// Partial shape.
    Shape(PartialShape),
    /// Dense tensor literal.
    Tensor(TensorLiteral),
}

/// Attribute map of a node, keyed by attribute name.
pub type Attributes = HashMap<String, AttributeValue>;

/// One node of a computation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    /// Unique node name.
    pub name: String,
    /// Operation name, e.g. `Conv2D`.
    pub op: String,
    /// Input references: `"name"`, `"name:2"`, or `"^name"` for a control
    /// dependency.
    pub inputs: Vec<String>,
    /// Typed attributes.
    pub attrs: Attributes,
}

impl NodeDef {
    /// Node without inputs or attributes.
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            inputs: Vec::new(),
            attrs: Attributes::new(),
        }
    }

    /// Appends an input reference.
    pub fn add_input(&mut self, input: impl Into<String>) {
        self.inputs.push(input.into());
    }

    /// Chainable [`NodeDef::add_input`].
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.add_input(input);
        self
    }

    /// Sets an attribute, replacing any previous value.
    pub fn set_attr(&mut self, key: impl Into<String>, value: AttributeValue) {
        self.attrs.insert(key.into(), value);
    }

    /// Chainable [`NodeDef::set_attr`].
    pub fn with_attr(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Raw attribute lookup.
    pub fn attr(&self, key: &str) -> Option<&AttributeValue> {
        self.attrs.get(key)
    }

    fn require(&self, key: &str) -> Result<&AttributeValue, GraphError> {
        self.attrs
            .get(key)
            .ok_or_else(|| GraphError::MissingAttribute(key.to_string()))
    }

    /// String attribute.
    pub fn attr_string(&self, key: &str) -> Result<&str, GraphError> {
        match self.require(key)? {
            AttributeValue::String(value) => Ok(value),
            _ => Err(GraphError::AttributeType {
                key: key.to_string(),
                expected: "string",
            }),
        }
    }

    /// Single-integer attribute.
    pub fn attr_int(&self, key: &str) -> Result<i64, GraphError> {
        match self.require(key)? {
            AttributeValue::Int(value) => Ok(*value),
            _ => Err(GraphError::AttributeType {
                key: key.to_string(),
                expected: "int",
            }),
        }
    }

    /// Integer-list attribute.
    pub fn attr_ints(&self, key: &str) -> Result<&[i64], GraphError> {
        match self.require(key)? {
            AttributeValue::Ints(value) => Ok(value),
            _ => Err(GraphError::AttributeType {
                key: key.to_string(),
                expected: "int list",
            }),
        }
    }

    /// Single-float attribute.
    pub fn attr_float(&self, key: &str) -> Result<f32, GraphError> {
        match self.require(key)? {
            AttributeValue::Float(value) => Ok(*value),
            _ => Err(GraphError::AttributeType {
                key: key.to_string(),
                expected: "float",
            }),
        }
    }

    /// Float-list attribute.
    pub fn attr_floats(&self, key: &str) -> Result<&[f32], GraphError> {
        match self.require(key)? {
            AttributeValue::Floats(value) => Ok(value),
            _ => Err(GraphError::AttributeType {
                key: key.to_string(),
                expected: "float list",
            }),
        }
    }

    /// Boolean attribute.
    pub fn attr_bool(&self, key: &str) -> Result<bool, GraphError> {
        match self.require(key)? {
            AttributeValue::Bool(value) => Ok(*value),
            _ => Err(GraphError::AttributeType {
                key: key.to_string(),
                expected: "bool",
            }),
        }
    }

    /// Element-type attribute.
    pub fn attr_dtype(&self, key: &str) -> Result<DataType, GraphError> {
        match self.require(key)? {
            AttributeValue::Type(value) => Ok(*value),
            _ => Err(GraphError::AttributeType {
                key: key.to_string(),
                expected: "type",
            }),
        }
    }

    /// Partial-shape attribute.
    pub fn attr_shape(&self, key: &str) -> Result<&PartialShape, GraphError> {
        match self.require(key)? {
            AttributeValue::Shape(value) => Ok(value),
            _ => Err(GraphError::AttributeType {
                key: key.to_string(),
                expected: "shape",
            }),
        }
    }

    /// Tensor-literal attribute.
    pub fn attr_tensor(&self, key: &str) -> Result<&TensorLiteral, GraphError> {
        match self.require(key)? {
            AttributeValue::Tensor(value) => Ok(value),
            _ => Err(GraphError::AttributeType {
                key: key.to_string(),
                expected: "tensor",
            }),
        }
    }
}

/// Parsed form of a node input reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TensorRef {
    /// `"name"` or `"name:k"`: output `port` of node `node`.
    Data {
        /// Producing node name.
        node: String,
        /// Output port on the producer. A bare `"name"` is port 0.
        port: usize,
    },
    /// `"^name"`: a control dependency on `node`.
    Control {
        /// Node the control dependency waits on.
        node: String,
    },
}

impl TensorRef {
    /// Parses a raw input reference string.
    pub fn parse(raw: &str) -> Result<Self, GraphError> {
        if raw.is_empty() {
            return Err(GraphError::MalformedRef(raw.to_string()));
        }
        if let Some(node) = raw.strip_prefix('^') {
            if node.is_empty() {
                return Err(GraphError::MalformedRef(raw.to_string()));
            }
            return Ok(TensorRef::Control {
                node: node.to_string(),
            });
        }
        match raw.rsplit_once(':') {
            Some((node, port)) => {
                if node.is_empty() {
                    return Err(GraphError::MalformedRef(raw.to_string()));
                }
                let port = port
                    .parse::<usize>()
                    .map_err(|_| GraphError::MalformedRef(raw.to_string()))?;
                Ok(TensorRef::Data {
                    node: node.to_string(),
                    port,
                })
            }
            None => Ok(TensorRef::Data {
                node: raw.to_string(),
                port: 0,
            }),
        }
    }

    /// Name of the referenced node.
    pub fn node(&self) -> &str {
        match self {
            TensorRef::Data { node, .. } => node,
            TensorRef::Control { node } => node,
        }
    }

    /// True for a `"^name"` reference.
    pub fn is_control(&self) -> bool {
        matches!(self, TensorRef::Control { .. })
    }
}

/// Resolved edge between two nodes of the same graph.
#[derive(Debug, Clone, PartialEq, Eq, derive_new::new)]
pub struct Edge {
    /// Producing node name.
    pub src: String,
    /// Output port on the producer. Zero for control edges.
    pub src_port: usize,
    /// Consuming node name.
    pub dst: String,
    /// Input slot on the consumer.
    pub dst_port: usize,
    /// True for a control dependency.
    pub control: bool,
}

/// A computation graph: nodes in topological order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
    /// Nodes, producers before consumers.
    pub nodes: Vec<NodeDef>,
}

impl GraphDef {
    /// Graph from a node list.
    pub fn new(nodes: Vec<NodeDef>) -> Self {
        Self { nodes }
    }

    /// Appends a node and returns its id (position).
    pub fn add_node(&mut self, node: NodeDef) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Looks a node up by name.
    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// True when every producer appears before all of its consumers.
    ///
    /// References to nodes outside the graph are treated as external inputs
    /// and do not affect the result.
    pub fn is_top_sorted(&self) -> bool {
        let positions: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.name.as_str(), i))
            .collect();

        for (position, node) in self.nodes.iter().enumerate() {
            for raw in &node.inputs {
                let Ok(input) = TensorRef::parse(raw) else {
                    continue;
                };
                if let Some(&producer) = positions.get(input.node()) {
                    if producer >= position {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Enumerates all resolved edges.
    ///
    /// Input references whose producer is not part of this graph are
    /// skipped; they are the graph's external inputs.
    pub fn edges(&self) -> Result<Vec<Edge>, GraphError> {
        let names: HashMap<&str, ()> = self
            .nodes
            .iter()
            .map(|node| (node.name.as_str(), ()))
            .collect();

        let mut edges = Vec::new();
        for node in &self.nodes {
            for (slot, raw) in node.inputs.iter().enumerate() {
                let input = TensorRef::parse(raw)?;
                if !names.contains_key(input.node()) {
                    continue;
                }
                let edge = match input {
                    TensorRef::Data { node: src, port } => {
                        Edge::new(src, port, node.name.clone(), slot, false)
                    }
                    TensorRef::Control { node: src } => {
                        Edge::new(src, 0, node.name.clone(), slot, true)
                    }
                };
                edges.push(edge);
            }
        }
        Ok(edges)
    }
}
