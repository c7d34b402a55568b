//! Carving candidate subgraphs out of a larger graph.
//!
//! The segmentation policy hands over a cluster of node ids plus the edges
//! it cut. [`convert_segment_to_graph`] resolves the cut tensors against a
//! shape oracle and rebuilds the cluster as a standalone [`GraphDef`] whose
//! boundary follows the engine naming convention, ready for
//! [`convert_graph_to_network`].
//!
//! [`convert_graph_to_network`]: crate::converter::convert_graph_to_network

use std::collections::{HashMap, HashSet};

use kiln_graph::ir::{AttributeValue, DataType, GraphDef, NodeDef, PartialShape, TensorRef};
use kiln_graph::oracle::GraphProperties;

use crate::converter::{INPUT_PH_PREFIX, OUTPUT_PH_PREFIX};
use crate::error::ConversionError;
use crate::Result;

/// One edge cut by the segmentation policy.
///
/// The outside endpoint stays in the surrounding graph, the inside endpoint
/// belongs to the segment. Port numbers are assigned by the policy and
/// shared between connections that tap the same tensor; extraction creates
/// one boundary node per distinct port number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConnection {
    /// Node on the graph side of the cut.
    pub outside_node_name: String,
    /// Graph id of the outside node.
    pub outside_id: usize,
    /// Port on the outside node. Meaningless for control connections.
    pub outside_port: usize,
    /// Shape of the tensor entering the segment, resolved during extraction.
    pub outside_shape: Option<PartialShape>,
    /// Node on the segment side of the cut.
    pub inside_node_name: String,
    /// Graph id of the inside node.
    pub inside_id: usize,
    /// Port on the inside node. Meaningless for control connections.
    pub inside_port: usize,
    /// Shape of the tensor leaving the segment, resolved during extraction.
    pub inside_shape: Option<PartialShape>,
    /// Element type of the cut tensor, resolved during extraction.
    pub connection_type: Option<DataType>,
    /// True when the tensor flows into the segment.
    pub is_input_edge: bool,
    /// True for a control dependency crossing the boundary.
    pub is_control: bool,
    /// Engine port this connection binds to.
    pub port_number: usize,
}

impl EngineConnection {
    /// Data connection between `outside_node_name:outside_port` and input
    /// slot `inside_port` of `inside_node_name` (or the reverse for output
    /// edges).
    pub fn new(
        outside_node_name: impl Into<String>,
        outside_id: usize,
        outside_port: usize,
        inside_node_name: impl Into<String>,
        inside_id: usize,
        inside_port: usize,
        is_input_edge: bool,
        port_number: usize,
    ) -> Self {
        Self {
            outside_node_name: outside_node_name.into(),
            outside_id,
            outside_port,
            outside_shape: None,
            inside_node_name: inside_node_name.into(),
            inside_id,
            inside_port,
            inside_shape: None,
            connection_type: None,
            is_input_edge,
            is_control: false,
            port_number,
        }
    }

    /// Control dependency crossing the boundary. Carries no ports.
    pub fn control(
        outside_node_name: impl Into<String>,
        outside_id: usize,
        inside_node_name: impl Into<String>,
        inside_id: usize,
        is_input_edge: bool,
    ) -> Self {
        Self {
            outside_node_name: outside_node_name.into(),
            outside_id,
            outside_port: 0,
            outside_shape: None,
            inside_node_name: inside_node_name.into(),
            inside_id,
            inside_port: 0,
            inside_shape: None,
            connection_type: None,
            is_input_edge,
            is_control: true,
            port_number: 0,
        }
    }

    /// True for a control dependency.
    pub fn is_control_edge(&self) -> bool {
        self.is_control
    }
}

/// Extracts the nodes in `node_ids` as a standalone graph.
///
/// `node_ids` index into `graph.nodes` and must be topologically ordered.
/// Every non-control connection gets its dtype and cut-side shape resolved
/// through `properties` and recorded on the connection. Each distinct input
/// port becomes a `Placeholder` named [`INPUT_PH_PREFIX`] plus the port
/// number, each distinct output port an `Identity` named
/// [`OUTPUT_PH_PREFIX`] plus the port number forwarding the inside node.
/// Interior nodes are copied in order between the two, so the result stays
/// topologically sorted; their cut input slots are rewritten to the
/// placeholder names and control inputs from outside the segment are
/// dropped. A data input from outside the segment that no connection covers
/// is an error.
///
/// Returns the segment graph and the name scope shared by all interior
/// nodes.
pub fn convert_segment_to_graph(
    graph: &GraphDef,
    properties: &dyn GraphProperties,
    node_ids: &[usize],
    connections: &mut [EngineConnection],
) -> Result<(GraphDef, String)> {
    let mut segment = GraphDef::default();
    let mut output_nodes: Vec<NodeDef> = Vec::new();
    let mut marker_nodes: HashSet<String> = HashSet::new();

    // Resolve connection shapes and dtypes, and synthesize one boundary
    // node per distinct port.
    for connection in connections.iter_mut() {
        if connection.is_control_edge() {
            continue;
        }
        let outside = graph.nodes.get(connection.outside_id).ok_or_else(|| {
            ConversionError::NotFound(format!(
                "cannot find node with id {} in the graph",
                connection.outside_id
            ))
        })?;
        let props = if connection.is_input_edge {
            properties.output_properties(&outside.name, connection.outside_port)
        } else {
            properties.input_properties(&outside.name, connection.outside_port)
        };
        let Some(props) = props else {
            return Err(ConversionError::NotFound(format!(
                "no inferred properties for {}:{}",
                outside.name, connection.outside_port
            )));
        };
        connection.connection_type = Some(props.dtype);
        if connection.is_input_edge {
            connection.outside_shape = Some(props.shape.clone());

            let node_name = format!("{INPUT_PH_PREFIX}{}", connection.port_number);
            if !marker_nodes.insert(node_name.clone()) {
                log::debug!(
                    "reusing input {node_name} for the edge {}:{} -> {}:{}",
                    connection.outside_node_name,
                    connection.outside_port,
                    connection.inside_node_name,
                    connection.inside_port
                );
                continue;
            }
            log::debug!(
                "constructing input {node_name} for the edge {}:{} -> {}:{}",
                connection.outside_node_name,
                connection.outside_port,
                connection.inside_node_name,
                connection.inside_port
            );
            segment.add_node(
                NodeDef::new(node_name, "Placeholder")
                    .with_attr("shape", AttributeValue::Shape(props.shape))
                    .with_attr("dtype", AttributeValue::Type(props.dtype)),
            );
        } else {
            connection.inside_shape = Some(props.shape.clone());

            let node_name = format!("{OUTPUT_PH_PREFIX}{}", connection.port_number);
            if !marker_nodes.insert(node_name.clone()) {
                log::debug!(
                    "reusing output {node_name} for the edge {}:{} -> {}:{}",
                    connection.inside_node_name,
                    connection.inside_port,
                    connection.outside_node_name,
                    connection.outside_port
                );
                continue;
            }
            log::debug!(
                "constructing output {node_name} for the edge {}:{} -> {}:{}",
                connection.inside_node_name,
                connection.inside_port,
                connection.outside_node_name,
                connection.outside_port
            );
            // The forwarded tensor is always output 0 of the inside node.
            output_nodes.push(
                NodeDef::new(node_name, "Identity")
                    .with_input(connection.inside_node_name.clone())
                    .with_attr("T", AttributeValue::Type(props.dtype)),
            );
        }
    }

    // Copy interior nodes, reducing the shared name scope as they pass.
    let mut old_to_new_id_map: HashMap<usize, usize> = HashMap::new();
    let mut local_scope: Option<String> = None;
    for &node_id in node_ids {
        let node = graph.nodes.get(node_id).ok_or_else(|| {
            ConversionError::NotFound(format!(
                "cannot find node with id {node_id} in the graph"
            ))
        })?;
        local_scope = Some(match local_scope {
            None => node.name.clone(),
            Some(scope) => common_name_scope(&scope, &node.name),
        });
        old_to_new_id_map.insert(node_id, segment.nodes.len());
        log::trace!("copying {} to the segment", node.name);
        segment.add_node(node.clone());
    }
    segment.nodes.append(&mut output_nodes);

    // Point the consumer slot of every input connection at its placeholder.
    for connection in connections.iter() {
        if connection.is_control_edge() || !connection.is_input_edge {
            continue;
        }
        let Some(&new_id) = old_to_new_id_map.get(&connection.inside_id) else {
            return Err(ConversionError::NotFound(format!(
                "cannot find node with id {} in the segment",
                connection.inside_id
            )));
        };
        let node = &mut segment.nodes[new_id];
        let Some(slot) = node.inputs.get_mut(connection.inside_port) else {
            return Err(ConversionError::InvalidArgument(format!(
                "node {} has no input at slot {}",
                node.name, connection.inside_port
            )));
        };
        let placeholder = format!("{INPUT_PH_PREFIX}{}", connection.port_number);
        log::debug!(
            "updating {}:{} from {slot} to {placeholder}",
            node.name,
            connection.inside_port
        );
        *slot = placeholder;
    }

    // Remaining references to the outside must all be control inputs.
    let segment_names: HashSet<String> = node_ids
        .iter()
        .filter_map(|id| graph.nodes.get(*id))
        .map(|node| node.name.clone())
        .collect();
    for node in &mut segment.nodes {
        let mut kept = Vec::with_capacity(node.inputs.len());
        for input in node.inputs.drain(..) {
            let parsed = TensorRef::parse(&input)?;
            let source = parsed.node();
            if !segment_names.contains(source) && !source.starts_with(INPUT_PH_PREFIX) {
                if parsed.is_control() {
                    log::debug!("removing control input {source} from the segment");
                    continue;
                }
                return Err(ConversionError::InvalidArgument(format!(
                    "found non control input outside the segment that is not an engine \
                     connection to {}: {source}",
                    node.name
                )));
            }
            kept.push(input);
        }
        node.inputs = kept;
    }

    let common_scope = local_scope.unwrap_or_default();
    log::info!("segment @scope '{common_scope}' converted to a graph");
    Ok((segment, common_scope))
}

/// Longest `/`-terminated prefix shared by both names.
fn common_name_scope(op_name_a: &str, op_name_b: &str) -> String {
    let mut last_scope_separator = 0;
    for (i, (a, b)) in op_name_a.bytes().zip(op_name_b.bytes()).enumerate() {
        if a != b {
            break;
        }
        if a == b'/' {
            last_scope_separator = i + 1;
        }
    }
    op_name_a[..last_scope_separator].to_string()
}
