//! Graph to network conversion.
//!
//! [`Converter`] walks a topologically sorted [`GraphDef`] and dispatches
//! each node to the converter registered for its op, accumulating layers in
//! a [`Network`] and converted values in a name keyed map. The batch axis is
//! implicit: per tensor dims exclude it, and the converter tracks a single
//! batch size that every input must agree on.
//!
//! [`convert_graph_to_network`] is the driver for segment graphs produced by
//! [`crate::segment`]: it turns boundary placeholder nodes into network
//! inputs and outputs and converts everything in between.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use kiln_graph::ir::{GraphDef, NodeDef, PartialShape};

use crate::error::ConversionError;
use crate::network::{Dims, ElemType, Network, TensorId};
use crate::ops;
use crate::validator;
use crate::value::{TensorOrWeights, WeightStore};
use crate::Result;

/// Name prefix of the synthetic input nodes of a segment graph.
pub const INPUT_PH_PREFIX: &str = "EngineInputPH_";
/// Name prefix of the synthetic output nodes of a segment graph.
pub const OUTPUT_PH_PREFIX: &str = "EngineOutputPH_";

/// Converts one graph node, or validates it when `validation_only` is set.
pub type OpConverter = fn(&mut OpConverterParams) -> Result<()>;

/// Per node context handed to an [`OpConverter`].
///
/// In validation mode `network` is absent and converters must return after
/// their precondition checks, before emitting any layer.
pub struct OpConverterParams<'a> {
    /// The node being converted.
    pub node: &'a NodeDef,
    /// Converted values of the node's data inputs, in input order.
    pub inputs: Vec<TensorOrWeights>,
    /// Output values to be registered under the node's name.
    pub outputs: Vec<TensorOrWeights>,
    /// Check preconditions only, without emitting layers.
    pub validation_only: bool,
    /// Arena backing every [`crate::value::ShapedWeights`] in flight.
    pub weight_store: &'a mut WeightStore,
    /// Cast constants to fp16 where the op supports it.
    pub fp16: bool,
    network: Option<&'a mut Network>,
}

impl<'a> OpConverterParams<'a> {
    pub(crate) fn new(
        node: &'a NodeDef,
        inputs: Vec<TensorOrWeights>,
        validation_only: bool,
        network: Option<&'a mut Network>,
        weight_store: &'a mut WeightStore,
        fp16: bool,
    ) -> Self {
        Self {
            node,
            inputs,
            outputs: vec![],
            validation_only,
            weight_store,
            fp16,
            network,
        }
    }

    /// The network under construction.
    ///
    /// Fails in validation mode; converters must not reach for the network
    /// before their `validation_only` early return.
    pub fn network(&mut self) -> Result<&mut Network> {
        self.network.as_deref_mut().ok_or_else(|| {
            ConversionError::Internal("network not available in validation mode".to_string())
        })
    }
}

/// Error for a layer builder that refused its configuration.
pub(crate) fn layer_failure(node: &NodeDef) -> ConversionError {
    ConversionError::Internal(format!("failed to add layer, at: {}", node.name))
}

/// Inserts a shuffle layer permuting `input` by `order_with_batch_dim`.
///
/// The permutation is given with the batch axis included as slot 0, which
/// must stay in place.
pub fn transpose_tensor(
    network: &mut Network,
    input: TensorId,
    order_with_batch_dim: &[i64],
    node: &NodeDef,
) -> Result<TensorId> {
    let rank = network.tensor_dims(input).rank();
    if order_with_batch_dim.len() != rank + 1 {
        return Err(ConversionError::InvalidArgument(
            "rank of permutation for transpose does not match with that of the input".to_string(),
        ));
    }
    if order_with_batch_dim[0] != 0 {
        return Err(ConversionError::Unimplemented(
            "transpose at batch dimension is not supported".to_string(),
        ));
    }

    let permutation: Vec<i64> = order_with_batch_dim[1..].iter().map(|o| o - 1).collect();
    // An all-zero reshape keeps the post-transpose extents.
    let reshape = Dims::new(vec![0; rank]);
    network
        .add_shuffle(input, Some(permutation), Some(reshape), None)
        .ok_or_else(|| layer_failure(node))
}

/// Yields a tensor of shape `dims` from `input`, reshaping or materializing
/// constants as needed.
pub fn prepare_tensor_for_shape(
    network: &mut Network,
    input: &TensorOrWeights,
    dims: &Dims,
    node: &NodeDef,
) -> Result<TensorId> {
    // Unless the target infers an axis, element counts must agree.
    let can_check_shapes = !dims.d.contains(&-1);
    if can_check_shapes && input.dims().num_elements() != dims.num_elements() {
        return Err(ConversionError::InvalidArgument(
            "reshape shapes are not compatible".to_string(),
        ));
    }

    if input.is_tensor() {
        let id = input
            .tensor_id()
            .ok_or_else(|| ConversionError::Internal("tensor is not materialized".to_string()))?;
        if network.tensor_dims(id) == dims {
            return Ok(id);
        }
        network
            .add_shuffle(id, None, Some(dims.clone()), None)
            .ok_or_else(|| layer_failure(node))
    } else {
        let weights = input.as_weights().cloned().ok_or_else(|| {
            ConversionError::Internal("weights value without a buffer".to_string())
        })?;
        network
            .add_constant(dims.clone(), weights)
            .ok_or_else(|| layer_failure(node))
    }
}

/// Graph walker building a [`Network`] node by node.
pub struct Converter {
    network: Network,
    /// Converted values by graph name, `"node"` or `"node:port"`.
    tensors: HashMap<String, TensorOrWeights>,
    batch_size: i64,
    fp16: bool,
    weight_store: WeightStore,
    op_registry: HashMap<&'static str, OpConverter>,
    custom_registry: HashMap<String, OpConverter>,
}

impl Converter {
    /// Converter with the built-in op registry and an empty network.
    pub fn new(fp16: bool) -> Self {
        Self {
            network: Network::new(),
            tensors: HashMap::new(),
            batch_size: -1,
            fp16,
            weight_store: WeightStore::new(),
            op_registry: ops::register_op_converters(),
            custom_registry: HashMap::new(),
        }
    }

    /// Registers `converter` for `op`, shadowing any built-in converter.
    ///
    /// The custom registry is consulted before the built-in one, so this is
    /// the hook for both plugin ops and overrides.
    pub fn register_custom(&mut self, op: impl Into<String>, converter: OpConverter) {
        self.custom_registry.insert(op.into(), converter);
    }

    /// The network built so far.
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Consumes the converter, yielding the finished network.
    pub fn into_network(self) -> Network {
        self.network
    }

    /// The batch size collected from input tensors, `-1` while unknown.
    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    /// Converts a single node and registers its outputs.
    pub fn convert_node(&mut self, node: &NodeDef) -> Result<()> {
        let inputs = self.get_inputs(node)?;
        let converter = match self.custom_registry.get(node.op.as_str()) {
            Some(converter) => *converter,
            None => *self.op_registry.get(node.op.as_str()).ok_or_else(|| {
                ConversionError::Unimplemented(format!(
                    "no converter registered for op: {}",
                    node.op
                ))
            })?,
        };

        let mut params = OpConverterParams::new(
            node,
            inputs,
            false,
            Some(&mut self.network),
            &mut self.weight_store,
            self.fp16,
        );
        converter(&mut params)?;
        let outputs = params.outputs;

        for (i, output) in outputs.into_iter().enumerate() {
            let output_name = if i == 0 {
                node.name.clone()
            } else {
                format!("{}:{i}", node.name)
            };
            // Only name still anonymous tensors. An identity output may be an
            // engine input whose binding name must survive.
            if let Some(id) = output.tensor_id() {
                if self.network.tensor_name(id).is_none_or(str::is_empty) {
                    self.network.set_tensor_name(id, &output_name);
                }
            }
            log::trace!("adding output {output_name} for node {}", node.name);
            self.add_tensor_or_weights(output_name, output)
                .map_err(|e| e.context(format!("failed to add output for node {}", node.name)))?;
        }
        Ok(())
    }

    /// Declares a network input and registers it in the namespace.
    ///
    /// `dims` excludes the batch axis; `batch_size` is checked against the
    /// batch size collected so far.
    pub fn add_input_tensor(
        &mut self,
        name: &str,
        dtype: ElemType,
        dims: Dims,
        batch_size: i64,
    ) -> Result<()> {
        self.maybe_update_batch_size(batch_size)
            .map_err(|e| e.context(format!("batch size doesn't match for tensor {name}")))?;
        let rank = dims.rank();
        let id = self.network.add_input(name, dtype, dims).ok_or_else(|| {
            ConversionError::InvalidArgument(format!(
                "failed to create input tensor {name} with rank {rank}"
            ))
        })?;
        let input = TensorOrWeights::from_network(&self.network, id);
        self.add_tensor_or_weights(name.to_string(), input)
            .map_err(|e| e.context(format!("failed to add input tensor {name}")))
    }

    /// Renames converted tensors to their output binding names and marks
    /// them as network outputs.
    ///
    /// `output_tensors` pairs the graph name of the value with the binding
    /// name it should carry.
    pub fn rename_and_mark_outputs(&mut self, output_tensors: &[(String, String)]) -> Result<()> {
        for (source, binding) in output_tensors {
            let value = self.get_tensor_or_weights(source)?;
            if !value.is_tensor() {
                return Err(ConversionError::InvalidArgument(format!(
                    "output {source} is weights not tensor"
                )));
            }
            let id = value
                .tensor_id()
                .ok_or_else(|| ConversionError::NotFound(format!("output tensor not found: {source}")))?;
            self.network.set_tensor_name(id, binding);
            log::debug!("marking output tensor {source} as output binding {binding}");
            self.network.mark_output(id);
        }
        Ok(())
    }

    /// Looks up a converted value by graph name.
    pub fn get_tensor_or_weights(&self, name: &str) -> Result<TensorOrWeights> {
        self.tensors.get(name).cloned().ok_or_else(|| {
            ConversionError::NotFound(format!(
                "tensor or weights with name {name} could not be found"
            ))
        })
    }

    /// Resolves the node's data inputs from the namespace, skipping control
    /// dependencies.
    fn get_inputs(&self, node: &NodeDef) -> Result<Vec<TensorOrWeights>> {
        let mut inputs = Vec::with_capacity(node.inputs.len());
        for input_name in &node.inputs {
            if input_name.starts_with('^') {
                continue;
            }
            // Values of port 0 are registered under the bare node name.
            let name = input_name.strip_suffix(":0").unwrap_or(input_name);
            match self.tensors.get(name) {
                Some(input) => {
                    log::trace!("retrieved input {name} for node {}", node.name);
                    inputs.push(input.clone());
                }
                None => {
                    let msg = format!(
                        "node {} should have an input named '{name}' but it is not available",
                        node.name
                    );
                    log::error!("{msg}");
                    return Err(ConversionError::InvalidArgument(msg));
                }
            }
        }
        Ok(inputs)
    }

    /// Either side may still be unknown, but known batch sizes must agree.
    fn maybe_update_batch_size(&mut self, batch_size: i64) -> Result<()> {
        if self.batch_size < 0 || batch_size < 0 || self.batch_size == batch_size {
            if self.batch_size < 0 && batch_size >= 0 {
                self.batch_size = batch_size;
            }
            return Ok(());
        }
        Err(ConversionError::InvalidArgument(format!(
            "provided batch size does not match converter batch size: {batch_size} vs {}",
            self.batch_size
        )))
    }

    /// Registers a converted value, stamping tensors with the converter's
    /// batch size.
    ///
    /// Op converters must neither change the batch size nor introduce a
    /// dependency across the batch, so the size collected from the inputs
    /// holds for every tensor.
    fn add_tensor_or_weights(&mut self, name: String, mut input: TensorOrWeights) -> Result<()> {
        if input.is_tensor() {
            input.set_batch_size(self.batch_size);
        }
        match self.tensors.entry(name) {
            Entry::Vacant(entry) => {
                entry.insert(input);
                Ok(())
            }
            Entry::Occupied(entry) => Err(ConversionError::AlreadyExists(format!(
                "tensor/weights {} already exist",
                entry.key()
            ))),
        }
    }
}

/// Converts a segment graph into a network.
///
/// Nodes named `EngineInputPH_<slot>` become network inputs shaped by
/// `input_shapes[slot]` with the leading batch axis stripped, and nodes
/// named `EngineOutputPH_<slot>` become output bindings. Everything else is
/// dispatched through the op registry. The graph must be topologically
/// sorted.
pub fn convert_graph_to_network(
    graph: &GraphDef,
    input_shapes: &[PartialShape],
    fp16: bool,
) -> Result<Network> {
    debug_assert!(graph.is_top_sorted());
    log::debug!("starting network conversion");

    let mut converter = Converter::new(fp16);
    // Output bindings by slot, filled as the output nodes come by.
    let mut output_tensors: Vec<Option<(String, String)>> = vec![];
    for node in &graph.nodes {
        if node.name.starts_with(INPUT_PH_PREFIX) && node.op == "Placeholder" {
            let slot = parse_slot(&node.name, INPUT_PH_PREFIX)?;
            let shape = input_shapes.get(slot).ok_or_else(|| {
                ConversionError::InvalidArgument(format!(
                    "no input shape provided for slot {slot}"
                ))
            })?;
            let dtype =
                validator::validate_input_properties(shape, node.attr_dtype("dtype")?).map_err(
                    |e| {
                        let msg = format!(
                            "validation failed for {} and input slot {slot}",
                            node.name
                        );
                        log::warn!("{msg}: {e}");
                        e.context(msg)
                    },
                )?;
            // Validation guarantees a known rank. A scalar input leaves no
            // non-batch axes and is rejected by the network below.
            let full_dims = shape.dims().unwrap_or(&[]);
            let dims = Dims::new(full_dims.get(1..).unwrap_or(&[]).to_vec());
            let batch_size = full_dims.first().copied().unwrap_or(-1);
            log::trace!("adding engine input tensor {} with shape {dims}", node.name);
            converter.add_input_tensor(&node.name, dtype, dims, batch_size)?;
        } else if node.name.starts_with(OUTPUT_PH_PREFIX) && node.op == "Identity" {
            let slot = parse_slot(&node.name, OUTPUT_PH_PREFIX)?;
            let source = node.inputs.first().cloned().ok_or_else(|| {
                ConversionError::InvalidArgument(format!(
                    "output node {} has no input",
                    node.name
                ))
            })?;
            if output_tensors.len() <= slot {
                output_tensors.resize(slot + 1, None);
            }
            output_tensors[slot] = Some((source, node.name.clone()));
        } else {
            log::trace!("converting node {} with op {}", node.name, node.op);
            converter.convert_node(node)?;
        }
    }

    let bindings = output_tensors
        .into_iter()
        .enumerate()
        .map(|(slot, entry)| {
            entry.ok_or_else(|| {
                ConversionError::NotFound(format!("no output node found for slot {slot}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    converter.rename_and_mark_outputs(&bindings)?;
    log::debug!("finished network conversion");
    Ok(converter.into_network())
}

fn parse_slot(name: &str, prefix: &str) -> Result<usize> {
    name.strip_prefix(prefix)
        .and_then(|slot| slot.parse().ok())
        .ok_or_else(|| {
            ConversionError::InvalidArgument(format!(
                "failed to parse slot number from {name}"
            ))
        })
}
