use std::error::Error;
use std::fmt;

use crate::graph::{Dimension, Graph, Node, NodeId};
use crate::ops::{Add, DataType, Div, Mul, Operator, Shape, Slice, Sub};
use crate::tensor::Tensor;

/// Errors from assembling a [`Network`].
#[derive(Clone, Debug, PartialEq)]
pub enum BuildError {
    /// A node handle does not refer to a node in the network.
    UnknownNode(NodeId),

    /// A node handle refers to an operator step rather than a value.
    NotAValue(NodeId),

    /// An input with the same name has already been declared.
    DuplicateInput(String),

    /// The node has already been marked as an output.
    DuplicateOutput(NodeId),

    /// A declared fixed extent is zero.
    ZeroExtent,

    /// A static extent was requested for a dimension whose size is not known
    /// until runtime.
    DynamicExtent,

    /// Slice parameters do not have one entry per dimension.
    LengthMismatch(&'static str),

    /// A slice stride is zero.
    InvalidStride,

    /// The network has no marked outputs.
    NoOutputs,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::UnknownNode(id) => write!(f, "unknown node handle {}", id),
            BuildError::NotAValue(id) => write!(f, "node {} is not a value", id),
            BuildError::DuplicateInput(name) => {
                write!(f, "an input named \"{}\" already exists", name)
            }
            BuildError::DuplicateOutput(id) => {
                write!(f, "node {} is already marked as an output", id)
            }
            BuildError::ZeroExtent => write!(f, "declared extents must be at least 1"),
            BuildError::DynamicExtent => write!(
                f,
                "extent is not known until runtime; use a shape query node instead"
            ),
            BuildError::LengthMismatch(details) => write!(f, "length mismatch: {}", details),
            BuildError::InvalidStride => write!(f, "slice strides must be at least 1"),
            BuildError::NoOutputs => write!(f, "network has no marked outputs"),
        }
    }
}

impl Error for BuildError {}

/// Convert declared dimensions into concrete extents.
///
/// This fails with [`BuildError::DynamicExtent`] if any dimension is
/// symbolic: arithmetic over a declared shape is only valid when every extent
/// is fixed at build time. Networks whose inputs have dynamic extents must
/// compute shape-derived quantities with graph nodes ([`NetworkBuilder::add_shape`]
/// plus elementwise arithmetic) so the values are produced from the concrete
/// runtime shape instead.
pub fn static_extents(dims: &[Dimension]) -> Result<Vec<usize>, BuildError> {
    dims.iter()
        .map(|dim| match dim {
            Dimension::Fixed(size) => Ok(*size),
            Dimension::Symbolic(_) => Err(BuildError::DynamicExtent),
        })
        .collect()
}

/// Elementwise arithmetic operations supported by
/// [`NetworkBuilder::add_elementwise`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElementwiseOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// How the output extents of a slice step are determined.
///
/// The choice is made when the network is built: extents that are fully known
/// can be baked in as a constant, while extents that depend on a dynamic
/// input shape must come from a node that computes them at runtime.
#[derive(Clone, Debug, PartialEq)]
pub enum SliceSize {
    /// Extents known when the network is built.
    Static(Vec<usize>),

    /// A node producing a 1-D int tensor with one extent per dimension.
    FromNode(NodeId),
}

/// An input binding of a finished [`Network`].
#[derive(Clone, Debug)]
pub struct InputBinding {
    pub name: String,
    pub dtype: DataType,
    pub dims: Vec<Dimension>,
    pub id: NodeId,
}

impl InputBinding {
    /// Return true if any declared extent is only known at runtime.
    pub fn is_dynamic(&self) -> bool {
        self.dims
            .iter()
            .any(|dim| matches!(dim, Dimension::Symbolic(_)))
    }
}

/// An output binding of a finished [`Network`].
#[derive(Clone, Debug)]
pub struct OutputBinding {
    pub name: String,
    pub id: NodeId,
}

/// A finalized computation graph with named input and output bindings,
/// ready to be compiled.
pub struct Network {
    pub(crate) graph: Graph,
    pub(crate) inputs: Vec<InputBinding>,
    pub(crate) outputs: Vec<OutputBinding>,
}

impl Network {
    /// Return the network's input bindings.
    pub fn inputs(&self) -> &[InputBinding] {
        &self.inputs
    }

    /// Return the network's output bindings.
    pub fn outputs(&self) -> &[OutputBinding] {
        &self.outputs
    }
}

/// Assembles a computation graph step by step.
///
/// Handles returned by the `add_*` methods refer to the *value* produced by
/// a step, so they can be passed directly as inputs to later steps.
pub struct NetworkBuilder {
    graph: Graph,
    inputs: Vec<InputBinding>,
    outputs: Vec<OutputBinding>,
}

impl NetworkBuilder {
    pub fn new() -> NetworkBuilder {
        NetworkBuilder {
            graph: Graph::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Declare a runtime-supplied input.
    ///
    /// The rank is fixed here; individual extents may be
    /// [`Dimension::Symbolic`] to defer their size to runtime. Fixed extents
    /// must be at least 1.
    pub fn add_input(
        &mut self,
        name: &str,
        dtype: DataType,
        dims: &[Dimension],
    ) -> Result<NodeId, BuildError> {
        if self.inputs.iter().any(|input| input.name == name) {
            return Err(BuildError::DuplicateInput(name.to_string()));
        }
        if dims
            .iter()
            .any(|dim| matches!(dim, Dimension::Fixed(0)))
        {
            return Err(BuildError::ZeroExtent);
        }

        let id = self.graph.add_value(Some(name), Some(dims.to_vec()));
        self.inputs.push(InputBinding {
            name: name.to_string(),
            dtype,
            dims: dims.to_vec(),
            id,
        });
        Ok(id)
    }

    /// Add a constant tensor to the network.
    pub fn add_constant<T>(&mut self, values: Tensor<T>) -> NodeId
    where
        crate::graph::ConstantNode<T>: Into<crate::graph::Constant>,
    {
        let name = format!("const_{}", self.graph.len());
        self.graph.add_constant(Some(&name), values)
    }

    /// Add a step which queries the runtime shape of `input`, producing a
    /// 1-D int tensor with one element per dimension.
    pub fn add_shape(&mut self, input: NodeId) -> Result<NodeId, BuildError> {
        self.check_value(input)?;
        Ok(self.add_operator(Box::new(Shape {}), &[input]))
    }

    /// Add an elementwise arithmetic step over broadcast-compatible inputs.
    pub fn add_elementwise(
        &mut self,
        op: ElementwiseOp,
        a: NodeId,
        b: NodeId,
    ) -> Result<NodeId, BuildError> {
        self.check_value(a)?;
        self.check_value(b)?;
        let operator: Box<dyn Operator> = match op {
            ElementwiseOp::Add => Box::new(Add {}),
            ElementwiseOp::Sub => Box::new(Sub {}),
            ElementwiseOp::Mul => Box::new(Mul {}),
            ElementwiseOp::Div => Box::new(Div {}),
        };
        Ok(self.add_operator(operator, &[a, b]))
    }

    /// Add a step which copies a strided region out of `input`.
    ///
    /// `starts` and `strides` are fixed when the network is built. The output
    /// extents are given by `size`, which is either baked in as a constant or
    /// supplied by another node at runtime (see [`SliceSize`]).
    pub fn add_slice(
        &mut self,
        input: NodeId,
        starts: &[usize],
        size: SliceSize,
        strides: &[usize],
    ) -> Result<NodeId, BuildError> {
        self.check_value(input)?;
        if starts.len() != strides.len() {
            return Err(BuildError::LengthMismatch(
                "starts and strides must have the same length",
            ));
        }
        if strides.iter().any(|&stride| stride == 0) {
            return Err(BuildError::InvalidStride);
        }

        let sizes_id = match size {
            SliceSize::Static(extents) => {
                if extents.len() != starts.len() {
                    return Err(BuildError::LengthMismatch(
                        "static sizes must have the same length as starts",
                    ));
                }
                let sizes = Tensor::from_vec(extents.iter().map(|&size| size as i32).collect());
                self.add_constant(sizes)
            }
            SliceSize::FromNode(id) => {
                self.check_value(id)?;
                id
            }
        };

        let operator = Box::new(Slice {
            starts: starts.to_vec(),
            strides: strides.to_vec(),
        });
        Ok(self.add_operator(operator, &[input, sizes_id]))
    }

    /// Designate the value produced by `node` as a network output.
    pub fn mark_output(&mut self, node: NodeId) -> Result<(), BuildError> {
        self.check_value(node)?;
        if self.outputs.iter().any(|output| output.id == node) {
            return Err(BuildError::DuplicateOutput(node));
        }
        self.outputs.push(OutputBinding {
            name: self.graph.node_name(node),
            id: node,
        });
        Ok(())
    }

    /// Finalize the network.
    pub fn finish(self) -> Result<Network, BuildError> {
        if self.outputs.is_empty() {
            return Err(BuildError::NoOutputs);
        }
        Ok(Network {
            graph: self.graph,
            inputs: self.inputs,
            outputs: self.outputs,
        })
    }

    /// Add an operator step plus the value node holding its result. Returns
    /// the ID of the value node.
    fn add_operator(&mut self, operator: Box<dyn Operator>, inputs: &[NodeId]) -> NodeId {
        let index = self.graph.len();
        let op_name = format!("{}_{}", operator.name().to_lowercase(), index);
        let out_name = format!("{}_out", op_name);
        let out_id = self.graph.add_value(Some(&out_name), None);
        self.graph.add_op(Some(&op_name), operator, inputs, &[out_id]);
        out_id
    }

    /// Check that `id` refers to a value or constant node.
    fn check_value(&self, id: NodeId) -> Result<(), BuildError> {
        match self.graph.get_node(id) {
            Some(Node::Value(_)) | Some(Node::Constant(_)) => Ok(()),
            Some(Node::Operator(_)) => Err(BuildError::NotAValue(id)),
            None => Err(BuildError::UnknownNode(id)),
        }
    }
}

impl Default for NetworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{static_extents, BuildError, ElementwiseOp, NetworkBuilder, SliceSize};
    use crate::graph::Dimension;
    use crate::ops::DataType;
    use crate::tensor::Tensor;

    fn dynamic_dims(rank: usize) -> Vec<Dimension> {
        (0..rank)
            .map(|dim| Dimension::Symbolic(format!("d{}", dim)))
            .collect()
    }

    #[test]
    fn test_build_shape_driven_slice() {
        let mut builder = NetworkBuilder::new();
        let input = builder
            .add_input("input", DataType::Float, &dynamic_dims(4))
            .unwrap();
        let adjust = builder.add_constant(Tensor::from_vec(vec![0i32, 1, 1, 1]));
        let shape = builder.add_shape(input).unwrap();
        let sizes = builder
            .add_elementwise(ElementwiseOp::Sub, shape, adjust)
            .unwrap();
        let sliced = builder
            .add_slice(input, &[0, 1, 1, 1], SliceSize::FromNode(sizes), &[1, 1, 1, 1])
            .unwrap();
        builder.mark_output(sliced).unwrap();

        let network = builder.finish().unwrap();
        assert_eq!(network.inputs().len(), 1);
        assert_eq!(network.outputs().len(), 1);
        assert!(network.inputs()[0].is_dynamic());
    }

    #[test]
    fn test_static_extents_rejects_dynamic_dims() {
        // A fully fixed declared shape can be used for build-time arithmetic.
        let fixed = [Dimension::Fixed(1), Dimension::Fixed(3)];
        assert_eq!(static_extents(&fixed), Ok(vec![1, 3]));

        // A declared shape with unknown extents cannot: the sizes must come
        // from a shape query node evaluated against the concrete runtime
        // shape instead.
        let dims = dynamic_dims(4);
        assert_eq!(static_extents(&dims), Err(BuildError::DynamicExtent));
    }

    #[test]
    fn test_add_input_validation() {
        let mut builder = NetworkBuilder::new();
        builder
            .add_input("input", DataType::Float, &dynamic_dims(2))
            .unwrap();

        let result = builder.add_input("input", DataType::Float, &dynamic_dims(2));
        assert_eq!(
            result.err(),
            Some(BuildError::DuplicateInput("input".to_string()))
        );

        let result = builder.add_input("other", DataType::Float, &[Dimension::Fixed(0)]);
        assert_eq!(result.err(), Some(BuildError::ZeroExtent));
    }

    #[test]
    fn test_unknown_node_handle() {
        let mut builder = NetworkBuilder::new();
        assert_eq!(
            builder.add_shape(42).err(),
            Some(BuildError::UnknownNode(42))
        );
    }

    #[test]
    fn test_operator_handle_is_not_a_value() {
        let mut builder = NetworkBuilder::new();
        let input = builder
            .add_input("input", DataType::Float, &dynamic_dims(2))
            .unwrap();
        let shape = builder.add_shape(input).unwrap();

        // `shape` is the value produced by the step; the operator node
        // itself is allocated just after it and is not a valid operand.
        let op_node = shape + 1;
        assert_eq!(
            builder.add_shape(op_node).err(),
            Some(BuildError::NotAValue(op_node))
        );
    }

    #[test]
    fn test_duplicate_output() {
        let mut builder = NetworkBuilder::new();
        let input = builder
            .add_input("input", DataType::Float, &dynamic_dims(2))
            .unwrap();
        builder.mark_output(input).unwrap();
        assert_eq!(
            builder.mark_output(input).err(),
            Some(BuildError::DuplicateOutput(input))
        );
    }

    #[test]
    fn test_slice_validation() {
        let mut builder = NetworkBuilder::new();
        let input = builder
            .add_input("input", DataType::Float, &dynamic_dims(2))
            .unwrap();

        let result = builder.add_slice(input, &[0, 0], SliceSize::Static(vec![1]), &[1, 1]);
        assert_eq!(
            result.err(),
            Some(BuildError::LengthMismatch(
                "static sizes must have the same length as starts"
            ))
        );

        let result = builder.add_slice(input, &[0, 0], SliceSize::Static(vec![1, 1]), &[1, 0]);
        assert_eq!(result.err(), Some(BuildError::InvalidStride));
    }

    #[test]
    fn test_finish_requires_outputs() {
        let mut builder = NetworkBuilder::new();
        builder
            .add_input("input", DataType::Float, &dynamic_dims(2))
            .unwrap();
        assert!(matches!(
            builder.finish().err(),
            Some(BuildError::NoOutputs)
        ));
    }
}
