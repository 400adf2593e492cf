use std::error::Error;
use std::fmt;

// The std HashMap/HashSet provide DOS resistance. In this module hash keys are
// mostly `NodeId`s which we allocate ourselves, so this is not a concern.
// Instead we want faster hashing.
use rustc_hash::{FxHashMap, FxHashSet};

use crate::device::DeviceError;
use crate::ops::{Input, InputList, OpError, Operator, Output, ShapeInfo};
use crate::tensor::Tensor;
use crate::timer::Timer;

/// Represents the size of a dimension of a runtime-provided value, such as
/// a graph input or operator output.
#[derive(Clone, Debug, PartialEq)]
pub enum Dimension {
    /// A dimension whose size is fixed when the graph is constructed.
    Fixed(usize),

    /// A dimension whose size is determined at runtime. The symbol provides
    /// a name to identify when different values share a size.
    Symbolic(String),
}

pub struct OperatorNode {
    name: Option<String>,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
    operator: Box<dyn Operator>,
}

impl OperatorNode {
    pub fn operator(&self) -> &dyn Operator {
        self.operator.as_ref()
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }
}

pub struct ValueNode {
    name: Option<String>,
    shape: Option<Vec<Dimension>>,
}

pub struct ConstantNode<T> {
    name: Option<String>,
    data: Tensor<T>,
}

impl<T> ConstantNode<T> {
    pub fn data(&self) -> &Tensor<T> {
        &self.data
    }
}

pub enum Constant {
    Float(ConstantNode<f32>),
    Int(ConstantNode<i32>),
}

impl From<ConstantNode<f32>> for Constant {
    fn from(node: ConstantNode<f32>) -> Constant {
        Constant::Float(node)
    }
}

impl From<ConstantNode<i32>> for Constant {
    fn from(node: ConstantNode<i32>) -> Constant {
        Constant::Int(node)
    }
}

pub enum Node {
    Operator(OperatorNode),
    Constant(Constant),
    Value(ValueNode),
}

impl Node {
    /// Return the debug name of this node.
    pub fn name(&self) -> Option<&str> {
        let maybe_name = match self {
            Node::Operator(node) => &node.name,
            Node::Constant(constant) => match constant {
                Constant::Float(node) => &node.name,
                Constant::Int(node) => &node.name,
            },
            Node::Value(node) => &node.name,
        };
        maybe_name.as_deref()
    }

    /// Return the declared shape associated with this node.
    ///
    /// For constants this is the shape of the tensor. Operator nodes have no
    /// shape. For values (eg. inputs) this is the expected shape, which may
    /// contain symbolic dimensions.
    pub fn shape(&self) -> Option<Vec<Dimension>> {
        let dims_from_fixed_shape =
            |shape: &[usize]| shape.iter().copied().map(Dimension::Fixed).collect();

        match self {
            Node::Operator(_) => None,
            Node::Constant(constant) => match constant {
                Constant::Float(node) => Some(dims_from_fixed_shape(node.data.shape())),
                Constant::Int(node) => Some(dims_from_fixed_shape(node.data.shape())),
            },
            Node::Value(node) => node.shape.clone(),
        }
    }
}

/// ID of a node in a graph.
pub type NodeId = usize;

/// Reasons why graph execution failed.
#[derive(Debug)]
pub enum RunError {
    /// An input or output node ID is invalid.
    InvalidNodeId,

    /// No binding with a given name exists.
    UnknownBinding(String),

    /// A plan could not be constructed that would generate the requested
    /// output from the input.
    PlanningError(String),

    /// Execution of an operator failed.
    OperatorError { name: String, error: OpError },

    /// The output of a graph operator did not match expectations (eg. the
    /// count, types or shapes of outputs did not match what was expected).
    OutputMismatch(&'static str),

    /// A concrete input shape lies outside the range the plan was compiled
    /// for.
    InputOutOfRange { input: String, shape: Vec<usize> },

    /// No concrete shape was set for a dynamic input before running.
    ShapeNotSet(String),

    /// A required input buffer was not provided.
    MissingInput(String),

    /// An input buffer does not match the concrete shape set for it.
    InputShapeMismatch {
        input: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// An input buffer does not have the element type declared for the
    /// binding.
    WrongInputType(String),

    /// Allocating or copying device memory failed.
    Device(DeviceError),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::InvalidNodeId => write!(f, "node ID is invalid"),
            RunError::UnknownBinding(name) => write!(f, "no binding found with name {}", name),
            RunError::PlanningError(err) => write!(f, "planning error: {}", err),
            RunError::OperatorError { name, error } => {
                write!(f, "operator \"{}\" failed: {}", name, error)
            }
            RunError::OutputMismatch(err) => write!(f, "output mismatch: {}", err),
            RunError::InputOutOfRange { input, shape } => write!(
                f,
                "shape {:?} for input \"{}\" is outside the compiled range",
                shape, input
            ),
            RunError::ShapeNotSet(input) => {
                write!(f, "no shape was set for dynamic input \"{}\"", input)
            }
            RunError::MissingInput(input) => {
                write!(f, "no buffer was provided for input \"{}\"", input)
            }
            RunError::InputShapeMismatch {
                input,
                expected,
                actual,
            } => write!(
                f,
                "buffer for input \"{}\" has shape {:?} but shape {:?} was set",
                input, actual, expected
            ),
            RunError::WrongInputType(input) => write!(
                f,
                "buffer for input \"{}\" does not match the declared type",
                input
            ),
            RunError::Device(err) => write!(f, "device error: {}", err),
        }
    }
}

impl Error for RunError {}

impl From<DeviceError> for RunError {
    fn from(err: DeviceError) -> RunError {
        RunError::Device(err)
    }
}

/// Return true if all elements in `xs` are unique according to the comparison
/// function `eq`.
///
/// `xs` is assumed to be small enough that comparing all pairs is still fast.
fn all_unique<T, F: Fn(&T, &T) -> bool>(xs: &[T], eq: F) -> bool {
    xs.iter()
        .all(|x| xs.iter().filter(|y| eq(x, y)).count() == 1)
}

/// Options that control logging and other behaviors when executing a graph.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Whether to log the total time spent executing when a run completes.
    pub timing: bool,

    /// Whether to log information about each graph operation as it is
    /// executed, including input shapes and execution time. This will slow
    /// down execution.
    pub verbose: bool,
}

impl RunOptions {
    /// Enable flags set via the `DYNTEN_TIMING` and `DYNTEN_VERBOSE`
    /// environment variables.
    pub fn with_env_flags(mut self) -> RunOptions {
        self.timing = crate::env::env_flag("DYNTEN_TIMING", self.timing);
        self.verbose = crate::env::env_flag("DYNTEN_VERBOSE", self.verbose);
        self
    }
}

/// A graph defines how to produce output values from a set of dynamic input
/// values and constants, by flowing the inputs through a series of
/// computation steps (operators).
///
/// Graphs consist of three types of node, each of which has a numeric ID. A
/// node is either a constant value, a dynamically supplied or produced value,
/// or a computation step.
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    /// Create a new empty dataflow graph.
    pub fn new() -> Graph {
        Graph { nodes: Vec::new() }
    }

    /// Add an operator node to the graph.
    ///
    /// `name` is an identifier for this node that is used in debug messages.
    /// `inputs` are the nodes whose values are passed to the operator when
    /// the graph is executed and `outputs` are the value nodes its results
    /// are written to.
    ///
    /// Returns the ID of the operator node.
    pub fn add_op(
        &mut self,
        name: Option<&str>,
        op: Box<dyn Operator>,
        inputs: &[NodeId],
        outputs: &[NodeId],
    ) -> NodeId {
        self.nodes.push(Node::Operator(OperatorNode {
            name: name.map(|s| s.to_owned()),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            operator: op,
        }));
        self.nodes.len() - 1
    }

    /// Add a constant node to the graph.
    ///
    /// Returns the ID of the added node.
    pub fn add_constant<T>(&mut self, name: Option<&str>, value: Tensor<T>) -> NodeId
    where
        ConstantNode<T>: Into<Constant>,
    {
        let node = ConstantNode {
            name: name.map(|s| s.to_owned()),
            data: value,
        };
        self.nodes.push(Node::Constant(node.into()));
        self.nodes.len() - 1
    }

    /// Add a value node to the graph.
    ///
    /// This serves as a placeholder for a value which is available only when
    /// the graph is executed, such as an input or operator output. `shape` is
    /// the expected shape of the value at runtime, or None if not known.
    ///
    /// Returns the ID of the added node.
    pub fn add_value(&mut self, name: Option<&str>, shape: Option<Vec<Dimension>>) -> NodeId {
        self.nodes.push(Node::Value(ValueNode {
            name: name.map(|s| s.to_owned()),
            shape,
        }));
        self.nodes.len() - 1
    }

    /// Return the debug name for a node.
    pub fn node_name(&self, id: NodeId) -> String {
        self.get_node(id)
            .and_then(|node| node.name())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("[ID: {}]", id))
    }

    /// Retrieve a node by ID.
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Return the number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Execute the operator nodes in `order`, which must have been produced
    /// by [`Graph::execution_order`] for the same inputs and outputs.
    pub(crate) fn run_order(
        &self,
        order: &[NodeId],
        inputs: &[(NodeId, Input)],
        outputs: &[NodeId],
        opts: Option<RunOptions>,
    ) -> Result<Vec<Output>, RunError> {
        let opts = opts.unwrap_or_default();

        let mut run_timer = Timer::new();
        if opts.timing {
            run_timer.start();
        }

        let inputs_by_id: FxHashMap<NodeId, Input> = inputs.iter().cloned().collect();
        let get_value_from_constant_or_input = |node_id: NodeId| -> Option<Input> {
            if let Some(Node::Constant(constant)) = self.nodes.get(node_id) {
                let value = match constant {
                    Constant::Float(node) => Input::FloatTensor(&node.data),
                    Constant::Int(node) => Input::IntTensor(&node.data),
                };
                Some(value)
            } else {
                inputs_by_id.get(&node_id).cloned()
            }
        };

        // Execute the plan. Intermediate values are retained until the end of
        // the run and released together with the outputs' buffers.
        let mut temp_values: FxHashMap<NodeId, Output> = FxHashMap::default();

        for (step, op_node_id) in order.iter().enumerate() {
            let Some(Node::Operator(op_node)) = self.nodes.get(*op_node_id) else {
                return Err(RunError::PlanningError(format!(
                    "node {} in execution order is not an operator",
                    op_node_id
                )));
            };

            let mut op_timer = Timer::new();
            if opts.verbose || opts.timing {
                op_timer.start();
            }

            let mut op_inputs: Vec<Input> = Vec::with_capacity(op_node.inputs.len());
            for node_id in op_node.inputs.iter() {
                if let Some(value) = get_value_from_constant_or_input(*node_id) {
                    op_inputs.push(value);
                } else if let Some(value) = temp_values.get(node_id) {
                    op_inputs.push(value.into());
                } else {
                    // If this is reached, there was a bug in plan creation.
                    panic!(
                        "Invalid plan did not produce input value {} for operator {}",
                        self.node_name(*node_id),
                        self.node_name(*op_node_id),
                    );
                }
            }

            let op_result = op_node.operator.run(InputList::from(&op_inputs));

            if opts.verbose || opts.timing {
                op_timer.end();
            }

            if opts.verbose {
                println!(
                    "#{} {} ({})",
                    step,
                    op_node.operator.name(),
                    op_node.name.as_deref().unwrap_or("")
                );
                for (index, id) in op_node.inputs.iter().enumerate() {
                    if let Some(input) = op_inputs.get(index) {
                        println!(
                            "  input {}: {} ({:?})",
                            index,
                            self.node_name(*id),
                            input.shape()
                        );
                    }
                }
                if let Ok(op_outputs) = op_result.as_ref() {
                    for (index, (id, output)) in
                        op_node.outputs.iter().zip(op_outputs.iter()).enumerate()
                    {
                        println!(
                            "  output {}: {} ({:?})",
                            index,
                            self.node_name(*id),
                            output.shape()
                        );
                    }
                }
                println!("  time: {}ms", op_timer.elapsed_ms());
            }

            let op_outputs = match op_result {
                Ok(op_outputs) => op_outputs,
                Err(op_error) => {
                    return Err(RunError::OperatorError {
                        name: op_node.name.as_deref().unwrap_or("").to_string(),
                        error: op_error,
                    });
                }
            };

            if op_node.outputs.len() != op_outputs.len() {
                return Err(RunError::OutputMismatch(
                    "operator output count did not match expected count",
                ));
            }

            for (&output_id, output) in op_node.outputs.iter().zip(op_outputs.into_iter()) {
                temp_values.insert(output_id, output);
            }
        }

        if opts.timing {
            run_timer.end();
            println!(
                "Graph run of {} ops finished in {}ms",
                order.len(),
                run_timer.elapsed_ms()
            );
        }

        // Return the requested outputs.
        let result = outputs
            .iter()
            .map(|output_id| {
                if let Some(value) = get_value_from_constant_or_input(*output_id) {
                    match value {
                        Input::IntTensor(t) => Output::IntTensor(t.clone()),
                        Input::FloatTensor(t) => Output::FloatTensor(t.clone()),
                    }
                } else {
                    // During planning we verified that each output ID is valid
                    // and unique, so this should always succeed.
                    temp_values.remove(output_id).expect("missing output value")
                }
            })
            .collect();
        Ok(result)
    }

    /// Resolve shape information for every node touched by `order`, given
    /// concrete shapes for the graph inputs.
    ///
    /// Unlike [`Graph::run_order`] this does not execute any tensor data
    /// computation. It only propagates extents, plus the values of int
    /// tensors that carry shapes, so the caller can size output buffers
    /// before execution.
    pub(crate) fn resolve_shapes(
        &self,
        order: &[NodeId],
        input_shapes: &FxHashMap<NodeId, Vec<usize>>,
    ) -> Result<FxHashMap<NodeId, ShapeInfo>, RunError> {
        let mut resolved: FxHashMap<NodeId, ShapeInfo> = FxHashMap::default();

        for (node_id, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Constant(Constant::Float(constant)) => {
                    resolved.insert(node_id, ShapeInfo::from_dims(constant.data.shape()));
                }
                Node::Constant(Constant::Int(constant)) => {
                    resolved.insert(node_id, ShapeInfo::with_value(constant.data.clone()));
                }
                Node::Value(_) => {
                    if let Some(shape) = input_shapes.get(&node_id) {
                        resolved.insert(node_id, ShapeInfo::from_dims(shape));
                    }
                }
                Node::Operator(_) => {}
            }
        }

        for op_node_id in order {
            let Some(Node::Operator(op_node)) = self.nodes.get(*op_node_id) else {
                return Err(RunError::PlanningError(format!(
                    "node {} in execution order is not an operator",
                    op_node_id
                )));
            };

            let mut op_inputs = Vec::with_capacity(op_node.inputs.len());
            for node_id in op_node.inputs.iter() {
                let Some(info) = resolved.get(node_id) else {
                    return Err(RunError::PlanningError(format!(
                        "shape of input {} for operator {} is not resolved",
                        self.node_name(*node_id),
                        self.node_name(*op_node_id),
                    )));
                };
                op_inputs.push(info.clone());
            }

            let op_outputs = op_node.operator.resolve_shapes(&op_inputs).map_err(|error| {
                RunError::OperatorError {
                    name: op_node.name.as_deref().unwrap_or("").to_string(),
                    error,
                }
            })?;

            if op_node.outputs.len() != op_outputs.len() {
                return Err(RunError::OutputMismatch(
                    "operator output count did not match expected count",
                ));
            }
            for (&output_id, info) in op_node.outputs.iter().zip(op_outputs.into_iter()) {
                resolved.insert(output_id, info);
            }
        }

        Ok(resolved)
    }

    /// Return the node IDs whose values are available at the start of graph
    /// execution, given a collection of initial inputs.
    fn init_resolved_values<I: Iterator<Item = NodeId>>(&self, inputs: I) -> FxHashSet<NodeId> {
        inputs
            .chain(
                self.nodes.iter().enumerate().filter_map(|(node_id, node)| {
                    matches!(node, Node::Constant(_)).then_some(node_id)
                }),
            )
            .collect()
    }

    /// Create an execution plan for a sequence of computation steps that
    /// begin with `inputs` and eventually produce `outputs`.
    ///
    /// The set of input and output node IDs must be unique. Output IDs which
    /// reference constant or input values are omitted from the plan.
    pub(crate) fn execution_order(
        &self,
        inputs: &[NodeId],
        outputs: &[NodeId],
    ) -> Result<Vec<NodeId>, RunError> {
        if !all_unique(outputs, |x, y| x == y) {
            return Err(RunError::PlanningError("output IDs are not unique".into()));
        }
        if !all_unique(inputs, |x, y| x == y) {
            return Err(RunError::PlanningError("input IDs are not unique".into()));
        }
        if outputs.iter().any(|id| *id >= self.nodes.len()) {
            return Err(RunError::InvalidNodeId);
        }

        // Map of output node to source operator.
        let mut operator_nodes: FxHashMap<NodeId, (NodeId, &OperatorNode)> = FxHashMap::default();
        for (node_id, node) in self.nodes.iter().enumerate() {
            if let Node::Operator(op_node) = node {
                for output_id in op_node.outputs.iter() {
                    operator_nodes.insert(*output_id, (node_id, op_node));
                }
            }
        }

        // Build an execution plan via a depth first traversal of the graph
        // starting at the output nodes. A helper struct is used as recursive
        // closures are not supported in Rust.
        struct PlanBuilder<'a> {
            graph: &'a Graph,
            resolved_values: FxHashSet<NodeId>,
            plan: Vec<NodeId>,

            // Map of output ID to (op node ID, op).
            operator_nodes: FxHashMap<NodeId, (NodeId, &'a OperatorNode)>,
        }
        impl<'a> PlanBuilder<'a> {
            /// Add all the transitive dependencies of `op_node` to the plan,
            /// followed by `op_node`.
            fn visit(
                &mut self,
                op_node_id: NodeId,
                op_node: &'a OperatorNode,
            ) -> Result<(), RunError> {
                for input in op_node.inputs.iter() {
                    if self.resolved_values.contains(input) {
                        continue;
                    }
                    if let Some((input_op_id, input_op_node)) =
                        self.operator_nodes.get(input).copied()
                    {
                        self.visit(input_op_id, input_op_node)?;
                    } else {
                        let msg = format!(
                            "missing input \"{}\" for op \"{}\"",
                            self.graph.node_name(*input),
                            self.graph.node_name(op_node_id)
                        );
                        return Err(RunError::PlanningError(msg));
                    }
                }
                for output_id in op_node.outputs.iter() {
                    self.resolved_values.insert(*output_id);
                }
                self.plan.push(op_node_id);
                Ok(())
            }

            /// Return a sequential plan to generate `outputs`.
            fn plan(mut self, outputs: &[NodeId]) -> Result<Vec<NodeId>, RunError> {
                for output_id in outputs.iter() {
                    if self.resolved_values.contains(output_id) {
                        // Value is either a constant node or is produced by
                        // an operator that is already in the plan.
                        continue;
                    }

                    if let Some((op_node_id, op_node)) =
                        self.operator_nodes.get(output_id).copied()
                    {
                        self.visit(op_node_id, op_node)?;
                    } else {
                        let msg = format!("missing output {}", output_id);
                        return Err(RunError::PlanningError(msg));
                    }
                }
                Ok(self.plan)
            }
        }

        let resolved_values = self.init_resolved_values(inputs.iter().copied());
        let builder = PlanBuilder {
            graph: self,
            resolved_values,
            plan: Vec::new(),
            operator_nodes,
        };
        builder.plan(outputs)
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
