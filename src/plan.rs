use std::error::Error;
use std::fmt;
use std::path::Path;

use crate::builder::{InputBinding, Network, OutputBinding};
use crate::graph::{Dimension, Graph, Node, NodeId};
use crate::header::{Header, HeaderError, ValueReader};
use crate::ops::{Add, DataType, Div, Mul, Operator, Shape, Slice, Sub};
use crate::profile::{ProfileError, ShapeProfile};
use crate::tensor::Tensor;

/// Errors from compiling a [`Network`] into a [`Plan`].
#[derive(Clone, Debug, PartialEq)]
pub enum CompileError {
    /// A supplied shape profile is internally inconsistent.
    InvalidProfile { input: String, error: ProfileError },

    /// A profile names an input that does not exist in the network.
    UnknownProfileInput(String),

    /// More than one profile was supplied for the same input.
    DuplicateProfile(String),

    /// A dynamic input has no shape profile.
    MissingProfile(String),

    /// A profile's rank does not match the input's declared rank.
    ProfileRankMismatch {
        input: String,
        expected: usize,
        actual: usize,
    },

    /// A fixed declared extent lies outside the profile's range.
    FixedExtentOutsideProfile { input: String, dim: usize },

    /// An execution order for the graph could not be constructed.
    Planning(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::InvalidProfile { input, error } => {
                write!(f, "profile for input \"{}\" is invalid: {}", input, error)
            }
            CompileError::UnknownProfileInput(input) => {
                write!(f, "profile names unknown input \"{}\"", input)
            }
            CompileError::DuplicateProfile(input) => {
                write!(f, "multiple profiles supplied for input \"{}\"", input)
            }
            CompileError::MissingProfile(input) => {
                write!(f, "dynamic input \"{}\" has no shape profile", input)
            }
            CompileError::ProfileRankMismatch {
                input,
                expected,
                actual,
            } => write!(
                f,
                "profile for input \"{}\" has rank {} but the input has rank {}",
                input, actual, expected
            ),
            CompileError::FixedExtentOutsideProfile { input, dim } => write!(
                f,
                "fixed extent of dim {} of input \"{}\" is outside the profile range",
                dim, input
            ),
            CompileError::Planning(msg) => write!(f, "planning failed: {}", msg),
        }
    }
}

impl Error for CompileError {}

/// Errors from restoring a serialized [`Plan`].
#[derive(Debug)]
pub enum PlanLoadError {
    /// An I/O error occurred reading the plan.
    ReadFailed(std::io::Error),

    /// The blob's header is invalid.
    Header(HeaderError),

    /// The blob ended in the middle of a value.
    UnexpectedEof,

    /// A string in the blob is not valid UTF-8.
    InvalidString,

    /// An unrecognized tag byte was encountered.
    UnknownTag(u8),

    /// An unrecognized operator code was encountered.
    UnknownOperator(u8),

    /// The decoded graph structure is inconsistent.
    InvalidGraph(&'static str),

    /// An execution order for the decoded graph could not be constructed.
    Planning(String),
}

impl fmt::Display for PlanLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanLoadError::ReadFailed(err) => write!(f, "read failed: {}", err),
            PlanLoadError::Header(err) => write!(f, "invalid header: {}", err),
            PlanLoadError::UnexpectedEof => write!(f, "unexpected end of plan data"),
            PlanLoadError::InvalidString => write!(f, "string is not valid UTF-8"),
            PlanLoadError::UnknownTag(tag) => write!(f, "unknown tag {}", tag),
            PlanLoadError::UnknownOperator(code) => write!(f, "unknown operator code {}", code),
            PlanLoadError::InvalidGraph(details) => write!(f, "invalid graph: {}", details),
            PlanLoadError::Planning(msg) => write!(f, "planning failed: {}", msg),
        }
    }
}

impl Error for PlanLoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PlanLoadError::ReadFailed(err) => Some(err),
            PlanLoadError::Header(err) => Some(err),
            _ => None,
        }
    }
}

impl From<HeaderError> for PlanLoadError {
    fn from(err: HeaderError) -> PlanLoadError {
        PlanLoadError::Header(err)
    }
}

/// An immutable, executable artifact compiled from a [`Network`] and its
/// shape profiles.
///
/// Compilation happens once; afterwards the plan can be executed any number
/// of times, for any concrete input shapes within the profiled ranges, by
/// creating an execution context (see
/// [`Plan::create_context`](crate::ExecutionContext)). Plans can be
/// serialized to a byte blob and restored later.
pub struct Plan {
    graph: Graph,
    inputs: Vec<InputBinding>,
    outputs: Vec<OutputBinding>,
    profiles: Vec<ShapeProfile>,
    order: Vec<NodeId>,
}

impl Plan {
    /// Compile `network` against the supplied shape profiles.
    ///
    /// Every input with a dynamic extent must have exactly one profile whose
    /// rank matches the input's declared rank. Inputs with fully fixed
    /// shapes may omit a profile.
    pub fn compile(network: Network, profiles: Vec<ShapeProfile>) -> Result<Plan, CompileError> {
        for profile in profiles.iter() {
            let Some(input) = network
                .inputs
                .iter()
                .find(|input| input.name == profile.input())
            else {
                return Err(CompileError::UnknownProfileInput(profile.input().to_string()));
            };

            if profiles
                .iter()
                .filter(|other| other.input() == profile.input())
                .count()
                > 1
            {
                return Err(CompileError::DuplicateProfile(profile.input().to_string()));
            }

            profile
                .validate()
                .map_err(|error| CompileError::InvalidProfile {
                    input: profile.input().to_string(),
                    error,
                })?;

            if profile.rank() != input.dims.len() {
                return Err(CompileError::ProfileRankMismatch {
                    input: input.name.clone(),
                    expected: input.dims.len(),
                    actual: profile.rank(),
                });
            }

            for (dim, declared) in input.dims.iter().enumerate() {
                if let Dimension::Fixed(size) = declared {
                    if *size < profile.min()[dim] || *size > profile.max()[dim] {
                        return Err(CompileError::FixedExtentOutsideProfile {
                            input: input.name.clone(),
                            dim,
                        });
                    }
                }
            }
        }

        for input in network.inputs.iter() {
            if input.is_dynamic() && !profiles.iter().any(|p| p.input() == input.name) {
                return Err(CompileError::MissingProfile(input.name.clone()));
            }
        }

        let input_ids: Vec<NodeId> = network.inputs.iter().map(|input| input.id).collect();
        let output_ids: Vec<NodeId> = network.outputs.iter().map(|output| output.id).collect();
        let order = network
            .graph
            .execution_order(&input_ids, &output_ids)
            .map_err(|err| CompileError::Planning(err.to_string()))?;

        Ok(Plan {
            graph: network.graph,
            inputs: network.inputs,
            outputs: network.outputs,
            profiles,
            order,
        })
    }

    /// Return the plan's input bindings.
    pub fn inputs(&self) -> &[InputBinding] {
        &self.inputs
    }

    /// Return the plan's output bindings.
    pub fn outputs(&self) -> &[OutputBinding] {
        &self.outputs
    }

    /// Return the shape profiles the plan was compiled with.
    pub fn profiles(&self) -> &[ShapeProfile] {
        &self.profiles
    }

    /// Return the profile constraining `input`, if one was supplied.
    pub fn profile_for(&self, input: &str) -> Option<&ShapeProfile> {
        self.profiles.iter().find(|p| p.input() == input)
    }

    pub(crate) fn graph(&self) -> &Graph {
        &self.graph
    }

    pub(crate) fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Serialize the plan to a byte blob which [`Plan::deserialize`] can
    /// restore.
    pub fn serialize(&self) -> Vec<u8> {
        let mut graph_buf = Vec::new();
        encode_graph(&mut graph_buf, &self.graph);

        write_u32(&mut graph_buf, self.inputs.len() as u32);
        for input in self.inputs.iter() {
            write_string(&mut graph_buf, &input.name);
            graph_buf.push(dtype_code(input.dtype));
            encode_dims(&mut graph_buf, &input.dims);
            write_u64(&mut graph_buf, input.id as u64);
        }
        write_u32(&mut graph_buf, self.outputs.len() as u32);
        for output in self.outputs.iter() {
            write_string(&mut graph_buf, &output.name);
            write_u64(&mut graph_buf, output.id as u64);
        }

        let mut profiles_buf = Vec::new();
        write_u32(&mut profiles_buf, self.profiles.len() as u32);
        for profile in self.profiles.iter() {
            write_string(&mut profiles_buf, profile.input());
            write_u32(&mut profiles_buf, profile.rank() as u32);
            for shape in [profile.min(), profile.opt(), profile.max()] {
                for &size in shape {
                    write_u64(&mut profiles_buf, size as u64);
                }
            }
        }

        let header = Header {
            version: Header::VERSION,
            graph_offset: Header::LEN as u64,
            graph_len: graph_buf.len() as u64,
            profiles_offset: (Header::LEN + graph_buf.len()) as u64,
        };

        let mut blob = header.to_buf();
        blob.extend(graph_buf);
        blob.extend(profiles_buf);
        blob
    }

    /// Restore a plan from a byte blob produced by [`Plan::serialize`].
    pub fn deserialize(blob: &[u8]) -> Result<Plan, PlanLoadError> {
        let header = Header::from_buf(blob)?;

        let graph_segment = &blob[header.graph_offset as usize
            ..(header.graph_offset + header.graph_len) as usize];
        let mut reader = ValueReader::new(graph_segment);

        let graph = decode_graph(&mut reader)?;
        let node_count = graph.len();

        let input_count = read_u32(&mut reader)?;
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let name = read_string(&mut reader)?;
            let dtype = decode_dtype(read_u8(&mut reader)?)?;
            let dims = decode_dims(&mut reader)?;
            let id = read_node_id(&mut reader, node_count)?;
            inputs.push(InputBinding {
                name,
                dtype,
                dims,
                id,
            });
        }

        let output_count = read_u32(&mut reader)?;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            let name = read_string(&mut reader)?;
            let id = read_node_id(&mut reader, node_count)?;
            outputs.push(OutputBinding { name, id });
        }

        let profiles_segment = &blob[header.profiles_offset as usize..];
        let mut reader = ValueReader::new(profiles_segment);
        let profile_count = read_u32(&mut reader)?;
        let mut profiles = Vec::with_capacity(profile_count as usize);
        for _ in 0..profile_count {
            let input = read_string(&mut reader)?;
            let rank = read_u32(&mut reader)? as usize;
            let mut shapes = [Vec::new(), Vec::new(), Vec::new()];
            for shape in shapes.iter_mut() {
                for _ in 0..rank {
                    shape.push(read_u64(&mut reader)? as usize);
                }
            }
            let [min, opt, max] = shapes;
            profiles.push(ShapeProfile::new(&input, min, opt, max));
        }

        let input_ids: Vec<NodeId> = inputs.iter().map(|input| input.id).collect();
        let output_ids: Vec<NodeId> = outputs.iter().map(|output| output.id).collect();
        let order = graph
            .execution_order(&input_ids, &output_ids)
            .map_err(|err| PlanLoadError::Planning(err.to_string()))?;

        Ok(Plan {
            graph,
            inputs,
            outputs,
            profiles,
            order,
        })
    }

    /// Restore a plan from a serialized blob on disk.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Plan, PlanLoadError> {
        let blob = std::fs::read(path).map_err(PlanLoadError::ReadFailed)?;
        Plan::deserialize(&blob)
    }

    /// Restore a plan from a serialized blob on disk, using memory mapping
    /// to avoid reading the whole file up front.
    ///
    /// ## Safety
    ///
    /// The file must not be modified while the plan is being restored.
    #[cfg(feature = "mmap")]
    pub unsafe fn load_file_mmap<P: AsRef<Path>>(path: P) -> Result<Plan, PlanLoadError> {
        let file = std::fs::File::open(path).map_err(PlanLoadError::ReadFailed)?;
        let mmap = memmap2::Mmap::map(&file).map_err(PlanLoadError::ReadFailed)?;
        Plan::deserialize(&mmap)
    }
}

// Node kind tags in the serialized graph.
const TAG_VALUE: u8 = 0;
const TAG_CONSTANT_FLOAT: u8 = 1;
const TAG_CONSTANT_INT: u8 = 2;
const TAG_OPERATOR: u8 = 3;

// Operator codes in the serialized graph.
const OP_SHAPE: u8 = 0;
const OP_ADD: u8 = 1;
const OP_SUB: u8 = 2;
const OP_MUL: u8 = 3;
const OP_DIV: u8 = 4;
const OP_SLICE: u8 = 5;

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend(value.to_le_bytes());
}

fn write_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend(value.to_le_bytes());
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_u32(buf, value.len() as u32);
    buf.extend(value.as_bytes());
}

fn write_opt_string(buf: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(value) => {
            buf.push(1);
            write_string(buf, value);
        }
        None => buf.push(0),
    }
}

fn dtype_code(dtype: DataType) -> u8 {
    match dtype {
        DataType::Float => 0,
        DataType::Int => 1,
    }
}

fn decode_dtype(code: u8) -> Result<DataType, PlanLoadError> {
    match code {
        0 => Ok(DataType::Float),
        1 => Ok(DataType::Int),
        other => Err(PlanLoadError::UnknownTag(other)),
    }
}

fn encode_dims(buf: &mut Vec<u8>, dims: &[Dimension]) {
    write_u32(buf, dims.len() as u32);
    for dim in dims {
        match dim {
            Dimension::Fixed(size) => {
                buf.push(0);
                write_u64(buf, *size as u64);
            }
            Dimension::Symbolic(name) => {
                buf.push(1);
                write_string(buf, name);
            }
        }
    }
}

fn decode_dims(reader: &mut ValueReader) -> Result<Vec<Dimension>, PlanLoadError> {
    let count = read_u32(reader)?;
    let mut dims = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let dim = match read_u8(reader)? {
            0 => Dimension::Fixed(read_u64(reader)? as usize),
            1 => Dimension::Symbolic(read_string(reader)?),
            other => return Err(PlanLoadError::UnknownTag(other)),
        };
        dims.push(dim);
    }
    Ok(dims)
}

fn encode_tensor_f32(buf: &mut Vec<u8>, tensor: &Tensor<f32>) {
    write_u32(buf, tensor.ndim() as u32);
    for &size in tensor.shape() {
        write_u64(buf, size as u64);
    }
    for &value in tensor.data() {
        buf.extend(value.to_le_bytes());
    }
}

fn encode_tensor_i32(buf: &mut Vec<u8>, tensor: &Tensor<i32>) {
    write_u32(buf, tensor.ndim() as u32);
    for &size in tensor.shape() {
        write_u64(buf, size as u64);
    }
    for &value in tensor.data() {
        buf.extend(value.to_le_bytes());
    }
}

fn decode_shape(reader: &mut ValueReader) -> Result<Vec<usize>, PlanLoadError> {
    let ndim = read_u32(reader)?;
    let mut shape = Vec::with_capacity(ndim as usize);
    for _ in 0..ndim {
        shape.push(read_u64(reader)? as usize);
    }
    Ok(shape)
}

/// Encode the nodes of `graph` into `buf`.
fn encode_graph(buf: &mut Vec<u8>, graph: &Graph) {
    write_u32(buf, graph.len() as u32);
    for id in 0..graph.len() {
        let node = graph.get_node(id).expect("node IDs are dense");
        match node {
            Node::Value(_) => {
                buf.push(TAG_VALUE);
                write_opt_string(buf, node.name());
                match node.shape() {
                    Some(dims) => {
                        buf.push(1);
                        encode_dims(buf, &dims);
                    }
                    None => buf.push(0),
                }
            }
            Node::Constant(constant) => {
                match constant {
                    crate::graph::Constant::Float(data) => {
                        buf.push(TAG_CONSTANT_FLOAT);
                        write_opt_string(buf, node.name());
                        encode_tensor_f32(buf, data.data());
                    }
                    crate::graph::Constant::Int(data) => {
                        buf.push(TAG_CONSTANT_INT);
                        write_opt_string(buf, node.name());
                        encode_tensor_i32(buf, data.data());
                    }
                };
            }
            Node::Operator(op_node) => {
                buf.push(TAG_OPERATOR);
                write_opt_string(buf, node.name());
                encode_operator(buf, op_node.operator());
                write_u32(buf, op_node.inputs().len() as u32);
                for &input in op_node.inputs() {
                    write_u64(buf, input as u64);
                }
                write_u32(buf, op_node.outputs().len() as u32);
                for &output in op_node.outputs() {
                    write_u64(buf, output as u64);
                }
            }
        }
    }
}

fn encode_operator(buf: &mut Vec<u8>, op: &dyn Operator) {
    if op.downcast_ref::<Shape>().is_some() {
        buf.push(OP_SHAPE);
    } else if op.downcast_ref::<Add>().is_some() {
        buf.push(OP_ADD);
    } else if op.downcast_ref::<Sub>().is_some() {
        buf.push(OP_SUB);
    } else if op.downcast_ref::<Mul>().is_some() {
        buf.push(OP_MUL);
    } else if op.downcast_ref::<Div>().is_some() {
        buf.push(OP_DIV);
    } else if let Some(slice) = op.downcast_ref::<Slice>() {
        buf.push(OP_SLICE);
        write_u32(buf, slice.starts.len() as u32);
        for &start in slice.starts.iter() {
            write_u64(buf, start as u64);
        }
        for &stride in slice.strides.iter() {
            write_u64(buf, stride as u64);
        }
    } else {
        // `NetworkBuilder` only constructs the operators above, so a plan
        // containing anything else indicates a bug in the caller.
        panic!("cannot serialize operator {}", op.name());
    }
}

fn decode_operator(reader: &mut ValueReader) -> Result<Box<dyn Operator>, PlanLoadError> {
    let op: Box<dyn Operator> = match read_u8(reader)? {
        OP_SHAPE => Box::new(Shape {}),
        OP_ADD => Box::new(Add {}),
        OP_SUB => Box::new(Sub {}),
        OP_MUL => Box::new(Mul {}),
        OP_DIV => Box::new(Div {}),
        OP_SLICE => {
            let rank = read_u32(reader)? as usize;
            let mut starts = Vec::with_capacity(rank);
            for _ in 0..rank {
                starts.push(read_u64(reader)? as usize);
            }
            let mut strides = Vec::with_capacity(rank);
            for _ in 0..rank {
                strides.push(read_u64(reader)? as usize);
            }
            Box::new(Slice { starts, strides })
        }
        other => return Err(PlanLoadError::UnknownOperator(other)),
    };
    Ok(op)
}

fn decode_graph(reader: &mut ValueReader) -> Result<Graph, PlanLoadError> {
    let node_count = read_u32(reader)? as usize;
    let mut graph = Graph::new();

    for _ in 0..node_count {
        let tag = read_u8(reader)?;
        let name = read_opt_string(reader)?;
        let name = name.as_deref();
        match tag {
            TAG_VALUE => {
                let shape = match read_u8(reader)? {
                    0 => None,
                    1 => Some(decode_dims(reader)?),
                    other => return Err(PlanLoadError::UnknownTag(other)),
                };
                graph.add_value(name, shape);
            }
            TAG_CONSTANT_FLOAT => {
                let shape = decode_shape(reader)?;
                let len = shape.iter().product();
                let mut data = Vec::with_capacity(len);
                for _ in 0..len {
                    let bytes = reader.read_n::<4>().ok_or(PlanLoadError::UnexpectedEof)?;
                    data.push(f32::from_le_bytes(bytes));
                }
                graph.add_constant(name, Tensor::from_data(&shape, data));
            }
            TAG_CONSTANT_INT => {
                let shape = decode_shape(reader)?;
                let len = shape.iter().product();
                let mut data = Vec::with_capacity(len);
                for _ in 0..len {
                    let bytes = reader.read_n::<4>().ok_or(PlanLoadError::UnexpectedEof)?;
                    data.push(i32::from_le_bytes(bytes));
                }
                graph.add_constant(name, Tensor::from_data(&shape, data));
            }
            TAG_OPERATOR => {
                let op = decode_operator(reader)?;
                let input_count = read_u32(reader)? as usize;
                let mut inputs = Vec::with_capacity(input_count);
                for _ in 0..input_count {
                    inputs.push(read_node_id(reader, node_count)?);
                }
                let output_count = read_u32(reader)? as usize;
                let mut outputs = Vec::with_capacity(output_count);
                for _ in 0..output_count {
                    outputs.push(read_node_id(reader, node_count)?);
                }
                graph.add_op(name, op, &inputs, &outputs);
            }
            other => return Err(PlanLoadError::UnknownTag(other)),
        }
    }

    Ok(graph)
}

fn read_u8(reader: &mut ValueReader) -> Result<u8, PlanLoadError> {
    reader.read::<u8>().ok_or(PlanLoadError::UnexpectedEof)
}

fn read_u32(reader: &mut ValueReader) -> Result<u32, PlanLoadError> {
    reader.read::<u32>().ok_or(PlanLoadError::UnexpectedEof)
}

fn read_u64(reader: &mut ValueReader) -> Result<u64, PlanLoadError> {
    reader.read::<u64>().ok_or(PlanLoadError::UnexpectedEof)
}

fn read_node_id(reader: &mut ValueReader, node_count: usize) -> Result<NodeId, PlanLoadError> {
    let id = read_u64(reader)? as usize;
    if id >= node_count {
        return Err(PlanLoadError::InvalidGraph("node ID out of range"));
    }
    Ok(id)
}

fn read_string(reader: &mut ValueReader) -> Result<String, PlanLoadError> {
    let len = read_u32(reader)? as usize;
    let bytes = reader
        .read_slice(len)
        .ok_or(PlanLoadError::UnexpectedEof)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| PlanLoadError::InvalidString)
}

fn read_opt_string(reader: &mut ValueReader) -> Result<Option<String>, PlanLoadError> {
    match read_u8(reader)? {
        0 => Ok(None),
        1 => Ok(Some(read_string(reader)?)),
        other => Err(PlanLoadError::UnknownTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::{CompileError, Plan, PlanLoadError};
    use crate::builder::{ElementwiseOp, Network, NetworkBuilder, SliceSize};
    use crate::graph::Dimension;
    use crate::ops::DataType;
    use crate::profile::{ProfileError, ShapeProfile};
    use crate::tensor::Tensor;

    /// Build the shape-driven slice network over a rank 4 dynamic input.
    fn build_network() -> Network {
        let mut builder = NetworkBuilder::new();
        let dims: Vec<Dimension> = (0..4)
            .map(|dim| Dimension::Symbolic(format!("d{}", dim)))
            .collect();
        let input = builder.add_input("input", DataType::Float, &dims).unwrap();
        let adjust = builder.add_constant(Tensor::from_vec(vec![0i32, 1, 1, 1]));
        let shape = builder.add_shape(input).unwrap();
        let sizes = builder
            .add_elementwise(ElementwiseOp::Sub, shape, adjust)
            .unwrap();
        let sliced = builder
            .add_slice(input, &[0, 1, 1, 1], SliceSize::FromNode(sizes), &[1, 1, 1, 1])
            .unwrap();
        builder.mark_output(sliced).unwrap();
        builder.finish().unwrap()
    }

    fn demo_profile() -> ShapeProfile {
        ShapeProfile::new(
            "input",
            vec![1, 1, 1, 1],
            vec![1, 3, 4, 5],
            vec![2, 6, 8, 10],
        )
    }

    #[test]
    fn test_compile() {
        let plan = Plan::compile(build_network(), vec![demo_profile()]).unwrap();
        assert_eq!(plan.inputs().len(), 1);
        assert_eq!(plan.outputs().len(), 1);
        assert!(plan.profile_for("input").is_some());
    }

    #[test]
    fn test_compile_missing_profile() {
        let result = Plan::compile(build_network(), Vec::new());
        assert_eq!(
            result.err(),
            Some(CompileError::MissingProfile("input".to_string()))
        );
    }

    #[test]
    fn test_compile_invalid_profile() {
        // min > max in one dimension. Compilation fails and no plan exists.
        let profile = ShapeProfile::new(
            "input",
            vec![1, 1, 9, 1],
            vec![1, 3, 4, 5],
            vec![2, 6, 8, 10],
        );
        let result = Plan::compile(build_network(), vec![profile]);
        assert_eq!(
            result.err(),
            Some(CompileError::InvalidProfile {
                input: "input".to_string(),
                error: ProfileError::OrderViolated { dim: 2 },
            })
        );
    }

    #[test]
    fn test_compile_profile_rank_mismatch() {
        let profile = ShapeProfile::new("input", vec![1], vec![3], vec![6]);
        let result = Plan::compile(build_network(), vec![profile]);
        assert_eq!(
            result.err(),
            Some(CompileError::ProfileRankMismatch {
                input: "input".to_string(),
                expected: 4,
                actual: 1,
            })
        );
    }

    #[test]
    fn test_compile_unknown_profile_input() {
        let profile = ShapeProfile::new("missing", vec![1], vec![1], vec![1]);
        let result = Plan::compile(build_network(), vec![demo_profile(), profile]);
        assert_eq!(
            result.err(),
            Some(CompileError::UnknownProfileInput("missing".to_string()))
        );
    }

    #[test]
    fn test_serialize_round_trip() {
        let plan = Plan::compile(build_network(), vec![demo_profile()]).unwrap();
        let blob = plan.serialize();

        let restored = Plan::deserialize(&blob).unwrap();

        // The restored plan re-serializes to the identical blob.
        assert_eq!(restored.serialize(), blob);
        assert_eq!(restored.profiles(), plan.profiles());
        assert_eq!(restored.order(), plan.order());

        // Both plans produce bit-identical results for the same input.
        let input = Tensor::from_data(&[1, 2, 2, 2], (0..8).map(|x| x as f32 * 0.5).collect());
        let input_id = plan.inputs()[0].id;
        let output_id = plan.outputs()[0].id;
        let original_out = plan
            .graph()
            .run_order(plan.order(), &[(input_id, (&input).into())], &[output_id], None)
            .unwrap();
        let restored_out = restored
            .graph()
            .run_order(
                restored.order(),
                &[(restored.inputs()[0].id, (&input).into())],
                &[restored.outputs()[0].id],
                None,
            )
            .unwrap();

        let original = original_out[0].as_float_ref().unwrap();
        let restored = restored_out[0].as_float_ref().unwrap();
        assert_eq!(original.shape(), restored.shape());
        let original_bits: Vec<u32> = original.iter().map(|v| v.to_bits()).collect();
        let restored_bits: Vec<u32> = restored.iter().map(|v| v.to_bits()).collect();
        assert_eq!(original_bits, restored_bits);
    }

    #[test]
    fn test_deserialize_invalid_blob() {
        let result = Plan::deserialize(b"not a serialized plan at all");
        assert!(matches!(result.err(), Some(PlanLoadError::Header(_))));
    }

    #[test]
    fn test_deserialize_truncated_blob() {
        let plan = Plan::compile(build_network(), vec![demo_profile()]).unwrap();
        let mut blob = plan.serialize();

        // Drop the profile segment but leave the header intact. The declared
        // profile offset now points at the end of the blob.
        blob.truncate(blob.len() - 8);
        let result = Plan::deserialize(&blob);
        assert!(result.is_err());
    }
}
