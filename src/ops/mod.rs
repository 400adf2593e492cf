use std::any::Any;
use std::error::Error;
use std::fmt;
use std::fmt::Debug;

use smallvec::SmallVec;

use crate::tensor::Tensor;

mod binary_elementwise;
mod layout;
mod slice;

pub use binary_elementwise::{add, broadcast_shapes, div, mul, sub, Add, Div, Mul, Sub};
pub use layout::{shape_of, Shape};
pub use slice::{slice, Slice};

/// Element types supported by the runtime.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataType {
    Float,
    Int,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Float => write!(f, "f32"),
            DataType::Int => write!(f, "i32"),
        }
    }
}

/// Enum of the different types of input tensor that an operator can accept.
#[derive(Clone, Copy)]
pub enum Input<'a> {
    FloatTensor(&'a Tensor<f32>),
    IntTensor(&'a Tensor<i32>),
}

impl<'a> Input<'a> {
    pub fn shape(&self) -> &'a [usize] {
        match self {
            Input::FloatTensor(t) => t.shape(),
            Input::IntTensor(t) => t.shape(),
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Input::FloatTensor(_) => DataType::Float,
            Input::IntTensor(_) => DataType::Int,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Input::FloatTensor(t) => t.len(),
            Input::IntTensor(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_float(&self) -> Option<&'a Tensor<f32>> {
        if let Input::FloatTensor(t) = self {
            Some(t)
        } else {
            None
        }
    }

    pub fn as_int(&self) -> Option<&'a Tensor<i32>> {
        if let Input::IntTensor(t) = self {
            Some(t)
        } else {
            None
        }
    }
}

impl<'a> From<&'a Tensor<f32>> for Input<'a> {
    fn from(t: &'a Tensor<f32>) -> Input<'a> {
        Input::FloatTensor(t)
    }
}

impl<'a> From<&'a Tensor<i32>> for Input<'a> {
    fn from(t: &'a Tensor<i32>) -> Input<'a> {
        Input::IntTensor(t)
    }
}

impl<'a> From<&'a Output> for Input<'a> {
    fn from(out: &'a Output) -> Input<'a> {
        match out {
            Output::FloatTensor(t) => Input::FloatTensor(t),
            Output::IntTensor(t) => Input::IntTensor(t),
        }
    }
}

/// Enum of the different types of output tensor that an operator can produce.
#[derive(Clone, Debug, PartialEq)]
pub enum Output {
    FloatTensor(Tensor<f32>),
    IntTensor(Tensor<i32>),
}

impl Output {
    pub fn shape(&self) -> &[usize] {
        match self {
            Output::FloatTensor(t) => t.shape(),
            Output::IntTensor(t) => t.shape(),
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Output::FloatTensor(_) => DataType::Float,
            Output::IntTensor(_) => DataType::Int,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Output::FloatTensor(t) => t.len(),
            Output::IntTensor(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_float(self) -> Option<Tensor<f32>> {
        if let Output::FloatTensor(t) = self {
            Some(t)
        } else {
            None
        }
    }

    pub fn as_float_ref(&self) -> Option<&Tensor<f32>> {
        if let Output::FloatTensor(t) = self {
            Some(t)
        } else {
            None
        }
    }

    pub fn as_int(self) -> Option<Tensor<i32>> {
        if let Output::IntTensor(t) = self {
            Some(t)
        } else {
            None
        }
    }

    pub fn as_int_ref(&self) -> Option<&Tensor<i32>> {
        if let Output::IntTensor(t) = self {
            Some(t)
        } else {
            None
        }
    }
}

impl From<Tensor<f32>> for Output {
    fn from(t: Tensor<f32>) -> Output {
        Output::FloatTensor(t)
    }
}

impl From<Tensor<i32>> for Output {
    fn from(t: Tensor<i32>) -> Output {
        Output::IntTensor(t)
    }
}

/// Possible reasons why an operator may fail on a given input.
#[derive(Eq, PartialEq, Debug)]
pub enum OpError {
    /// Input tensor shapes are not compatible with each other or with the
    /// operator's attributes.
    IncompatibleInputShapes(&'static str),

    /// The number of inputs was less than the required number.
    MissingInputs,

    /// An input has a value that is incorrect.
    InvalidValue(&'static str),

    /// An input did not have the element type the operator expects.
    WrongInputType {
        index: usize,
        expected: DataType,
    },

    /// An input's value is needed to resolve output shapes but is not
    /// available before execution.
    UnresolvedValue(&'static str),
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::IncompatibleInputShapes(details) => {
                write!(f, "incompatible input shapes: {}", details)
            }
            OpError::MissingInputs => write!(f, "required inputs were missing"),
            OpError::InvalidValue(details) => {
                write!(f, "input or attribute has invalid value: {}", details)
            }
            OpError::WrongInputType { index, expected } => {
                write!(f, "input {} must be a {} tensor", index, expected)
            }
            OpError::UnresolvedValue(details) => {
                write!(f, "value is not resolvable ahead of execution: {}", details)
            }
        }
    }
}

impl Error for OpError {}

/// List of inputs for an operator evaluation, with accessors that produce
/// appropriate errors if inputs are missing or of the wrong type.
pub struct InputList<'a> {
    inputs: Vec<Input<'a>>,
}

impl<'a> InputList<'a> {
    pub fn from(inputs: &[Input<'a>]) -> InputList<'a> {
        InputList {
            inputs: inputs.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Get an optional input.
    pub fn get(&self, index: usize) -> Option<Input<'a>> {
        self.inputs.get(index).copied()
    }

    /// Get a required operator input.
    pub fn require(&self, index: usize) -> Result<Input<'a>, OpError> {
        self.get(index).ok_or(OpError::MissingInputs)
    }

    /// Get a required input which must be a float tensor.
    pub fn require_float(&self, index: usize) -> Result<&'a Tensor<f32>, OpError> {
        self.require(index)?
            .as_float()
            .ok_or(OpError::WrongInputType {
                index,
                expected: DataType::Float,
            })
    }

    /// Get a required input which must be an int tensor.
    pub fn require_int(&self, index: usize) -> Result<&'a Tensor<i32>, OpError> {
        self.require(index)?
            .as_int()
            .ok_or(OpError::WrongInputType {
                index,
                expected: DataType::Int,
            })
    }
}

/// Outputs from an operator.
///
/// This avoids allocations in the common case where an operator produces
/// exactly one output.
pub type OutputList = SmallVec<[Output; 1]>;

/// Trait for values that can be converted into the result type used by
/// [`Operator::run`].
pub trait IntoOpResult {
    fn into_op_result(self) -> Result<OutputList, OpError>;
}

impl IntoOpResult for Output {
    fn into_op_result(self) -> Result<OutputList, OpError> {
        Ok([self].into())
    }
}

impl<T> IntoOpResult for Tensor<T>
where
    Output: From<Tensor<T>>,
{
    fn into_op_result(self) -> Result<OutputList, OpError> {
        Ok([self.into()].into())
    }
}

impl<T> IntoOpResult for Result<Tensor<T>, OpError>
where
    Output: From<Tensor<T>>,
{
    fn into_op_result(self) -> Result<OutputList, OpError> {
        self.map(|tensor| [tensor.into()].into())
    }
}

/// Shape information about one operator input or output, available before
/// any buffer for it exists.
///
/// The concrete extents are always known once the runtime shapes of the graph
/// inputs have been fixed. For integer tensors that carry shapes (such as the
/// output of [`Shape`]) the element values themselves may also be computable
/// ahead of execution, which is what allows operators whose *output shape* is
/// data-dependent to be sized before they run.
#[derive(Clone, Debug, PartialEq)]
pub struct ShapeInfo {
    dims: Vec<usize>,
    value: Option<Tensor<i32>>,
}

impl ShapeInfo {
    /// Construct shape information with known extents and unknown contents.
    pub fn from_dims(dims: &[usize]) -> ShapeInfo {
        ShapeInfo {
            dims: dims.to_vec(),
            value: None,
        }
    }

    /// Construct shape information for an int tensor whose contents are also
    /// known ahead of execution.
    pub fn with_value(value: Tensor<i32>) -> ShapeInfo {
        ShapeInfo {
            dims: value.shape().to_vec(),
            value: Some(value),
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn value(&self) -> Option<&Tensor<i32>> {
        self.value.as_ref()
    }
}

/// An Operator performs a computation step when executing a data flow graph.
///
/// Operators take one or more dynamic input values plus a set of static
/// attributes, and produce one or more output values.
pub trait Operator: Any + Debug {
    /// Return a display name for the operator.
    fn name(&self) -> &str;

    /// Execute the operator with the given inputs.
    fn run(&self, inputs: InputList) -> Result<OutputList, OpError>;

    /// Resolve the shapes of this operator's outputs given shape information
    /// about its inputs, without executing it.
    ///
    /// Operators whose outputs carry shape data (eg. [`Shape`]) also resolve
    /// the output *values* so that downstream shape-dependent operators can
    /// be sized before execution.
    fn resolve_shapes(&self, inputs: &[ShapeInfo]) -> Result<Vec<ShapeInfo>, OpError>;
}

impl dyn Operator {
    /// Downcast this operator to a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::{DataType, Input, InputList, OpError, Operator};
    use crate::ops::{Add, Sub};
    use crate::tensor::Tensor;

    #[test]
    fn test_input_list_require() {
        let floats = Tensor::zeros(&[2, 2]);
        let ints = Tensor::from_vec(vec![1i32, 2]);
        let inputs = InputList::from(&[(&floats).into(), (&ints).into()]);

        assert!(inputs.require(0).is_ok());
        assert_eq!(inputs.require(2).err(), Some(OpError::MissingInputs));
        assert!(inputs.require_float(0).is_ok());
        assert_eq!(
            inputs.require_float(1).err(),
            Some(OpError::WrongInputType {
                index: 1,
                expected: DataType::Float
            })
        );
        assert!(inputs.require_int(1).is_ok());
    }

    #[test]
    fn test_input_dtype() {
        let floats = Tensor::zeros(&[1]);
        let input: Input = (&floats).into();
        assert_eq!(input.dtype(), DataType::Float);
    }

    #[test]
    fn test_downcast_operator() {
        let add_op = Add {};
        let sub_op = Sub {};

        let add_op_dyn: &dyn Operator = &add_op;
        let sub_op_dyn: &dyn Operator = &sub_op;

        assert!(add_op_dyn.downcast_ref::<Add>().is_some());
        assert!(sub_op_dyn.downcast_ref::<Sub>().is_some());
    }
}
