use std::fmt::Debug;
use std::iter::repeat;

use smallvec::SmallVec;

use crate::ops::{InputList, IntoOpResult, OpError, Operator, OutputList, ShapeInfo};
use crate::tensor::{IndexIterator, Tensor};

/// Given the shapes of two inputs to a binary operation, return the shape
/// that will result from broadcasting them following NumPy rules or `None`
/// if the shapes are not compatible.
///
/// Broadcasting works by left-padding the input shapes with 1s so they are
/// the same length, then matching dimensions starting from the right. For
/// each dimension, the values are compatible if they are the same or one of
/// them is 1. The larger of the two values is the size of that dimension in
/// the output shape.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<SmallVec<[usize; 4]>> {
    let a_pad = b.len().saturating_sub(a.len());
    let b_pad = a.len().saturating_sub(b.len());

    let a_iter = a.iter().copied().rev().chain(repeat(1).take(a_pad));
    let b_iter = b.iter().copied().rev().chain(repeat(1).take(b_pad));

    let mut result = SmallVec::with_capacity(a.len().max(b.len()));
    for (a, b) in a_iter.zip(b_iter) {
        if a == b {
            result.push(a);
        } else if a == 1 {
            result.push(b);
        } else if b == 1 {
            result.push(a);
        } else {
            return None;
        }
    }
    result.reverse();

    Some(result)
}

/// Compute the result of applying the binary operation `op` to corresponding
/// elements of `a` and `b`. The shapes of `a` and `b` are broadcast to a
/// matching shape if necessary.
fn binary_op<T: Copy + Debug, F: Fn(T, T) -> T>(
    a: &Tensor<T>,
    b: &Tensor<T>,
    op: F,
) -> Result<Tensor<T>, OpError> {
    let out_shape = broadcast_shapes(a.shape(), b.shape())
        .ok_or(OpError::IncompatibleInputShapes("cannot broadcast inputs"))?;

    let mut out_data = Vec::with_capacity(out_shape.iter().product());
    let mut indices = IndexIterator::from_shape(&out_shape);
    while let Some(index) = indices.next() {
        let a_elt = a.data()[a.broadcast_offset(index)];
        let b_elt = b.data()[b.broadcast_offset(index)];
        out_data.push(op(a_elt, b_elt));
    }
    Ok(Tensor::from_data(&out_shape, out_data))
}

/// Perform elementwise addition of two tensors.
pub fn add<T: Copy + Debug + std::ops::Add<Output = T>>(
    a: &Tensor<T>,
    b: &Tensor<T>,
) -> Result<Tensor<T>, OpError> {
    binary_op(a, b, |x, y| x + y)
}

/// Perform elementwise subtraction of two tensors.
pub fn sub<T: Copy + Debug + std::ops::Sub<Output = T>>(
    a: &Tensor<T>,
    b: &Tensor<T>,
) -> Result<Tensor<T>, OpError> {
    binary_op(a, b, |x, y| x - y)
}

/// Perform elementwise multiplication of two tensors.
pub fn mul<T: Copy + Debug + std::ops::Mul<Output = T>>(
    a: &Tensor<T>,
    b: &Tensor<T>,
) -> Result<Tensor<T>, OpError> {
    binary_op(a, b, |x, y| x * y)
}

/// Perform elementwise division of two tensors.
pub fn div<T: Copy + Debug + std::ops::Div<Output = T>>(
    a: &Tensor<T>,
    b: &Tensor<T>,
) -> Result<Tensor<T>, OpError> {
    binary_op(a, b, |x, y| x / y)
}

/// Resolve the output shape of a broadcasting binary operator and, if both
/// input values are known ahead of execution, its output value.
fn resolve_binary(
    inputs: &[ShapeInfo],
    op: fn(i32, i32) -> i32,
) -> Result<Vec<ShapeInfo>, OpError> {
    let [a, b] = inputs else {
        return Err(OpError::MissingInputs);
    };
    let out_shape = broadcast_shapes(a.dims(), b.dims())
        .ok_or(OpError::IncompatibleInputShapes("cannot broadcast inputs"))?;

    let info = match (a.value(), b.value()) {
        (Some(a_val), Some(b_val)) => ShapeInfo::with_value(binary_op(a_val, b_val, op)?),
        _ => ShapeInfo::from_dims(&out_shape),
    };
    Ok(vec![info])
}

macro_rules! binary_operator {
    ($struct_name:ident, $func:ident, $op:tt) => {
        #[derive(Debug)]
        pub struct $struct_name {}

        impl Operator for $struct_name {
            fn name(&self) -> &str {
                stringify!($struct_name)
            }

            fn run(&self, inputs: InputList) -> Result<OutputList, OpError> {
                use crate::ops::Input;
                let a = inputs.require(0)?;
                let b = inputs.require(1)?;
                match (a, b) {
                    (Input::FloatTensor(a), Input::FloatTensor(b)) => {
                        $func(a, b).into_op_result()
                    }
                    (Input::IntTensor(a), Input::IntTensor(b)) => $func(a, b).into_op_result(),
                    _ => Err(OpError::InvalidValue("inputs must have matching types")),
                }
            }

            fn resolve_shapes(&self, inputs: &[ShapeInfo]) -> Result<Vec<ShapeInfo>, OpError> {
                resolve_binary(inputs, |x, y| x $op y)
            }
        }
    };
}

binary_operator!(Add, add, +);
binary_operator!(Sub, sub, -);
binary_operator!(Mul, mul, *);
binary_operator!(Div, div, /);
