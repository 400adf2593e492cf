use crate::ops::{InputList, IntoOpResult, OpError, Operator, OutputList, ShapeInfo};
use crate::tensor::{IndexIterator, Tensor};

/// Validate slice parameters against an input shape and convert the sizes
/// tensor into output extents.
fn slice_extents(
    input_shape: &[usize],
    starts: &[usize],
    sizes: &Tensor<i32>,
    strides: &[usize],
) -> Result<Vec<usize>, OpError> {
    if sizes.ndim() != 1 {
        return Err(OpError::InvalidValue("`sizes` must be a vector"));
    }
    if starts.len() != input_shape.len()
        || strides.len() != input_shape.len()
        || sizes.len() != input_shape.len()
    {
        return Err(OpError::IncompatibleInputShapes(
            "slice parameters must have one entry per input dim",
        ));
    }
    if strides.iter().any(|&stride| stride == 0) {
        return Err(OpError::InvalidValue("strides must be non-zero"));
    }

    let mut extents = Vec::with_capacity(input_shape.len());
    for (dim, &size) in sizes.iter().enumerate() {
        if size < 0 {
            return Err(OpError::InvalidValue("sizes must be non-negative"));
        }
        let size = size as usize;
        if size > 0 {
            let last = starts[dim] + (size - 1) * strides[dim];
            if last >= input_shape[dim] {
                return Err(OpError::IncompatibleInputShapes(
                    "slice extends past end of input dim",
                ));
            }
        }
        extents.push(size);
    }
    Ok(extents)
}

/// Copy a strided region out of `input`.
///
/// The region starts at `starts`, takes `sizes` elements along each dimension
/// and advances by `strides` elements between them. Unlike a range-based
/// slice, the extent of the output is given directly by `sizes`, which lets
/// the caller supply extents computed at runtime.
pub fn slice<T: Copy + std::fmt::Debug>(
    input: &Tensor<T>,
    starts: &[usize],
    sizes: &Tensor<i32>,
    strides: &[usize],
) -> Result<Tensor<T>, OpError> {
    let out_shape = slice_extents(input.shape(), starts, sizes, strides)?;

    let mut out_data = Vec::with_capacity(out_shape.iter().product());
    let mut indices = IndexIterator::from_shape(&out_shape);
    let mut in_index = vec![0; input.ndim()];
    while let Some(index) = indices.next() {
        for dim in 0..in_index.len() {
            in_index[dim] = starts[dim] + index[dim] * strides[dim];
        }
        out_data.push(input[&in_index[..]]);
    }
    Ok(Tensor::from_data(&out_shape, out_data))
}

/// Operator which extracts a strided sub-region of its first input.
///
/// Start offsets and strides are static attributes. The per-dimension output
/// sizes are the operator's second input, so they can be produced by other
/// nodes in the graph at runtime. A graph builder that knows the sizes at
/// build time wires a constant node into that input instead.
#[derive(Debug, PartialEq)]
pub struct Slice {
    pub starts: Vec<usize>,
    pub strides: Vec<usize>,
}

impl Operator for Slice {
    fn name(&self) -> &str {
        "Slice"
    }

    fn run(&self, inputs: InputList) -> Result<OutputList, OpError> {
        use crate::ops::Input;
        let input = inputs.require(0)?;
        let sizes = inputs.require_int(1)?;

        match input {
            Input::FloatTensor(input) => {
                slice(input, &self.starts, sizes, &self.strides).into_op_result()
            }
            Input::IntTensor(input) => {
                slice(input, &self.starts, sizes, &self.strides).into_op_result()
            }
        }
    }

    fn resolve_shapes(&self, inputs: &[ShapeInfo]) -> Result<Vec<ShapeInfo>, OpError> {
        let [input, sizes] = inputs else {
            return Err(OpError::MissingInputs);
        };
        let Some(sizes) = sizes.value() else {
            return Err(OpError::UnresolvedValue("slice sizes"));
        };
        let extents = slice_extents(input.dims(), &self.starts, sizes, &self.strides)?;
        Ok(vec![ShapeInfo::from_dims(&extents)])
    }
}

#[cfg(test)]
mod tests {
    use super::slice;
    use crate::ops::{InputList, OpError, Operator, ShapeInfo, Slice};
    use crate::tensor::Tensor;

    fn sequence_tensor(shape: &[usize]) -> Tensor<i32> {
        let len = shape.iter().product::<usize>() as i32;
        Tensor::from_data(shape, (0..len).collect())
    }

    #[test]
    fn test_slice_drop_first_along_trailing_dims() {
        let input = sequence_tensor(&[2, 3, 4]);
        let sizes = Tensor::from_vec(vec![2, 2, 3]);
        let result = slice(&input, &[0, 1, 1], &sizes, &[1, 1, 1]).unwrap();

        assert_eq!(result.shape(), &[2, 2, 3]);
        for b in 0..2 {
            for h in 0..2 {
                for w in 0..3 {
                    assert_eq!(result[[b, h, w]], input[[b, h + 1, w + 1]]);
                }
            }
        }
    }

    #[test]
    fn test_slice_with_stride() {
        let input = sequence_tensor(&[6]);
        let sizes = Tensor::from_vec(vec![3]);
        let result = slice(&input, &[0], &sizes, &[2]).unwrap();
        assert_eq!(result.shape(), &[3]);
        assert_eq!(result.data(), &[0, 2, 4]);
    }

    #[test]
    fn test_slice_empty_output() {
        let input = sequence_tensor(&[4]);
        let sizes = Tensor::from_vec(vec![0]);
        let result = slice(&input, &[0], &sizes, &[1]).unwrap();
        assert_eq!(result.shape(), &[0]);
        assert!(result.is_empty());
    }

    #[test]
    fn test_slice_invalid_params() {
        struct Case {
            starts: Vec<usize>,
            sizes: Vec<i32>,
            strides: Vec<usize>,
            expected: OpError,
        }

        let cases = [
            Case {
                starts: vec![0, 0],
                sizes: vec![2, 2, 2],
                strides: vec![1, 1, 1],
                expected: OpError::IncompatibleInputShapes(
                    "slice parameters must have one entry per input dim",
                ),
            },
            Case {
                starts: vec![0, 0, 0],
                sizes: vec![2, 2, -1],
                strides: vec![1, 1, 1],
                expected: OpError::InvalidValue("sizes must be non-negative"),
            },
            Case {
                starts: vec![0, 2, 0],
                sizes: vec![2, 2, 2],
                strides: vec![1, 1, 1],
                expected: OpError::IncompatibleInputShapes("slice extends past end of input dim"),
            },
            Case {
                starts: vec![0, 0, 0],
                sizes: vec![2, 2, 2],
                strides: vec![1, 0, 1],
                expected: OpError::InvalidValue("strides must be non-zero"),
            },
        ];

        let input = sequence_tensor(&[2, 3, 4]);
        for case in cases {
            let sizes = Tensor::from_vec(case.sizes.clone());
            let result = slice(&input, &case.starts, &sizes, &case.strides);
            assert_eq!(result.err(), Some(case.expected));
        }
    }

    #[test]
    fn test_slice_op_requires_int_sizes() {
        let input = sequence_tensor(&[4]);
        let sizes = Tensor::<f32>::zeros(&[1]);
        let op = Slice {
            starts: vec![0],
            strides: vec![1],
        };
        let result = op.run(InputList::from(&[(&input).into(), (&sizes).into()]));
        assert!(matches!(
            result.err(),
            Some(OpError::WrongInputType { index: 1, .. })
        ));
    }

    #[test]
    fn test_resolve_shapes_requires_sizes_value() {
        let op = Slice {
            starts: vec![0, 0],
            strides: vec![1, 1],
        };
        let input = ShapeInfo::from_dims(&[3, 4]);

        // Sizes with a known value resolve the output extents.
        let sizes = ShapeInfo::with_value(Tensor::from_vec(vec![2, 2]));
        let resolved = op.resolve_shapes(&[input.clone(), sizes]).unwrap();
        assert_eq!(resolved[0].dims(), &[2, 2]);

        // Sizes of known shape but unknown value cannot size the output.
        let sizes = ShapeInfo::from_dims(&[2]);
        let result = op.resolve_shapes(&[input, sizes]);
        assert_eq!(result.err(), Some(OpError::UnresolvedValue("slice sizes")));
    }
}
