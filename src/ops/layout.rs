use crate::ops::{Input, InputList, IntoOpResult, OpError, Operator, OutputList, ShapeInfo};
use crate::tensor::Tensor;

/// Return a 1-D int tensor containing the runtime shape of `input`.
pub fn shape_of(input: Input) -> Tensor<i32> {
    Tensor::from_vec(input.shape().iter().map(|&size| size as i32).collect())
}

/// Operator which queries the runtime shape of its operand.
///
/// This is the escape hatch that makes shape-dependent computation possible
/// under dynamic shapes: the operand's declared shape may contain unknown
/// extents, but its runtime shape is always concrete.
#[derive(Debug)]
pub struct Shape {}

impl Operator for Shape {
    fn name(&self) -> &str {
        "Shape"
    }

    fn run(&self, inputs: InputList) -> Result<OutputList, OpError> {
        let input = inputs.require(0)?;
        shape_of(input).into_op_result()
    }

    fn resolve_shapes(&self, inputs: &[ShapeInfo]) -> Result<Vec<ShapeInfo>, OpError> {
        let [input] = inputs else {
            return Err(OpError::MissingInputs);
        };
        let dims = Tensor::from_vec(input.dims().iter().map(|&size| size as i32).collect());
        Ok(vec![ShapeInfo::with_value(dims)])
    }
}

#[cfg(test)]
mod tests {
    use crate::ops::{InputList, Operator, Shape, ShapeInfo};
    use crate::tensor::Tensor;

    #[test]
    fn test_shape() {
        let input = Tensor::<f32>::zeros(&[1, 3, 4, 5]);
        let op = Shape {};
        let mut result = op.run(InputList::from(&[(&input).into()])).unwrap();
        let shape = result.remove(0).as_int().unwrap();
        assert_eq!(shape.shape(), &[4]);
        assert_eq!(shape.data(), &[1, 3, 4, 5]);
    }

    #[test]
    fn test_shape_resolve() {
        // The output value is known as soon as the operand's shape is known,
        // even though no operand buffer exists yet.
        let op = Shape {};
        let resolved = op
            .resolve_shapes(&[ShapeInfo::from_dims(&[1, 3, 4, 5])])
            .unwrap();
        assert_eq!(resolved[0].dims(), &[4]);
        assert_eq!(
            resolved[0].value().map(|v| v.data().to_vec()),
            Some(vec![1, 3, 4, 5])
        );
    }
}
