use rustc_hash::FxHashMap;

use crate::device::{Device, DeviceBuffer};
use crate::graph::{Dimension, NodeId, RunError, RunOptions};
use crate::ops::{Input, Output, ShapeInfo};
use crate::plan::Plan;
use crate::tensor::Tensor;

impl Plan {
    /// Create an execution context that runs this plan on `device`.
    pub fn create_context(&self, device: Device) -> ExecutionContext<'_> {
        ExecutionContext::new(self, device)
    }
}

/// Binds a compiled [`Plan`] to one concrete input shape at a time and runs
/// it.
///
/// The context owns device buffers only for the duration of one [`run`]
/// call: buffers for all bindings are allocated after the concrete shapes
/// are known, and released before `run` returns, on success and on failure
/// alike. Between runs a different in-range shape can be bound to the same
/// context.
///
/// [`run`]: ExecutionContext::run
pub struct ExecutionContext<'p> {
    plan: &'p Plan,
    device: Device,
    input_shapes: FxHashMap<String, Vec<usize>>,
}

impl<'p> ExecutionContext<'p> {
    pub fn new(plan: &'p Plan, device: Device) -> ExecutionContext<'p> {
        ExecutionContext {
            plan,
            device,
            input_shapes: FxHashMap::default(),
        }
    }

    /// Return the device this context allocates buffers from.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Bind a concrete shape to a dynamic input.
    ///
    /// This only records and validates the shape. No device memory is
    /// touched: a shape outside the compiled range is rejected here, before
    /// any allocation happens.
    pub fn set_input_shape(&mut self, input: &str, shape: &[usize]) -> Result<(), RunError> {
        let Some(binding) = self.plan.inputs().iter().find(|b| b.name == input) else {
            return Err(RunError::UnknownBinding(input.to_string()));
        };

        let out_of_range = || RunError::InputOutOfRange {
            input: input.to_string(),
            shape: shape.to_vec(),
        };

        // The rank is fixed when the network is built; only extents vary.
        if shape.len() != binding.dims.len() {
            return Err(out_of_range());
        }
        for (dim, declared) in binding.dims.iter().enumerate() {
            if let Dimension::Fixed(size) = declared {
                if shape[dim] != *size {
                    return Err(out_of_range());
                }
            }
        }
        if let Some(profile) = self.plan.profile_for(input) {
            if !profile.contains(shape) {
                return Err(out_of_range());
            }
        }

        self.input_shapes.insert(input.to_string(), shape.to_vec());
        Ok(())
    }

    /// Return the resolved shape of an output binding.
    ///
    /// Output extents may depend on values computed from the runtime input
    /// shapes (eg. a slice sized by a shape query), so this is only
    /// answerable once every dynamic input has a concrete shape bound.
    pub fn output_shape(&self, output: &str) -> Result<Vec<usize>, RunError> {
        let Some(binding) = self.plan.outputs().iter().find(|b| b.name == output) else {
            return Err(RunError::UnknownBinding(output.to_string()));
        };
        let resolved = self.resolve_shapes()?;
        resolved
            .get(&binding.id)
            .map(|info| info.dims().to_vec())
            .ok_or_else(|| {
                RunError::PlanningError(format!("shape of output \"{}\" was not resolved", output))
            })
    }

    /// Execute the plan for the currently bound input shapes.
    ///
    /// `inputs` maps input binding names to host buffers. The call is fully
    /// synchronous: it allocates device buffers for every binding, copies
    /// the inputs to the device, runs the plan, copies the outputs back and
    /// releases all device buffers before returning. Results are returned as
    /// `(binding name, host buffer)` pairs in the plan's output order.
    pub fn run(
        &mut self,
        inputs: &[(&str, Input)],
        opts: Option<RunOptions>,
    ) -> Result<Vec<(String, Output)>, RunError> {
        let opts = opts.unwrap_or_default().with_env_flags();

        for (name, _) in inputs {
            if !self.plan.inputs().iter().any(|b| b.name == *name) {
                return Err(RunError::UnknownBinding(name.to_string()));
            }
        }

        // Resolve the concrete shape of every value in the graph up front.
        // Output extents can depend on runtime-computed shape values, so this
        // must happen before output buffers can be sized.
        let concrete_shapes = self.concrete_input_shapes()?;
        let resolved = self
            .plan
            .graph()
            .resolve_shapes(self.plan.order(), &concrete_shapes)?;

        // Stage inputs: validate each host buffer against the bound shape and
        // declared type, then copy it into a device buffer.
        let mut input_buffers: Vec<DeviceBuffer> = Vec::with_capacity(self.plan.inputs().len());
        let mut device_tensors: Vec<(NodeId, Output)> =
            Vec::with_capacity(self.plan.inputs().len());
        for binding in self.plan.inputs() {
            let Some((_, value)) = inputs.iter().find(|(name, _)| *name == binding.name) else {
                return Err(RunError::MissingInput(binding.name.clone()));
            };
            if value.dtype() != binding.dtype {
                return Err(RunError::WrongInputType(binding.name.clone()));
            }
            let expected = &concrete_shapes[&binding.id];
            if value.shape() != expected.as_slice() {
                return Err(RunError::InputShapeMismatch {
                    input: binding.name.clone(),
                    expected: expected.clone(),
                    actual: value.shape().to_vec(),
                });
            }

            let elem_size = std::mem::size_of::<f32>();
            let mut buffer = self.device.alloc(value.len() * elem_size)?;
            let staged = match value {
                Input::FloatTensor(tensor) => {
                    buffer.copy_from_host(tensor.data())?;
                    let mut host = vec![0f32; tensor.len()];
                    buffer.copy_to_host(&mut host)?;
                    Output::FloatTensor(Tensor::from_data(tensor.shape(), host))
                }
                Input::IntTensor(tensor) => {
                    buffer.copy_from_host(tensor.data())?;
                    let mut host = vec![0i32; tensor.len()];
                    buffer.copy_to_host(&mut host)?;
                    Output::IntTensor(Tensor::from_data(tensor.shape(), host))
                }
            };
            device_tensors.push((binding.id, staged));
            input_buffers.push(buffer);
        }

        // Size and allocate output buffers from the resolved shapes. Float
        // and int elements are both four bytes, so the buffer size does not
        // depend on the output type.
        let mut output_buffers: Vec<(DeviceBuffer, Vec<usize>)> =
            Vec::with_capacity(self.plan.outputs().len());
        for binding in self.plan.outputs() {
            let dims = resolved_dims(&resolved, binding.id, &binding.name)?;
            let len: usize = dims.iter().product();
            let buffer = self.device.alloc(len * std::mem::size_of::<f32>())?;
            output_buffers.push((buffer, dims));
        }

        // Execute the plan against the device-resident inputs.
        let graph_inputs: Vec<(NodeId, Input)> = device_tensors
            .iter()
            .map(|(id, staged)| (*id, staged.into()))
            .collect();
        let output_ids: Vec<NodeId> = self.plan.outputs().iter().map(|b| b.id).collect();
        let results = self.plan.graph().run_order(
            self.plan.order(),
            &graph_inputs,
            &output_ids,
            Some(opts),
        )?;

        // Copy each result through its device buffer and back to a host
        // buffer for the caller.
        let mut host_outputs = Vec::with_capacity(results.len());
        for (binding, ((mut buffer, dims), result)) in self
            .plan
            .outputs()
            .iter()
            .zip(output_buffers.into_iter().zip(results.into_iter()))
        {
            if result.shape() != dims.as_slice() {
                return Err(RunError::OutputMismatch(
                    "computed output shape does not match the resolved shape",
                ));
            }
            let host_output = match result {
                Output::FloatTensor(tensor) => {
                    buffer.copy_from_host(tensor.data())?;
                    let mut host = vec![0f32; tensor.len()];
                    buffer.copy_to_host(&mut host)?;
                    Output::FloatTensor(Tensor::from_data(&dims, host))
                }
                Output::IntTensor(tensor) => {
                    buffer.copy_from_host(tensor.data())?;
                    let mut host = vec![0i32; tensor.len()];
                    buffer.copy_to_host(&mut host)?;
                    Output::IntTensor(Tensor::from_data(&dims, host))
                }
            };
            host_outputs.push((binding.name.clone(), host_output));
        }

        // `input_buffers` and the per-output buffers go out of scope here,
        // returning all device memory.
        drop(input_buffers);
        Ok(host_outputs)
    }

    /// Return the concrete shape of every graph input.
    ///
    /// Dynamic inputs must have had a shape bound via
    /// [`ExecutionContext::set_input_shape`]. Fully fixed inputs fall back to
    /// their declared shape.
    fn concrete_input_shapes(&self) -> Result<FxHashMap<NodeId, Vec<usize>>, RunError> {
        let mut shapes = FxHashMap::default();
        for binding in self.plan.inputs() {
            let shape = if let Some(shape) = self.input_shapes.get(&binding.name) {
                shape.clone()
            } else if !binding.is_dynamic() {
                binding
                    .dims
                    .iter()
                    .map(|dim| match dim {
                        Dimension::Fixed(size) => *size,
                        Dimension::Symbolic(_) => unreachable!("binding is not dynamic"),
                    })
                    .collect()
            } else {
                return Err(RunError::ShapeNotSet(binding.name.clone()));
            };
            shapes.insert(binding.id, shape);
        }
        Ok(shapes)
    }

    fn resolve_shapes(&self) -> Result<FxHashMap<NodeId, ShapeInfo>, RunError> {
        let concrete_shapes = self.concrete_input_shapes()?;
        self.plan
            .graph()
            .resolve_shapes(self.plan.order(), &concrete_shapes)
    }
}

fn resolved_dims(
    resolved: &FxHashMap<NodeId, ShapeInfo>,
    id: NodeId,
    name: &str,
) -> Result<Vec<usize>, RunError> {
    resolved
        .get(&id)
        .map(|info| info.dims().to_vec())
        .ok_or_else(|| {
            RunError::PlanningError(format!("shape of output \"{}\" was not resolved", name))
        })
}

#[cfg(test)]
mod tests {
    use crate::builder::{ElementwiseOp, Network, NetworkBuilder, SliceSize};
    use crate::device::Device;
    use crate::graph::{Dimension, RunError};
    use crate::ops::{DataType, Output};
    use crate::plan::Plan;
    use crate::profile::ShapeProfile;
    use crate::tensor::Tensor;

    /// Build the shape-driven slice network: every dimension except the
    /// leading one is reduced by a single element.
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

    fn compile_plan() -> Plan {
        let profile = ShapeProfile::new(
            "input",
            vec![1, 1, 1, 1],
            vec![1, 3, 4, 5],
            vec![2, 6, 8, 10],
        );
        Plan::compile(build_network(), vec![profile]).unwrap()
    }

    /// Synthetic input with value `100c + 10h + w` at `[b, c, h, w]`.
    fn synthetic_input(shape: &[usize]) -> Tensor<f32> {
        let &[b, c, h, w] = shape else {
            panic!("expected a rank 4 shape");
        };
        let mut data = Vec::with_capacity(b * c * h * w);
        for _ in 0..b {
            for ci in 0..c {
                for hi in 0..h {
                    for wi in 0..w {
                        data.push((100 * ci + 10 * hi + wi) as f32);
                    }
                }
            }
        }
        Tensor::from_data(shape, data)
    }

    #[test]
    fn test_run_concrete_scenario() {
        let plan = compile_plan();
        let mut context = plan.create_context(Device::new());

        let input = synthetic_input(&[1, 3, 4, 5]);
        context.set_input_shape("input", input.shape()).unwrap();

        let mut results = context.run(&[("input", (&input).into())], None).unwrap();
        let (name, output) = results.remove(0);
        let output = output.as_float().unwrap();

        assert_eq!(name, "slice_6_out");
        assert_eq!(output.shape(), &[1, 2, 3, 4]);
        for c in 0..2 {
            for h in 0..3 {
                for w in 0..4 {
                    let expected = (100 * (c + 1) + 10 * (h + 1) + (w + 1)) as f32;
                    assert_eq!(output[[0, c, h, w]], expected);
                }
            }
        }
    }

    #[test]
    fn test_run_shapes_across_range() {
        // Every in-range shape runs and shrinks each non-leading dimension
        // by one.
        let plan = compile_plan();

        let shapes: &[[usize; 4]] = &[[1, 1, 1, 1], [1, 2, 2, 2], [2, 6, 8, 10], [1, 3, 4, 5]];
        for shape in shapes {
            let mut context = plan.create_context(Device::new());
            context.set_input_shape("input", shape).unwrap();

            let expected_shape: Vec<usize> = shape
                .iter()
                .enumerate()
                .map(|(dim, &size)| if dim == 0 { size } else { size - 1 })
                .collect();
            assert_eq!(context.output_shape("slice_6_out").unwrap(), expected_shape);

            let input = Tensor::zeros(shape);
            let results = context.run(&[("input", (&input).into())], None).unwrap();
            assert_eq!(results[0].1.shape(), expected_shape.as_slice());
        }
    }

    #[test]
    fn test_output_values_offset_by_one() {
        let plan = compile_plan();
        let mut context = plan.create_context(Device::new());

        let shape = [2, 4, 3, 5];
        let input = Tensor::from_data(
            &shape,
            (0..shape.iter().product::<usize>())
                .map(|x| x as f32)
                .collect(),
        );
        context.set_input_shape("input", &shape).unwrap();

        let mut results = context.run(&[("input", (&input).into())], None).unwrap();
        let output = results.remove(0).1.as_float().unwrap();

        assert_eq!(output.shape(), &[2, 3, 2, 4]);
        for b in 0..2 {
            for c in 0..3 {
                for h in 0..2 {
                    for w in 0..4 {
                        assert_eq!(output[[b, c, h, w]], input[[b, c + 1, h + 1, w + 1]]);
                    }
                }
            }
        }
    }

    #[test]
    fn test_out_of_range_shape_rejected_before_allocation() {
        let plan = compile_plan();
        let device = Device::new();
        let mut context = plan.create_context(device.clone());

        // Leading dimension exceeds the profiled max of 2.
        let result = context.set_input_shape("input", &[3, 3, 4, 5]);
        assert!(matches!(
            result.err(),
            Some(RunError::InputOutOfRange { .. })
        ));
        assert_eq!(device.alloc_count(), 0);

        // Wrong rank is likewise out of range.
        let result = context.set_input_shape("input", &[3, 4, 5]);
        assert!(matches!(
            result.err(),
            Some(RunError::InputOutOfRange { .. })
        ));
        assert_eq!(device.alloc_count(), 0);
    }

    #[test]
    fn test_run_requires_bound_shape() {
        let plan = compile_plan();
        let mut context = plan.create_context(Device::new());
        let input = Tensor::zeros(&[1, 3, 4, 5]);
        let result = context.run(&[("input", (&input).into())], None);
        assert!(matches!(result.err(), Some(RunError::ShapeNotSet(_))));
    }

    #[test]
    fn test_run_validates_buffer_against_bound_shape() {
        let plan = compile_plan();
        let mut context = plan.create_context(Device::new());
        context.set_input_shape("input", &[1, 3, 4, 5]).unwrap();

        let input = Tensor::zeros(&[1, 2, 2, 2]);
        let result = context.run(&[("input", (&input).into())], None);
        assert!(matches!(
            result.err(),
            Some(RunError::InputShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_run_validates_dtype() {
        let plan = compile_plan();
        let mut context = plan.create_context(Device::new());
        context.set_input_shape("input", &[1, 3, 4, 5]).unwrap();

        let input = Tensor::<i32>::full(&[1, 3, 4, 5], 0);
        let result = context.run(&[("input", (&input).into())], None);
        assert!(matches!(result.err(), Some(RunError::WrongInputType(_))));
    }

    #[test]
    fn test_unknown_bindings() {
        let plan = compile_plan();
        let mut context = plan.create_context(Device::new());

        let result = context.set_input_shape("nope", &[1, 1, 1, 1]);
        assert!(matches!(result.err(), Some(RunError::UnknownBinding(_))));

        let input = Tensor::zeros(&[1, 3, 4, 5]);
        let result = context.run(&[("nope", (&input).into())], None);
        assert!(matches!(result.err(), Some(RunError::UnknownBinding(_))));

        assert!(matches!(
            context.output_shape("nope").err(),
            Some(RunError::UnknownBinding(_))
        ));
    }

    #[test]
    fn test_rebind_shape_between_runs() {
        let plan = compile_plan();
        let device = Device::new();
        let mut context = plan.create_context(device.clone());

        for shape in [[1, 3, 4, 5], [2, 2, 2, 2]] {
            let input = Tensor::zeros(&shape);
            context.set_input_shape("input", &shape).unwrap();
            let results = context.run(&[("input", (&input).into())], None).unwrap();
            assert_eq!(results[0].1.shape()[0], shape[0]);
            // All buffers are released between runs.
            assert_eq!(device.bytes_in_use(), 0);
        }
    }

    #[test]
    fn test_device_memory_released_on_failure() {
        // A device too small for the outputs: input staging succeeds, then
        // the output allocation fails. The input buffers must still be
        // released.
        let input = synthetic_input(&[1, 3, 4, 5]);
        let input_bytes = input.len() * std::mem::size_of::<f32>();

        let plan = compile_plan();
        let device = Device::with_capacity(input_bytes + 16);
        let mut context = plan.create_context(device.clone());
        context.set_input_shape("input", input.shape()).unwrap();

        let result = context.run(&[("input", (&input).into())], None);
        assert!(matches!(result.err(), Some(RunError::Device(_))));
        assert_eq!(device.bytes_in_use(), 0);
    }

    #[test]
    fn test_restored_plan_runs_bit_identical() {
        let plan = compile_plan();
        let restored = Plan::deserialize(&plan.serialize()).unwrap();

        let input = synthetic_input(&[1, 3, 4, 5]);
        let run = |plan: &Plan| -> Vec<u32> {
            let mut context = plan.create_context(Device::new());
            context.set_input_shape("input", input.shape()).unwrap();
            let mut results = context.run(&[("input", (&input).into())], None).unwrap();
            match results.remove(0).1 {
                Output::FloatTensor(t) => t.iter().map(|v| v.to_bits()).collect(),
                Output::IntTensor(_) => panic!("expected float output"),
            }
        };

        assert_eq!(run(&plan), run(&restored));
    }
}
