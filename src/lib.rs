//! dynten is a minimal runtime for executing small tensor computation graphs
//! whose shapes are only known at run time.
//!
//! It implements the three stages a dynamic-shape inference engine exposes,
//! at toy scale and on the CPU:
//!
//! 1. **Build** — assemble a computation graph with a [`NetworkBuilder`].
//!    Inputs have a fixed rank but their extents may be
//!    [`Dimension::Symbolic`], ie. unknown until a concrete tensor is bound.
//!    Quantities derived from a dynamic shape (such as the output size of a
//!    slice) must be computed by graph nodes, because arithmetic over a
//!    declared shape with unknown extents is rejected at build time.
//! 2. **Compile** — [`Plan::compile`] validates the network against a
//!    [`ShapeProfile`] (the declared min/opt/max range of each dynamic
//!    input) and produces an immutable, reusable [`Plan`]. Plans can be
//!    serialized with [`Plan::serialize`] and restored later.
//! 3. **Execute** — [`Plan::create_context`] binds the plan to a [`Device`].
//!    After fixing concrete input shapes with
//!    [`ExecutionContext::set_input_shape`], a call to
//!    [`ExecutionContext::run`] allocates device buffers sized for that
//!    instance, copies inputs over, runs the plan and copies the outputs
//!    back, releasing all buffers before it returns.
//!
//! ## Example
//!
//! ```
//! use dynten::{
//!     DataType, Device, Dimension, ElementwiseOp, NetworkBuilder, Plan, ShapeProfile,
//!     SliceSize, Tensor,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // A network which drops the first element of each row: the sizes of
//!     // the slice are computed from the input's runtime shape.
//!     let mut builder = NetworkBuilder::new();
//!     let input = builder.add_input(
//!         "input",
//!         DataType::Float,
//!         &[Dimension::Symbolic("rows".into()), Dimension::Symbolic("cols".into())],
//!     )?;
//!     let shape = builder.add_shape(input)?;
//!     let adjust = builder.add_constant(Tensor::from_vec(vec![0i32, 1]));
//!     let sizes = builder.add_elementwise(ElementwiseOp::Sub, shape, adjust)?;
//!     let sliced = builder.add_slice(input, &[0, 1], SliceSize::FromNode(sizes), &[1, 1])?;
//!     builder.mark_output(sliced)?;
//!
//!     let profile = ShapeProfile::new("input", vec![1, 1], vec![2, 3], vec![4, 6]);
//!     let plan = Plan::compile(builder.finish()?, vec![profile])?;
//!
//!     let mut context = plan.create_context(Device::new());
//!     let data = Tensor::from_data(&[2, 3], vec![1., 2., 3., 4., 5., 6.]);
//!     context.set_input_shape("input", data.shape())?;
//!     let outputs = context.run(&[("input", (&data).into())], None)?;
//!     assert_eq!(outputs[0].1.shape(), &[2, 2]);
//!     Ok(())
//! }
//! ```

mod builder;
mod context;
mod device;
mod env;
mod graph;
mod header;
mod number;
mod plan;
mod profile;
mod tensor;
mod timer;

pub mod ops;

pub use builder::{
    static_extents, BuildError, ElementwiseOp, InputBinding, Network, NetworkBuilder,
    OutputBinding, SliceSize,
};
pub use context::ExecutionContext;
pub use device::{Device, DeviceBuffer, DeviceError};
pub use graph::{Dimension, NodeId, RunError, RunOptions};
pub use ops::{DataType, Input, OpError, Output};
pub use plan::{CompileError, Plan, PlanLoadError};
pub use profile::{ProfileError, ShapeProfile};
pub use tensor::Tensor;
