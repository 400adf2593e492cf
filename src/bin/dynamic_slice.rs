use std::error::Error;

use dynten::{
    DataType, Device, Dimension, ElementwiseOp, Network, NetworkBuilder, Plan, RunOptions,
    ShapeProfile, SliceSize, Tensor,
};

struct Args {
    /// Serialize the compiled plan to this path, restore it and run the
    /// restored copy.
    plan: Option<String>,

    /// Show execution timing.
    timing: bool,

    /// Enable verbose logging for plan execution.
    verbose: bool,
}

fn parse_args() -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let mut plan = None;
    let mut timing = false;
    let mut verbose = false;

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Long("plan") => plan = Some(parser.value()?.string()?),
            Short('v') | Long("verbose") => verbose = true,
            Short('t') | Long("timing") => timing = true,
            Short('h') | Long("help") => {
                println!(
                    "Run the dynamic-shape slice demo network.

Usage: {bin_name} [OPTIONS]

  --plan <file>  Round-trip the compiled plan through <file>
  -t, --timing   Output timing info
  -v, --verbose  Enable verbose logging
  -h, --help     Print help
",
                    bin_name = parser.bin_name().unwrap_or("dynamic-slice")
                );
                std::process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }

    Ok(Args {
        plan,
        timing,
        verbose,
    })
}

/// Build a network which reduces every dimension of its input except the
/// leading one by a single element.
///
/// The input has dynamic extents, so the slice sizes cannot be derived from
/// its declared shape when the network is built. Instead the network queries
/// the runtime shape and subtracts `[0, 1, 1, 1]` from it, and that computed
/// tensor sizes the slice.
fn build_network() -> Result<Network, Box<dyn Error>> {
    let mut builder = NetworkBuilder::new();

    let dims: Vec<Dimension> = ["batch", "chans", "height", "width"]
        .iter()
        .map(|name| Dimension::Symbolic(name.to_string()))
        .collect();
    let input = builder.add_input("input", DataType::Float, &dims)?;

    let adjust = builder.add_constant(Tensor::from_vec(vec![0i32, 1, 1, 1]));
    let shape = builder.add_shape(input)?;
    let sizes = builder.add_elementwise(ElementwiseOp::Sub, shape, adjust)?;
    let sliced = builder.add_slice(
        input,
        &[0, 1, 1, 1],
        SliceSize::FromNode(sizes),
        &[1, 1, 1, 1],
    )?;
    builder.mark_output(sliced)?;

    Ok(builder.finish()?)
}

/// Synthetic input with value `100c + 10h + w` at `[b, c, h, w]`.
fn synthetic_input(shape: &[usize]) -> Tensor<f32> {
    let mut data = Vec::with_capacity(shape.iter().product());
    for _ in 0..shape[0] {
        for c in 0..shape[1] {
            for h in 0..shape[2] {
                for w in 0..shape[3] {
                    data.push((100 * c + 10 * h + w) as f32);
                }
            }
        }
    }
    Tensor::from_data(shape, data)
}

fn run() -> Result<(), Box<dyn Error>> {
    let args = parse_args()?;

    let run_shape = [1, 3, 4, 5];
    let profile = ShapeProfile::new(
        "input",
        vec![1; run_shape.len()],
        run_shape.to_vec(),
        run_shape.iter().map(|&size| size * 2).collect(),
    );

    let plan = Plan::compile(build_network()?, vec![profile])?;

    // Optionally round-trip the plan through its serialized form, so the
    // run below exercises a restored plan.
    let plan = match args.plan {
        Some(path) => {
            std::fs::write(&path, plan.serialize())?;
            println!("Restoring plan from {}", path);
            Plan::load_file(&path)?
        }
        None => plan,
    };

    let input = synthetic_input(&run_shape);

    let mut context = plan.create_context(Device::new());
    context.set_input_shape("input", &run_shape)?;

    let opts = RunOptions {
        timing: args.timing,
        verbose: args.verbose,
    };
    let outputs = context.run(&[("input", (&input).into())], Some(opts))?;

    println!("Input: {:?}\n{}", input.shape(), input);
    for (name, output) in outputs {
        match output {
            dynten::Output::FloatTensor(tensor) => {
                println!("Output {}: {:?}\n{}", name, tensor.shape(), tensor);
            }
            dynten::Output::IntTensor(tensor) => {
                println!("Output {}: {:?}\n{}", name, tensor.shape(), tensor);
            }
        }
    }

    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}
