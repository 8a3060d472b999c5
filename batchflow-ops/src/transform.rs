//! Element-wise transforms: dtype conversion and affine scaling

use batchflow_core::{DataType, Error, Operator, OperatorSpec, Result, TensorList, Workspace};
use rayon::prelude::*;
use tracing::trace;

use crate::convert;

/// Kind name of the dtype conversion
pub const CAST: &str = "Cast";

/// Kind name of `x * scale + shift`
pub const AFFINE: &str = "Affine";

/// Apply `f` to every sample of `input`, writing `dtype` samples into a
/// new batch. Samples are processed on the pipeline's worker pool.
fn map_samples<F>(ws: &Workspace<'_>, input: &TensorList, dtype: DataType, f: F) -> Result<TensorList>
where
    F: Fn(f64) -> f64 + Sync,
{
    if !convert::is_supported(input.dtype()) {
        return Err(Error::InvalidArgument(format!(
            "cannot transform {} data",
            input.dtype()
        )));
    }
    let mut out = TensorList::allocate(
        ws.output_memory(),
        input.shapes().to_vec(),
        dtype,
        input.layout().clone(),
    )?;
    let sources = input.samples();
    let targets = out.samples_mut()?;
    let src_dtype = input.dtype();
    ws.thread_pool().install(|| {
        targets
            .into_par_iter()
            .zip(sources.into_par_iter())
            .try_for_each(|(dst, src)| {
                let values: Vec<f64> = convert::load(src_dtype, src)?.into_iter().map(&f).collect();
                convert::store(dtype, &values, dst)
            })
    })?;
    Ok(out)
}

/// Converts its input to another element type
pub struct Cast {
    dtype: DataType,
}

impl Cast {
    /// Build from the `dtype` argument
    pub fn create(spec: &OperatorSpec) -> Result<Box<dyn Operator>> {
        let dtype: DataType = spec.required_arg("dtype")?;
        if !convert::is_supported(dtype) {
            return Err(Error::InvalidGraph(format!(
                "operator '{}': cannot cast to {dtype}",
                spec.name
            )));
        }
        Ok(Box::new(Self { dtype }))
    }
}

impl Operator for Cast {
    fn run(&mut self, ws: &mut Workspace<'_>) -> Result<()> {
        let input = ws.input(0)?;
        let output = if input.dtype() == self.dtype {
            input.clone()
        } else {
            trace!(from = %input.dtype(), to = %self.dtype, "casting batch");
            map_samples(ws, input, self.dtype, |v| v)?
        };
        ws.set_output(0, output)
    }
}

/// Computes `x * scale + shift` in `float32`
pub struct Affine {
    scale: f64,
    shift: f64,
}

impl Affine {
    /// Build from the `scale` and `shift` arguments
    pub fn create(spec: &OperatorSpec) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Self {
            scale: spec.arg_or("scale", 1.0)?,
            shift: spec.arg_or("shift", 0.0)?,
        }))
    }
}

impl Operator for Affine {
    fn run(&mut self, ws: &mut Workspace<'_>) -> Result<()> {
        let input = ws.input(0)?;
        let (scale, shift) = (self.scale, self.shift);
        let output = map_samples(ws, input, DataType::Float32, |v| v * scale + shift)?;
        ws.set_output(0, output)
    }
}
