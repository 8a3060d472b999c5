//! Operators every pipeline can use: the external source and the
//! contiguity/transfer operator.

use tracing::trace;

use crate::error::Result;
use crate::operator::{register, Operator, OperatorSchema, OperatorSpec, Workspace};
use crate::types::Backend;

/// Kind name of the caller-fed ingress operator
pub const EXTERNAL_SOURCE: &str = "ExternalSource";

/// Kind name of the operator packing (and moving) a batch into one buffer
pub const MAKE_CONTIGUOUS: &str = "MakeContiguous";

/// Trace key under which the external source publishes the fed data id
pub const NEXT_OUTPUT_DATA_ID: &str = "next_output_data_id";

pub(crate) fn register_builtins() -> Result<()> {
    register(
        OperatorSchema::new(EXTERNAL_SOURCE, &[Backend::Cpu, Backend::Gpu], 0, |_| {
            Ok(Box::new(ExternalSource))
        })
        .external_source(),
    )?;
    register(OperatorSchema::new(
        MAKE_CONTIGUOUS,
        &[Backend::Cpu, Backend::Mixed, Backend::Gpu],
        1,
        MakeContiguous::create,
    ))
}

/// Emits the batch the caller fed for this iteration
struct ExternalSource;

impl Operator for ExternalSource {
    fn run(&mut self, ws: &mut Workspace<'_>) -> Result<()> {
        let fed = ws.take_external()?;
        if let Some(id) = fed.data_id {
            ws.set_trace(NEXT_OUTPUT_DATA_ID, id);
        }
        ws.set_output(0, fed.data)
    }
}

/// Packs its input into one buffer in the operator's output memory,
/// passing it through when it already is
struct MakeContiguous {
    force_copy: bool,
}

impl MakeContiguous {
    fn create(spec: &OperatorSpec) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Self {
            force_copy: spec.arg_or("force_copy", false)?,
        }))
    }
}

impl Operator for MakeContiguous {
    fn run(&mut self, ws: &mut Workspace<'_>) -> Result<()> {
        let input = ws.input(0)?;
        let target = ws.output_memory();
        let output = if !self.force_copy && input.is_contiguous() && input.memory() == target {
            input.clone()
        } else {
            trace!(from = %input.memory(), to = %target, bytes = input.nbytes(), "packing batch");
            input.to_contiguous(target)?
        };
        ws.set_output(0, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::ExternalInput;
    use crate::tensor::TensorList;
    use crate::types::{DataType, MemoryKind, TensorLayout};

    fn batch() -> TensorList {
        TensorList::from_bytes(
            MemoryKind::Host,
            vec![vec![2], vec![2]],
            DataType::UInt8,
            TensorLayout::empty(),
            &[1, 2, 3, 4],
        )
        .unwrap()
    }

    #[test]
    fn test_external_source_publishes_data_id() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let mut ws = Workspace::new(0, 2, 0, MemoryKind::Host, &[], 1, &pool).with_external(Some(
            ExternalInput {
                data: batch(),
                data_id: Some("shard-3".into()),
            },
        ));
        ExternalSource.run(&mut ws).unwrap();
        let (outputs, traces) = ws.finish();
        assert_eq!(outputs[0].as_ref().unwrap().sample(1).unwrap(), &[3, 4]);
        assert_eq!(traces[NEXT_OUTPUT_DATA_ID], "shard-3");
    }

    #[test]
    fn test_make_contiguous_moves_to_device() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let inputs = [batch()];
        let mut ws = Workspace::new(0, 2, 0, MemoryKind::Device(0), &inputs, 1, &pool);
        MakeContiguous { force_copy: false }.run(&mut ws).unwrap();
        let (outputs, _) = ws.finish();
        let out = outputs[0].as_ref().unwrap();
        assert_eq!(out.memory(), MemoryKind::Device(0));
        assert_eq!(out.sample(0).unwrap(), &[1, 2]);
    }

    #[test]
    fn test_make_contiguous_passes_through() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let inputs = [batch()];
        let mut ws = Workspace::new(0, 2, 0, MemoryKind::Host, &inputs, 1, &pool);
        MakeContiguous { force_copy: false }.run(&mut ws).unwrap();
        let (outputs, _) = ws.finish();
        let out = outputs[0].as_ref().unwrap();
        let original = inputs[0].contiguous_buffer().unwrap();
        assert!(out.contiguous_buffer().unwrap().same_region(original));
    }
}
