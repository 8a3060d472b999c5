//! Operators and helpers shared by the integration tests

#![allow(dead_code)]

use std::sync::Once;

use batchflow_core::builtin::EXTERNAL_SOURCE;
use batchflow_core::operator::{self, OperatorSchema};
use batchflow_core::{
    Backend, Buffer, DataType, Error, ExecutorConfig, ExternalBatch, GraphDef, Operator,
    OperatorDef, OperatorSpec, OutputDef, PipelineConfig, QueueDepth, Result, TensorList,
    Workspace,
};

pub const ADD_ITERATION: &str = "TestAddIteration";
pub const FAIL_AT: &str = "TestFailAt";

/// Adds a running counter (one per processed iteration) to every byte
struct AddIteration {
    counter: u64,
}

impl Operator for AddIteration {
    fn run(&mut self, ws: &mut Workspace<'_>) -> Result<()> {
        let input = ws.input(0)?;
        let mut out = TensorList::allocate(
            ws.output_memory(),
            input.shapes().to_vec(),
            input.dtype(),
            input.layout().clone(),
        )?;
        let delta = self.counter as u8;
        for (dst, src) in out.samples_mut()?.into_iter().zip(input.samples()) {
            for (d, s) in dst.iter_mut().zip(src) {
                *d = s.wrapping_add(delta);
            }
        }
        self.counter += 1;
        ws.set_output(0, out)
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(self.counter.to_le_bytes().to_vec())
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<()> {
        let bytes: [u8; 8] = state
            .try_into()
            .map_err(|_| Error::Checkpoint("counter state must be 8 bytes".into()))?;
        self.counter = u64::from_le_bytes(bytes);
        Ok(())
    }
}

/// Passes its input through, failing on one iteration
struct FailAt {
    iteration: u64,
}

impl Operator for FailAt {
    fn run(&mut self, ws: &mut Workspace<'_>) -> Result<()> {
        if ws.iteration() == self.iteration {
            return Err(Error::Execution(format!("corrupt sample in iteration {}", self.iteration)));
        }
        let input = ws.input(0)?.clone();
        ws.set_output(0, input)
    }
}

fn create_fail_at(spec: &OperatorSpec) -> Result<Box<dyn Operator>> {
    Ok(Box::new(FailAt {
        iteration: spec.required_arg("iteration")?,
    }))
}

pub fn setup() {
    static REGISTER: Once = Once::new();
    batchflow_core::init();
    REGISTER.call_once(|| {
        operator::register(OperatorSchema::new(ADD_ITERATION, &[Backend::Cpu, Backend::Gpu], 1, |_| {
            Ok(Box::new(AddIteration { counter: 0 }))
        }))
        .unwrap();
        operator::register(OperatorSchema::new(FAIL_AT, &[Backend::Cpu], 1, create_fail_at)).unwrap();
    });
}

pub fn config(batch: usize, queue: QueueDepth, pipelined: bool, async_execution: bool) -> PipelineConfig {
    PipelineConfig {
        max_batch_size: batch,
        num_threads: 2,
        executor: ExecutorConfig {
            pipelined,
            async_execution,
            queue,
        },
        ..PipelineConfig::default()
    }
}

/// `src -> ExternalSource -> AddIteration -> out`
pub fn counter_graph(config: PipelineConfig) -> GraphDef {
    GraphDef::new(config)
        .operator(
            OperatorDef::new("src", EXTERNAL_SOURCE, Backend::Cpu)
                .arg("layout", "HWC")
                .output(OutputDef::typed("raw", DataType::UInt8, 3)),
        )
        .operator(
            OperatorDef::new("add", ADD_ITERATION, Backend::Cpu)
                .input("raw")
                .output(OutputDef::new("out")),
        )
        .pipeline_output("out")
}

/// Batch of `n` HWC samples of shape `[2, 2, 3]` filled with `fill`
pub fn hwc_batch(n: usize, fill: u8) -> ExternalBatch {
    let shapes = vec![vec![2, 2, 3]; n];
    ExternalBatch::contiguous(Buffer::from_vec(vec![fill; n * 12]), &shapes, DataType::UInt8)
}
