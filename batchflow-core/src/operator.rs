//! Operator trait, per-iteration workspace and the process-wide registry

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::OutputDef;
use crate::tensor::TensorList;
use crate::types::{Backend, MemoryKind};

/// A named unit of work executed once per iteration
pub trait Operator: Send {
    /// Process one iteration, reading inputs from and writing outputs to `ws`
    fn run(&mut self, ws: &mut Workspace<'_>) -> Result<()>;

    /// Whether the operator carries state across iterations
    fn is_stateful(&self) -> bool {
        false
    }

    /// Serialize the state that determines future iterations
    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Replace the state with one produced by [`Operator::save_state`]
    fn restore_state(&mut self, _state: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Dataset metadata for reader operators
    fn reader_meta(&self) -> Option<ReaderMeta> {
        None
    }
}

/// Dataset metadata exposed by reader operators
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderMeta {
    /// Samples in one epoch of this shard
    pub epoch_size: i64,

    /// Epoch size including padding of the last batch
    pub epoch_size_padded: i64,

    /// Number of shards the dataset is split into
    pub number_of_shards: i32,

    /// Shard read by this instance
    pub shard_id: i32,

    /// Whether the last batch is padded by repeating the last sample
    pub pad_last_batch: bool,

    /// Whether the reader keeps to its shard across epochs
    pub stick_to_shard: bool,
}

/// Batch supplied from outside the graph, handed to an external source
#[derive(Debug, Clone)]
pub struct ExternalInput {
    /// Fed samples
    pub data: TensorList,

    /// Identifier attached with `set_data_id`
    pub data_id: Option<String>,
}

/// Construction parameters of one operator instance
#[derive(Debug, Clone)]
pub struct OperatorSpec {
    /// Instance name, unique in the graph
    pub name: String,

    /// Registered kind
    pub kind: String,

    /// Backend the instance runs on
    pub backend: Backend,

    /// Number of wired inputs
    pub num_inputs: usize,

    /// Declared outputs
    pub outputs: Vec<OutputDef>,

    /// Free-form arguments
    pub args: serde_json::Map<String, serde_json::Value>,

    /// Largest batch the pipeline processes
    pub max_batch_size: usize,

    /// Seed derived from the pipeline seed and the operator position
    pub seed: u64,

    /// Device the pipeline runs on
    pub device_id: i32,
}

impl OperatorSpec {
    /// Optional typed argument
    pub fn arg<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.args
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| {
                    Error::InvalidGraph(format!(
                        "operator '{}': argument '{key}' is invalid: {e}",
                        self.name
                    ))
                })
            })
            .transpose()
    }

    /// Typed argument with a default
    pub fn arg_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.arg(key)?.unwrap_or(default))
    }

    /// Typed argument that must be present
    pub fn required_arg<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.arg(key)?.ok_or_else(|| {
            Error::InvalidGraph(format!(
                "operator '{}' requires argument '{key}'",
                self.name
            ))
        })
    }
}

/// Everything an operator sees while running one iteration
pub struct Workspace<'a> {
    iteration: u64,
    batch_size: usize,
    device_id: i32,
    output_memory: MemoryKind,
    inputs: &'a [TensorList],
    outputs: Vec<Option<TensorList>>,
    external: Option<ExternalInput>,
    traces: BTreeMap<String, String>,
    thread_pool: &'a rayon::ThreadPool,
}

impl<'a> Workspace<'a> {
    /// Workspace for one run of an operator; the executor builds these, and
    /// operator tests can build them to drive an operator directly
    pub fn new(
        iteration: u64,
        batch_size: usize,
        device_id: i32,
        output_memory: MemoryKind,
        inputs: &'a [TensorList],
        num_outputs: usize,
        thread_pool: &'a rayon::ThreadPool,
    ) -> Self {
        Self {
            iteration,
            batch_size,
            device_id,
            output_memory,
            inputs,
            outputs: vec![None; num_outputs],
            external: None,
            traces: BTreeMap::new(),
            thread_pool,
        }
    }

    /// Attach the batch an external source emits
    pub fn with_external(mut self, external: Option<ExternalInput>) -> Self {
        self.external = external;
        self
    }

    /// Index of the iteration being processed
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Number of samples this iteration produces
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Device the pipeline runs on
    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Memory kind outputs of this operator must live in
    pub fn output_memory(&self) -> MemoryKind {
        self.output_memory
    }

    /// Number of inputs
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Input `i`
    pub fn input(&self, i: usize) -> Result<&TensorList> {
        self.inputs
            .get(i)
            .ok_or_else(|| Error::InvalidArgument(format!("operator has no input {i}")))
    }

    /// Number of declared outputs
    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Publish output `i`
    pub fn set_output(&mut self, i: usize, data: TensorList) -> Result<()> {
        let slot = self
            .outputs
            .get_mut(i)
            .ok_or_else(|| Error::InvalidArgument(format!("operator has no output {i}")))?;
        *slot = Some(data);
        Ok(())
    }

    /// Take the batch fed to this external source for the current iteration
    pub fn take_external(&mut self) -> Result<ExternalInput> {
        self.external
            .take()
            .ok_or_else(|| Error::Execution("no external data for this iteration".into()))
    }

    /// Attach a key/value diagnostic to the current iteration
    pub fn set_trace(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.traces.insert(key.into(), value.into());
    }

    /// Worker pool for per-sample parallelism
    pub fn thread_pool(&self) -> &rayon::ThreadPool {
        self.thread_pool
    }

    /// Outputs and traces produced by the run
    pub fn finish(self) -> (Vec<Option<TensorList>>, BTreeMap<String, String>) {
        (self.outputs, self.traces)
    }
}

/// Creates an operator instance from its spec
pub type OperatorFactory = fn(&OperatorSpec) -> Result<Box<dyn Operator>>;

/// Registration record of one operator kind
#[derive(Clone)]
pub struct OperatorSchema {
    /// Kind name used in graph definitions
    pub kind: String,

    /// Backends the kind can be instantiated on
    pub backends: Vec<Backend>,

    /// Minimum number of inputs
    pub min_inputs: usize,

    /// Maximum number of inputs
    pub max_inputs: usize,

    /// Fixed number of outputs, if the kind has one
    pub num_outputs: Option<usize>,

    /// Whether instances are ingress points fed by the caller
    pub is_external_source: bool,

    /// Constructor
    pub factory: OperatorFactory,
}

impl OperatorSchema {
    /// Schema with one output and the given input count
    pub fn new(kind: &str, backends: &[Backend], inputs: usize, factory: OperatorFactory) -> Self {
        Self {
            kind: kind.to_string(),
            backends: backends.to_vec(),
            min_inputs: inputs,
            max_inputs: inputs,
            num_outputs: Some(1),
            is_external_source: false,
            factory,
        }
    }

    /// Set the number of outputs (`None` for any number)
    pub fn with_outputs(mut self, outputs: Option<usize>) -> Self {
        self.num_outputs = outputs;
        self
    }

    /// Mark the kind as an external source
    pub fn external_source(mut self) -> Self {
        self.is_external_source = true;
        self
    }
}

impl fmt::Debug for OperatorSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorSchema")
            .field("kind", &self.kind)
            .field("backends", &self.backends)
            .field("min_inputs", &self.min_inputs)
            .field("max_inputs", &self.max_inputs)
            .field("num_outputs", &self.num_outputs)
            .field("is_external_source", &self.is_external_source)
            .finish()
    }
}

static REGISTRY: Lazy<RwLock<HashMap<String, OperatorSchema>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register an operator kind; registering a kind twice is an error
pub fn register(schema: OperatorSchema) -> Result<()> {
    let mut registry = REGISTRY.write();
    if registry.contains_key(&schema.kind) {
        return Err(Error::InvalidArgument(format!(
            "operator kind '{}' is already registered",
            schema.kind
        )));
    }
    debug!(kind = %schema.kind, "registered operator kind");
    registry.insert(schema.kind.clone(), schema);
    Ok(())
}

/// Look up a registered kind
pub fn schema(kind: &str) -> Option<OperatorSchema> {
    REGISTRY.read().get(kind).cloned()
}

/// Names of all registered kinds, sorted
pub fn registered_kinds() -> Vec<String> {
    let mut kinds: Vec<String> = REGISTRY.read().keys().cloned().collect();
    kinds.sort();
    kinds
}

/// Instantiate an operator
pub fn create(spec: &OperatorSpec) -> Result<Box<dyn Operator>> {
    let schema = schema(&spec.kind)
        .ok_or_else(|| Error::UnknownName(format!("operator kind '{}'", spec.kind)))?;
    (schema.factory)(spec)
}
