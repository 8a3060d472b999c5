//! Pipeline handle
//!
//! [`Pipeline`] owns one validated graph together with its feed slots,
//! executor and checkpoint manager, and exposes the feed / prefetch / run /
//! output cycle. A handle is not re-entrant: every method takes `&self` or
//! `&mut self`, so concurrent use from several threads needs external
//! locking.
//!
//! Outputs handed out by [`Pipeline::output`] and [`Pipeline::share_output`]
//! stay valid until they are released. Introspection methods always look at
//! the most recently obtained output.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointManager, ExternalContext};
use crate::config::{ConfigOverrides, PipelineConfig, QueueDepth};
use crate::error::{Error, Result};
use crate::executor::{Executor, IterationOutput, OperatorMemoryStats, OutputBatch};
use crate::feed::{ExternalBatch, FeedOptions, FeedSlots};
use crate::graph::{Graph, GraphDef};
use crate::operator::ReaderMeta;
use crate::queue::QueueStats;
use crate::stream::Event;
use crate::tensor::TensorList;
use crate::types::{Backend, DataType, StorageDevice, TensorLayout};

/// A running data-preprocessing pipeline
pub struct Pipeline {
    id: Uuid,
    config: PipelineConfig,
    graph: Arc<Graph>,
    // Dropped before the executor so held slots return to open queues
    held: VecDeque<OutputBatch>,
    feeds: FeedSlots,
    checkpoints: CheckpointManager,
    executor: Executor,
    prefetched: bool,
    started: bool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("operators", &self.graph.nodes().len())
            .field("held_outputs", &self.held.len())
            .field("started", &self.started)
            .finish()
    }
}

impl Pipeline {
    /// Build a pipeline from a graph definition with per-call overrides
    pub fn new(def: &GraphDef, overrides: &ConfigOverrides) -> Result<Self> {
        if !crate::is_initialized() {
            return Err(Error::NotInitialized);
        }
        let config = def.config.clone().with_overrides(overrides);
        config.validate()?;

        let graph = Arc::new(Graph::build(def, &config)?);
        let feeds = FeedSlots::from_graph(&graph, config.device_id)?;
        let executor = Executor::new(Arc::clone(&graph), &config)?;
        let id = Uuid::new_v4();
        info!(
            %id,
            operators = graph.nodes().len(),
            external_inputs = feeds.len(),
            max_batch_size = config.max_batch_size,
            device_id = config.device_id,
            "pipeline created"
        );
        Ok(Self {
            id,
            checkpoints: CheckpointManager::new(config.enable_checkpointing),
            config,
            graph,
            held: VecDeque::new(),
            feeds,
            executor,
            prefetched: false,
            started: false,
        })
    }

    /// Build a pipeline from a serialized graph with per-call overrides
    pub fn from_serialized(json: &str, overrides: &ConfigOverrides) -> Result<Self> {
        Self::new(&GraphDef::from_json(json)?, overrides)
    }

    /// Build a pipeline taking every parameter from the serialized graph
    pub fn deserialize_default(json: &str) -> Result<Self> {
        Self::from_serialized(json, &ConfigOverrides::default())
    }

    /// Unique id of this instance, used in log events
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Effective configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Largest batch size the pipeline accepts
    pub fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    // ------------------------------------------------------------------
    // Feeding
    // ------------------------------------------------------------------

    /// Batch size of the next feed on `name`
    pub fn set_external_input_batch_size(&mut self, name: &str, batch_size: usize) -> Result<()> {
        let max = self.config.max_batch_size;
        self.feeds.get_mut(name)?.set_batch_size(batch_size, max)
    }

    /// Samples the next feed on `name` must carry
    pub fn external_input_batch_size(&self, name: &str) -> Result<usize> {
        Ok(self.feeds.get(name)?.next_batch_size(self.config.max_batch_size))
    }

    /// Tag the next feed on `name` with a caller-defined id
    pub fn set_external_input_data_id(&mut self, name: &str, data_id: &str) -> Result<()> {
        self.feeds.get_mut(name)?.set_data_id(data_id);
        Ok(())
    }

    /// Number of feeds `name` needs before the next prefetch or run
    pub fn input_feed_count(&self, name: &str) -> Result<usize> {
        self.feeds.get(name)?;
        Ok(if self.prefetched {
            1
        } else {
            self.config.executor.queue.prefetch_depth()
        })
    }

    /// Feed `name` and wait until the source memory may be reused
    pub fn feed_input(&mut self, name: &str, batch: ExternalBatch, options: FeedOptions) -> Result<()> {
        self.feed_input_async(name, batch, options)?.wait();
        Ok(())
    }

    /// Feed `name`; the caller must keep the source memory valid until the
    /// returned event is set
    pub fn feed_input_async(
        &mut self,
        name: &str,
        batch: ExternalBatch,
        options: FeedOptions,
    ) -> Result<Event> {
        let max = self.config.max_batch_size;
        let stream = self.executor.stream();
        self.feeds.get_mut(name)?.feed(batch, options, max, stream)
    }

    /// Number of external inputs
    pub fn num_external_inputs(&self) -> usize {
        self.feeds.len()
    }

    /// Name of the `i`-th external input in lexicographic order
    pub fn external_input_name(&self, i: usize) -> Result<&str> {
        self.feeds.name(i)
    }

    /// Every external input name in lexicographic order
    pub fn external_input_names(&self) -> Vec<&str> {
        self.feeds.names().collect()
    }

    /// Layout required by `name`, empty when undetermined
    pub fn external_input_layout(&self, name: &str) -> Result<&TensorLayout> {
        Ok(self.feeds.get(name)?.layout())
    }

    /// Element type required by `name`
    pub fn external_input_dtype(&self, name: &str) -> Result<Option<DataType>> {
        Ok(self.feeds.get(name)?.dtype())
    }

    /// Sample dimensionality required by `name`, `-1` when undetermined
    pub fn external_input_ndim(&self, name: &str) -> Result<i32> {
        Ok(self
            .feeds
            .get(name)?
            .ndim()
            .map_or(-1, |n| n as i32))
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Fill every stage queue to its depth. Allowed once, before `run`.
    pub fn prefetch(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::sequencing(
                "prefetch must precede every other scheduling call",
            ));
        }
        self.executor.check_failure()?;
        let depth = self.config.executor.queue.prefetch_depth();
        self.feeds.check_exact(depth)?;
        for _ in 0..depth {
            self.schedule_next()?;
        }
        self.prefetched = true;
        self.started = true;
        info!(pipeline = %self.id, depth, "prefetched");
        Ok(())
    }

    /// Legacy alias of [`Pipeline::prefetch`] for uniform queues
    pub fn prefetch_uniform(&mut self, queue_depth: usize) -> Result<()> {
        if self.config.executor.queue != QueueDepth::Uniform(queue_depth) {
            return Err(Error::InvalidArgument(format!(
                "queue depth {queue_depth} does not match the configured {:?}",
                self.config.executor.queue
            )));
        }
        self.prefetch()
    }

    /// Legacy alias of [`Pipeline::prefetch`] for separated queues
    pub fn prefetch_separate(&mut self, cpu_queue_depth: usize, gpu_queue_depth: usize) -> Result<()> {
        let requested = QueueDepth::Separated {
            cpu: cpu_queue_depth,
            gpu: gpu_queue_depth,
        };
        if self.config.executor.queue != requested {
            return Err(Error::InvalidArgument(format!(
                "queue depths {requested:?} do not match the configured {:?}",
                self.config.executor.queue
            )));
        }
        self.prefetch()
    }

    /// Schedule one more iteration
    pub fn run(&mut self) -> Result<()> {
        self.executor.check_failure()?;
        self.schedule_next()?;
        self.started = true;
        Ok(())
    }

    fn schedule_next(&mut self) -> Result<()> {
        let (feeds, batch_size) = self.feeds.take_iteration(self.config.max_batch_size)?;
        self.executor.schedule(feeds, batch_size)
    }

    /// Release every held output and wait for the next one
    pub fn output(&mut self) -> Result<&IterationOutput> {
        self.held.clear();
        self.take_output()
    }

    /// Wait for the next output while keeping the held ones
    pub fn share_output(&mut self) -> Result<&IterationOutput> {
        let limit = self.config.executor.queue.output_depth();
        if self.held.len() >= limit {
            return Err(Error::sequencing(format!(
                "{} outputs are already held; release one first",
                self.held.len()
            )));
        }
        self.take_output()
    }

    fn take_output(&mut self) -> Result<&IterationOutput> {
        let batch = self.executor.output()?;
        let iteration = batch.data.iteration;
        self.checkpoints.record_consumed(iteration, batch.data.states.clone());
        debug!(pipeline = %self.id, iteration, held = self.held.len() + 1, "output handed out");
        self.held.push_back(batch);
        self.current()
    }

    /// Return the oldest held output to the pipeline
    pub fn release_output(&mut self) -> Result<()> {
        match self.held.pop_front() {
            Some(batch) => {
                debug!(pipeline = %self.id, iteration = batch.data.iteration, "output released");
                Ok(())
            }
            None => Err(Error::sequencing("no output is held")),
        }
    }

    /// Number of outputs currently held
    pub fn held_outputs(&self) -> usize {
        self.held.len()
    }

    // ------------------------------------------------------------------
    // Output introspection
    // ------------------------------------------------------------------

    /// Most recently obtained output still held
    pub fn current(&self) -> Result<&IterationOutput> {
        self.held
            .back()
            .map(|batch| &batch.data)
            .ok_or_else(|| Error::sequencing("no output is held; call output or share_output first"))
    }

    /// Number of pipeline outputs
    pub fn num_outputs(&self) -> usize {
        self.graph.outputs().len()
    }

    fn output_edge(&self, i: usize) -> Result<&crate::graph::Edge> {
        let edge = self.graph.outputs().get(i).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "output index {i} out of range for {} outputs",
                self.num_outputs()
            ))
        })?;
        Ok(self.graph.edge(*edge))
    }

    /// Name of output `i`
    pub fn output_name(&self, i: usize) -> Result<&str> {
        Ok(&self.output_edge(i)?.def.name)
    }

    /// Device output `i` is produced on
    pub fn output_device(&self, i: usize) -> Result<StorageDevice> {
        Ok(self.output_edge(i)?.device)
    }

    /// Element type declared for output `i`
    pub fn declared_output_dtype(&self, i: usize) -> Result<Option<DataType>> {
        Ok(self.output_edge(i)?.def.dtype)
    }

    /// Sample dimensionality declared for output `i`
    pub fn declared_output_ndim(&self, i: usize) -> Result<Option<usize>> {
        Ok(self.output_edge(i)?.def.ndim)
    }

    /// Output `i` of the current iteration
    pub fn output_tensor(&self, i: usize) -> Result<&TensorList> {
        let current = self.current()?;
        current.outputs.get(i).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "output index {i} out of range for {} outputs",
                current.outputs.len()
            ))
        })
    }

    /// Whether every sample of output `i` has the same shape
    pub fn output_has_uniform_shape(&self, i: usize) -> Result<bool> {
        Ok(self.output_tensor(i)?.is_uniform())
    }

    /// Dense shape `[n, d0, ...]` of output `i`, if uniform
    pub fn output_shape(&self, i: usize) -> Result<Option<Vec<usize>>> {
        Ok(self.output_tensor(i)?.uniform_shape())
    }

    /// Shape of sample `k` of output `i`
    pub fn output_sample_shape(&self, i: usize, k: usize) -> Result<&[usize]> {
        self.output_tensor(i)?.shape(k)
    }

    /// Element type of output `i`
    pub fn output_dtype(&self, i: usize) -> Result<DataType> {
        Ok(self.output_tensor(i)?.dtype())
    }

    /// Layout of output `i`
    pub fn output_layout(&self, i: usize) -> Result<&TensorLayout> {
        Ok(self.output_tensor(i)?.layout())
    }

    /// Number of samples in output `i`
    pub fn output_num_tensors(&self, i: usize) -> Result<usize> {
        Ok(self.output_tensor(i)?.num_samples())
    }

    /// Number of elements in output `i`
    pub fn output_num_elements(&self, i: usize) -> Result<usize> {
        Ok(self.output_tensor(i)?.num_elements())
    }

    /// Payload bytes of output `i`
    pub fn output_nbytes(&self, i: usize) -> Result<usize> {
        Ok(self.output_tensor(i)?.nbytes())
    }

    /// Sample dimensionality of output `i`
    pub fn output_sample_dim(&self, i: usize) -> Result<usize> {
        Ok(self.output_tensor(i)?.sample_dim())
    }

    /// Copy output `i` densely into `dst`; the output must be uniform
    pub fn output_copy(&self, i: usize, dst: &mut [u8]) -> Result<()> {
        let tensor = self.output_tensor(i)?;
        if !tensor.is_uniform() {
            return Err(Error::InvalidArgument(format!(
                "output {i} has non-uniform sample shapes; copy per sample instead"
            )));
        }
        tensor.copy_to_slice(dst)
    }

    /// Legacy alias of [`Pipeline::output_copy`]
    pub fn copy_tensor_list_n_to(&self, i: usize, dst: &mut [u8]) -> Result<()> {
        self.output_copy(i, dst)
    }

    /// Copy each sample of output `i` into its own destination; `None`
    /// skips the sample
    pub fn output_copy_samples(&self, i: usize, dsts: &mut [Option<&mut [u8]>]) -> Result<()> {
        let tensor = self.output_tensor(i)?;
        if dsts.len() != tensor.num_samples() {
            return Err(Error::InvalidArgument(format!(
                "{} destinations given for {} samples",
                dsts.len(),
                tensor.num_samples()
            )));
        }
        for (k, (dst, src)) in dsts.iter_mut().zip(tensor.samples()).enumerate() {
            let Some(dst) = dst else { continue };
            if dst.len() < src.len() {
                return Err(Error::InvalidArgument(format!(
                    "destination {k} holds {} bytes, sample needs {}",
                    dst.len(),
                    src.len()
                )));
            }
            dst[..src.len()].copy_from_slice(src);
        }
        Ok(())
    }

    /// Whether `operator` published `key` for the current iteration
    pub fn has_operator_trace(&self, operator: &str, key: &str) -> Result<bool> {
        Ok(self.operator_traces(operator)?.is_some_and(|traces| traces.contains_key(key)))
    }

    /// Value `operator` published under `key` for the current iteration
    pub fn operator_trace(&self, operator: &str, key: &str) -> Result<&str> {
        self.operator_traces(operator)?
            .and_then(|traces| traces.get(key))
            .map(String::as_str)
            .ok_or_else(|| Error::UnknownName(format!("operator '{operator}' has no trace '{key}'")))
    }

    /// Every trace `operator` published for the current iteration
    pub fn operator_traces(&self, operator: &str) -> Result<Option<&BTreeMap<String, String>>> {
        self.graph.node(operator)?;
        Ok(self.current()?.traces.get(operator))
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Epoch and sharding information of a reader operator
    pub fn reader_metadata(&self, operator: &str) -> Result<ReaderMeta> {
        let (node, _) = self.graph.node(operator)?;
        self.executor
            .reader_meta(node)
            .ok_or_else(|| Error::InvalidArgument(format!("operator '{operator}' is not a reader")))
    }

    /// Backend of `operator`
    pub fn operator_backend(&self, operator: &str) -> Result<Backend> {
        Ok(self.graph.node(operator)?.1.backend)
    }

    /// Per-operator output sizes, empty unless memory statistics are enabled
    pub fn executor_metadata(&self) -> Vec<OperatorMemoryStats> {
        self.executor.memory_stats()
    }

    /// Occupancy of every stage queue
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        self.executor.queue_stats()
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Snapshot operator state as of the last consumed output, together
    /// with `context`
    pub fn serialized_checkpoint(&self, context: &ExternalContext) -> Result<Vec<u8>> {
        let checkpoint = self.checkpoints.capture(
            &self.graph,
            self.config.max_batch_size,
            self.executor.initial_state(),
            context,
        )?;
        checkpoint.to_bytes()
    }

    /// Restore operator state before the first prefetch or run and return
    /// the caller context stored in the checkpoint
    pub fn restore_from_serialized_checkpoint(&mut self, bytes: &[u8]) -> Result<ExternalContext> {
        if self.started {
            return Err(Error::sequencing(
                "checkpoints can only be restored before the first prefetch or run",
            ));
        }
        let checkpoint = self
            .checkpoints
            .load(bytes, &self.graph, self.config.max_batch_size)?;
        self.executor
            .restore_states(&checkpoint.states(), checkpoint.iteration)?;
        info!(pipeline = %self.id, iteration = checkpoint.iteration, "restored from checkpoint");
        Ok(checkpoint.external_context)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            warn!(pipeline = %self.id, held = self.held.len(), "dropping pipeline with held outputs");
        }
        self.held.clear();
        debug!(pipeline = %self.id, "pipeline dropped");
    }
}
