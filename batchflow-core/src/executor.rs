//! Staged execution of iterations with bounded queues
//!
//! Every iteration runs the CPU stage (host operators) and then the GPU
//! stage (mixed and device operators followed by output assembly). The GPU
//! stage is issued to the pipeline's stream, so its result is a
//! [`Completion`] that the consumer waits on in `output`.
//!
//! In asynchronous mode a CPU worker and a GPU worker thread drive the
//! stages and `schedule` only enqueues a job. In synchronous mode the
//! caller's thread runs the stages; jobs that find their queue full are
//! parked and resumed once the consumer releases an output.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ExecutorConfig, PipelineConfig, QueueDepth};
use crate::error::{Error, OperatorFailure, Result};
use crate::feed::QueuedFeed;
use crate::graph::{Graph, Stage};
use crate::operator::{self, ExternalInput, Operator, OperatorSpec, ReaderMeta, Workspace};
use crate::queue::{QueueStats, ReadyQueue, SlotGuard, StageQueue};
use crate::stream::{Completion, Stream};
use crate::tensor::TensorList;
use crate::types::{Backend, MemoryKind};

/// Name reported for failures not attributable to an operator
const EXECUTOR: &str = "<executor>";

/// Operator state captured after an iteration, keyed by node index
pub type OperatorStates = Vec<(usize, Vec<u8>)>;

/// Key/value diagnostics per operator name
pub type Traces = BTreeMap<String, BTreeMap<String, String>>;

/// Size statistics of one operator output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputMemoryStats {
    /// Largest total payload seen, in bytes
    pub real_size: usize,

    /// Largest sample payload seen, in bytes
    pub max_real_size: usize,

    /// Largest total reservation seen, in bytes
    pub reserved: usize,

    /// Largest per-sample reservation seen, in bytes
    pub max_reserved: usize,
}

impl OutputMemoryStats {
    fn observe(&mut self, data: &TensorList) {
        self.real_size = self.real_size.max(data.nbytes());
        self.max_real_size = self.max_real_size.max(data.max_sample_nbytes());
        self.reserved = self.reserved.max(data.reserved_bytes());
        self.max_reserved = self.max_reserved.max(data.max_reserved_sample_bytes());
    }
}

/// Memory statistics of one operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorMemoryStats {
    /// Operator name
    pub operator: String,

    /// One entry per output
    pub outputs: Vec<OutputMemoryStats>,
}

/// Results of one iteration
#[derive(Debug, Clone)]
pub struct IterationOutput {
    /// Iteration index
    pub iteration: u64,

    /// Pipeline outputs in declaration order
    pub outputs: Vec<TensorList>,

    /// Operator traces emitted during the iteration
    pub traces: Traces,

    /// State of stateful operators after the iteration
    pub(crate) states: OperatorStates,
}

/// Iteration results together with the queue slot they occupy
#[derive(Debug)]
pub struct OutputBatch {
    /// Results
    pub data: IterationOutput,
    _slot: Option<SlotGuard>,
}

pub(crate) struct Job {
    iteration: u64,
    batch_size: usize,
    feeds: HashMap<usize, QueuedFeed>,
}

struct NodeRuntime {
    node: usize,
    op: Box<dyn Operator>,
    stateful: bool,
}

/// Work in progress of one iteration between the stages
struct StagedIteration {
    iteration: u64,
    batch_size: usize,
    values: Vec<Option<TensorList>>,
    traces: Traces,
    states: OperatorStates,
    externals: HashMap<usize, ExternalInput>,
}

type StageResult<T> = std::result::Result<T, OperatorFailure>;

struct CpuOutcome {
    iteration: u64,
    result: StageResult<StagedIteration>,
    slot: SlotGuard,
}

struct StageOutcome {
    result: StageResult<IterationOutput>,
    slot: Option<SlotGuard>,
}

/// State shared by the caller, the stage workers and stream tasks
struct StageContext {
    graph: Arc<Graph>,
    device_id: i32,
    checkpointing: bool,
    memory_stats: bool,
    cpu_ops: Mutex<Vec<NodeRuntime>>,
    gpu_ops: Mutex<Vec<NodeRuntime>>,
    thread_pool: rayon::ThreadPool,
    cpu_queue: Arc<StageQueue>,
    gpu_queue: Option<Arc<StageQueue>>,
    ready: ReadyQueue<Completion<StageOutcome>>,
    failure: Mutex<Option<OperatorFailure>>,
    output_stats: Mutex<BTreeMap<usize, Vec<OutputMemoryStats>>>,
}

impl StageContext {
    fn poisoned(&self) -> Option<OperatorFailure> {
        self.failure.lock().clone()
    }

    fn fail(&self, failure: OperatorFailure) -> OperatorFailure {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            error!(
                operator = %failure.operator,
                iteration = failure.iteration,
                message = %failure.message,
                "iteration failed"
            );
            *slot = Some(failure.clone());
        }
        failure
    }

    fn memory_for(&self, backend: Backend) -> MemoryKind {
        match backend {
            Backend::Cpu => MemoryKind::Host,
            Backend::Mixed | Backend::Gpu => MemoryKind::Device(self.device_id),
        }
    }

    fn run_nodes(&self, ops: &mut [NodeRuntime], staged: &mut StagedIteration) -> StageResult<()> {
        let iteration = staged.iteration;
        for rt in ops.iter_mut() {
            let node = &self.graph.nodes()[rt.node];
            let failure = |message: String| OperatorFailure {
                operator: node.name.clone(),
                iteration,
                message,
            };

            let inputs = node
                .inputs
                .iter()
                .map(|&e| staged.values[e].clone())
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| failure("input was not produced".into()))?;

            let mut ws = Workspace::new(
                iteration,
                staged.batch_size,
                self.device_id,
                self.memory_for(node.backend),
                &inputs,
                node.outputs.len(),
                &self.thread_pool,
            )
            .with_external(staged.externals.remove(&rt.node));

            match catch_unwind(AssertUnwindSafe(|| rt.op.run(&mut ws))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(failure(e.to_string())),
                Err(_) => return Err(failure("operator panicked".into())),
            }

            let (outputs, traces) = ws.finish();
            for (k, (out, &edge)) in outputs.into_iter().zip(&node.outputs).enumerate() {
                let out = out.ok_or_else(|| failure(format!("output {k} was not set")))?;
                let def = &self.graph.edge(edge).def;
                if let Some(dtype) = def.dtype {
                    if out.dtype() != dtype {
                        return Err(failure(format!(
                            "output '{}' declared {dtype} but produced {}",
                            def.name,
                            out.dtype()
                        )));
                    }
                }
                if let Some(ndim) = def.ndim {
                    if out.num_samples() > 0 && out.sample_dim() != ndim {
                        return Err(failure(format!(
                            "output '{}' declared {ndim} dimensions but produced {}",
                            def.name,
                            out.sample_dim()
                        )));
                    }
                }
                if out.num_samples() != staged.batch_size {
                    return Err(failure(format!(
                        "output '{}' has {} samples, batch size is {}",
                        def.name,
                        out.num_samples(),
                        staged.batch_size
                    )));
                }
                if self.memory_stats {
                    let mut stats = self.output_stats.lock();
                    let entry = stats
                        .entry(rt.node)
                        .or_insert_with(|| vec![OutputMemoryStats::default(); node.outputs.len()]);
                    entry[k].observe(&out);
                }
                staged.values[edge] = Some(out);
            }
            if !traces.is_empty() {
                staged.traces.insert(node.name.clone(), traces);
            }
            if self.checkpointing && rt.stateful {
                let state = rt.op.save_state().map_err(|e| failure(e.to_string()))?;
                staged.states.push((rt.node, state));
            }
        }
        Ok(())
    }

    fn run_cpu_stage(&self, job: Job) -> StageResult<StagedIteration> {
        if let Some(failure) = self.poisoned() {
            return Err(failure);
        }
        let Job {
            iteration,
            batch_size,
            feeds,
        } = job;
        let mut externals = HashMap::with_capacity(feeds.len());
        for (node, feed) in feeds {
            let input = feed.resolve().map_err(|e| {
                self.fail(OperatorFailure {
                    operator: self.graph.nodes()[node].name.clone(),
                    iteration,
                    message: e.to_string(),
                })
            })?;
            externals.insert(node, input);
        }
        let mut staged = StagedIteration {
            iteration,
            batch_size,
            values: vec![None; self.graph.edges().len()],
            traces: BTreeMap::new(),
            states: Vec::new(),
            externals,
        };
        let mut ops = self.cpu_ops.lock();
        self.run_nodes(&mut ops, &mut staged).map_err(|f| self.fail(f))?;
        trace!(iteration = staged.iteration, "cpu stage done");
        Ok(staged)
    }

    fn run_gpu_stage(&self, staged: StageResult<StagedIteration>) -> StageResult<IterationOutput> {
        let mut staged = staged?;
        if let Some(failure) = self.poisoned() {
            return Err(failure);
        }
        {
            let mut ops = self.gpu_ops.lock();
            self.run_nodes(&mut ops, &mut staged).map_err(|f| self.fail(f))?;
        }
        let outputs = self
            .graph
            .outputs()
            .iter()
            .map(|&e| staged.values[e].clone())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                self.fail(OperatorFailure {
                    operator: EXECUTOR.into(),
                    iteration: staged.iteration,
                    message: "pipeline output was not produced".into(),
                })
            })?;
        staged.states.sort_by_key(|(node, _)| *node);
        trace!(iteration = staged.iteration, "gpu stage done");
        Ok(IterationOutput {
            iteration: staged.iteration,
            outputs,
            traces: staged.traces,
            states: staged.states,
        })
    }
}

/// Issue the GPU stage of a staged iteration and queue its completion
fn schedule_gpu_stage(
    ctx: &Arc<StageContext>,
    stream: Option<&Stream>,
    outcome: CpuOutcome,
    gpu_slot: Option<SlotGuard>,
) {
    let CpuOutcome {
        iteration,
        result,
        slot,
    } = outcome;
    // Separated queues hold the CPU slot only until the GPU stage is done
    let (held, cpu_slot) = match gpu_slot {
        Some(gpu_slot) => (gpu_slot, Some(slot)),
        None => (slot, None),
    };

    let completion = match stream {
        Some(stream) => {
            let task_ctx = Arc::clone(ctx);
            let submitted = stream.submit(move || {
                let result = task_ctx.run_gpu_stage(result);
                drop(cpu_slot);
                StageOutcome {
                    result,
                    slot: Some(held),
                }
            });
            submitted.unwrap_or_else(|e| {
                Completion::ready(StageOutcome {
                    result: Err(ctx.fail(OperatorFailure {
                        operator: EXECUTOR.into(),
                        iteration,
                        message: e.to_string(),
                    })),
                    slot: None,
                })
            })
        }
        None => {
            let result = ctx.run_gpu_stage(result);
            drop(cpu_slot);
            Completion::ready(StageOutcome {
                result,
                slot: Some(held),
            })
        }
    };
    ctx.ready.push(completion);
}

enum Mode {
    Async {
        jobs: Option<Sender<Job>>,
        workers: Vec<JoinHandle<()>>,
    },
    Sync {
        parked: VecDeque<Job>,
        staged: VecDeque<CpuOutcome>,
    },
}

/// Drives iterations through the stage queues
pub struct Executor {
    ctx: Arc<StageContext>,
    config: ExecutorConfig,
    stream: Option<Arc<Stream>>,
    mode: Mode,
    next_iteration: u64,
    scheduled: usize,
    /// First iteration to run and the operator state it starts from
    initial: (u64, OperatorStates),
}

impl Executor {
    /// Instantiate every operator of `graph` and start the stage machinery
    pub fn new(graph: Arc<Graph>, config: &PipelineConfig) -> Result<Self> {
        let mut cpu_ops = Vec::new();
        let mut gpu_ops = Vec::new();
        for (i, node) in graph.nodes().iter().enumerate() {
            let spec = OperatorSpec {
                name: node.name.clone(),
                kind: node.kind.clone(),
                backend: node.backend,
                num_inputs: node.inputs.len(),
                outputs: node.outputs.iter().map(|&e| graph.edge(e).def.clone()).collect(),
                args: node.args.clone(),
                max_batch_size: config.max_batch_size,
                seed: config.seed.wrapping_add(i as u64),
                device_id: config.device_id,
            };
            let op = operator::create(&spec)?;
            let rt = NodeRuntime {
                node: i,
                stateful: op.is_stateful(),
                op,
            };
            match node.stage() {
                Stage::Cpu => cpu_ops.push(rt),
                Stage::Gpu => gpu_ops.push(rt),
            }
        }

        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .thread_name(|i| format!("batchflow-worker-{i}"))
            .build()
            .map_err(|e| Error::Execution(format!("failed to build worker pool: {e}")))?;

        let exec = config.executor;
        let (cpu_queue, gpu_queue) = match exec.queue {
            QueueDepth::Uniform(depth) => (StageQueue::new("cpu", depth), None),
            QueueDepth::Separated { cpu, gpu } => {
                (StageQueue::new("cpu", cpu), Some(StageQueue::new("gpu", gpu)))
            }
        };

        let stream = if config.device_id >= 0 {
            Some(Arc::new(Stream::new(config.device_id)?))
        } else {
            None
        };

        let ctx = Arc::new(StageContext {
            graph,
            device_id: config.device_id,
            checkpointing: config.enable_checkpointing,
            memory_stats: config.enable_memory_stats,
            cpu_ops: Mutex::new(cpu_ops),
            gpu_ops: Mutex::new(gpu_ops),
            thread_pool,
            cpu_queue,
            gpu_queue,
            ready: ReadyQueue::new(),
            failure: Mutex::new(None),
            output_stats: Mutex::new(BTreeMap::new()),
        });

        let mode = if exec.async_execution {
            Self::spawn_workers(&ctx, stream.clone())?
        } else {
            Mode::Sync {
                parked: VecDeque::new(),
                staged: VecDeque::new(),
            }
        };

        let mut executor = Self {
            ctx,
            config: exec,
            stream,
            mode,
            next_iteration: 0,
            scheduled: 0,
            initial: (0, Vec::new()),
        };
        if config.enable_checkpointing {
            executor.initial.1 = executor.snapshot_states()?;
        }
        info!(
            pipelined = exec.pipelined,
            async_execution = exec.async_execution,
            queue = ?exec.queue,
            "executor started"
        );
        Ok(executor)
    }

    fn spawn_workers(ctx: &Arc<StageContext>, stream: Option<Arc<Stream>>) -> Result<Mode> {
        let (job_tx, job_rx) = unbounded::<Job>();
        let (staged_tx, staged_rx) = unbounded::<CpuOutcome>();

        let cpu_ctx = Arc::clone(ctx);
        let cpu = std::thread::Builder::new()
            .name("batchflow-cpu-stage".into())
            .spawn(move || cpu_worker(&cpu_ctx, &job_rx, &staged_tx))
            .map_err(|e| Error::Execution(format!("failed to start cpu stage: {e}")))?;

        let gpu_ctx = Arc::clone(ctx);
        let gpu = std::thread::Builder::new()
            .name("batchflow-gpu-stage".into())
            .spawn(move || gpu_worker(&gpu_ctx, &staged_rx, stream.as_deref()))
            .map_err(|e| Error::Execution(format!("failed to start gpu stage: {e}")))?;

        Ok(Mode::Async {
            jobs: Some(job_tx),
            workers: vec![cpu, gpu],
        })
    }

    /// Stream used for device transfers, absent in CPU-only pipelines
    pub fn stream(&self) -> Option<&Stream> {
        self.stream.as_deref()
    }

    /// Index the next scheduled iteration will get
    pub fn next_iteration(&self) -> u64 {
        self.next_iteration
    }

    /// Iterations scheduled and not yet returned by [`Executor::output`]
    pub fn pending(&self) -> usize {
        self.scheduled
    }

    /// Fail with the recorded operator failure, if any
    pub fn check_failure(&self) -> Result<()> {
        match self.ctx.poisoned() {
            Some(failure) => Err(Error::Operator(failure)),
            None => Ok(()),
        }
    }

    /// Schedule one iteration over the given feeds
    pub(crate) fn schedule(&mut self, feeds: HashMap<usize, QueuedFeed>, batch_size: usize) -> Result<()> {
        self.check_failure()?;
        let job = Job {
            iteration: self.next_iteration,
            batch_size,
            feeds,
        };
        let iteration = job.iteration;
        match &mut self.mode {
            Mode::Async { jobs, .. } => {
                jobs.as_ref()
                    .ok_or(Error::ShutDown)?
                    .send(job)
                    .map_err(|_| Error::Execution("cpu stage worker terminated".into()))?;
            }
            Mode::Sync { parked, .. } => parked.push_back(job),
        }
        self.next_iteration += 1;
        self.scheduled += 1;
        debug!(iteration, batch_size, "scheduled iteration");

        self.pump()?;
        if !self.config.pipelined {
            if let Some(stream) = &self.stream {
                stream.synchronize()?;
            }
        }
        Ok(())
    }

    /// Advance parked work in synchronous mode as far as free slots allow
    fn pump(&mut self) -> Result<bool> {
        let Mode::Sync { parked, staged } = &mut self.mode else {
            return Ok(false);
        };
        let mut progressed = false;
        loop {
            let mut step = false;
            while !staged.is_empty() {
                let gpu_slot = match &self.ctx.gpu_queue {
                    Some(queue) => match queue.try_reserve()? {
                        Some(slot) => Some(slot),
                        None => break,
                    },
                    None => None,
                };
                let Some(outcome) = staged.pop_front() else { break };
                schedule_gpu_stage(&self.ctx, self.stream.as_deref(), outcome, gpu_slot);
                step = true;
            }
            if !parked.is_empty() {
                if let Some(slot) = self.ctx.cpu_queue.try_reserve()? {
                    if let Some(job) = parked.pop_front() {
                        let iteration = job.iteration;
                        let result = self.ctx.run_cpu_stage(job);
                        staged.push_back(CpuOutcome {
                            iteration,
                            result,
                            slot,
                        });
                        step = true;
                    }
                }
            }
            if !step {
                return Ok(progressed);
            }
            progressed = true;
        }
    }

    /// Wait for the oldest scheduled iteration
    pub fn output(&mut self) -> Result<OutputBatch> {
        if self.scheduled == 0 {
            return Err(Error::sequencing(
                "no iteration is scheduled; call prefetch or run first",
            ));
        }

        let completion = if matches!(self.mode, Mode::Async { .. }) {
            self.ctx.ready.pop()
        } else {
            loop {
                self.pump()?;
                if let Some(completion) = self.ctx.ready.try_pop() {
                    break completion;
                }
                // Slots may be held by GPU work still on the stream
                if let Some(stream) = &self.stream {
                    stream.synchronize()?;
                }
                if !self.pump()? && self.ctx.ready.is_empty() {
                    return Err(Error::sequencing(
                        "every queue slot is held by an unreleased output",
                    ));
                }
            }
        };
        self.scheduled -= 1;

        let outcome = completion.wait()?;
        match outcome.result {
            Ok(data) => {
                trace!(iteration = data.iteration, "output ready");
                Ok(OutputBatch {
                    data,
                    _slot: outcome.slot,
                })
            }
            Err(failure) => Err(Error::Operator(failure)),
        }
    }

    fn snapshot_states(&self) -> Result<OperatorStates> {
        let mut states = Vec::new();
        for ops in [&self.ctx.cpu_ops, &self.ctx.gpu_ops] {
            for rt in ops.lock().iter().filter(|rt| rt.stateful) {
                states.push((rt.node, rt.op.save_state()?));
            }
        }
        states.sort_by_key(|(node, _)| *node);
        Ok(states)
    }

    /// First iteration and the operator state before it was scheduled
    pub fn initial_state(&self) -> (u64, &OperatorStates) {
        (self.initial.0, &self.initial.1)
    }

    /// Replace operator state before any iteration is scheduled
    pub fn restore_states(&mut self, states: &[(usize, Vec<u8>)], next_iteration: u64) -> Result<()> {
        if self.scheduled > 0 || self.next_iteration > 0 {
            return Err(Error::sequencing(
                "operator state can only be restored before the first iteration",
            ));
        }
        let by_node: HashMap<usize, &[u8]> = states.iter().map(|(n, s)| (*n, s.as_slice())).collect();
        for ops in [&self.ctx.cpu_ops, &self.ctx.gpu_ops] {
            for rt in ops.lock().iter_mut() {
                if let Some(state) = by_node.get(&rt.node) {
                    rt.op.restore_state(state)?;
                }
            }
        }
        self.next_iteration = next_iteration;
        self.initial = (next_iteration, self.snapshot_states()?);
        Ok(())
    }

    /// Reader metadata of the node, if it is a reader
    pub fn reader_meta(&self, node: usize) -> Option<ReaderMeta> {
        for ops in [&self.ctx.cpu_ops, &self.ctx.gpu_ops] {
            if let Some(rt) = ops.lock().iter().find(|rt| rt.node == node) {
                return rt.op.reader_meta();
            }
        }
        None
    }

    /// Per-operator output statistics (empty unless memory stats are enabled)
    pub fn memory_stats(&self) -> Vec<OperatorMemoryStats> {
        self.ctx
            .output_stats
            .lock()
            .iter()
            .map(|(&node, outputs)| OperatorMemoryStats {
                operator: self.ctx.graph.nodes()[node].name.clone(),
                outputs: outputs.clone(),
            })
            .collect()
    }

    /// Occupancy of every stage queue
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        let mut stats = vec![self.ctx.cpu_queue.stats()];
        if let Some(queue) = &self.ctx.gpu_queue {
            stats.push(queue.stats());
        }
        stats
    }
}

fn cpu_worker(ctx: &StageContext, jobs: &Receiver<Job>, staged: &Sender<CpuOutcome>) {
    for job in jobs {
        let Ok(slot) = ctx.cpu_queue.reserve() else { break };
        let iteration = job.iteration;
        let result = ctx.run_cpu_stage(job);
        if staged.send(CpuOutcome { iteration, result, slot }).is_err() {
            break;
        }
    }
    debug!("cpu stage worker stopped");
}

fn gpu_worker(ctx: &Arc<StageContext>, staged: &Receiver<CpuOutcome>, stream: Option<&Stream>) {
    for outcome in staged {
        let gpu_slot = match &ctx.gpu_queue {
            Some(queue) => match queue.reserve() {
                Ok(slot) => Some(slot),
                Err(_) => break,
            },
            None => None,
        };
        schedule_gpu_stage(ctx, stream, outcome, gpu_slot);
    }
    debug!("gpu stage worker stopped");
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.ctx.cpu_queue.close();
        if let Some(queue) = &self.ctx.gpu_queue {
            queue.close();
        }
        if let Mode::Async { jobs, workers } = &mut self.mode {
            jobs.take();
            for worker in workers.drain(..) {
                if worker.join().is_err() {
                    warn!("stage worker panicked");
                }
            }
        }
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.synchronize() {
                warn!(error = %e, "stream did not drain");
            }
        }
        self.ctx.ready.clear();
        debug!("executor stopped");
    }
}
