//! External feed slots: validation, placement and queuing of caller data

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, trace};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::operator::ExternalInput;
use crate::stream::{Completion, Event, Stream};
use crate::tensor::TensorList;
use crate::types::{Backend, DataType, MemoryKind, TensorLayout};

/// Whether fed memory is copied or adopted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CopyMode {
    /// Follow the slot's declared default
    #[default]
    Default,

    /// Always copy into pipeline-owned memory
    ForceCopy,

    /// Adopt the caller's memory; it must already be on the right device
    ForceNoCopy,
}

/// Independent toggles of one feed call; all default to off
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedOptions {
    /// Wait for any copy to finish before returning
    pub force_sync: bool,

    /// Stage host copies in pinned memory
    pub pinned: bool,

    /// Gather scattered samples with a copy kernel instead of per-sample copies
    pub use_copy_kernel: bool,

    /// Copy policy
    pub copy: CopyMode,
}

impl FeedOptions {
    /// Wait for copies before returning
    pub fn sync(mut self) -> Self {
        self.force_sync = true;
        self
    }

    /// Use pinned staging memory
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// Gather with a copy kernel
    pub fn use_copy_kernel(mut self) -> Self {
        self.use_copy_kernel = true;
        self
    }

    /// Always copy
    pub fn force_copy(mut self) -> Self {
        self.copy = CopyMode::ForceCopy;
        self
    }

    /// Never copy
    pub fn force_no_copy(mut self) -> Self {
        self.copy = CopyMode::ForceNoCopy;
        self
    }
}

/// Memory supplied by the caller
#[derive(Debug, Clone)]
pub enum FeedData {
    /// All samples concatenated
    Contiguous(Buffer),

    /// One buffer per sample
    Scattered(Vec<Buffer>),
}

/// One batch supplied to an external input
#[derive(Debug, Clone)]
pub struct ExternalBatch {
    /// Sample memory
    pub data: FeedData,

    /// Flattened shapes, `batch_size * sample_dim` extents
    pub shapes: Vec<usize>,

    /// Dimensionality of every sample
    pub sample_dim: usize,

    /// Element type
    pub dtype: DataType,

    /// Axis layout, empty if unspecified
    pub layout: TensorLayout,
}

fn flatten(shapes: &[Vec<usize>]) -> (Vec<usize>, usize) {
    let sample_dim = shapes.first().map_or(0, Vec::len);
    (shapes.iter().flatten().copied().collect(), sample_dim)
}

impl ExternalBatch {
    /// Batch over one packed buffer
    pub fn contiguous(buffer: Buffer, shapes: &[Vec<usize>], dtype: DataType) -> Self {
        let (flat, sample_dim) = flatten(shapes);
        Self {
            data: FeedData::Contiguous(buffer),
            shapes: flat,
            sample_dim,
            dtype,
            layout: TensorLayout::empty(),
        }
    }

    /// Batch over one buffer per sample
    pub fn scattered(buffers: Vec<Buffer>, shapes: &[Vec<usize>], dtype: DataType) -> Self {
        let (flat, sample_dim) = flatten(shapes);
        Self {
            data: FeedData::Scattered(buffers),
            shapes: flat,
            sample_dim,
            dtype,
            layout: TensorLayout::empty(),
        }
    }

    /// Attach a layout
    pub fn with_layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }
}

pub(crate) enum FedData {
    Ready(TensorList),
    Pending(Completion<Result<TensorList>>),
}

/// Batch waiting in a slot for the iteration that consumes it
pub(crate) struct QueuedFeed {
    data: FedData,
    data_id: Option<String>,
    pub(crate) batch_size: usize,
}

impl QueuedFeed {
    /// Wait for any pending copy and hand the batch to the operator
    pub(crate) fn resolve(self) -> Result<ExternalInput> {
        let data = match self.data {
            FedData::Ready(data) => data,
            FedData::Pending(completion) => completion.wait()??,
        };
        Ok(ExternalInput {
            data,
            data_id: self.data_id,
        })
    }
}

/// Named ingress point of the graph
pub struct FeedSlot {
    name: String,
    node: usize,
    memory: MemoryKind,
    dtype: Option<DataType>,
    ndim: Option<usize>,
    layout: TensorLayout,
    no_copy: bool,
    queue: VecDeque<QueuedFeed>,
    next_batch_size: Option<usize>,
    next_data_id: Option<String>,
}

fn compatible(source: MemoryKind, target: MemoryKind) -> bool {
    match target {
        MemoryKind::Host | MemoryKind::Pinned => source.is_host(),
        MemoryKind::Device(_) => source == target,
    }
}

impl FeedSlot {
    fn mismatch(&self, reason: String) -> Error {
        Error::FeedMismatch {
            slot: self.name.clone(),
            reason,
        }
    }

    /// Input name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Required element type, if declared
    pub fn dtype(&self) -> Option<DataType> {
        self.dtype
    }

    /// Required dimensionality, if determined
    pub fn ndim(&self) -> Option<usize> {
        self.ndim
    }

    /// Required layout, empty if undetermined
    pub fn layout(&self) -> &TensorLayout {
        &self.layout
    }

    /// Memory the operator consumes from
    pub fn memory(&self) -> MemoryKind {
        self.memory
    }

    /// Feeds waiting to be consumed
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Override the batch size of the next feed
    pub fn set_batch_size(&mut self, batch_size: usize, max_batch_size: usize) -> Result<()> {
        if batch_size > max_batch_size {
            return Err(self.mismatch(format!(
                "batch size {batch_size} exceeds the maximum of {max_batch_size}"
            )));
        }
        self.next_batch_size = Some(batch_size);
        Ok(())
    }

    /// Samples the next feed must carry
    pub fn next_batch_size(&self, max_batch_size: usize) -> usize {
        self.next_batch_size.unwrap_or(max_batch_size)
    }

    /// Tag the next feed
    pub fn set_data_id(&mut self, data_id: impl Into<String>) {
        self.next_data_id = Some(data_id.into());
    }

    fn validate(&self, batch: &ExternalBatch, batch_size: usize) -> Result<Vec<Vec<usize>>> {
        if batch.shapes.len() != batch_size * batch.sample_dim {
            return Err(self.mismatch(format!(
                "{} shape extents given for {batch_size} samples of {} dimensions",
                batch.shapes.len(),
                batch.sample_dim
            )));
        }
        if let Some(dtype) = self.dtype {
            if dtype != batch.dtype {
                return Err(self.mismatch(format!("expected {dtype} data, got {}", batch.dtype)));
            }
        }
        if let Some(ndim) = self.ndim {
            if ndim != batch.sample_dim {
                return Err(self.mismatch(format!(
                    "expected {ndim}-dimensional samples, got {}",
                    batch.sample_dim
                )));
            }
        }
        if !batch.layout.is_empty() {
            if !self.layout.is_empty() && self.layout != batch.layout {
                return Err(self.mismatch(format!(
                    "expected layout '{}', got '{}'",
                    self.layout, batch.layout
                )));
            }
            batch
                .layout
                .check_ndim(batch.sample_dim)
                .map_err(|e| self.mismatch(e.to_string()))?;
        }

        let shapes: Vec<Vec<usize>> = if batch.sample_dim == 0 {
            vec![Vec::new(); batch_size]
        } else {
            batch.shapes.chunks(batch.sample_dim).map(<[usize]>::to_vec).collect()
        };
        let sizes: Vec<usize> = shapes
            .iter()
            .map(|s| s.iter().product::<usize>() * batch.dtype.size())
            .collect();
        match &batch.data {
            FeedData::Contiguous(buffer) => {
                let total: usize = sizes.iter().sum();
                if buffer.len() < total {
                    return Err(self.mismatch(format!(
                        "buffer of {} bytes too small for {total} bytes of samples",
                        buffer.len()
                    )));
                }
            }
            FeedData::Scattered(buffers) => {
                if buffers.len() != batch_size {
                    return Err(self.mismatch(format!(
                        "{} sample pointers for a batch of {batch_size}",
                        buffers.len()
                    )));
                }
                if let Some(k) = buffers.iter().zip(&sizes).position(|(b, &n)| b.len() < n) {
                    return Err(self.mismatch(format!("sample {k} buffer is too small")));
                }
                if let Some(first) = buffers.first() {
                    if buffers.iter().any(|b| b.memory() != first.memory()) {
                        return Err(self.mismatch("samples live in different memory kinds".into()));
                    }
                }
            }
        }
        Ok(shapes)
    }

    /// Validate, place and queue one batch.
    ///
    /// Returns an event signalled once the caller's memory is no longer
    /// read by the copy. Adopted (no-copy) memory is signalled at once but
    /// stays in use until the consuming output has been released.
    pub(crate) fn feed(
        &mut self,
        batch: ExternalBatch,
        options: FeedOptions,
        max_batch_size: usize,
        stream: Option<&Stream>,
    ) -> Result<Event> {
        let batch_size = self.next_batch_size(max_batch_size);
        let shapes = self.validate(&batch, batch_size)?;
        let layout = if batch.layout.is_empty() {
            self.layout.clone()
        } else {
            batch.layout.clone()
        };

        let source = match batch.data {
            FeedData::Contiguous(buffer) => {
                TensorList::contiguous(buffer, shapes, batch.dtype, layout)?
            }
            FeedData::Scattered(buffers) => {
                let memory = buffers.first().map_or(self.memory, Buffer::memory);
                TensorList::scattered(buffers, shapes, batch.dtype, layout, memory)?
            }
        };

        let no_copy = match options.copy {
            CopyMode::Default => self.no_copy && compatible(source.memory(), self.memory),
            CopyMode::ForceCopy => false,
            CopyMode::ForceNoCopy => {
                if !compatible(source.memory(), self.memory) {
                    return Err(self.mismatch(format!(
                        "no-copy feed of {} memory into an input consuming {} memory",
                        source.memory(),
                        self.memory
                    )));
                }
                true
            }
        };

        let target = if self.memory.is_host() && options.pinned {
            MemoryKind::Pinned
        } else {
            self.memory
        };

        let (data, event) = if no_copy {
            trace!(slot = %self.name, "adopting caller memory");
            (FedData::Ready(source), Event::signalled())
        } else if source.memory().is_host() && target.is_host() {
            (FedData::Ready(source.to_contiguous(target)?), Event::signalled())
        } else {
            let stream = stream.ok_or_else(|| {
                self.mismatch("device data fed to a pipeline without a device".into())
            })?;
            trace!(
                slot = %self.name,
                from = %source.memory(),
                to = %target,
                copy_kernel = options.use_copy_kernel,
                "scheduling feed copy"
            );
            let completion = stream.submit(move || source.to_contiguous(target))?;
            let event = stream.record_event()?;
            if options.force_sync {
                event.wait();
            }
            (FedData::Pending(completion), event)
        };

        self.queue.push_back(QueuedFeed {
            data,
            data_id: self.next_data_id.take(),
            batch_size,
        });
        self.next_batch_size = None;
        debug!(slot = %self.name, batch_size, queued = self.queue.len(), no_copy, "fed external input");
        Ok(event)
    }
}

/// All external inputs of a pipeline, ordered by name
pub struct FeedSlots {
    slots: BTreeMap<String, FeedSlot>,
}

impl FeedSlots {
    /// Create one slot per external source node
    pub fn from_graph(graph: &Graph, device_id: i32) -> Result<Self> {
        let mut slots = BTreeMap::new();
        for (node_index, node) in graph.external_sources() {
            let arg = |key: &str| node.args.get(key).cloned();
            let parse_err = |key: &str, e: serde_json::Error| {
                Error::InvalidGraph(format!("external source '{}': bad '{key}': {e}", node.name))
            };
            let declared = node.outputs.first().map(|&e| &graph.edge(e).def);

            let dtype = match arg("dtype") {
                Some(v) => Some(serde_json::from_value(v).map_err(|e| parse_err("dtype", e))?),
                None => declared.and_then(|d| d.dtype),
            };
            let ndim = match arg("ndim") {
                Some(v) => Some(serde_json::from_value(v).map_err(|e| parse_err("ndim", e))?),
                None => declared.and_then(|d| d.ndim),
            };
            let layout = match arg("layout") {
                Some(v) => {
                    let s: String = serde_json::from_value(v).map_err(|e| parse_err("layout", e))?;
                    TensorLayout::new(&s)?
                }
                None => TensorLayout::empty(),
            };
            if let Some(ndim) = ndim {
                layout.check_ndim(ndim)?;
            }
            // A declared layout also determines the dimensionality
            let ndim = ndim.or((!layout.is_empty()).then(|| layout.ndim()));
            let no_copy = match arg("no_copy") {
                Some(v) => serde_json::from_value(v).map_err(|e| parse_err("no_copy", e))?,
                None => false,
            };
            let memory = match node.backend {
                Backend::Cpu => MemoryKind::Host,
                Backend::Gpu | Backend::Mixed => MemoryKind::Device(device_id),
            };

            slots.insert(
                node.name.clone(),
                FeedSlot {
                    name: node.name.clone(),
                    node: node_index,
                    memory,
                    dtype,
                    ndim,
                    layout,
                    no_copy,
                    queue: VecDeque::new(),
                    next_batch_size: None,
                    next_data_id: None,
                },
            );
        }
        Ok(Self { slots })
    }

    /// Number of external inputs
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the graph has no external inputs
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Input names in lexicographic order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Name of the `i`-th input in lexicographic order
    pub fn name(&self, i: usize) -> Result<&str> {
        self.names().nth(i).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "external input index {i} out of range ({} inputs)",
                self.slots.len()
            ))
        })
    }

    /// Slot by name
    pub fn get(&self, name: &str) -> Result<&FeedSlot> {
        self.slots
            .get(name)
            .ok_or_else(|| Error::UnknownName(format!("external input '{name}'")))
    }

    /// Mutable slot by name
    pub fn get_mut(&mut self, name: &str) -> Result<&mut FeedSlot> {
        self.slots
            .get_mut(name)
            .ok_or_else(|| Error::UnknownName(format!("external input '{name}'")))
    }

    /// Require exactly `required` queued feeds in every slot
    pub fn check_exact(&self, required: usize) -> Result<()> {
        for slot in self.slots.values() {
            let fed = slot.queued();
            if fed < required {
                return Err(Error::UnderFed {
                    slot: slot.name.clone(),
                    fed,
                    required,
                });
            }
            if fed > required {
                return Err(Error::OverFed {
                    slot: slot.name.clone(),
                    fed,
                    required,
                });
            }
        }
        Ok(())
    }

    /// Pop one feed from every slot for the next iteration.
    ///
    /// Nothing is popped unless every slot can contribute a batch of the
    /// same size. Returns the feeds keyed by node and the batch size.
    pub(crate) fn take_iteration(
        &mut self,
        default_batch_size: usize,
    ) -> Result<(HashMap<usize, QueuedFeed>, usize)> {
        let mut batch_size = None;
        for slot in self.slots.values() {
            let front = slot.queue.front().ok_or_else(|| Error::UnderFed {
                slot: slot.name.clone(),
                fed: 0,
                required: 1,
            })?;
            match batch_size {
                None => batch_size = Some(front.batch_size),
                Some(n) if n != front.batch_size => {
                    return Err(slot.mismatch(format!(
                        "batch of {} samples while other inputs provide {n}",
                        front.batch_size
                    )));
                }
                Some(_) => {}
            }
        }

        let feeds = self
            .slots
            .values_mut()
            .filter_map(|slot| slot.queue.pop_front().map(|feed| (slot.node, feed)))
            .collect();
        Ok((feeds, batch_size.unwrap_or(default_batch_size)))
    }
}
