//! Batch buffers: a list of samples with per-sample shapes

use bytemuck::Pod;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::types::{DataType, MemoryKind, StorageDevice, TensorLayout};

/// Backing memory of a [`TensorList`]
#[derive(Debug, Clone)]
pub enum TensorData {
    /// All samples packed back to back in one buffer
    Contiguous(Buffer),

    /// One buffer per sample
    Scattered(Vec<Buffer>),
}

/// Batch of samples sharing dtype, dimensionality, layout and memory kind
#[derive(Debug, Clone)]
pub struct TensorList {
    data: TensorData,
    shapes: Vec<Vec<usize>>,
    dtype: DataType,
    layout: TensorLayout,
    memory: MemoryKind,
}

fn volume(shape: &[usize]) -> usize {
    shape.iter().product()
}

fn check_shapes(shapes: &[Vec<usize>], layout: &TensorLayout) -> Result<()> {
    if let Some(first) = shapes.first() {
        let ndim = first.len();
        if let Some(bad) = shapes.iter().position(|s| s.len() != ndim) {
            return Err(Error::InvalidArgument(format!(
                "sample {bad} has {} dimensions, expected {ndim}",
                shapes[bad].len()
            )));
        }
        layout.check_ndim(ndim)?;
    }
    Ok(())
}

impl TensorList {
    /// Batch over one packed buffer
    pub fn contiguous(
        buffer: Buffer,
        shapes: Vec<Vec<usize>>,
        dtype: DataType,
        layout: TensorLayout,
    ) -> Result<Self> {
        check_shapes(&shapes, &layout)?;
        let needed: usize = shapes.iter().map(|s| volume(s) * dtype.size()).sum();
        if buffer.len() < needed {
            return Err(Error::InvalidArgument(format!(
                "buffer of {} bytes too small for batch of {needed} bytes",
                buffer.len()
            )));
        }
        Ok(Self {
            memory: buffer.memory(),
            data: TensorData::Contiguous(buffer),
            shapes,
            dtype,
            layout,
        })
    }

    /// Batch over one buffer per sample
    pub fn scattered(
        buffers: Vec<Buffer>,
        shapes: Vec<Vec<usize>>,
        dtype: DataType,
        layout: TensorLayout,
        memory: MemoryKind,
    ) -> Result<Self> {
        check_shapes(&shapes, &layout)?;
        if buffers.len() != shapes.len() {
            return Err(Error::InvalidArgument(format!(
                "{} sample buffers for {} shapes",
                buffers.len(),
                shapes.len()
            )));
        }
        for (k, (buffer, shape)) in buffers.iter().zip(&shapes).enumerate() {
            if buffer.len() < volume(shape) * dtype.size() {
                return Err(Error::InvalidArgument(format!(
                    "sample {k} buffer holds {} bytes, shape {shape:?} needs {}",
                    buffer.len(),
                    volume(shape) * dtype.size()
                )));
            }
            if buffer.memory() != memory {
                return Err(Error::InvalidArgument(format!(
                    "sample {k} lives in {} memory, batch is {memory}",
                    buffer.memory()
                )));
            }
        }
        Ok(Self {
            data: TensorData::Scattered(buffers),
            shapes,
            dtype,
            layout,
            memory,
        })
    }

    /// Allocate a contiguous batch from the memory pool
    pub fn allocate(
        memory: MemoryKind,
        shapes: Vec<Vec<usize>>,
        dtype: DataType,
        layout: TensorLayout,
    ) -> Result<Self> {
        let bytes: usize = shapes.iter().map(|s| volume(s) * dtype.size()).sum();
        let buffer = Buffer::allocate(memory, bytes)?;
        Self::contiguous(buffer, shapes, dtype, layout)
    }

    /// Copy packed bytes into a new contiguous batch
    pub fn from_bytes(
        memory: MemoryKind,
        shapes: Vec<Vec<usize>>,
        dtype: DataType,
        layout: TensorLayout,
        bytes: &[u8],
    ) -> Result<Self> {
        let mut list = Self::allocate(memory, shapes, dtype, layout)?;
        if bytes.len() != list.nbytes() {
            return Err(Error::InvalidArgument(format!(
                "{} bytes supplied for batch of {} bytes",
                bytes.len(),
                list.nbytes()
            )));
        }
        let mut offset = 0;
        for sample in list.samples_mut()? {
            sample.copy_from_slice(&bytes[offset..offset + sample.len()]);
            offset += sample.len();
        }
        Ok(list)
    }

    /// Backing memory
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Packed buffer, if the batch is contiguous
    pub fn contiguous_buffer(&self) -> Option<&Buffer> {
        match &self.data {
            TensorData::Contiguous(buffer) => Some(buffer),
            TensorData::Scattered(_) => None,
        }
    }

    /// Whether the batch is packed in one buffer
    pub fn is_contiguous(&self) -> bool {
        matches!(self.data, TensorData::Contiguous(_))
    }

    /// Number of samples
    pub fn num_samples(&self) -> usize {
        self.shapes.len()
    }

    /// Dimensionality of every sample (0 for an empty batch)
    pub fn sample_dim(&self) -> usize {
        self.shapes.first().map_or(0, Vec::len)
    }

    /// Per-sample shapes
    pub fn shapes(&self) -> &[Vec<usize>] {
        &self.shapes
    }

    /// Shape of sample `k`
    pub fn shape(&self, k: usize) -> Result<&[usize]> {
        self.shapes.get(k).map(Vec::as_slice).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "sample index {k} out of range for batch of {}",
                self.shapes.len()
            ))
        })
    }

    /// Element type
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Axis layout
    pub fn layout(&self) -> &TensorLayout {
        &self.layout
    }

    /// Replace the layout
    pub fn set_layout(&mut self, layout: TensorLayout) -> Result<()> {
        if !self.shapes.is_empty() {
            layout.check_ndim(self.sample_dim())?;
        }
        self.layout = layout;
        Ok(())
    }

    /// Memory kind of the samples
    pub fn memory(&self) -> MemoryKind {
        self.memory
    }

    /// Coarse device of the samples
    pub fn device(&self) -> StorageDevice {
        self.memory.storage_device()
    }

    /// Whether every sample has the same shape
    pub fn is_uniform(&self) -> bool {
        self.shapes.windows(2).all(|w| w[0] == w[1])
    }

    /// Shape of the whole batch as a dense tensor, `[n, d0, d1, ...]`
    pub fn uniform_shape(&self) -> Option<Vec<usize>> {
        if !self.is_uniform() {
            return None;
        }
        let mut shape = vec![self.num_samples()];
        if let Some(first) = self.shapes.first() {
            shape.extend_from_slice(first);
        }
        Some(shape)
    }

    /// Total number of elements across samples
    pub fn num_elements(&self) -> usize {
        self.shapes.iter().map(|s| volume(s)).sum()
    }

    /// Bytes of sample `k`
    pub fn sample_nbytes(&self, k: usize) -> Result<usize> {
        Ok(volume(self.shape(k)?) * self.dtype.size())
    }

    /// Total payload bytes
    pub fn nbytes(&self) -> usize {
        self.num_elements() * self.dtype.size()
    }

    /// Largest sample in bytes
    pub fn max_sample_nbytes(&self) -> usize {
        self.shapes
            .iter()
            .map(|s| volume(s) * self.dtype.size())
            .max()
            .unwrap_or(0)
    }

    /// Bytes reserved by the backing storage
    pub fn reserved_bytes(&self) -> usize {
        match &self.data {
            TensorData::Contiguous(buffer) => buffer.reserved_bytes(),
            TensorData::Scattered(buffers) => buffers.iter().map(Buffer::reserved_bytes).sum(),
        }
    }

    /// Largest per-sample reservation
    pub fn max_reserved_sample_bytes(&self) -> usize {
        match &self.data {
            TensorData::Contiguous(_) => self.max_sample_nbytes(),
            TensorData::Scattered(buffers) => {
                buffers.iter().map(Buffer::reserved_bytes).max().unwrap_or(0)
            }
        }
    }

    fn sample_offsets(&self) -> Vec<usize> {
        let mut offset = 0;
        self.shapes
            .iter()
            .map(|s| {
                let start = offset;
                offset += volume(s) * self.dtype.size();
                start
            })
            .collect()
    }

    /// View of sample `k`
    pub fn sample_buffer(&self, k: usize) -> Result<Buffer> {
        let nbytes = self.sample_nbytes(k)?;
        match &self.data {
            TensorData::Contiguous(buffer) => {
                let start = self.sample_offsets()[k];
                buffer.slice(start..start + nbytes)
            }
            TensorData::Scattered(buffers) => buffers[k].slice(0..nbytes),
        }
    }

    /// Bytes of every sample
    pub fn samples(&self) -> Vec<&[u8]> {
        match &self.data {
            TensorData::Contiguous(buffer) => {
                let bytes = buffer.as_slice();
                self.sample_offsets()
                    .into_iter()
                    .zip(&self.shapes)
                    .map(|(start, s)| &bytes[start..start + volume(s) * self.dtype.size()])
                    .collect()
            }
            TensorData::Scattered(buffers) => buffers
                .iter()
                .zip(&self.shapes)
                .map(|(b, s)| &b.as_slice()[..volume(s) * self.dtype.size()])
                .collect(),
        }
    }

    /// Bytes of sample `k`
    pub fn sample(&self, k: usize) -> Result<&[u8]> {
        self.shape(k)?;
        Ok(self.samples()[k])
    }

    /// Sample `k` reinterpreted as elements of `T`
    pub fn sample_as<T: Pod>(&self, k: usize) -> Result<&[T]> {
        if std::mem::size_of::<T>() != self.dtype.size() {
            return Err(Error::InvalidArgument(format!(
                "element of {} bytes requested from {} batch",
                std::mem::size_of::<T>(),
                self.dtype
            )));
        }
        bytemuck::try_cast_slice(self.sample(k)?)
            .map_err(|e| Error::LayoutError(format!("sample {k}: {e}")))
    }

    /// Mutable bytes of every sample; requires unshared storage
    pub fn samples_mut(&mut self) -> Result<Vec<&mut [u8]>> {
        let sizes: Vec<usize> = self.shapes.iter().map(|s| volume(s) * self.dtype.size()).collect();
        match &mut self.data {
            TensorData::Contiguous(buffer) => {
                let mut rest = buffer.as_mut_slice()?;
                let mut out = Vec::with_capacity(sizes.len());
                for size in sizes {
                    let (head, tail) = std::mem::take(&mut rest).split_at_mut(size);
                    out.push(head);
                    rest = tail;
                }
                Ok(out)
            }
            TensorData::Scattered(buffers) => buffers
                .iter_mut()
                .zip(sizes)
                .map(|(b, size)| b.as_mut_slice().map(|s| &mut s[..size]))
                .collect(),
        }
    }

    /// Copy into a new contiguous batch in `memory`
    pub fn to_contiguous(&self, memory: MemoryKind) -> Result<Self> {
        let mut out = Self::allocate(memory, self.shapes.clone(), self.dtype, self.layout.clone())?;
        for (dst, src) in out.samples_mut()?.into_iter().zip(self.samples()) {
            dst.copy_from_slice(src);
        }
        Ok(out)
    }

    /// Copy the whole batch densely into `dst`
    pub fn copy_to_slice(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < self.nbytes() {
            return Err(Error::InvalidArgument(format!(
                "destination of {} bytes too small for {} bytes",
                dst.len(),
                self.nbytes()
            )));
        }
        let mut offset = 0;
        for sample in self.samples() {
            dst[offset..offset + sample.len()].copy_from_slice(sample);
            offset += sample.len();
        }
        Ok(())
    }
}
