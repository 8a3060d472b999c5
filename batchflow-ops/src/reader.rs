//! Deterministic in-memory dataset reader with sharding, padding and
//! shuffling
//!
//! Sample `i` of the dataset is [`synthetic_sample`]`(i, sample_bytes)` and
//! its label is `i`. The reader splits the dataset into `num_shards`
//! contiguous shards and walks its shard epoch by epoch, optionally
//! shuffling each epoch and padding the last batch by repeating the last
//! sample. Unless it sticks to its shard, it moves to the next shard after
//! every epoch.

use batchflow_core::{
    DataType, Error, MemoryKind, Operator, OperatorSpec, ReaderMeta, Result, TensorLayout,
    TensorList, Workspace,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Kind name
pub const SYNTHETIC_READER: &str = "SyntheticReader";

/// Trace key carrying the epoch of the emitted batch
pub const EPOCH_TRACE: &str = "epoch";

/// Trace key carrying the shard of the emitted batch
pub const SHARD_TRACE: &str = "shard";

/// Bytes of dataset sample `index`
pub fn synthetic_sample(index: usize, len: usize) -> Vec<u8> {
    (0..len)
        .map(|j| (index.wrapping_mul(31).wrapping_add(j.wrapping_mul(7)) & 0xff) as u8)
        .collect()
}

/// Progress that determines every future batch
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReaderState {
    epoch: u64,
    shard: usize,
    position: usize,
    order: Vec<usize>,
    rng_seed: [u8; 32],
    rng_word_pos: u128,
}

/// Reader over a generated dataset
pub struct SyntheticReader {
    num_samples: usize,
    sample_bytes: usize,
    num_shards: usize,
    shard_id: usize,
    random_shuffle: bool,
    pad_last_batch: bool,
    stick_to_shard: bool,
    max_batch_size: usize,

    epoch: u64,
    shard: usize,
    position: usize,
    order: Vec<usize>,
    rng: ChaCha8Rng,
}

impl SyntheticReader {
    /// Build from graph arguments
    pub fn create(spec: &OperatorSpec) -> Result<Box<dyn Operator>> {
        let num_samples: usize = spec.required_arg("num_samples")?;
        let num_shards: usize = spec.arg_or("num_shards", 1)?;
        let shard_id: usize = spec.arg_or("shard_id", 0)?;
        let sample_bytes: usize = spec.arg_or("sample_bytes", 16)?;
        if num_shards == 0 || shard_id >= num_shards {
            return Err(Error::InvalidGraph(format!(
                "operator '{}': shard {shard_id} out of range for {num_shards} shards",
                spec.name
            )));
        }
        if num_samples < num_shards || sample_bytes == 0 {
            return Err(Error::InvalidGraph(format!(
                "operator '{}': need at least one sample of at least one byte per shard",
                spec.name
            )));
        }

        let mut reader = Self {
            num_samples,
            sample_bytes,
            num_shards,
            shard_id,
            random_shuffle: spec.arg_or("random_shuffle", false)?,
            pad_last_batch: spec.arg_or("pad_last_batch", false)?,
            stick_to_shard: spec.arg_or("stick_to_shard", false)?,
            max_batch_size: spec.max_batch_size,
            epoch: 0,
            shard: shard_id,
            position: 0,
            order: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(spec.seed),
        };
        reader.start_epoch();
        debug!(
            operator = %spec.name,
            num_samples,
            num_shards,
            shard_id,
            "synthetic reader ready"
        );
        Ok(Box::new(reader))
    }

    fn shard_range(&self, shard: usize) -> std::ops::Range<usize> {
        let begin = self.num_samples * shard / self.num_shards;
        let end = self.num_samples * (shard + 1) / self.num_shards;
        begin..end
    }

    fn largest_shard(&self) -> usize {
        (0..self.num_shards)
            .map(|s| self.shard_range(s).len())
            .max()
            .unwrap_or(0)
    }

    /// Samples served per epoch, counting padding
    fn epoch_len(&self) -> usize {
        if self.pad_last_batch {
            self.largest_shard().div_ceil(self.max_batch_size) * self.max_batch_size
        } else {
            self.order.len()
        }
    }

    fn start_epoch(&mut self) {
        self.order = self.shard_range(self.shard).collect();
        if self.random_shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.position = 0;
    }

    fn roll_over_if_done(&mut self) {
        if self.position >= self.epoch_len() {
            self.epoch += 1;
            if !self.stick_to_shard {
                self.shard = (self.shard + 1) % self.num_shards;
            }
            self.start_epoch();
        }
    }

    fn next_index(&mut self) -> usize {
        self.roll_over_if_done();
        let index = match self.order.get(self.position) {
            Some(&index) => index,
            // Padding repeats the last sample of the shard
            None => self.order.last().copied().unwrap_or(0),
        };
        self.position += 1;
        index
    }

    fn state(&self) -> ReaderState {
        ReaderState {
            epoch: self.epoch,
            shard: self.shard,
            position: self.position,
            order: self.order.clone(),
            rng_seed: self.rng.get_seed(),
            rng_word_pos: self.rng.get_word_pos(),
        }
    }
}

impl Operator for SyntheticReader {
    fn run(&mut self, ws: &mut Workspace<'_>) -> Result<()> {
        let batch_size = ws.batch_size();
        self.roll_over_if_done();
        let (epoch, shard) = (self.epoch, self.shard);
        let indices: Vec<usize> = (0..batch_size).map(|_| self.next_index()).collect();

        let memory: MemoryKind = ws.output_memory();
        let mut data = TensorList::allocate(
            memory,
            vec![vec![self.sample_bytes]; batch_size],
            DataType::UInt8,
            TensorLayout::empty(),
        )?;
        let mut labels = TensorList::allocate(
            memory,
            vec![vec![1]; batch_size],
            DataType::Int32,
            TensorLayout::empty(),
        )?;
        for (sample, &index) in data.samples_mut()?.into_iter().zip(&indices) {
            sample.copy_from_slice(&synthetic_sample(index, self.sample_bytes));
        }
        for (label, &index) in labels.samples_mut()?.into_iter().zip(&indices) {
            let value = i32::try_from(index)
                .map_err(|_| Error::InvalidArgument(format!("sample index {index} exceeds int32")))?;
            label.copy_from_slice(bytemuck::bytes_of(&value));
        }

        ws.set_trace(EPOCH_TRACE, epoch.to_string());
        ws.set_trace(SHARD_TRACE, shard.to_string());
        ws.set_output(0, data)?;
        ws.set_output(1, labels)
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.state())?)
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<()> {
        let state: ReaderState = bincode::deserialize(state)?;
        if state.shard >= self.num_shards {
            return Err(Error::Checkpoint(format!(
                "reader state names shard {} of {}",
                state.shard, self.num_shards
            )));
        }
        self.epoch = state.epoch;
        self.shard = state.shard;
        self.position = state.position;
        self.order = state.order;
        self.rng = ChaCha8Rng::from_seed(state.rng_seed);
        self.rng.set_word_pos(state.rng_word_pos);
        Ok(())
    }

    fn reader_meta(&self) -> Option<ReaderMeta> {
        let epoch_size_padded = if self.pad_last_batch {
            self.epoch_len() * self.num_shards
        } else {
            self.num_samples
        };
        Some(ReaderMeta {
            epoch_size: self.num_samples as i64,
            epoch_size_padded: epoch_size_padded as i64,
            number_of_shards: self.num_shards as i32,
            shard_id: self.shard_id as i32,
            pad_last_batch: self.pad_last_batch,
            stick_to_shard: self.stick_to_shard,
        })
    }
}
