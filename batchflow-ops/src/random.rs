//! Random number operators

use batchflow_core::{
    DataType, Error, Operator, OperatorSpec, Result, TensorLayout, TensorList, Workspace,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Kind name
pub const COIN_FLIP: &str = "CoinFlip";

#[derive(Serialize, Deserialize)]
struct RngState {
    seed: [u8; 32],
    word_pos: u128,
}

/// Emits one `int32` per sample, `1` with the given probability
pub struct CoinFlip {
    probability: f64,
    rng: ChaCha8Rng,
}

impl CoinFlip {
    /// Build from the `probability` argument; `seed` overrides the
    /// pipeline-derived seed
    pub fn create(spec: &OperatorSpec) -> Result<Box<dyn Operator>> {
        let probability: f64 = spec.arg_or("probability", 0.5)?;
        if !(0.0..=1.0).contains(&probability) {
            return Err(Error::InvalidGraph(format!(
                "operator '{}': probability {probability} outside [0, 1]",
                spec.name
            )));
        }
        let seed = spec.arg_or("seed", spec.seed)?;
        Ok(Box::new(Self {
            probability,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }))
    }
}

impl Operator for CoinFlip {
    fn run(&mut self, ws: &mut Workspace<'_>) -> Result<()> {
        let batch_size = ws.batch_size();
        let mut out = TensorList::allocate(
            ws.output_memory(),
            vec![vec![1]; batch_size],
            DataType::Int32,
            TensorLayout::empty(),
        )?;
        for sample in out.samples_mut()? {
            let flip = i32::from(self.rng.random_bool(self.probability));
            sample.copy_from_slice(bytemuck::bytes_of(&flip));
        }
        ws.set_output(0, out)
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        let state = RngState {
            seed: self.rng.get_seed(),
            word_pos: self.rng.get_word_pos(),
        };
        Ok(bincode::serialize(&state)?)
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<()> {
        let state: RngState = bincode::deserialize(state)?;
        self.rng = ChaCha8Rng::from_seed(state.seed);
        self.rng.set_word_pos(state.word_pos);
        Ok(())
    }
}
