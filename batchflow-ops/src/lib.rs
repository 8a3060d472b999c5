//! Reference operators for batchflow pipelines
//!
//! [`init`] registers, on top of the core operators:
//!
//! - `SyntheticReader`: stateful reader over a generated dataset with
//!   sharding, shuffling and last-batch padding (outputs `data`, `label`)
//! - `Cast`: element type conversion
//! - `Affine`: `x * scale + shift` producing `float32`
//! - `CoinFlip`: stateful random `int32` per sample

#![warn(missing_docs)]

pub mod convert;
pub mod random;
pub mod reader;
pub mod transform;

use batchflow_core::operator::{register, OperatorSchema};
use batchflow_core::{Backend, Result};
use once_cell::sync::OnceCell;
use tracing::debug;

pub use random::{CoinFlip, COIN_FLIP};
pub use reader::{synthetic_sample, SyntheticReader, SYNTHETIC_READER};
pub use transform::{Affine, Cast, AFFINE, CAST};

static REGISTERED: OnceCell<()> = OnceCell::new();

fn register_all() -> Result<()> {
    register(
        OperatorSchema::new(SYNTHETIC_READER, &[Backend::Cpu], 0, SyntheticReader::create)
            .with_outputs(Some(2)),
    )?;
    register(OperatorSchema::new(
        CAST,
        &[Backend::Cpu, Backend::Gpu],
        1,
        Cast::create,
    ))?;
    register(OperatorSchema::new(
        AFFINE,
        &[Backend::Cpu, Backend::Gpu],
        1,
        Affine::create,
    ))?;
    register(OperatorSchema::new(COIN_FLIP, &[Backend::Cpu], 0, CoinFlip::create))?;
    debug!("reference operators registered");
    Ok(())
}

/// Initialize the core and register the reference operators. Idempotent.
pub fn init() -> Result<()> {
    batchflow_core::init();
    REGISTERED.get_or_try_init(register_all).map(|_| ())
}
