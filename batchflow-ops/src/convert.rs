//! Element-wise loading and storing of numeric samples

use batchflow_core::{DataType, Error, Result};

macro_rules! load_as {
    ($bytes:expr, $t:ty) => {
        $bytes
            .chunks_exact(std::mem::size_of::<$t>())
            .map(|c| bytemuck::pod_read_unaligned::<$t>(c) as f64)
            .collect()
    };
}

macro_rules! store_as {
    ($values:expr, $out:expr, $t:ty) => {
        for (chunk, &v) in $out.chunks_exact_mut(std::mem::size_of::<$t>()).zip($values) {
            chunk.copy_from_slice(bytemuck::bytes_of(&(v as $t)));
        }
    };
}

fn unsupported(dtype: DataType) -> Error {
    Error::InvalidArgument(format!("element type {dtype} is not supported by this operator"))
}

/// Whether [`load`] and [`store`] handle `dtype`
pub fn is_supported(dtype: DataType) -> bool {
    dtype != DataType::Float16
}

/// Decode one sample into `f64` values
pub fn load(dtype: DataType, bytes: &[u8]) -> Result<Vec<f64>> {
    Ok(match dtype {
        DataType::UInt8 => load_as!(bytes, u8),
        DataType::UInt16 => load_as!(bytes, u16),
        DataType::UInt32 => load_as!(bytes, u32),
        DataType::UInt64 => load_as!(bytes, u64),
        DataType::Int8 => load_as!(bytes, i8),
        DataType::Int16 => load_as!(bytes, i16),
        DataType::Int32 => load_as!(bytes, i32),
        DataType::Int64 => load_as!(bytes, i64),
        DataType::Float32 => load_as!(bytes, f32),
        DataType::Float64 => load_as!(bytes, f64),
        DataType::Bool => bytes.iter().map(|&b| f64::from(u8::from(b != 0))).collect(),
        DataType::Float16 => return Err(unsupported(dtype)),
    })
}

/// Encode `values` into `out`; integer targets saturate
pub fn store(dtype: DataType, values: &[f64], out: &mut [u8]) -> Result<()> {
    if out.len() != values.len() * dtype.size() {
        return Err(Error::InvalidArgument(format!(
            "{} values do not fill {} bytes of {dtype}",
            values.len(),
            out.len()
        )));
    }
    match dtype {
        DataType::UInt8 => store_as!(values, out, u8),
        DataType::UInt16 => store_as!(values, out, u16),
        DataType::UInt32 => store_as!(values, out, u32),
        DataType::UInt64 => store_as!(values, out, u64),
        DataType::Int8 => store_as!(values, out, i8),
        DataType::Int16 => store_as!(values, out, i16),
        DataType::Int32 => store_as!(values, out, i32),
        DataType::Int64 => store_as!(values, out, i64),
        DataType::Float32 => store_as!(values, out, f32),
        DataType::Float64 => store_as!(values, out, f64),
        DataType::Bool => {
            for (b, &v) in out.iter_mut().zip(values) {
                *b = u8::from(v != 0.0);
            }
        }
        DataType::Float16 => return Err(unsupported(dtype)),
    }
    Ok(())
}
