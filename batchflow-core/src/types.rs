//! Element types, backends, memory kinds and layouts

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 8-bit unsigned integer
    UInt8,

    /// 16-bit unsigned integer
    UInt16,

    /// 32-bit unsigned integer
    UInt32,

    /// 64-bit unsigned integer
    UInt64,

    /// 8-bit signed integer
    Int8,

    /// 16-bit signed integer
    Int16,

    /// 32-bit signed integer
    Int32,

    /// 64-bit signed integer
    Int64,

    /// 16-bit floating point
    Float16,

    /// 32-bit floating point
    Float32,

    /// 64-bit floating point
    Float64,

    /// Boolean stored as one byte
    Bool,
}

impl DataType {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            DataType::UInt8 | DataType::Int8 | DataType::Bool => 1,
            DataType::UInt16 | DataType::Int16 | DataType::Float16 => 2,
            DataType::UInt32 | DataType::Int32 | DataType::Float32 => 4,
            DataType::UInt64 | DataType::Int64 | DataType::Float64 => 8,
        }
    }

    /// Numeric code used at the C boundary
    pub fn code(self) -> i32 {
        match self {
            DataType::UInt8 => 0,
            DataType::UInt16 => 1,
            DataType::UInt32 => 2,
            DataType::UInt64 => 3,
            DataType::Int8 => 4,
            DataType::Int16 => 5,
            DataType::Int32 => 6,
            DataType::Int64 => 7,
            DataType::Float16 => 8,
            DataType::Float32 => 9,
            DataType::Float64 => 10,
            DataType::Bool => 11,
        }
    }

    /// Inverse of [`DataType::code`]
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => DataType::UInt8,
            1 => DataType::UInt16,
            2 => DataType::UInt32,
            3 => DataType::UInt64,
            4 => DataType::Int8,
            5 => DataType::Int16,
            6 => DataType::Int32,
            7 => DataType::Int64,
            8 => DataType::Float16,
            9 => DataType::Float32,
            10 => DataType::Float64,
            11 => DataType::Bool,
            _ => return None,
        })
    }

    /// Whether this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float16 | DataType::Float32 | DataType::Float64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float16 => "float16",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Where an operator executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Host-only operator
    Cpu,

    /// Device-only operator
    Gpu,

    /// Host input, device output
    Mixed,
}

impl Backend {
    /// Device the outputs of an operator with this backend live on
    pub fn output_device(self) -> StorageDevice {
        match self {
            Backend::Cpu => StorageDevice::Cpu,
            Backend::Gpu | Backend::Mixed => StorageDevice::Gpu,
        }
    }

    /// Device the inputs of an operator with this backend must live on
    pub fn input_device(self) -> StorageDevice {
        match self {
            Backend::Cpu | Backend::Mixed => StorageDevice::Cpu,
            Backend::Gpu => StorageDevice::Gpu,
        }
    }

    /// Numeric code used at the C boundary
    pub fn code(self) -> i32 {
        match self {
            Backend::Cpu => 0,
            Backend::Gpu => 1,
            Backend::Mixed => 2,
        }
    }
}

/// Coarse device tag exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDevice {
    /// Host memory (pageable or pinned)
    Cpu,

    /// Device memory
    Gpu,
}

impl StorageDevice {
    /// Numeric code used at the C boundary
    pub fn code(self) -> i32 {
        match self {
            StorageDevice::Cpu => 0,
            StorageDevice::Gpu => 1,
        }
    }

    /// Inverse of [`StorageDevice::code`]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(StorageDevice::Cpu),
            1 => Some(StorageDevice::Gpu),
            _ => None,
        }
    }
}

/// Precise memory placement of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Pageable host memory
    Host,

    /// Page-locked host memory
    Pinned,

    /// Memory of the device with the given ordinal
    Device(i32),
}

impl MemoryKind {
    /// Coarse device tag
    pub fn storage_device(self) -> StorageDevice {
        match self {
            MemoryKind::Host | MemoryKind::Pinned => StorageDevice::Cpu,
            MemoryKind::Device(_) => StorageDevice::Gpu,
        }
    }

    /// Whether the memory is host-addressable without a transfer
    pub fn is_host(self) -> bool {
        matches!(self, MemoryKind::Host | MemoryKind::Pinned)
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryKind::Host => f.write_str("host"),
            MemoryKind::Pinned => f.write_str("pinned"),
            MemoryKind::Device(id) => write!(f, "gpu:{id}"),
        }
    }
}

/// Axis semantics of a sample, one character per dimension (e.g. `HWC`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorLayout(String);

impl TensorLayout {
    /// Layout with no axis information
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Create a layout, rejecting non-ASCII or repeated axis names
    pub fn new(layout: &str) -> Result<Self> {
        if !layout.is_ascii() {
            return Err(Error::InvalidArgument(format!("layout '{layout}' is not ASCII")));
        }
        let bytes = layout.as_bytes();
        for (i, axis) in bytes.iter().enumerate() {
            if bytes[..i].contains(axis) {
                return Err(Error::InvalidArgument(format!(
                    "layout '{layout}' repeats axis '{}'",
                    *axis as char
                )));
            }
        }
        Ok(Self(layout.to_string()))
    }

    /// Layout string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether no layout is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of axes described
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Check the layout against a sample dimensionality
    pub fn check_ndim(&self, ndim: usize) -> Result<()> {
        if !self.is_empty() && self.ndim() != ndim {
            return Err(Error::InvalidArgument(format!(
                "layout '{}' has {} axes but samples have {} dimensions",
                self.0,
                self.ndim(),
                ndim
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(DataType::UInt8, 1)]
    #[test_case(DataType::Float16, 2)]
    #[test_case(DataType::Int32, 4)]
    #[test_case(DataType::Float64, 8)]
    #[test_case(DataType::Bool, 1)]
    fn test_dtype_size(dtype: DataType, size: usize) {
        assert_eq!(dtype.size(), size);
        assert_eq!(DataType::from_code(dtype.code()), Some(dtype));
    }

    #[test]
    fn test_dtype_serde_names() {
        let json = serde_json::to_string(&DataType::Float32).unwrap();
        assert_eq!(json, "\"float32\"");
        let parsed: DataType = serde_json::from_str("\"uint8\"").unwrap();
        assert_eq!(parsed, DataType::UInt8);
        assert_eq!(DataType::from_code(42), None);
    }

    #[test]
    fn test_backend_devices() {
        assert_eq!(Backend::Mixed.input_device(), StorageDevice::Cpu);
        assert_eq!(Backend::Mixed.output_device(), StorageDevice::Gpu);
        assert_eq!(Backend::Gpu.input_device(), StorageDevice::Gpu);
        assert_eq!(MemoryKind::Pinned.storage_device(), StorageDevice::Cpu);
    }

    #[test]
    fn test_layout_validation() {
        let layout = TensorLayout::new("HWC").unwrap();
        assert_eq!(layout.ndim(), 3);
        assert!(layout.check_ndim(3).is_ok());
        assert!(layout.check_ndim(2).is_err());
        assert!(TensorLayout::new("HWH").is_err());
        assert!(TensorLayout::empty().check_ndim(5).is_ok());
    }
}
