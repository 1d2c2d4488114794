//! Voxel element types shared by the tile and volume stores.
//!
//! Payloads travel through files as little-endian raw bytes tagged with a
//! one-byte dtype code, so both stores stay fully typed on the Rust side
//! without a dynamic array layer. Raw volumes are u8 or u16, one-hot masks
//! are u8, relabeled components are u32, and probability maps are f32.

use crate::error::{Result, VoxtileError};

/// On-disk dtype tag for tile and volume datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    U8,
    U16,
    U32,
    F32,
}

impl Dtype {
    /// One-byte code written to file headers.
    pub fn tag(self) -> u8 {
        match self {
            Dtype::U8 => 1,
            Dtype::U16 => 2,
            Dtype::U32 => 3,
            Dtype::F32 => 4,
        }
    }

    /// Decode a header tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Dtype::U8),
            2 => Some(Dtype::U16),
            3 => Some(Dtype::U32),
            4 => Some(Dtype::F32),
            _ => None,
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Dtype::U8 => 1,
            Dtype::U16 => 2,
            Dtype::U32 | Dtype::F32 => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dtype::U8 => "u8",
            Dtype::U16 => "u16",
            Dtype::U32 => "u32",
            Dtype::F32 => "f32",
        }
    }

    /// Parse a dtype name as written in config files.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "u8" => Ok(Dtype::U8),
            "u16" => Ok(Dtype::U16),
            "u32" => Ok(Dtype::U32),
            "f32" => Ok(Dtype::F32),
            other => Err(VoxtileError::config(format!(
                "unknown element type '{}' (expected u8, u16, u32, or f32)",
                other
            ))),
        }
    }
}

/// A voxel element that can round-trip through the little-endian stores.
pub trait Element: Copy + Send + Sync + PartialEq + 'static {
    const DTYPE: Dtype;
    const ZERO: Self;

    /// Lossy widening used when feeding tiles to a classifier.
    fn to_f32(self) -> f32;

    /// Append the little-endian encoding of `values` to `out`.
    fn encode(values: &[Self], out: &mut Vec<u8>);

    /// Decode little-endian bytes; `bytes.len()` must be a multiple of the
    /// element size.
    fn decode(bytes: &[u8]) -> Vec<Self>;
}

impl Element for u8 {
    const DTYPE: Dtype = Dtype::U8;
    const ZERO: Self = 0;

    fn to_f32(self) -> f32 {
        self as f32
    }

    fn encode(values: &[Self], out: &mut Vec<u8>) {
        out.extend_from_slice(values);
    }

    fn decode(bytes: &[u8]) -> Vec<Self> {
        bytes.to_vec()
    }
}

impl Element for u16 {
    const DTYPE: Dtype = Dtype::U16;
    const ZERO: Self = 0;

    fn to_f32(self) -> f32 {
        self as f32
    }

    fn encode(values: &[Self], out: &mut Vec<u8>) {
        out.reserve(values.len() * 2);
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn decode(bytes: &[u8]) -> Vec<Self> {
        bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    }
}

impl Element for u32 {
    const DTYPE: Dtype = Dtype::U32;
    const ZERO: Self = 0;

    fn to_f32(self) -> f32 {
        self as f32
    }

    fn encode(values: &[Self], out: &mut Vec<u8>) {
        out.reserve(values.len() * 4);
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn decode(bytes: &[u8]) -> Vec<Self> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

impl Element for f32 {
    const DTYPE: Dtype = Dtype::F32;
    const ZERO: Self = 0.0;

    fn to_f32(self) -> f32 {
        self
    }

    fn encode(values: &[Self], out: &mut Vec<u8>) {
        out.reserve(values.len() * 4);
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn decode(bytes: &[u8]) -> Vec<Self> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}
