//! Model tensors and their transport encoding.
//!
//! `Parameters` is what crosses the wire: one opaque byte buffer per model
//! tensor, in the model's deterministic parameter order. Strategies decode to
//! `Tensor`s before aggregating and encode the consensus back.
//!
//! Buffer layout (little endian): `u32` rank, `rank` x `u64` dims, then
//! `product(dims)` x `f32` values.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const NDARRAY_TENSOR_TYPE: &str = "numpy.ndarray";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::InvalidTensor { shape, expected, found: data.len() });
        }
        Ok(Self { shape, data })
    }

    /// Rank-1 tensor over `data`.
    pub fn from_vec(data: Vec<f32>) -> Self { Self { shape: vec![data.len()], data } }

    /// Rank-0 tensor.
    pub fn scalar(value: f32) -> Self { Self { shape: Vec::new(), data: vec![value] } }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let n = shape.iter().product();
        Self { shape, data: vec![0.0; n] }
    }

    pub fn shape(&self) -> &[usize] { &self.shape }
    pub fn data(&self) -> &[f32] { &self.data }
    pub fn data_mut(&mut self) -> &mut [f32] { &mut self.data }
    pub fn len(&self) -> usize { self.data.len() }
    pub fn is_empty(&self) -> bool { self.data.is_empty() }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Parameters {
    pub tensors: Vec<Vec<u8>>,
    pub tensor_type: String,
}

impl Parameters {
    pub fn is_empty(&self) -> bool { self.tensors.is_empty() }
}

pub fn ndarrays_to_parameters(arrays: &[Tensor]) -> Parameters {
    Parameters { tensors: arrays.iter().map(encode).collect(), tensor_type: NDARRAY_TENSOR_TYPE.to_string() }
}

pub fn parameters_to_ndarrays(parameters: &Parameters) -> Result<Vec<Tensor>> {
    parameters.tensors.iter().enumerate().map(|(i, buf)| decode(buf).map_err(|e| Error::Codec(format!("tensor {i}: {e}")))).collect()
}

fn encode(t: &Tensor) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 8 * t.shape.len() + 4 * t.data.len());
    buf.extend_from_slice(&(t.shape.len() as u32).to_le_bytes());
    for d in &t.shape { buf.extend_from_slice(&(*d as u64).to_le_bytes()); }
    for v in &t.data { buf.extend_from_slice(&v.to_le_bytes()); }
    buf
}

fn decode(buf: &[u8]) -> std::result::Result<Tensor, String> {
    let (rank_bytes, mut rest) = split(buf, 4)?;
    let rank = u32::from_le_bytes([rank_bytes[0], rank_bytes[1], rank_bytes[2], rank_bytes[3]]) as usize;
    let mut shape = Vec::with_capacity(rank);
    for _ in 0..rank {
        let (dim, tail) = split(rest, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(dim);
        shape.push(usize::try_from(u64::from_le_bytes(raw)).map_err(|_| "dimension overflows usize".to_string())?);
        rest = tail;
    }
    let n = shape.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d)).ok_or("element count overflows usize")?;
    if rest.len() != n * 4 {
        return Err(format!("expected {} value bytes for shape {:?}, found {}", n * 4, shape, rest.len()));
    }
    let data = rest.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
    Ok(Tensor { shape, data })
}

fn split(buf: &[u8], n: usize) -> std::result::Result<(&[u8], &[u8]), String> {
    if buf.len() < n { return Err(format!("truncated buffer: need {n} bytes, have {}", buf.len())); }
    Ok(buf.split_at(n))
}
