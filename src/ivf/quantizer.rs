//! Vector codes.
//!
//! An inverted list stores one fixed-size code per vector. `Flat` keeps the
//! raw little-endian f32s (4·D bytes); `Sq8` scalar-quantizes each dimension
//! into one byte against a per-dimension range learned at training time.
//! All distances are squared L2; the radius and clamp constants are scaled
//! for that convention.

use serde::{Deserialize, Serialize};

use crate::error::{SimdexError, SimdexResult};

/// Code layout declared at index construction; immutable for the index
/// lifetime and required to match between a base index and its shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    Flat,
    Sq8,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Flat => "Flat",
            Compression::Sq8 => "SQ8",
        }
    }

    pub fn parse(s: &str) -> SimdexResult<Self> {
        match s {
            s if s.eq_ignore_ascii_case("flat") => Ok(Compression::Flat),
            s if s.eq_ignore_ascii_case("sq8") => Ok(Compression::Sq8),
            other => Err(SimdexError::Format(format!(
                "unknown compression: {other} (expected Flat or SQ8)"
            ))),
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            Compression::Flat => 0,
            Compression::Sq8 => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> SimdexResult<Self> {
        match tag {
            0 => Ok(Compression::Flat),
            1 => Ok(Compression::Sq8),
            other => Err(SimdexError::Format(format!("unknown compression tag {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Quantizer {
    Flat {
        dim: usize,
    },
    Sq8 {
        dim: usize,
        /// Per-dimension minimum and range from the training set.
        vmin: Vec<f32>,
        vdiff: Vec<f32>,
    },
}

impl Quantizer {
    pub fn new(compression: Compression, dim: usize) -> Self {
        match compression {
            Compression::Flat => Quantizer::Flat { dim },
            Compression::Sq8 => Quantizer::Sq8 {
                dim,
                vmin: Vec::new(),
                vdiff: Vec::new(),
            },
        }
    }

    pub fn code_size(&self) -> usize {
        match self {
            Quantizer::Flat { dim } => dim * 4,
            Quantizer::Sq8 { dim, .. } => *dim,
        }
    }

    pub fn is_trained(&self) -> bool {
        match self {
            Quantizer::Flat { .. } => true,
            Quantizer::Sq8 { vmin, .. } => !vmin.is_empty(),
        }
    }

    /// Learn per-dimension ranges from a training set. A no-op for `Flat`.
    pub fn train(&mut self, vectors: &[f32]) {
        let Quantizer::Sq8 { dim, vmin, vdiff } = self else {
            return;
        };
        let dim = *dim;
        let mut lo = vec![f32::INFINITY; dim];
        let mut hi = vec![f32::NEG_INFINITY; dim];
        for row in vectors.chunks_exact(dim) {
            for (d, &v) in row.iter().enumerate() {
                lo[d] = lo[d].min(v);
                hi[d] = hi[d].max(v);
            }
        }
        *vdiff = lo.iter().zip(hi.iter()).map(|(l, h)| h - l).collect();
        *vmin = lo;
    }

    /// Append the code for one vector to `out`.
    pub fn encode_into(&self, vector: &[f32], out: &mut Vec<u8>) {
        match self {
            Quantizer::Flat { .. } => {
                for &v in vector {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            Quantizer::Sq8 { vmin, vdiff, .. } => {
                for (d, &v) in vector.iter().enumerate() {
                    let code = if vdiff[d] > 0.0 {
                        (((v - vmin[d]) / vdiff[d]) * 255.0).round().clamp(0.0, 255.0)
                    } else {
                        0.0
                    };
                    out.push(code as u8);
                }
            }
        }
    }

    /// Squared L2 distance between a query and one stored code.
    pub fn distance(&self, query: &[f32], code: &[u8]) -> f32 {
        match self {
            Quantizer::Flat { .. } => {
                let mut acc = 0f32;
                for (chunk, &q) in code.chunks_exact(4).zip(query.iter()) {
                    let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let d = q - v;
                    acc += d * d;
                }
                acc
            }
            Quantizer::Sq8 { vmin, vdiff, .. } => {
                let mut acc = 0f32;
                for (d, (&c, &q)) in code.iter().zip(query.iter()).enumerate() {
                    let v = vmin[d] + (c as f32 / 255.0) * vdiff[d];
                    let diff = q - v;
                    acc += diff * diff;
                }
                acc
            }
        }
    }
}

/// Squared L2 between two raw vectors.
pub fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}
