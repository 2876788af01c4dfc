//! Compiled model format.
//!
//! Little-endian throughout:
//!
//! ```text
//! "RVQM"  u32 schema  u16 height  u16 width  u16 channels  u16 layer_count
//! layer*:
//!   u8 1 (avg-pool)  u16 size
//!   u8 2 (dense)     u16 outputs  u8 relu  i32 multiplier  u8 shift
//!                    i8[outputs * inputs] weights  i32[outputs] bias
//! ```
//!
//! Tensors are int8 with a zero point of 0. A dense layer accumulates in
//! 64 bits on top of its i32 bias, then requantizes with a Q31 multiplier
//! followed by a right shift.

use crate::error::ModelError;
use std::path::Path;

pub const MAGIC: &[u8; 4] = b"RVQM";
pub const SCHEMA_VERSION: u32 = 1;
/// Drive classes the final layer must produce.
pub const NUM_CLASSES: usize = 3;
/// Largest fan-in a dense layer may have.
pub const MAX_DENSE_INPUTS: usize = 1 << 17;
/// Largest pooling window edge. Keeps a window sum of int8 values inside i32.
pub const MAX_POOL_SIZE: u16 = 256;

const KIND_AVG_POOL: u8 = 1;
const KIND_DENSE: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl TensorShape {
    pub fn len(&self) -> usize {
        self.height * self.width * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Layer {
    /// Non-overlapping `size`x`size` average over each channel.
    AvgPool { size: u16 },
    Dense {
        outputs: u16,
        relu: bool,
        multiplier: i32,
        shift: u8,
        weights: Vec<i8>,
        bias: Vec<i32>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompiledModel {
    pub input: TensorShape,
    pub layers: Vec<Layer>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ModelError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(ModelError::Truncated(self.pos))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ModelError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ModelError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ModelError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, ModelError> {
        Ok(self.u32()? as i32)
    }
}

fn invalid(index: usize, reason: impl Into<String>) -> ModelError {
    ModelError::InvalidLayer {
        index,
        reason: reason.into(),
    }
}

impl CompiledModel {
    pub fn read(path: &Path) -> Result<Self, ModelError> {
        Self::parse(&std::fs::read(path)?)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ModelError> {
        let mut r = Reader { bytes, pos: 0 };
        if r.take(4)? != MAGIC {
            return Err(ModelError::BadMagic);
        }
        let version = r.u32()?;
        if version != SCHEMA_VERSION {
            return Err(ModelError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: version,
            });
        }
        let input = TensorShape {
            height: r.u16()? as usize,
            width: r.u16()? as usize,
            channels: r.u16()? as usize,
        };
        let count = r.u16()? as usize;
        let mut layers = Vec::with_capacity(count);
        let mut shape = input;
        for index in 0..count {
            let layer = match r.u8()? {
                KIND_AVG_POOL => Layer::AvgPool { size: r.u16()? },
                KIND_DENSE => {
                    let outputs = r.u16()?;
                    let relu = r.u8()? != 0;
                    let multiplier = r.i32()?;
                    let shift = r.u8()?;
                    let n = outputs as usize * shape.len();
                    let weights = r.take(n)?.iter().map(|b| *b as i8).collect();
                    let mut bias = Vec::with_capacity(outputs as usize);
                    for _ in 0..outputs {
                        bias.push(r.i32()?);
                    }
                    Layer::Dense {
                        outputs,
                        relu,
                        multiplier,
                        shift,
                        weights,
                        bias,
                    }
                }
                other => return Err(invalid(index, format!("unknown layer kind {other}"))),
            };
            shape = layer.output_shape(index, shape)?;
            layers.push(layer);
        }
        if r.pos != bytes.len() {
            return Err(invalid(count, "trailing bytes after last layer"));
        }
        let model = Self { input, layers };
        model.shapes()?;
        Ok(model)
    }

    /// Serialises the model. Fails if a dimension or count does not fit the
    /// format's 16-bit fields.
    pub fn encode(&self) -> Result<Vec<u8>, ModelError> {
        let field = |what: &'static str, value: usize| {
            u16::try_from(value).map_err(|_| ModelError::FieldOverflow { what, value })
        };
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
        for (what, dim) in [
            ("height", self.input.height),
            ("width", self.input.width),
            ("channels", self.input.channels),
        ] {
            out.extend_from_slice(&field(what, dim)?.to_le_bytes());
        }
        out.extend_from_slice(&field("layer count", self.layers.len())?.to_le_bytes());
        for layer in &self.layers {
            match layer {
                Layer::AvgPool { size } => {
                    out.push(KIND_AVG_POOL);
                    out.extend_from_slice(&size.to_le_bytes());
                }
                Layer::Dense {
                    outputs,
                    relu,
                    multiplier,
                    shift,
                    weights,
                    bias,
                } => {
                    out.push(KIND_DENSE);
                    out.extend_from_slice(&outputs.to_le_bytes());
                    out.push(*relu as u8);
                    out.extend_from_slice(&multiplier.to_le_bytes());
                    out.push(*shift);
                    out.extend(weights.iter().map(|w| *w as u8));
                    for b in bias {
                        out.extend_from_slice(&b.to_le_bytes());
                    }
                }
            }
        }
        Ok(out)
    }

    /// Input shape followed by every layer's output shape. Checks that the
    /// graph ends in one score per drive class.
    pub fn shapes(&self) -> Result<Vec<TensorShape>, ModelError> {
        if self.input.is_empty() {
            return Err(invalid(0, "empty input shape"));
        }
        let mut shapes = Vec::with_capacity(self.layers.len() + 1);
        let mut shape = self.input;
        shapes.push(shape);
        for (index, layer) in self.layers.iter().enumerate() {
            shape = layer.output_shape(index, shape)?;
            shapes.push(shape);
        }
        if shape.len() != NUM_CLASSES {
            return Err(ModelError::OutputCount {
                expected: NUM_CLASSES,
                found: shape.len(),
            });
        }
        Ok(shapes)
    }

    /// Arena bytes the runtime needs: input, weights and every activation.
    pub fn arena_requirement(&self) -> Result<usize, ModelError> {
        let shapes = self.shapes()?;
        let activations: usize = shapes.iter().map(TensorShape::len).sum();
        let weights: usize = self
            .layers
            .iter()
            .map(|l| match l {
                Layer::Dense { weights, .. } => weights.len(),
                Layer::AvgPool { .. } => 0,
            })
            .sum();
        Ok(activations + weights)
    }
}

impl Layer {
    pub fn output_shape(&self, index: usize, input: TensorShape) -> Result<TensorShape, ModelError> {
        match self {
            Layer::AvgPool { size } => {
                if *size > MAX_POOL_SIZE {
                    return Err(invalid(index, format!("pool {size} exceeds {MAX_POOL_SIZE}")));
                }
                let k = *size as usize;
                if k == 0 || input.height % k != 0 || input.width % k != 0 {
                    return Err(invalid(
                        index,
                        format!("pool {k} does not tile {}x{}", input.height, input.width),
                    ));
                }
                Ok(TensorShape {
                    height: input.height / k,
                    width: input.width / k,
                    channels: input.channels,
                })
            }
            Layer::Dense {
                outputs,
                multiplier,
                shift,
                weights,
                bias,
                ..
            } => {
                let inputs = input.len();
                let outputs = *outputs as usize;
                if outputs == 0 {
                    return Err(invalid(index, "dense layer without outputs"));
                }
                if inputs > MAX_DENSE_INPUTS {
                    return Err(invalid(index, format!("{inputs} inputs exceeds limit")));
                }
                if weights.len() != inputs * outputs || bias.len() != outputs {
                    return Err(invalid(index, "weight or bias count does not match shape"));
                }
                if *multiplier <= 0 || *shift > 31 {
                    return Err(invalid(index, "requantization parameters out of range"));
                }
                Ok(TensorShape {
                    height: 1,
                    width: 1,
                    channels: outputs,
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Pools a 4x4x1 input to 2x2 and maps it to three classes. Class `k`
    /// responds to quadrant `k`.
    pub(crate) fn tiny_model() -> CompiledModel {
        CompiledModel {
            input: TensorShape {
                height: 4,
                width: 4,
                channels: 1,
            },
            layers: vec![
                Layer::AvgPool { size: 2 },
                Layer::Dense {
                    outputs: 3,
                    relu: false,
                    multiplier: i32::MAX,
                    shift: 0,
                    weights: vec![
                        1, 0, 0, 0, //
                        0, 1, 0, 0, //
                        0, 0, 1, 0,
                    ],
                    bias: vec![0, 0, 0],
                },
            ],
        }
    }

    #[test]
    fn encode_parse_preserves_model() {
        let model = tiny_model();
        let bytes = model.encode().unwrap();
        assert_eq!(CompiledModel::parse(&bytes).unwrap(), model);
    }

    #[test]
    fn wrong_schema_is_rejected() {
        let mut bytes = tiny_model().encode().unwrap();
        bytes[4..8].copy_from_slice(&(SCHEMA_VERSION + 1).to_le_bytes());
        match CompiledModel::parse(&bytes) {
            Err(ModelError::SchemaMismatch { expected, found }) => {
                assert_eq!(expected, SCHEMA_VERSION);
                assert_eq!(found, SCHEMA_VERSION + 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncation_and_magic_are_detected() {
        let bytes = tiny_model().encode().unwrap();
        assert!(matches!(
            CompiledModel::parse(&bytes[..bytes.len() - 1]),
            Err(ModelError::Truncated(_))
        ));
        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(CompiledModel::parse(&bad), Err(ModelError::BadMagic)));
        let mut long = bytes;
        long.push(0);
        assert!(matches!(
            CompiledModel::parse(&long),
            Err(ModelError::InvalidLayer { .. })
        ));
    }

    #[test]
    fn class_count_is_enforced() {
        let mut model = tiny_model();
        model.layers.pop();
        assert!(matches!(
            model.shapes(),
            Err(ModelError::OutputCount { found: 4, .. })
        ));
    }

    #[test]
    fn pool_must_tile_input() {
        let mut model = tiny_model();
        model.layers[0] = Layer::AvgPool { size: 3 };
        assert!(matches!(
            model.shapes(),
            Err(ModelError::InvalidLayer { index: 0, .. })
        ));
    }

    #[test]
    fn pool_size_is_bounded() {
        let model = CompiledModel {
            input: TensorShape {
                height: 300,
                width: 300,
                channels: 1,
            },
            layers: vec![Layer::AvgPool { size: 300 }],
        };
        assert!(matches!(
            model.shapes(),
            Err(ModelError::InvalidLayer { index: 0, .. })
        ));
    }

    #[test]
    fn oversized_dimensions_do_not_encode() {
        let mut model = tiny_model();
        model.input.width = 70_000;
        assert!(matches!(
            model.encode(),
            Err(ModelError::FieldOverflow {
                what: "width",
                value: 70_000
            })
        ));
    }

    #[test]
    fn arena_requirement_counts_everything() {
        // 16 input + 4 pooled + 3 scores + 12 weights.
        assert_eq!(tiny_model().arena_requirement().unwrap(), 35);
    }
}
