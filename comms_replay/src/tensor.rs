use anyhow::{Result, bail};
use rand::Rng;
use serde::{Serialize, Serializer};

/// Element type of a replayed buffer, parsed from the trace's `dtype` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    Float,
    Double,
    Int,
    Long,
}

impl DType {
    /// Maps the dtype tags observed in traces onto the supported element
    /// types. Tags are matched case-insensitively.
    pub fn parse(tag: &str) -> Option<DType> {
        match tag.to_ascii_lowercase().as_str() {
            "float" | "float32" => Some(DType::Float),
            "double" | "float64" => Some(DType::Double),
            "int" | "int32" => Some(DType::Int),
            "long" | "int64" => Some(DType::Long),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::Float => "float32",
            DType::Double => "float64",
            DType::Int => "int32",
            DType::Long => "int64",
        }
    }

    pub fn elem_bytes(&self) -> usize {
        match self {
            DType::Float | DType::Int => 4,
            DType::Double | DType::Long => 8,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for DType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Reduction applied by reducing collectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

/// A flat, typed element buffer. This is the unit the preparer allocates and
/// the backend moves; the engine never inspects element values itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: TensorData,
}

macro_rules! for_each_variant {
    ($data:expr, $v:ident => $e:expr) => {
        match $data {
            TensorData::F32($v) => $e,
            TensorData::F64($v) => $e,
            TensorData::I32($v) => $e,
            TensorData::I64($v) => $e,
        }
    };
}

macro_rules! rebuild_variant {
    ($data:expr, $v:ident => $e:expr) => {
        match $data {
            TensorData::F32($v) => TensorData::F32($e),
            TensorData::F64($v) => TensorData::F64($e),
            TensorData::I32($v) => TensorData::I32($e),
            TensorData::I64($v) => TensorData::I64($e),
        }
    };
}

impl Tensor {
    pub fn zeros(dtype: DType, len: usize) -> Tensor {
        let data = match dtype {
            DType::Float => TensorData::F32(vec![0.0; len]),
            DType::Double => TensorData::F64(vec![0.0; len]),
            DType::Int => TensorData::I32(vec![0; len]),
            DType::Long => TensorData::I64(vec![0; len]),
        };
        Tensor { data }
    }

    pub fn filled(dtype: DType, len: usize, value: f64) -> Tensor {
        let data = match dtype {
            DType::Float => TensorData::F32(vec![value as f32; len]),
            DType::Double => TensorData::F64(vec![value; len]),
            DType::Int => TensorData::I32(vec![value as i32; len]),
            DType::Long => TensorData::I64(vec![value as i64; len]),
        };
        Tensor { data }
    }

    /// Uniform random fill in `[0, scale)`, matching what a capture-time
    /// workload's buffers would plausibly contain. Integer dtypes draw whole
    /// values so reductions stay exact.
    pub fn random<R: Rng>(dtype: DType, len: usize, scale: f64, rng: &mut R) -> Tensor {
        let bound = scale.max(1.0);
        let data = match dtype {
            DType::Float => {
                TensorData::F32((0..len).map(|_| rng.gen_range(0.0..bound as f32)).collect())
            }
            DType::Double => TensorData::F64((0..len).map(|_| rng.gen_range(0.0..bound)).collect()),
            DType::Int => {
                TensorData::I32((0..len).map(|_| rng.gen_range(0..bound as i32)).collect())
            }
            DType::Long => {
                TensorData::I64((0..len).map(|_| rng.gen_range(0..bound as i64)).collect())
            }
        };
        Tensor { data }
    }

    pub fn dtype(&self) -> DType {
        match &self.data {
            TensorData::F32(_) => DType::Float,
            TensorData::F64(_) => DType::Double,
            TensorData::I32(_) => DType::Int,
            TensorData::I64(_) => DType::Long,
        }
    }

    pub fn len(&self) -> usize {
        for_each_variant!(&self.data, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `idx` widened to `f64`, for scalar read-backs and checks.
    pub fn get(&self, idx: usize) -> f64 {
        for_each_variant!(&self.data, v => v[idx] as f64)
    }

    pub fn slice(&self, start: usize, len: usize) -> Tensor {
        let data = rebuild_variant!(&self.data, v => v[start..start + len].to_vec());
        Tensor { data }
    }

    /// Concatenates same-dtype tensors in order.
    pub fn cat(parts: &[Tensor]) -> Result<Tensor> {
        let Some(first) = parts.first() else {
            bail!("cannot concatenate zero tensors");
        };
        let mut out = first.clone();
        for part in &parts[1..] {
            match (&mut out.data, &part.data) {
                (TensorData::F32(a), TensorData::F32(b)) => a.extend_from_slice(b),
                (TensorData::F64(a), TensorData::F64(b)) => a.extend_from_slice(b),
                (TensorData::I32(a), TensorData::I32(b)) => a.extend_from_slice(b),
                (TensorData::I64(a), TensorData::I64(b)) => a.extend_from_slice(b),
                _ => bail!(
                    "dtype mismatch in concat: {} vs {}",
                    out.dtype(),
                    part.dtype()
                ),
            }
        }
        Ok(out)
    }

    /// Element-wise reduction of `other` into `self`. Lengths must match.
    pub fn reduce_from(&mut self, other: &Tensor, op: ReduceOp) -> Result<()> {
        if self.len() != other.len() {
            bail!(
                "length mismatch in reduction: {} vs {}",
                self.len(),
                other.len()
            );
        }
        match (&mut self.data, &other.data) {
            (TensorData::F32(a), TensorData::F32(b)) => reduce_slice(a, b, op),
            (TensorData::F64(a), TensorData::F64(b)) => reduce_slice(a, b, op),
            (TensorData::I32(a), TensorData::I32(b)) => reduce_slice(a, b, op),
            (TensorData::I64(a), TensorData::I64(b)) => reduce_slice(a, b, op),
            _ => bail!(
                "dtype mismatch in reduction: {} vs {}",
                self.dtype(),
                other.dtype()
            ),
        }
        Ok(())
    }

    /// Copies `src` into the front of this buffer. A shorter source leaves
    /// the tail untouched; a longer one is truncated to fit.
    pub fn copy_from(&mut self, src: &Tensor) {
        let n = self.len().min(src.len());
        match (&mut self.data, &src.data) {
            (TensorData::F32(a), TensorData::F32(b)) => a[..n].copy_from_slice(&b[..n]),
            (TensorData::F64(a), TensorData::F64(b)) => a[..n].copy_from_slice(&b[..n]),
            (TensorData::I32(a), TensorData::I32(b)) => a[..n].copy_from_slice(&b[..n]),
            (TensorData::I64(a), TensorData::I64(b)) => a[..n].copy_from_slice(&b[..n]),
            _ => {}
        }
    }
}

fn reduce_slice<T: Copy + PartialOrd + std::ops::Add<Output = T>>(
    dst: &mut [T],
    src: &[T],
    op: ReduceOp,
) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = match op {
            ReduceOp::Sum => *d + *s,
            ReduceOp::Max => {
                if *s > *d {
                    *s
                } else {
                    *d
                }
            }
        };
    }
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn dtype_tags_parse_case_insensitively() {
        assert_eq!(DType::parse("Int"), Some(DType::Int));
        assert_eq!(DType::parse("float32"), Some(DType::Float));
        assert_eq!(DType::parse("Long"), Some(DType::Long));
        assert_eq!(DType::parse("complex128"), None);
    }

    #[test]
    fn reduce_sum_and_max() {
        let mut a = Tensor::filled(DType::Int, 4, 2.0);
        let b = Tensor::filled(DType::Int, 4, 5.0);
        a.reduce_from(&b, ReduceOp::Sum).unwrap();
        assert_eq!(a.get(0), 7.0);
        a.reduce_from(&b, ReduceOp::Max).unwrap();
        assert_eq!(a.get(3), 7.0);
    }

    #[test]
    fn slice_and_cat_round_trip() {
        let mut rng = StdRng::seed_from_u64(7);
        let t = Tensor::random(DType::Float, 8, 10.0, &mut rng);
        let halves = [t.slice(0, 4), t.slice(4, 4)];
        assert_eq!(Tensor::cat(&halves).unwrap(), t);
    }

    #[test]
    fn mismatched_dtypes_are_rejected() {
        let mut a = Tensor::zeros(DType::Float, 2);
        let b = Tensor::zeros(DType::Int, 2);
        assert!(a.reduce_from(&b, ReduceOp::Sum).is_err());
    }
}
