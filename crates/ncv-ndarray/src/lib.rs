#![forbid(unsafe_code)]

/// Axis order from channel-first to channel-last (`NCHW -> NHWC`).
pub const NCHW_TO_NHWC: [usize; 4] = [0, 2, 3, 1];
/// Axis order from channel-last to channel-first (`NHWC -> NCHW`).
pub const NHWC_TO_NCHW: [usize; 4] = [0, 3, 1, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    F32,
    U8,
}

impl ElementType {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::U8 => "uint8",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "f32" | "float32" | "float" => Some(Self::F32),
            "u8" | "uint8" => Some(Self::U8),
            _ => None,
        }
    }

    #[must_use]
    pub const fn item_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::U8 => 1,
        }
    }
}

/// Channel-ordering convention of a rank-4 activation tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Nchw,
    Nhwc,
}

impl Layout {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nchw => "NCHW",
            Self::Nhwc => "NHWC",
        }
    }

    /// Permutation that takes a tensor in `self` layout into `target` layout.
    #[must_use]
    pub const fn permutation_to(self, target: Self) -> [usize; 4] {
        match (self, target) {
            (Self::Nchw, Self::Nhwc) => NCHW_TO_NHWC,
            (Self::Nhwc, Self::Nchw) => NHWC_TO_NCHW,
            _ => [0, 1, 2, 3],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    Overflow,
    InvalidPermutation { rank: usize, perm: Vec<usize> },
    IncompatibleElementCount { expected: usize, actual: usize },
    IndexOutOfBounds { index: usize, len: usize },
}

impl ShapeError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Overflow => "shape_size_overflow",
            Self::InvalidPermutation { .. } => "shape_permutation_invalid",
            Self::IncompatibleElementCount { .. } => "shape_element_count_mismatch",
            Self::IndexOutOfBounds { .. } => "shape_index_out_of_bounds",
        }
    }
}

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overflow => write!(f, "size arithmetic overflow"),
            Self::InvalidPermutation { rank, perm } => {
                write!(f, "permutation {perm:?} is not valid for rank {rank}")
            }
            Self::IncompatibleElementCount { expected, actual } => {
                write!(f, "element count mismatch expected={expected} actual={actual}")
            }
            Self::IndexOutOfBounds { index, len } => {
                write!(f, "flat index {index} out of bounds for {len} elements")
            }
        }
    }
}

impl std::error::Error for ShapeError {}

pub fn element_count(shape: &[usize]) -> Result<usize, ShapeError> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        acc.checked_mul(dim).ok_or(ShapeError::Overflow)
    })
}

/// Row-major strides in elements.
pub fn contiguous_strides(shape: &[usize]) -> Result<Vec<usize>, ShapeError> {
    let mut strides = vec![0usize; shape.len()];
    let mut stride = 1usize;
    for (i, &dim) in shape.iter().enumerate().rev() {
        strides[i] = stride;
        stride = stride.checked_mul(dim).ok_or(ShapeError::Overflow)?;
    }
    Ok(strides)
}

/// Converts a flat row-major index into per-axis coordinates.
pub fn unravel_index(flat: usize, shape: &[usize]) -> Result<Vec<usize>, ShapeError> {
    let len = element_count(shape)?;
    if flat >= len {
        return Err(ShapeError::IndexOutOfBounds { index: flat, len });
    }
    let strides = contiguous_strides(shape)?;
    let mut rem = flat;
    let mut out = Vec::with_capacity(shape.len());
    for &stride in &strides {
        out.push(rem / stride);
        rem %= stride;
    }
    Ok(out)
}

pub fn validate_permutation(rank: usize, perm: &[usize]) -> Result<(), ShapeError> {
    let mut seen = vec![false; rank];
    let valid = perm.len() == rank
        && perm.iter().all(|&axis| {
            if axis >= rank || seen[axis] {
                false
            } else {
                seen[axis] = true;
                true
            }
        });
    if valid {
        Ok(())
    } else {
        Err(ShapeError::InvalidPermutation {
            rank,
            perm: perm.to_vec(),
        })
    }
}

/// `inverse_permutation(p)[p[i]] == i`, so permuting by `p` then by its
/// inverse restores the original axis order.
pub fn inverse_permutation(perm: &[usize]) -> Result<Vec<usize>, ShapeError> {
    validate_permutation(perm.len(), perm)?;
    let mut inverse = vec![0usize; perm.len()];
    for (i, &axis) in perm.iter().enumerate() {
        inverse[axis] = i;
    }
    Ok(inverse)
}

pub fn permuted_shape(shape: &[usize], perm: &[usize]) -> Result<Vec<usize>, ShapeError> {
    validate_permutation(shape.len(), perm)?;
    Ok(perm.iter().map(|&axis| shape[axis]).collect())
}

/// Moves elements so that output axis `i` is input axis `perm[i]`.
pub fn permute_values<T: Copy>(
    values: &[T],
    shape: &[usize],
    perm: &[usize],
) -> Result<(Vec<usize>, Vec<T>), ShapeError> {
    let out_shape = permuted_shape(shape, perm)?;
    let count = element_count(shape)?;
    if values.len() != count {
        return Err(ShapeError::IncompatibleElementCount {
            expected: count,
            actual: values.len(),
        });
    }

    let in_strides = contiguous_strides(shape)?;
    let src_strides: Vec<usize> = perm.iter().map(|&axis| in_strides[axis]).collect();
    let mut out = Vec::with_capacity(count);
    let mut index = vec![0usize; out_shape.len()];

    for _ in 0..count {
        let src = index
            .iter()
            .zip(&src_strides)
            .map(|(&i, &stride)| i * stride)
            .sum::<usize>();
        out.push(values[src]);

        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < out_shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }

    Ok((out_shape, out))
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    U8(Vec<u8>),
}

impl TensorData {
    #[must_use]
    pub const fn element_type(&self) -> ElementType {
        match self {
            Self::F32(_) => ElementType::F32,
            Self::U8(_) => ElementType::U8,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(values) => values.len(),
            Self::U8(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A dense row-major tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self, ShapeError> {
        let expected = element_count(&shape)?;
        if data.len() != expected {
            return Err(ShapeError::IncompatibleElementCount {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, values: Vec<f32>) -> Result<Self, ShapeError> {
        Self::new(shape, TensorData::F32(values))
    }

    pub fn from_u8(shape: Vec<usize>, values: Vec<u8>) -> Result<Self, ShapeError> {
        Self::new(shape, TensorData::U8(values))
    }

    /// Values `start, start + 1, ...` laid out in `shape`, like `arange(..).reshape(..)`.
    pub fn arange_f32(shape: Vec<usize>, start: f32) -> Result<Self, ShapeError> {
        let count = element_count(&shape)?;
        let values = (0..count).map(|i| start + i as f32).collect();
        Self::from_f32(shape, values)
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    #[must_use]
    pub const fn element_type(&self) -> ElementType {
        self.data.element_type()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Some(values),
            TensorData::U8(_) => None,
        }
    }

    #[must_use]
    pub fn to_f64_values(&self) -> Vec<f64> {
        match &self.data {
            TensorData::F32(values) => values.iter().map(|&v| f64::from(v)).collect(),
            TensorData::U8(values) => values.iter().map(|&v| f64::from(v)).collect(),
        }
    }

    /// Same data viewed under another shape with an identical element count.
    pub fn reshaped(&self, shape: Vec<usize>) -> Result<Self, ShapeError> {
        Self::new(shape, self.data.clone())
    }

    pub fn permute_axes(&self, perm: &[usize]) -> Result<Self, ShapeError> {
        let (shape, data) = match &self.data {
            TensorData::F32(values) => {
                let (shape, out) = permute_values(values, &self.shape, perm)?;
                (shape, TensorData::F32(out))
            }
            TensorData::U8(values) => {
                let (shape, out) = permute_values(values, &self.shape, perm)?;
                (shape, TensorData::U8(out))
            }
        };
        Ok(Self { shape, data })
    }

    pub fn convert_layout(&self, from: Layout, to: Layout) -> Result<Self, ShapeError> {
        self.permute_axes(&from.permutation_to(to))
    }
}
