//! Tensor result types and constant payloads.
//!
//! Shape *inference* is out of scope for this crate: every node's result
//! types are assigned by whoever creates the node. The queries here are the
//! introspection surface the fusion matchers need — rank, per-dimension
//! extents, total element count, and scalar-ness.

/// Element kind of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    I32,
    Bool,
}

/// The type of one node result.
///
/// A type is either fully `Ranked` (known element kind and extents) or
/// `Unresolved`, which is what results look like before shape inference has
/// reached them. Matchers treat `Unresolved` as an ordinary match failure.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorType {
    Unresolved,
    Ranked { dtype: DType, dims: Vec<i64> },
}

impl TensorType {
    pub fn ranked(dtype: DType, dims: Vec<i64>) -> Self {
        TensorType::Ranked { dtype, dims }
    }

    /// A rank-0 type holding exactly one element.
    pub fn scalar(dtype: DType) -> Self {
        TensorType::Ranked {
            dtype,
            dims: Vec::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, TensorType::Ranked { .. })
    }

    pub fn dtype(&self) -> Option<DType> {
        match self {
            TensorType::Unresolved => None,
            TensorType::Ranked { dtype, .. } => Some(*dtype),
        }
    }

    pub fn rank(&self) -> Option<usize> {
        match self {
            TensorType::Unresolved => None,
            TensorType::Ranked { dims, .. } => Some(dims.len()),
        }
    }

    /// Extent of one axis. `None` for unresolved types or out-of-range axes.
    pub fn dim(&self, axis: usize) -> Option<i64> {
        match self {
            TensorType::Unresolved => None,
            TensorType::Ranked { dims, .. } => dims.get(axis).copied(),
        }
    }

    /// Total number of elements. `None` if the type is unresolved or any
    /// extent is dynamic (negative).
    pub fn num_elements(&self) -> Option<i64> {
        match self {
            TensorType::Unresolved => None,
            TensorType::Ranked { dims, .. } => {
                if dims.iter().any(|&d| d < 0) {
                    return None;
                }
                Some(dims.iter().product())
            }
        }
    }

    /// True iff the type is resolved and holds exactly one element. Rank 0
    /// and all-ones shapes both qualify.
    pub fn is_scalar(&self) -> bool {
        self.num_elements() == Some(1)
    }
}

/// A materialized constant tensor: a resolved type plus element storage.
///
/// Elements are stored as `f32` regardless of the declared `DType`; this
/// pass only ever interprets float constants (scale factors and mask fill
/// values), fetched by flat index.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    ty: TensorType,
    values: Vec<f32>,
}

impl TensorData {
    /// # Panics
    ///
    /// Panics if `ty` is unresolved or its element count does not match
    /// `values.len()`.
    pub fn new(ty: TensorType, values: Vec<f32>) -> Self {
        let expected = ty
            .num_elements()
            .expect("constant data requires a fully resolved type");
        assert_eq!(
            expected as usize,
            values.len(),
            "constant data length does not match its type"
        );
        TensorData { ty, values }
    }

    /// A single-element `F32` constant.
    pub fn scalar(value: f32) -> Self {
        TensorData::new(TensorType::scalar(DType::F32), vec![value])
    }

    pub fn ty(&self) -> &TensorType {
        &self.ty
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Element at `index` in flat (row-major) order.
    pub fn value_at(&self, index: usize) -> Option<f32> {
        self.values.get(index).copied()
    }
}
