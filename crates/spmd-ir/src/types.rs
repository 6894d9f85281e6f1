//! Shapes and element types.

/// Element type of an array shape.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum PrimitiveType {
    /// Boolean predicate.
    Pred,
    /// 32-bit signed integer.
    S32,
    /// 32-bit unsigned integer.
    U32,
    /// Brain floating point.
    BF16,
    /// IEEE half precision.
    F16,
    /// IEEE single precision.
    F32,
    /// IEEE double precision.
    F64,
}

impl PrimitiveType {
    /// Returns `true` for the floating-point element types.
    pub fn is_float(self) -> bool {
        matches!(self, Self::BF16 | Self::F16 | Self::F32 | Self::F64)
    }

    /// Returns `true` for the signed and unsigned integer types.
    pub fn is_integer(self) -> bool {
        matches!(self, Self::S32 | Self::U32)
    }
}

/// The result shape of an instruction.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum Shape {
    /// A dense array; a scalar has no dimensions.
    Array {
        element: PrimitiveType,
        dims: Vec<i64>,
    },
    /// A heterogeneous tuple of shapes.
    Tuple(Vec<Shape>),
}

impl Shape {
    /// A rank-0 array.
    pub fn scalar(element: PrimitiveType) -> Self {
        Self::Array {
            element,
            dims: Vec::new(),
        }
    }

    /// A dense array with the given dimensions.
    pub fn array(element: PrimitiveType, dims: impl Into<Vec<i64>>) -> Self {
        Self::Array {
            element,
            dims: dims.into(),
        }
    }

    /// A tuple of the given element shapes.
    pub fn tuple(elements: impl Into<Vec<Shape>>) -> Self {
        Self::Tuple(elements.into())
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Self::Tuple(_))
    }

    /// Element type of an array shape; `None` for tuples.
    pub fn element_type(&self) -> Option<PrimitiveType> {
        match self {
            Self::Array { element, .. } => Some(*element),
            Self::Tuple(_) => None,
        }
    }

    /// Dimensions of an array shape; empty for tuples.
    pub fn dims(&self) -> &[i64] {
        match self {
            Self::Array { dims, .. } => dims,
            Self::Tuple(_) => &[],
        }
    }

    /// Shape of the `index`-th tuple element.
    pub fn tuple_element(&self, index: usize) -> Option<&Shape> {
        match self {
            Self::Tuple(elements) => elements.get(index),
            Self::Array { .. } => None,
        }
    }

    /// Number of tuple elements; zero for arrays.
    pub fn tuple_arity(&self) -> usize {
        match self {
            Self::Tuple(elements) => elements.len(),
            Self::Array { .. } => 0,
        }
    }

    /// Number of array elements (product of dimensions); zero for tuples.
    pub fn element_count(&self) -> usize {
        match self {
            Self::Array { dims, .. } => dims.iter().map(|&d| d.max(0) as usize).product(),
            Self::Tuple(_) => 0,
        }
    }

    /// Same dimensions with a different element type.
    pub fn with_element_type(&self, element: PrimitiveType) -> Self {
        match self {
            Self::Array { dims, .. } => Self::Array {
                element,
                dims: dims.clone(),
            },
            Self::Tuple(elements) => Self::Tuple(
                elements
                    .iter()
                    .map(|e| e.with_element_type(element))
                    .collect(),
            ),
        }
    }
}
