//! Field type descriptors: the shape and element type of a tensor field.
//!
//! A field is a multidimensional array (0-3 "field" dimensions) of tensors
//! (0-2 "tensor" dimensions) of uniform element type. A `FieldType` is
//! created once when the circuit is compiled, is immutable afterwards, and
//! is shared by every structure describing the same field.

use std::fmt;

/// Field-space shape: 0 to 3 dimensions (layers, rows, columns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldShape {
    dims: [usize; 3],
    rank: usize,
}

impl FieldShape {
    /// 0-dimensional field: a single point.
    pub fn scalar() -> Self {
        FieldShape {
            dims: [1, 1, 1],
            rank: 0,
        }
    }

    /// 1-dimensional field.
    pub fn d1(columns: usize) -> Self {
        FieldShape {
            dims: [1, 1, columns],
            rank: 1,
        }
    }

    /// 2-dimensional field.
    pub fn d2(rows: usize, columns: usize) -> Self {
        FieldShape {
            dims: [1, rows, columns],
            rank: 2,
        }
    }

    /// 3-dimensional field.
    pub fn d3(layers: usize, rows: usize, columns: usize) -> Self {
        FieldShape {
            dims: [layers, rows, columns],
            rank: 3,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn layers(&self) -> usize {
        self.dims[0]
    }

    pub fn rows(&self) -> usize {
        self.dims[1]
    }

    pub fn columns(&self) -> usize {
        self.dims[2]
    }

    /// Total number of field points.
    pub fn points(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    /// The significant dimensions, innermost (columns) first. A
    /// 0-dimensional field dispatches as a single unit dimension.
    pub fn work_dims(&self) -> Vec<usize> {
        match self.rank {
            0 => vec![1],
            1 => vec![self.dims[2]],
            2 => vec![self.dims[2], self.dims[1]],
            _ => vec![self.dims[2], self.dims[1], self.dims[0]],
        }
    }
}

impl fmt::Display for FieldShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rank {
            0 => write!(f, "0D"),
            1 => write!(f, "{}", self.dims[2]),
            2 => write!(f, "{}x{}", self.dims[1], self.dims[2]),
            _ => write!(f, "{}x{}x{}", self.dims[0], self.dims[1], self.dims[2]),
        }
    }
}

/// Tensor-space shape of each field point: scalar, vector, or matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorShape {
    Scalar,
    Vector(usize),
    Matrix(usize, usize),
}

impl TensorShape {
    /// Number of scalar components per field point.
    pub fn elements(&self) -> usize {
        match self {
            TensorShape::Scalar => 1,
            TensorShape::Vector(n) => *n,
            TensorShape::Matrix(r, c) => r * c,
        }
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorShape::Scalar => write!(f, "scalar"),
            TensorShape::Vector(n) => write!(f, "vec{}", n),
            TensorShape::Matrix(r, c) => write!(f, "mat{}x{}", r, c),
        }
    }
}

/// Element type of every scalar component in a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// 32-bit IEEE float.
    Float32,
    /// 32-bit complex: two packed f32 components (re, im).
    Complex32,
    /// 8-bit-per-channel pixel data.
    Pixel8,
}

impl ElementType {
    /// Size in bytes of one component of this element type.
    pub fn component_bytes(&self) -> usize {
        match self {
            ElementType::Float32 => 4,
            ElementType::Complex32 => 8,
            ElementType::Pixel8 => 1,
        }
    }

    pub fn is_pixel(&self) -> bool {
        matches!(self, ElementType::Pixel8)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Float32 => write!(f, "f32"),
            ElementType::Complex32 => write!(f, "c32"),
            ElementType::Pixel8 => write!(f, "pixel8"),
        }
    }
}

/// Immutable descriptor of a tensor field: field shape, tensor shape, and
/// element type. All elements of a field share this exact shape and type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldType {
    field: FieldShape,
    tensor: TensorShape,
    element: ElementType,
}

impl FieldType {
    pub fn new(field: FieldShape, tensor: TensorShape, element: ElementType) -> Self {
        FieldType {
            field,
            tensor,
            element,
        }
    }

    /// A field of scalar f32 values, the most common case.
    pub fn scalar_f32(field: FieldShape) -> Self {
        FieldType::new(field, TensorShape::Scalar, ElementType::Float32)
    }

    pub fn field_shape(&self) -> FieldShape {
        self.field
    }

    pub fn tensor_shape(&self) -> TensorShape {
        self.tensor
    }

    pub fn element_type(&self) -> ElementType {
        self.element
    }

    /// Total number of field points.
    pub fn field_points(&self) -> usize {
        self.field.points()
    }

    /// Scalar components per field point.
    pub fn tensor_elements(&self) -> usize {
        self.tensor.elements()
    }

    /// Exact size in bytes of the field's flat memory layout. Fixed for the
    /// lifetime of any buffer created for this field type.
    pub fn byte_size(&self) -> usize {
        self.field_points() * self.tensor_elements() * self.element.component_bytes()
    }

    /// Default flat dispatch size: one work item per field point.
    pub fn default_work_size(&self) -> usize {
        self.field_points()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{} {}]", self.field, self.tensor, self.element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_shape_points() {
        assert_eq!(FieldShape::scalar().points(), 1);
        assert_eq!(FieldShape::d1(7).points(), 7);
        assert_eq!(FieldShape::d2(3, 4).points(), 12);
        assert_eq!(FieldShape::d3(2, 3, 4).points(), 24);
    }

    #[test]
    fn test_field_shape_work_dims() {
        assert_eq!(FieldShape::scalar().work_dims(), vec![1]);
        assert_eq!(FieldShape::d1(8).work_dims(), vec![8]);
        assert_eq!(FieldShape::d2(2, 5).work_dims(), vec![5, 2]);
        assert_eq!(FieldShape::d3(2, 3, 4).work_dims(), vec![4, 3, 2]);
    }

    #[test]
    fn test_tensor_elements() {
        assert_eq!(TensorShape::Scalar.elements(), 1);
        assert_eq!(TensorShape::Vector(3).elements(), 3);
        assert_eq!(TensorShape::Matrix(2, 2).elements(), 4);
    }

    #[test]
    fn test_byte_size() {
        let ft = FieldType::scalar_f32(FieldShape::d2(4, 4));
        assert_eq!(ft.byte_size(), 16 * 4);

        let complex = FieldType::new(
            FieldShape::d1(10),
            TensorShape::Scalar,
            ElementType::Complex32,
        );
        assert_eq!(complex.byte_size(), 10 * 8);

        let pixels = FieldType::new(
            FieldShape::d2(2, 2),
            TensorShape::Vector(4),
            ElementType::Pixel8,
        );
        assert_eq!(pixels.byte_size(), 4 * 4);
    }

    #[test]
    fn test_field_type_is_shared_by_value() {
        let a = FieldType::scalar_f32(FieldShape::d1(16));
        let b = a;
        assert_eq!(a, b);
        assert_eq!(a.default_work_size(), 16);
    }

    #[test]
    fn test_display() {
        let ft = FieldType::scalar_f32(FieldShape::d2(3, 4));
        assert_eq!(ft.to_string(), "3x4[scalar f32]");
    }
}
