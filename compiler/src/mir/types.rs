//! MIR Type System (Post-Resolution)
//!
//! MIR types are monomorphic: generics have been resolved to concrete types
//! or left behind witness-table indirection ([`MirType::Witness`]). Types are
//! compared structurally, so two occurrences of the same concrete type are
//! equal and hash identically. The differentiation pass relies on this to
//! share one differential witness per structural type.

use std::fmt;

/// MIR types are monomorphic and structurally comparable
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MirType {
    // =========================================================================
    // PRIMITIVE TYPES
    // =========================================================================
    /// Void (for statements, unit return)
    Void,

    /// Boolean
    Bool,

    /// Signed 32-bit integer
    I32,

    /// Unsigned 32-bit integer
    U32,

    /// IEEE 754 single precision (the shading default)
    F32,

    /// IEEE 754 double precision
    F64,

    // =========================================================================
    // COMPOSITE TYPES
    // =========================================================================
    /// Short SIMD-style vector: `float3`, `int2`, ...
    Vector { element: Box<MirType>, size: usize },

    /// Row-major matrix: `float4x4`, ...
    Matrix {
        element: Box<MirType>,
        rows: usize,
        cols: usize,
    },

    /// Fixed-size array: `T[N]`
    Array { element: Box<MirType>, size: usize },

    /// Named struct
    Struct {
        name: String,
        fields: Vec<StructField>,
    },

    /// Anonymous product (used for multi-value results)
    Tuple { elements: Vec<MirType> },

    /// Bundled primal and differential, `DiffPair<T>`
    DiffPair {
        primal: Box<MirType>,
        differential: Box<MirType>,
    },

    // =========================================================================
    // OPAQUE TYPES
    // =========================================================================
    /// Buffer or texture handle. Never differentiable.
    Resource {
        kind: ResourceKind,
        element: Box<MirType>,
    },

    /// Reference to a witness table for an interface, used when a generic
    /// parameter was not specialized away
    Witness { interface: String },
}

/// Struct field declaration
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StructField {
    pub name: String,
    pub ty: MirType,
    /// Field excluded from differentiation (`no_diff` in the surface language)
    pub no_diff: bool,
}

impl StructField {
    pub fn new(name: &str, ty: MirType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            no_diff: false,
        }
    }

    pub fn no_diff(name: &str, ty: MirType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            no_diff: true,
        }
    }
}

/// Kind of opaque resource handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    RWBuffer,
    Texture2D,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Buffer => write!(f, "Buffer"),
            ResourceKind::RWBuffer => write!(f, "RWBuffer"),
            ResourceKind::Texture2D => write!(f, "Texture2D"),
        }
    }
}

impl MirType {
    /// Check if type is a floating-point scalar
    pub fn is_float(&self) -> bool {
        matches!(self, MirType::F32 | MirType::F64)
    }

    /// Check if type is an integer scalar
    pub fn is_integer(&self) -> bool {
        matches!(self, MirType::I32 | MirType::U32)
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            MirType::Bool | MirType::I32 | MirType::U32 | MirType::F32 | MirType::F64
        )
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, MirType::Resource { .. } | MirType::Witness { .. })
    }

    /// Element type of vectors, matrices (the scalar), and arrays
    pub fn element_type(&self) -> Option<&MirType> {
        match self {
            MirType::Vector { element, .. }
            | MirType::Matrix { element, .. }
            | MirType::Array { element, .. }
            | MirType::Resource { element, .. } => Some(element),
            _ => None,
        }
    }

    /// Scalar at the leaves of a vector/matrix, or the type itself
    pub fn scalar_type(&self) -> &MirType {
        match self {
            MirType::Vector { element, .. } | MirType::Matrix { element, .. } => element,
            other => other,
        }
    }

    /// Type of the component at a constant index: struct field, tuple
    /// element, vector lane, matrix row, array element, or pair half.
    pub fn component_type(&self, idx: usize) -> Option<MirType> {
        match self {
            MirType::Struct { fields, .. } => fields.get(idx).map(|f| f.ty.clone()),
            MirType::Tuple { elements } => elements.get(idx).cloned(),
            MirType::Vector { element, size } if idx < *size => Some((**element).clone()),
            MirType::Matrix {
                element, rows, cols,
            } if idx < *rows => Some(MirType::vector((**element).clone(), *cols)),
            MirType::Array { element, size } if idx < *size => Some((**element).clone()),
            MirType::DiffPair {
                primal,
                differential,
            } => match idx {
                0 => Some((**primal).clone()),
                1 => Some((**differential).clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Number of components addressable by constant index
    pub fn component_count(&self) -> usize {
        match self {
            MirType::Struct { fields, .. } => fields.len(),
            MirType::Tuple { elements } => elements.len(),
            MirType::Vector { size, .. } | MirType::Array { size, .. } => *size,
            MirType::Matrix { rows, .. } => *rows,
            MirType::DiffPair { .. } => 2,
            _ => 0,
        }
    }

    /// Same shape with boolean leaves, the result type of comparisons
    pub fn bool_like(&self) -> MirType {
        match self {
            MirType::Vector { size, .. } => MirType::vector(MirType::Bool, *size),
            MirType::Matrix { rows, cols, .. } => MirType::matrix(MirType::Bool, *rows, *cols),
            _ => MirType::Bool,
        }
    }

    /// Deterministic identifier-safe encoding, used in derived symbol names
    pub fn mangle(&self) -> String {
        match self {
            MirType::Void => "v".to_string(),
            MirType::Bool => "b".to_string(),
            MirType::I32 => "i".to_string(),
            MirType::U32 => "u".to_string(),
            MirType::F32 => "f".to_string(),
            MirType::F64 => "d".to_string(),
            MirType::Vector { element, size } => format!("V{}{}", size, element.mangle()),
            MirType::Matrix {
                element, rows, cols,
            } => format!("M{}x{}{}", rows, cols, element.mangle()),
            MirType::Array { element, size } => format!("A{}_{}", size, element.mangle()),
            MirType::Struct { name, .. } => format!("S{}{}", name.len(), name.replace('.', "_")),
            MirType::Tuple { elements } => {
                let inner: String = elements.iter().map(|e| e.mangle()).collect();
                format!("T{}{}E", elements.len(), inner)
            }
            MirType::DiffPair {
                primal,
                differential,
            } => format!("P{}{}", primal.mangle(), differential.mangle()),
            MirType::Resource { kind, element } => format!("R{}{}", kind, element.mangle()),
            MirType::Witness { interface } => format!("W{}{}", interface.len(), interface),
        }
    }
}

// =============================================================================
// TYPE CONSTRUCTORS
// =============================================================================

impl MirType {
    pub fn vector(element: MirType, size: usize) -> Self {
        MirType::Vector {
            element: Box::new(element),
            size,
        }
    }

    pub fn matrix(element: MirType, rows: usize, cols: usize) -> Self {
        MirType::Matrix {
            element: Box::new(element),
            rows,
            cols,
        }
    }

    pub fn array(element: MirType, size: usize) -> Self {
        MirType::Array {
            element: Box::new(element),
            size,
        }
    }

    pub fn structure(name: &str, fields: Vec<StructField>) -> Self {
        MirType::Struct {
            name: name.to_string(),
            fields,
        }
    }

    pub fn tuple(elements: Vec<MirType>) -> Self {
        MirType::Tuple { elements }
    }

    pub fn pair(primal: MirType, differential: MirType) -> Self {
        MirType::DiffPair {
            primal: Box::new(primal),
            differential: Box::new(differential),
        }
    }

    pub fn resource(kind: ResourceKind, element: MirType) -> Self {
        MirType::Resource {
            kind,
            element: Box::new(element),
        }
    }

    pub fn witness(interface: &str) -> Self {
        MirType::Witness {
            interface: interface.to_string(),
        }
    }
}

impl fmt::Display for MirType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirType::Void => write!(f, "void"),
            MirType::Bool => write!(f, "bool"),
            MirType::I32 => write!(f, "i32"),
            MirType::U32 => write!(f, "u32"),
            MirType::F32 => write!(f, "f32"),
            MirType::F64 => write!(f, "f64"),
            MirType::Vector { element, size } => write!(f, "vec<{}, {}>", element, size),
            MirType::Matrix {
                element, rows, cols,
            } => write!(f, "mat<{}, {}x{}>", element, rows, cols),
            MirType::Array { element, size } => write!(f, "[{}; {}]", element, size),
            MirType::Struct { name, .. } => write!(f, "struct {}", name),
            MirType::Tuple { elements } => {
                write!(f, "(")?;
                for (i, elem) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", elem)?;
                }
                write!(f, ")")
            }
            MirType::DiffPair {
                primal,
                differential,
            } => write!(f, "DiffPair<{}, {}>", primal, differential),
            MirType::Resource { kind, element } => write!(f, "{}<{}>", kind, element),
            MirType::Witness { interface } => write!(f, "witness {}", interface),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_structural_identity() {
        let a = MirType::matrix(MirType::F32, 2, 2);
        let b = MirType::matrix(MirType::F32, 2, 2);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&MirType::matrix(MirType::F32, 2, 3)));
    }

    #[test]
    fn test_component_types() {
        let m = MirType::matrix(MirType::F32, 3, 4);
        assert_eq!(m.component_type(0), Some(MirType::vector(MirType::F32, 4)));
        assert_eq!(m.component_type(3), None);
        assert_eq!(m.component_count(), 3);

        let s = MirType::structure(
            "Vertex",
            vec![
                StructField::new("color", MirType::vector(MirType::F32, 3)),
                StructField::no_diff("density", MirType::F32),
            ],
        );
        assert_eq!(s.component_type(1), Some(MirType::F32));
        assert_eq!(s.component_count(), 2);

        let p = MirType::pair(MirType::F32, MirType::F32);
        assert_eq!(p.component_type(1), Some(MirType::F32));
    }

    #[test]
    fn test_bool_like() {
        assert_eq!(MirType::F32.bool_like(), MirType::Bool);
        assert_eq!(
            MirType::vector(MirType::F32, 3).bool_like(),
            MirType::vector(MirType::Bool, 3)
        );
    }

    #[test]
    fn test_mangle_is_distinct() {
        let names: HashSet<String> = [
            MirType::F32,
            MirType::F64,
            MirType::vector(MirType::F32, 3),
            MirType::matrix(MirType::F32, 3, 3),
            MirType::array(MirType::F32, 3),
            MirType::array(MirType::vector(MirType::F32, 3), 2),
            MirType::tuple(vec![MirType::F32, MirType::I32]),
        ]
        .iter()
        .map(|t| t.mangle())
        .collect();
        assert_eq!(names.len(), 7);
        assert!(names.iter().all(|n| n.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')));
    }

    #[test]
    fn test_display() {
        assert_eq!(MirType::vector(MirType::F32, 3).to_string(), "vec<f32, 3>");
        assert_eq!(
            MirType::pair(MirType::F32, MirType::F32).to_string(),
            "DiffPair<f32, f32>"
        );
        assert_eq!(
            MirType::resource(ResourceKind::RWBuffer, MirType::F32).to_string(),
            "RWBuffer<f32>"
        );
    }
}
