use std::fmt;

/// Data type of a value flowing through a function descriptor.
///
/// The set is deliberately small: scalar numerics, records, fixed-width
/// vectors (the struct-of-arrays batch dimension), and named foreign types
/// whose layout is only known to user-supplied marshalling code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DType {
    F64,
    I64,
    Bool,
    /// Heterogeneous record; also doubles as the unit type when empty.
    Record(Vec<DType>),
    /// Fixed-width vector of `n` lanes, one per batch element.
    Vector(Box<DType>, usize),
    /// Foreign type opaque to the engines; marshalling must be user-supplied.
    Named(String),
}

impl DType {
    pub fn unit() -> Self {
        DType::Record(Vec::new())
    }

    /// Record of (primal, tangent-or-adjoint) with identical halves.
    pub fn pair(self) -> Self {
        DType::Record(vec![self.clone(), self])
    }

    pub fn vector(elem: DType, lanes: usize) -> Self {
        DType::Vector(Box::new(elem), lanes)
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, DType::F64 | DType::I64 | DType::Bool)
    }

    pub fn is_float(&self) -> bool {
        match self {
            DType::F64 => true,
            DType::Vector(elem, _) => elem.is_float(),
            _ => false,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F64 => write!(f, "f64"),
            DType::I64 => write!(f, "i64"),
            DType::Bool => write!(f, "bool"),
            DType::Record(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, ")")
            }
            DType::Vector(elem, n) => write!(f, "{elem}x{n}"),
            DType::Named(name) => write!(f, "{name}"),
        }
    }
}

/// A constant literal embedded in a descriptor body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Const {
    F64(f64),
    I64(i64),
    Bool(bool),
}

impl Const {
    pub fn dtype(&self) -> DType {
        match self {
            Const::F64(_) => DType::F64,
            Const::I64(_) => DType::I64,
            Const::Bool(_) => DType::Bool,
        }
    }
}

impl From<f64> for Const {
    fn from(v: f64) -> Self {
        Const::F64(v)
    }
}

impl From<i64> for Const {
    fn from(v: i64) -> Self {
        Const::I64(v)
    }
}

impl From<bool> for Const {
    fn from(v: bool) -> Self {
        Const::Bool(v)
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::F64(v) => write!(f, "{v}"),
            Const::I64(v) => write!(f, "{v}"),
            Const::Bool(v) => write!(f, "{v}"),
        }
    }
}
