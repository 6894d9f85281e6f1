//! Instructions: the nodes of a computation's dataflow graph.

use crate::arena::Handle;
use crate::computation::Computation;
use crate::sharding::{ReplicaGroup, Sharding};
use crate::types::{PrimitiveType, Shape};

/// A constant array value.
///
/// Values are stored row-major as `f64`; equality is exact (same shape and
/// bitwise-identical values), so `-0.0 != 0.0` and a NaN equals itself.
#[derive(Clone, Debug)]
pub struct Literal {
    shape: Shape,
    values: Vec<f64>,
}

impl Literal {
    /// A rank-0 literal.
    pub fn scalar(element: PrimitiveType, value: f64) -> Self {
        Self {
            shape: Shape::scalar(element),
            values: vec![value],
        }
    }

    /// A dense array literal.
    ///
    /// # Panics
    ///
    /// Panics if `values.len()` does not match the element count of `dims`.
    pub fn array(
        element: PrimitiveType,
        dims: impl Into<Vec<i64>>,
        values: impl Into<Vec<f64>>,
    ) -> Self {
        let shape = Shape::array(element, dims);
        let values = values.into();
        assert_eq!(
            values.len(),
            shape.element_count(),
            "literal of shape {shape:?} needs {} values, got {}",
            shape.element_count(),
            values.len()
        );
        Self { shape, values }
    }

    /// An array literal of `shape` with every element set to `value`.
    ///
    /// Tuple shapes produce an empty literal of that shape.
    pub fn splat(shape: &Shape, value: f64) -> Self {
        Self {
            shape: shape.clone(),
            values: vec![value; shape.element_count()],
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Whether every element holds the same value, bit for bit.
    pub fn is_splat(&self) -> bool {
        match self.values.split_first() {
            Some((first, rest)) => rest.iter().all(|v| v.to_bits() == first.to_bits()),
            None => false,
        }
    }
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl Eq for Literal {}

/// Comparison performed by a `Compare` instruction.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum ComparisonDirection {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Fieldless discriminant of [`InstrKind`].
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Opcode {
    Parameter,
    Constant,
    Tuple,
    GetTupleElement,
    Slice,
    Broadcast,
    Reshape,
    Transpose,
    Convert,
    Bitcast,
    Negate,
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
    Compare,
    Select,
    While,
    Conditional,
    Call,
    PartialReduce,
    UnionReduce,
}

impl Opcode {
    /// `op(a, b) == op(b, a)` for every pair of operands.
    pub fn is_commutative(self) -> bool {
        matches!(self, Self::Add | Self::Multiply | Self::Maximum | Self::Minimum)
    }

    /// Lower-case mnemonic used in text dumps.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Parameter => "parameter",
            Self::Constant => "constant",
            Self::Tuple => "tuple",
            Self::GetTupleElement => "get-tuple-element",
            Self::Slice => "slice",
            Self::Broadcast => "broadcast",
            Self::Reshape => "reshape",
            Self::Transpose => "transpose",
            Self::Convert => "convert",
            Self::Bitcast => "bitcast",
            Self::Negate => "negate",
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Multiply => "multiply",
            Self::Divide => "divide",
            Self::Maximum => "maximum",
            Self::Minimum => "minimum",
            Self::Compare => "compare",
            Self::Select => "select",
            Self::While => "while",
            Self::Conditional => "conditional",
            Self::Call => "call",
            Self::PartialReduce => "partial-reduce",
            Self::UnionReduce => "union-reduce",
        }
    }
}

/// What an instruction computes, with only the attributes that variant needs.
///
/// Two kinds compare equal iff they have the same opcode and identical static
/// attributes; operands are not part of the kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstrKind {
    /// The `number`-th parameter of the enclosing computation.
    Parameter { number: usize },
    Constant(Literal),
    Tuple,
    GetTupleElement { index: usize },
    Slice {
        starts: Vec<i64>,
        limits: Vec<i64>,
        strides: Vec<i64>,
    },
    /// Broadcast of the operand; `dimensions` maps operand dims to result dims.
    Broadcast { dimensions: Vec<i64> },
    Reshape,
    Transpose { permutation: Vec<i64> },
    /// Element type conversion; the target type is the result shape's.
    Convert,
    /// Reinterpretation of the operand's bytes in the result shape.
    Bitcast,
    Negate,
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
    Compare { direction: ComparisonDirection },
    Select,
    While {
        condition: Handle<Computation>,
        body: Handle<Computation>,
    },
    Conditional { branches: Vec<Handle<Computation>> },
    Call { computation: Handle<Computation> },
    /// A reduction executed independently inside one partition.
    PartialReduce {
        replica_groups: Vec<ReplicaGroup>,
        grouping_key: Option<u64>,
        to_apply: Handle<Computation>,
    },
    /// A reduction spanning every participant of the program.
    UnionReduce {
        replica_groups: Vec<ReplicaGroup>,
        to_apply: Handle<Computation>,
    },
}

impl InstrKind {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Parameter { .. } => Opcode::Parameter,
            Self::Constant(_) => Opcode::Constant,
            Self::Tuple => Opcode::Tuple,
            Self::GetTupleElement { .. } => Opcode::GetTupleElement,
            Self::Slice { .. } => Opcode::Slice,
            Self::Broadcast { .. } => Opcode::Broadcast,
            Self::Reshape => Opcode::Reshape,
            Self::Transpose { .. } => Opcode::Transpose,
            Self::Convert => Opcode::Convert,
            Self::Bitcast => Opcode::Bitcast,
            Self::Negate => Opcode::Negate,
            Self::Add => Opcode::Add,
            Self::Subtract => Opcode::Subtract,
            Self::Multiply => Opcode::Multiply,
            Self::Divide => Opcode::Divide,
            Self::Maximum => Opcode::Maximum,
            Self::Minimum => Opcode::Minimum,
            Self::Compare { .. } => Opcode::Compare,
            Self::Select => Opcode::Select,
            Self::While { .. } => Opcode::While,
            Self::Conditional { .. } => Opcode::Conditional,
            Self::Call { .. } => Opcode::Call,
            Self::PartialReduce { .. } => Opcode::PartialReduce,
            Self::UnionReduce { .. } => Opcode::UnionReduce,
        }
    }

    /// Computations this instruction invokes, in attribute order.
    pub fn called_computations(&self) -> Vec<Handle<Computation>> {
        match self {
            Self::While { condition, body } => vec![*condition, *body],
            Self::Conditional { branches } => branches.clone(),
            Self::Call { computation } => vec![*computation],
            Self::PartialReduce { to_apply, .. } | Self::UnionReduce { to_apply, .. } => {
                vec![*to_apply]
            }
            _ => vec![],
        }
    }

    /// Binary op kind for a binary elementwise opcode.
    pub fn binary(opcode: Opcode) -> Option<Self> {
        Some(match opcode {
            Opcode::Add => Self::Add,
            Opcode::Subtract => Self::Subtract,
            Opcode::Multiply => Self::Multiply,
            Opcode::Divide => Self::Divide,
            Opcode::Maximum => Self::Maximum,
            Opcode::Minimum => Self::Minimum,
            _ => return None,
        })
    }
}

/// A node in a computation: kind, result shape, operands and placement.
#[derive(Clone, Debug)]
pub struct Instruction {
    /// Name used in dumps and diagnostics; unique within a module by convention.
    pub name: String,
    pub kind: InstrKind,
    pub shape: Shape,
    /// Ordered operands, all in the same computation's arena.
    pub operands: Vec<Handle<Instruction>>,
    pub sharding: Option<Sharding>,
}

impl Instruction {
    pub fn new(
        name: impl Into<String>,
        kind: InstrKind,
        shape: Shape,
        operands: impl Into<Vec<Handle<Instruction>>>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            shape,
            operands: operands.into(),
            sharding: None,
        }
    }

    pub fn with_sharding(mut self, sharding: Sharding) -> Self {
        self.sharding = Some(sharding);
        self
    }

    pub fn opcode(&self) -> Opcode {
        self.kind.opcode()
    }

    pub fn operand(&self, index: usize) -> Option<Handle<Instruction>> {
        self.operands.get(index).copied()
    }

    /// Replica groups of a collective.
    pub fn replica_groups(&self) -> Option<&[ReplicaGroup]> {
        match &self.kind {
            InstrKind::PartialReduce { replica_groups, .. }
            | InstrKind::UnionReduce { replica_groups, .. } => Some(replica_groups),
            _ => None,
        }
    }

    /// Grouping key of a partial reduction, if it has one.
    pub fn grouping_key(&self) -> Option<u64> {
        match &self.kind {
            InstrKind::PartialReduce { grouping_key, .. } => *grouping_key,
            _ => None,
        }
    }

    /// Apply computation of a collective.
    pub fn to_apply(&self) -> Option<Handle<Computation>> {
        match &self.kind {
            InstrKind::PartialReduce { to_apply, .. } | InstrKind::UnionReduce { to_apply, .. } => {
                Some(*to_apply)
            }
            _ => None,
        }
    }

    /// Number of positions at which `operand` is read.
    pub fn operand_occurrences(&self, operand: Handle<Instruction>) -> usize {
        self.operands.iter().filter(|&&o| o == operand).count()
    }
}
