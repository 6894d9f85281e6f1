//! Convenience builder for computations.
//!
//! Result shapes are inferred from operands where the opcode determines them.
//! Handles passed to the builder must come from the same builder.

use crate::arena::Handle;
use crate::computation::Computation;
use crate::instr::{InstrKind, Instruction, Literal, Opcode};
use crate::sharding::{ReplicaGroup, Sharding};
use crate::types::{PrimitiveType, Shape};

/// Incrementally constructs a [`Computation`].
#[derive(Debug)]
pub struct ComputationBuilder {
    comp: Computation,
}

impl ComputationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            comp: Computation::new(name),
        }
    }

    /// Appends a fully specified instruction.
    pub fn add(&mut self, instruction: Instruction) -> Handle<Instruction> {
        self.comp.add_instruction(instruction)
    }

    /// Shape of a previously added instruction.
    pub fn shape(&self, handle: Handle<Instruction>) -> &Shape {
        &self.comp.instructions[handle].shape
    }

    /// Places an existing instruction on a partition.
    pub fn set_sharding(&mut self, handle: Handle<Instruction>, sharding: Sharding) {
        self.comp.instructions[handle].sharding = Some(sharding);
    }

    pub fn parameter(
        &mut self,
        number: usize,
        name: impl Into<String>,
        shape: Shape,
    ) -> Handle<Instruction> {
        self.add(Instruction::new(
            name,
            InstrKind::Parameter { number },
            shape,
            [],
        ))
    }

    pub fn constant(&mut self, name: impl Into<String>, literal: Literal) -> Handle<Instruction> {
        let shape = literal.shape().clone();
        self.add(Instruction::new(name, InstrKind::Constant(literal), shape, []))
    }

    /// An elementwise unary op whose result shape equals the operand's.
    pub fn unary(
        &mut self,
        name: impl Into<String>,
        kind: InstrKind,
        operand: Handle<Instruction>,
    ) -> Handle<Instruction> {
        let shape = self.shape(operand).clone();
        self.add(Instruction::new(name, kind, shape, [operand]))
    }

    /// An elementwise binary op whose result shape equals the left operand's.
    pub fn binary(
        &mut self,
        name: impl Into<String>,
        kind: InstrKind,
        lhs: Handle<Instruction>,
        rhs: Handle<Instruction>,
    ) -> Handle<Instruction> {
        let shape = self.shape(lhs).clone();
        self.add(Instruction::new(name, kind, shape, [lhs, rhs]))
    }

    pub fn convert(
        &mut self,
        name: impl Into<String>,
        operand: Handle<Instruction>,
        element: PrimitiveType,
    ) -> Handle<Instruction> {
        let shape = self.shape(operand).with_element_type(element);
        self.add(Instruction::new(name, InstrKind::Convert, shape, [operand]))
    }

    pub fn bitcast(
        &mut self,
        name: impl Into<String>,
        operand: Handle<Instruction>,
        shape: Shape,
    ) -> Handle<Instruction> {
        self.add(Instruction::new(name, InstrKind::Bitcast, shape, [operand]))
    }

    /// Broadcasts `operand` to `shape`; operand dim `i` maps to result dim
    /// `dimensions[i]`.
    pub fn broadcast(
        &mut self,
        name: impl Into<String>,
        operand: Handle<Instruction>,
        shape: Shape,
        dimensions: impl Into<Vec<i64>>,
    ) -> Handle<Instruction> {
        self.add(Instruction::new(
            name,
            InstrKind::Broadcast {
                dimensions: dimensions.into(),
            },
            shape,
            [operand],
        ))
    }

    pub fn reshape(
        &mut self,
        name: impl Into<String>,
        operand: Handle<Instruction>,
        dims: impl Into<Vec<i64>>,
    ) -> Handle<Instruction> {
        let element = self
            .shape(operand)
            .element_type()
            .unwrap_or(PrimitiveType::F32);
        let shape = Shape::array(element, dims);
        self.add(Instruction::new(name, InstrKind::Reshape, shape, [operand]))
    }

    /// Result dimension `i` is operand dimension `permutation[i]`.
    pub fn transpose(
        &mut self,
        name: impl Into<String>,
        operand: Handle<Instruction>,
        permutation: impl Into<Vec<i64>>,
    ) -> Handle<Instruction> {
        let permutation = permutation.into();
        let src = self.shape(operand);
        let dims: Vec<i64> = permutation
            .iter()
            .map(|&p| src.dims().get(p as usize).copied().unwrap_or(0))
            .collect();
        let shape = Shape::array(src.element_type().unwrap_or(PrimitiveType::F32), dims);
        self.add(Instruction::new(
            name,
            InstrKind::Transpose { permutation },
            shape,
            [operand],
        ))
    }

    pub fn slice(
        &mut self,
        name: impl Into<String>,
        operand: Handle<Instruction>,
        starts: impl Into<Vec<i64>>,
        limits: impl Into<Vec<i64>>,
        strides: impl Into<Vec<i64>>,
    ) -> Handle<Instruction> {
        let (starts, limits, strides) = (starts.into(), limits.into(), strides.into());
        let dims: Vec<i64> = starts
            .iter()
            .zip(&limits)
            .zip(&strides)
            .map(|((&s, &l), &st)| {
                let st = st.max(1);
                (l - s + st - 1) / st
            })
            .collect();
        let element = self
            .shape(operand)
            .element_type()
            .unwrap_or(PrimitiveType::F32);
        self.add(Instruction::new(
            name,
            InstrKind::Slice {
                starts,
                limits,
                strides,
            },
            Shape::array(element, dims),
            [operand],
        ))
    }

    pub fn tuple(
        &mut self,
        name: impl Into<String>,
        elements: impl Into<Vec<Handle<Instruction>>>,
    ) -> Handle<Instruction> {
        let elements = elements.into();
        let shape = Shape::tuple(
            elements
                .iter()
                .map(|&e| self.shape(e).clone())
                .collect::<Vec<_>>(),
        );
        self.add(Instruction::new(name, InstrKind::Tuple, shape, elements))
    }

    /// # Panics
    ///
    /// Panics if `operand` is not a tuple with more than `index` elements.
    pub fn get_tuple_element(
        &mut self,
        name: impl Into<String>,
        operand: Handle<Instruction>,
        index: usize,
    ) -> Handle<Instruction> {
        let shape = match self.shape(operand).tuple_element(index) {
            Some(shape) => shape.clone(),
            None => panic!(
                "get-tuple-element index {index} out of range for {:?}",
                self.shape(operand)
            ),
        };
        self.add(Instruction::new(
            name,
            InstrKind::GetTupleElement { index },
            shape,
            [operand],
        ))
    }

    pub fn while_loop(
        &mut self,
        name: impl Into<String>,
        init: Handle<Instruction>,
        condition: Handle<Computation>,
        body: Handle<Computation>,
    ) -> Handle<Instruction> {
        let shape = self.shape(init).clone();
        self.add(Instruction::new(
            name,
            InstrKind::While { condition, body },
            shape,
            [init],
        ))
    }

    pub fn call(
        &mut self,
        name: impl Into<String>,
        operands: impl Into<Vec<Handle<Instruction>>>,
        computation: Handle<Computation>,
        shape: Shape,
    ) -> Handle<Instruction> {
        self.add(Instruction::new(
            name,
            InstrKind::Call { computation },
            shape,
            operands,
        ))
    }

    pub fn partial_reduce(
        &mut self,
        name: impl Into<String>,
        operand: Handle<Instruction>,
        replica_groups: Vec<ReplicaGroup>,
        grouping_key: Option<u64>,
        to_apply: Handle<Computation>,
    ) -> Handle<Instruction> {
        self.unary(
            name,
            InstrKind::PartialReduce {
                replica_groups,
                grouping_key,
                to_apply,
            },
            operand,
        )
    }

    pub fn union_reduce(
        &mut self,
        name: impl Into<String>,
        operand: Handle<Instruction>,
        replica_groups: Vec<ReplicaGroup>,
        to_apply: Handle<Computation>,
    ) -> Handle<Instruction> {
        self.unary(
            name,
            InstrKind::UnionReduce {
                replica_groups,
                to_apply,
            },
            operand,
        )
    }

    /// Finishes the computation with `root` as its result.
    pub fn build(mut self, root: Handle<Instruction>) -> Computation {
        self.comp.set_root(root);
        self.comp
    }
}

/// A two-parameter scalar computation returning `opcode(x, y)`.
///
/// Non-binary opcodes fall back to addition.
pub fn scalar_reducer(
    name: impl Into<String>,
    element: PrimitiveType,
    opcode: Opcode,
) -> Computation {
    let mut b = ComputationBuilder::new(name);
    let x = b.parameter(0, "x", Shape::scalar(element));
    let y = b.parameter(1, "y", Shape::scalar(element));
    let kind = InstrKind::binary(opcode).unwrap_or(InstrKind::Add);
    let root = b.binary(opcode.mnemonic(), kind, x, y);
    b.build(root)
}
