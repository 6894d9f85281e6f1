//! Shared fixtures for the reduce combiner integration tests.

#![allow(dead_code)]

use spmd_ir::{
    Computation, ComputationBuilder, Handle, InstrKind, InstrRef, Instruction, Literal, Module,
    Opcode, PrimitiveType, Shape, Sharding, replica_groups, scalar_reducer,
};

/// One op between a partial reduce and its union reduce.
#[derive(Clone, Copy, Debug)]
pub enum Link {
    Convert(PrimitiveType),
    Bitcast(PrimitiveType),
    Negate,
    /// `chain * k`
    Multiply(f64),
    /// `c + chain`
    Add(f64),
    /// `chain - c`
    Subtract(f64),
    /// `c - chain`
    SubtractFrom(f64),
    /// `chain / c`
    Divide(f64),
}

/// Builds `copies` sharded copies of `pr_i(p) -> chain -> ur_i` in one entry
/// computation whose root is the tuple of every `ur_i`.
#[derive(Clone, Debug)]
pub struct Fixture {
    pub input: Shape,
    pub chain: Vec<Link>,
    pub grouping_key: u64,
    /// Replica groups of each copy's partial reduce; one entry per copy.
    pub partial_ids: Vec<Vec<Vec<u64>>>,
    pub union_ids: Vec<Vec<u64>>,
    /// Sharding of each copy's partial reduce; `None` leaves it unset.
    pub shardings: Vec<Option<Sharding>>,
    pub partial_reducer: Opcode,
    pub union_reducer: Opcode,
    /// Overrides the leaf value of `(copy, link)`.
    pub leaf_override: Option<(usize, usize, f64)>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::with_chain(Vec::new())
    }
}

impl Fixture {
    /// Two f32 copies over replicas `{0}` and `{1}`, fused into `{0,1}`.
    pub fn with_chain(chain: Vec<Link>) -> Self {
        Self {
            input: Shape::array(PrimitiveType::F32, [4]),
            chain,
            grouping_key: 1,
            partial_ids: vec![vec![vec![0]], vec![vec![1]]],
            union_ids: vec![vec![0, 1]],
            shardings: vec![Some(Sharding::maximal(0)), Some(Sharding::maximal(1))],
            partial_reducer: Opcode::Add,
            union_reducer: Opcode::Add,
            leaf_override: None,
        }
    }

    pub fn input(mut self, input: Shape) -> Self {
        self.input = input;
        self
    }

    pub fn copies(&self) -> usize {
        self.partial_ids.len()
    }

    pub fn build(&self) -> Module {
        let mut module = Module::new("fixture");
        let element = self.input.element_type().unwrap_or(PrimitiveType::F32);
        let pr_sum =
            module.add_computation(scalar_reducer("pr_sum", element, self.partial_reducer));
        let ur_sum = module.add_computation(scalar_reducer(
            "ur_sum",
            PrimitiveType::F32,
            self.union_reducer,
        ));

        let mut b = ComputationBuilder::new("main");
        let p = b.parameter(0, "p", self.input.clone());
        let mut outs = Vec::new();
        for copy in 0..self.copies() {
            let (_, ur) = self.build_copy(&mut b, copy, p, pr_sum, ur_sum);
            outs.push(ur);
        }
        let root = b.tuple("out", outs);
        let main = module.add_computation(b.build(root));
        module.set_entry(main);
        module
    }

    /// Adds copy `copy` to `b`, returning its partial and union reduce.
    pub fn build_copy(
        &self,
        b: &mut ComputationBuilder,
        copy: usize,
        input: Handle<Instruction>,
        pr_sum: Handle<Computation>,
        ur_sum: Handle<Computation>,
    ) -> (Handle<Instruction>, Handle<Instruction>) {
        let groups: Vec<&[u64]> = self.partial_ids[copy].iter().map(Vec::as_slice).collect();
        let pr = b.partial_reduce(
            format!("pr{copy}"),
            input,
            replica_groups(&groups),
            Some(self.grouping_key),
            pr_sum,
        );
        if let Some(sharding) = self.shardings.get(copy).cloned().flatten() {
            b.set_sharding(pr, sharding);
        }

        let mut value = pr;
        for (index, link) in self.chain.iter().enumerate() {
            let leaf = |b: &mut ComputationBuilder, value: Handle<Instruction>, v: f64| {
                let v = match self.leaf_override {
                    Some((c, l, over)) if c == copy && l == index => over,
                    _ => v,
                };
                let shape = b.shape(value).clone();
                b.constant(format!("c{copy}_{index}"), Literal::splat(&shape, v))
            };
            let name = format!("link{copy}_{index}");
            value = match *link {
                Link::Convert(ty) => b.convert(name, value, ty),
                Link::Bitcast(ty) => {
                    let shape = b.shape(value).with_element_type(ty);
                    b.bitcast(name, value, shape)
                }
                Link::Negate => b.unary(name, InstrKind::Negate, value),
                Link::Multiply(k) => {
                    let k = leaf(b, value, k);
                    b.binary(name, InstrKind::Multiply, value, k)
                }
                Link::Add(c) => {
                    let c = leaf(b, value, c);
                    b.binary(name, InstrKind::Add, c, value)
                }
                Link::Subtract(c) => {
                    let c = leaf(b, value, c);
                    b.binary(name, InstrKind::Subtract, value, c)
                }
                Link::SubtractFrom(c) => {
                    let c = leaf(b, value, c);
                    b.binary(name, InstrKind::Subtract, c, value)
                }
                Link::Divide(c) => {
                    let c = leaf(b, value, c);
                    b.binary(name, InstrKind::Divide, value, c)
                }
            };
        }

        let union: Vec<&[u64]> = self.union_ids.iter().map(Vec::as_slice).collect();
        let ur = b.union_reduce(format!("ur{copy}"), value, replica_groups(&union), ur_sum);
        if let Some(sharding) = self.shardings.get(copy).cloned().flatten() {
            b.set_sharding(ur, sharding);
        }
        (pr, ur)
    }
}

/// Renders the expression tree rooted at `r`, e.g. `union-reduce(convert(parameter))`.
///
/// Constants print their value, so `constant(2)` is a splat of 2.
pub fn describe(module: &Module, r: InstrRef) -> String {
    let comp = module.computation(r.computation).unwrap();
    describe_in(comp, r.instruction)
}

fn describe_in(comp: &Computation, handle: Handle<Instruction>) -> String {
    let instr = comp.get(handle).unwrap();
    match &instr.kind {
        InstrKind::Parameter { .. } => "parameter".to_string(),
        InstrKind::Constant(lit) => format!("constant({})", lit.values()[0]),
        _ => {
            let operands: Vec<_> = instr
                .operands
                .iter()
                .map(|&o| describe_in(comp, o))
                .collect();
            format!("{}({})", instr.opcode(), operands.join(", "))
        }
    }
}

/// The value each copy returns from the entry computation.
pub fn copy_results(module: &Module) -> Vec<InstrRef> {
    let entry = module.entry.unwrap();
    let comp = module.computation(entry).unwrap();
    let root = comp.get(comp.root().unwrap()).unwrap();
    root.operands
        .iter()
        .map(|&h| InstrRef::new(entry, h))
        .collect()
}

/// All instructions with the given opcode, across the module.
pub fn instructions_with(module: &Module, opcode: Opcode) -> Vec<InstrRef> {
    module
        .computations
        .iter()
        .flat_map(|(ch, comp)| {
            comp.instructions
                .iter()
                .filter(move |(_, i)| i.opcode() == opcode)
                .map(move |(ih, _)| InstrRef::new(ch, ih))
        })
        .collect()
}
