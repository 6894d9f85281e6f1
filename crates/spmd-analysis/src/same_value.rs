//! Value-equivalence oracle.
//!
//! Decides whether two instructions always produce an identical value. The
//! answer is conservative: `true` is a proof, `false` means "could not prove".
//!
//! Values carried around a While loop are compared coinductively: while a
//! pair is being compared it is assumed equal, so reaching the same pair
//! again through the loop back-edge succeeds, and the claim only holds if
//! every other path (including the pre-loop values) proves it too.

use std::collections::{HashMap, HashSet};

use spmd_ir::{Computation, Handle, InstrKind, InstrRef, Instruction, Module, Opcode};

use crate::call_graph::CallGraph;

type PairKey = (InstrRef, InstrRef);

fn pair_key(a: InstrRef, b: InstrRef) -> PairKey {
    if a <= b { (a, b) } else { (b, a) }
}

/// Memoizing value-equivalence oracle for one module.
///
/// The memo table lives as long as the oracle; build a fresh oracle after
/// mutating the module.
#[derive(Debug)]
pub struct ValueOracle<'a> {
    module: &'a Module,
    call_graph: &'a CallGraph,
    /// Settled answers. `false` entries may be recorded mid-proof; `true`
    /// entries only once a top-level query has succeeded.
    proven: HashMap<PairKey, bool>,
    /// Pairs currently assumed equal.
    assumed: HashSet<PairKey>,
    /// Assumptions in the order they were made, for rollback.
    assumption_log: Vec<PairKey>,
}

impl<'a> ValueOracle<'a> {
    pub fn new(module: &'a Module, call_graph: &'a CallGraph) -> Self {
        Self {
            module,
            call_graph,
            proven: HashMap::new(),
            assumed: HashSet::new(),
            assumption_log: Vec::new(),
        }
    }

    /// Returns `true` if `a` and `b` provably compute the same value.
    pub fn same_value(&mut self, a: InstrRef, b: InstrRef) -> bool {
        let mark = self.assumption_log.len();
        let result = self.compare(a, b);
        for key in self.assumption_log.split_off(mark) {
            self.assumed.remove(&key);
            if result {
                self.proven.insert(key, true);
            }
        }
        result
    }

    fn compare(&mut self, a: InstrRef, b: InstrRef) -> bool {
        if a == b {
            return true;
        }
        let key = pair_key(a, b);
        if let Some(&known) = self.proven.get(&key) {
            return known;
        }
        if self.assumed.contains(&key) {
            return true;
        }

        let mark = self.assumption_log.len();
        self.assumed.insert(key);
        self.assumption_log.push(key);

        let result = self.compare_uncached(a, b);
        if !result {
            // Everything assumed since `key` may rest on `key`.
            for stale in self.assumption_log.split_off(mark) {
                self.assumed.remove(&stale);
            }
            self.proven.insert(key, false);
        }
        result
    }

    fn compare_uncached(&mut self, a: InstrRef, b: InstrRef) -> bool {
        let (Ok(ia), Ok(ib)) = (self.module.instr(a), self.module.instr(b)) else {
            return false;
        };
        if ia.opcode() != ib.opcode()
            || ia.shape != ib.shape
            || ia.operands.len() != ib.operands.len()
        {
            return false;
        }

        match (&ia.kind, &ib.kind) {
            // Distinct parameters may be bound to anything.
            (InstrKind::Parameter { .. }, _) => false,
            (InstrKind::Constant(x), InstrKind::Constant(y)) => x == y,
            (
                InstrKind::GetTupleElement { index: i },
                InstrKind::GetTupleElement { index: j },
            ) => {
                let (i, j) = (*i, *j);
                let (ta, tb) = (operand_ref(a, ia, 0), operand_ref(b, ib, 0));
                let (Some(ta), Some(tb)) = (ta, tb) else {
                    return false;
                };
                self.compare(ta, tb) && (i == j || self.tuple_elements_same(ta, i, j))
            }
            (
                InstrKind::PartialReduce {
                    replica_groups: ga,
                    grouping_key: ka,
                    to_apply: fa,
                },
                InstrKind::PartialReduce {
                    replica_groups: gb,
                    grouping_key: kb,
                    to_apply: fb,
                },
            ) => {
                same_operand_instructions(a, ia, b, ib)
                    && ga == gb
                    && ka == kb
                    && same_reducer(self.module, *fa, *fb)
            }
            (
                InstrKind::UnionReduce {
                    replica_groups: ga,
                    to_apply: fa,
                },
                InstrKind::UnionReduce {
                    replica_groups: gb,
                    to_apply: fb,
                },
            ) => {
                same_operand_instructions(a, ia, b, ib)
                    && ga == gb
                    && same_reducer(self.module, *fa, *fb)
            }
            (ka, kb) if ka == kb => {
                if self.operands_same(a, ia, b, ib, false) {
                    return true;
                }
                ia.opcode().is_commutative()
                    && ia.operands.len() == 2
                    && self.operands_same(a, ia, b, ib, true)
            }
            _ => false,
        }
    }

    /// Compares operands pairwise, optionally with `b`'s two operands swapped.
    fn operands_same(
        &mut self,
        a: InstrRef,
        ia: &Instruction,
        b: InstrRef,
        ib: &Instruction,
        swapped: bool,
    ) -> bool {
        let n = ib.operands.len();
        ia.operands.iter().enumerate().all(|(k, &oa)| {
            let kb = if swapped { n - 1 - k } else { k };
            let ob = ib.operands[kb];
            self.compare(
                InstrRef::new(a.computation, oa),
                InstrRef::new(b.computation, ob),
            )
        })
    }

    /// Whether elements `i` and `j` agree in every tuple `tuple` can be.
    fn tuple_elements_same(&mut self, tuple: InstrRef, i: usize, j: usize) -> bool {
        let Some(sources) = self.tuple_sources(tuple) else {
            return false;
        };
        sources.into_iter().all(|source| {
            let Ok(instr) = self.module.instr(source) else {
                return false;
            };
            match (operand_ref(source, instr, i), operand_ref(source, instr, j)) {
                (Some(ei), Some(ej)) => self.compare(ei, ej),
                _ => false,
            }
        })
    }

    /// Every Tuple instruction whose value `tuple` may hold, or `None` if
    /// that set cannot be determined.
    pub fn tuple_sources(&self, tuple: InstrRef) -> Option<Vec<InstrRef>> {
        let mut sources = Vec::new();
        let mut visited = HashSet::new();
        self.collect_tuple_sources(tuple, &mut visited, &mut sources)?;
        sources.sort();
        sources.dedup();
        Some(sources)
    }

    fn collect_tuple_sources(
        &self,
        r: InstrRef,
        visited: &mut HashSet<InstrRef>,
        out: &mut Vec<InstrRef>,
    ) -> Option<()> {
        if !visited.insert(r) {
            return Some(());
        }
        let instr = self.module.instr(r).ok()?;
        match &instr.kind {
            InstrKind::Tuple => out.push(r),
            InstrKind::Parameter { .. } => {
                let while_instr = self.call_graph.sole_while_caller(self.module, r.computation)?;
                self.collect_loop_sources(while_instr, visited, out)?;
            }
            InstrKind::While { .. } => self.collect_loop_sources(r, visited, out)?,
            _ => return None,
        }
        Some(())
    }

    /// A loop value is either the init operand or whatever the body returns.
    fn collect_loop_sources(
        &self,
        while_ref: InstrRef,
        visited: &mut HashSet<InstrRef>,
        out: &mut Vec<InstrRef>,
    ) -> Option<()> {
        let while_instr = self.module.instr(while_ref).ok()?;
        let InstrKind::While { body, .. } = while_instr.kind else {
            return None;
        };
        let init = operand_ref(while_ref, while_instr, 0)?;
        let body_root = InstrRef::new(body, self.module.computation(body).ok()?.root()?);
        self.collect_tuple_sources(init, visited, out)?;
        self.collect_tuple_sources(body_root, visited, out)
    }
}

fn operand_ref(r: InstrRef, instr: &Instruction, index: usize) -> Option<InstrRef> {
    instr
        .operand(index)
        .map(|h| InstrRef::new(r.computation, h))
}

/// Collectives depend on their peers, so only literally shared operands count.
fn same_operand_instructions(a: InstrRef, ia: &Instruction, b: InstrRef, ib: &Instruction) -> bool {
    a.computation == b.computation && ia.operands == ib.operands
}

/// The commutative opcode a two-parameter reducer applies, if it is one.
pub fn reducer_kind(module: &Module, computation: Handle<Computation>) -> Option<Opcode> {
    let comp = module.computation(computation).ok()?;
    let [p0, p1] = comp.parameters[..] else {
        return None;
    };
    let root = comp.get(comp.root()?).ok()?;
    let opcode = root.opcode();
    let reads_both = root.operands[..] == [p0, p1] || root.operands[..] == [p1, p0];
    (opcode.is_commutative() && reads_both && p0 != p1).then_some(opcode)
}

/// Two apply computations perform the same reduction.
///
/// Element types are not compared: a bf16 sum and an f32 sum reduce alike.
pub fn same_reducer(module: &Module, a: Handle<Computation>, b: Handle<Computation>) -> bool {
    if a == b {
        return true;
    }
    matches!(
        (reducer_kind(module, a), reducer_kind(module, b)),
        (Some(x), Some(y)) if x == y
    )
}

/// Whether `computation` sums its two parameters.
pub fn is_sum_reducer(module: &Module, computation: Handle<Computation>) -> bool {
    reducer_kind(module, computation) == Some(Opcode::Add)
}

/// One-off query: builds a call graph and a fresh oracle for `module`.
///
/// Returns `false` if the call graph cannot be built.
pub fn instructions_compute_same_value(module: &Module, a: InstrRef, b: InstrRef) -> bool {
    match CallGraph::build(module) {
        Ok(call_graph) => ValueOracle::new(module, &call_graph).same_value(a, b),
        Err(err) => {
            log::debug!("same-value query without call graph: {err}");
            false
        }
    }
}
