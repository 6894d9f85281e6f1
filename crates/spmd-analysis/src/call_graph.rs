//! Call graph construction over a module's computations.
//!
//! Records, for every computation reachable from the entry, the instructions
//! that invoke it, and orders computations so callees come before callers.

use std::collections::{BTreeMap, BTreeSet};

use spmd_ir::{Computation, Handle, InstrKind, InstrRef, IrError, Module};

/// Errors during call graph construction.
#[derive(Debug, thiserror::Error)]
pub enum CallGraphError {
    /// A computation (transitively) calls itself.
    #[error("recursive call graph ({visited} of {total} computations ordered)")]
    Recursion { visited: usize, total: usize },

    /// The module itself is malformed.
    #[error(transparent)]
    Ir(#[from] IrError),
}

/// How a computation is invoked from a call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallContext {
    /// Control flow: While condition/body, Conditional branch, Call.
    Control,
    /// The apply function of a collective reduction.
    Apply,
}

/// One instruction invoking a computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallSite {
    pub instruction: InstrRef,
    pub context: CallContext,
}

/// Callers of every computation reachable from the module entry.
#[derive(Clone, Debug, Default)]
pub struct CallGraph {
    call_sites: BTreeMap<Handle<Computation>, Vec<CallSite>>,
    post_order: Vec<Handle<Computation>>,
}

impl CallGraph {
    /// Builds the call graph of every computation reachable from the entry.
    ///
    /// # Errors
    ///
    /// Returns [`CallGraphError::Ir`] if the entry is missing or an
    /// instruction calls an unknown computation, and
    /// [`CallGraphError::Recursion`] if the calls form a cycle.
    pub fn build(module: &Module) -> Result<Self, CallGraphError> {
        let entry = module.entry.ok_or(IrError::MissingEntry)?;

        let mut call_sites: BTreeMap<Handle<Computation>, Vec<CallSite>> = BTreeMap::new();
        let mut callees: BTreeMap<Handle<Computation>, BTreeSet<Handle<Computation>>> =
            BTreeMap::new();
        let mut worklist = vec![entry];
        call_sites.entry(entry).or_default();

        while let Some(caller) = worklist.pop() {
            if callees.contains_key(&caller) {
                continue;
            }
            let comp = module.computation(caller)?;
            let mut called = BTreeSet::new();
            for (handle, instr) in comp.instructions.iter() {
                let context = match instr.kind {
                    InstrKind::PartialReduce { .. } | InstrKind::UnionReduce { .. } => {
                        CallContext::Apply
                    }
                    _ => CallContext::Control,
                };
                for callee in instr.kind.called_computations() {
                    module.computation(callee)?;
                    call_sites.entry(callee).or_default().push(CallSite {
                        instruction: InstrRef::new(caller, handle),
                        context,
                    });
                    called.insert(callee);
                    worklist.push(callee);
                }
            }
            callees.insert(caller, called);
        }

        let post_order = callees_first(&callees)?;
        Ok(Self {
            call_sites,
            post_order,
        })
    }

    /// Instructions invoking `computation`, in discovery order.
    pub fn callers(&self, computation: Handle<Computation>) -> &[CallSite] {
        self.call_sites
            .get(&computation)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Reachable computations, every callee before its callers.
    ///
    /// Ties are broken by handle order, so the result is deterministic.
    pub fn post_order(&self) -> &[Handle<Computation>] {
        &self.post_order
    }

    /// The While instruction running `computation` as its body, if that is
    /// the computation's only call site.
    pub fn sole_while_caller(
        &self,
        module: &Module,
        computation: Handle<Computation>,
    ) -> Option<InstrRef> {
        let [site] = self.callers(computation) else {
            return None;
        };
        match module.instr(site.instruction).ok()?.kind {
            InstrKind::While { body, .. } if body == computation => Some(site.instruction),
            _ => None,
        }
    }
}

/// Kahn's algorithm over the callee relation.
fn callees_first(
    callees: &BTreeMap<Handle<Computation>, BTreeSet<Handle<Computation>>>,
) -> Result<Vec<Handle<Computation>>, CallGraphError> {
    let mut pending: BTreeMap<Handle<Computation>, usize> =
        callees.iter().map(|(&c, set)| (c, set.len())).collect();
    let mut callers_of: BTreeMap<Handle<Computation>, Vec<Handle<Computation>>> = BTreeMap::new();
    for (&caller, set) in callees {
        for &callee in set {
            callers_of.entry(callee).or_default().push(caller);
        }
    }

    // BTreeSet for deterministic ordering (lower handle first).
    let mut ready: BTreeSet<Handle<Computation>> = pending
        .iter()
        .filter(|&(_, &n)| n == 0)
        .map(|(&c, _)| c)
        .collect();
    let mut order = Vec::with_capacity(callees.len());

    while let Some(comp) = ready.pop_first() {
        order.push(comp);
        for &caller in callers_of.get(&comp).into_iter().flatten() {
            if let Some(n) = pending.get_mut(&caller) {
                *n -= 1;
                if *n == 0 {
                    ready.insert(caller);
                }
            }
        }
    }

    if order.len() != callees.len() {
        return Err(CallGraphError::Recursion {
            visited: order.len(),
            total: callees.len(),
        });
    }
    Ok(order)
}
