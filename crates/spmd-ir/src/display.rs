//! Display implementations and text dump for debugging.

use std::fmt;

use crate::Module;
use crate::arena::Handle;
use crate::computation::Computation;
use crate::instr::{ComparisonDirection, InstrKind, Instruction, Literal, Opcode};
use crate::sharding::{ReplicaGroup, Sharding};
use crate::types::{PrimitiveType, Shape};

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pred => "pred",
            Self::S32 => "s32",
            Self::U32 => "u32",
            Self::BF16 => "bf16",
            Self::F16 => "f16",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array { element, dims } => {
                let dims: Vec<_> = dims.iter().map(i64::to_string).collect();
                write!(f, "{element}[{}]", dims.join(","))
            }
            Self::Tuple(elements) => {
                let elems: Vec<_> = elements.iter().map(Shape::to_string).collect();
                write!(f, "({})", elems.join(", "))
            }
        }
    }
}

impl fmt::Display for Sharding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replicated => write!(f, "{{replicated}}"),
            Self::Maximal { device } => write!(f, "{{maximal device={device}}}"),
            Self::Tuple(elements) => {
                let elems: Vec<_> = elements.iter().map(Sharding::to_string).collect();
                write!(f, "{{{}}}", elems.join(", "))
            }
        }
    }
}

impl fmt::Display for ReplicaGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<_> = self.replica_ids.iter().map(u64::to_string).collect();
        write!(f, "{{{}}}", ids.join(","))
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.shape().dims().is_empty(), self.values()) {
            (true, [value]) => write!(f, "{value}"),
            (_, values) => {
                let vals: Vec<_> = values.iter().map(f64::to_string).collect();
                write!(f, "{{{}}}", vals.join(", "))
            }
        }
    }
}

impl fmt::Display for ComparisonDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "EQ",
            Self::Ne => "NE",
            Self::Lt => "LT",
            Self::Le => "LE",
            Self::Gt => "GT",
            Self::Ge => "GE",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

fn format_ints(values: &[i64]) -> String {
    let vals: Vec<_> = values.iter().map(i64::to_string).collect();
    format!("{{{}}}", vals.join(","))
}

fn format_groups(groups: &[ReplicaGroup]) -> String {
    let groups: Vec<_> = groups.iter().map(ReplicaGroup::to_string).collect();
    format!("{{{}}}", groups.join(","))
}

fn computation_name(module: &Module, handle: Handle<Computation>) -> String {
    match module.computations.try_get(handle) {
        Some(comp) => format!("%{}", comp.name),
        None => format!("%<missing {handle:?}>"),
    }
}

/// Renders the static attributes of an instruction, e.g. `index=1, to_apply=%sum`.
fn format_attributes(module: &Module, kind: &InstrKind) -> Vec<String> {
    let comp = |h| computation_name(module, h);
    match kind {
        InstrKind::GetTupleElement { index } => vec![format!("index={index}")],
        InstrKind::Slice {
            starts,
            limits,
            strides,
        } => vec![format!(
            "slice={} {} {}",
            format_ints(starts),
            format_ints(limits),
            format_ints(strides)
        )],
        InstrKind::Broadcast { dimensions } => {
            vec![format!("dimensions={}", format_ints(dimensions))]
        }
        InstrKind::Transpose { permutation } => {
            vec![format!("dimensions={}", format_ints(permutation))]
        }
        InstrKind::Compare { direction } => vec![format!("direction={direction}")],
        InstrKind::While { condition, body } => {
            vec![
                format!("condition={}", comp(*condition)),
                format!("body={}", comp(*body)),
            ]
        }
        InstrKind::Conditional { branches } => {
            let names: Vec<_> = branches.iter().map(|&b| comp(b)).collect();
            vec![format!("branch_computations={{{}}}", names.join(", "))]
        }
        InstrKind::Call { computation } => vec![format!("to_apply={}", comp(*computation))],
        InstrKind::PartialReduce {
            replica_groups,
            grouping_key,
            to_apply,
        } => {
            let mut attrs = vec![format!("replica_groups={}", format_groups(replica_groups))];
            if let Some(key) = grouping_key {
                attrs.push(format!("grouping_key={key}"));
            }
            attrs.push(format!("to_apply={}", comp(*to_apply)));
            attrs
        }
        InstrKind::UnionReduce {
            replica_groups,
            to_apply,
        } => vec![
            format!("replica_groups={}", format_groups(replica_groups)),
            format!("to_apply={}", comp(*to_apply)),
        ],
        _ => vec![],
    }
}

fn format_instruction(module: &Module, comp: &Computation, instr: &Instruction) -> String {
    let operands = match &instr.kind {
        InstrKind::Parameter { number } => number.to_string(),
        InstrKind::Constant(literal) => literal.to_string(),
        _ => instr
            .operands
            .iter()
            .map(|&h| match comp.instructions.try_get(h) {
                Some(op) => format!("%{}", op.name),
                None => format!("%<removed {h:?}>"),
            })
            .collect::<Vec<_>>()
            .join(", "),
    };
    let mut line = format!(
        "%{} = {} {}({operands})",
        instr.name,
        instr.shape,
        instr.opcode()
    );
    let mut attrs = format_attributes(module, &instr.kind);
    if let Some(sharding) = &instr.sharding {
        attrs.push(format!("sharding={sharding}"));
    }
    if !attrs.is_empty() {
        line.push_str(", ");
        line.push_str(&attrs.join(", "));
    }
    line
}

fn dump_computation(out: &mut String, module: &Module, handle: Handle<Computation>) {
    let comp = &module.computations[handle];
    let params: Vec<_> = comp
        .parameters
        .iter()
        .filter_map(|&p| comp.instructions.try_get(p))
        .map(|p| format!("{}: {}", p.name, p.shape))
        .collect();
    let result = comp
        .root()
        .and_then(|r| comp.instructions.try_get(r))
        .map(|r| format!(" -> {}", r.shape))
        .unwrap_or_default();
    let entry = if module.entry == Some(handle) {
        "ENTRY "
    } else {
        ""
    };
    out.push_str(&format!(
        "{entry}%{} ({}){result} {{\n",
        comp.name,
        params.join(", ")
    ));
    for instr_handle in comp.post_order() {
        let instr = &comp.instructions[instr_handle];
        let marker = if comp.root() == Some(instr_handle) {
            "ROOT "
        } else {
            ""
        };
        out.push_str(&format!(
            "  {marker}{}\n",
            format_instruction(module, comp, instr)
        ));
    }
    out.push_str("}\n");
}

/// Produces a human-readable text dump of a [`Module`] for debugging.
///
/// Computations appear in allocation order and instructions in operand-first
/// order, so two structurally identical modules dump to the same text.
pub fn dump_module(module: &Module) -> String {
    let mut out = format!("HloModule {}\n", module.name);
    for handle in module.computations.handles() {
        out.push('\n');
        dump_computation(&mut out, module, handle);
    }
    out
}
