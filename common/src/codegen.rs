//! Argument reader preamble
//!
//! Instrumentation code reads USDT arguments through generated helpers, one
//! per enabled function and argument index:
//!
//! ```c
//! static __always_inline int _bpf_readarg_<fn>_<n>(struct pt_regs *ctx,
//!                                                  void *dest,
//!                                                  unsigned long len);
//! ```
//!
//! A probe can be compiled into several call sites with different argument
//! locations. In that case the reader switches on the instruction pointer,
//! which is why every site carries its runtime address.

use std::fmt::Write;

use crate::{
    args::{ArgSpec, Operand},
    constants::PREAMBLE_HEADER,
};

/// One call site of an enabled probe
#[derive(Clone, Debug)]
pub struct ProbeSite {
    /// Address of the probe instruction in the traced process
    pub ip: u64,
    /// Argument locations at this site
    pub args: Vec<ArgSpec>,
}

/// A probe enabled for an instrumentation function
#[derive(Clone, Debug)]
pub struct EnabledProbe {
    /// Function run when the probe fires
    pub fn_name: String,
    /// Every call site of the probe
    pub sites: Vec<ProbeSite>,
}

/// Generate the full preamble for a set of enabled probes.
pub fn generate_preamble(probes: &[EnabledProbe]) -> String {
    let mut out = String::from(PREAMBLE_HEADER);

    for probe in probes {
        let max_args = probe.sites.iter().map(|s| s.args.len()).max().unwrap_or(0);
        for index in 0..max_args {
            out.push('\n');
            write_reader(&mut out, probe, index);
        }
    }

    out
}

fn write_reader(out: &mut String, probe: &EnabledProbe, index: usize) {
    let _ = writeln!(
        out,
        "static __always_inline int _bpf_readarg_{}_{}(struct pt_regs *ctx, void *dest, unsigned long len)\n{{",
        probe.fn_name,
        index + 1
    );

    let sites: Vec<(u64, &ArgSpec)> = probe
        .sites
        .iter()
        .filter_map(|site| site.args.get(index).map(|arg| (site.ip, arg)))
        .collect();

    let uniform = sites.len() == probe.sites.len()
        && sites.windows(2).all(|pair| pair[0].1 == pair[1].1);

    match sites.first() {
        Some((_, arg)) if uniform => write_read(out, arg, "\t"),
        _ => {
            out.push_str("\tswitch (ctx->rip) {\n");
            for (ip, arg) in &sites {
                let _ = writeln!(out, "\tcase {ip:#x}ULL: {{");
                write_read(out, arg, "\t\t");
                out.push_str("\t}\n");
            }
            out.push_str("\tdefault:\n\t\treturn -1;\n\t}\n");
        }
    }

    out.push_str("}\n");
}

fn write_read(out: &mut String, arg: &ArgSpec, indent: &str) {
    let ty = arg.c_type();

    let _ = writeln!(out, "{indent}{ty} __res;");
    let _ = writeln!(out, "{indent}if (len != sizeof(__res))\n{indent}\treturn -1;");
    match &arg.operand {
        Operand::Register(reg) => {
            let _ = writeln!(out, "{indent}__res = ({ty})ctx->{reg};");
        }
        Operand::Immediate(value) => {
            let _ = writeln!(out, "{indent}__res = ({ty})({value}LL);");
        }
        Operand::Memory { base, offset } => {
            let _ = writeln!(
                out,
                "{indent}if (bpf_probe_read_user(&__res, sizeof(__res), (void *)(ctx->{base} + ({offset}LL))) != 0)\n{indent}\treturn -1;"
            );
        }
    }
    let _ = writeln!(
        out,
        "{indent}__builtin_memcpy(dest, &__res, sizeof(__res));\n{indent}return 0;"
    );
}
