//! USDT argument specs
//!
//! Each note carries a space-separated list of argument locations in
//! assembler syntax, for example `-4@%edi 8@-16(%rbp) 4@$5`. The part before
//! `@` is the size in bytes, negative for signed values.
//!
//! Only x86-64 register names are understood. Register operands are mapped
//! onto the field names of the UAPI `struct pt_regs`.

use crate::error::StapsdtError;

/// Where an argument's value lives when the probe fires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    /// Value is held by a register (`pt_regs` field name)
    Register(&'static str),
    /// Value is a constant baked into the note
    Immediate(i64),
    /// Value is in user memory at `register + offset`
    Memory { base: &'static str, offset: i64 },
}

/// Location and type of one USDT argument
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgSpec {
    /// Size in bytes: 1, 2, 4 or 8
    pub size: u8,
    /// Whether the value is signed
    pub signed: bool,
    /// Where to read the value from
    pub operand: Operand,
}

impl ArgSpec {
    /// C type able to hold the argument
    pub fn c_type(&self) -> &'static str {
        match (self.size, self.signed) {
            (1, true) => "__s8",
            (1, false) => "__u8",
            (2, true) => "__s16",
            (2, false) => "__u16",
            (4, true) => "__s32",
            (4, false) => "__u32",
            (_, true) => "__s64",
            (_, false) => "__u64",
        }
    }
}

/// Parse a whole argument format string.
pub fn parse_args(spec: &str) -> Result<Vec<ArgSpec>, StapsdtError> {
    spec.split_whitespace().map(parse_arg).collect()
}

/// Parse a single `[-]size@operand` entry. Entries without a size prefix
/// are read as unsigned 64-bit values.
pub fn parse_arg(arg: &str) -> Result<ArgSpec, StapsdtError> {
    let invalid = || StapsdtError::Argument(arg.to_string());

    let (size, signed, operand) = match arg.split_once('@') {
        Some((size, operand)) => {
            let size: i8 = size.parse().map_err(|_| invalid())?;
            (size.unsigned_abs(), size < 0, operand)
        }
        None => (8, false, arg),
    };

    if !matches!(size, 1 | 2 | 4 | 8) {
        return Err(invalid());
    }

    let operand = if let Some(imm) = operand.strip_prefix('$') {
        Operand::Immediate(parse_int(imm).ok_or_else(invalid)?)
    } else if let Some(reg) = operand.strip_prefix('%') {
        Operand::Register(register(reg).ok_or_else(invalid)?)
    } else if let Some((offset, rest)) = operand.split_once('(') {
        let reg = rest
            .strip_suffix(')')
            .and_then(|r| r.strip_prefix('%'))
            .ok_or_else(invalid)?;
        let offset = if offset.is_empty() {
            0
        } else {
            parse_int(offset).ok_or_else(invalid)?
        };
        let base = register(reg).ok_or_else(invalid)?;
        // RIP-relative operands need the runtime load address of the
        // instruction, which the generated reader does not know.
        if base == "rip" {
            return Err(invalid());
        }
        Operand::Memory { base, offset }
    } else {
        return Err(invalid());
    };

    Ok(ArgSpec {
        size,
        signed,
        operand,
    })
}

fn parse_int(s: &str) -> Option<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    Some(if negative { -value } else { value })
}

/// Map an x86-64 register name, including its 32/16/8-bit aliases, to the
/// `pt_regs` field holding it.
fn register(name: &str) -> Option<&'static str> {
    let field = match name {
        "rax" | "eax" | "ax" | "al" => "rax",
        "rbx" | "ebx" | "bx" | "bl" => "rbx",
        "rcx" | "ecx" | "cx" | "cl" => "rcx",
        "rdx" | "edx" | "dx" | "dl" => "rdx",
        "rsi" | "esi" | "si" | "sil" => "rsi",
        "rdi" | "edi" | "di" | "dil" => "rdi",
        "rbp" | "ebp" | "bp" | "bpl" => "rbp",
        "rsp" | "esp" | "sp" | "spl" => "rsp",
        "rip" => "rip",
        _ => {
            let rest = name.strip_prefix('r')?;
            let digits = rest.trim_end_matches(['d', 'w', 'b']);
            return match digits {
                "8" => Some("r8"),
                "9" => Some("r9"),
                "10" => Some("r10"),
                "11" => Some("r11"),
                "12" => Some("r12"),
                "13" => Some("r13"),
                "14" => Some("r14"),
                "15" => Some("r15"),
                _ => None,
            };
        }
    };
    Some(field)
}
