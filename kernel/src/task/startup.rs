//! Program arguments on a new user stack.
//!
//! The layout is the System V process entry layout: from the stack pointer
//! up, `argc`, the argv pointers and a null, the envp pointers and a null,
//! then the auxiliary vector ending in an `AT_NULL` pair. The strings they
//! point at sit at the very top of the stack, argv first.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::{AddressSpace, MemoryFault, UserMemory};

pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_PAGESZ: u64 = 6;
pub const AT_ENTRY: u64 = 9;

/// One auxiliary vector entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxEntry {
    pub kind: u64,
    pub value: u64,
}

/// What a program's entry point finds on its stack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramArgs {
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    pub auxv: Vec<AuxEntry>,
}

impl ProgramArgs {
    pub fn new<S: AsRef<str>>(argv: &[S]) -> Self {
        Self {
            argv: argv.iter().map(|s| String::from(s.as_ref())).collect(),
            ..Self::default()
        }
    }

    pub fn with_env<S: AsRef<str>>(mut self, envp: &[S]) -> Self {
        self.envp = envp.iter().map(|s| String::from(s.as_ref())).collect();
        self
    }

    pub fn with_aux(mut self, kind: u64, value: u64) -> Self {
        self.auxv.push(AuxEntry { kind, value });
        self
    }
}

/// Where the pieces ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupStack {
    /// Initial stack pointer; points at argc and is 16-byte aligned
    pub sp: u64,
    pub argc: u64,
    pub argv: u64,
    pub envc: u64,
    pub envp: u64,
}

/// Write `args` below `top` in `space`, with `word`-byte pointers.
pub fn lay_out(
    memory: &dyn UserMemory,
    space: AddressSpace,
    top: u64,
    word: u64,
    args: &ProgramArgs,
) -> Result<StartupStack, MemoryFault> {
    let mut cursor = top;
    let mut pointers = Vec::with_capacity(args.argv.len() + args.envp.len());
    for string in args.argv.iter().chain(args.envp.iter()) {
        cursor -= string.len() as u64 + 1;
        memory.write(Some(space), cursor, string.as_bytes())?;
        memory.write(Some(space), cursor + string.len() as u64, &[0])?;
        pointers.push(cursor);
    }
    let (argv_strings, envp_strings) = pointers.split_at(args.argv.len());

    let auxv = args
        .auxv
        .iter()
        .filter(|aux| aux.kind != AT_NULL)
        .chain(core::iter::once(&AuxEntry { kind: AT_NULL, value: 0 }));
    let aux_words = 2 * (args.auxv.iter().filter(|aux| aux.kind != AT_NULL).count() + 1);
    let words = 1 + argv_strings.len() + 1 + envp_strings.len() + 1 + aux_words;
    let sp = (cursor - words as u64 * word) & !0xF;

    let mut slot = sp;
    let mut push = |value: u64| -> Result<(), MemoryFault> {
        match word {
            4 => memory.write(Some(space), slot, &(value as u32).to_le_bytes())?,
            _ => memory.write(Some(space), slot, &value.to_le_bytes())?,
        }
        slot += word;
        Ok(())
    };

    push(argv_strings.len() as u64)?;
    for &ptr in argv_strings {
        push(ptr)?;
    }
    push(0)?;
    for &ptr in envp_strings {
        push(ptr)?;
    }
    push(0)?;
    for aux in auxv {
        push(aux.kind)?;
        push(aux.value)?;
    }

    let argc = argv_strings.len() as u64;
    Ok(StartupStack {
        sp,
        argc,
        argv: sp + word,
        envc: envp_strings.len() as u64,
        envp: sp + word + (argc + 1) * word,
    })
}
