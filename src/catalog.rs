use std::fmt;

use enumflags2::{bitflags, BitFlags};

use crate::{sanitise::SanitiseContext, syscalls::SyscallName, syscalls::SYSCALLS};

/// Semantic kind of a syscall argument. Drives both generic argument
/// generation and trace rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
  Undefined,
  Pathname,
  Pid,
  Fd,
  Mode,
  Len,
  Address,
  NonNullAddress,
  Range,
  Op,
  List,
  RandPage,
  Cpu,
  RandomLong,
  IoVec,
  IoVecLen,
  SockAddr,
  SockAddrLen,
}

#[bitflags]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyscallFlag {
  /// The call may block without bound; run it under a one-shot alarm.
  NeedAlarm = 0b0001,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
  pub name: &'static str,
  pub kind: ArgKind,
}

/// Syscall numbers of one descriptor, resolved for the compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallNumbers {
  pub native: Option<u32>,
  pub compat: Option<u32>,
}

pub type Sanitiser = fn(&mut SanitiseContext<'_>);
pub type PostHook = fn(i64);

pub struct SyscallDescriptor {
  pub id: SyscallName,
  pub args: &'static [ArgSpec],
  pub flags: BitFlags<SyscallFlag>,
  pub sanitise: Option<Sanitiser>,
  pub post: Option<PostHook>,
  pub numbers: SyscallNumbers,
}

impl SyscallDescriptor {
  pub fn name(&self) -> &'static str {
    self.id.as_str()
  }

  pub fn num_args(&self) -> usize {
    self.args.len()
  }

  pub fn number(&self, abi: AbiWidth) -> Option<u32> {
    match abi {
      AbiWidth::Native => self.numbers.native,
      AbiWidth::Compat => self.numbers.compat,
    }
  }
}

impl fmt::Debug for SyscallDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SyscallDescriptor")
      .field("name", &self.name())
      .field("args", &self.args)
      .field("flags", &self.flags)
      .field("numbers", &self.numbers)
      .finish_non_exhaustive()
  }
}

/// The calling convention a call is issued with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiWidth {
  Native,
  /// The secondary 32-bit personality, e.g. i386 on an x86_64 kernel.
  Compat,
}

/// Index-addressed view of the syscall table for one ABI width.
#[derive(Debug)]
pub struct SyscallCatalog {
  abi: AbiWidth,
  table: Vec<Option<&'static SyscallDescriptor>>,
}

impl SyscallCatalog {
  pub fn new(abi: AbiWidth, descriptors: &'static [SyscallDescriptor]) -> Self {
    let max = descriptors
      .iter()
      .filter_map(|d| d.number(abi))
      .max()
      .map_or(0, |n| n as usize + 1);
    let mut table = vec![None; max];
    for descriptor in descriptors {
      if let Some(nr) = descriptor.number(abi) {
        table[nr as usize] = Some(descriptor);
      }
    }
    Self { abi, table }
  }

  /// The catalog of the syscalls shipped with this crate.
  pub fn builtin(abi: AbiWidth) -> Self {
    Self::new(abi, &SYSCALLS)
  }

  pub fn abi(&self) -> AbiWidth {
    self.abi
  }

  pub fn get(&self, nr: u32) -> Option<&'static SyscallDescriptor> {
    self.table.get(nr as usize).copied().flatten()
  }

  /// Highest index this catalog knows about, plus one.
  pub fn max_nr(&self) -> u32 {
    self.table.len() as u32
  }

  pub fn lookup(&self, id: SyscallName) -> Option<u32> {
    self.iter().find(|(_, d)| d.id == id).map(|(nr, _)| nr)
  }

  pub fn iter(&self) -> impl Iterator<Item = (u32, &'static SyscallDescriptor)> + '_ {
    self
      .table
      .iter()
      .enumerate()
      .filter_map(|(nr, d)| d.map(|d| (nr as u32, d)))
  }

  pub fn is_empty(&self) -> bool {
    self.table.iter().all(Option::is_none)
  }
}
