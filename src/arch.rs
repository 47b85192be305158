use nix::{errno::Errno, libc};

use crate::catalog::AbiWidth;

cfg_if::cfg_if! {
  if #[cfg(all(target_arch = "mips", target_pointer_width = "32"))] {
    /// o32 Linux syscalls start at 4000.
    pub const SYSCALL_OFFSET: u32 = 4000;
  } else if #[cfg(target_arch = "mips64")] {
    /// n64 Linux syscalls start at 5000.
    pub const SYSCALL_OFFSET: u32 = 5000;
  } else {
    pub const SYSCALL_OFFSET: u32 = 0;
  }
}

cfg_if::cfg_if! {
  if #[cfg(target_arch = "x86_64")] {
    /// `int 0x80` takes the number in eax and its arguments in ebx, ecx, edx,
    /// esi, edi and ebp.
    pub const COMPAT_MAX_ARGS: Option<usize> = Some(6);
  } else {
    pub const COMPAT_MAX_ARGS: Option<usize> = None;
  }
}

/// Whether this build can issue syscalls through a secondary ABI.
pub const fn has_compat() -> bool {
  COMPAT_MAX_ARGS.is_some()
}

/// Issues a syscall and returns the kernel's raw result, i.e. `-errno` on
/// failure rather than libc's `-1` + `errno`.
pub trait ArchInvoker {
  fn abi(&self) -> AbiWidth;
  fn invoke(&self, num_args: usize, nr: u32, args: [u64; 6]) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeInvoker;

impl ArchInvoker for NativeInvoker {
  fn abi(&self) -> AbiWidth {
    AbiWidth::Native
  }

  fn invoke(&self, _num_args: usize, nr: u32, args: [u64; 6]) -> i64 {
    Errno::clear();
    let ret = unsafe {
      libc::syscall(
        nr as libc::c_long,
        args[0],
        args[1],
        args[2],
        args[3],
        args[4],
        args[5],
      )
    } as i64;
    if ret == -1 {
      -(Errno::last() as i64)
    } else {
      ret
    }
  }
}

/// Emulates the compat calling convention by hand. A no-op returning 0 on
/// archs without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompatInvoker;

impl ArchInvoker for CompatInvoker {
  fn abi(&self) -> AbiWidth {
    AbiWidth::Compat
  }

  fn invoke(&self, num_args: usize, nr: u32, args: [u64; 6]) -> i64 {
    let Some(max_args) = COMPAT_MAX_ARGS else {
      return 0;
    };
    if num_args > max_args {
      return 0;
    }
    // SAFETY: the trap only clobbers the registers declared to asm!.
    unsafe { compat_trap(nr, args) }
  }
}

#[cfg(target_arch = "x86_64")]
unsafe fn compat_trap(nr: u32, args: [u64; 6]) -> i64 {
  let ret: i64;
  // rbx and rbp can't be named as operands, so load them by hand and put
  // them back afterwards.
  std::arch::asm!(
    "push rbp",
    "push rbx",
    "mov rbx, {a1}",
    "mov rbp, {a6}",
    "int 0x80",
    "pop rbx",
    "pop rbp",
    a1 = in(reg) args[0],
    a6 = in(reg) args[5],
    inlateout("rax") nr as i64 => ret,
    in("rcx") args[1],
    in("rdx") args[2],
    in("rsi") args[3],
    in("rdi") args[4],
    out("r8") _,
    out("r9") _,
    out("r10") _,
    out("r11") _,
  );
  ret
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn compat_trap(_nr: u32, _args: [u64; 6]) -> i64 {
  0
}

/// Both invokers of this process, picked by ABI width.
pub struct Invokers {
  pub native: Box<dyn ArchInvoker>,
  pub compat: Box<dyn ArchInvoker>,
}

impl Invokers {
  pub fn get(&self, abi: AbiWidth) -> &dyn ArchInvoker {
    match abi {
      AbiWidth::Native => self.native.as_ref(),
      AbiWidth::Compat => self.compat.as_ref(),
    }
  }
}

impl Default for Invokers {
  fn default() -> Self {
    Self {
      native: Box::new(NativeInvoker),
      compat: Box::new(CompatInvoker),
    }
  }
}
