//! Human-readable rendering of calls and their outcomes.

use std::fmt::Write;

use itertools::Itertools;
use owo_colors::OwoColorize;

use crate::{
  catalog::{AbiWidth, ArgKind, ArgSpec, SyscallDescriptor},
  classify::SyscallOutcome,
  pages::WellKnownPages,
  sanitise::ArgArena,
};

/// Log target of the per-call trace lines.
pub const TRACE_TARGET: &str = "syscall_fuzz::trace";

const HEX_ARG_THRESHOLD: u64 = 8192;
const HEX_RET_THRESHOLD: u64 = 10000;

pub struct TraceFormatter<'a> {
  pub pages: &'a WellKnownPages,
  pub arena: &'a ArgArena,
  pub colors: bool,
}

impl<'a> TraceFormatter<'a> {
  pub fn new(pages: &'a WellKnownPages, arena: &'a ArgArena, colors: bool) -> Self {
    Self {
      pages,
      arena,
      colors,
    }
  }

  fn render_value(&self, kind: ArgKind, value: u64) -> String {
    match kind {
      ArgKind::Pathname => match self.arena.path_at(value) {
        Some(path) => format!("{:?}", path.to_string_lossy()),
        None => "\"?\"".to_owned(),
      },
      ArgKind::Pid | ArgKind::Fd => (value as i64).to_string(),
      ArgKind::Mode => format!("{:o}", value),
      _ if value > HEX_ARG_THRESHOLD => format!("0x{:x}", value),
      _ => value.to_string(),
    }
  }

  fn render_arg(&self, spec: &ArgSpec, before: u64, after: u64) -> String {
    let value = self.render_value(spec.kind, after);
    let mut out = format!("{}=", spec.name);
    if self.colors && before != after {
      write!(out, "{}", value.cyan()).ok();
    } else {
      out.push_str(&value);
    }
    if let Some(tag) = self.pages.tag(after) {
      write!(out, "[{tag}]").ok();
    }
    out
  }

  /// `[count] [32BIT] name(arg=value, ...) `
  pub fn render_call(
    &self,
    count: u64,
    abi: AbiWidth,
    nr: u32,
    descriptor: Option<&SyscallDescriptor>,
    before: &[u64; 6],
    after: &[u64; 6],
  ) -> String {
    let mut line = format!("[{count}] ");
    if abi == AbiWidth::Compat {
      line.push_str("[32BIT] ");
    }
    match descriptor {
      Some(descriptor) => {
        let args = descriptor
          .args
          .iter()
          .enumerate()
          .map(|(i, spec)| self.render_arg(spec, before[i], after[i]))
          .join(", ");
        write!(line, "{}({}) ", descriptor.name(), args).ok();
      }
      None => {
        write!(line, "{nr}() ").ok();
      }
    }
    line
  }

  /// `= value` or `= -1 (error text)`
  pub fn render_outcome(&self, outcome: &SyscallOutcome) -> String {
    match outcome {
      SyscallOutcome::Success(ret) => {
        // compared unsigned, so large negative successes print in hex too
        let value = if *ret as u64 > HEX_RET_THRESHOLD {
          format!("0x{:x}", *ret as u64)
        } else {
          ret.to_string()
        };
        if self.colors {
          format!("= {}", value.green())
        } else {
          format!("= {value}")
        }
      }
      SyscallOutcome::Failure(errno) => {
        let value = format!("{} ({})", outcome.value(), errno.desc());
        if self.colors {
          format!("= {}", value.red())
        } else {
          format!("= {value}")
        }
      }
    }
  }
}

#[cfg(test)]
mod test {
  use nix::errno::Errno;

  use super::*;
  use crate::{
    catalog::SyscallCatalog,
    rng::worker_rng,
    syscalls::{SyscallName, SYS_getpid, SYS_read, SYS_statfs, SYS_umask},
  };

  fn descriptor(id: SyscallName) -> &'static SyscallDescriptor {
    let catalog = SyscallCatalog::builtin(AbiWidth::Native);
    catalog.get(catalog.lookup(id).unwrap()).unwrap()
  }

  fn pages() -> WellKnownPages {
    WellKnownPages::new(&mut worker_rng(0, 0)).unwrap()
  }

  #[test]
  fn plain_call_line() {
    let pages = pages();
    let arena = ArgArena::new();
    let fmt = TraceFormatter::new(&pages, &arena, false);
    let args = [3, pages.zeros(), 10000, 0, 0, 0];
    let line = fmt.render_call(5, AbiWidth::Native, 0, Some(descriptor(SYS_read)), &[0; 6], &args);
    assert_eq!(
      line,
      format!("[5] read(fd=3, buf=0x{:x}[page_zeros], count=0x2710) ", pages.zeros())
    );
  }

  #[test]
  fn compat_marker_and_unknown_syscall() {
    let pages = pages();
    let arena = ArgArena::new();
    let fmt = TraceFormatter::new(&pages, &arena, false);
    let line = fmt.render_call(1, AbiWidth::Compat, 9001, None, &[0; 6], &[0; 6]);
    assert_eq!(line, "[1] [32BIT] 9001() ");
    let line = fmt.render_call(2, AbiWidth::Compat, 20, Some(descriptor(SYS_getpid)), &[0; 6], &[0; 6]);
    assert_eq!(line, "[2] [32BIT] getpid() ");
  }

  #[test]
  fn pathname_mode_and_negative_fd() {
    let pages = pages();
    let mut arena = ArgArena::new();
    let path = arena.alloc_path(c"/tmp");
    let fmt = TraceFormatter::new(&pages, &arena, false);
    let line = fmt.render_call(0, AbiWidth::Native, 0, Some(descriptor(SYS_statfs)), &[0; 6], &[path, 7, 0, 0, 0, 0]);
    assert_eq!(line, "[0] statfs(pathname=\"/tmp\", buf=7) ");
    let line = fmt.render_call(0, AbiWidth::Native, 0, Some(descriptor(SYS_statfs)), &[0; 6], &[1, 0, 0, 0, 0, 0]);
    assert!(line.contains("pathname=\"?\""));
    let line = fmt.render_call(0, AbiWidth::Native, 0, Some(descriptor(SYS_umask)), &[0; 6], &[0o755, 0, 0, 0, 0, 0]);
    assert_eq!(line, "[0] umask(mask=755) ");
    let line = fmt.render_call(0, AbiWidth::Native, 0, Some(descriptor(SYS_read)), &[0; 6], &[u64::MAX, 1, 2, 0, 0, 0]);
    assert!(line.starts_with("[0] read(fd=-1, buf=1, count=2)"));
  }

  #[test]
  fn modified_args_are_cyan() {
    let pages = pages();
    let arena = ArgArena::new();
    let fmt = TraceFormatter::new(&pages, &arena, true);
    let line = fmt.render_call(0, AbiWidth::Native, 0, Some(descriptor(SYS_read)), &[3, 1, 2, 0, 0, 0], &[4, 1, 2, 0, 0, 0]);
    assert!(line.contains("fd=\x1b[36m4\x1b[39m"));
    assert!(line.contains("buf=1,"));
  }

  #[test]
  fn outcomes() {
    let pages = pages();
    let arena = ArgArena::new();
    let fmt = TraceFormatter::new(&pages, &arena, false);
    assert_eq!(fmt.render_outcome(&SyscallOutcome::Success(0)), "= 0");
    assert_eq!(fmt.render_outcome(&SyscallOutcome::Success(10001)), "= 0x2711");
    assert_eq!(fmt.render_outcome(&SyscallOutcome::Success(-200)), "= 0xffffffffffffff38");
    assert_eq!(
      fmt.render_outcome(&SyscallOutcome::Failure(Errno::ENOENT)),
      "= -1 (No such file or directory)"
    );
    let colored = TraceFormatter::new(&pages, &arena, true);
    assert_eq!(colored.render_outcome(&SyscallOutcome::Success(1)), "= \x1b[32m1\x1b[39m");
  }
}
