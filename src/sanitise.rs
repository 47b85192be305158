//! Family-agnostic argument shaping, driven by each argument's [`ArgKind`].

use std::ffi::{CStr, CString};

use nix::unistd::getpid;
use rand::{seq::SliceRandom, Rng};

use crate::{
  catalog::{AbiWidth, ArgKind, SyscallDescriptor},
  net::GeneratorRegistry,
  pages::{online_cpus, page_size, WellKnownPages},
  rng::FuzzRng,
};

const PATHNAMES: &[&CStr] = &[
  c"/",
  c".",
  c"..",
  c"/dev/null",
  c"/proc/self/maps",
  c"/proc/self/status",
  c"/tmp",
  c"/nonexistent",
  c"",
];

const MAX_IOVECS: usize = 8;
const MAX_FD: u64 = 64;
const MAX_PID: u64 = 32768;

#[derive(Debug)]
enum Allocation {
  Path(CString),
  Blob(Box<[u64]>),
}

impl Allocation {
  fn addr(&self) -> u64 {
    match self {
      Allocation::Path(s) => s.as_ptr() as u64,
      Allocation::Blob(words) => words.as_ptr() as u64,
    }
  }
}

/// Owns every buffer an argument register points into, until the next
/// iteration starts.
#[derive(Debug, Default)]
pub struct ArgArena {
  items: Vec<Allocation>,
}

impl ArgArena {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn clear(&mut self) {
    self.items.clear();
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn alloc_path(&mut self, path: &CStr) -> u64 {
    let item = Allocation::Path(path.to_owned());
    let addr = item.addr();
    self.items.push(item);
    addr
  }

  /// Copies `bytes` into a word-aligned buffer and returns its address.
  pub fn alloc_bytes(&mut self, bytes: &[u8]) -> u64 {
    let mut words = vec![0u64; bytes.len().div_ceil(8).max(1)];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks(8)) {
      let mut buf = [0u8; 8];
      buf[..chunk.len()].copy_from_slice(chunk);
      *word = u64::from_ne_bytes(buf);
    }
    let item = Allocation::Blob(words.into_boxed_slice());
    let addr = item.addr();
    self.items.push(item);
    addr
  }

  /// The string `addr` points at, if it is one of ours.
  pub fn path_at(&self, addr: u64) -> Option<&CStr> {
    self.items.iter().find_map(|item| match item {
      Allocation::Path(s) if s.as_ptr() as u64 == addr => Some(s.as_c_str()),
      _ => None,
    })
  }

  pub fn contains(&self, addr: u64) -> bool {
    self.items.iter().any(|item| item.addr() == addr)
  }
}

/// Everything a sanitiser may touch while shaping one call.
pub struct SanitiseContext<'a> {
  pub args: &'a mut [u64; 6],
  pub descriptor: Option<&'static SyscallDescriptor>,
  pub abi: AbiWidth,
  pub rng: &'a mut FuzzRng,
  pub arena: &'a mut ArgArena,
  pub pages: &'a WellKnownPages,
  pub generators: &'a GeneratorRegistry,
}

fn random_len(rng: &mut FuzzRng) -> u64 {
  let page = page_size() as u64;
  match rng.gen_range(0..5) {
    0 => 0,
    1 => 1,
    2 => 8,
    3 => page,
    _ => rng.gen_range(0..=page),
  }
}

fn alloc_iovecs(ctx: &mut SanitiseContext<'_>) -> (u64, u64) {
  let count = ctx.rng.gen_range(1..=MAX_IOVECS);
  let per_vec = page_size() as u64 / count as u64;
  let mut bytes = Vec::with_capacity(count * 16);
  for i in 0..count as u64 {
    let base = ctx.pages.rand() + i * per_vec;
    let len = ctx.rng.gen_range(0..=per_vec);
    bytes.extend_from_slice(&base.to_ne_bytes());
    bytes.extend_from_slice(&len.to_ne_bytes());
  }
  (ctx.arena.alloc_bytes(&bytes), count as u64)
}

/// Shapes the registers by argument kind. Kinds that need per-syscall
/// knowledge (ranges, ops, lists) keep their raw random value.
pub fn generic_sanitise(ctx: &mut SanitiseContext<'_>) {
  let Some(descriptor) = ctx.descriptor else {
    return;
  };
  let mut iovec_count = None;
  let mut sockaddr_len = None;
  for (i, spec) in descriptor.args.iter().enumerate() {
    let value = match spec.kind {
      ArgKind::Pathname => {
        let path = PATHNAMES.choose(ctx.rng).copied().unwrap_or(c"/");
        Some(ctx.arena.alloc_path(path))
      }
      ArgKind::Pid => Some(match ctx.rng.gen_range(0..3) {
        0 => getpid().as_raw() as u64,
        1 => 0,
        _ => ctx.rng.gen_range(1..MAX_PID),
      }),
      ArgKind::Fd => Some(ctx.rng.gen_range(0..MAX_FD)),
      ArgKind::Mode => Some(ctx.rng.gen::<u64>() & 0o7777),
      ArgKind::Len => Some(random_len(ctx.rng)),
      ArgKind::Address => Some(if ctx.rng.gen_ratio(1, 10) {
        0
      } else {
        ctx.pages.any(ctx.rng)
      }),
      ArgKind::NonNullAddress => Some(ctx.pages.any(ctx.rng)),
      ArgKind::RandPage => Some(ctx.pages.rand()),
      ArgKind::Cpu => Some(ctx.rng.gen_range(0..online_cpus())),
      ArgKind::IoVec => {
        let (addr, count) = alloc_iovecs(ctx);
        iovec_count = Some(count);
        Some(addr)
      }
      ArgKind::IoVecLen => Some(iovec_count.unwrap_or_else(|| ctx.rng.gen_range(0..=MAX_IOVECS as u64))),
      ArgKind::SockAddr => ctx
        .generators
        .random_family(ctx.rng)
        .and_then(|family| ctx.generators.generate_address(family, ctx.rng))
        .map(|addr| {
          let bytes = addr.to_bytes();
          sockaddr_len = Some(bytes.len() as u64);
          ctx.arena.alloc_bytes(&bytes)
        }),
      ArgKind::SockAddrLen => sockaddr_len,
      ArgKind::Range | ArgKind::Op | ArgKind::List | ArgKind::RandomLong | ArgKind::Undefined => {
        None
      }
    };
    if let Some(value) = value {
      ctx.args[i] = value;
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::{
    catalog::SyscallCatalog,
    net::llc::IFHWADDRLEN,
    rng::worker_rng,
    syscalls::{SyscallName, SYS_bind, SYS_getpid, SYS_madvise, SYS_statfs, SYS_writev},
  };

  struct Fixture {
    rng: FuzzRng,
    arena: ArgArena,
    pages: WellKnownPages,
    generators: GeneratorRegistry,
  }

  impl Fixture {
    fn new() -> Self {
      let mut rng = worker_rng(11, 0);
      let pages = WellKnownPages::new(&mut rng).unwrap();
      Self {
        rng,
        arena: ArgArena::new(),
        pages,
        generators: GeneratorRegistry::default(),
      }
    }

    fn sanitise(&mut self, id: SyscallName, args: &mut [u64; 6]) {
      let catalog = SyscallCatalog::builtin(AbiWidth::Native);
      let descriptor = catalog.lookup(id).and_then(|nr| catalog.get(nr));
      let mut ctx = SanitiseContext {
        args,
        descriptor,
        abi: AbiWidth::Native,
        rng: &mut self.rng,
        arena: &mut self.arena,
        pages: &self.pages,
        generators: &self.generators,
      };
      generic_sanitise(&mut ctx);
    }
  }

  #[test]
  fn arena_resolves_paths() {
    let mut arena = ArgArena::new();
    let addr = arena.alloc_path(c"/tmp");
    assert_eq!(arena.path_at(addr), Some(c"/tmp"));
    assert_eq!(arena.path_at(addr + 1), None);
    let blob = arena.alloc_bytes(&[1, 2, 3]);
    assert_eq!(blob % 8, 0);
    assert!(arena.contains(blob));
    assert_eq!(arena.path_at(blob), None);
    assert_eq!(arena.len(), 2);
    arena.clear();
    assert!(arena.is_empty());
  }

  #[test]
  fn pathname_points_into_arena() {
    let mut f = Fixture::new();
    let mut args = [u64::MAX; 6];
    f.sanitise(SYS_statfs, &mut args);
    let path = f.arena.path_at(args[0]).unwrap();
    assert!(PATHNAMES.contains(&path));
    assert!(f.pages.contains(args[1]));
    // arguments past the declared count are untouched
    assert_eq!(args[2], u64::MAX);
  }

  #[test]
  fn iovec_len_matches_iovec_count() {
    let mut f = Fixture::new();
    for _ in 0..50 {
      let mut args = [0; 6];
      f.sanitise(SYS_writev, &mut args);
      assert!(args[0] < MAX_FD);
      assert!((1..=MAX_IOVECS as u64).contains(&args[2]));
      let iov = unsafe { std::slice::from_raw_parts(args[1] as *const u64, args[2] as usize * 2) };
      for pair in iov.chunks(2) {
        assert!(pair[0] >= f.pages.rand());
        assert!(pair[0] + pair[1] <= f.pages.rand() + page_size() as u64);
      }
      f.arena.clear();
    }
  }

  #[test]
  fn sockaddr_len_follows_generated_address() {
    let mut f = Fixture::new();
    let mut args = [0; 6];
    f.sanitise(SYS_bind, &mut args);
    assert!(f.arena.contains(args[1]));
    assert_eq!(args[2], (4 + 4 + IFHWADDRLEN + 2) as u64);
  }

  #[test]
  fn raw_kinds_stay_random() {
    let mut f = Fixture::new();
    let mut args = [0xdead_beef_dead_beef; 6];
    f.sanitise(SYS_madvise, &mut args);
    assert!(f.pages.contains(args[0]) || args[0] == 0);
    assert!(args[1] <= page_size() as u64);
    assert_eq!(args[2], 0xdead_beef_dead_beef);
  }

  #[test]
  fn argless_syscall_untouched() {
    let mut f = Fixture::new();
    let mut args = [5; 6];
    f.sanitise(SYS_getpid, &mut args);
    assert_eq!(args, [5; 6]);
  }
}
