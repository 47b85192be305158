//! Per-protocol argument generators for the socket family of syscalls.

use std::collections::BTreeMap;

use nix::{libc::c_int, unistd::close};
use rand::{seq::IteratorRandom, Rng};

use crate::{rng::FuzzRng, sanitise::SanitiseContext};

pub mod llc;

pub use llc::{LlcGenerator, SockaddrLlc};

/// Exclusive upper bound of randomly drawn protocol numbers.
pub const PROTO_MAX: c_int = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SocketAddress {
  Llc(SockaddrLlc),
}

impl SocketAddress {
  pub fn family(&self) -> c_int {
    match self {
      SocketAddress::Llc(addr) => addr.sllc_family as c_int,
    }
  }

  /// The address as the kernel expects it behind a `sockaddr *`.
  pub fn to_bytes(&self) -> Vec<u8> {
    match self {
      SocketAddress::Llc(addr) => addr.to_bytes().to_vec(),
    }
  }
}

/// Arguments of `socket(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketTriplet {
  pub domain: c_int,
  pub kind: c_int,
  pub protocol: c_int,
}

/// `level` and `optname` of `setsockopt(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockOpt {
  pub level: c_int,
  pub optname: c_int,
}

pub trait ArgumentGenerator: Send + Sync {
  /// The `AF_*` family this generator knows about.
  fn family(&self) -> c_int;
  fn generate_address(&self, rng: &mut FuzzRng) -> SocketAddress;
  fn generate_triplet(&self, rng: &mut FuzzRng) -> SocketTriplet;
  fn generate_sockopt(&self, rng: &mut FuzzRng) -> SockOpt;
}

/// Generators keyed by family. Ordered, so that a seeded run picks the
/// same families in the same order.
pub struct GeneratorRegistry {
  generators: BTreeMap<c_int, Box<dyn ArgumentGenerator>>,
}

impl GeneratorRegistry {
  pub fn empty() -> Self {
    Self {
      generators: BTreeMap::new(),
    }
  }

  /// Replaces any generator previously registered for the same family.
  pub fn register(&mut self, generator: Box<dyn ArgumentGenerator>) {
    self.generators.insert(generator.family(), generator);
  }

  pub fn get(&self, family: c_int) -> Option<&dyn ArgumentGenerator> {
    self.generators.get(&family).map(|g| g.as_ref())
  }

  pub fn families(&self) -> impl Iterator<Item = c_int> + '_ {
    self.generators.keys().copied()
  }

  pub fn random_family(&self, rng: &mut FuzzRng) -> Option<c_int> {
    self.families().choose(rng)
  }

  pub fn generate_address(&self, family: c_int, rng: &mut FuzzRng) -> Option<SocketAddress> {
    self.get(family).map(|g| g.generate_address(rng))
  }

  pub fn generate_triplet(&self, family: c_int, rng: &mut FuzzRng) -> Option<SocketTriplet> {
    self.get(family).map(|g| g.generate_triplet(rng))
  }

  pub fn generate_sockopt(&self, family: c_int, rng: &mut FuzzRng) -> Option<SockOpt> {
    self.get(family).map(|g| g.generate_sockopt(rng))
  }
}

impl Default for GeneratorRegistry {
  fn default() -> Self {
    let mut registry = Self::empty();
    registry.register(Box::new(LlcGenerator));
    registry
  }
}

impl std::fmt::Debug for GeneratorRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("GeneratorRegistry")
      .field("families", &self.generators.keys().collect::<Vec<_>>())
      .finish()
  }
}

pub fn sanitise_socket(ctx: &mut SanitiseContext<'_>) {
  let Some(family) = ctx.generators.random_family(ctx.rng) else {
    return;
  };
  if let Some(triplet) = ctx.generators.generate_triplet(family, ctx.rng) {
    ctx.args[0] = triplet.domain as u64;
    ctx.args[1] = triplet.kind as u64;
    ctx.args[2] = triplet.protocol as u64;
  }
}

/// Doesn't leak the descriptors of sockets we managed to create.
pub fn post_socket(ret: i64) {
  if (0..=c_int::MAX as i64).contains(&ret) {
    let _ = close(ret as c_int);
  }
}

pub fn sanitise_setsockopt(ctx: &mut SanitiseContext<'_>) {
  let Some(family) = ctx.generators.random_family(ctx.rng) else {
    return;
  };
  if let Some(opt) = ctx.generators.generate_sockopt(family, ctx.rng) {
    let optval: c_int = ctx.rng.gen_range(0..=1 << 16);
    ctx.args[1] = opt.level as u64;
    ctx.args[2] = opt.optname as u64;
    ctx.args[3] = ctx.arena.alloc_bytes(&optval.to_ne_bytes());
    ctx.args[4] = std::mem::size_of::<c_int>() as u64;
  }
}
