use std::collections::BTreeSet;

use log::info;
use nix::errno::Errno;

use crate::{
  catalog::{AbiWidth, SyscallCatalog, SyscallDescriptor},
  syscalls::{SyscallName, SYS_futex, SYS_ioctl, SYS_sendfile},
};

/// Syscalls whose ENOSYS depends on their arguments rather than on the
/// kernel lacking them.
pub const ENOSYS_EXEMPT: [SyscallName; 3] = [SYS_futex, SYS_ioctl, SYS_sendfile];

/// Per-ABI ACTIVE/INACTIVE state. Transitions are one-way.
#[derive(Debug, Default, Clone)]
pub struct ActivityTable {
  inactive_native: BTreeSet<u32>,
  inactive_compat: BTreeSet<u32>,
}

impl ActivityTable {
  pub fn new() -> Self {
    Self::default()
  }

  fn set(&self, abi: AbiWidth) -> &BTreeSet<u32> {
    match abi {
      AbiWidth::Native => &self.inactive_native,
      AbiWidth::Compat => &self.inactive_compat,
    }
  }

  pub fn is_active(&self, nr: u32, abi: AbiWidth) -> bool {
    !self.set(abi).contains(&nr)
  }

  /// Returns whether this call changed the state.
  pub fn deactivate(&mut self, nr: u32, abi: AbiWidth) -> bool {
    match abi {
      AbiWidth::Native => self.inactive_native.insert(nr),
      AbiWidth::Compat => self.inactive_compat.insert(nr),
    }
  }

  /// Applies the ENOSYS policy to one classified failure. Returns whether
  /// the syscall got deactivated.
  pub fn observe_failure(
    &mut self,
    nr: u32,
    abi: AbiWidth,
    descriptor: Option<&SyscallDescriptor>,
    errno: Errno,
  ) -> bool {
    if errno != Errno::ENOSYS {
      return false;
    }
    if descriptor.is_some_and(|d| ENOSYS_EXEMPT.contains(&d.id)) {
      return false;
    }
    let name = descriptor.map_or("<unknown>", |d| d.name());
    let changed = self.deactivate(nr, abi);
    if changed {
      info!("{name} ({nr}) returned ENOSYS, marking as inactive for {abi:?} ABI.");
    }
    changed
  }

  /// Indices of the catalog that may still be selected.
  pub fn pool<'c>(&'c self, catalog: &'c SyscallCatalog) -> impl Iterator<Item = u32> + 'c {
    let abi = catalog.abi();
    catalog
      .iter()
      .map(|(nr, _)| nr)
      .filter(move |nr| self.is_active(*nr, abi))
  }
}
