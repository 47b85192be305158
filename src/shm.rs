//! The region every worker process maps.
//!
//! Each worker only ever writes its own [`WorkerSlot`]. The aggregate
//! counters are written by everyone without synchronization: a bump is a
//! relaxed load followed by a relaxed store, so concurrent bumps may get
//! lost and the totals are only indicative.

use std::{
  mem::size_of,
  num::NonZeroUsize,
  ptr::NonNull,
  sync::atomic::{AtomicU64, AtomicU8, Ordering},
};

use nix::{
  errno::Errno,
  sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags},
  time::{clock_gettime, ClockId},
};
use paste::paste;

use crate::catalog::AbiWidth;

pub const MAX_WORKERS: usize = 64;

/// Why a worker stopped, as recorded for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitReason {
  StillRunning = 0,
  NoSyscallsEnabled = 1,
  ReachedCount = 2,
  UidChanged = 3,
  ShmAliased = 4,
  NoSlot = 5,
}

impl ExitReason {
  pub fn from_raw(raw: u8) -> Option<Self> {
    Some(match raw {
      0 => ExitReason::StillRunning,
      1 => ExitReason::NoSyscallsEnabled,
      2 => ExitReason::ReachedCount,
      3 => ExitReason::UidChanged,
      4 => ExitReason::ShmAliased,
      5 => ExitReason::NoSlot,
      _ => return None,
    })
  }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Timestamp {
  pub secs: i64,
  pub nanos: i64,
}

impl Timestamp {
  pub fn now() -> Self {
    clock_gettime(ClockId::CLOCK_REALTIME)
      .map(|ts| Timestamp {
        secs: ts.tv_sec() as i64,
        nanos: ts.tv_nsec() as i64,
      })
      .unwrap_or_default()
  }
}

#[derive(Debug)]
#[repr(C)]
pub struct WorkerSlot {
  pub syscallno: u32,
  pub previous_syscallno: u32,
  pub do32bit: bool,
  pub args: [u64; 6],
  pub previous_args: [u64; 6],
  /// `child_syscall_count` for this worker.
  pub syscall_count: u64,
  pub last_invocation: Timestamp,
}

macro_rules! impl_register_accessors {
  ($($n:literal),*) => {
    paste! {
      impl WorkerSlot {
        $(
          pub fn [<a $n>](&self) -> u64 {
            self.args[$n - 1]
          }

          pub fn [<previous_a $n>](&self) -> u64 {
            self.previous_args[$n - 1]
          }
        )*
      }
    }
  };
}

impl_register_accessors!(1, 2, 3, 4, 5, 6);

impl WorkerSlot {
  pub fn abi(&self) -> AbiWidth {
    if self.do32bit {
      AbiWidth::Compat
    } else {
      AbiWidth::Native
    }
  }

  pub fn reset(&mut self) {
    self.syscallno = 0;
    self.previous_syscallno = 0;
    self.do32bit = false;
    self.args = [0; 6];
    self.previous_args = [0; 6];
    self.syscall_count = 0;
    self.last_invocation = Timestamp::default();
  }

  /// Moves the current call into the "previous" record.
  pub fn retire_current(&mut self) {
    self.previous_syscallno = self.syscallno;
    self.previous_args = self.args;
  }
}

#[derive(Debug)]
#[repr(C)]
pub struct SharedAggregate {
  pub total_syscalls_done: AtomicU64,
  pub successes: AtomicU64,
  pub failures: AtomicU64,
  pub regenerate: AtomicU64,
}

impl SharedAggregate {
  /// Lossy increment, see the module docs.
  fn bump(counter: &AtomicU64) {
    counter.store(counter.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);
  }

  pub fn tick_regenerate(&self) {
    Self::bump(&self.regenerate);
  }

  pub fn record_done(&self) {
    Self::bump(&self.total_syscalls_done);
  }

  pub fn record_outcome(&self, success: bool) {
    if success {
      Self::bump(&self.successes);
    } else {
      Self::bump(&self.failures);
    }
  }

  pub fn total_syscalls_done(&self) -> u64 {
    self.total_syscalls_done.load(Ordering::Relaxed)
  }

  pub fn successes(&self) -> u64 {
    self.successes.load(Ordering::Relaxed)
  }

  pub fn failures(&self) -> u64 {
    self.failures.load(Ordering::Relaxed)
  }

  pub fn regenerate(&self) -> u64 {
    self.regenerate.load(Ordering::Relaxed)
  }
}

#[derive(Debug)]
#[repr(C)]
pub struct ShmRegion {
  pub aggregate: SharedAggregate,
  exit_reason: AtomicU8,
  pub slots: [WorkerSlot; MAX_WORKERS],
}

/// Handle to the shared mapping. Created once before the workers fork; the
/// mapping is inherited across `fork(2)`.
#[derive(Debug)]
pub struct SharedState {
  region: NonNull<ShmRegion>,
}

impl SharedState {
  const SIZE: usize = size_of::<ShmRegion>();

  pub fn create() -> Result<Self, Errno> {
    let Some(len) = NonZeroUsize::new(Self::SIZE) else {
      return Err(Errno::EINVAL);
    };
    // SAFETY: a fresh anonymous mapping aliases nothing. It is zero filled,
    // which is a valid ShmRegion.
    let ptr = unsafe {
      mmap_anonymous(
        None,
        len,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        MapFlags::MAP_SHARED,
      )?
    };
    Ok(Self {
      region: ptr.cast(),
    })
  }

  fn region(&self) -> &ShmRegion {
    // SAFETY: the mapping lives as long as `self`. Slots are only written
    // through `slot_mut`.
    unsafe { self.region.as_ref() }
  }

  /// Address of the mapping. No argument register may ever hold it.
  pub fn base_addr(&self) -> u64 {
    self.region.as_ptr() as u64
  }

  pub fn aggregate(&self) -> &SharedAggregate {
    &self.region().aggregate
  }

  pub fn slot(&self, worker: usize) -> Option<&WorkerSlot> {
    self.region().slots.get(worker)
  }

  /// Only the worker owning `worker` may call this.
  pub fn slot_mut(&mut self, worker: usize) -> Option<&mut WorkerSlot> {
    // SAFETY: each slot has a single writer, the worker owning it.
    unsafe { self.region.as_mut() }.slots.get_mut(worker)
  }

  pub fn exit_reason(&self) -> Option<ExitReason> {
    ExitReason::from_raw(self.region().exit_reason.load(Ordering::Relaxed))
  }

  pub fn set_exit_reason(&self, reason: ExitReason) {
    self.region().exit_reason.store(reason as u8, Ordering::Relaxed);
  }
}

impl Drop for SharedState {
  fn drop(&mut self) {
    // SAFETY: the region was mapped by `create` with this exact length.
    let _ = unsafe { munmap(self.region.cast(), Self::SIZE) };
  }
}
