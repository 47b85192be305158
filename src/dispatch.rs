//! One fuzz iteration: draw, shape, guard, invoke, classify, bookkeep.

use std::{fmt, time::Duration};

use log::{debug, error, info, log_enabled, warn, Level};
use nix::{
  errno::Errno,
  unistd::{alarm, getuid, Uid},
};
use rand::{seq::SliceRandom, Rng};

use crate::{
  activity::ActivityTable,
  arch::{has_compat, Invokers, SYSCALL_OFFSET},
  catalog::{AbiWidth, SyscallCatalog, SyscallDescriptor, SyscallFlag},
  classify::{classify, SyscallOutcome},
  net::GeneratorRegistry,
  pages::WellKnownPages,
  rng::{random_seed, worker_rng, FuzzRng},
  sanitise::{generic_sanitise, ArgArena, SanitiseContext},
  shm::{SharedState, Timestamp},
  trace::{TraceFormatter, TRACE_TARGET},
};

/// `/proc/sys/kernel/overflowuid`, which `unshare(2)` may switch us to.
pub const OVERFLOW_UID: u32 = 65534;

/// Delay after each call in step-by-step mode.
pub const PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DispatchConfig {
  pub seed: u64,
  /// Emit trace lines at info instead of debug level.
  pub tracing: bool,
  /// Also issue calls through the compat ABI, where there is one.
  pub use_compat: bool,
  pub colors: bool,
  /// Flush the log before each call and sleep this long after it.
  pub pause: Option<Duration>,
}

impl Default for DispatchConfig {
  fn default() -> Self {
    Self {
      seed: random_seed(),
      tracing: false,
      use_compat: true,
      colors: true,
      pause: None,
    }
  }
}

/// What one iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
  pub nr: u32,
  pub abi: AbiWidth,
  /// The raw random draw, before any sanitiser ran.
  pub drawn: [u64; 6],
  pub args: [u64; 6],
  pub raw: i64,
  pub outcome: SyscallOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
  /// An argument register ended up holding the address of the shared
  /// region. The call was not issued.
  SharedStateAliased { arg: usize, value: u64 },
  /// The call changed our uid.
  PrivilegeDrift { was: Uid, now: Uid },
  NoSuchWorker(usize),
}

impl fmt::Display for DispatchError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DispatchError::SharedStateAliased { arg, value } => {
        write!(f, "address of shm ended up in a{}: {value:#x}", arg + 1)
      }
      DispatchError::PrivilegeDrift { was, now } => {
        write!(f, "uid changed! Was: {was}, now {now}")
      }
      DispatchError::NoSuchWorker(worker) => write!(f, "no shm slot for worker {worker}"),
    }
  }
}

impl std::error::Error for DispatchError {}

/// Keeps a one second alarm armed while alive.
#[derive(Debug)]
pub struct AlarmGuard {
  armed: bool,
}

impl AlarmGuard {
  pub fn arm(needed: bool) -> Self {
    if needed {
      alarm::set(1);
    }
    Self { armed: needed }
  }

  pub fn is_armed(&self) -> bool {
    self.armed
  }
}

impl Drop for AlarmGuard {
  fn drop(&mut self) {
    if self.armed {
      alarm::cancel();
    }
  }
}

pub struct Dispatcher {
  shm: SharedState,
  config: DispatchConfig,
  invokers: Invokers,
  native: SyscallCatalog,
  compat: SyscallCatalog,
  activity: ActivityTable,
  generators: GeneratorRegistry,
  pages: WellKnownPages,
  arena: ArgArena,
  rng: FuzzRng,
  last: Option<CallRecord>,
}

impl Dispatcher {
  pub fn new(shm: SharedState, config: DispatchConfig, invokers: Invokers) -> Result<Self, Errno> {
    Self::with_catalogs(
      shm,
      config,
      invokers,
      SyscallCatalog::builtin(AbiWidth::Native),
      SyscallCatalog::builtin(AbiWidth::Compat),
    )
  }

  pub fn with_catalogs(
    shm: SharedState,
    config: DispatchConfig,
    invokers: Invokers,
    native: SyscallCatalog,
    compat: SyscallCatalog,
  ) -> Result<Self, Errno> {
    let mut rng = worker_rng(config.seed, 0);
    let pages = WellKnownPages::new(&mut rng)?;
    Ok(Self {
      shm,
      config,
      invokers,
      native,
      compat,
      activity: ActivityTable::new(),
      generators: GeneratorRegistry::default(),
      pages,
      arena: ArgArena::new(),
      rng,
      last: None,
    })
  }

  /// Switches to the random stream of `worker`.
  pub fn reseed(&mut self, worker: usize) {
    self.rng = worker_rng(self.config.seed, worker);
  }

  pub fn config(&self) -> &DispatchConfig {
    &self.config
  }

  pub fn shm(&self) -> &SharedState {
    &self.shm
  }

  pub fn catalog(&self, abi: AbiWidth) -> &SyscallCatalog {
    match abi {
      AbiWidth::Native => &self.native,
      AbiWidth::Compat => &self.compat,
    }
  }

  pub fn activity(&self) -> &ActivityTable {
    &self.activity
  }

  pub fn activity_mut(&mut self) -> &mut ActivityTable {
    &mut self.activity
  }

  pub fn generators_mut(&mut self) -> &mut GeneratorRegistry {
    &mut self.generators
  }

  pub fn last_call(&self) -> Option<&CallRecord> {
    self.last.as_ref()
  }

  pub fn compat_enabled(&self) -> bool {
    self.config.use_compat && has_compat()
  }

  /// Picks an active syscall. The compat width gets half of the picks while
  /// it has anything left.
  pub fn choose_syscall(&mut self) -> Option<(u32, AbiWidth)> {
    let compat: Vec<u32> = if self.compat_enabled() {
      self.activity.pool(&self.compat).collect()
    } else {
      Vec::new()
    };
    if !compat.is_empty() && self.rng.gen_bool(0.5) {
      return compat.choose(&mut self.rng).map(|nr| (*nr, AbiWidth::Compat));
    }
    let native: Vec<u32> = self.activity.pool(&self.native).collect();
    match native.choose(&mut self.rng) {
      Some(nr) => Some((*nr, AbiWidth::Native)),
      None => compat.choose(&mut self.rng).map(|nr| (*nr, AbiWidth::Compat)),
    }
  }

  pub fn reset_slot(&mut self, worker: usize) {
    if let Some(slot) = self.shm.slot_mut(worker) {
      slot.reset();
    }
  }

  /// Stores the next call of `worker` in its slot.
  pub fn prepare(&mut self, worker: usize, nr: u32, abi: AbiWidth) -> Result<(), DispatchError> {
    let slot = self.shm.slot_mut(worker).ok_or(DispatchError::NoSuchWorker(worker))?;
    slot.syscallno = nr;
    slot.do32bit = abi == AbiWidth::Compat;
    Ok(())
  }

  fn ensure_no_shm_alias(&self, args: &[u64; 6]) -> Result<(), DispatchError> {
    let base = self.shm.base_addr();
    match args.iter().position(|&a| a == base) {
      Some(arg) => Err(DispatchError::SharedStateAliased { arg, value: base }),
      None => Ok(()),
    }
  }

  fn trace_level(&self) -> Option<Level> {
    if self.config.tracing {
      Some(Level::Info)
    } else if log_enabled!(target: TRACE_TARGET, Level::Debug) {
      Some(Level::Debug)
    } else {
      None
    }
  }

  /// Runs the call stored in the slot of `worker`.
  pub fn dispatch(&mut self, worker: usize) -> Result<CallRecord, DispatchError> {
    let was = getuid();
    let (nr, abi, count) = {
      let slot = self.shm.slot(worker).ok_or(DispatchError::NoSuchWorker(worker))?;
      (slot.syscallno, slot.abi(), slot.syscall_count)
    };
    self.shm.aggregate().tick_regenerate();
    let descriptor: Option<&'static SyscallDescriptor> = self.catalog(abi).get(nr);

    let mut drawn = [0u64; 6];
    self.rng.fill(&mut drawn[..]);
    let mut args = drawn;

    self.arena.clear();
    {
      let mut ctx = SanitiseContext {
        args: &mut args,
        descriptor,
        abi,
        rng: &mut self.rng,
        arena: &mut self.arena,
        pages: &self.pages,
        generators: &self.generators,
      };
      generic_sanitise(&mut ctx);
      if let Some(sanitise) = descriptor.and_then(|d| d.sanitise) {
        sanitise(&mut ctx);
      }
    }
    if let Some(slot) = self.shm.slot_mut(worker) {
      slot.args = args;
    }

    let trace_level = self.trace_level();
    let formatter = TraceFormatter::new(&self.pages, &self.arena, self.config.colors);
    if let Some(level) = trace_level {
      let line = formatter.render_call(count, abi, nr, descriptor, &drawn, &args);
      log::log!(target: TRACE_TARGET, level, "{line}");
    }

    if let Err(e) = self.ensure_no_shm_alias(&args) {
      error!("{e}");
      return Err(e);
    }
    if self.config.pause.is_some() {
      log::logger().flush();
    }

    let num_args = descriptor.map_or(6, |d| d.num_args());
    let raw = {
      let _alarm = AlarmGuard::arm(descriptor.is_some_and(|d| d.flags.contains(SyscallFlag::NeedAlarm)));
      self
        .invokers
        .get(abi)
        .invoke(num_args, nr + SYSCALL_OFFSET, args)
    };
    let outcome = classify(raw);

    let aggregate = self.shm.aggregate();
    aggregate.record_done();
    aggregate.record_outcome(outcome.is_success());
    if let Some(slot) = self.shm.slot_mut(worker) {
      slot.syscall_count += 1;
      slot.last_invocation = Timestamp::now();
    }

    if let Some(level) = trace_level {
      let line = formatter.render_outcome(&outcome);
      log::log!(target: TRACE_TARGET, level, "{line}");
    }
    if let Some(pause) = self.config.pause {
      std::thread::sleep(pause);
    }

    if let Some(errno) = outcome.errno() {
      self.activity.observe_failure(nr, abi, descriptor, errno);
    }

    if let Some(post) = descriptor.and_then(|d| d.post) {
      post(raw);
    }

    if let Some(slot) = self.shm.slot_mut(worker) {
      slot.retire_current();
    }

    let record = CallRecord {
      nr,
      abi,
      drawn,
      args,
      raw,
      outcome,
    };
    debug!("worker {worker}: {nr} ({abi:?}) -> {outcome:?}");
    self.last = Some(record.clone());

    let now = getuid();
    if now != was && now.as_raw() != OVERFLOW_UID {
      let e = DispatchError::PrivilegeDrift { was, now };
      warn!("{e}");
      return Err(e);
    }
    Ok(record)
  }

  /// Logs the aggregate counters.
  pub fn log_totals(&self) {
    let aggregate = self.shm.aggregate();
    info!(
      "{} syscalls done, {} successes, {} failures, {} regenerations",
      aggregate.total_syscalls_done(),
      aggregate.successes(),
      aggregate.failures(),
      aggregate.regenerate()
    );
  }
}
