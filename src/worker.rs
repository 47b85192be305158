use log::{error, info, warn};
use nix::{
  errno::Errno,
  libc::{self, c_int},
  sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
};

use crate::{
  dispatch::{DispatchError, Dispatcher},
  shm::{ExitReason, MAX_WORKERS},
};

extern "C" fn on_alarm(_: c_int) {}

/// A guarded call should come back with EINTR instead of being restarted
/// or killing us.
fn install_alarm_handler() -> Result<(), Errno> {
  let action = SigAction::new(SigHandler::Handler(on_alarm), SaFlags::empty(), SigSet::empty());
  // SAFETY: the handler does nothing, so it is trivially async-signal-safe.
  unsafe { sigaction(Signal::SIGALRM, &action) }.map(drop)
}

/// The fuzzing loop of one worker process.
pub struct Worker {
  id: usize,
  dispatcher: Dispatcher,
}

impl Worker {
  pub fn new(id: usize, mut dispatcher: Dispatcher) -> Result<Self, Errno> {
    if id >= MAX_WORKERS {
      return Err(Errno::EINVAL);
    }
    install_alarm_handler()?;
    dispatcher.reseed(id);
    dispatcher.reset_slot(id);
    Ok(Self { id, dispatcher })
  }

  pub fn id(&self) -> usize {
    self.id
  }

  pub fn dispatcher(&self) -> &Dispatcher {
    &self.dispatcher
  }

  pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
    &mut self.dispatcher
  }

  fn finish(&self, reason: ExitReason) -> ExitReason {
    self.dispatcher.shm().set_exit_reason(reason);
    info!("worker {} exiting: {reason:?}", self.id);
    self.dispatcher.log_totals();
    reason
  }

  /// Runs until `limit` calls were made or something ends the run. Aborts
  /// the process if the shared region leaked into a register.
  pub fn run(&mut self, limit: u64) -> ExitReason {
    let mut done = 0;
    while done < limit {
      let Some((nr, abi)) = self.dispatcher.choose_syscall() else {
        return self.finish(ExitReason::NoSyscallsEnabled);
      };
      let result = self
        .dispatcher
        .prepare(self.id, nr, abi)
        .and_then(|()| self.dispatcher.dispatch(self.id));
      match result {
        Ok(_) => done += 1,
        Err(e @ DispatchError::PrivilegeDrift { .. }) => {
          warn!("worker {}: {e}", self.id);
          return self.finish(ExitReason::UidChanged);
        }
        Err(e @ DispatchError::SharedStateAliased { .. }) => {
          self.dispatcher.shm().set_exit_reason(ExitReason::ShmAliased);
          error!("worker {}: {e}", self.id);
          std::process::abort();
        }
        Err(e @ DispatchError::NoSuchWorker(_)) => {
          error!("{e}");
          return self.finish(ExitReason::NoSlot);
        }
      }
    }
    self.finish(ExitReason::ReachedCount)
  }
}

/// Entry point of a forked worker process.
pub fn worker_main(mut worker: Worker, limit: u64) -> ! {
  let status = match worker.run(limit) {
    ExitReason::ReachedCount => libc::EXIT_SUCCESS,
    _ => libc::EXIT_FAILURE,
  };
  // SAFETY: leaves without running the parent's atexit handlers, which a
  // forked child must not do.
  unsafe { libc::_exit(status) }
}

#[cfg(test)]
mod test {
  use nix::{
    sys::wait::{waitpid, WaitStatus},
    unistd::{fork, getuid, setresuid, ForkResult, Uid},
  };
  use serial_test::serial;

  use super::*;
  use crate::{
    activity::ENOSYS_EXEMPT,
    arch::{ArchInvoker, Invokers},
    catalog::AbiWidth,
    dispatch::{DispatchConfig, OVERFLOW_UID},
    shm::SharedState,
  };

  struct Succeed(AbiWidth);

  impl ArchInvoker for Succeed {
    fn abi(&self) -> AbiWidth {
      self.0
    }

    fn invoke(&self, _num_args: usize, _nr: u32, _args: [u64; 6]) -> i64 {
      0
    }
  }

  struct NoSys(AbiWidth);

  impl ArchInvoker for NoSys {
    fn abi(&self) -> AbiWidth {
      self.0
    }

    fn invoke(&self, _num_args: usize, _nr: u32, _args: [u64; 6]) -> i64 {
      -(Errno::ENOSYS as i64)
    }
  }

  /// Drops to the given uid, keeping root as the saved one.
  struct SwitchUid(AbiWidth, Uid);

  impl ArchInvoker for SwitchUid {
    fn abi(&self) -> AbiWidth {
      self.0
    }

    fn invoke(&self, _num_args: usize, _nr: u32, _args: [u64; 6]) -> i64 {
      match setresuid(self.1, self.1, Uid::from_raw(0)) {
        Ok(()) => 0,
        Err(e) => -(e as i64),
      }
    }
  }

  fn config() -> DispatchConfig {
    DispatchConfig {
      seed: 7,
      tracing: false,
      use_compat: true,
      colors: false,
      pause: None,
    }
  }

  fn worker(id: usize, invokers: Invokers) -> Result<Worker, Errno> {
    let dispatcher = Dispatcher::new(SharedState::create()?, config(), invokers)?;
    Worker::new(id, dispatcher)
  }

  /// Runs five calls as `uid` in a forked worker.
  fn run_forked_as(uid: u32) -> (WaitStatus, Option<ExitReason>, u64) {
    let shm = SharedState::create().unwrap();
    match unsafe { fork() }.unwrap() {
      ForkResult::Child => {
        let uid = Uid::from_raw(uid);
        let invokers = Invokers {
          native: Box::new(SwitchUid(AbiWidth::Native, uid)),
          compat: Box::new(SwitchUid(AbiWidth::Compat, uid)),
        };
        match Dispatcher::new(shm, config(), invokers).and_then(|d| Worker::new(1, d)) {
          Ok(w) => worker_main(w, 5),
          Err(_) => unsafe { libc::_exit(2) },
        }
      }
      ForkResult::Parent { child } => {
        let status = waitpid(child, None).unwrap();
        (status, shm.exit_reason(), shm.aggregate().total_syscalls_done())
      }
    }
  }

  #[test]
  #[serial]
  fn reaches_count() {
    let mut w = worker(
      3,
      Invokers {
        native: Box::new(Succeed(AbiWidth::Native)),
        compat: Box::new(Succeed(AbiWidth::Compat)),
      },
    )
    .unwrap();
    assert_eq!(w.id(), 3);
    assert_eq!(w.run(40), ExitReason::ReachedCount);
    let shm = w.dispatcher().shm();
    assert_eq!(shm.exit_reason(), Some(ExitReason::ReachedCount));
    assert_eq!(shm.slot(3).unwrap().syscall_count, 40);
    assert_eq!(shm.aggregate().successes(), 40);
  }

  #[test]
  #[serial]
  fn runs_dry_when_everything_is_enosys() {
    let mut w = worker(
      0,
      Invokers {
        native: Box::new(NoSys(AbiWidth::Native)),
        compat: Box::new(NoSys(AbiWidth::Compat)),
      },
    )
    .unwrap();
    // the exempt ones would never run out
    let d = w.dispatcher_mut();
    for id in ENOSYS_EXEMPT {
      for abi in [AbiWidth::Native, AbiWidth::Compat] {
        if let Some(nr) = d.catalog(abi).lookup(id) {
          d.activity_mut().deactivate(nr, abi);
        }
      }
    }
    assert_eq!(w.run(u64::MAX), ExitReason::NoSyscallsEnabled);
    let shm = w.dispatcher().shm();
    assert!(shm.aggregate().failures() > 0);
    assert_eq!(shm.exit_reason(), Some(ExitReason::NoSyscallsEnabled));
  }

  #[test]
  fn rejects_ids_without_slot() {
    assert_eq!(worker(MAX_WORKERS, Invokers::default()).err(), Some(Errno::EINVAL));
  }

  #[test]
  fn slotless_worker_stops_without_calling() {
    let dispatcher = Dispatcher::new(SharedState::create().unwrap(), config(), Invokers::default()).unwrap();
    let mut w = Worker {
      id: MAX_WORKERS,
      dispatcher,
    };
    assert_eq!(w.run(10), ExitReason::NoSlot);
    let shm = w.dispatcher().shm();
    assert_eq!(shm.exit_reason(), Some(ExitReason::NoSlot));
    assert_eq!(shm.aggregate().total_syscalls_done(), 0);
    assert_eq!(shm.aggregate().regenerate(), 0);
  }

  #[test]
  #[serial]
  fn uid_change_ends_the_run() {
    // switching uids needs root
    if !getuid().is_root() {
      return;
    }
    let (status, reason, done) = run_forked_as(1000);
    assert!(matches!(status, WaitStatus::Exited(_, libc::EXIT_FAILURE)), "{status:?}");
    assert_eq!(reason, Some(ExitReason::UidChanged));
    assert_eq!(done, 1);
  }

  #[test]
  #[serial]
  fn overflow_uid_is_tolerated() {
    if !getuid().is_root() {
      return;
    }
    let (status, reason, done) = run_forked_as(OVERFLOW_UID);
    assert!(matches!(status, WaitStatus::Exited(_, libc::EXIT_SUCCESS)), "{status:?}");
    assert_eq!(reason, Some(ExitReason::ReachedCount));
    assert_eq!(done, 5);
  }
}
