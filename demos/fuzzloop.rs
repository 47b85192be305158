//! Forks a handful of workers that hammer a harmless subset of the syscall
//! table, then prints the shared counters.
//!
//! usage: fuzzloop [workers] [iterations] [seed]
//! Run with `RUST_LOG=syscall_fuzz::trace=debug` to see every call.

use anyhow::{bail, Context};
use log::{error, info, warn};
use nix::{
  libc,
  sys::wait::{waitpid, WaitStatus},
  unistd::{fork, ForkResult},
};

use syscall_fuzz::{
  rng::random_seed,
  shm::MAX_WORKERS,
  syscalls::{SyscallName, SYS_getpid, SYS_getppid, SYS_getuid, SYS_sched_yield, SYS_umask, SYS_uname},
  worker_main, AbiWidth, DispatchConfig, Dispatcher, Invokers, SharedState, Worker,
};

const HARMLESS: &[SyscallName] = &[
  SYS_getpid,
  SYS_getppid,
  SYS_getuid,
  SYS_sched_yield,
  SYS_uname,
  SYS_umask,
];

fn parse_arg<T: std::str::FromStr>(arg: Option<String>, default: T) -> anyhow::Result<T>
where
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match arg {
    Some(s) => s.parse().with_context(|| format!("invalid argument {s:?}")),
    None => Ok(default),
  }
}

fn keep_harmless(dispatcher: &mut Dispatcher) {
  for abi in [AbiWidth::Native, AbiWidth::Compat] {
    let others: Vec<u32> = dispatcher
      .catalog(abi)
      .iter()
      .filter(|(_, d)| !HARMLESS.contains(&d.id))
      .map(|(nr, _)| nr)
      .collect();
    for nr in others {
      dispatcher.activity_mut().deactivate(nr, abi);
    }
  }
}

fn run_child(id: usize, shm: SharedState, config: DispatchConfig, iterations: u64) -> ! {
  let worker = Dispatcher::new(shm, config, Invokers::default()).and_then(|mut d| {
    keep_harmless(&mut d);
    Worker::new(id, d)
  });
  match worker {
    Ok(worker) => worker_main(worker, iterations),
    Err(e) => {
      error!("worker {id}: setup failed: {e}");
      unsafe { libc::_exit(libc::EXIT_FAILURE) }
    }
  }
}

fn main() -> anyhow::Result<()> {
  env_logger::init();
  let mut args = std::env::args().skip(1);
  let workers: usize = parse_arg(args.next(), 4)?;
  let iterations: u64 = parse_arg(args.next(), 1000)?;
  let seed: u64 = parse_arg(args.next(), random_seed())?;
  if workers == 0 || workers > MAX_WORKERS {
    bail!("worker count must be within 1..={MAX_WORKERS}");
  }
  info!("running {workers} workers for {iterations} iterations, seed {seed:#x}");

  let shm = SharedState::create().context("failed to map the shared region")?;
  let config = DispatchConfig {
    seed,
    ..Default::default()
  };

  let mut children = Vec::with_capacity(workers);
  for id in 0..workers {
    match unsafe { fork()? } {
      ForkResult::Parent { child } => children.push(child),
      ForkResult::Child => run_child(id, shm, config, iterations),
    }
  }

  for child in children {
    match waitpid(child, None)? {
      WaitStatus::Exited(_, libc::EXIT_SUCCESS) => {}
      status => warn!("worker {child} ended with {status:?}"),
    }
  }

  let aggregate = shm.aggregate();
  println!(
    "{} syscalls done: {} successes, {} failures, {} regenerations",
    aggregate.total_syscalls_done(),
    aggregate.successes(),
    aggregate.failures(),
    aggregate.regenerate()
  );
  for id in 0..workers {
    if let Some(slot) = shm.slot(id) {
      println!(
        "worker {id}: {} calls, last was {}",
        slot.syscall_count, slot.previous_syscallno
      );
    }
  }
  println!("last exit reason: {:?}", shm.exit_reason());
  Ok(())
}
