//! Execution core of a Linux syscall fuzzer.
//!
//! A [`Worker`] picks an active syscall, the [`Dispatcher`] fills its six
//! argument registers with shaped randomness, issues it through the native
//! or the compat ABI, classifies the result and keeps the books in the
//! [`SharedState`] every worker process maps.

pub mod activity;
pub mod arch;
mod catalog;
pub mod classify;
pub mod dispatch;
pub mod net;
pub mod pages;
pub mod rng;
pub mod sanitise;
pub mod shm;
pub mod syscalls;
pub mod trace;
mod worker;

pub use activity::{ActivityTable, ENOSYS_EXEMPT};
pub use arch::{ArchInvoker, CompatInvoker, Invokers, NativeInvoker};
pub use catalog::*;
pub use classify::{classify, SyscallOutcome};
pub use dispatch::{CallRecord, DispatchConfig, DispatchError, Dispatcher};
pub use net::{ArgumentGenerator, GeneratorRegistry, SockOpt, SocketAddress, SocketTriplet};
pub use rng::FuzzRng;
pub use shm::{ExitReason, SharedState};
pub use worker::{worker_main, Worker};
