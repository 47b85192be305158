#![allow(non_upper_case_globals)]

use syscall_fuzz_macros::syscall_table;

use crate::net::{post_socket, sanitise_setsockopt, sanitise_socket};

// Numbers are listed per native arch; `x86` doubles as the compat table on x86_64.
// This is a representative slice of the kernel table, not the whole of it.
syscall_table! {
  read (fd: Fd, buf: Address, count: Len) for [x86_64: 0, aarch64: 63, riscv64: 63, x86: 3],
  write (fd: Fd, buf: Address, count: Len) for [x86_64: 1, aarch64: 64, riscv64: 64, x86: 4],
  close (fd: Fd) for [x86_64: 3, aarch64: 57, riscv64: 57, x86: 6],
  ioctl (fd: Fd, cmd: Op, arg: Address) for [x86_64: 16, aarch64: 29, riscv64: 29, x86: 54],
  writev (fd: Fd, vec: IoVec, vlen: IoVecLen) for [x86_64: 20, aarch64: 66, riscv64: 66, x86: 146],
  access (filename: Pathname, mode: Mode) for [x86_64: 21, x86: 33],
  madvise (start: Address, len_in: Len, behavior: List)
    for [x86_64: 28, aarch64: 233, riscv64: 233, x86: 219],
  sched_yield () for [x86_64: 24, aarch64: 124, riscv64: 124, x86: 158],
  pause () + { flags: [NeedAlarm] } for [x86_64: 34, x86: 29],
  nanosleep (rqtp: Address, rmtp: Address) + { flags: [NeedAlarm] }
    for [x86_64: 35, aarch64: 101, riscv64: 101, x86: 162],
  getpid () for [x86_64: 39, aarch64: 172, riscv64: 172, x86: 20],
  sendfile (out_fd: Fd, in_fd: Fd, offset: Address, count: Len)
    for [x86_64: 40, aarch64: 71, riscv64: 71, x86: 187],
  socket (family: Undefined, r#type: Undefined, protocol: Undefined)
    + { sanitise: sanitise_socket, post: post_socket }
    for [x86_64: 41, aarch64: 198, riscv64: 198, x86: 359],
  connect (fd: Fd, uservaddr: SockAddr, addrlen: SockAddrLen) + { flags: [NeedAlarm] }
    for [x86_64: 42, aarch64: 203, riscv64: 203, x86: 362],
  bind (fd: Fd, umyaddr: SockAddr, addrlen: SockAddrLen)
    for [x86_64: 49, aarch64: 200, riscv64: 200, x86: 361],
  setsockopt (fd: Fd, level: Undefined, optname: Undefined, optval: Address, optlen: Len)
    + { sanitise: sanitise_setsockopt }
    for [x86_64: 54, aarch64: 208, riscv64: 208, x86: 366],
  uname (name: NonNullAddress) for [x86_64: 63, aarch64: 160, riscv64: 160, x86: 122],
  umask (mask: Mode) for [x86_64: 95, aarch64: 166, riscv64: 166, x86: 60],
  getuid () for [x86_64: 102, aarch64: 174, riscv64: 174, x86: 24],
  getppid () for [x86_64: 110, aarch64: 173, riscv64: 173, x86: 64],
  getpgid (pid: Pid) for [x86_64: 121, aarch64: 155, riscv64: 155, x86: 132],
  getpriority (which: Range, who: Pid) for [x86_64: 140, aarch64: 141, riscv64: 141, x86: 96],
  statfs (pathname: Pathname, buf: NonNullAddress)
    for [x86_64: 137, aarch64: 43, riscv64: 43, x86: 99],
  futex (uaddr: Address, op: Op, val: RandomLong, utime: Address, uaddr2: Address, val3: RandomLong)
    + { flags: [NeedAlarm] }
    for [x86_64: 202, aarch64: 98, riscv64: 98, x86: 240],
  sched_getaffinity (pid: Pid, len: Len, user_mask_ptr: RandPage)
    for [x86_64: 204, aarch64: 123, riscv64: 123, x86: 242],
  getcpu (cpup: Address, nodep: Address, unused: Undefined)
    for [x86_64: 309, aarch64: 168, riscv64: 168, x86: 318],
  perf_event_open (attr_uptr: Address, pid: Pid, cpu: Cpu, group_fd: Fd, flags: Undefined)
    for [x86_64: 298, aarch64: 241, riscv64: 241, x86: 336],
}
