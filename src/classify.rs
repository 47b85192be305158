use nix::errno::Errno;

/// How many values just below the unsigned wraparound the kernel uses for
/// error returns, as far as the classifier is concerned.
pub const ERROR_WINDOW: u64 = 125;

/// What libc-style callers see as the result of a failed call.
pub const FAILURE_SENTINEL: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
  Success(i64),
  Failure(Errno),
}

impl SyscallOutcome {
  /// The value as a libc wrapper would have returned it.
  pub fn value(&self) -> i64 {
    match self {
      SyscallOutcome::Success(v) => *v,
      SyscallOutcome::Failure(_) => FAILURE_SENTINEL,
    }
  }

  pub fn errno(&self) -> Option<Errno> {
    match self {
      SyscallOutcome::Success(_) => None,
      SyscallOutcome::Failure(e) => Some(*e),
    }
  }

  pub fn is_success(&self) -> bool {
    matches!(self, SyscallOutcome::Success(_))
  }
}

/// Interprets a raw kernel return value.
pub fn classify(raw: i64) -> SyscallOutcome {
  let unsigned = raw as u64;
  if unsigned >= ERROR_WINDOW.wrapping_neg() {
    SyscallOutcome::Failure(Errno::from_raw(unsigned.wrapping_neg() as i32))
  } else {
    SyscallOutcome::Success(raw)
  }
}
