use std::{num::NonZeroUsize, ptr::NonNull};

use nix::{
  errno::Errno,
  libc::c_void,
  sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags},
  unistd::{sysconf, SysconfVar},
};
use once_cell::sync::OnceCell;
use rand::{Rng, RngCore};

use crate::rng::FuzzRng;

static PAGE_SIZE: OnceCell<usize> = OnceCell::new();
static ONLINE_CPUS: OnceCell<u64> = OnceCell::new();

pub fn page_size() -> usize {
  *PAGE_SIZE.get_or_init(|| {
    sysconf(SysconfVar::PAGE_SIZE)
      .ok()
      .flatten()
      .map_or(4096, |v| v as usize)
  })
}

pub fn page_mask() -> u64 {
  !(page_size() as u64 - 1)
}

pub fn online_cpus() -> u64 {
  *ONLINE_CPUS.get_or_init(|| {
    sysconf(SysconfVar::_NPROCESSORS_ONLN)
      .ok()
      .flatten()
      .map_or(1, |v| v.max(1) as u64)
  })
}

/// Page-sized buffers that arguments are pointed at, and which traces
/// recognize by address.
#[derive(Debug)]
pub struct WellKnownPages {
  zeros: NonNull<c_void>,
  rand: NonNull<c_void>,
  ff: NonNull<c_void>,
  allocs: NonNull<c_void>,
}

fn map_page() -> Result<NonNull<c_void>, Errno> {
  let len = NonZeroUsize::new(page_size()).ok_or(Errno::EINVAL)?;
  unsafe {
    mmap_anonymous(
      None,
      len,
      ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
      MapFlags::MAP_PRIVATE,
    )
  }
}

impl WellKnownPages {
  pub fn new(rng: &mut FuzzRng) -> Result<Self, Errno> {
    let pages = Self {
      zeros: map_page()?,
      rand: map_page()?,
      ff: map_page()?,
      allocs: map_page()?,
    };
    let size = page_size();
    // SAFETY: each page is a private mapping of `size` bytes owned by us.
    unsafe {
      rng.fill_bytes(std::slice::from_raw_parts_mut(pages.rand.as_ptr().cast::<u8>(), size));
      pages.ff.as_ptr().cast::<u8>().write_bytes(0xff, size);
      let words = std::slice::from_raw_parts_mut(pages.allocs.as_ptr().cast::<u64>(), size / 8);
      let targets = [pages.zeros(), pages.rand(), pages.ff()];
      for (i, word) in words.iter_mut().enumerate() {
        *word = targets[i % targets.len()];
      }
    }
    Ok(pages)
  }

  pub fn zeros(&self) -> u64 {
    self.zeros.as_ptr() as u64
  }

  pub fn rand(&self) -> u64 {
    self.rand.as_ptr() as u64
  }

  pub fn ff(&self) -> u64 {
    self.ff.as_ptr() as u64
  }

  pub fn allocs(&self) -> u64 {
    self.allocs.as_ptr() as u64
  }

  pub fn any(&self, rng: &mut FuzzRng) -> u64 {
    match rng.gen_range(0..4) {
      0 => self.zeros(),
      1 => self.rand(),
      2 => self.ff(),
      _ => self.allocs(),
    }
  }

  pub fn contains(&self, value: u64) -> bool {
    self.tag(value).is_some()
  }

  /// The trace tag of a value pointing at one of the pages.
  pub fn tag(&self, value: u64) -> Option<&'static str> {
    let masks = [
      (self.zeros(), "page_zeros"),
      (self.rand(), "page_rand"),
      (self.ff(), "page_0xff"),
      (self.allocs(), "page_allocs"),
    ];
    masks
      .into_iter()
      .find(|(page, _)| value == page & page_mask())
      .map(|(_, tag)| tag)
  }
}

impl Drop for WellKnownPages {
  fn drop(&mut self) {
    for page in [self.zeros, self.rand, self.ff, self.allocs] {
      let _ = unsafe { munmap(page, page_size()) };
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::rng::worker_rng;

  #[test]
  fn pages_are_tagged() {
    let pages = WellKnownPages::new(&mut worker_rng(1, 0)).unwrap();
    assert_eq!(pages.tag(pages.zeros()), Some("page_zeros"));
    assert_eq!(pages.tag(pages.rand()), Some("page_rand"));
    assert_eq!(pages.tag(pages.ff()), Some("page_0xff"));
    assert_eq!(pages.tag(pages.allocs()), Some("page_allocs"));
    assert_eq!(pages.tag(pages.zeros() + 8), None);
    assert_eq!(pages.tag(0), None);
  }

  #[test]
  fn page_contents() {
    let pages = WellKnownPages::new(&mut worker_rng(1, 0)).unwrap();
    let size = page_size();
    let ff = unsafe { std::slice::from_raw_parts(pages.ff() as *const u8, size) };
    let zeros = unsafe { std::slice::from_raw_parts(pages.zeros() as *const u8, size) };
    let allocs = unsafe { std::slice::from_raw_parts(pages.allocs() as *const u64, size / 8) };
    assert!(ff.iter().all(|&b| b == 0xff));
    assert!(zeros.iter().all(|&b| b == 0));
    assert_eq!(allocs[0], pages.zeros());
    assert_eq!(allocs[2], pages.ff());
  }

  #[test]
  fn page_size_is_power_of_two() {
    assert!(page_size().is_power_of_two());
    assert_eq!(page_mask() & (page_size() as u64 - 1), 0);
    assert!(online_cpus() >= 1);
  }
}
