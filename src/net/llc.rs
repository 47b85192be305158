use nix::libc::{c_int, AF_LLC, ARPHRD_ETHER, SOCK_DGRAM, SOCK_STREAM};
use rand::{seq::SliceRandom, Rng, RngCore};

use super::{ArgumentGenerator, SockOpt, SocketAddress, SocketTriplet, PROTO_MAX};
use crate::rng::FuzzRng;

pub const IFHWADDRLEN: usize = 6;
pub const SOL_LLC: c_int = 268;

pub const LLC_OPT_UNKNOWN: c_int = 0;
pub const LLC_OPT_RETRY: c_int = 1;
pub const LLC_OPT_SIZE: c_int = 2;
pub const LLC_OPT_ACK_TMR_EXP: c_int = 3;
pub const LLC_OPT_P_TMR_EXP: c_int = 4;
pub const LLC_OPT_REJ_TMR_EXP: c_int = 5;
pub const LLC_OPT_BUSY_TMR_EXP: c_int = 6;
pub const LLC_OPT_TX_WIN: c_int = 7;
pub const LLC_OPT_RX_WIN: c_int = 8;
#[cfg(feature = "llc-pktinfo")]
pub const LLC_OPT_PKTINFO: c_int = 9;
#[cfg(not(feature = "llc-pktinfo"))]
pub const LLC_OPT_PKTINFO: c_int = LLC_OPT_UNKNOWN;

pub const LLC_OPTS: [c_int; 9] = [
  LLC_OPT_RETRY,
  LLC_OPT_SIZE,
  LLC_OPT_ACK_TMR_EXP,
  LLC_OPT_P_TMR_EXP,
  LLC_OPT_REJ_TMR_EXP,
  LLC_OPT_BUSY_TMR_EXP,
  LLC_OPT_TX_WIN,
  LLC_OPT_RX_WIN,
  LLC_OPT_PKTINFO,
];

/// `struct sockaddr_llc` from `<linux/llc.h>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct SockaddrLlc {
  pub sllc_family: u16,
  pub sllc_arphrd: u16,
  pub sllc_test: u8,
  pub sllc_xid: u8,
  pub sllc_ua: u8,
  pub sllc_sap: u8,
  pub sllc_mac: [u8; IFHWADDRLEN],
  pub __pad: [u8; 2],
}

impl SockaddrLlc {
  pub const SIZE: usize = std::mem::size_of::<SockaddrLlc>();

  pub fn to_bytes(&self) -> [u8; Self::SIZE] {
    let mut out = [0u8; Self::SIZE];
    out[0..2].copy_from_slice(&self.sllc_family.to_ne_bytes());
    out[2..4].copy_from_slice(&self.sllc_arphrd.to_ne_bytes());
    out[4] = self.sllc_test;
    out[5] = self.sllc_xid;
    out[6] = self.sllc_ua;
    out[7] = self.sllc_sap;
    out[8..8 + IFHWADDRLEN].copy_from_slice(&self.sllc_mac);
    out[8 + IFHWADDRLEN..].copy_from_slice(&self.__pad);
    out
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LlcGenerator;

impl ArgumentGenerator for LlcGenerator {
  fn family(&self) -> c_int {
    AF_LLC
  }

  fn generate_address(&self, rng: &mut FuzzRng) -> SocketAddress {
    let mut addr = SockaddrLlc {
      sllc_family: AF_LLC as u16,
      sllc_arphrd: ARPHRD_ETHER,
      sllc_test: rng.gen(),
      sllc_xid: rng.gen(),
      sllc_ua: rng.gen(),
      sllc_sap: rng.gen(),
      ..Default::default()
    };
    rng.fill_bytes(&mut addr.sllc_mac);
    SocketAddress::Llc(addr)
  }

  fn generate_triplet(&self, rng: &mut FuzzRng) -> SocketTriplet {
    SocketTriplet {
      domain: AF_LLC,
      kind: if rng.gen() { SOCK_STREAM } else { SOCK_DGRAM },
      protocol: rng.gen_range(0..PROTO_MAX),
    }
  }

  fn generate_sockopt(&self, rng: &mut FuzzRng) -> SockOpt {
    SockOpt {
      level: SOL_LLC,
      optname: LLC_OPTS.choose(rng).copied().unwrap_or(LLC_OPT_UNKNOWN),
    }
  }
}
