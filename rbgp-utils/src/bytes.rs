//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut, TryGetError};

thread_local!(
    pub static TLS_BUF: RefCell<BytesMut> =
        RefCell::new(BytesMut::with_capacity(4096))
);

// Extension methods for Bytes.
//
// All getters are fallible: reading past the end of the buffer returns a
// `TryGetError` instead of panicking.
pub trait BytesExt {
    /// Gets an unsigned 24 bit integer from `self` in the big-endian byte
    /// order.
    ///
    /// The current position is advanced by 3.
    fn try_get_u24(&mut self) -> Result<u32, TryGetError>;

    /// Gets an IPv4 addr from `self` in big-endian byte order.
    ///
    /// The current position is advanced by 4.
    fn try_get_ipv4(&mut self) -> Result<Ipv4Addr, TryGetError>;

    /// Gets an optional IPv4 addr from `self` in big-endian byte order.
    ///
    /// The current position is advanced by 4.
    fn try_get_opt_ipv4(&mut self) -> Result<Option<Ipv4Addr>, TryGetError>;

    /// Gets an IPv6 addr from `self` in big-endian byte order.
    ///
    /// The current position is advanced by 16.
    fn try_get_ipv6(&mut self) -> Result<Ipv6Addr, TryGetError>;

    /// Splits off the next `len` bytes, failing if not enough data is
    /// available.
    fn try_split_to(&mut self, len: usize) -> Result<Bytes, TryGetError>;
}

// Extension methods for BytesMut.
pub trait BytesMutExt {
    /// Writes an unsigned 24 bit integer to `self` in big-endian byte order.
    ///
    /// The current position is advanced by 3.
    fn put_u24(&mut self, n: u32);

    /// Writes an IP addr to `self` in big-endian byte order.
    ///
    /// The current position is advanced by 4 or 16.
    fn put_ip(&mut self, addr: &IpAddr);

    /// Writes an IPv4 addr to `self` in big-endian byte order.
    ///
    /// The current position is advanced by 4.
    fn put_ipv4(&mut self, addr: &Ipv4Addr);

    /// Writes an IPv6 addr to `self` in big-endian byte order.
    ///
    /// The current position is advanced by 16.
    fn put_ipv6(&mut self, addr: &Ipv6Addr);
}

// ===== impl Bytes =====

impl BytesExt for Bytes {
    fn try_get_u24(&mut self) -> Result<u32, TryGetError> {
        check_remaining(self, 3)?;
        let mut n = [0; 4];
        self.copy_to_slice(&mut n[1..=3]);
        Ok(u32::from_be_bytes(n))
    }

    fn try_get_ipv4(&mut self) -> Result<Ipv4Addr, TryGetError> {
        self.try_get_u32().map(Ipv4Addr::from)
    }

    fn try_get_opt_ipv4(&mut self) -> Result<Option<Ipv4Addr>, TryGetError> {
        let addr = self.try_get_ipv4()?;
        Ok((!addr.is_unspecified()).then_some(addr))
    }

    fn try_get_ipv6(&mut self) -> Result<Ipv6Addr, TryGetError> {
        self.try_get_u128().map(Ipv6Addr::from)
    }

    fn try_split_to(&mut self, len: usize) -> Result<Bytes, TryGetError> {
        check_remaining(self, len)?;
        Ok(self.split_to(len))
    }
}

// ===== impl BytesMut =====

impl BytesMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        let n = n.to_be_bytes();
        self.put_slice(&n[1..=3]);
    }

    fn put_ip(&mut self, addr: &IpAddr) {
        match addr {
            IpAddr::V4(addr) => self.put_slice(&addr.octets()),
            IpAddr::V6(addr) => self.put_slice(&addr.octets()),
        }
    }

    fn put_ipv4(&mut self, addr: &Ipv4Addr) {
        self.put_u32((*addr).into())
    }

    fn put_ipv6(&mut self, addr: &Ipv6Addr) {
        self.put_slice(&addr.octets())
    }
}

// ===== helper functions =====

fn check_remaining(buf: &Bytes, requested: usize) -> Result<(), TryGetError> {
    if buf.remaining() < requested {
        return Err(TryGetError {
            requested,
            available: buf.remaining(),
        });
    }
    Ok(())
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reads_fail_without_advancing() {
        let mut buf = Bytes::from_static(&[0x01, 0x02]);
        let error = buf.try_get_u24().unwrap_err();
        assert_eq!(error.requested, 3);
        assert_eq!(error.available, 2);
        assert_eq!(buf.len(), 2);
        assert!(buf.try_split_to(3).is_err());
        assert_eq!(buf.try_split_to(2).unwrap().as_ref(), &[0x01, 0x02]);
    }

    #[test]
    fn u24_round_trip() {
        let mut out = BytesMut::new();
        out.put_u24(0x00ab_cdef);
        let mut buf = out.freeze();
        assert_eq!(buf.try_get_u24().unwrap(), 0x00ab_cdef);
    }
}
