// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{Context, Result};
use nix::{
    errno::Errno,
    sys::socket::{socket, AddressFamily, SockFlag, SockProtocol, SockType},
};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// Brings up the loopback device of the current network namespace.
///
/// A fresh network namespace has "lo" down, and local sockets are part of
/// the container contract even when outbound networking is not.
pub fn enable_loopback_networking() -> Result<()> {
    let socket = unsafe {
        OwnedFd::from_raw_fd(
            socket(
                AddressFamily::Inet,
                SockType::Datagram,
                SockFlag::SOCK_CLOEXEC,
                SockProtocol::Udp,
            )
            .context("socket(AF_INET, SOCK_DGRAM) failed")?,
        )
    };

    let mut ifr_name = [0 as libc::c_char; 16];
    for (i, b) in b"lo".iter().enumerate() {
        ifr_name[i] = *b as libc::c_char;
    }
    let mut ifreq = libc::ifreq {
        ifr_name,
        ifr_ifru: libc::__c_anonymous_ifr_ifru { ifru_flags: 0 },
    };

    // Query the current flags.
    let res = unsafe { libc::ioctl(socket.as_raw_fd(), libc::SIOCGIFFLAGS, &ifreq) };
    Errno::result(res).context("ioctl(SIOCGIFFLAGS) failed")?;

    // Update the flags.
    unsafe {
        ifreq.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    }
    let res = unsafe { libc::ioctl(socket.as_raw_fd(), libc::SIOCSIFFLAGS, &ifreq) };
    Errno::result(res).context("ioctl(SIOCSIFFLAGS) failed")?;

    Ok(())
}
