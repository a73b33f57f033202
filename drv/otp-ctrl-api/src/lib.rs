// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the OTP controller.
//!
//! The controller owns the one-time-programmable configuration partitions.
//! Each partition can be programmed at most once per bit; a committed write
//! cannot be cleared or rolled back, which is why `write_partition` is
//! all-or-nothing from the caller's perspective: the driver either commits
//! the whole partition (including its integrity digest) or reports failure
//! having made no claim of consistency. Callers must not retry a failed
//! write.

#![cfg_attr(not(test), no_std)]

use num_derive::FromPrimitive;

/// The software-managed OTP partitions programmed during factory
/// individualization.
///
/// `ALL` fixes the order a full-device write walks the partitions in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Partition {
    CreatorSwCfg = 0,
    OwnerSwCfg = 1,
    HwCfg = 2,
}

impl Partition {
    pub const ALL: [Self; 3] =
        [Self::CreatorSwCfg, Self::OwnerSwCfg, Self::HwCfg];

    /// Bit position used by partition masks.
    pub fn bit(&self) -> u8 {
        1 << (*self as u8)
    }
}

/// Failures reported by the controller. All of these are terminal for a
/// provisioning run: a partition that failed mid-program cannot be
/// corrected later.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum OtpError {
    WriteFailed = 1,
    DigestMismatch = 2,
    AccessDenied = 3,
    AlreadyProgrammed = 4,
    Timeout = 5,
}

/// Hardware access to the OTP controller.
pub trait OtpCtrl {
    /// One-time controller bring-up; called once before any write.
    fn init(&mut self) -> Result<(), OtpError>;

    /// Programs `partition` and locks it with its digest. Atomic or
    /// failed; never retried by callers.
    fn write_partition(
        &mut self,
        partition: Partition,
    ) -> Result<(), OtpError>;
}
