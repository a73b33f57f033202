// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types for messages exchanged between the device and the manufacturing
//! host over the factory provisioning console.
//!
//! A frame is `[header | body | checksum]`: a hubpack-serialized [`Header`]
//! carrying a magic value and protocol version, a one-command or
//! one-response body, and a trailing Fletcher-16 checksum over everything
//! before it. Commands travel as a raw `u8` code rather than a serialized
//! enum so the device can tell a malformed frame (a transport bug, fatal)
//! apart from a well-formed frame carrying a command it doesn't know (an
//! operator error it can answer).

#![cfg_attr(not(test), no_std)]

use drv_otp_ctrl_api::Partition;
use hubpack::SerializedSize;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

pub use hubpack::error::Error as HubpackError;

/// Magic value for [`Header::magic`].
pub const MAGIC: u32 = 0x00f7_ab1e;

pub mod version {
    pub const V1: u32 = 1;
}

const CHECKSUM_SIZE: usize = core::mem::size_of::<u16>();

/// Largest frame either side ever produces. Command frames are smaller;
/// both fit.
pub const MAX_FRAME_SIZE: usize =
    Header::MAX_SIZE + MfgResponse::MAX_SIZE + CHECKSUM_SIZE;

// A command body (one raw code byte) must never out-size a response body.
const_assert!(1 <= MfgResponse::MAX_SIZE);

/// The frame prefix. The version comes first so the layout can change in
/// later versions; the magic follows for visibility in hex dumps.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, SerializedSize,
)]
pub struct Header {
    pub version: u32,
    pub magic: u32,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            version: version::V1,
            magic: MAGIC,
        }
    }
}

/// Wire values of the provisioning commands. The values are fixed by the
/// factory tooling on the other end of the console; see the pinning test
/// below before reordering anything.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum CommandCode {
    WriteAll = 0,
    WriteCreatorSwCfg = 1,
    WriteOwnerSwCfg = 2,
    WriteHwCfg = 3,
    Done = 4,
}

/// A decoded provisioning command.
///
/// Every [`CommandCode`] maps to a variant; anything else decodes to
/// [`Command::Unrecognized`] wrapping the raw wire value, so dispatch
/// stays exhaustive under compiler checking and the raw value is
/// available for diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    WriteAll,
    WriteCreatorSwCfg,
    WriteOwnerSwCfg,
    WriteHwCfg,
    Done,
    Unrecognized(u8),
}

impl From<CommandCode> for Command {
    fn from(code: CommandCode) -> Self {
        match code {
            CommandCode::WriteAll => Command::WriteAll,
            CommandCode::WriteCreatorSwCfg => Command::WriteCreatorSwCfg,
            CommandCode::WriteOwnerSwCfg => Command::WriteOwnerSwCfg,
            CommandCode::WriteHwCfg => Command::WriteHwCfg,
            CommandCode::Done => Command::Done,
        }
    }
}

impl Command {
    pub fn from_wire(raw: u8) -> Self {
        match CommandCode::from_u8(raw) {
            Some(code) => code.into(),
            None => Command::Unrecognized(raw),
        }
    }
}

/// Reason codes carried by application-error responses.
///
/// The order of these cases is the wire encoding; hubpack serializes the
/// variant index as a single byte. A pinning test holds the values.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, SerializedSize,
)]
pub enum ReasonCode {
    InvalidArgument,
    AlreadyExists,
    FailedPrecondition,
    Internal,
}

/// Set of OTP partitions, as a bitmask.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    SerializedSize,
)]
pub struct PartitionSet(u8);

impl PartitionSet {
    pub const EMPTY: Self = Self(0);

    pub fn insert(&mut self, partition: Partition) {
        self.0 |= partition.bit();
    }

    pub fn contains(&self, partition: Partition) -> bool {
        self.0 & partition.bit() != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Payload of the terminal success response: what the session did.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    SerializedSize,
)]
pub struct SessionReport {
    pub commands_handled: u32,
    pub partitions_written: PartitionSet,
}

/// One response per received command, never batched.
///
/// The order of these cases is the wire encoding; see the pinning test.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, SerializedSize,
)]
pub enum MfgResponse {
    /// Command succeeded, nothing more to say.
    Ok,
    /// Terminal success: the session is over and the device is about to
    /// park.
    SessionComplete(SessionReport),
    /// Application error; the command had no effect and the session
    /// continues.
    Error(ReasonCode),
}

/// Why an inbound frame could not be decoded. None of these are
/// recoverable on the device side; a frame that fails here is a transport
/// bug, not an operator mistake.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeFailureReason {
    Magic,
    Version(u32),
    FrameLengthInvalid,
    Deserialize,
    Crc,
}

impl From<HubpackError> for DecodeFailureReason {
    fn from(_: HubpackError) -> Self {
        Self::Deserialize
    }
}

/// Serializes a command frame into `out`, returning its length. This is
/// the host side of the contract; the device only decodes commands.
pub fn encode_command(
    out: &mut [u8; MAX_FRAME_SIZE],
    code: CommandCode,
) -> Result<usize, HubpackError> {
    let mut n = hubpack::serialize(&mut out[..], &Header::default())?;
    out[n] = code as u8;
    n += 1;
    Ok(seal(out, n))
}

/// Serializes a response frame into `out`, returning its length.
pub fn encode_response(
    out: &mut [u8; MAX_FRAME_SIZE],
    response: &MfgResponse,
) -> Result<usize, HubpackError> {
    let mut n = hubpack::serialize(&mut out[..], &Header::default())?;
    n += hubpack::serialize(&mut out[n..], response)?;
    Ok(seal(out, n))
}

/// Decodes a command frame. A well-formed frame carrying an unknown
/// command code decodes successfully to [`Command::Unrecognized`].
pub fn decode_command(data: &[u8]) -> Result<Command, DecodeFailureReason> {
    let body = strip_frame(data)?;
    if body.len() != 1 {
        return Err(DecodeFailureReason::FrameLengthInvalid);
    }
    Ok(Command::from_wire(body[0]))
}

/// Decodes a response frame.
pub fn decode_response(
    data: &[u8],
) -> Result<MfgResponse, DecodeFailureReason> {
    let body = strip_frame(data)?;
    let (response, leftover) = hubpack::deserialize::<MfgResponse>(body)?;
    if !leftover.is_empty() {
        return Err(DecodeFailureReason::FrameLengthInvalid);
    }
    Ok(response)
}

/// Appends the Fletcher-16 trailer over `out[..n]`, returning the full
/// frame length.
fn seal(out: &mut [u8; MAX_FRAME_SIZE], n: usize) -> usize {
    let checksum = fletcher::calc_fletcher16(&out[..n]);
    out[n..][..CHECKSUM_SIZE].copy_from_slice(&checksum.to_le_bytes()[..]);
    n + CHECKSUM_SIZE
}

/// Validates header and checksum, returning the body slice between them.
fn strip_frame(data: &[u8]) -> Result<&[u8], DecodeFailureReason> {
    let (header, leftover) = hubpack::deserialize::<Header>(data)?;

    if header.magic != MAGIC {
        return Err(DecodeFailureReason::Magic);
    }
    if header.version != version::V1 {
        return Err(DecodeFailureReason::Version(header.version));
    }

    if leftover.len() < CHECKSUM_SIZE {
        return Err(DecodeFailureReason::FrameLengthInvalid);
    }
    let (body, checksum) = leftover.split_at(leftover.len() - CHECKSUM_SIZE);

    let checksum = u16::from_le_bytes(
        checksum
            .try_into()
            .map_err(|_| DecodeFailureReason::FrameLengthInvalid)?,
    );
    let expected_checksum =
        fletcher::calc_fletcher16(&data[..data.len() - CHECKSUM_SIZE]);

    if checksum != expected_checksum {
        return Err(DecodeFailureReason::Crc);
    }

    Ok(body)
}
