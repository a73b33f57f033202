// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-size attestation key material shared with the key generation
//! stage.
//!
//! These sizes are architectural constants: the stage that derives the
//! device attestation key consumes the seed laid out here and produces the
//! public key and signature shapes below. Producers and consumers must
//! agree on them bit for bit, so every aggregate is pinned by compile-time
//! size assertions and the serialized form is exactly the in-memory byte
//! layout.

#![cfg_attr(not(test), no_std)]

use hubpack::SerializedSize;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the additional seed for attestation key generation.
pub const SEED_BITS: usize = 320;
pub const SEED_BYTES: usize = SEED_BITS / 8;
pub const SEED_WORDS: usize = SEED_BYTES / 4;

/// Size of one affine coordinate of an attestation public key
/// (ECDSA-P256).
pub const PUBKEY_COORD_BITS: usize = 256;
pub const PUBKEY_COORD_BYTES: usize = PUBKEY_COORD_BITS / 8;
pub const PUBKEY_COORD_WORDS: usize = PUBKEY_COORD_BYTES / 4;

/// Size of an attestation signature (ECDSA-P256).
pub const SIGNATURE_BITS: usize = 512;
pub const SIGNATURE_BYTES: usize = SIGNATURE_BITS / 8;
pub const SIGNATURE_WORDS: usize = SIGNATURE_BYTES / 4;

/// Additional seed material mixed into attestation key generation.
///
/// This is secret key material; instances scrub themselves on drop.
#[derive(
    Clone,
    Deserialize,
    Serialize,
    SerializedSize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Zeroize,
    ZeroizeOnDrop,
)]
#[repr(transparent)]
pub struct AttestSeed(#[serde(with = "BigArray")] pub [u8; SEED_BYTES]);

impl AttestSeed {
    pub fn new(bytes: [u8; SEED_BYTES]) -> Self {
        Self(bytes)
    }
}

/// An attestation public key: the affine coordinates of an ECDSA-P256
/// point.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    SerializedSize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct EcdsaP256PublicKey {
    pub x: [u8; PUBKEY_COORD_BYTES],
    pub y: [u8; PUBKEY_COORD_BYTES],
}

/// An attestation signature (ECDSA-P256, `r || s`).
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    SerializedSize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct EcdsaP256Signature(
    #[serde(with = "BigArray")] pub [u8; SIGNATURE_BYTES],
);

// Any producer/consumer disagreement on these is a protocol break, not a
// runtime error.
const_assert_eq!(core::mem::size_of::<AttestSeed>(), 40);
const_assert_eq!(core::mem::size_of::<EcdsaP256PublicKey>(), 64);
const_assert_eq!(core::mem::size_of::<EcdsaP256Signature>(), 64);

// The hubpack form of a fixed byte array is the array itself: wire size
// equals memory size.
const_assert_eq!(AttestSeed::MAX_SIZE, SEED_BYTES);
const_assert_eq!(EcdsaP256PublicKey::MAX_SIZE, 2 * PUBKEY_COORD_BYTES);
const_assert_eq!(EcdsaP256Signature::MAX_SIZE, SIGNATURE_BYTES);
