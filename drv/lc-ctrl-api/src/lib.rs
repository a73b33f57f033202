// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the lifecycle controller.
//!
//! The lifecycle state is owned entirely by hardware; this interface is
//! read-only. Transitions between states happen through an external,
//! physically-authenticated mechanism, never through this API.

#![cfg_attr(not(test), no_std)]

use num_derive::FromPrimitive;

/// Coarse manufacturing-stage states, in the order the device moves
/// through them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum LcState {
    Raw,
    TestLocked0,
    TestUnlocked0,
    TestUnlocked1,
    Dev,
    Prod,
    ProdEnd,
    Rma,
    Scrap,
}

impl LcState {
    /// True for the end-user states, where no test or manufacturing
    /// operation may run.
    pub fn is_mission_mode(&self) -> bool {
        matches!(self, Self::Dev | Self::Prod | Self::ProdEnd)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum LcError {
    ReadFailed = 1,
    TransitionPending = 2,
}

/// Hardware access to the lifecycle controller.
pub trait LcCtrl {
    /// One-time controller bring-up; called once before the state is
    /// first read.
    fn init(&mut self) -> Result<(), LcError>;

    /// Reads the current lifecycle state.
    fn read_state(&mut self) -> Result<LcState, LcError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn mission_mode_states() {
        assert!(LcState::Dev.is_mission_mode());
        assert!(LcState::Prod.is_mission_mode());
        assert!(LcState::ProdEnd.is_mission_mode());

        assert!(!LcState::Raw.is_mission_mode());
        assert!(!LcState::TestUnlocked1.is_mission_mode());
        assert!(!LcState::Rma.is_mission_mode());
        assert!(!LcState::Scrap.is_mission_mode());
    }

    #[test]
    fn state_from_raw_value() {
        assert_eq!(Some(LcState::Raw), LcState::from_u8(0));
        assert_eq!(Some(LcState::TestUnlocked1), LcState::from_u8(3));
        assert_eq!(Some(LcState::Scrap), LcState::from_u8(8));
        assert_eq!(None, LcState::from_u8(9));
    }
}
