// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core of the factory (FT) individualization stage.
//!
//! This library owns the provisioning flow that runs on the device while
//! it sits on the factory tester: bring up the peripheral handles, check
//! that the lifecycle controller reports the one state this stage is
//! allowed to run in, then serve commands from the manufacturing console
//! one at a time. Each command maps to a fixed sequence of OTP partition
//! writes; each receives exactly one response.
//!
//! It can be embedded in whatever runtime the image uses; like other
//! `*-server-core` crates it contains no task or interrupt plumbing of
//! its own. [`FtProvision::run`] returns `Ok` only for the terminal
//! command, after the terminal response has gone out -- the surrounding
//! runtime then parks the CPU so an external, physically-authenticated
//! lifecycle transition can move the device to mission mode. Any fatal
//! error returns `Err` instead, and the runtime halts without completing
//! the response protocol: a partition write that failed mid-sequence must
//! stop the whole run, because continuing could leave the one-time
//! partitions inconsistent with each other in a way that can never be
//! repaired.

#![cfg_attr(not(test), no_std)]

use drv_lc_ctrl_api::{LcCtrl, LcError, LcState};
use drv_otp_ctrl_api::{OtpCtrl, OtpError, Partition};
use ft_mfg_msgs::{
    Command, DecodeFailureReason, MfgResponse, PartitionSet, ReasonCode,
    SessionReport,
};
use ringlog::RingLog;

/// The single lifecycle state provisioning may execute in. Anything else
/// -- earlier test states, mission mode, RMA -- aborts the run before a
/// command is read.
pub const AUTHORIZED_LC_STATE: LcState = LcState::TestUnlocked1;

/// Entries of local trace history kept by the context.
pub const TRACE_DEPTH: usize = 16;

/// The console transport. `recv_command` blocks until the link yields a
/// decoded command; there is nothing else for this stage to do in the
/// meantime.
pub trait MfgLink {
    fn recv_command(&mut self) -> Result<Command, LinkFault>;
    fn send_response(
        &mut self,
        response: &MfgResponse,
    ) -> Result<(), LinkFault>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkFault {
    /// The stream ended. Reaching this without having seen the terminal
    /// command means the host-side tooling hung up mid-session.
    Closed,
    /// An inbound frame failed magic/version/checksum validation or
    /// deserialization. Distinct from an unrecognized command, which is a
    /// well-formed frame and decodes successfully.
    Decode(DecodeFailureReason),
    Encode,
}

/// The unrecoverable conditions. Each of these stops the process; none of
/// them produce a response for the in-flight command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FatalError {
    /// The device is not in [`AUTHORIZED_LC_STATE`].
    LifecycleMismatch { expected: LcState, found: LcState },
    Lc(LcError),
    OtpInit(OtpError),
    /// A partition write failed. Remaining actions of the command were
    /// not attempted.
    PartitionWrite { partition: Partition, err: OtpError },
    Link(LinkFault),
    /// The console closed without a terminal command: a transport-layer
    /// bug, classified as an internal error.
    ConsoleClosed,
}

impl From<LcError> for FatalError {
    fn from(err: LcError) -> Self {
        Self::Lc(err)
    }
}

impl From<LinkFault> for FatalError {
    fn from(fault: LinkFault) -> Self {
        match fault {
            LinkFault::Closed => Self::ConsoleClosed,
            other => Self::Link(other),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    Start,
    LifecycleOk(LcState),
    CommandReceived(Command),
    WritingPartition(Partition),
    PartitionWritten(Partition),
    AlreadyWritten(Partition),
    UnrecognizedCommand(u8),
    Done,
}

/// What the loop does after responding to a command.
enum Disposition {
    Continue,
    Complete,
}

/// The provisioning context: exclusive owner of the peripheral handles
/// and the console link for the lifetime of the process.
///
/// All state is threaded through this structure explicitly; there are no
/// statics. The session-local `written` set is what enforces
/// write-once-per-partition at the command level -- the OTP controller
/// below would also fail a true double program, but by then half a
/// command may have committed, so the check belongs up here where it can
/// be answered without touching hardware.
pub struct FtProvision<O, L, K> {
    otp: O,
    lc: L,
    link: K,
    trace: RingLog<Trace, TRACE_DEPTH>,
    written: PartitionSet,
    commands_handled: u32,
}

impl<O, L, K> FtProvision<O, L, K>
where
    O: OtpCtrl,
    L: LcCtrl,
    K: MfgLink,
{
    pub fn new(otp: O, lc: L, link: K) -> Self {
        Self {
            otp,
            lc,
            link,
            trace: RingLog::new(),
            written: PartitionSet::EMPTY,
            commands_handled: 0,
        }
    }

    /// Local trace history, for post-mortem inspection.
    pub fn trace(&self) -> &RingLog<Trace, TRACE_DEPTH> {
        &self.trace
    }

    /// Hands the peripherals and link back, once the run is over.
    pub fn into_parts(self) -> (O, L, K) {
        (self.otp, self.lc, self.link)
    }

    /// Peripheral-handle bring-up. Called once, before the lifecycle
    /// check; the operations behind it are idempotent from our
    /// perspective.
    pub fn bring_up(&mut self) -> Result<(), FatalError> {
        self.otp.init().map_err(FatalError::OtpInit)?;
        self.lc.init()?;
        Ok(())
    }

    /// The lifecycle guard. A mismatch is fatal before any command is
    /// read: provisioning writes outside the authorized state could
    /// corrupt irreversible storage or violate the part's security
    /// posture, and there is no recovering from either. The failure is
    /// not reported over the console -- the protocol layer is never
    /// entered.
    pub fn check_lifecycle(&mut self) -> Result<(), FatalError> {
        let found = self.lc.read_state()?;
        if found != AUTHORIZED_LC_STATE {
            return Err(FatalError::LifecycleMismatch {
                expected: AUTHORIZED_LC_STATE,
                found,
            });
        }
        self.trace.record(Trace::LifecycleOk(found));
        Ok(())
    }

    /// Runs the provisioning session to completion: bring-up, lifecycle
    /// guard, then the command loop. Returns the session report after
    /// the terminal response has been sent.
    pub fn run(&mut self) -> Result<SessionReport, FatalError> {
        self.trace.record(Trace::Start);
        self.bring_up()?;
        self.check_lifecycle()?;

        loop {
            let command =
                self.link.recv_command().map_err(FatalError::from)?;
            self.trace.record(Trace::CommandReceived(command));

            let (response, disposition) = self.dispatch(command)?;
            self.link
                .send_response(&response)
                .map_err(FatalError::from)?;

            match disposition {
                Disposition::Continue => (),
                Disposition::Complete => return Ok(self.report()),
            }
        }
    }

    fn report(&self) -> SessionReport {
        SessionReport {
            commands_handled: self.commands_handled,
            partitions_written: self.written,
        }
    }

    /// Maps one command to its actions and its single response.
    ///
    /// Only two outcomes leave the loop running after an error response:
    /// a command we don't recognize, and a write to a partition this
    /// session already committed. Both answer without touching hardware.
    /// Everything else that goes wrong is fatal and propagates as `Err`
    /// without any response at all.
    fn dispatch(
        &mut self,
        command: Command,
    ) -> Result<(MfgResponse, Disposition), FatalError> {
        match command {
            Command::WriteAll => {
                if let Some(p) = Partition::ALL
                    .into_iter()
                    .find(|p| self.written.contains(*p))
                {
                    self.trace.record(Trace::AlreadyWritten(p));
                    return Ok((
                        MfgResponse::Error(ReasonCode::AlreadyExists),
                        Disposition::Continue,
                    ));
                }
                for partition in Partition::ALL {
                    self.write_partition(partition)?;
                }
                self.commands_handled += 1;
                Ok((MfgResponse::Ok, Disposition::Continue))
            }
            Command::WriteCreatorSwCfg => {
                self.write_one(Partition::CreatorSwCfg)
            }
            Command::WriteOwnerSwCfg => {
                self.write_one(Partition::OwnerSwCfg)
            }
            Command::WriteHwCfg => self.write_one(Partition::HwCfg),
            Command::Done => {
                self.trace.record(Trace::Done);
                self.commands_handled += 1;
                Ok((
                    MfgResponse::SessionComplete(self.report()),
                    Disposition::Complete,
                ))
            }
            Command::Unrecognized(raw) => {
                self.trace.record(Trace::UnrecognizedCommand(raw));
                Ok((
                    MfgResponse::Error(ReasonCode::InvalidArgument),
                    Disposition::Continue,
                ))
            }
        }
    }

    /// A single-partition command: refuse a re-write, otherwise program
    /// the partition and acknowledge.
    fn write_one(
        &mut self,
        partition: Partition,
    ) -> Result<(MfgResponse, Disposition), FatalError> {
        if self.written.contains(partition) {
            self.trace.record(Trace::AlreadyWritten(partition));
            return Ok((
                MfgResponse::Error(ReasonCode::AlreadyExists),
                Disposition::Continue,
            ));
        }
        self.write_partition(partition)?;
        self.commands_handled += 1;
        Ok((MfgResponse::Ok, Disposition::Continue))
    }

    fn write_partition(
        &mut self,
        partition: Partition,
    ) -> Result<(), FatalError> {
        self.trace.record(Trace::WritingPartition(partition));
        self.otp
            .write_partition(partition)
            .map_err(|err| FatalError::PartitionWrite { partition, err })?;
        self.written.insert(partition);
        self.trace.record(Trace::PartitionWritten(partition));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeOtp {
        init_calls: usize,
        attempts: Vec<Partition>,
        fail_on: Option<(Partition, OtpError)>,
    }

    impl OtpCtrl for FakeOtp {
        fn init(&mut self) -> Result<(), OtpError> {
            self.init_calls += 1;
            Ok(())
        }

        fn write_partition(
            &mut self,
            partition: Partition,
        ) -> Result<(), OtpError> {
            self.attempts.push(partition);
            match self.fail_on {
                Some((p, err)) if p == partition => Err(err),
                _ => Ok(()),
            }
        }
    }

    struct FakeLc {
        state: LcState,
        init_calls: usize,
        reads: usize,
    }

    impl FakeLc {
        fn in_state(state: LcState) -> Self {
            Self {
                state,
                init_calls: 0,
                reads: 0,
            }
        }
    }

    impl LcCtrl for FakeLc {
        fn init(&mut self) -> Result<(), LcError> {
            self.init_calls += 1;
            Ok(())
        }

        fn read_state(&mut self) -> Result<LcState, LcError> {
            assert!(self.init_calls > 0, "state read before bring-up");
            self.reads += 1;
            Ok(self.state)
        }
    }

    struct ScriptedLink {
        commands: VecDeque<Result<Command, LinkFault>>,
        responses: Vec<MfgResponse>,
    }

    impl ScriptedLink {
        fn with_commands(commands: &[Command]) -> Self {
            Self {
                commands: commands.iter().copied().map(Ok).collect(),
                responses: Vec::new(),
            }
        }

        fn push_fault(&mut self, fault: LinkFault) {
            self.commands.push_back(Err(fault));
        }
    }

    impl MfgLink for ScriptedLink {
        fn recv_command(&mut self) -> Result<Command, LinkFault> {
            self.commands.pop_front().unwrap_or(Err(LinkFault::Closed))
        }

        fn send_response(
            &mut self,
            response: &MfgResponse,
        ) -> Result<(), LinkFault> {
            self.responses.push(*response);
            Ok(())
        }
    }

    fn provisioner(
        commands: &[Command],
    ) -> FtProvision<FakeOtp, FakeLc, ScriptedLink> {
        FtProvision::new(
            FakeOtp::default(),
            FakeLc::in_state(AUTHORIZED_LC_STATE),
            ScriptedLink::with_commands(commands),
        )
    }

    #[test]
    fn happy_path_session() {
        let mut fp = provisioner(&[
            Command::WriteCreatorSwCfg,
            Command::WriteOwnerSwCfg,
            Command::Done,
        ]);

        let report = fp.run().unwrap();
        assert_eq!(report.commands_handled, 3);
        assert_eq!(report.partitions_written.len(), 2);
        assert!(report
            .partitions_written
            .contains(Partition::CreatorSwCfg));
        assert!(report.partitions_written.contains(Partition::OwnerSwCfg));
        assert!(!report.partitions_written.contains(Partition::HwCfg));

        let (otp, _, link) = fp.into_parts();
        assert_eq!(
            otp.attempts,
            vec![Partition::CreatorSwCfg, Partition::OwnerSwCfg]
        );
        assert_eq!(
            link.responses,
            vec![
                MfgResponse::Ok,
                MfgResponse::Ok,
                MfgResponse::SessionComplete(report),
            ]
        );
    }

    #[test]
    fn one_response_per_command_and_terminal_last() {
        let commands = [
            Command::WriteHwCfg,
            Command::Unrecognized(0x42),
            Command::WriteCreatorSwCfg,
            Command::WriteOwnerSwCfg,
            Command::Done,
        ];
        let mut fp = provisioner(&commands);
        fp.run().unwrap();

        let (_, _, link) = fp.into_parts();
        assert_eq!(link.responses.len(), commands.len());
        assert!(matches!(
            link.responses.last(),
            Some(MfgResponse::SessionComplete(_))
        ));
    }

    #[test]
    fn write_all_walks_partitions_in_order() {
        let mut fp = provisioner(&[Command::WriteAll, Command::Done]);

        let report = fp.run().unwrap();
        assert_eq!(report.commands_handled, 2);
        assert_eq!(report.partitions_written.len(), 3);

        let (otp, _, link) = fp.into_parts();
        assert_eq!(otp.attempts, Partition::ALL.to_vec());
        assert_eq!(
            link.responses,
            vec![MfgResponse::Ok, MfgResponse::SessionComplete(report)]
        );
    }

    #[test]
    fn write_all_stops_at_first_failure() {
        let mut fp = provisioner(&[Command::WriteAll, Command::Done]);
        fp.otp.fail_on =
            Some((Partition::OwnerSwCfg, OtpError::WriteFailed));

        let err = fp.run().unwrap_err();
        assert_eq!(
            err,
            FatalError::PartitionWrite {
                partition: Partition::OwnerSwCfg,
                err: OtpError::WriteFailed,
            }
        );

        let (otp, _, link) = fp.into_parts();
        // The third partition must never be attempted, and the failed
        // command gets no response of any kind.
        assert_eq!(
            otp.attempts,
            vec![Partition::CreatorSwCfg, Partition::OwnerSwCfg]
        );
        assert!(link.responses.is_empty());
    }

    #[test]
    fn write_all_failing_on_last_partition() {
        let mut fp = provisioner(&[Command::WriteAll]);
        fp.otp.fail_on = Some((Partition::HwCfg, OtpError::Timeout));

        let err = fp.run().unwrap_err();
        assert_eq!(
            err,
            FatalError::PartitionWrite {
                partition: Partition::HwCfg,
                err: OtpError::Timeout,
            }
        );

        let (otp, _, link) = fp.into_parts();
        assert_eq!(otp.attempts, Partition::ALL.to_vec());
        assert!(link.responses.is_empty());
    }

    #[test]
    fn unrecognized_command_keeps_the_loop_alive() {
        let mut fp =
            provisioner(&[Command::Unrecognized(0xff), Command::Done]);

        let report = fp.run().unwrap();
        // Only the terminal command counts as handled.
        assert_eq!(report.commands_handled, 1);
        assert!(report.partitions_written.is_empty());

        let (otp, _, link) = fp.into_parts();
        assert!(otp.attempts.is_empty());
        assert_eq!(
            link.responses,
            vec![
                MfgResponse::Error(ReasonCode::InvalidArgument),
                MfgResponse::SessionComplete(report),
            ]
        );
    }

    #[test]
    fn lifecycle_mismatch_aborts_with_zero_commands_processed() {
        for state in [
            LcState::Raw,
            LcState::TestLocked0,
            LcState::TestUnlocked0,
            LcState::Dev,
            LcState::Prod,
            LcState::ProdEnd,
            LcState::Rma,
            LcState::Scrap,
        ] {
            let mut fp = FtProvision::new(
                FakeOtp::default(),
                FakeLc::in_state(state),
                ScriptedLink::with_commands(&[Command::WriteAll]),
            );

            let err = fp.run().unwrap_err();
            assert_eq!(
                err,
                FatalError::LifecycleMismatch {
                    expected: AUTHORIZED_LC_STATE,
                    found: state,
                }
            );

            let (otp, _, link) = fp.into_parts();
            assert!(otp.attempts.is_empty());
            assert!(link.responses.is_empty());
            // The command is still queued: the protocol layer was never
            // entered.
            assert_eq!(link.commands.len(), 1);
        }
    }

    #[test]
    fn rewriting_a_partition_is_refused_without_touching_hardware() {
        let mut fp = provisioner(&[
            Command::WriteCreatorSwCfg,
            Command::WriteCreatorSwCfg,
            Command::Done,
        ]);

        let report = fp.run().unwrap();
        assert_eq!(report.commands_handled, 2);

        let (otp, _, link) = fp.into_parts();
        assert_eq!(otp.attempts, vec![Partition::CreatorSwCfg]);
        assert_eq!(
            link.responses,
            vec![
                MfgResponse::Ok,
                MfgResponse::Error(ReasonCode::AlreadyExists),
                MfgResponse::SessionComplete(report),
            ]
        );
    }

    #[test]
    fn write_all_is_refused_after_any_partition_was_written() {
        let mut fp = provisioner(&[
            Command::WriteOwnerSwCfg,
            Command::WriteAll,
            Command::Done,
        ]);

        let report = fp.run().unwrap();

        let (otp, _, link) = fp.into_parts();
        assert_eq!(otp.attempts, vec![Partition::OwnerSwCfg]);
        assert_eq!(
            link.responses,
            vec![
                MfgResponse::Ok,
                MfgResponse::Error(ReasonCode::AlreadyExists),
                MfgResponse::SessionComplete(report),
            ]
        );
    }

    #[test]
    fn console_closing_without_done_is_fatal() {
        let mut fp = provisioner(&[Command::WriteCreatorSwCfg]);

        let err = fp.run().unwrap_err();
        assert_eq!(err, FatalError::ConsoleClosed);

        let (otp, _, link) = fp.into_parts();
        // The write itself succeeded and was acknowledged before the
        // link died.
        assert_eq!(otp.attempts, vec![Partition::CreatorSwCfg]);
        assert_eq!(link.responses, vec![MfgResponse::Ok]);
    }

    #[test]
    fn frame_decode_faults_are_fatal() {
        let mut fp = provisioner(&[]);
        fp.link
            .push_fault(LinkFault::Decode(DecodeFailureReason::Crc));
        fp.link.commands.push_back(Ok(Command::Done));

        let err = fp.run().unwrap_err();
        assert_eq!(
            err,
            FatalError::Link(LinkFault::Decode(DecodeFailureReason::Crc))
        );

        let (_, _, link) = fp.into_parts();
        assert!(link.responses.is_empty());
    }

    #[test]
    fn bring_up_initializes_each_handle_once() {
        let mut fp = provisioner(&[Command::Done]);
        fp.run().unwrap();

        let (otp, lc, _) = fp.into_parts();
        assert_eq!(otp.init_calls, 1);
        assert_eq!(lc.init_calls, 1);
        assert_eq!(lc.reads, 1);
    }

    #[test]
    fn trace_records_the_session() {
        let mut fp = provisioner(&[
            Command::WriteHwCfg,
            Command::Unrecognized(0x99),
            Command::Done,
        ]);
        fp.run().unwrap();

        let events: Vec<Trace> =
            fp.trace().iter().map(|e| e.payload).collect();
        assert_eq!(events.first(), Some(&Trace::Start));
        assert!(events
            .contains(&Trace::LifecycleOk(AUTHORIZED_LC_STATE)));
        assert!(events
            .contains(&Trace::PartitionWritten(Partition::HwCfg)));
        assert!(events.contains(&Trace::UnrecognizedCommand(0x99)));
        assert_eq!(events.last(), Some(&Trace::Done));
    }
}
