// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Session state machines for both peer roles
//!
//! One total transition table per role, keyed by (state, received kind).
//! Every pair outside the table is answered with diagnostic D3_301 and an
//! ABORT; ABORT itself is accepted everywhere and lands in the terminal
//! state. The tables gate every inbound FPDU on both sides.

use super::error::{Diag, D3_301};
use super::fpdu::FpduKind;
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// Opens the connection and drives the exchange (client).
    Initiator,
    /// Accepts the connection and answers (server).
    Responder,
}

/// PeSIT session states. Initiator and responder use the same names; the
/// meaning mirrors (TDL02B is "sending data" for whichever side sends).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum State {
    Cn01Idle,
    Cn03Connected,
    Sf03FileSelected,
    Of02TransferReady,
    Tde02bReceivingData,
    Tdl02bSendingData,
    Tde07WriteEnd,
    MsgReceiving,
    Terminal,
}

impl State {
    pub const ALL: [State; 9] = [
        State::Cn01Idle,
        State::Cn03Connected,
        State::Sf03FileSelected,
        State::Of02TransferReady,
        State::Tde02bReceivingData,
        State::Tdl02bSendingData,
        State::Tde07WriteEnd,
        State::MsgReceiving,
        State::Terminal,
    ];

    pub fn name(self) -> &'static str {
        match self {
            State::Cn01Idle => "CN01_IDLE",
            State::Cn03Connected => "CN03_CONNECTED",
            State::Sf03FileSelected => "SF03_FILE_SELECTED",
            State::Of02TransferReady => "OF02_TRANSFER_READY",
            State::Tde02bReceivingData => "TDE02B_RECEIVING_DATA",
            State::Tdl02bSendingData => "TDL02B_SENDING_DATA",
            State::Tde07WriteEnd => "TDE07_WRITE_END",
            State::MsgReceiving => "MSG_RECEIVING",
            State::Terminal => "TERMINAL",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Next state after receiving `kind` in `state`, or the diagnostic to abort
/// with. The table is total: unknown pairs yield D3_301.
pub fn on_receive(role: Role, state: State, kind: FpduKind) -> Result<State, Diag> {
    use FpduKind::*;
    use State::*;

    if kind == Abort {
        return Ok(Terminal);
    }
    let next = match role {
        Role::Responder => match (state, kind) {
            (Cn01Idle, Connect) => Cn03Connected,

            (Cn03Connected, Create) => Sf03FileSelected,
            (Cn03Connected, Select) => Sf03FileSelected,
            (Cn03Connected, Msg) => Cn03Connected,
            (Cn03Connected, Msgdm) => MsgReceiving,
            (Cn03Connected, Release) => Terminal,

            (Sf03FileSelected, Open) => Of02TransferReady,
            (Sf03FileSelected, Deselect) => Cn03Connected,

            (Of02TransferReady, Write) => Tde02bReceivingData,
            (Of02TransferReady, Read) => Tdl02bSendingData,
            (Of02TransferReady, Close) => Sf03FileSelected,

            (Tde02bReceivingData, Dtf)
            | (Tde02bReceivingData, Dtfda)
            | (Tde02bReceivingData, Dtfma)
            | (Tde02bReceivingData, Dtffa) => Tde02bReceivingData,
            (Tde02bReceivingData, Syn) => Tde02bReceivingData,
            (Tde02bReceivingData, Idt) => Of02TransferReady,
            (Tde02bReceivingData, DtfEnd) => Tde07WriteEnd,

            (Tdl02bSendingData, AckSyn) => Tdl02bSendingData,
            (Tdl02bSendingData, Resyn) => Tdl02bSendingData,
            (Tdl02bSendingData, Idt) => Of02TransferReady,
            (Tdl02bSendingData, TransEnd) => Of02TransferReady,

            (Tde07WriteEnd, TransEnd) => Of02TransferReady,

            (MsgReceiving, Msgmm) => MsgReceiving,
            (MsgReceiving, Msgfm) => Cn03Connected,

            _ => return Err(D3_301),
        },
        Role::Initiator => match (state, kind) {
            (Cn01Idle, Aconnect) => Cn03Connected,
            (Cn01Idle, Rconnect) => Terminal,

            (Cn03Connected, AckCreate) => Sf03FileSelected,
            (Cn03Connected, AckSelect) => Sf03FileSelected,
            (Cn03Connected, AckMsg) => Cn03Connected,
            (Cn03Connected, Msg) => Cn03Connected,
            (Cn03Connected, Msgdm) => MsgReceiving,
            (Cn03Connected, Relconf) => Terminal,

            (Sf03FileSelected, AckOpen) => Of02TransferReady,
            (Sf03FileSelected, AckDeselect) => Cn03Connected,

            (Of02TransferReady, AckWrite) => Tdl02bSendingData,
            (Of02TransferReady, AckRead) => Tde02bReceivingData,
            (Of02TransferReady, AckClose) => Sf03FileSelected,

            (Tdl02bSendingData, AckSyn) => Tdl02bSendingData,
            (Tdl02bSendingData, Resyn) => Tdl02bSendingData,
            (Tdl02bSendingData, Idt) => Of02TransferReady,
            (Tdl02bSendingData, AckIdt) => Of02TransferReady,
            (Tdl02bSendingData, AckTransEnd) => Of02TransferReady,

            (Tde02bReceivingData, Dtf)
            | (Tde02bReceivingData, Dtfda)
            | (Tde02bReceivingData, Dtfma)
            | (Tde02bReceivingData, Dtffa) => Tde02bReceivingData,
            (Tde02bReceivingData, Syn) => Tde02bReceivingData,
            (Tde02bReceivingData, AckIdt) => Of02TransferReady,
            (Tde02bReceivingData, DtfEnd) => Tde07WriteEnd,

            (Tde07WriteEnd, AckTransEnd) => Of02TransferReady,

            (MsgReceiving, Msgmm) => MsgReceiving,
            (MsgReceiving, Msgfm) => Cn03Connected,

            _ => return Err(D3_301),
        },
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_reaches_terminal_from_everywhere() {
        for role in [Role::Initiator, Role::Responder].iter() {
            for state in State::ALL.iter() {
                assert_eq!(
                    on_receive(*role, *state, FpduKind::Abort),
                    Ok(State::Terminal),
                    "{:?} {}",
                    role,
                    state
                );
            }
        }
    }

    #[test]
    fn unknown_transitions_yield_unexpected_fpdu() {
        // WRITE straight after connecting skips the whole file phase
        assert_eq!(
            on_receive(Role::Responder, State::Cn03Connected, FpduKind::Write),
            Err(D3_301)
        );
        // stray middle segment without a MSGDM first
        assert_eq!(
            on_receive(Role::Responder, State::Cn03Connected, FpduKind::Msgmm),
            Err(D3_301)
        );
        assert_eq!(
            on_receive(Role::Responder, State::Cn03Connected, FpduKind::Msgfm),
            Err(D3_301)
        );
        // data before WRITE was acknowledged
        assert_eq!(
            on_receive(Role::Responder, State::Of02TransferReady, FpduKind::Dtf),
            Err(D3_301)
        );
    }

    #[test]
    fn table_is_total() {
        for role in [Role::Initiator, Role::Responder].iter() {
            for state in State::ALL.iter() {
                for kind in FpduKind::ALL.iter() {
                    // must never panic, any answer is fine
                    let _ = on_receive(*role, *state, *kind);
                }
            }
        }
    }

    #[test]
    fn only_terminal_is_a_sink() {
        for role in [Role::Initiator, Role::Responder].iter() {
            for state in State::ALL.iter() {
                let escapes = FpduKind::ALL.iter().any(|kind| {
                    matches!(on_receive(*role, *state, *kind), Ok(next) if next != *state)
                });
                if *state == State::Terminal {
                    let stays = FpduKind::ALL.iter().all(|kind| {
                        match on_receive(*role, *state, *kind) {
                            Ok(next) => next == State::Terminal,
                            Err(_) => true,
                        }
                    });
                    assert!(stays, "terminal must be a sink for {:?}", role);
                } else {
                    assert!(escapes, "{:?} {} cannot make progress", role, state);
                }
            }
        }
    }

    #[test]
    fn happy_send_path_responder() {
        use FpduKind::*;
        let steps = [
            (Connect, State::Cn03Connected),
            (Create, State::Sf03FileSelected),
            (Open, State::Of02TransferReady),
            (Write, State::Tde02bReceivingData),
            (Dtf, State::Tde02bReceivingData),
            (Syn, State::Tde02bReceivingData),
            (DtfEnd, State::Tde07WriteEnd),
            (TransEnd, State::Of02TransferReady),
            (Close, State::Sf03FileSelected),
            (Deselect, State::Cn03Connected),
            (Release, State::Terminal),
        ];
        let mut state = State::Cn01Idle;
        for (kind, expected) in steps.iter() {
            state = on_receive(Role::Responder, state, *kind).unwrap();
            assert_eq!(state, *expected, "after {}", kind);
        }
    }

    #[test]
    fn segmented_message_path_responder() {
        use FpduKind::*;
        let mut state = State::Cn03Connected;
        state = on_receive(Role::Responder, state, Msgdm).unwrap();
        assert_eq!(state, State::MsgReceiving);
        state = on_receive(Role::Responder, state, Msgmm).unwrap();
        assert_eq!(state, State::MsgReceiving);
        state = on_receive(Role::Responder, state, Msgfm).unwrap();
        assert_eq!(state, State::Cn03Connected);
    }
}
