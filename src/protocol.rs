//! Wire-visible close codes of the signalling protocol.

use tungstenite::protocol::frame::{coding::CloseCode, CloseFrame};

/// Application close codes sent by the relay.
///
/// Close codes are advisory: a peer that disappears abruptly never produces
/// one, so clients must not rely on them for correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Close {
    /// A join targeted a code that is not in the slot table.
    NoSuchSlot,
    /// The deadline fired before the slot was paired.
    SlotTimedOut,
    /// The allocator exhausted every band.
    NoMoreSlots,
}

impl Close {
    /// The WebSocket close code, in the application range.
    pub fn code(self) -> u16 {
        match self {
            Close::NoSuchSlot => 4000,
            Close::SlotTimedOut => 4001,
            Close::NoMoreSlots => 4002,
        }
    }

    /// The reason string sent alongside the code.
    pub fn reason(self) -> &'static str {
        match self {
            Close::NoSuchSlot => "no such slot",
            Close::SlotTimedOut => "timed out",
            Close::NoMoreSlots => "cannot allocate slots",
        }
    }

    pub(crate) fn frame(self) -> CloseFrame<'static> {
        CloseFrame {
            code: CloseCode::Library(self.code()),
            reason: self.reason().into(),
        }
    }
}
