//! Wire format and protocol state machine.

pub mod envelope;
pub mod machine;

pub use envelope::{
    build_request, channel_name, AcknowledgeData, BlacklistData, ConnectData, Frame, LeaderData,
    MessageKind, PartialFrame, RawEnvelope, RequestEnvelope, Token, ValidationPayload,
};
pub use machine::{Action, Phase, Protocol, ValidationError};
