//! Runtime role selection (spec.md §9 Design Notes, "Conditional compilation of role"):
//! the original built three separate binaries (`Primary`, `Secondary`,
//! `Primary+Secondary`) behind preprocessor flags. Here a single binary carries all
//! three behaviors and `Role` picks which `RoleOps` impl the handler consults.

use p3_proto::{is_secondary_handled, ControlCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
    Both,
}

impl Role {
    pub fn ops(&self) -> Box<dyn RoleOps> {
        match self {
            Role::Primary => Box::new(PrimaryOps),
            Role::Secondary => Box::new(SecondaryOps),
            Role::Both => Box::new(BothOps),
        }
    }
}

/// Whether a given role instance should act on an inbound control command, per
/// spec.md §4.7's "Role asymmetry" table. `PacketHandler` consults this before
/// dispatching a decoded `ControlBody` to the session (SPEC_FULL §9 "Role abstraction").
pub trait RoleOps: Send + Sync {
    fn should_handle_inbound(&self, cmd: ControlCommand) -> bool;

    /// True if this role instance is the one that originates rekey (`REPLACE_KEY`) and
    /// its periodic trigger (spec.md §4.8 "Idle -> Rekeying ... primary-side periodic").
    fn originates_rekey(&self) -> bool;
}

pub struct PrimaryOps;

impl RoleOps for PrimaryOps {
    /// The primary side handles everything the secondary doesn't: acks and answers
    /// bouncing back (spec.md §4.7: "their ACKs/answers ... are issued by the Primary").
    fn should_handle_inbound(&self, cmd: ControlCommand) -> bool {
        !is_secondary_handled(cmd)
    }

    fn originates_rekey(&self) -> bool {
        true
    }
}

pub struct SecondaryOps;

impl RoleOps for SecondaryOps {
    fn should_handle_inbound(&self, cmd: ControlCommand) -> bool {
        is_secondary_handled(cmd)
    }

    fn originates_rekey(&self) -> bool {
        false
    }
}

/// The composite `Primary+Secondary` build variant (spec.md §9): both halves of the
/// asymmetric table are valid locally, so every inbound command is handled by
/// whichever side it was written for.
pub struct BothOps;

impl RoleOps for BothOps {
    fn should_handle_inbound(&self, _cmd: ControlCommand) -> bool {
        true
    }

    fn originates_rekey(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_and_secondary_partition_the_command_set() {
        let primary = PrimaryOps;
        let secondary = SecondaryOps;
        for cmd in [
            ControlCommand::SetKeyArray,
            ControlCommand::AckKeyArray,
            ControlCommand::ReplaceKey,
            ControlCommand::Rekey,
            ControlCommand::RekeyTest,
            ControlCommand::HeartbeatQuery,
            ControlCommand::HeartbeatAnswer,
            ControlCommand::StatusReq,
            ControlCommand::StatusResp,
            ControlCommand::UpdateInfo,
            ControlCommand::AckUpdate,
            ControlCommand::Shutdown,
            ControlCommand::AckShutdown,
        ] {
            assert_ne!(primary.should_handle_inbound(cmd), secondary.should_handle_inbound(cmd));
        }
    }

    #[test]
    fn both_handles_every_command() {
        let both = BothOps;
        assert!(both.should_handle_inbound(ControlCommand::SetKeyArray));
        assert!(both.should_handle_inbound(ControlCommand::AckKeyArray));
    }

    #[test]
    fn only_primary_and_both_originate_rekey() {
        assert!(PrimaryOps.originates_rekey());
        assert!(!SecondaryOps.originates_rekey());
        assert!(BothOps.originates_rekey());
    }
}
