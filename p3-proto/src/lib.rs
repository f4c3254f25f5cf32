//! Wire formats: the outer tunnel header (spec.md §6), the C7 control-channel
//! message codec (spec.md §4.7), and the C9 control sender that assembles the two
//! into a transmittable packet (spec.md §4.9).

pub mod control;
pub mod inner;
pub mod outer;
pub mod sender;

pub use control::{is_secondary_handled, ControlBody, ControlCommand, KeyOrIndex, RKERR, RKEY_FLAG_INDEXED};
pub use inner::{build_inner_udp_header, udp_payload_len, DEFAULT_LISTENER_PORT, INNER_HEADER_LEN};
pub use outer::{parse_outer, OuterTemplate, ParsedOuter, FORWARD_BIT, P3_IP_PROTOCOL};
pub use sender::{build_control_packet, CONTROL_ID_SEQ_DIFF};
