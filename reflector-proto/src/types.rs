//! Wire type codes (spec.md §4.3), grounded on the original reflector's `ReflectorMsg.h`
//! numbering so that a packet capture of this server lines up with the protocol it's reimplementing.

// Administrative messages, 1-99.
pub const HEARTBEAT: u16 = 1;
pub const PROTO_VER: u16 = 5;
pub const PROTO_VER_DOWNGRADE: u16 = 6;
pub const AUTH_CHALLENGE: u16 = 10;
pub const AUTH_RESPONSE: u16 = 11;
pub const AUTH_OK: u16 = 12;
pub const ERROR: u16 = 13;
pub const START_ENCRYPTION_REQUEST: u16 = 14;
pub const START_ENCRYPTION: u16 = 15;
pub const CLIENT_CSR_REQUEST: u16 = 16;
pub const CLIENT_CSR: u16 = 17;
pub const CLIENT_CERT: u16 = 18;
pub const CA_INFO: u16 = 19;
pub const CA_BUNDLE_REQUEST: u16 = 20;
pub const CA_BUNDLE: u16 = 21;

// User-level messages, >= 100.
pub const SERVER_INFO: u16 = 100;
pub const NODE_LIST: u16 = 101;
pub const NODE_JOINED: u16 = 102;
pub const NODE_LEFT: u16 = 103;
pub const TALKER_START: u16 = 104;
pub const TALKER_STOP: u16 = 105;
pub const SELECT_TG: u16 = 106;
pub const TG_MONITOR: u16 = 107;
pub const REQUEST_QSY: u16 = 109;
pub const STATE_EVENT: u16 = 110;
pub const NODE_INFO: u16 = 111;
pub const SIGNAL_STRENGTH_VALUES: u16 = 112;
pub const TX_STATUS: u16 = 113;
pub const START_UDP_ENCRYPTION: u16 = 114;

// UDP messages, independent numbering (spec.md §4.3).
pub const UDP_HEARTBEAT: u16 = 1;
pub const UDP_AUDIO: u16 = 101;
pub const UDP_FLUSH_SAMPLES: u16 = 102;
pub const UDP_ALL_SAMPLES_FLUSHED: u16 = 103;
pub const UDP_SIGNAL_STRENGTH_VALUES: u16 = 104;
