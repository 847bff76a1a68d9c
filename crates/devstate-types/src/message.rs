//! The fixed message catalogue and its wire representation.
//!
//! Every message is a variant of the [`Message`] tagged union. On the socket
//! it travels as a 12-byte header followed by a fixed, type-specific body and
//! an optional trailing "extra" blob carrying strings:
//!
//! | Offset | Field | Meaning |
//! |---|---|---|
//! | 0 | `line_size: u32` | total bytes, extra blob included |
//! | 4 | `size: u32` | header + fixed body, extra blob excluded |
//! | 8 | `type_id: u32` | [`MessageKind`] discriminant |
//! | 12 | body | little-endian 32-bit fields |
//! | `size` | extra | NUL-terminated strings |
//!
//! The `size` field is the message's self-declared size. The dispatcher
//! delivers a message only to handlers registered with exactly that size.

use crate::{DevStateError, DeviceState, Runlevel};

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: u32 = 12;

/// Largest `line_size` a socket peer may announce.
pub const MAX_LINE_SIZE: u32 = 65_536;

/// Why a socket connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CloseReason {
    /// The peer closed its end.
    Eof = 0,
    /// The peer sent a size outside the accepted bounds.
    OutOfSync = 1,
    /// A read or write failed.
    Error = 2,
}

impl CloseReason {
    fn from_raw(value: u32) -> Self {
        match value {
            0 => Self::Eof,
            1 => Self::OutOfSync,
            _ => Self::Error,
        }
    }
}

/// Category of a malfunction report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MalfReason {
    Software = 0,
    Hardware = 1,
}

impl MalfReason {
    fn from_raw(value: u32) -> Self {
        if value == 1 { Self::Hardware } else { Self::Software }
    }
}

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum MessageKind {
    Close = 0x0000_0001,
    StateChangeInd = 0x0000_0301,
    StateQuery = 0x0000_0302,
    SaveDataInd = 0x0000_0304,
    PowerupReq = 0x0000_0305,
    ShutdownReq = 0x0000_0306,
    SetAlarmState = 0x0000_0307,
    RebootReq = 0x0000_0308,
    StateReqDeniedInd = 0x0000_0309,
    ThermalShutdownInd = 0x0000_0310,
    SetChargerState = 0x0000_0311,
    SetThermalState = 0x0000_0312,
    SetEmergencyCallState = 0x0000_0313,
    SetBatteryState = 0x0000_0314,
    Shutdown = 0x0000_0316,
    SetUsbState = 0x0000_0317,
    Telinit = 0x0000_0318,
    ChangeRunlevel = 0x0000_0319,
    RunlevelSwitchDone = 0x0000_031A,
    Heartbeat = 0x0000_0700,
    HwwdKick = 0x0000_0703,
    EnterMalf = 0x0000_0900,
    GetVersion = 0x0000_1100,
    DaemonVersion = 0x0000_1101,
    SetLoggingVerbosity = 0x0000_1103,
    Idle = 0x0000_1337,
    TimerExpired = 0x0000_F000,
}

impl MessageKind {
    const ALL: [MessageKind; 27] = [
        Self::Close,
        Self::StateChangeInd,
        Self::StateQuery,
        Self::SaveDataInd,
        Self::PowerupReq,
        Self::ShutdownReq,
        Self::SetAlarmState,
        Self::RebootReq,
        Self::StateReqDeniedInd,
        Self::ThermalShutdownInd,
        Self::SetChargerState,
        Self::SetThermalState,
        Self::SetEmergencyCallState,
        Self::SetBatteryState,
        Self::Shutdown,
        Self::SetUsbState,
        Self::Telinit,
        Self::ChangeRunlevel,
        Self::RunlevelSwitchDone,
        Self::Heartbeat,
        Self::HwwdKick,
        Self::EnterMalf,
        Self::GetVersion,
        Self::DaemonVersion,
        Self::SetLoggingVerbosity,
        Self::Idle,
        Self::TimerExpired,
    ];

    pub fn type_id(self) -> u32 {
        self as u32
    }

    pub fn from_type_id(type_id: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.type_id() == type_id)
    }

    /// Header plus fixed body, i.e. the `size` a well-formed message declares.
    pub fn fixed_size(self) -> u32 {
        let body = match self {
            Self::StateQuery
            | Self::SaveDataInd
            | Self::PowerupReq
            | Self::ShutdownReq
            | Self::RebootReq
            | Self::ThermalShutdownInd
            | Self::Telinit
            | Self::Heartbeat
            | Self::HwwdKick
            | Self::GetVersion
            | Self::DaemonVersion
            | Self::Idle => 0,
            Self::TimerExpired => 8,
            _ => 4,
        };
        HEADER_SIZE + body
    }

    /// Messages that never leave the process, neither inbound nor outbound.
    pub fn is_internal(self) -> bool {
        matches!(
            self,
            Self::TimerExpired
                | Self::Idle
                | Self::Heartbeat
                | Self::HwwdKick
                | Self::ChangeRunlevel
                | Self::Shutdown
        )
    }
}

/// Every message the daemon understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Close { reason: CloseReason },
    StateChangeInd { state: DeviceState },
    StateQuery,
    SaveDataInd,
    PowerupReq,
    ShutdownReq,
    SetAlarmState { alarm_set: bool },
    RebootReq,
    StateReqDeniedInd { state: DeviceState, reason: String },
    ThermalShutdownInd,
    SetChargerState { connected: bool },
    SetThermalState { overheated: bool },
    SetEmergencyCallState { ongoing: bool },
    SetBatteryState { empty: bool },
    Shutdown { runlevel: Runlevel },
    SetUsbState { mounted_to_pc: bool },
    /// Runlevel change by name: `SHUTDOWN`, `REBOOT`, `USER` or `ACTDEAD`.
    Telinit { target: String },
    ChangeRunlevel { runlevel: Runlevel },
    /// Init scripts finished switching into `state`.
    RunlevelSwitchDone { state: DeviceState },
    Heartbeat,
    HwwdKick,
    EnterMalf { reason: MalfReason, component: String, details: String },
    GetVersion,
    DaemonVersion { version: String },
    SetLoggingVerbosity { verbosity: u32 },
    Idle,
    TimerExpired { timer: u64 },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Close { .. } => MessageKind::Close,
            Self::StateChangeInd { .. } => MessageKind::StateChangeInd,
            Self::StateQuery => MessageKind::StateQuery,
            Self::SaveDataInd => MessageKind::SaveDataInd,
            Self::PowerupReq => MessageKind::PowerupReq,
            Self::ShutdownReq => MessageKind::ShutdownReq,
            Self::SetAlarmState { .. } => MessageKind::SetAlarmState,
            Self::RebootReq => MessageKind::RebootReq,
            Self::StateReqDeniedInd { .. } => MessageKind::StateReqDeniedInd,
            Self::ThermalShutdownInd => MessageKind::ThermalShutdownInd,
            Self::SetChargerState { .. } => MessageKind::SetChargerState,
            Self::SetThermalState { .. } => MessageKind::SetThermalState,
            Self::SetEmergencyCallState { .. } => MessageKind::SetEmergencyCallState,
            Self::SetBatteryState { .. } => MessageKind::SetBatteryState,
            Self::Shutdown { .. } => MessageKind::Shutdown,
            Self::SetUsbState { .. } => MessageKind::SetUsbState,
            Self::Telinit { .. } => MessageKind::Telinit,
            Self::ChangeRunlevel { .. } => MessageKind::ChangeRunlevel,
            Self::RunlevelSwitchDone { .. } => MessageKind::RunlevelSwitchDone,
            Self::Heartbeat => MessageKind::Heartbeat,
            Self::HwwdKick => MessageKind::HwwdKick,
            Self::EnterMalf { .. } => MessageKind::EnterMalf,
            Self::GetVersion => MessageKind::GetVersion,
            Self::DaemonVersion { .. } => MessageKind::DaemonVersion,
            Self::SetLoggingVerbosity { .. } => MessageKind::SetLoggingVerbosity,
            Self::Idle => MessageKind::Idle,
            Self::TimerExpired { .. } => MessageKind::TimerExpired,
        }
    }

    /// The self-declared size of this message (header + fixed body).
    pub fn declared_size(&self) -> u32 {
        self.kind().fixed_size()
    }

    /// Serialize into a complete wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let kind = self.kind();
        let mut body: Vec<u8> = Vec::with_capacity(8);
        let mut extra: Vec<&str> = Vec::new();

        match self {
            Self::Close { reason } => put_u32(&mut body, *reason as u32),
            Self::StateChangeInd { state } => put_i32(&mut body, state.as_raw()),
            Self::SetAlarmState { alarm_set: flag }
            | Self::SetChargerState { connected: flag }
            | Self::SetThermalState { overheated: flag }
            | Self::SetEmergencyCallState { ongoing: flag }
            | Self::SetBatteryState { empty: flag }
            | Self::SetUsbState { mounted_to_pc: flag } => put_u32(&mut body, u32::from(*flag)),
            Self::StateReqDeniedInd { state, reason } => {
                put_i32(&mut body, state.as_raw());
                extra.push(reason);
            }
            Self::Shutdown { runlevel } | Self::ChangeRunlevel { runlevel } => {
                put_i32(&mut body, runlevel.as_raw())
            }
            Self::RunlevelSwitchDone { state } => put_i32(&mut body, state.as_raw()),
            Self::Telinit { target } => extra.push(target),
            Self::EnterMalf {
                reason,
                component,
                details,
            } => {
                put_u32(&mut body, *reason as u32);
                extra.push(component);
                extra.push(details);
            }
            Self::DaemonVersion { version } => extra.push(version),
            Self::SetLoggingVerbosity { verbosity } => put_u32(&mut body, *verbosity),
            Self::TimerExpired { timer } => body.extend_from_slice(&timer.to_le_bytes()),
            Self::StateQuery
            | Self::SaveDataInd
            | Self::PowerupReq
            | Self::ShutdownReq
            | Self::RebootReq
            | Self::ThermalShutdownInd
            | Self::Heartbeat
            | Self::HwwdKick
            | Self::GetVersion
            | Self::Idle => {}
        }

        let extra_len: usize = extra.iter().map(|s| s.len() + 1).sum();
        let size = kind.fixed_size();
        let line_size = size as usize + extra_len;

        let mut buf = Vec::with_capacity(line_size);
        buf.extend_from_slice(&(line_size as u32).to_le_bytes());
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&kind.type_id().to_le_bytes());
        buf.extend_from_slice(&body);
        for s in extra {
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
        }
        buf
    }

    /// Parse one complete wire frame.
    ///
    /// Returns the message together with the `size` it declared, which may be
    /// larger than [`MessageKind::fixed_size`] for a newer sender. Internal
    /// kinds are refused.
    pub fn decode(frame: &[u8]) -> Result<(Message, u32), DevStateError> {
        if frame.len() < HEADER_SIZE as usize {
            return Err(DevStateError::Malformed(format!(
                "frame of {} bytes is shorter than the header",
                frame.len()
            )));
        }
        let line_size = read_u32(frame, 0);
        let size = read_u32(frame, 4);
        let type_id = read_u32(frame, 8);

        if line_size as usize != frame.len() || size < HEADER_SIZE || size > line_size {
            return Err(DevStateError::Malformed(format!(
                "inconsistent sizes: line_size={line_size} size={size} frame={}",
                frame.len()
            )));
        }

        let kind = MessageKind::from_type_id(type_id).ok_or(DevStateError::UnknownType(type_id))?;
        if size < kind.fixed_size() {
            return Err(DevStateError::Malformed(format!(
                "{kind:?} declares {size} bytes, needs {}",
                kind.fixed_size()
            )));
        }

        let body = &frame[HEADER_SIZE as usize..size as usize];
        let mut extra = frame[size as usize..]
            .split(|b| *b == 0)
            .map(|s| String::from_utf8_lossy(s).into_owned());
        let mut next_string = || extra.next().unwrap_or_default();

        let flag = || read_u32(body, 0) != 0;
        let state = || {
            let raw = read_i32(body, 0);
            DeviceState::from_raw(raw)
                .ok_or_else(|| DevStateError::Malformed(format!("unknown state {raw}")))
        };

        let message = match kind {
            MessageKind::Close => Self::Close {
                reason: CloseReason::from_raw(read_u32(body, 0)),
            },
            MessageKind::StateChangeInd => Self::StateChangeInd { state: state()? },
            MessageKind::StateQuery => Self::StateQuery,
            MessageKind::SaveDataInd => Self::SaveDataInd,
            MessageKind::PowerupReq => Self::PowerupReq,
            MessageKind::ShutdownReq => Self::ShutdownReq,
            MessageKind::SetAlarmState => Self::SetAlarmState { alarm_set: flag() },
            MessageKind::RebootReq => Self::RebootReq,
            MessageKind::StateReqDeniedInd => Self::StateReqDeniedInd {
                state: state()?,
                reason: next_string(),
            },
            MessageKind::ThermalShutdownInd => Self::ThermalShutdownInd,
            MessageKind::SetChargerState => Self::SetChargerState { connected: flag() },
            MessageKind::SetThermalState => Self::SetThermalState { overheated: flag() },
            MessageKind::SetEmergencyCallState => Self::SetEmergencyCallState { ongoing: flag() },
            MessageKind::SetBatteryState => Self::SetBatteryState { empty: flag() },
            MessageKind::SetUsbState => Self::SetUsbState { mounted_to_pc: flag() },
            MessageKind::Telinit => Self::Telinit {
                target: next_string(),
            },
            MessageKind::RunlevelSwitchDone => Self::RunlevelSwitchDone { state: state()? },
            MessageKind::EnterMalf => Self::EnterMalf {
                reason: MalfReason::from_raw(read_u32(body, 0)),
                component: next_string(),
                details: next_string(),
            },
            MessageKind::GetVersion => Self::GetVersion,
            MessageKind::DaemonVersion => Self::DaemonVersion {
                version: next_string(),
            },
            MessageKind::SetLoggingVerbosity => Self::SetLoggingVerbosity {
                verbosity: read_u32(body, 0),
            },
            MessageKind::Shutdown
            | MessageKind::ChangeRunlevel
            | MessageKind::Heartbeat
            | MessageKind::HwwdKick
            | MessageKind::Idle
            | MessageKind::TimerExpired => {
                return Err(DevStateError::Malformed(format!(
                    "internal message type 0x{type_id:08x} from outside"
                )));
            }
        };

        Ok((message, size))
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    read_u32(buf, offset) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_ids_are_unique() {
        let mut ids: Vec<u32> = MessageKind::ALL.iter().map(|k| k.type_id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), MessageKind::ALL.len());
    }

    #[test]
    fn generic_messages_are_header_only() {
        let frame = Message::ShutdownReq.encode();
        assert_eq!(frame.len(), HEADER_SIZE as usize);
        assert_eq!(Message::ShutdownReq.declared_size(), HEADER_SIZE);
    }

    #[test]
    fn flag_message_decodes() {
        let frame = Message::SetChargerState { connected: true }.encode();
        assert_eq!(frame.len(), 16);
        let (msg, size) = Message::decode(&frame).unwrap();
        assert_eq!(msg, Message::SetChargerState { connected: true });
        assert_eq!(size, 16);
    }

    #[test]
    fn extra_strings_extend_line_size_only() {
        let msg = Message::EnterMalf {
            reason: MalfReason::Hardware,
            component: "emmc".to_string(),
            details: "checksum mismatch".to_string(),
        };
        let frame = msg.encode();
        assert_eq!(read_u32(&frame, 0) as usize, frame.len());
        assert_eq!(read_u32(&frame, 4), 16);
        let (decoded, _) = Message::decode(&frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn larger_declared_size_is_reported() {
        let mut frame = Message::SetAlarmState { alarm_set: true }.encode();
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame[0..4].copy_from_slice(&20u32.to_le_bytes());
        frame[4..8].copy_from_slice(&20u32.to_le_bytes());
        let (msg, size) = Message::decode(&frame).unwrap();
        assert_eq!(msg, Message::SetAlarmState { alarm_set: true });
        assert_eq!(size, 20);
    }

    #[test]
    fn short_body_is_rejected() {
        let mut frame = Message::StateQuery.encode();
        frame[8..12].copy_from_slice(&MessageKind::SetBatteryState.type_id().to_le_bytes());
        assert!(matches!(Message::decode(&frame), Err(DevStateError::Malformed(_))));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut frame = Message::StateQuery.encode();
        frame[8..12].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        assert!(matches!(
            Message::decode(&frame),
            Err(DevStateError::UnknownType(0xDEAD_BEEF))
        ));
    }

    #[test]
    fn internal_kinds_are_refused_from_outside() {
        let frame = Message::ChangeRunlevel {
            runlevel: Runlevel::Shutdown,
        }
        .encode();
        assert!(Message::decode(&frame).is_err());
    }

    #[test]
    fn inconsistent_line_size_is_rejected() {
        let mut frame = Message::PowerupReq.encode();
        frame.push(0);
        assert!(Message::decode(&frame).is_err());
    }
}
