//! The typed application messages carried over a session's channels.
//!
//! The transport layer frames and moves these without interpreting them - the variants exist so
//!  that inbound bytes are handed to the application as structured values rather than raw
//!  buffers. Serialization is deliberately simple: a one-byte kind discriminator, then
//!  varint-encoded fields.

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    Control = 0,
    Event = 1,
    Video = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    /// session control directives
    Control(ControlMessage),
    /// input events
    Event(EventMessage),
    /// legacy single-stream video payload
    Video(VideoPacket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum ControlKind {
    InitSession = 0,
    SuspendInput = 1,
    ResumeInput = 2,
    EndSession = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    InitSession { protocol_version: u32 },
    SuspendInput,
    ResumeInput,
    EndSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum EventKind {
    Key = 0,
    MouseMove = 1,
    MouseButton = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventMessage {
    Key { keycode: u32, pressed: bool },
    MouseMove { x: i32, y: i32 },
    MouseButton { button: u8, pressed: bool },
}

/// One packet of a video frame. A frame that does not fit a single packet is split, with the
///  first and last packet flagged so the consumer can delimit frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoPacket {
    pub flags: u8,
    pub sequence_number: u32,
    pub data: Bytes,
}

impl VideoPacket {
    pub const FLAG_FIRST_PACKET: u8 = 1;
    pub const FLAG_LAST_PACKET: u8 = 2;
}

impl SessionMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            SessionMessage::Control(_) => MessageKind::Control,
            SessionMessage::Event(_) => MessageKind::Event,
            SessionMessage::Video(_) => MessageKind::Video,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind().into());
        match self {
            SessionMessage::Control(msg) => Self::ser_control(msg, buf),
            SessionMessage::Event(msg) => Self::ser_event(msg, buf),
            SessionMessage::Video(packet) => Self::ser_video(packet, buf),
        }
    }

    fn ser_control(msg: &ControlMessage, buf: &mut BytesMut) {
        match msg {
            ControlMessage::InitSession { protocol_version } => {
                buf.put_u8(ControlKind::InitSession.into());
                buf.put_u32_varint(*protocol_version);
            }
            ControlMessage::SuspendInput => buf.put_u8(ControlKind::SuspendInput.into()),
            ControlMessage::ResumeInput => buf.put_u8(ControlKind::ResumeInput.into()),
            ControlMessage::EndSession => buf.put_u8(ControlKind::EndSession.into()),
        }
    }

    fn ser_event(msg: &EventMessage, buf: &mut BytesMut) {
        match msg {
            EventMessage::Key { keycode, pressed } => {
                buf.put_u8(EventKind::Key.into());
                buf.put_u32_varint(*keycode);
                put_bool(buf, *pressed);
            }
            EventMessage::MouseMove { x, y } => {
                buf.put_u8(EventKind::MouseMove.into());
                buf.put_i32_varint(*x);
                buf.put_i32_varint(*y);
            }
            EventMessage::MouseButton { button, pressed } => {
                buf.put_u8(EventKind::MouseButton.into());
                buf.put_u8(*button);
                put_bool(buf, *pressed);
            }
        }
    }

    fn ser_video(packet: &VideoPacket, buf: &mut BytesMut) {
        buf.put_u8(packet.flags);
        buf.put_u32_varint(packet.sequence_number);
        buf.put_usize_varint(packet.data.len());
        buf.put_slice(&packet.data);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SessionMessage> {
        let kind = MessageKind::try_from_primitive(buf.try_get_u8()?)
            .map_err(|e| anyhow!("unknown message kind: {}", e))?;

        match kind {
            MessageKind::Control => Self::deser_control(buf),
            MessageKind::Event => Self::deser_event(buf),
            MessageKind::Video => Self::deser_video(buf),
        }
    }

    fn deser_control(buf: &mut impl Buf) -> anyhow::Result<SessionMessage> {
        let kind = ControlKind::try_from_primitive(buf.try_get_u8()?)
            .map_err(|e| anyhow!("unknown control directive: {}", e))?;

        let msg = match kind {
            ControlKind::InitSession => ControlMessage::InitSession {
                protocol_version: buf.try_get_u32_varint()?,
            },
            ControlKind::SuspendInput => ControlMessage::SuspendInput,
            ControlKind::ResumeInput => ControlMessage::ResumeInput,
            ControlKind::EndSession => ControlMessage::EndSession,
        };
        Ok(SessionMessage::Control(msg))
    }

    fn deser_event(buf: &mut impl Buf) -> anyhow::Result<SessionMessage> {
        let kind = EventKind::try_from_primitive(buf.try_get_u8()?)
            .map_err(|e| anyhow!("unknown event kind: {}", e))?;

        let msg = match kind {
            EventKind::Key => EventMessage::Key {
                keycode: buf.try_get_u32_varint()?,
                pressed: try_get_bool(buf)?,
            },
            EventKind::MouseMove => EventMessage::MouseMove {
                x: buf.try_get_i32_varint()?,
                y: buf.try_get_i32_varint()?,
            },
            EventKind::MouseButton => EventMessage::MouseButton {
                button: buf.try_get_u8()?,
                pressed: try_get_bool(buf)?,
            },
        };
        Ok(SessionMessage::Event(msg))
    }

    fn deser_video(buf: &mut impl Buf) -> anyhow::Result<SessionMessage> {
        let flags = buf.try_get_u8()?;
        let sequence_number = buf.try_get_u32_varint()?;

        let data_len = buf.try_get_usize_varint()?;
        if buf.remaining() < data_len {
            bail!("video packet declares {} payload bytes but only {} are present", data_len, buf.remaining());
        }
        let data = buf.copy_to_bytes(data_len);

        Ok(SessionMessage::Video(VideoPacket {
            flags,
            sequence_number,
            data,
        }))
    }
}

fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(anyhow!("invalid boolean encoding: {}", b)),
    }
}
