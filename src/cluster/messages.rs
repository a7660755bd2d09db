// src/cluster/messages.rs

//! Wire messages exchanged between nodes and their binary codec.
//!
//! Every message is a fixed little-endian header followed by a payload:
//! - 2 bytes: magic (`0x5457`)
//! - 1 byte: kind
//! - 4 bytes: sender node
//! - 4 bytes: message id (per sender)
//! - 4 bytes: payload length
//! - N bytes: payload

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::cluster::offloading::SatisfiabilityInfo;
use crate::dependencies::access::{AccessSpec, AccessType};
use crate::dependencies::reduction::ReductionOperatorId;
use crate::errors::{Result, TaskweaveError};
use crate::region::Region;
use crate::types::{NodeId, WriteId, location_from_wire, location_to_wire};

pub const MESSAGE_MAGIC: u16 = 0x5457;
pub const MESSAGE_HEADER_SIZE: usize = 15;

const NO_OPERATOR: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    TaskNew = 1,
    Satisfiability = 2,
    TaskFinished = 3,
    ReleaseAccess = 4,
    Dmalloc = 5,
    Dfree = 6,
    SysFinish = 7,
}

impl MessageKind {
    pub fn from_wire(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => MessageKind::TaskNew,
            2 => MessageKind::Satisfiability,
            3 => MessageKind::TaskFinished,
            4 => MessageKind::ReleaseAccess,
            5 => MessageKind::Dmalloc,
            6 => MessageKind::Dfree,
            7 => MessageKind::SysFinish,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::TaskNew => "TASK_NEW",
            MessageKind::Satisfiability => "SATISFIABILITY",
            MessageKind::TaskFinished => "TASK_FINISHED",
            MessageKind::ReleaseAccess => "RELEASE_ACCESS",
            MessageKind::Dmalloc => "DMALLOC",
            MessageKind::Dfree => "DFREE",
            MessageKind::SysFinish => "SYS_FINISH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub sender: NodeId,
    pub id: u32,
}

/// Everything the remote node needs to rebuild an offloaded task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNewPayload {
    /// Id of the task on the offloader.
    pub offloaded_id: u64,
    pub label: String,
    pub implementation: String,
    pub accesses: Vec<AccessSpec>,
    /// One entry per access, in the same order.
    pub infos: Vec<SatisfiabilityInfo>,
    pub args: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    TaskNew(TaskNewPayload),
    Satisfiability {
        offloaded_id: u64,
        info: SatisfiabilityInfo,
    },
    TaskFinished {
        offloaded_id: u64,
    },
    ReleaseAccess {
        offloaded_id: u64,
        region: Region,
        write_id: WriteId,
        location: Option<NodeId>,
    },
    Dmalloc {
        region: Region,
        distributed: bool,
    },
    Dfree {
        region: Region,
    },
    SysFinish,
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::TaskNew(_) => MessageKind::TaskNew,
            MessagePayload::Satisfiability { .. } => MessageKind::Satisfiability,
            MessagePayload::TaskFinished { .. } => MessageKind::TaskFinished,
            MessagePayload::ReleaseAccess { .. } => MessageKind::ReleaseAccess,
            MessagePayload::Dmalloc { .. } => MessageKind::Dmalloc,
            MessagePayload::Dfree { .. } => MessageKind::Dfree,
            MessagePayload::SysFinish => MessageKind::SysFinish,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: MessagePayload,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    pub fn sender(&self) -> NodeId {
        self.header.sender
    }

    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        encode_payload(&self.payload, &mut payload);

        let mut out = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
        out.put_u16_le(MESSAGE_MAGIC);
        out.put_u8(self.header.kind as u8);
        out.put_u32_le(self.header.sender as u32);
        out.put_u32_le(self.header.id);
        out.put_u32_le(payload.len() as u32);
        out.extend_from_slice(&payload);
        out.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Message> {
        if bytes.len() < MESSAGE_HEADER_SIZE {
            return Err(codec(format!("truncated header ({} bytes)", bytes.len())));
        }
        let magic = bytes.get_u16_le();
        if magic != MESSAGE_MAGIC {
            return Err(codec(format!("bad magic {magic:#06x}")));
        }
        let raw_kind = bytes.get_u8();
        let kind = MessageKind::from_wire(raw_kind)
            .ok_or_else(|| codec(format!("unknown message kind {raw_kind}")))?;
        let sender = bytes.get_u32_le() as NodeId;
        let id = bytes.get_u32_le();
        let len = bytes.get_u32_le() as usize;
        if bytes.len() != len {
            return Err(codec(format!(
                "{} payload of {len} bytes has {} bytes",
                kind.name(),
                bytes.len()
            )));
        }
        let mut reader = Reader { bytes };
        let payload = decode_payload(kind, &mut reader)?;
        if reader.bytes.has_remaining() {
            return Err(codec(format!(
                "{} payload has {} trailing bytes",
                kind.name(),
                reader.bytes.remaining()
            )));
        }
        Ok(Message {
            header: MessageHeader { kind, sender, id },
            payload,
        })
    }
}

/// Per-sender message id counter.
#[derive(Debug, Default)]
pub struct MessageIdAllocator {
    next: AtomicU32,
}

impl MessageIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Stamp a payload with a fresh header from `sender`.
    pub fn message(&self, sender: NodeId, payload: MessagePayload) -> Message {
        Message {
            header: MessageHeader {
                kind: payload.kind(),
                sender,
                id: self.next_id(),
            },
            payload,
        }
    }
}

fn codec(msg: String) -> TaskweaveError {
    TaskweaveError::Codec(msg)
}

fn put_region(out: &mut BytesMut, region: Region) {
    out.put_u64_le(region.start);
    out.put_u64_le(region.len);
}

fn put_string(out: &mut BytesMut, s: &str) {
    out.put_u32_le(s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn put_info(out: &mut BytesMut, info: &SatisfiabilityInfo) {
    put_region(out, info.region);
    out.put_i32_le(location_to_wire(info.location));
    out.put_u8(u8::from(info.read));
    out.put_u8(u8::from(info.write));
    out.put_u64_le(info.write_id.0);
    match info.namespace_predecessor {
        Some(id) => {
            out.put_u8(1);
            out.put_u64_le(id);
        }
        None => out.put_u8(0),
    }
}

fn put_access(out: &mut BytesMut, access: &AccessSpec) {
    out.put_u8(access.kind as u8);
    put_region(out, access.region);
    out.put_u8(u8::from(access.weak));
    out.put_u32_le(access.reduction.map_or(NO_OPERATOR, |op| op.0));
}

fn encode_payload(payload: &MessagePayload, out: &mut BytesMut) {
    match payload {
        MessagePayload::TaskNew(task) => {
            out.put_u64_le(task.offloaded_id);
            put_string(out, &task.label);
            put_string(out, &task.implementation);
            out.put_u32_le(task.accesses.len() as u32);
            for access in &task.accesses {
                put_access(out, access);
            }
            out.put_u32_le(task.infos.len() as u32);
            for info in &task.infos {
                put_info(out, info);
            }
            out.put_u32_le(task.args.len() as u32);
            out.extend_from_slice(&task.args);
        }
        MessagePayload::Satisfiability { offloaded_id, info } => {
            out.put_u64_le(*offloaded_id);
            put_info(out, info);
        }
        MessagePayload::TaskFinished { offloaded_id } => out.put_u64_le(*offloaded_id),
        MessagePayload::ReleaseAccess {
            offloaded_id,
            region,
            write_id,
            location,
        } => {
            out.put_u64_le(*offloaded_id);
            put_region(out, *region);
            out.put_u64_le(write_id.0);
            out.put_i32_le(location_to_wire(*location));
        }
        MessagePayload::Dmalloc {
            region,
            distributed,
        } => {
            put_region(out, *region);
            out.put_u8(u8::from(*distributed));
        }
        MessagePayload::Dfree { region } => put_region(out, *region),
        MessagePayload::SysFinish => {}
    }
}

/// Bounds-checked view over a payload.
struct Reader {
    bytes: Bytes,
}

impl Reader {
    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.bytes.remaining() < n {
            return Err(codec(format!(
                "truncated payload reading {what} ({} of {n} bytes)",
                self.bytes.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.bytes.get_u8())
    }

    fn bool(&mut self, what: &str) -> Result<bool> {
        match self.u8(what)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(codec(format!("{what}: invalid boolean {other}"))),
        }
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.bytes.get_u32_le())
    }

    fn i32(&mut self, what: &str) -> Result<i32> {
        self.need(4, what)?;
        Ok(self.bytes.get_i32_le())
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        self.need(8, what)?;
        Ok(self.bytes.get_u64_le())
    }

    fn region(&mut self) -> Result<Region> {
        let start = self.u64("region start")?;
        let len = self.u64("region length")?;
        Ok(Region::new(start, len))
    }

    fn blob(&mut self, what: &str) -> Result<Bytes> {
        let len = self.u32(what)? as usize;
        self.need(len, what)?;
        Ok(self.bytes.split_to(len))
    }

    fn string(&mut self, what: &str) -> Result<String> {
        let raw = self.blob(what)?;
        String::from_utf8(raw.to_vec()).map_err(|err| codec(format!("{what}: {err}")))
    }

    fn info(&mut self) -> Result<SatisfiabilityInfo> {
        let region = self.region()?;
        let location = location_from_wire(self.i32("location")?);
        let read = self.bool("read bit")?;
        let write = self.bool("write bit")?;
        let write_id = WriteId(self.u64("write id")?);
        let namespace_predecessor = if self.bool("namespace flag")? {
            Some(self.u64("namespace predecessor")?)
        } else {
            None
        };
        Ok(SatisfiabilityInfo {
            region,
            location,
            read,
            write,
            write_id,
            namespace_predecessor,
        })
    }

    fn access(&mut self) -> Result<AccessSpec> {
        let raw_kind = self.u8("access kind")?;
        let kind = AccessType::from_wire(raw_kind)
            .ok_or_else(|| codec(format!("unknown access kind {raw_kind}")))?;
        let region = self.region()?;
        let weak = self.bool("weak flag")?;
        let operator = self.u32("reduction operator")?;
        Ok(AccessSpec {
            kind,
            region,
            weak,
            reduction: (operator != NO_OPERATOR).then_some(ReductionOperatorId(operator)),
        })
    }

    fn count(&mut self, what: &str, min_item: usize) -> Result<usize> {
        let count = self.u32(what)? as usize;
        // Reject counts the remaining bytes cannot possibly hold before
        // allocating for them.
        self.need(count.saturating_mul(min_item), what)?;
        Ok(count)
    }
}

fn decode_payload(kind: MessageKind, r: &mut Reader) -> Result<MessagePayload> {
    Ok(match kind {
        MessageKind::TaskNew => {
            let offloaded_id = r.u64("offloaded id")?;
            let label = r.string("label")?;
            let implementation = r.string("implementation")?;
            let access_count = r.count("access count", 22)?;
            let accesses = (0..access_count)
                .map(|_| r.access())
                .collect::<Result<Vec<_>>>()?;
            let info_count = r.count("info count", 31)?;
            let infos = (0..info_count)
                .map(|_| r.info())
                .collect::<Result<Vec<_>>>()?;
            let args = r.blob("args")?;
            MessagePayload::TaskNew(TaskNewPayload {
                offloaded_id,
                label,
                implementation,
                accesses,
                infos,
                args,
            })
        }
        MessageKind::Satisfiability => MessagePayload::Satisfiability {
            offloaded_id: r.u64("offloaded id")?,
            info: r.info()?,
        },
        MessageKind::TaskFinished => MessagePayload::TaskFinished {
            offloaded_id: r.u64("offloaded id")?,
        },
        MessageKind::ReleaseAccess => MessagePayload::ReleaseAccess {
            offloaded_id: r.u64("offloaded id")?,
            region: r.region()?,
            write_id: WriteId(r.u64("write id")?),
            location: location_from_wire(r.i32("location")?),
        },
        MessageKind::Dmalloc => MessagePayload::Dmalloc {
            region: r.region()?,
            distributed: r.bool("distributed flag")?,
        },
        MessageKind::Dfree => MessagePayload::Dfree { region: r.region()? },
        MessageKind::SysFinish => MessagePayload::SysFinish,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SatisfiabilityInfo {
        SatisfiabilityInfo {
            region: Region::new(0x1000_0000, 100),
            location: Some(1),
            read: true,
            write: false,
            write_id: WriteId(7),
            namespace_predecessor: Some(42),
        }
    }

    #[test]
    fn task_new_survives_the_wire() {
        let ids = MessageIdAllocator::new();
        let message = ids.message(
            0,
            MessagePayload::TaskNew(TaskNewPayload {
                offloaded_id: 9,
                label: "stencil".into(),
                implementation: "stencil_block".into(),
                accesses: vec![
                    AccessSpec::new(AccessType::ReadWrite, Region::new(0x1000_0000, 100)),
                    AccessSpec::new(AccessType::Read, Region::new(0x1000_0080, 8)).weak(),
                ],
                infos: vec![info()],
                args: Bytes::from_static(b"\x01\x02"),
            }),
        );
        let decoded = Message::decode(message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn ids_increase_per_sender() {
        let ids = MessageIdAllocator::new();
        let a = ids.message(3, MessagePayload::SysFinish);
        let b = ids.message(3, MessagePayload::TaskFinished { offloaded_id: 1 });
        assert_eq!(a.header.sender, 3);
        assert!(b.header.id > a.header.id);
    }

    #[test]
    fn malformed_input_is_a_codec_error() {
        let ids = MessageIdAllocator::new();
        let good = ids
            .message(1, MessagePayload::Satisfiability { offloaded_id: 5, info: info() })
            .encode();

        let truncated = good.slice(..good.len() - 3);
        assert!(matches!(Message::decode(truncated), Err(TaskweaveError::Codec(_))));

        let mut bad_magic = BytesMut::from(&good[..]);
        bad_magic[0] = 0;
        assert!(matches!(Message::decode(bad_magic.freeze()), Err(TaskweaveError::Codec(_))));

        let mut unknown_kind = BytesMut::from(&good[..]);
        unknown_kind[2] = 99;
        assert!(matches!(Message::decode(unknown_kind.freeze()), Err(TaskweaveError::Codec(_))));

        assert!(matches!(Message::decode(Bytes::new()), Err(TaskweaveError::Codec(_))));
    }
}
