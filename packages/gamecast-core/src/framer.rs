//! Packet framing: the fixed header prefix and the init-header buffer.
//!
//! Each encoder output body is prefixed with `{version, type, size}` and
//! handed to the fan-out. Codec global headers go through [`HeaderBuffer`]
//! instead: the whole header run is framed as ONE packet whose size grows
//! as header-phase callbacks accumulate. Header callbacks never fire once
//! the body phase has begun, which is what makes the buffer safe to read
//! from the session side as soon as the first body packet is visible.

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;

use crate::container::ContainerOutput;
use crate::protocol::{NetPacketHeader, PacketKind};

/// Frames one body as a wire packet.
pub fn frame_packet(kind: PacketKind, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(NetPacketHeader::LEN + body.len());
    NetPacketHeader::new(kind, body.len() as u32).encode(&mut buf);
    buf.extend_from_slice(body);
    buf.freeze()
}

/// Destination of framed packets (the session-manager fan-out).
pub trait PacketSink: Send + Sync {
    /// Queues the packet to every eligible recipient; returns how many.
    fn send(&self, packet: Bytes) -> usize;
}

/// Accumulating init-header buffer, one per encoder.
///
/// The first chunk lays down a packet header; every later chunk appends
/// its bytes and bumps the advertised size, so the buffer always holds a
/// single well-formed packet covering the entire header run.
pub struct HeaderBuffer {
    kind: PacketKind,
    data: RwLock<BytesMut>,
}

impl HeaderBuffer {
    pub fn new(kind: PacketKind) -> Self {
        Self {
            kind,
            data: RwLock::new(BytesMut::new()),
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Appends one header-phase chunk.
    pub fn append(&self, chunk: &[u8]) {
        let mut data = self.data.write();
        if data.is_empty() {
            let mut buf = BytesMut::with_capacity(NetPacketHeader::LEN + chunk.len());
            NetPacketHeader::new(self.kind, chunk.len() as u32).encode(&mut buf);
            buf.extend_from_slice(chunk);
            *data = buf;
        } else {
            let previous = (data.len() - NetPacketHeader::LEN) as u32;
            data.extend_from_slice(chunk);
            NetPacketHeader::patch_size(&mut data[..], previous + chunk.len() as u32);
        }
    }

    /// Snapshot of the framed header run; empty if no header was captured.
    pub fn bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data.read())
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Drops the captured header (encoder teardown).
    pub fn clear(&self) {
        self.data.write().clear();
    }
}

/// Container sink wiring one encoder to its header buffer and the fan-out.
pub struct Framer {
    kind: PacketKind,
    header: std::sync::Arc<HeaderBuffer>,
    sink: std::sync::Arc<dyn PacketSink>,
}

impl Framer {
    pub fn new(
        kind: PacketKind,
        header: std::sync::Arc<HeaderBuffer>,
        sink: std::sync::Arc<dyn PacketSink>,
    ) -> Self {
        Self { kind, header, sink }
    }
}

impl ContainerOutput for Framer {
    fn on_header(&mut self, chunk: &[u8]) {
        self.header.append(chunk);
    }

    fn on_packet(&mut self, packet: &[u8]) {
        self.sink.send(frame_packet(self.kind, packet));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn frame_packet_prefixes_header() {
        let packet = frame_packet(PacketKind::Audio, &[1, 2, 3]);
        let header = NetPacketHeader::decode(&packet).unwrap();
        assert_eq!(header.kind, PacketKind::Audio);
        assert_eq!(header.size, 3);
        assert_eq!(&packet[NetPacketHeader::LEN..], &[1, 2, 3]);
    }

    #[test]
    fn header_buffer_accumulates_into_one_packet() {
        let buffer = HeaderBuffer::new(PacketKind::Video);
        assert!(buffer.is_empty());

        buffer.append(&[0xAA; 10]);
        buffer.append(&[0xBB; 5]);
        buffer.append(&[0xCC; 1]);

        let bytes = buffer.bytes();
        let header = NetPacketHeader::decode(&bytes).unwrap();
        assert_eq!(header.kind, PacketKind::Video);
        assert_eq!(header.size, 16);
        assert_eq!(bytes.len(), NetPacketHeader::LEN + 16);
        assert_eq!(&bytes[NetPacketHeader::LEN..NetPacketHeader::LEN + 10], &[0xAA; 10]);
        assert_eq!(&bytes[NetPacketHeader::LEN + 15..], &[0xCC]);
    }

    #[test]
    fn header_buffer_clear_resets() {
        let buffer = HeaderBuffer::new(PacketKind::Audio);
        buffer.append(&[1, 2]);
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.bytes().is_empty());
    }

    struct Collecting {
        packets: parking_lot::Mutex<Vec<Bytes>>,
    }

    impl PacketSink for Collecting {
        fn send(&self, packet: Bytes) -> usize {
            self.packets.lock().push(packet);
            1
        }
    }

    #[test]
    fn framer_routes_phases() {
        let header = Arc::new(HeaderBuffer::new(PacketKind::Audio));
        let sink = Arc::new(Collecting {
            packets: parking_lot::Mutex::new(Vec::new()),
        });
        let mut framer = Framer::new(PacketKind::Audio, Arc::clone(&header), sink.clone());

        use crate::container::ContainerOutput;
        framer.on_header(&[9, 9]);
        framer.on_packet(&[1, 2, 3, 4]);

        assert_eq!(NetPacketHeader::decode(&header.bytes()).unwrap().size, 2);
        let packets = sink.packets.lock();
        assert_eq!(packets.len(), 1);
        assert_eq!(NetPacketHeader::decode(&packets[0]).unwrap().size, 4);
    }
}
