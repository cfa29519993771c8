//! Raw Annex B byte-stream container for H.264.
//!
//! SPS/PPS NAL units seen before the first VCL NAL are routed to the
//! header phase; they form the stream's init header. Everything from the
//! first other NAL on is body payload.

use crate::codec::CodecPacket;
use crate::container::{ContainerOutput, MediaContainer};
use crate::error::CodecError;

pub struct AnnexBContainer {
    body_started: bool,
}

impl Default for AnnexBContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnexBContainer {
    pub fn new() -> Self {
        Self {
            body_started: false,
        }
    }

    fn is_parameter_set(nal: &[u8]) -> bool {
        !nal.is_empty() && matches!(nal[0] & 0x1F, 7 | 8)
    }
}

/// Iterates Annex B NAL units as `(start_code, nal_bytes)` slices.
fn split_nals(data: &[u8]) -> Vec<(usize, usize)> {
    let mut units = Vec::new();
    let mut i = 0;
    let mut start = None;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && (data[i + 2] == 1 || (i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1)) {
            let code_len = if data[i + 2] == 1 { 3 } else { 4 };
            if let Some(s) = start {
                units.push((s, i));
            }
            start = Some(i);
            i += code_len;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        units.push((s, data.len()));
    }
    units
}

/// Offset of the NAL header byte within one start-code-prefixed unit.
fn nal_payload_offset(unit: &[u8]) -> usize {
    if unit.len() >= 4 && unit[2] == 0 {
        4
    } else {
        3
    }
}

impl MediaContainer for AnnexBContainer {
    fn write_header(&mut self, _out: &mut dyn ContainerOutput) -> Result<(), CodecError> {
        // Parameter sets travel in the first encoded access unit; nothing is
        // known before that.
        Ok(())
    }

    fn write_packet(
        &mut self,
        packet: &CodecPacket,
        out: &mut dyn ContainerOutput,
    ) -> Result<(), CodecError> {
        if self.body_started {
            out.on_packet(&packet.data);
            return Ok(());
        }

        let mut body = Vec::new();
        for (start, end) in split_nals(&packet.data) {
            let unit = &packet.data[start..end];
            let nal = &unit[nal_payload_offset(unit)..];
            // Leading parameter sets form the init header; the first other
            // NAL (VCL slice, SEI, ...) and everything after it is body.
            if body.is_empty() && Self::is_parameter_set(nal) {
                out.on_header(unit);
            } else {
                body.extend_from_slice(unit);
            }
        }
        if !body.is_empty() {
            self.body_started = true;
            out.on_packet(&body);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::CollectingOutput;

    fn nal(nal_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut unit = vec![0, 0, 0, 1, nal_type];
        unit.extend_from_slice(payload);
        unit
    }

    fn packet(data: Vec<u8>, keyframe: bool) -> CodecPacket {
        CodecPacket {
            data,
            pts: 0,
            keyframe,
        }
    }

    #[test]
    fn parameter_sets_split_into_header_until_first_vcl() {
        let mut container = AnnexBContainer::new();
        let mut out = CollectingOutput::default();

        let mut data = nal(0x67, &[1, 2]); // SPS
        data.extend(nal(0x68, &[3])); // PPS
        data.extend(nal(0x65, &[4, 5, 6])); // IDR slice

        container.write_packet(&packet(data, true), &mut out).unwrap();

        // SPS and PPS arrived as two separate header callbacks.
        assert_eq!(out.header_calls, 2);
        assert_eq!(out.header[..5], [0, 0, 0, 1, 0x67]);
        assert_eq!(out.packets.len(), 1);
        assert_eq!(out.packets[0][4], 0x65);
    }

    #[test]
    fn later_parameter_sets_stay_in_body() {
        let mut container = AnnexBContainer::new();
        let mut out = CollectingOutput::default();

        let mut first = nal(0x67, &[]);
        first.extend(nal(0x68, &[]));
        first.extend(nal(0x65, &[9]));
        container.write_packet(&packet(first, true), &mut out).unwrap();

        // A mid-stream IDR refresh re-sends SPS/PPS inline; the header is
        // sealed so they must pass through as body.
        let mut refresh = nal(0x67, &[]);
        refresh.extend(nal(0x65, &[7]));
        container
            .write_packet(&packet(refresh, true), &mut out)
            .unwrap();

        assert_eq!(out.header_calls, 2);
        assert_eq!(out.packets.len(), 2);
        assert_eq!(out.packets[1][4], 0x67);
    }
}
