//! Bounds-checked parsing of the RTP fixed header and the one-byte
//! profile extension block, plus the RTCP demux predicate.

use bytes::Buf;
use log::{debug, warn};
use shared::error::{Error, Result};

use crate::extension::{ExtensionMap, ExtensionType, VideoRotation};

/// Size of the mandatory fixed header.
pub const FIXED_HEADER_LENGTH: usize = 12;

const EXPECTED_VERSION: u8 = 2;
const ONE_BYTE_EXTENSION_PROFILE: u16 = 0xBEDE;
const RTCP_MIN_HEADER_LENGTH: usize = 4;
const RTCP_MIN_PARSE_LENGTH: usize = 8;

/// Granularity of the 12-bit playout delay fields.
const PLAYOUT_DELAY_GRANULARITY_MS: i32 = 10;

/// Voice activity flag and level from the audio-level extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioLevel {
    pub voice_activity: bool,
    pub level: u8,
}

/// Minimum and maximum playout delay requested by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayoutDelay {
    pub min_ms: i32,
    pub max_ms: i32,
}

/// Frame boundary and scalability flags from the frame-marking extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMarking {
    pub start_of_frame: bool,
    pub end_of_frame: bool,
    pub independent: bool,
    pub discardable: bool,
    pub base_layer_sync: bool,
    pub temporal_layer_id: u8,
    pub spatial_layer_id: u8,
    pub tl0_pic_idx: u8,
}

/// Decoded profile extensions.
///
/// A field is `None` when the corresponding element was not present in the
/// packet or its id was not bound in the extension map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderExtensions {
    pub transmission_time_offset: Option<i32>,
    /// 24-bit 6.18 fixed-point seconds.
    pub absolute_send_time: Option<u32>,
    pub audio_level: Option<AudioLevel>,
    pub video_rotation: Option<VideoRotation>,
    pub transport_sequence_number: Option<u16>,
    pub playout_delay: Option<PlayoutDelay>,
    pub frame_marking: Option<FrameMarking>,
}

/// Parsed RTP header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
    /// Bytes covered by the fixed header, CSRC list and extension block.
    pub header_length: usize,
    /// Taken from the last byte of the packet when the padding bit is set.
    pub padding_length: usize,
    pub extensions: HeaderExtensions,
}

impl Header {
    /// Parse the fixed header, CSRC list and any one-byte profile
    /// extensions from `raw`.
    ///
    /// Unknown extension ids are skipped. A malformed extension element
    /// abandons the rest of the extension block but keeps the fixed header
    /// valid.
    pub fn unmarshal(raw: &[u8], extension_map: &ExtensionMap) -> Result<Self> {
        if raw.len() < FIXED_HEADER_LENGTH {
            return Err(Error::ErrShortPacket);
        }
        let mut buf = raw;

        let b0 = buf.get_u8();
        if b0 >> 6 != EXPECTED_VERSION {
            return Err(Error::BadVersion);
        }
        let padding = (b0 & 0x20) != 0;
        let has_extension = (b0 & 0x10) != 0;
        let csrc_count = (b0 & 0x0f) as usize;

        let b1 = buf.get_u8();
        let marker = (b1 & 0x80) != 0;
        let payload_type = b1 & 0x7f;

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.remaining() < 4 * csrc_count {
            return Err(Error::ErrShortPacket);
        }
        let mut csrcs = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrcs.push(buf.get_u32());
        }

        let mut header = Header {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrcs,
            header_length: FIXED_HEADER_LENGTH + 4 * csrc_count,
            padding_length: if padding { raw[raw.len() - 1] as usize } else { 0 },
            extensions: HeaderExtensions::default(),
        };

        if has_extension {
            if buf.remaining() < 4 {
                return Err(Error::ErrHeaderSizeInsufficientForExtension);
            }
            let profile = buf.get_u16();
            let extension_length = buf.get_u16() as usize * 4;
            header.header_length += 4;
            if buf.remaining() < extension_length {
                return Err(Error::ErrHeaderSizeInsufficientForExtension);
            }
            if profile == ONE_BYTE_EXTENSION_PROFILE {
                if let Err(err) = parse_one_byte_extensions(
                    &buf[..extension_length],
                    extension_map,
                    &mut header.extensions,
                ) {
                    debug!("extension block abandoned: {err}");
                }
            }
            header.header_length += extension_length;
        }

        if header.header_length + header.padding_length > raw.len() {
            return Err(Error::ErrInconsistentLengths);
        }
        Ok(header)
    }
}

/// Walk the one-byte extension elements in `data`.
///
/// Id 0 is a padding byte, id 15 terminates parsing without failing the
/// packet. Elements whose declared length exceeds the block stop parsing.
fn parse_one_byte_extensions(
    mut data: &[u8],
    extension_map: &ExtensionMap,
    extensions: &mut HeaderExtensions,
) -> Result<()> {
    while let Some((&first, rest)) = data.split_first() {
        let id = first >> 4;
        let len = (first & 0x0f) as usize;
        data = rest;

        if id == 0 {
            // Padding byte, the length nibble is ignored.
            continue;
        }
        if id == 15 {
            debug!("extension id 15 encountered, terminating parsing");
            return Ok(());
        }
        if data.len() < len + 1 {
            warn!(
                "one-byte extension element of {} bytes exceeds {} remaining",
                len + 1,
                data.len()
            );
            return Err(Error::ErrMalformedExtension);
        }

        match extension_map.get(id) {
            None => {
                // Unknown ids are skipped but still consume their bytes.
                debug!("no extension type bound for id {id}, skipping");
            }
            Some(extension_type) => {
                decode_extension(extension_type, len, &data[..len + 1], extensions)?;
            }
        }
        data = &data[len + 1..];
    }
    Ok(())
}

fn decode_extension(
    extension_type: ExtensionType,
    len: usize,
    data: &[u8],
    extensions: &mut HeaderExtensions,
) -> Result<()> {
    match extension_type {
        ExtensionType::TransmissionTimeOffset => {
            if len != 2 {
                warn!("incorrect transmission time offset len: {len}");
                return Err(Error::ErrMalformedExtension);
            }
            extensions.transmission_time_offset = Some(read_i24_be(data));
        }
        ExtensionType::AbsoluteSendTime => {
            if len != 2 {
                warn!("incorrect absolute send time len: {len}");
                return Err(Error::ErrMalformedExtension);
            }
            extensions.absolute_send_time = Some(read_u24_be(data));
        }
        ExtensionType::AudioLevel => {
            if len != 0 {
                warn!("incorrect audio level len: {len}");
                return Err(Error::ErrMalformedExtension);
            }
            extensions.audio_level = Some(AudioLevel {
                voice_activity: (data[0] & 0x80) != 0,
                level: data[0] & 0x7f,
            });
        }
        ExtensionType::VideoRotation => {
            if len != 0 {
                warn!("incorrect video rotation len: {len}");
                return Err(Error::ErrMalformedExtension);
            }
            extensions.video_rotation = Some(VideoRotation::from_cvo_byte(data[0]));
        }
        ExtensionType::TransportSequenceNumber => {
            if len != 1 {
                warn!("incorrect transport sequence number len: {len}");
                return Err(Error::ErrMalformedExtension);
            }
            extensions.transport_sequence_number = Some(u16::from_be_bytes([data[0], data[1]]));
        }
        ExtensionType::PlayoutDelay => {
            if len != 2 {
                warn!("incorrect playout delay len: {len}");
                return Err(Error::ErrMalformedExtension);
            }
            let min = ((data[0] as i32) << 4) | ((data[1] >> 4) as i32);
            let max = (((data[1] & 0x0f) as i32) << 8) | data[2] as i32;
            extensions.playout_delay = Some(PlayoutDelay {
                min_ms: min * PLAYOUT_DELAY_GRANULARITY_MS,
                max_ms: max * PLAYOUT_DELAY_GRANULARITY_MS,
            });
        }
        ExtensionType::FrameMarking => {
            if len != 1 && len != 3 {
                warn!("incorrect frame marking len: {len}");
                return Err(Error::ErrMalformedExtension);
            }
            let mut marking = FrameMarking {
                start_of_frame: (data[0] & 0x80) != 0,
                end_of_frame: (data[0] & 0x40) != 0,
                independent: (data[0] & 0x20) != 0,
                discardable: (data[0] & 0x10) != 0,
                ..Default::default()
            };
            if len == 3 {
                marking.base_layer_sync = (data[0] & 0x08) != 0;
                marking.temporal_layer_id = data[0] & 0x07;
                marking.spatial_layer_id = data[1];
                marking.tl0_pic_idx = data[2];
            }
            extensions.frame_marking = Some(marking);
        }
    }
    Ok(())
}

fn read_u24_be(data: &[u8]) -> u32 {
    ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | data[2] as u32
}

fn read_i24_be(data: &[u8]) -> i32 {
    // Sign-extend the 24-bit value.
    ((read_u24_be(data) << 8) as i32) >> 8
}

/// RTCP fixed-header fields needed by demux layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    pub payload_type: u8,
    pub ssrc: u32,
    pub header_length: usize,
}

/// Returns true if `raw` starts an RTCP compound packet.
///
/// Payload types 193 and 194 are rejected so the demux layer can re-examine
/// the buffer as RTP.
pub fn is_rtcp(raw: &[u8]) -> bool {
    if raw.len() < RTCP_MIN_HEADER_LENGTH {
        return false;
    }
    if raw[0] >> 6 != EXPECTED_VERSION {
        return false;
    }
    match raw[1] {
        192 | 195 | 200..=207 => true,
        193 | 194 => false,
        _ => false,
    }
}

/// Parse the RTCP fixed header.
pub fn parse_rtcp(raw: &[u8]) -> Result<RtcpHeader> {
    if raw.len() < RTCP_MIN_PARSE_LENGTH {
        return Err(Error::ErrShortPacket);
    }
    if raw[0] >> 6 != EXPECTED_VERSION {
        return Err(Error::BadVersion);
    }
    let length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
    Ok(RtcpHeader {
        payload_type: raw[1],
        ssrc: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        header_length: 4 + 4 * length,
    })
}
