//! Identification of negotiated RTP header extensions.

use shared::error::{Error, Result};

/// Profile-defined extension types carried in the one-byte extension header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionType {
    TransmissionTimeOffset,
    AudioLevel,
    AbsoluteSendTime,
    VideoRotation,
    TransportSequenceNumber,
    PlayoutDelay,
    FrameMarking,
}

/// Video rotation signaled by the coordination-of-video-orientation byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoRotation {
    #[default]
    Degrees0,
    Degrees90,
    Degrees180,
    Degrees270,
}

impl VideoRotation {
    /// Only the two rotation bits of the CVO byte are examined; the camera
    /// and flip bits are ignored.
    pub fn from_cvo_byte(b: u8) -> Self {
        match b & 0b11 {
            0 => VideoRotation::Degrees0,
            1 => VideoRotation::Degrees90,
            2 => VideoRotation::Degrees180,
            _ => VideoRotation::Degrees270,
        }
    }
}

/// Maps negotiated extension ids to their types.
///
/// The map is owned by the caller; [`Header::unmarshal`](crate::header::Header::unmarshal)
/// only looks ids up. Ids 0 and 15 are reserved by the one-byte header
/// format and cannot be bound.
#[derive(Debug, Clone, Default)]
pub struct ExtensionMap {
    types: [Option<ExtensionType>; 15],
}

impl ExtensionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `id` to `extension_type`. Valid ids are 1..=14.
    pub fn register(&mut self, id: u8, extension_type: ExtensionType) -> Result<()> {
        if !(1..=14).contains(&id) {
            return Err(Error::ErrRfc8285oneByteHeaderIdrange);
        }
        self.types[id as usize] = Some(extension_type);
        Ok(())
    }

    pub fn deregister(&mut self, id: u8) {
        if (1..=14).contains(&id) {
            self.types[id as usize] = None;
        }
    }

    pub fn get(&self, id: u8) -> Option<ExtensionType> {
        if (1..=14).contains(&id) {
            self.types[id as usize]
        } else {
            None
        }
    }
}
