//! Tokio codec for framed control events

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::event::{Event, EventName};
use crate::frame::{FrameHeader, MAX_BODY_SIZE};

/// Codec for encoding/decoding control-channel events
#[derive(Debug, Default)]
pub struct EventCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl EventCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for EventCodec {
    type Item = Event;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src) {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let body_len = header.body_length as usize;
        if body_len > MAX_BODY_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: body_len,
                max: MAX_BODY_SIZE,
            });
        }

        if src.len() < header.frame_length() {
            src.reserve(header.frame_length() - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let name_bytes = src.split_to(header.name_length as usize);
        let body = src.split_to(body_len);

        let name = std::str::from_utf8(&name_bytes).map_err(|_| ProtocolError::InvalidEventName)?;
        let name =
            EventName::from_wire(name).ok_or_else(|| ProtocolError::UnknownEvent(name.to_string()))?;

        Event::decode_body(name, &body).map(Some)
    }
}

impl Encoder<Event> for EventCodec {
    type Error = ProtocolError;

    fn encode(&mut self, event: Event, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let name = event.name().as_str();
        let body = event.encode_body()?;

        if body.len() > MAX_BODY_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: body.len(),
                max: MAX_BODY_SIZE,
            });
        }

        // Names are fixed short literals, so the u8 length always fits
        FrameHeader::new(name.len() as u8, body.len() as u32).encode(dst);
        dst.extend_from_slice(name.as_bytes());
        dst.extend_from_slice(&body);

        Ok(())
    }
}
