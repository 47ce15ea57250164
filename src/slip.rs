//! SLIP framing of packets exchanged with the bootloader
//!
//! See https://docs.espressif.com/projects/esptool/en/latest/esp32c3/advanced-topics/serial-protocol.html#low-level-protocol

use std::io::{self, Write};

use crate::error::ConnectionError;

/// SLIP end of packet token
const END: u8 = 0xC0;

/// SLIP escape token
const ESC: u8 = 0xDB;

/// SLIP escaped 0xC0 token
const ESC_END: u8 = 0xDC;

/// SLIP escaped 0xDB token
const ESC_ESC: u8 = 0xDD;

/// Encode a payload as a single SLIP frame
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 8 + 2);
    let mut encoder = SlipEncoder::new(&mut out);
    // Writing into a `Vec` cannot fail.
    let _ = encoder.write_all(payload);
    let _ = encoder.finish();
    out
}

/// Streaming SLIP encoder, escaping everything written through it
#[derive(Debug)]
pub struct SlipEncoder<'a, W: Write> {
    writer: &'a mut W,
    len: usize,
    started: bool,
}

impl<'a, W: Write> SlipEncoder<'a, W> {
    /// Creates a new encoder context
    pub fn new(writer: &'a mut W) -> Self {
        Self {
            writer,
            len: 0,
            started: false,
        }
    }

    fn start(&mut self) -> io::Result<()> {
        if !self.started {
            self.writer.write_all(&[END])?;
            self.len += 1;
            self.started = true;
        }
        Ok(())
    }

    /// Terminate the frame, returning the number of bytes emitted
    pub fn finish(mut self) -> io::Result<usize> {
        self.start()?;
        self.writer.write_all(&[END])?;
        self.len += 1;
        Ok(self.len)
    }
}

impl<W: Write> Write for SlipEncoder<'_, W> {
    /// Writes the given buffer replacing the END and ESC bytes
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.start()?;
        for value in buf.iter() {
            match *value {
                END => {
                    self.writer.write_all(&[ESC, ESC_END])?;
                    self.len += 2;
                }
                ESC => {
                    self.writer.write_all(&[ESC, ESC_ESC])?;
                    self.len += 2;
                }
                _ => {
                    self.writer.write_all(&[*value])?;
                    self.len += 1;
                }
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    AwaitHeader,
    InFrame,
    InEscape,
}

/// SLIP decoder context
///
/// Bytes are fed one at a time with [`SlipDecoder::push`]; a complete frame is
/// returned as soon as its closing delimiter arrives. The decoder keeps its
/// state between calls, so a frame may span any number of reads.
#[derive(Debug)]
pub struct SlipDecoder {
    state: State,
    frame: Vec<u8>,
    discarded: usize,
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self {
            state: State::AwaitHeader,
            frame: Vec::new(),
            discarded: 0,
        }
    }

    /// Drop any partially received frame and wait for the next delimiter
    pub fn reset(&mut self) {
        self.state = State::AwaitHeader;
        self.frame.clear();
        self.discarded = 0;
    }

    /// Feed a single byte into the decoder.
    ///
    /// Bytes seen before a frame delimiter are dropped; once the delimiter
    /// arrives the run of dropped bytes is reported as
    /// [`ConnectionError::InvalidHeader`] and the decoder is already inside the
    /// new frame, so the caller can simply keep pushing. An invalid escape
    /// sequence discards the bytes accumulated so far and decoding continues
    /// inside the frame.
    pub fn push(&mut self, byte: u8) -> Result<Option<Vec<u8>>, ConnectionError> {
        match (self.state, byte) {
            (State::AwaitHeader, END) => {
                self.state = State::InFrame;
                self.frame.clear();
                if self.discarded > 0 {
                    let discarded = std::mem::take(&mut self.discarded);
                    return Err(ConnectionError::InvalidHeader(discarded));
                }
            }
            (State::AwaitHeader, _) => {
                self.discarded += 1;
            }
            // Back to back delimiters carry no frame
            (State::InFrame, END) if self.frame.is_empty() => {}
            (State::InFrame, END) => {
                self.state = State::AwaitHeader;
                return Ok(Some(std::mem::take(&mut self.frame)));
            }
            (State::InFrame, ESC) => {
                self.state = State::InEscape;
            }
            (State::InFrame, _) => {
                self.frame.push(byte);
            }
            (State::InEscape, ESC_END) => {
                self.frame.push(END);
                self.state = State::InFrame;
            }
            (State::InEscape, ESC_ESC) => {
                self.frame.push(ESC);
                self.state = State::InFrame;
            }
            (State::InEscape, _) => {
                self.frame.clear();
                self.state = State::InFrame;
                return Err(ConnectionError::InvalidEscape(byte));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn decode_all(input: &[u8]) -> Vec<Result<Vec<u8>, ConnectionError>> {
        let mut decoder = SlipDecoder::new();
        let mut out = Vec::new();
        for &byte in input {
            match decoder.push(byte) {
                Ok(Some(frame)) => out.push(Ok(frame)),
                Ok(None) => {}
                Err(err) => out.push(Err(err)),
            }
        }
        out
    }

    fn frames(input: &[u8]) -> Vec<Vec<u8>> {
        decode_all(input).into_iter().filter_map(Result::ok).collect()
    }

    #[test]
    fn empty_decode() {
        const INPUT: [u8; 2] = [0xc0, 0xc0];

        assert!(decode_all(&INPUT).is_empty());
    }

    #[test]
    fn simple_decode() {
        const INPUT: [u8; 7] = [0xc0, 0x01, 0x02, 0x03, 0x04, 0x05, 0xc0];
        const DATA: [u8; 5] = [0x01, 0x02, 0x03, 0x04, 0x05];

        assert_eq!(frames(&INPUT), vec![DATA.to_vec()]);
    }

    #[test]
    fn decode_esc_then_esc_end_sequence() {
        const INPUT: [u8; 6] = [0xc0, 0x01, 0xdb, 0xdc, 0x03, 0xc0];
        const DATA: [u8; 3] = [0x01, 0xc0, 0x03];

        assert_eq!(frames(&INPUT), vec![DATA.to_vec()]);
    }

    #[test]
    fn decode_esc_then_esc_esc_sequence() {
        const INPUT: [u8; 6] = [0xc0, 0x01, 0xdb, 0xdd, 0x03, 0xc0];
        const DATA: [u8; 3] = [0x01, 0xdb, 0x03];

        assert_eq!(frames(&INPUT), vec![DATA.to_vec()]);
    }

    #[test]
    fn compound_decode() {
        const INPUT: [u8; 14] = [
            0xc0, 0x01, 0x02, 0x03, 0x04, 0x05, 0xc0, 0xc0, 0x05, 0x06, 0x07, 0x08, 0x09, 0xc0,
        ];
        const DATA_1: [u8; 5] = [0x01, 0x02, 0x03, 0x04, 0x05];
        const DATA_2: [u8; 5] = [0x05, 0x06, 0x07, 0x08, 0x09];

        assert_eq!(frames(&INPUT), vec![DATA_1.to_vec(), DATA_2.to_vec()]);
    }

    #[test]
    fn noise_before_header_is_reported_once() {
        const INPUT: [u8; 9] = [b'e', b't', b's', b'\n', 0xc0, 0x01, 0x02, 0x03, 0xc0];

        let out = decode_all(&INPUT);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Err(ConnectionError::InvalidHeader(4))));
        assert_eq!(out[1].as_ref().ok(), Some(&vec![0x01, 0x02, 0x03]));
    }

    #[test]
    fn resynchronizes_after_joining_mid_frame() {
        // Tail of a frame we started reading too late, then a full frame.
        const INPUT: [u8; 9] = [0x07, 0x08, 0xc0, 0xc0, 0x01, 0x02, 0x03, 0x04, 0xc0];

        let out = decode_all(&INPUT);
        assert!(matches!(out[0], Err(ConnectionError::InvalidHeader(2))));
        assert_eq!(frames(&INPUT), vec![vec![0x01, 0x02, 0x03, 0x04]]);
    }

    #[test]
    fn invalid_escape_restarts_frame() {
        const INPUT: [u8; 7] = [0xc0, 0x01, 0xdb, 0x42, 0x03, 0x04, 0xc0];

        let out = decode_all(&INPUT);
        assert!(matches!(out[0], Err(ConnectionError::InvalidEscape(0x42))));
        assert_eq!(out[1].as_ref().ok(), Some(&vec![0x03, 0x04]));
    }

    #[test]
    fn reset_drops_partial_frame() {
        let mut decoder = SlipDecoder::new();
        for byte in [0xc0, 0x01, 0x02] {
            assert!(decoder.push(byte).unwrap().is_none());
        }
        decoder.reset();
        for byte in [0xc0, 0x09] {
            assert!(decoder.push(byte).unwrap().is_none());
        }
        assert_eq!(decoder.push(0xc0).unwrap(), Some(vec![0x09]));
    }

    #[test]
    fn encode_escapes_special_bytes() {
        assert_eq!(
            encode(&[0x01, 0xc0, 0xdb, 0x02]),
            vec![0xc0, 0x01, 0xdb, 0xdc, 0xdb, 0xdd, 0x02, 0xc0]
        );
        assert_eq!(encode(&[]), vec![0xc0, 0xc0]);
    }

    #[test]
    fn encoded_body_contains_no_delimiters() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        let encoded = encode(&payload);

        let body = &encoded[1..encoded.len() - 1];
        assert!(!body.contains(&END));
        assert!(body
            .iter()
            .enumerate()
            .filter(|(_, &b)| b == ESC)
            .all(|(i, _)| matches!(body.get(i + 1), Some(&ESC_END) | Some(&ESC_ESC))));
    }

    #[test]
    fn round_trip() {
        let payloads: [&[u8]; 5] = [
            &[],
            &[0xc0],
            &[0xdb, 0xdb, 0xc0, 0xdc, 0xdd],
            b"OHAI",
            &[0x00, 0xff, 0xc0, 0x55, 0xdb],
        ];

        for payload in payloads {
            let decoded = frames(&encode(payload));
            if payload.is_empty() {
                assert!(decoded.is_empty());
            } else {
                assert_eq!(decoded, vec![payload.to_vec()]);
            }
        }
    }
}
