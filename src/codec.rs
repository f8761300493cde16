use std::marker::PhantomData;

use bytes::{buf::Buf, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::codec::{Decoder, Encoder};

#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    #[error("serde JSON error {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("io error {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON representation contained newline")]
    NewlineInData,
}

// -------------------------

/// JSON Lines text format, also called newline-delimited JSON.
///
/// Encodes `Enc` and decodes `Dec`, so one codec serves one end of a
/// request/response link.
pub(crate) struct JsonLinesCodec<Enc, Dec> {
    _phantom: PhantomData<(Enc, Dec)>,
}

impl<Enc, Dec> Default for JsonLinesCodec<Enc, Dec> {
    fn default() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<Enc, Dec: DeserializeOwned> Decoder for JsonLinesCodec<Enc, Dec> {
    type Item = Dec;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(newline_idx) = memchr::memchr(b'\n', &buf[..]) else {
                // wait for the rest of the line
                return Ok(None);
            };
            let line = buf.split_to(newline_idx + 1);
            let line = trim_line(&line[..newline_idx]);
            if line.is_empty() {
                continue;
            }
            // The line has been consumed from `buf` even on error, so bad
            // data is not parsed again.
            return Ok(Some(serde_json::from_slice(line)?));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None => {
                // trailing data without newline is dropped
                buf.advance(buf.remaining());
                Ok(None)
            }
        }
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

// We encode `T` and not `&T` because we do not want to deal with
// the lifetime issues (this is used in async contexts.)
impl<Enc: Serialize, Dec> Encoder<Enc> for JsonLinesCodec<Enc, Dec> {
    type Error = Error;
    fn encode(&mut self, msg: Enc, final_buf: &mut BytesMut) -> Result<(), Self::Error> {
        let mut v = serde_json::to_vec(&msg)?;
        if memchr::memchr2(b'\n', b'\r', &v).is_some() {
            return Err(Error::NewlineInData);
        }
        v.push(b'\n');
        final_buf.extend_from_slice(v.as_slice());
        Ok(())
    }
}
