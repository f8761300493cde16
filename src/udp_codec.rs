use thiserror::Error;

use bytes::{buf::Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use mocap_ptz_core::FloatType;

#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("cbor error {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("io error {0}")]
    Io(#[from] std::io::Error),
}

/// One motion-capture measurement, one per datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct MocapPacket {
    /// Rigid body position in world coordinates (mm)
    pub(crate) position: [FloatType; 3],
    /// Markers seen for the rigid body. Zero means the body was not found.
    pub(crate) marker_count: u32,
}

/// CBOR datagrams from the motion-capture relay.
#[derive(Default)]
pub(crate) struct MocapUdpCodec {}

impl Decoder for MocapUdpCodec {
    type Item = MocapPacket;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            Ok(None)
        } else {
            let msg = match serde_cbor::from_slice(&buf[..]) {
                Ok(msg) => msg,
                Err(e) => {
                    // Advance past the bad datagram so it is not parsed again.
                    buf.advance(buf.remaining());
                    return Err(e.into());
                }
            };
            buf.advance(buf.len());
            Ok(Some(msg))
        }
    }
}

// We encode `T` and not `&T` because we do not want to deal with
// the lifetime issues (this is used in async contexts.)
impl Encoder<MocapPacket> for MocapUdpCodec {
    type Error = Error;
    fn encode(&mut self, msg: MocapPacket, final_buf: &mut BytesMut) -> Result<(), Self::Error> {
        let v = serde_cbor::to_vec(&msg)?;
        final_buf.extend_from_slice(v.as_slice());
        Ok(())
    }
}

#[test]
fn test_bad_datagram_is_skipped() {
    let mut codec = MocapUdpCodec::default();
    let mut buf = BytesMut::from(&b"\xff\xff not cbor"[..]);
    assert!(codec.decode(&mut buf).is_err());
    assert!(buf.is_empty());
}
