//! Pan/tilt and lens actuators attached over a serial JSON-lines bridge.
//!
//! The serial port is async (tokio). The tracking loop is synchronous and
//! runs on its own blocking thread, so each request is driven to completion
//! with [tokio::runtime::Handle::block_on] and bounded by a timeout.

use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::Framed;
use tracing as log;

use mocap_ptz_core::{
    bridge::{
        LensRequest, LensResponse, LensStatus, PanTiltRequest, PanTiltResponse,
        BRIDGE_PROTOCOL_VERSION,
    },
    FloatType,
};

use crate::{
    codec::JsonLinesCodec,
    hardware::{HardwareError, HwResult, LensActuator, PanTiltActuator},
};

const BAUD_RATE: u32 = 115_200;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_RETRY: Duration = Duration::from_millis(200);

/// Requests that can ask for the firmware version.
pub(crate) trait VersionRequest {
    fn version_request() -> Self;
}

/// Responses that can carry the firmware version or a device error.
pub(crate) trait BridgeResponse {
    fn version(&self) -> Option<u16>;
    fn device_error(&self) -> Option<&str>;
}

impl VersionRequest for PanTiltRequest {
    fn version_request() -> Self {
        PanTiltRequest::VersionRequest
    }
}

impl BridgeResponse for PanTiltResponse {
    fn version(&self) -> Option<u16> {
        match self {
            PanTiltResponse::VersionResponse(v) => Some(*v),
            _ => None,
        }
    }
    fn device_error(&self) -> Option<&str> {
        match self {
            PanTiltResponse::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

impl VersionRequest for LensRequest {
    fn version_request() -> Self {
        LensRequest::VersionRequest
    }
}

impl BridgeResponse for LensResponse {
    fn version(&self) -> Option<u16> {
        match self {
            LensResponse::VersionResponse(v) => Some(*v),
            _ => None,
        }
    }
    fn device_error(&self) -> Option<&str> {
        match self {
            LensResponse::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

/// A request/response link to one device.
pub(crate) struct SerialBridge<Req, Resp> {
    port: String,
    handle: tokio::runtime::Handle,
    timeout: Duration,
    framed: Option<Framed<SerialStream, JsonLinesCodec<Req, Resp>>>,
    /// Replies still owed by the device for requests that timed out.
    stale_replies: usize,
}

impl<Req, Resp> SerialBridge<Req, Resp>
where
    Req: Serialize + VersionRequest + std::fmt::Debug,
    Resp: DeserializeOwned + BridgeResponse + std::fmt::Debug,
{
    pub(crate) fn new(port: &str, handle: tokio::runtime::Handle, timeout: Duration) -> Self {
        Self {
            port: port.to_string(),
            handle,
            timeout,
            framed: None,
            stale_replies: 0,
        }
    }

    /// Open the port and check the firmware version.
    fn connect(&mut self) -> HwResult<()> {
        let serial_device = {
            let _guard = self.handle.enter();
            tokio_serial::new(&self.port, BAUD_RATE)
                .open_native_async()
                .map_err(|e| HardwareError::Open {
                    port: self.port.clone(),
                    msg: e.to_string(),
                })?
        };
        let mut framed = Framed::new(serial_device, JsonLinesCodec::<Req, Resp>::default());

        let version = self
            .handle
            .block_on(tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut framed)))
            .map_err(|_| HardwareError::Timeout(HANDSHAKE_TIMEOUT))??;
        if version != BRIDGE_PROTOCOL_VERSION {
            return Err(HardwareError::VersionMismatch {
                expected: BRIDGE_PROTOCOL_VERSION,
                actual: version,
            });
        }
        log::info!("{}: firmware protocol version {version}", self.port);
        self.framed = Some(framed);
        self.stale_replies = 0;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.framed.take().is_some() {
            log::debug!("{}: closed", self.port);
        }
    }

    /// Send one request and wait for its response.
    ///
    /// The device answers every request exactly once, so a reply that
    /// arrives after its request timed out is read and dropped before the
    /// next request is sent.
    fn request(&mut self, req: Req) -> HwResult<Resp> {
        let timeout = self.timeout;
        let framed = self.framed.as_mut().ok_or(HardwareError::NotOpen)?;
        if self.stale_replies > 0 {
            let owed = self.stale_replies;
            let dropped = self
                .handle
                .block_on(discard_stale_replies(framed, owed, timeout));
            if dropped < owed {
                // those replies are lost; drop any partial line with them
                log::debug!("{}: {} replies never arrived", self.port, owed - dropped);
                framed.read_buffer_mut().clear();
            }
            self.stale_replies = 0;
        }
        log::trace!("sending {req:?}");
        let exchange = async {
            framed.send(req).await?;
            let resp = framed.next().await.ok_or(HardwareError::Disconnected)??;
            Ok::<_, HardwareError>(resp)
        };
        let resp = match self
            .handle
            .block_on(tokio::time::timeout(timeout, exchange))
        {
            Ok(resp) => resp?,
            Err(_elapsed) => {
                self.stale_replies += 1;
                return Err(HardwareError::Timeout(timeout));
            }
        };
        if let Some(msg) = resp.device_error() {
            return Err(HardwareError::Device(msg.to_string()));
        }
        Ok(resp)
    }
}

/// Read and drop up to `count` messages, waiting at most `wait` in total.
/// Returns how many were dropped.
async fn discard_stale_replies<S>(stream: &mut S, count: usize, wait: Duration) -> usize
where
    S: Stream + Unpin,
    S::Item: std::fmt::Debug,
{
    let mut dropped = 0;
    let drain = async {
        while dropped < count {
            match stream.next().await {
                Some(msg) => {
                    log::debug!("dropping stale reply {msg:?}");
                    dropped += 1;
                }
                None => break,
            }
        }
    };
    let _ = tokio::time::timeout(wait, drain).await;
    dropped
}

/// Request the version until the device answers. Other messages are
/// discarded; the device may still be sending output from a previous
/// session.
async fn handshake<Req, Resp>(
    framed: &mut Framed<SerialStream, JsonLinesCodec<Req, Resp>>,
) -> HwResult<u16>
where
    Req: Serialize + VersionRequest,
    Resp: DeserializeOwned + BridgeResponse + std::fmt::Debug,
{
    loop {
        framed.send(Req::version_request()).await?;
        let reply = tokio::time::timeout(HANDSHAKE_RETRY, framed.next()).await;
        match reply {
            Err(_elapsed) => continue,
            Ok(None) => return Err(HardwareError::Disconnected),
            Ok(Some(Err(e))) => log::debug!("ignoring undecodable line during handshake: {e}"),
            Ok(Some(Ok(msg))) => match msg.version() {
                Some(version) => return Ok(version),
                None => log::error!("unexpected message: {msg:?}"),
            },
        }
    }
}

// ----------------------------------------------------------------------------

pub(crate) struct SerialPanTilt {
    bridge: SerialBridge<PanTiltRequest, PanTiltResponse>,
}

impl SerialPanTilt {
    pub(crate) fn new(port: &str, handle: tokio::runtime::Handle, timeout: Duration) -> Self {
        Self {
            bridge: SerialBridge::new(port, handle, timeout),
        }
    }

    fn expect_ack(&mut self, req: PanTiltRequest) -> HwResult<()> {
        match self.bridge.request(req)? {
            PanTiltResponse::Ack => Ok(()),
            other => Err(HardwareError::UnexpectedResponse(format!("{other:?}"))),
        }
    }
}

impl PanTiltActuator for SerialPanTilt {
    fn open(&mut self) -> HwResult<()> {
        self.bridge.connect()
    }

    fn close(&mut self) -> HwResult<()> {
        self.bridge.disconnect();
        Ok(())
    }

    fn set_torque(&mut self, enabled: bool) -> HwResult<()> {
        self.expect_ack(PanTiltRequest::SetTorque(enabled))
    }

    fn set_synchronized_angles(&mut self, pan_deg: FloatType, tilt_deg: FloatType) -> HwResult<()> {
        self.expect_ack(PanTiltRequest::SetAngles { pan_deg, tilt_deg })
    }

    fn read_synchronized_angles(&mut self) -> HwResult<(FloatType, FloatType)> {
        match self.bridge.request(PanTiltRequest::ReadAngles)? {
            PanTiltResponse::Angles { pan_deg, tilt_deg } => Ok((pan_deg, tilt_deg)),
            other => Err(HardwareError::UnexpectedResponse(format!("{other:?}"))),
        }
    }
}

pub(crate) struct SerialLens {
    bridge: SerialBridge<LensRequest, LensResponse>,
}

impl SerialLens {
    pub(crate) fn new(port: &str, handle: tokio::runtime::Handle, timeout: Duration) -> Self {
        Self {
            bridge: SerialBridge::new(port, handle, timeout),
        }
    }
}

impl LensActuator for SerialLens {
    fn open(&mut self) -> HwResult<()> {
        self.bridge.connect()
    }

    fn close(&mut self) -> HwResult<()> {
        self.bridge.disconnect();
        Ok(())
    }

    fn move_axis(&mut self, channel: u8, relative_steps: i32) -> HwResult<i32> {
        match self.bridge.request(LensRequest::MoveAxis {
            channel,
            steps: relative_steps,
        })? {
            LensResponse::Position {
                channel: ch,
                position,
            } if ch == channel => Ok(position),
            other => Err(HardwareError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    fn set_absolute_position(&mut self, channel: u8, value: i32) -> HwResult<()> {
        match self.bridge.request(LensRequest::SetAbsolutePosition {
            channel,
            position: value,
        })? {
            LensResponse::Ack => Ok(()),
            other => Err(HardwareError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    fn read_status(&mut self) -> HwResult<LensStatus> {
        match self.bridge.request(LensRequest::ReadStatus)? {
            LensResponse::Status(status) => Ok(status),
            other => Err(HardwareError::UnexpectedResponse(format!("{other:?}"))),
        }
    }
}
