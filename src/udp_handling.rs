use std::time::Duration;

use color_eyre::eyre::{self, Result};
use futures::StreamExt;
use nalgebra::Vector3;
use tokio_util::{sync::CancellationToken, udp::UdpFramed};
use tracing as log;

use crate::{mocap::MocapPublisher, udp_codec::MocapUdpCodec};

/// Open UDP socket for [MocapUdpCodec] messages from the network.
///
/// The opened socket receives unicast messages from the motion-capture
/// relay.
pub(crate) async fn setup_udp<A>(udp_addr: A) -> Result<UdpFramed<MocapUdpCodec>>
where
    A: tokio::net::ToSocketAddrs + std::fmt::Display + Clone,
{
    use eyre::WrapErr;

    let udp_socket = tokio::net::UdpSocket::bind(udp_addr.clone())
        .await
        .with_context(|| format!("When binding UDP address \"{}\"", udp_addr))?;

    let udp_src_addr = udp_socket.local_addr()?;
    if let Some(sock_addrs) = all_addrs(udp_src_addr) {
        for sock_addr in sock_addrs.into_iter() {
            log::info!("Using unicast UDP for listening {sock_addr}");
        }
    } else {
        log::info!(
            "Using unspecified unicast UDP for listening {}",
            udp_src_addr
        );
    }

    Ok(UdpFramed::new(udp_socket, MocapUdpCodec::default()))
}

/// Get all socket addresses on all interfaces for which this socket address can
/// be reached.
///
/// If this cannot be determined because it is an IPv6 unspecified address,
/// `None` is returned.
pub(crate) fn all_addrs(orig_addr: std::net::SocketAddr) -> Option<Vec<std::net::SocketAddr>> {
    use std::net::SocketAddr;

    if orig_addr.ip().is_unspecified() {
        let mut ifaces: Vec<_> = if_addrs::get_if_addrs()
            .unwrap_or_else(|e| {
                log::error!("Failed to get local interface addresses: {}", e);
                Default::default()
            })
            .into_iter()
            .filter_map(|iface| match (orig_addr, iface.ip()) {
                (SocketAddr::V4(mut sock_v4), std::net::IpAddr::V4(ipv4)) => {
                    sock_v4.set_ip(ipv4);
                    Some(sock_v4.into())
                }
                _ => None,
            })
            .collect();
        ifaces.sort();
        if ifaces.is_empty() {
            None
        } else {
            Some(ifaces)
        }
    } else {
        Some(vec![orig_addr])
    }
}

/// Receive mocap datagrams and publish each into the latest-value cell.
///
/// Silence longer than `staleness_timeout` marks the target lost. Returns
/// when cancelled or when the reader is gone.
#[tracing::instrument(skip_all)]
pub(crate) async fn run_mocap_udp_loop(
    mut udp_framed: UdpFramed<MocapUdpCodec>,
    publisher: MocapPublisher,
    staleness_timeout: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut n_bad = 0u64;
    loop {
        if publisher.is_closed() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            res = tokio::time::timeout(staleness_timeout, udp_framed.next()) => {
                match res {
                    Err(_elapsed) => {
                        publisher.publish_lost();
                    }
                    Ok(None) => {
                        eyre::bail!("UDP socket closed");
                    }
                    Ok(Some(Ok((packet, _addr)))) => {
                        log::trace!("got mocap packet {packet:?}");
                        publisher.publish(Vector3::from(packet.position), packet.marker_count as usize);
                    }
                    Ok(Some(Err(e))) => {
                        if n_bad == 0 {
                            log::error!("bad mocap datagram: {e}");
                        }
                        n_bad += 1;
                    }
                }
            }
        }
    }
    if n_bad > 0 {
        log::warn!("{n_bad} bad mocap datagrams ignored");
    }
    log::debug!("mocap UDP loop done");
    Ok(())
}
