//! UDP listener: each datagram is decoded as one independent, non-streaming
//! request (UDP has no connection to accumulate state across).

use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::decoder::{ConnMeta, Decoder};
use crate::dispatch::Dispatcher;
use crate::error::ListenerError;

use super::{is_blacklisted, ConnectionDriver, ListenerHandle};

const MAX_DATAGRAM: usize = 65_536;

pub async fn spawn(
    port: u16,
    decoder: Arc<dyn Decoder>,
    dispatcher: Arc<Dispatcher>,
    blacklist: Arc<Vec<String>>,
    max_buffer: usize,
) -> Result<ListenerHandle, ListenerError> {
    let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, addr) = match socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, "udp: recv failed");
                    continue;
                }
            };
            let ip = addr.ip().to_string();
            if is_blacklisted(&ip, &blacklist) {
                continue;
            }
            let datagram = buf[..n].to_vec();
            let decoder = decoder.clone();
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let meta = ConnMeta {
                    client_ip: ip,
                    topic: None,
                    sensor_uuid: None,
                };
                let mut driver = match ConnectionDriver::new(decoder.as_ref(), &meta, max_buffer) {
                    Ok(driver) => driver,
                    Err(err) => {
                        tracing::warn!(error = %err, "udp: session create failed");
                        return;
                    }
                };
                if let Err(err) = driver.feed(&datagram, &dispatcher).await {
                    tracing::warn!(error = %err, "udp: feed failed");
                    return;
                }
                if let Err(err) = driver.finish(&dispatcher).await {
                    tracing::warn!(error = %err, "udp: finish failed");
                }
            });
        }
    });
    Ok(ListenerHandle::new(port, task))
}
