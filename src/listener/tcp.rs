//! TCP listener: one task per accepted connection, bytes fed to the
//! decoder as they arrive.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::decoder::{ConnMeta, Decoder};
use crate::dispatch::Dispatcher;
use crate::error::ListenerError;

use super::{is_blacklisted, ConnectionDriver, ListenerHandle};

pub async fn spawn(
    port: u16,
    decoder: Arc<dyn Decoder>,
    dispatcher: Arc<Dispatcher>,
    blacklist: Arc<Vec<String>>,
    max_buffer: usize,
) -> Result<ListenerHandle, ListenerError> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let task = tokio::spawn(async move {
        loop {
            let (socket, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, "tcp: accept failed");
                    continue;
                }
            };
            let ip = addr.ip().to_string();
            if is_blacklisted(&ip, &blacklist) {
                tracing::debug!(ip, "tcp: rejecting blacklisted peer");
                continue;
            }
            let decoder = decoder.clone();
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(socket, ip, decoder, dispatcher, max_buffer).await {
                    tracing::warn!(error = %err, "tcp: connection ended with error");
                }
            });
        }
    });
    Ok(ListenerHandle::new(port, task))
}

async fn handle_connection(
    mut socket: TcpStream,
    ip: String,
    decoder: Arc<dyn Decoder>,
    dispatcher: Arc<Dispatcher>,
    max_buffer: usize,
) -> Result<(), ListenerError> {
    let meta = ConnMeta {
        client_ip: ip,
        topic: None,
        sensor_uuid: None,
    };
    let mut driver = ConnectionDriver::new(decoder.as_ref(), &meta, max_buffer)?;
    let mut buf = [0u8; 8192];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        driver.feed(&buf[..n], &dispatcher).await?;
    }
    driver.finish(&dispatcher).await
}
