//! Loopback control channel
//!
//! Each connection carries a single command byte. `b` (block notify) asks
//! the template loop to refresh right away; anything else is logged and
//! dropped. Nothing is written back.

use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Block-notify command byte
pub const BLOCK_NOTIFY: u8 = b'b';

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Control commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    BlockNotify,
}

impl ControlCommand {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            BLOCK_NOTIFY => Some(Self::BlockNotify),
            _ => None,
        }
    }
}

/// Serve control connections until `shutdown` fires
pub async fn run(
    listener: TcpListener,
    refresh: Arc<Notify>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Control channel listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Control accept failed: {}", e);
                    continue;
                }
            },
        };
        if !peer.ip().is_loopback() {
            warn!(%peer, "Rejected non-loopback control connection");
            continue;
        }
        let refresh = refresh.clone();
        tokio::spawn(async move {
            match read_command(stream).await {
                Some(ControlCommand::BlockNotify) => {
                    debug!(%peer, "Block notify");
                    refresh.notify_one();
                }
                None => {}
            }
        });
    }
    Ok(())
}

async fn read_command(mut stream: TcpStream) -> Option<ControlCommand> {
    let mut byte = [0u8; 1];
    match tokio::time::timeout(READ_TIMEOUT, stream.read_exact(&mut byte)).await {
        Ok(Ok(_)) => {
            let command = ControlCommand::from_byte(byte[0]);
            if command.is_none() {
                warn!("Unknown control command 0x{:02x}", byte[0]);
            }
            command
        }
        Ok(Err(e)) => {
            debug!("Control connection closed early: {}", e);
            None
        }
        Err(_) => {
            debug!("Control connection timed out");
            None
        }
    }
}
