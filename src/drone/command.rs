use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::util::strip_noise;

/// Enters the vehicle's SDK (command) mode.
pub const CONTROL_MODE: &str = "command";
pub const TAKEOFF: &str = "takeoff";
pub const LAND: &str = "land";

const MAX_REPLY: usize = 1518;

#[derive(Debug)]
pub enum CommandError {
    /// No reply from the vehicle within the exchange deadline.
    Timeout { command: String, after: Duration },
    Io(io::Error),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Timeout { command, after } => {
                write!(f, "no reply to {:?} within {:?}", command, after)
            }
            CommandError::Io(e) => write!(f, "command transport error: {}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Io(e) => Some(e),
            CommandError::Timeout { .. } => None,
        }
    }
}

impl From<io::Error> for CommandError {
    fn from(e: io::Error) -> Self {
        CommandError::Io(e)
    }
}

/// How the vehicle answered a command.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum Acknowledgement {
    Accepted,
    Rejected(String),
}

impl Acknowledgement {
    pub fn classify(response: &str) -> Self {
        if response.trim().eq_ignore_ascii_case("ok") {
            Acknowledgement::Accepted
        } else {
            Acknowledgement::Rejected(response.to_string())
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Acknowledgement::Accepted)
    }
}

/// Request/response link to the vehicle.
///
/// One command is in flight at a time; `send` borrows the channel mutably so
/// the single-owner rule holds at compile time.
pub struct CommandChannel {
    socket: UdpSocket,
    peer: SocketAddr,
    reply_timeout: Duration,
}

impl CommandChannel {
    pub async fn open(
        bind: SocketAddr,
        peer: SocketAddr,
        reply_timeout: Duration,
    ) -> Result<Self, CommandError> {
        let socket = UdpSocket::bind(bind).await?;
        info!(
            "Command channel bound to {} targeting {}",
            socket.local_addr()?,
            peer
        );
        Ok(Self::from_socket(socket, peer, reply_timeout))
    }

    pub fn from_socket(socket: UdpSocket, peer: SocketAddr, reply_timeout: Duration) -> Self {
        Self {
            socket,
            peer,
            reply_timeout,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one command and wait for the vehicle's reply.
    pub async fn send(&mut self, command: &str) -> Result<String, CommandError> {
        self.drain_stale()?;

        info!("Sending command \"{}\"", command);
        self.socket.send_to(command.as_bytes(), self.peer).await?;

        let response = timeout(self.reply_timeout, self.recv_reply())
            .await
            .map_err(|_| CommandError::Timeout {
                command: command.to_string(),
                after: self.reply_timeout,
            })??;

        info!("Response to \"{}\": {}", command, response);
        Ok(response)
    }

    /// Send a command whose reply is a plain `ok`/`error`.
    pub async fn request(&mut self, command: &str) -> Result<Acknowledgement, CommandError> {
        let response = self.send(command).await?;
        let ack = Acknowledgement::classify(&response);
        if let Acknowledgement::Rejected(reply) = &ack {
            warn!("Vehicle rejected \"{}\": {}", command, reply);
        }
        Ok(ack)
    }

    async fn recv_reply(&self) -> Result<String, CommandError> {
        let mut buf = [0u8; MAX_REPLY];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if from != self.peer {
                debug!("Ignoring {} bytes from unexpected sender {}", len, from);
                continue;
            }
            return Ok(strip_noise(&buf[..len]));
        }
    }

    /// Discard replies that arrived after an earlier exchange gave up.
    fn drain_stale(&self) -> Result<(), CommandError> {
        let mut buf = [0u8; MAX_REPLY];
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((len, from)) => {
                    debug!(
                        "Discarding stale reply from {}: {}",
                        from,
                        strip_noise(&buf[..len])
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}
