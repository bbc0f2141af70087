//! Per-connection session handling, from the handshake to termination.
//!
//! A session moves through the protocol phases in order: greet (await the
//! 0x00 identification), stream the level, announce spawns, then the play
//! loop. All outbound bytes funnel through a single writer task per peer, so
//! the session's own packets and broadcast fan-out stay FIFO on the wire.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use classic_protocol::packets::{
    BlockUpdateS2c, ChatMessageC2s, ChatMessageS2c, DespawnPlayerS2c, DisconnectS2c, HandshakeC2s,
    LevelDataS2c, LevelFinalizeS2c, LevelInitS2c, PositionC2s, PositionS2c, ServerIdentS2c,
    SetBlockC2s, SpawnPlayerS2c,
};
use classic_protocol::{
    block_to_fixed, encode_packet, ClassicString, Encode, Packet, PacketDecoder, PacketFrame,
    PlayerId, PROTOCOL_VERSION,
};
use classic_world::{Dimensions, LevelSink, WorldError, AIR};
use flume::{Receiver, Sender};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::command;
use crate::policy::SessionPolicy;
use crate::registry::ConnectionId;
use crate::SharedServerState;

const READ_BUF_SIZE: usize = 4096;

/// Outbound packets queued per peer before fan-out declares it dead. Sized
/// so a joiner mid level-stream has room left for concurrent broadcasts.
const OUTGOING_QUEUE_LEN: usize = 4096;

pub(crate) const KICK_INVALID_PACKET: &str = "Invalid packet sequence detected.";
pub(crate) const KICK_ANTI_GRIEF: &str = "Triggered Anti Grief. Slow down!";
pub(crate) const KICK_PACKET_SPAM: &str = "Triggered Packet Spam";

/// Why a session ended.
enum SessionEnd {
    /// Send a 0x0e carrying the reason, then close.
    Kicked(String),
    /// The socket is gone; close silently.
    ClientGone,
}

pub(crate) async fn handle_connection(
    shared: SharedServerState,
    stream: TcpStream,
    remote_addr: SocketAddr,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {e}");
    }

    if let Err(e) = run_session(shared, stream, remote_addr).await {
        // EOF while joining is not very erroneous.
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == ErrorKind::UnexpectedEof {
                return;
            }
        }
        warn!(%remote_addr, "connection ended with error: {e:#}");
    }
}

async fn run_session(
    shared: SharedServerState,
    stream: TcpStream,
    remote_addr: SocketAddr,
) -> anyhow::Result<()> {
    let mut dec = PacketDecoder::new();
    let (mut reader, mut writer) = stream.into_split();

    // Greet: the 0x00 identification must be the first frame.
    let handshake = match read_handshake(&mut dec, &mut reader).await {
        Ok(handshake) => handshake,
        Err(e) => {
            let _ = writer
                .write_all(&disconnect_bytes(KICK_INVALID_PACKET)?)
                .await;
            return Err(e).context("reading handshake");
        }
    };

    let username = handshake.username.as_str().to_owned();
    if username.is_empty() {
        let _ = writer
            .write_all(&disconnect_bytes(KICK_INVALID_PACKET)?)
            .await;
        anyhow::bail!("handshake carried an empty username");
    }
    if handshake.protocol_version != PROTOCOL_VERSION {
        debug!(
            version = handshake.protocol_version,
            "client speaks an unexpected protocol version"
        );
    }
    info!(%remote_addr, name = %username, version = handshake.protocol_version, "player connecting");

    let (out_tx, out_rx) = flume::bounded::<Bytes>(OUTGOING_QUEUE_LEN);
    let (ctl_tx, ctl_rx) = flume::bounded::<String>(1);

    let Some((key, wire_id)) = shared
        .registry()
        .register(username.clone(), out_tx.clone(), ctl_tx)
    else {
        info!(name = %username, "refusing player, server is full");
        let _ = writer.write_all(&disconnect_bytes("Server is full.")?).await;
        return Ok(());
    };

    let writer_task = tokio::spawn(write_loop(writer, out_rx));

    let mut session = Session {
        shared: shared.clone(),
        key,
        wire_id,
        name: username,
        spawn: spawn_position(shared.config().dimensions),
        policy: SessionPolicy::new(
            shared.config().max_edits_per_window,
            shared.config().max_moves_per_window,
        ),
        out: out_tx,
    };

    let end = session.run(&mut dec, &mut reader, ctl_rx).await;

    // Terminating: leave the registry first so fan-out stops targeting this
    // peer, then tell everyone who is left.
    shared.registry().remove(key);
    if let Ok(despawn) = encode_packet(&DespawnPlayerS2c {
        player_id: PlayerId::Assigned(wire_id),
    }) {
        shared.registry().broadcast(&despawn.freeze(), None);
    }
    session.broadcast_system_message(&format!("&e{} left the game", session.name));

    if let SessionEnd::Kicked(reason) = end {
        info!(name = %session.name, reason = %reason, "kicking player");
        if let Ok(bytes) = disconnect_bytes(&format!("Kicked for reason: {reason}")) {
            let _ = session.out.send_async(bytes.freeze()).await;
        }
    }

    info!(name = %session.name, id = session.wire_id, "player left");

    // Dropping the last sender lets the writer drain the queue and close the
    // socket.
    drop(session);
    let _ = writer_task.await;
    Ok(())
}

async fn read_handshake(
    dec: &mut PacketDecoder,
    reader: &mut OwnedReadHalf,
) -> anyhow::Result<HandshakeC2s> {
    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
    loop {
        if let Some(frame) = dec.try_next_packet()? {
            return frame.decode();
        }

        buf.reserve(READ_BUF_SIZE);
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(std::io::Error::from(ErrorKind::UnexpectedEof).into());
        }
        dec.queue_bytes(buf.split());
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, rx: Receiver<Bytes>) {
    while let Ok(bytes) = rx.recv_async().await {
        if let Err(e) = writer.write_all(&bytes).await {
            debug!("error writing data to stream: {e}");
            break;
        }
    }
}

fn disconnect_bytes(reason: &str) -> anyhow::Result<BytesMut> {
    encode_packet(&DisconnectS2c {
        reason: ClassicString::lossy(reason),
    })
}

/// Fixed-point spawn point: the world center, or a safe interior point when
/// the center of a large world does not fit the wire's i16 envelope.
fn spawn_position(dims: Dimensions) -> (i16, i16, i16) {
    let center_x = i32::from(dims.x) / 2;
    let center_z = i32::from(dims.z) / 2;
    if center_x * 32 > i32::from(i16::MAX) || center_z * 32 > i32::from(i16::MAX) {
        (block_to_fixed(512), block_to_fixed(70), block_to_fixed(512))
    } else {
        (
            block_to_fixed(center_x),
            block_to_fixed(i32::from(dims.y) / 2 + 10),
            block_to_fixed(center_z),
        )
    }
}

pub(crate) struct Session {
    shared: SharedServerState,
    key: ConnectionId,
    wire_id: u8,
    name: String,
    /// Fixed-point coordinates where this player appeared, and where
    /// unauthenticated movement snaps back to.
    spawn: (i16, i16, i16),
    policy: SessionPolicy,
    out: Sender<Bytes>,
}

impl Session {
    async fn run(
        &mut self,
        dec: &mut PacketDecoder,
        reader: &mut OwnedReadHalf,
        ctl_rx: Receiver<String>,
    ) -> SessionEnd {
        match self.drive(dec, reader, ctl_rx).await {
            Ok(end) => end,
            Err(e) => {
                for cause in e.chain() {
                    if cause.downcast_ref::<WorldError>().is_some() {
                        error!(name = %self.name, "level streaming failed: {e:#}");
                        return SessionEnd::ClientGone;
                    }
                    if cause.downcast_ref::<std::io::Error>().is_some() {
                        debug!(name = %self.name, "session i/o ended: {e:#}");
                        return SessionEnd::ClientGone;
                    }
                }
                debug!(name = %self.name, "protocol violation: {e:#}");
                SessionEnd::Kicked(KICK_INVALID_PACKET.to_owned())
            }
        }
    }

    async fn drive(
        &mut self,
        dec: &mut PacketDecoder,
        reader: &mut OwnedReadHalf,
        ctl_rx: Receiver<String>,
    ) -> anyhow::Result<SessionEnd> {
        let config = self.shared.config();
        self.send_packet(&ServerIdentS2c {
            protocol_version: PROTOCOL_VERSION,
            server_name: ClassicString::lossy(&config.server_name),
            motd: ClassicString::lossy(&config.motd),
            user_type: 0,
        })
        .await?;

        self.stream_level().await?;
        self.announce_spawn().await?;
        self.play(dec, reader, ctl_rx).await
    }

    /// Streams the gzipped level: init, the 0x03 chunk train, then finalize
    /// with the world dimensions.
    async fn stream_level(&self) -> anyhow::Result<()> {
        self.send_packet(&LevelInitS2c).await?;

        // The expansion walks the file on a blocking thread. Chunks flow
        // through the peer's bounded write queue, so a slow client applies
        // backpressure instead of buffering the level in memory.
        let shared = self.shared.clone();
        let tx = self.out.clone();
        tokio::task::spawn_blocking(move || {
            let mut sink = QueueSink { tx };
            shared.world().stream_level(&mut sink)
        })
        .await
        .context("level streaming task failed")??;

        let dims = self.shared.config().dimensions;
        self.send_packet(&LevelFinalizeS2c {
            x: dims.x as i16,
            y: dims.y as i16,
            z: dims.z as i16,
        })
        .await?;
        Ok(())
    }

    async fn announce_spawn(&self) -> anyhow::Result<()> {
        let (spawn_x, spawn_y, spawn_z) = self.spawn;
        let name = ClassicString::lossy(&self.name);

        // Everyone else learns about the new player first, then the player
        // sees themselves, then every peer that was already here.
        self.broadcast_packet(
            &SpawnPlayerS2c {
                player_id: PlayerId::Assigned(self.wire_id),
                name: name.clone(),
                x: spawn_x,
                y: spawn_y,
                z: spawn_z,
                yaw: 0,
                pitch: 0,
            },
            Some(self.key),
        );
        self.send_packet(&SpawnPlayerS2c {
            player_id: PlayerId::Own,
            name,
            x: spawn_x,
            y: spawn_y,
            z: spawn_z,
            yaw: 0,
            pitch: 0,
        })
        .await?;
        for (peer_id, peer_name) in self.shared.registry().others(self.key) {
            self.send_packet(&SpawnPlayerS2c {
                player_id: PlayerId::Assigned(peer_id),
                name: ClassicString::lossy(&peer_name),
                x: spawn_x,
                y: spawn_y,
                z: spawn_z,
                yaw: 0,
                pitch: 0,
            })
            .await?;
        }

        self.broadcast_system_message(&format!("&e{} joined the game", self.name));
        self.system_message("&ePlease /login <password> or /register <password>")
            .await?;

        info!(name = %self.name, id = self.wire_id, "player spawned");
        Ok(())
    }

    async fn play(
        &mut self,
        dec: &mut PacketDecoder,
        reader: &mut OwnedReadHalf,
        ctl_rx: Receiver<String>,
    ) -> anyhow::Result<SessionEnd> {
        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
        loop {
            while let Some(frame) = dec.try_next_packet()? {
                if let Some(end) = self.dispatch(&frame).await? {
                    return Ok(end);
                }
            }

            buf.reserve(READ_BUF_SIZE);
            tokio::select! {
                reason = ctl_rx.recv_async() => {
                    return Ok(match reason {
                        Ok(reason) => SessionEnd::Kicked(reason),
                        // Evicted by fan-out; the socket is as good as gone.
                        Err(_) => SessionEnd::ClientGone,
                    });
                }
                read = reader.read_buf(&mut buf) => {
                    if read? == 0 {
                        return Ok(SessionEnd::ClientGone);
                    }
                    dec.queue_bytes(buf.split());
                }
            }
        }
    }

    async fn dispatch(&mut self, frame: &PacketFrame) -> anyhow::Result<Option<SessionEnd>> {
        let now = Instant::now();
        match frame.id {
            HandshakeC2s::ID => {
                warn!(name = %self.name, "ignoring repeated handshake");
                Ok(None)
            }
            SetBlockC2s::ID => {
                let pkt: SetBlockC2s = frame.decode()?;
                // Destroying emits air no matter which block byte came along.
                let block = if pkt.mode == 1 { pkt.block } else { AIR };
                if self.shared.world().set_block(pkt.x, pkt.y, pkt.z, block) {
                    if self.policy.note_edit(now) {
                        return Ok(Some(SessionEnd::Kicked(KICK_ANTI_GRIEF.to_owned())));
                    }
                    self.broadcast_packet(
                        &BlockUpdateS2c {
                            x: pkt.x,
                            y: pkt.y,
                            z: pkt.z,
                            block,
                        },
                        None,
                    );
                }
                Ok(None)
            }
            PositionC2s::ID => {
                let pkt: PositionC2s = frame.decode()?;
                if self.policy.note_move(now) {
                    return Ok(Some(SessionEnd::Kicked(KICK_PACKET_SPAM.to_owned())));
                }
                if !self.shared.registry().is_authenticated(self.key) {
                    // Movement is gated on login: snap the player back and
                    // tell nobody else.
                    let (spawn_x, spawn_y, spawn_z) = self.spawn;
                    self.send_packet(&PositionS2c {
                        player_id: PlayerId::Own,
                        x: spawn_x,
                        y: spawn_y,
                        z: spawn_z,
                        yaw: 0,
                        pitch: 0,
                    })
                    .await?;
                    return Ok(None);
                }
                self.broadcast_packet(
                    &PositionS2c {
                        player_id: PlayerId::Assigned(self.wire_id),
                        x: pkt.x,
                        y: pkt.y,
                        z: pkt.z,
                        yaw: pkt.yaw,
                        pitch: pkt.pitch,
                    },
                    Some(self.key),
                );
                Ok(None)
            }
            ChatMessageC2s::ID => {
                let pkt: ChatMessageC2s = frame.decode()?;
                let message = pkt.message.as_str().to_owned();
                if message.is_empty() {
                    return Ok(None);
                }

                let authenticated = self.shared.registry().is_authenticated(self.key);
                if !authenticated
                    && !(message.starts_with("/login") || message.starts_with("/register"))
                {
                    self.system_message("&cLogin to chat!").await?;
                    return Ok(None);
                }

                if message.starts_with('/') {
                    info!(name = %self.name, command = %message, "command");
                    command::dispatch(self, &message).await?;
                } else {
                    info!(name = %self.name, message = %message, "chat");
                    self.broadcast_system_message(&format!("&f<{}> {message}", self.name));
                }
                Ok(None)
            }
            id => anyhow::bail!("unhandled inbound packet id {id:#04x}"),
        }
    }

    /// Queues one packet onto this peer's own wire.
    pub(crate) async fn send_packet<P>(&self, pkt: &P) -> anyhow::Result<()>
    where
        P: Packet + Encode,
    {
        let bytes = encode_packet(pkt)?.freeze();
        self.out
            .send_async(bytes)
            .await
            .map_err(|_| std::io::Error::from(ErrorKind::BrokenPipe).into())
    }

    /// Fans one packet out to every peer, minus `exclude`. Encoding failures
    /// are logged and dropped; fan-out itself cannot fail.
    fn broadcast_packet<P>(&self, pkt: &P, exclude: Option<ConnectionId>)
    where
        P: Packet + Encode,
    {
        match encode_packet(pkt) {
            Ok(bytes) => self.shared.registry().broadcast(&bytes.freeze(), exclude),
            Err(e) => warn!("failed to encode broadcast '{}': {e:#}", P::NAME),
        }
    }

    /// A server chat line to this peer alone.
    pub(crate) async fn system_message(&self, text: &str) -> anyhow::Result<()> {
        self.send_packet(&ChatMessageS2c {
            player_id: PlayerId::Own,
            message: ClassicString::lossy(text),
        })
        .await
    }

    /// A server chat line to everyone, this peer included.
    pub(crate) fn broadcast_system_message(&self, text: &str) {
        self.broadcast_packet(
            &ChatMessageS2c {
                player_id: PlayerId::Own,
                message: ClassicString::lossy(text),
            },
            None,
        );
    }

    pub(crate) fn shared(&self) -> &SharedServerState {
        &self.shared
    }

    pub(crate) fn key(&self) -> ConnectionId {
        self.key
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

struct QueueSink {
    tx: Sender<Bytes>,
}

impl LevelSink for QueueSink {
    fn chunk(&mut self, data: &[u8], percent: u8) -> std::io::Result<()> {
        let bytes = encode_packet(&LevelDataS2c {
            data: data.to_vec(),
            percent,
        })
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
        self.tx
            .send(bytes.freeze())
            .map_err(|_| std::io::Error::from(ErrorKind::BrokenPipe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_worlds_spawn_at_the_center() {
        assert_eq!(
            spawn_position(Dimensions::new(128, 64, 128)),
            (64 * 32, 42 * 32, 64 * 32)
        );
    }

    #[test]
    fn large_worlds_spawn_at_the_safe_interior_point() {
        assert_eq!(
            spawn_position(Dimensions::new(2560, 128, 2560)),
            (512 * 32, 70 * 32, 512 * 32)
        );
    }
}
