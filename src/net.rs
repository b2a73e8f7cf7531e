use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

use crate::addr::ClusterAddr;
use crate::error::GridError;
use crate::node::GridMember;
use crate::plan::StabilityProfile;

const HELLO_PREFIX: &str = "HELLO";
const HEARTBEAT_LINE: &[u8] = b"PING\n";

#[derive(Debug)]
/// Membership events emitted by the transport layer.
pub(crate) enum PeerEvent {
    /// A session to the given member completed its hello handshake.
    Joined(GridMember),
    /// A session ended: the remote closed, errored, or went silent past the
    /// heartbeat timeout. This is the transport's own failure detector; the
    /// registry never triggers it.
    Left(ClusterAddr),
}

/// Encodes the hello handshake line broadcast when a session opens.
pub(crate) fn hello_line(member: &GridMember) -> String {
    let mut line = format!(
        "{HELLO_PREFIX} {} {} {}",
        member.instance_id, member.addr, member.role
    );
    if let Some(display) = &member.display_name {
        line.push(' ');
        line.push_str(display);
    }
    line
}

/// Parses a hello handshake line back into a member.
pub(crate) fn parse_hello(line: &str) -> Result<GridMember, GridError> {
    let malformed = || GridError::MalformedAddress(format!("bad hello line: {line:?}"));

    let mut parts = line.splitn(5, ' ');
    if parts.next() != Some(HELLO_PREFIX) {
        return Err(malformed());
    }
    let instance_id = parts.next().ok_or_else(malformed)?;
    let addr = ClusterAddr::parse(parts.next().ok_or_else(malformed)?)?;
    let role = match parts.next() {
        Some("member") => crate::topology::NodeRole::Member,
        Some("client") => crate::topology::NodeRole::Client,
        _ => return Err(malformed()),
    };
    let display_name = parts.next().map(str::to_string);

    Ok(GridMember {
        instance_id: instance_id.to_string(),
        addr,
        role,
        display_name,
    })
}

#[derive(Clone)]
/// A collection of outbound peer sessions which can be reused.
///
/// Dialing an address that already has a session is a no-op. Sessions retry
/// with backoff until explicitly dropped, so a peer that is temporarily down
/// is picked up as soon as it returns.
pub(crate) struct PeerNetwork {
    me: GridMember,
    stability: StabilityProfile,
    events: flume::Sender<PeerEvent>,
    sessions: Arc<Mutex<HashMap<ClusterAddr, Arc<AtomicBool>>>>,
    stop_all: Arc<AtomicBool>,
}

impl PeerNetwork {
    pub(crate) fn new(
        me: GridMember,
        stability: StabilityProfile,
        events: flume::Sender<PeerEvent>,
    ) -> Self {
        Self {
            me,
            stability,
            events,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            stop_all: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Opens an outbound session to the given peer unless one exists.
    pub(crate) fn connect(&self, addr: ClusterAddr) {
        let stop = {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&addr) {
                trace!(addr = %addr, "Session already open, nothing to do.");
                return;
            }
            let stop = Arc::new(AtomicBool::new(false));
            sessions.insert(addr.clone(), stop.clone());
            stop
        };

        let network = self.clone();
        tokio::spawn(async move {
            network.run_outbound(addr.clone(), stop).await;
            network.sessions.lock().remove(&addr);
        });
    }

    /// Drops the outbound session to a peer.
    pub(crate) fn disconnect(&self, addr: &ClusterAddr) {
        if let Some(stop) = self.sessions.lock().remove(addr) {
            stop.store(true, Ordering::Relaxed);
        }
    }

    /// Stops every outbound session. Used on shutdown.
    pub(crate) fn shutdown(&self) {
        self.stop_all.store(true, Ordering::Relaxed);
        let mut sessions = self.sessions.lock();
        for stop in sessions.values() {
            stop.store(true, Ordering::Relaxed);
        }
        sessions.clear();
    }

    async fn run_outbound(&self, addr: ClusterAddr, stop: Arc<AtomicBool>) {
        let mut backoff = Backoff::default();

        loop {
            if self.stopped(&stop) {
                return;
            }

            let attempt = tokio::time::timeout(
                self.stability.connect_timeout,
                TcpStream::connect((addr.host(), addr.port())),
            )
            .await;

            let stream = match attempt {
                Ok(Ok(stream)) => stream,
                Ok(Err(error)) => {
                    debug!(addr = %addr, error = %error, "Peer connect failed.");
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                },
                Err(_) => {
                    debug!(addr = %addr, "Peer connect timed out.");
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                },
            };

            backoff.reset();

            let remote = match self.handshake_outbound(stream, &stop).await {
                Ok(remote) => remote,
                Err(error) => {
                    debug!(addr = %addr, error = %error, "Peer session ended before handshake.");
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                },
            };

            if self.events.send_async(PeerEvent::Left(remote)).await.is_err() {
                return;
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    /// Performs the outbound hello exchange and runs the session until it
    /// dies. Returns the remote's advertised address.
    async fn handshake_outbound(
        &self,
        stream: TcpStream,
        stop: &Arc<AtomicBool>,
    ) -> Result<ClusterAddr, anyhow::Error> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(format!("{}\n", hello_line(&self.me)).as_bytes())
            .await?;

        let line = tokio::time::timeout(self.stability.heartbeat_timeout, lines.next_line())
            .await
            .map_err(|_| anyhow::anyhow!("handshake timed out"))??
            .ok_or_else(|| anyhow::anyhow!("connection closed during handshake"))?;
        let remote = parse_hello(&line)?;
        let remote_addr = remote.addr.clone();

        debug!(
            peer = %remote.instance_id,
            addr = %remote_addr,
            "Outbound grid session established."
        );
        let _ = self.events.send_async(PeerEvent::Joined(remote)).await;

        let result = run_session(lines, write_half, &self.stability, stop).await;
        if let Err(error) = result {
            debug!(addr = %remote_addr, error = %error, "Outbound grid session ended.");
        }
        Ok(remote_addr)
    }

    fn stopped(&self, stop: &Arc<AtomicBool>) -> bool {
        stop.load(Ordering::Relaxed) || self.stop_all.load(Ordering::Relaxed)
    }
}

/// The bound server side of the grid transport.
///
/// Only member-role nodes bind a listener, and only ever to the single
/// planned interface, exclusively. "Any interface" binding is never used.
/// Binding and serving are separate steps: the effective port (the OS picks
/// one when the plan asks for port 0) must be known before the local member
/// identity that the accept loop advertises can be built.
pub(crate) struct GridListener {
    local_port: u16,
    socket: Option<TcpListener>,
    stop: Arc<AtomicBool>,
    closed: Arc<tokio::sync::Notify>,
}

impl GridListener {
    pub(crate) async fn bind(bind_host: &str, port: u16) -> Result<Self, GridError> {
        let listener = TcpListener::bind((bind_host, port)).await?;
        let local_port = listener.local_addr()?.port();
        info!(
            bind_host = %bind_host,
            port = local_port,
            "Grid transport bound to exclusive interface."
        );

        Ok(Self {
            local_port,
            socket: Some(listener),
            stop: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(tokio::sync::Notify::new()),
        })
    }

    /// Starts the accept loop. Connections arriving between bind and serve
    /// wait in the OS backlog.
    pub(crate) fn serve(
        &mut self,
        me: GridMember,
        stability: StabilityProfile,
        events: flume::Sender<PeerEvent>,
    ) {
        let Some(listener) = self.socket.take() else {
            return;
        };

        let accept_stop = self.stop.clone();
        let accept_closed = self.closed.clone();
        tokio::spawn(async move {
            loop {
                if accept_stop.load(Ordering::Relaxed) {
                    return;
                }
                let accepted = tokio::select! {
                    _ = accept_closed.notified() => return,
                    accepted = listener.accept() => accepted,
                };
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(error = %error, "Failed to accept grid connection.");
                        continue;
                    },
                };
                trace!(remote = %remote, "Accepted grid connection.");

                let me = me.clone();
                let events = events.clone();
                let session_stop = accept_stop.clone();
                tokio::spawn(async move {
                    if let Err(error) =
                        run_inbound(stream, me, stability, events, session_stop).await
                    {
                        debug!(remote = %remote, error = %error, "Inbound grid session ended.");
                    }
                });
            }
        });
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.local_port
    }

    pub(crate) fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.closed.notify_waiters();
    }
}

async fn run_inbound(
    stream: TcpStream,
    me: GridMember,
    stability: StabilityProfile,
    events: flume::Sender<PeerEvent>,
    stop: Arc<AtomicBool>,
) -> Result<(), anyhow::Error> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let line = tokio::time::timeout(stability.heartbeat_timeout, lines.next_line())
        .await
        .map_err(|_| anyhow::anyhow!("handshake timed out"))??
        .ok_or_else(|| anyhow::anyhow!("connection closed during handshake"))?;
    let remote = parse_hello(&line)?;
    let remote_addr = remote.addr.clone();

    write_half
        .write_all(format!("{}\n", hello_line(&me)).as_bytes())
        .await?;

    debug!(
        peer = %remote.instance_id,
        addr = %remote_addr,
        role = %remote.role,
        "Inbound grid session established."
    );
    let _ = events.send_async(PeerEvent::Joined(remote)).await;

    let result = run_session(lines, write_half, &stability, &stop).await;
    let _ = events.send_async(PeerEvent::Left(remote_addr)).await;
    result
}

/// Runs the symmetric post-handshake session: both sides send heartbeats on
/// a fixed interval and declare the peer dead after the heartbeat timeout.
async fn run_session(
    mut lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    mut write_half: OwnedWriteHalf,
    stability: &StabilityProfile,
    stop: &Arc<AtomicBool>,
) -> Result<(), anyhow::Error> {
    let mut heartbeat = tokio::time::interval(stability.heartbeat_interval);
    let mut last_seen = tokio::time::Instant::now();

    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        tokio::select! {
            _ = heartbeat.tick() => {
                // Liveness is checked on the send schedule so a silent peer
                // is detected even while we keep writing to it.
                if last_seen.elapsed() > stability.heartbeat_timeout {
                    anyhow::bail!("peer went silent past the heartbeat timeout");
                }
                write_half.write_all(HEARTBEAT_LINE).await?;
            },
            line = lines.next_line() => {
                match line {
                    Ok(Some(_)) => last_seen = tokio::time::Instant::now(),
                    Ok(None) => anyhow::bail!("peer closed the session"),
                    Err(error) => return Err(error.into()),
                }
            },
        }
    }
}

/// Exponential reconnect backoff with jitter, so a fleet of agents does not
/// thunder back onto a recovering core node at once.
struct Backoff {
    delay: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        if cfg!(test) {
            Self {
                delay: Duration::from_millis(100),
                max: Duration::from_secs(1),
            }
        } else {
            Self {
                delay: Duration::from_secs(1),
                max: Duration::from_secs(30),
            }
        }
    }
}

impl Backoff {
    fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        let current = self.delay.mul_f64(jitter);
        self.delay = (self.delay * 3 / 2).min(self.max);
        current
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::NodeRole;

    fn member(id: &str, display: Option<&str>) -> GridMember {
        GridMember {
            instance_id: id.to_string(),
            addr: ClusterAddr::new("10.0.0.1", 9080),
            role: NodeRole::Member,
            display_name: display.map(str::to_string),
        }
    }

    #[test]
    fn hello_round_trip() {
        let me = member("node-1", None);
        let parsed = parse_hello(&hello_line(&me)).unwrap();
        assert_eq!(parsed, me);
    }

    #[test]
    fn hello_round_trip_with_spaced_display_name() {
        let me = member("agent-1", Some("Build Agent One"));
        let parsed = parse_hello(&hello_line(&me)).unwrap();
        assert_eq!(parsed, me);
    }

    #[test]
    fn hello_round_trip_ipv6() {
        let me = GridMember {
            instance_id: "node-v6".to_string(),
            addr: ClusterAddr::new("::1", 5701),
            role: NodeRole::Client,
            display_name: None,
        };
        let parsed = parse_hello(&hello_line(&me)).unwrap();
        assert_eq!(parsed, me);
    }

    #[test]
    fn malformed_hellos_are_rejected() {
        for line in [
            "",
            "PING",
            "HELLO",
            "HELLO node-1",
            "HELLO node-1 10.0.0.1:9080",
            "HELLO node-1 10.0.0.1:9080 admiral",
            "HELLO node-1 not-an-addr member",
        ] {
            assert!(parse_hello(line).is_err(), "{line:?} should be rejected");
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff {
            delay: Duration::from_millis(100),
            max: Duration::from_millis(400),
        };
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.delay, Duration::from_millis(400));
    }
}
