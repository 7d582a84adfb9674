//! Protocol and timing constants shared across the crate.

use std::time::Duration;

/// Protocol version carried in `client/hello` and `server/hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default WebSocket listen port.
pub const DEFAULT_PORT: u16 = 8927;

/// Default WebSocket upgrade path.
pub const DEFAULT_WS_PATH: &str = "/resonate";

/// mDNS service type advertised by clients (server-initiated flow).
pub const SERVICE_TYPE_CLIENT: &str = "_resonate._tcp.local.";

/// mDNS service type advertised by servers (client-initiated flow).
pub const SERVICE_TYPE_SERVER: &str = "_resonate-server._tcp.local.";

/// Capacity of the per-endpoint outbound frame queue.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Deadline for the writer to drain its queue during close.
pub const CLOSE_DRAIN_DEADLINE: Duration = Duration::from_millis(200);

/// Maximum time to wait for the peer's hello before giving up.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between WebSocket pings on an established endpoint.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// An endpoint that has received nothing for this long is considered dead.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive malformed/unknown frames tolerated before the endpoint
/// is closed with a protocol error.
pub const CODEC_ERROR_CLOSE_THRESHOLD: u32 = 8;

/// Initial reconnect backoff delay.
pub const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_millis(500);

/// Default reconnect backoff ceiling.
pub const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Clock-sync polling interval while the filter is still converging.
pub const CLOCK_POLL_FAST: Duration = Duration::from_secs(1);

/// Clock-sync polling interval once the filter has settled (0.1 Hz).
pub const CLOCK_POLL_SLOW: Duration = Duration::from_secs(10);

/// Offset covariance (in microseconds squared) below which the filter is
/// considered settled and polling may decay to [`CLOCK_POLL_SLOW`].
/// Sized above the covariance growth of one slow-poll interval so the
/// filter does not oscillate between cadences.
pub const CLOCK_SETTLE_COVARIANCE: f64 = 2.0e6;

/// Offset covariance above which the filter reports fatal divergence and
/// the player should transition to `state: error`.
pub const CLOCK_FATAL_COVARIANCE: f64 = 1.0e8;

/// Offset innovation (µs) that counts as a drift excursion and resumes
/// fast polling.
pub const CLOCK_EXCURSION_MICROS: f64 = 1_000.0;

/// How far ahead of wall clock the scheduler stamps the first frame of a
/// stream, so every member has frames in hand before the deadline.
pub const STREAM_START_LEAD_MICROS: i64 = 500_000;

/// Minimum margin between enqueue time and presentation time. Frames
/// closer than this to their deadline are dropped instead of sent.
pub const STREAM_MIN_JITTER_MICROS: i64 = 20_000;

/// Minimum notice given to a member ahead of a mid-stream format switch.
pub const FORMAT_SWITCH_MIN_LEAD_MICROS: i64 = 100_000;

/// Presentation lead applied to artwork frames ("now plus a little").
pub const ARTWORK_LEAD_MICROS: i64 = 50_000;

/// Upper bound on how far ahead of wall clock audio is produced,
/// regardless of member buffer capacities.
pub const STREAM_MAX_LEAD_MICROS: i64 = 2_000_000;

/// Interval of the stream scheduler pacing tick.
pub const STREAM_TICK: Duration = Duration::from_millis(20);
