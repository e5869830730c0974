use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use agora_types::PeerId;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// Entries kept before expired windows are swept.
const SWEEP_THRESHOLD: usize = 1024;

/// Inbound peer traffic counted separately per peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Sync,
    Content,
    Publish,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sync => "sync",
            Self::Content => "content",
            Self::Publish => "publish",
        })
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
    rejected: u32,
}

/// Fixed-window counter per `(peer, kind)`.
///
/// The first message of a peer opens a window; once `limit` messages of a
/// kind have been admitted, further ones are refused until the window has
/// run its length.
pub struct RequestLimiter {
    request_limit: u32,
    publish_limit: u32,
    window: Duration,
    windows: Mutex<HashMap<(PeerId, RequestKind), Window>>,
}

impl RequestLimiter {
    pub fn new(request_limit: u32, publish_limit: u32, window: Duration) -> Self {
        Self {
            request_limit: request_limit.max(1),
            publish_limit: publish_limit.max(1),
            window: window.max(Duration::from_secs(1)),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.request_limit, config.publish_limit, config.rate_window())
    }

    pub fn limit(&self, kind: RequestKind) -> u32 {
        match kind {
            RequestKind::Sync | RequestKind::Content => self.request_limit,
            RequestKind::Publish => self.publish_limit,
        }
    }

    /// Count one message from `peer`. Returns `false` if it is over the limit.
    pub fn allow(&self, peer: &PeerId, kind: RequestKind) -> SyncResult<bool> {
        let now = Instant::now();
        let limit = self.limit(kind);
        let mut windows = self.windows.lock().map_err(|_| SyncError::LockPoisoned)?;

        if windows.len() >= SWEEP_THRESHOLD {
            let length = self.window;
            windows.retain(|_, w| now.duration_since(w.started) < length);
        }

        let window = windows.entry((peer.clone(), kind)).or_insert(Window {
            started: now,
            count: 0,
            rejected: 0,
        });
        if now.duration_since(window.started) >= self.window {
            if window.rejected > 0 {
                debug!(peer = %peer, %kind, rejected = window.rejected, "rate window closed");
            }
            *window = Window {
                started: now,
                count: 0,
                rejected: 0,
            };
        }

        if window.count >= limit {
            if window.rejected == 0 {
                warn!(
                    peer = %peer,
                    %kind,
                    limit,
                    window_secs = self.window.as_secs(),
                    "peer rate limited"
                );
            }
            window.rejected += 1;
            return Ok(false);
        }
        window.count += 1;
        Ok(true)
    }
}

impl Default for RequestLimiter {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name)
    }

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_the_limit_per_window() {
        let limiter = RequestLimiter::new(3, 10, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.allow(&peer("a"), RequestKind::Content).unwrap());
        }
        assert!(!limiter.allow(&peer("a"), RequestKind::Content).unwrap());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.allow(&peer("a"), RequestKind::Content).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn peers_and_kinds_are_counted_apart() {
        let limiter = RequestLimiter::new(1, 2, Duration::from_secs(60));
        assert!(limiter.allow(&peer("a"), RequestKind::Sync).unwrap());
        assert!(!limiter.allow(&peer("a"), RequestKind::Sync).unwrap());
        assert!(limiter.allow(&peer("a"), RequestKind::Content).unwrap());
        assert!(limiter.allow(&peer("b"), RequestKind::Sync).unwrap());

        assert!(limiter.allow(&peer("a"), RequestKind::Publish).unwrap());
        assert!(limiter.allow(&peer("a"), RequestKind::Publish).unwrap());
        assert!(!limiter.allow(&peer("a"), RequestKind::Publish).unwrap());
    }

    #[test]
    fn zero_settings_are_raised() {
        let limiter = RequestLimiter::new(0, 0, Duration::ZERO);
        assert_eq!(limiter.limit(RequestKind::Sync), 1);
        assert_eq!(limiter.limit(RequestKind::Publish), 1);
        assert_eq!(limiter.window, Duration::from_secs(1));
    }
}
