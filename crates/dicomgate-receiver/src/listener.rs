use dicomgate_config::RouteConfig;
use dicomgate_types::GatewayError;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::net::{TcpListener, TcpStream};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::association::handle_association;
use crate::registry::StudyRegistry;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-route counters surfaced on the admin read surface.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub associations_accepted: AtomicU64,
    pub associations_rate_limited: AtomicU64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            associations_accepted: self.associations_accepted.load(Ordering::Relaxed),
            associations_rate_limited: self.associations_rate_limited.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ListenerStatsSnapshot {
    pub associations_accepted: u64,
    pub associations_rate_limited: u64,
}

/// One SCP listener bound to a route's AE title and port.
///
/// The accept loop and all association handling are blocking socket work;
/// each runs on the blocking pool. Rate-limited associations are rejected
/// at the DIMSE level with an A-ASSOCIATE-RJ before any study state is
/// touched.
pub struct RouteListener {
    route: RouteConfig,
    registry: Arc<StudyRegistry>,
    limiter: Option<Arc<DirectLimiter>>,
    /// rate_limit_per_minute == 0 admits nothing
    admit_none: bool,
    stats: Arc<ListenerStats>,
}

impl RouteListener {
    pub fn new(route: RouteConfig, registry: Arc<StudyRegistry>) -> Self {
        let (limiter, admit_none) = match route.rate_limit_per_minute {
            Some(0) => (None, true),
            Some(n) => (
                NonZeroU32::new(n).map(|n| Arc::new(RateLimiter::direct(Quota::per_minute(n)))),
                false,
            ),
            None => (None, false),
        };
        Self {
            route,
            registry,
            limiter,
            admit_none,
            stats: Arc::new(ListenerStats::default()),
        }
    }

    pub fn ae_title(&self) -> &str {
        &self.route.ae_title
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        self.stats.clone()
    }

    /// Bind the route's port. Kept separate from `run` so the binary can
    /// fail fast (exit code 2) before any other component starts.
    pub fn bind(&self) -> Result<TcpListener, GatewayError> {
        let addr = format!("0.0.0.0:{}", self.route.port);
        let listener = TcpListener::bind(&addr).map_err(|e| {
            GatewayError::config(format!(
                "cannot bind {} for AE {}: {}",
                addr, self.route.ae_title, e
            ))
        })?;
        listener.set_nonblocking(true)?;
        info!(ae = %self.route.ae_title, port = self.route.port, "listener bound");
        Ok(listener)
    }

    /// Accept loop; runs until cancelled. Each admitted association is
    /// handled on its own blocking task.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(ae = %self.route.ae_title, %peer, "connection accepted");
                    self.dispatch(stream, cancel.clone());
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    warn!(ae = %self.route.ae_title, error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
        info!(ae = %self.route.ae_title, "listener stopped");
    }

    fn dispatch(&self, stream: TcpStream, cancel: CancellationToken) {
        let admitted = !self.admit_none
            && self
                .limiter
                .as_ref()
                .map(|l| l.check().is_ok())
                .unwrap_or(true);

        if !admitted {
            self.stats
                .associations_rate_limited
                .fetch_add(1, Ordering::Relaxed);
            info!(ae = %self.route.ae_title, "association rejected: rate limit");
            tokio::task::spawn_blocking(move || reject_association(stream));
            return;
        }

        self.stats
            .associations_accepted
            .fetch_add(1, Ordering::Relaxed);
        let route = self.route.clone();
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || {
            let _ = stream.set_nonblocking(false);
            if let Err(e) = handle_association(stream, &route, &registry, &cancel) {
                debug!(ae = %route.ae_title, error = %e, "association handler failed");
            }
        });
    }
}

/// Read the A-ASSOCIATE-RQ and answer with a transient A-ASSOCIATE-RJ so
/// the peer sees a protocol-level rejection rather than a dropped socket.
fn reject_association(stream: TcpStream) {
    use dicom_ul::pdu::{
        read_pdu, write_pdu, AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason,
        AssociationRJSource, Pdu,
    };
    use std::io::BufRead;
    use tokio_util::bytes::{Buf, BytesMut};

    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut read_buffer = BytesMut::with_capacity(65536);
    let mut reader = std::io::BufReader::new(&stream);
    let pdu = loop {
        let mut buf = std::io::Cursor::new(&read_buffer[..]);
        match read_pdu(&mut buf, 65536, false) {
            Ok(Some(pdu)) => {
                read_buffer.advance(buf.position() as usize);
                break Some(pdu);
            }
            Ok(None) => {}
            Err(e) => {
                debug!(error = %e, "could not read opening pdu on rate-limited connection");
                break None;
            }
        }
        match reader.fill_buf() {
            Ok(recv) if !recv.is_empty() => {
                let len = recv.len();
                read_buffer.extend_from_slice(recv);
                reader.consume(len);
            }
            _ => break None,
        }
    };
    match pdu {
        Some(Pdu::AssociationRQ { .. }) => {
            let mut writer = &stream;
            let rj = Pdu::AssociationRJ(AssociationRJ {
                result: AssociationRJResult::Transient,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::NoReasonGiven,
                ),
            });
            if let Err(e) = write_pdu(&mut writer, &rj) {
                debug!(error = %e, "could not write association reject");
            }
        }
        other => {
            debug!(?other, "unexpected opening pdu on rate-limited connection");
        }
    }
}
