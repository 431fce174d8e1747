//! Publishing side of the puncher.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{PunchTransport, Tasks, accept_passive};
use crate::config::PunchConfig;
use crate::conn::NppConn;
use crate::error::{NppError, NppResult};

/// Accepts punched connections from peers resolving this identity.
///
/// Nothing is published until the first [`Self::accept`]. From then on a
/// background loop keeps up to `max_concurrent_punches` publications
/// outstanding on Rendezvous and punches every peer that resolves one.
#[derive(Debug)]
pub struct PunchServer<T: PunchTransport> {
    transport: Arc<T>,
    config: PunchConfig,
    running: Option<Running>,
}

#[derive(Debug)]
struct Running {
    active: mpsc::Receiver<NppResult<NppConn>>,
    passive: mpsc::Receiver<NppConn>,
    _tasks: Tasks,
}

impl<T: PunchTransport> PunchServer<T> {
    /// Creates a server over `transport`.
    pub fn new(transport: T, config: PunchConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            running: None,
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the next connection the resolving side selected.
    ///
    /// # Errors
    ///
    /// Returns [`NppError::Rendezvous`] once publishing fails; the session
    /// is unusable afterwards and the server should be rebuilt. Returns
    /// [`NppError::Closed`] when every background loop has ended.
    pub async fn accept(&mut self) -> NppResult<NppConn> {
        let running = self
            .running
            .get_or_insert_with(|| Running::start(&self.transport, self.config));
        tokio::select! {
            Some(result) = running.active.recv() => result,
            Some(conn) = running.passive.recv() => Ok(conn),
            else => Err(NppError::Closed),
        }
    }
}

impl Running {
    fn start<T: PunchTransport>(transport: &Arc<T>, config: PunchConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (active_tx, active) = mpsc::channel(capacity);
        let (passive_tx, passive) = mpsc::channel(capacity);
        let (raw_tx, raw_rx) = mpsc::channel(capacity);

        let mut tasks = Tasks::default();
        tasks.push(tokio::spawn(publish_loop(transport.clone(), config, active_tx)));
        tasks.push(tokio::spawn(accept_passive(transport.clone(), raw_tx)));
        tasks.push(tokio::spawn(select_passive::<T>(raw_rx, config, passive_tx)));
        info!(protocol = %transport.protocol(), "punching server started");
        Self {
            active,
            passive,
            _tasks: tasks,
        }
    }
}

/// Keeps publications outstanding until the queue is closed or a
/// publication fails.
async fn publish_loop<T: PunchTransport>(
    transport: Arc<T>,
    config: PunchConfig,
    queue: mpsc::Sender<NppResult<NppConn>>,
) {
    let limit = Arc::new(Semaphore::new(config.max_concurrent_punches.max(1)));
    let mut rounds = JoinSet::new();
    loop {
        let permit = tokio::select! {
            permit = limit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            () = queue.closed() => break,
        };
        while rounds.try_join_next().is_some() {}
        rounds.spawn(punch_round(
            transport.clone(),
            config,
            queue.clone(),
            limit.clone(),
            permit,
        ));
    }
    // Rounds already matched with a peer may still deliver.
    while rounds.join_next().await.is_some() {}
    debug!(protocol = %transport.protocol(), "publish loop stopped");
}

async fn punch_round<T: PunchTransport>(
    transport: Arc<T>,
    config: PunchConfig,
    queue: mpsc::Sender<NppResult<NppConn>>,
    limit: Arc<Semaphore>,
    _permit: OwnedSemaphorePermit,
) {
    let published = match transport.private_addrs() {
        Ok(private) => transport
            .rendezvous()
            .publish(transport.protocol(), &private)
            .await
            .map_err(NppError::from),
        Err(e) => Err(e),
    };
    let candidates = match published {
        Ok(candidates) => candidates,
        Err(e) => {
            if !limit.is_closed() {
                warn!(protocol = %transport.protocol(), error = %e, "failed to publish");
                limit.close();
                let _ = queue.try_send(Err(e));
            }
            return;
        }
    };
    if candidates.is_empty() {
        debug!(protocol = %transport.protocol(), "resolver sent no candidates");
        return;
    }

    let mut attempts = JoinSet::new();
    for addr in candidates.sockets() {
        let transport = transport.clone();
        attempts.spawn(async move {
            let raw = transport.dial_raw(addr).await?;
            match tokio::time::timeout(config.selection_timeout, T::await_selection(raw)).await {
                Ok(selected) => selected,
                Err(_) => Err(NppError::Timeout(config.selection_timeout)),
            }
        });
    }
    // The resolving side selects at most one connection per round, and
    // may pick one that reached the passive listener instead.
    while let Some(joined) = attempts.join_next().await {
        match joined {
            Ok(Ok(conn)) => {
                deliver(&queue, conn);
                return;
            }
            Ok(Err(e)) => debug!(protocol = %transport.protocol(), error = %e, "punch attempt not selected"),
            Err(e) => debug!(error = %e, "punch attempt aborted"),
        }
    }
}

/// Forwards passive connections once the resolving side selected them.
async fn select_passive<T: PunchTransport>(
    mut raw: mpsc::Receiver<T::Raw>,
    config: PunchConfig,
    queue: mpsc::Sender<NppConn>,
) {
    let mut pending = JoinSet::new();
    loop {
        tokio::select! {
            Some(conn) = raw.recv() => {
                pending.spawn(tokio::time::timeout(config.selection_timeout, T::await_selection(conn)));
            }
            Some(joined) = pending.join_next(), if !pending.is_empty() => {
                match joined {
                    Ok(Ok(Ok(conn))) => {
                        if let Err(TrySendError::Full(_)) = queue.try_send(conn) {
                            warn!("accept queue full, closing punched connection");
                        }
                    }
                    Ok(Ok(Err(e))) => debug!(error = %e, "passive connection not selected"),
                    Ok(Err(_)) => debug!("passive connection selection timed out"),
                    Err(e) => debug!(error = %e, "passive selection aborted"),
                }
            }
            () = queue.closed() => return,
            else => return,
        }
    }
}

fn deliver(queue: &mpsc::Sender<NppResult<NppConn>>, conn: NppConn) {
    match queue.try_send(Ok(conn)) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("accept queue full, closing punched connection"),
        Err(TrySendError::Closed(_)) => {}
    }
}
