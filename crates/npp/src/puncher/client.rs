//! Resolving side of the puncher.

use std::net::SocketAddr;
use std::sync::Arc;

use npp_core::WalletAddress;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{PunchTransport, Tasks, accept_passive};
use crate::config::PunchConfig;
use crate::conn::NppConn;
use crate::error::{MultiError, NppError, NppResult};

/// Dials peers published on Rendezvous.
///
/// The passive listener starts with the client, so candidates sent to a
/// peer are reachable before the first resolve. Each [`Self::dial`] drops
/// passive connections still queued from earlier calls before resolving,
/// since those belong to other targets.
#[derive(Debug)]
pub struct PunchClient<T: PunchTransport> {
    transport: Arc<T>,
    config: PunchConfig,
    passive: mpsc::Receiver<T::Raw>,
    _tasks: Tasks,
}

impl<T: PunchTransport> PunchClient<T> {
    /// Creates a client and starts its passive listener.
    pub fn new(transport: T, config: PunchConfig) -> Self {
        let transport = Arc::new(transport);
        let (tx, passive) = mpsc::channel(config.queue_capacity.max(1));
        let mut tasks = Tasks::default();
        tasks.push(tokio::spawn(accept_passive(transport.clone(), tx)));
        Self {
            transport,
            config,
            passive,
            _tasks: tasks,
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Establishes one connection to a peer published as `target`.
    ///
    /// Blocks until the peer publishes; bound it with a timeout. Every
    /// opened socket other than the returned one is closed before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns [`NppError::Rendezvous`] if resolving fails,
    /// [`NppError::NoAddressesResolved`] if the peer sent no candidates, and
    /// [`NppError::PunchFailed`] if no attempt succeeded within the passive
    /// grace period after the last active dial failed.
    pub async fn dial(&mut self, target: WalletAddress) -> NppResult<NppConn> {
        self.drop_stale_passive();
        let private = self.transport.private_addrs()?;
        let protocol = self.transport.protocol().to_string();
        let candidates = self
            .transport
            .rendezvous()
            .resolve(&protocol, target, &private)
            .await?;
        if candidates.is_empty() {
            return Err(NppError::NoAddressesResolved);
        }
        let sockets = candidates.sockets();
        debug!(target = %target, protocol = %protocol, candidates = ?sockets, "punching");

        let mut attempts: JoinSet<(SocketAddr, NppResult<T::Raw>)> = JoinSet::new();
        for addr in sockets {
            let transport = self.transport.clone();
            attempts.spawn(async move { (addr, transport.dial_raw(addr).await) });
        }

        let mut errors = MultiError::new();
        let grace = tokio::time::sleep(self.config.passive_grace);
        tokio::pin!(grace);
        let mut grace_armed = false;

        let winner = loop {
            tokio::select! {
                Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                    match joined {
                        Ok((addr, Ok(raw))) => match T::select(raw).await {
                            Ok(conn) => break Some(conn),
                            Err(e) => errors.push(format!("{addr}: {e}")),
                        },
                        Ok((addr, Err(e))) => {
                            debug!(addr = %addr, error = %e, "punch attempt failed");
                            errors.push(format!("{addr}: {e}"));
                        }
                        Err(e) => errors.push(e),
                    }
                    if attempts.is_empty() {
                        grace.as_mut().reset(Instant::now() + self.config.passive_grace);
                        grace_armed = true;
                    }
                }
                Some(raw) = self.passive.recv() => {
                    match T::select(raw).await {
                        Ok(conn) => break Some(conn),
                        Err(e) => errors.push(format!("passive: {e}")),
                    }
                }
                () = &mut grace, if grace_armed => break None,
                else => break None,
            }
        };

        attempts.abort_all();
        while let Some(joined) = attempts.join_next().await {
            if let Ok((addr, Ok(raw))) = joined {
                debug!(addr = %addr, "closing surplus punched connection");
                drop(raw);
            }
        }

        match winner {
            Some(conn) => {
                info!(target = %target, remote = %conn.remote_addr(), source = %conn.source(), "punched connection established");
                Ok(conn)
            }
            None => Err(NppError::PunchFailed(errors)),
        }
    }

    // Nothing resolves this client's candidates before the next resolve
    // call, so whatever is queued now came from an earlier target.
    fn drop_stale_passive(&mut self) {
        let mut stale = 0usize;
        while let Ok(raw) = self.passive.try_recv() {
            drop(raw);
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "dropped passive connections left from earlier dials");
        }
    }
}
