//! Singleflight for network fetches, keyed by locator address.
//!
//! The first caller for an address becomes the leader and spawns the fetch;
//! callers that arrive while it is in flight share its outcome. The fetch
//! task removes its own entry before it resolves, so a caller arriving after
//! settlement starts a fresh fetch. Dropping callers never cancels the
//! spawned fetch.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tokio_util::sync::CancellationToken;

use super::{ImageTransport, RetryPolicy, fetch_with_retry};
use crate::{error::NetworkError, key::Locator};

type SharedFetch = Shared<BoxFuture<'static, Result<Bytes, NetworkError>>>;

struct InFlight {
    id: u64,
    fetch: SharedFetch,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    pub leaders: u64,
    pub waiters: u64,
    pub in_flight: usize,
}

pub struct RequestCoalescer {
    transport: Arc<dyn ImageTransport>,
    policy: RetryPolicy,
    in_flight: Arc<DashMap<String, InFlight>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    leaders: AtomicU64,
    waiters: AtomicU64,
}

impl RequestCoalescer {
    pub fn new(
        transport: Arc<dyn ImageTransport>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            policy,
            in_flight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            leaders: AtomicU64::new(0),
            waiters: AtomicU64::new(0),
        }
    }

    pub async fn fetch(
        &self,
        locator: &Locator,
    ) -> Result<Bytes, NetworkError> {
        let address = locator.address().to_string();

        // The entry guard holds the shard lock until the new fetch is
        // registered; the spawned task's removal waits on that same lock.
        let fetch = match self.in_flight.entry(address.clone()) {
            Entry::Occupied(existing) => {
                let waiters = self.waiters.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!(
                    "coalesced fetch wait; url={}, leaders={}, waiters={}",
                    address,
                    self.leaders.load(Ordering::Relaxed),
                    waiters
                );
                existing.get().fetch.clone()
            }
            Entry::Vacant(slot) => {
                let leaders = self.leaders.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!(
                    "coalesced fetch lead; url={}, leaders={}, waiters={}",
                    address,
                    leaders,
                    self.waiters.load(Ordering::Relaxed)
                );
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let fetch = self.spawn_fetch(id, locator.clone());
                slot.insert(InFlight {
                    id,
                    fetch: fetch.clone(),
                });
                fetch
            }
        };

        fetch.await
    }

    fn spawn_fetch(&self, id: u64, locator: Locator) -> SharedFetch {
        let transport = Arc::clone(&self.transport);
        let in_flight = Arc::clone(&self.in_flight);
        let policy = self.policy;
        let cancel = self.shutdown.child_token();
        let address = locator.address().to_string();

        let handle = tokio::spawn(async move {
            let outcome = fetch_with_retry(
                transport.as_ref(),
                &locator,
                policy,
                &cancel,
            )
            .await;
            in_flight.remove_if(locator.address(), |_, entry| entry.id == id);
            log::debug!(
                "coalesced fetch complete; url={}, ok={}",
                locator.address(),
                outcome.is_ok()
            );
            outcome
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(NetworkError::Aborted {
                    url: address,
                    message: e.to_string(),
                }),
            }
        }
        .boxed()
        .shared()
    }

    /// Abort every in-flight fetch; waiters observe `Cancelled`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            leaders: self.leaders.load(Ordering::Relaxed),
            waiters: self.waiters.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
        }
    }
}

impl std::fmt::Debug for RequestCoalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}
