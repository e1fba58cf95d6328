//! Fixed-capacity session pool.
//!
//! A semaphore counts idle sessions and a FIFO free-list holds them, so
//! checkouts rotate across endpoints. A [`PooledSession`] returns its session
//! to the pool when dropped, on success and on error alike.

use super::{ClientError, RestSession, SeriesSession};
use crate::config::ClientSettings;
use futures::future::try_join_all;
use std::collections::{HashSet, VecDeque};
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct SessionPool {
    idle: Mutex<VecDeque<Arc<dyn SeriesSession>>>,
    permits: Semaphore,
    capacity: usize,
}

impl SessionPool {
    pub fn new(sessions: Vec<Arc<dyn SeriesSession>>) -> Self {
        let capacity = sessions.len();
        Self {
            idle: Mutex::new(sessions.into()),
            permits: Semaphore::new(capacity),
            capacity,
        }
    }

    /// Build `sessions_per_endpoint` REST sessions for every endpoint,
    /// interleaved so consecutive checkouts hit different endpoints.
    pub fn from_settings(settings: &ClientSettings) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        let mut sessions: Vec<Arc<dyn SeriesSession>> = Vec::new();
        for _ in 0..settings.sessions_per_endpoint {
            for endpoint in &settings.endpoints {
                sessions.push(Arc::new(RestSession::new(
                    http.clone(),
                    endpoint,
                    &settings.username,
                    &settings.password,
                )));
            }
        }

        info!(
            endpoints = settings.endpoints.len(),
            capacity = sessions.len(),
            "Destination session pool created"
        );
        Ok(Self::new(sessions))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for an idle session.
    ///
    /// # Errors
    ///
    /// `ClientError::PoolClosed` once [`SessionPool::close`] has been called.
    pub async fn acquire(&self) -> Result<PooledSession<'_>, ClientError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ClientError::PoolClosed)?;

        let session = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or(ClientError::PoolClosed)?;

        debug!(endpoint = session.endpoint(), "Session checked out");
        Ok(PooledSession {
            session,
            pool: self,
            _permit: permit,
        })
    }

    /// Like [`SessionPool::acquire`], giving up when `cancel` fires.
    pub async fn acquire_or_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PooledSession<'_>, ClientError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            session = self.acquire() => session,
        }
    }

    /// Fail current waiters and every later acquire.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Ping every distinct endpoint once, concurrently. Holds every session
    /// while probing so each endpoint is reached through its own session.
    pub async fn ping_all(&self) -> Result<(), ClientError> {
        let mut held = Vec::with_capacity(self.capacity);
        for _ in 0..self.capacity {
            held.push(self.acquire().await?);
        }

        let mut seen = HashSet::new();
        let probes = held
            .iter()
            .filter(|session| seen.insert(session.endpoint().to_string()))
            .map(|session| async move {
                session.ping().await?;
                info!(endpoint = session.endpoint(), "Destination reachable");
                Ok::<_, ClientError>(())
            });
        try_join_all(probes).await?;
        Ok(())
    }

    fn release(&self, session: Arc<dyn SeriesSession>) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(session);
    }
}

/// A checked-out session. Returned to the pool on drop.
pub struct PooledSession<'a> {
    session: Arc<dyn SeriesSession>,
    pool: &'a SessionPool,
    _permit: SemaphorePermit<'a>,
}

impl Deref for PooledSession<'_> {
    type Target = dyn SeriesSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        // Runs before the permit is released, so the next waiter finds it idle.
        self.pool.release(self.session.clone());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::client::MemoryBackend;

    fn pool_of(size: usize) -> SessionPool {
        let backend = MemoryBackend::default();
        SessionPool::new(
            (0..size)
                .map(|i| Arc::new(backend.session(format!("memory-{}", i))) as Arc<dyn SeriesSession>)
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_sessions_are_returned_on_drop() {
        let pool = pool_of(2);
        {
            let _a = pool.acquire().await.unwrap();
            let _b = pool.acquire().await.unwrap();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_checkouts_rotate() {
        let pool = pool_of(2);
        let first = pool.acquire().await.unwrap().endpoint().to_string();
        let second = pool.acquire().await.unwrap().endpoint().to_string();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let pool = Arc::new(pool_of(1));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|s| s.endpoint().to_string()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), "memory-0");
    }

    #[tokio::test]
    async fn test_close_and_cancel() {
        let pool = pool_of(1);
        let _held = pool.acquire().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            pool.acquire_or_cancel(&cancel).await,
            Err(ClientError::Cancelled)
        ));

        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(ClientError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_ping_all() {
        let pool = pool_of(3);
        pool.ping_all().await.unwrap();
        assert_eq!(pool.available(), 3);
    }
}
