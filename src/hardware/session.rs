//! Device session manager
//!
//! Owns the single connection to the hardware device and serializes all
//! access to it:
//! - the connection is opened lazily, and concurrent callers share one
//!   in-flight connect attempt (memoized `Shared` future)
//! - exclusive access is handed out in FIFO order through a tokio mutex
//! - a transport fault tears the connection down; `run_exclusive` reconnects
//!   and retries the operation exactly once
//! - device operations are bounded by their own timeout, after which the
//!   connection is considered wedged and torn down

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::core::config::SessionConfig;
use crate::core::derivation::DerivationPath;
use crate::core::errors::{SignerError, SignerResult};
use crate::hardware::transport::{DeviceAccount, DeviceFault, DeviceHandle, DeviceTransport};

type ConnectResult = Result<Arc<Connection>, SignerError>;
type ConnectFuture = Shared<BoxFuture<'static, ConnectResult>>;

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Busy,
    Closing,
}

/// Counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Calls to `DeviceTransport::open`, failed ones included
    pub transport_opens: u64,
    /// Successful connects
    pub connects: u64,
    /// Connections dropped after a fault, timeout, reset or close
    pub teardowns: u64,
    /// Operations retried after a transport fault
    pub retries: u64,
}

#[derive(Default)]
struct Counters {
    transport_opens: AtomicU64,
    connects: AtomicU64,
    teardowns: AtomicU64,
    retries: AtomicU64,
}

struct Connection {
    generation: u64,
    device: AsyncMutex<Box<dyn DeviceHandle>>,
}

enum Slot {
    Disconnected,
    Connecting { generation: u64, attempt: ConnectFuture },
    Ready(Arc<Connection>),
}

struct SessionInner {
    transport: Arc<dyn DeviceTransport>,
    config: SessionConfig,
    slot: Mutex<Slot>,
    /// FIFO exclusivity; holding the guard means owning the device
    gate: Arc<AsyncMutex<()>>,
    /// Number of `close()` calls in progress
    closing: AtomicUsize,
    /// Bumped when a close starts; waiters queued before it are turned away
    close_epoch: AtomicU64,
    busy: AtomicBool,
    next_generation: AtomicU64,
    counters: Arc<Counters>,
}

/// Shared handle to the one device session of the process.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl DeviceSession {
    pub fn new(transport: Arc<dyn DeviceTransport>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                transport,
                config,
                slot: Mutex::new(Slot::Disconnected),
                gate: Arc::new(AsyncMutex::new(())),
                closing: AtomicUsize::new(0),
                close_epoch: AtomicU64::new(0),
                busy: AtomicBool::new(false),
                next_generation: AtomicU64::new(0),
                counters: Arc::new(Counters::default()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        if self.inner.closing.load(Ordering::SeqCst) > 0 {
            return SessionState::Closing;
        }
        match &*self.inner.slot.lock() {
            Slot::Disconnected => SessionState::Disconnected,
            Slot::Connecting { .. } => SessionState::Connecting,
            Slot::Ready(_) if self.inner.busy.load(Ordering::SeqCst) => SessionState::Busy,
            Slot::Ready(_) => SessionState::Ready,
        }
    }

    pub fn stats(&self) -> SessionStats {
        let c = &self.inner.counters;
        SessionStats {
            transport_opens: c.transport_opens.load(Ordering::SeqCst),
            connects: c.connects.load(Ordering::SeqCst),
            teardowns: c.teardowns.load(Ordering::SeqCst),
            retries: c.retries.load(Ordering::SeqCst),
        }
    }

    /// Waits (FIFO) for exclusive access to a connected device.
    ///
    /// `wait` bounds only the time spent waiting for the connection and for
    /// the previous holder; it does not bound operations run on the handle.
    pub async fn acquire(&self, wait: Duration) -> SignerResult<SessionHandle> {
        match timeout(wait, self.acquire_inner()).await {
            Ok(result) => result,
            Err(_) => Err(SignerError::DeviceTimeout {
                operation: "acquire".to_string(),
                waited_ms: wait.as_millis() as u64,
            }),
        }
    }

    async fn acquire_inner(&self) -> SignerResult<SessionHandle> {
        let epoch = self.admit()?;

        // Join (or start) the shared connect before queueing so that every
        // waiter rides the same open.
        self.connected().await?;

        let permit = self.inner.gate.clone().lock_owned().await;
        if self.inner.close_epoch.load(Ordering::SeqCst) != epoch {
            return Err(SignerError::SessionClosing);
        }
        self.ensure_not_closing()?;

        // The previous holder may have torn the connection down.
        let connection = self.connected().await?;
        self.inner.busy.store(true, Ordering::SeqCst);
        debug!(generation = connection.generation, "device session acquired");

        Ok(SessionHandle {
            session: self.clone(),
            connection,
            _permit: permit,
        })
    }

    /// Runs `op` with exclusive device access. A transport fault raised by
    /// `op` reconnects the device and runs `op` once more while still holding
    /// the exclusive slot.
    pub async fn run_exclusive<T, F>(&self, wait: Duration, op: F) -> SignerResult<T>
    where
        F: for<'h> Fn(&'h SessionHandle) -> BoxFuture<'h, SignerResult<T>>,
    {
        let mut handle = self.acquire(wait).await?;
        match op(&handle).await {
            Err(err) if err.is_transport_fault() => {
                warn!(error = %err, "transport fault during device operation, reconnecting once");
                self.inner.counters.retries.fetch_add(1, Ordering::SeqCst);
                handle.reconnect().await?;
                op(&handle).await
            }
            other => other,
        }
    }

    /// Stops accepting new work, waits for the current holder, releases the
    /// transport and returns to `Disconnected`. Callers arriving while the
    /// close is in progress, or queued behind it, get `SessionClosing`.
    /// The session reconnects lazily on the next `acquire` afterwards.
    pub async fn close(&self) -> SignerResult<()> {
        self.inner.closing.fetch_add(1, Ordering::SeqCst);
        self.inner.close_epoch.fetch_add(1, Ordering::SeqCst);
        info!("closing device session");

        let _permit = self.inner.gate.clone().lock_owned().await;

        let previous = std::mem::replace(&mut *self.inner.slot.lock(), Slot::Disconnected);
        let connection = match previous {
            Slot::Ready(connection) => Some(connection),
            Slot::Connecting { attempt, .. } => attempt.await.ok(),
            Slot::Disconnected => None,
        };

        if let Some(connection) = connection {
            self.inner.counters.teardowns.fetch_add(1, Ordering::SeqCst);
            self.release(&connection).await;
        }

        self.inner.closing.fetch_sub(1, Ordering::SeqCst);
        info!("device session closed");
        Ok(())
    }

    /// Waits for the current holder, then closes the connection so that the
    /// next acquire reopens the transport. Must not be called while holding a
    /// [`SessionHandle`]; use [`SessionHandle::invalidate`] there instead.
    pub async fn reset(&self, reason: &str) {
        let _permit = self.inner.gate.clone().lock_owned().await;
        let previous = std::mem::replace(&mut *self.inner.slot.lock(), Slot::Disconnected);
        if let Slot::Ready(connection) = previous {
            self.inner.counters.teardowns.fetch_add(1, Ordering::SeqCst);
            warn!(generation = connection.generation, reason, "device session reset");
            self.release(&connection).await;
        }
    }

    /// Close epoch observed on entry. The epoch is read before the closing
    /// flag so that a close starting in between is seen by one of the two.
    fn admit(&self) -> SignerResult<u64> {
        let epoch = self.inner.close_epoch.load(Ordering::SeqCst);
        self.ensure_not_closing()?;
        Ok(epoch)
    }

    fn ensure_not_closing(&self) -> SignerResult<()> {
        if self.inner.closing.load(Ordering::SeqCst) > 0 {
            return Err(SignerError::SessionClosing);
        }
        Ok(())
    }

    /// Returns the live connection, opening the transport if needed.
    /// Concurrent callers share one connect attempt.
    async fn connected(&self) -> ConnectResult {
        let (generation, attempt) = {
            let mut slot = self.inner.slot.lock();
            match &*slot {
                Slot::Ready(connection) => return Ok(connection.clone()),
                Slot::Connecting { generation, attempt } => (*generation, attempt.clone()),
                Slot::Disconnected => {
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let attempt = open_with_retries(
                        self.inner.transport.clone(),
                        self.inner.config.clone(),
                        self.inner.counters.clone(),
                        generation,
                    )
                    .boxed()
                    .shared();
                    *slot = Slot::Connecting {
                        generation,
                        attempt: attempt.clone(),
                    };
                    (generation, attempt)
                }
            }
        };

        let result = attempt.await;

        let mut slot = self.inner.slot.lock();
        if matches!(&*slot, Slot::Connecting { generation: g, .. } if *g == generation) {
            *slot = match &result {
                Ok(connection) => Slot::Ready(connection.clone()),
                Err(_) => Slot::Disconnected,
            };
        }
        result
    }

    fn is_current(&self, connection: &Connection) -> bool {
        matches!(&*self.inner.slot.lock(), Slot::Ready(c) if c.generation == connection.generation)
    }

    /// Detaches `connection` if it is still the live one and closes its
    /// handle. A connection that was already replaced is left alone.
    async fn teardown(&self, connection: &Connection, reason: &str) {
        let detached = {
            let mut slot = self.inner.slot.lock();
            let current = matches!(&*slot, Slot::Ready(c) if c.generation == connection.generation);
            if current {
                *slot = Slot::Disconnected;
            }
            current
        };
        if detached {
            self.inner.counters.teardowns.fetch_add(1, Ordering::SeqCst);
            warn!(generation = connection.generation, reason, "device connection torn down");
            self.release(connection).await;
        }
    }

    /// Closes the device handle of a detached connection. Errors are logged.
    async fn release(&self, connection: &Connection) {
        let mut device = connection.device.lock().await;
        match timeout(self.inner.config.device_op_timeout(), device.close()).await {
            Ok(Ok(())) => debug!(generation = connection.generation, "device handle closed"),
            Ok(Err(e)) => warn!(generation = connection.generation, error = %e, "device close reported an error"),
            Err(_) => warn!(generation = connection.generation, "device close timed out"),
        }
    }
}

async fn open_with_retries(
    transport: Arc<dyn DeviceTransport>,
    config: SessionConfig,
    counters: Arc<Counters>,
    generation: u64,
) -> ConnectResult {
    let max_attempts = config.max_connect_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        counters.transport_opens.fetch_add(1, Ordering::SeqCst);
        debug!(attempt, device = %transport.describe(), "opening device transport");

        match timeout(config.open_timeout(), transport.open()).await {
            Ok(Ok(device)) => {
                counters.connects.fetch_add(1, Ordering::SeqCst);
                info!(generation, attempt, device = %transport.describe(), "✅ device connected");
                return Ok(Arc::new(Connection {
                    generation,
                    device: AsyncMutex::new(device),
                }));
            }
            Ok(Err(fault)) => {
                warn!(attempt, max_attempts, error = %fault, "device open failed");
                last_error = fault.to_string();
            }
            Err(_) => {
                warn!(attempt, max_attempts, "device open timed out");
                last_error = format!("open timed out after {} ms", config.open_timeout_ms);
            }
        }

        if attempt < max_attempts {
            sleep(config.connect_backoff()).await;
        }
    }

    Err(SignerError::DeviceUnavailable {
        attempts: max_attempts,
        reason: last_error,
    })
}

/// Exclusive access to the device. Dropping the handle releases it.
pub struct SessionHandle {
    session: DeviceSession,
    connection: Arc<Connection>,
    _permit: OwnedMutexGuard<()>,
}

impl SessionHandle {
    pub async fn get_address(
        &self,
        path: &DerivationPath,
        display: bool,
    ) -> SignerResult<DeviceAccount> {
        self.ensure_current()?;
        let op_timeout = self.session.inner.config.device_op_timeout();
        let result = {
            let mut device = self.connection.device.lock().await;
            timeout(op_timeout, device.get_address(path, display)).await
        };
        self.settle("get_address", path, op_timeout, result).await
    }

    /// Signs `message` at `path`. Only the length of the message is logged.
    pub async fn sign(&self, path: &DerivationPath, message: &[u8]) -> SignerResult<Vec<u8>> {
        self.ensure_current()?;
        debug!(%path, message_len = message.len(), "requesting device signature");
        let op_timeout = self.session.inner.config.device_op_timeout();
        let result = {
            let mut device = self.connection.device.lock().await;
            timeout(op_timeout, device.sign(path, message)).await
        };
        self.settle("sign", path, op_timeout, result).await
    }

    /// Tears the underlying connection down and closes the device handle;
    /// later calls on this handle fail with a transport fault. Only this
    /// handle's connection is affected, never one opened after it.
    pub async fn invalidate(&self, reason: &str) {
        self.session.teardown(&self.connection, reason).await;
    }

    /// Replaces a torn-down connection while keeping exclusivity.
    async fn reconnect(&mut self) -> SignerResult<()> {
        self.session.ensure_not_closing()?;
        self.session.teardown(&self.connection, "reconnect requested").await;
        self.connection = self.session.connected().await?;
        Ok(())
    }

    fn ensure_current(&self) -> SignerResult<()> {
        if self.session.is_current(&self.connection) {
            Ok(())
        } else {
            Err(SignerError::DeviceDisconnected {
                reason: "connection was reset".to_string(),
            })
        }
    }

    async fn settle<T>(
        &self,
        operation: &str,
        path: &DerivationPath,
        op_timeout: Duration,
        result: Result<Result<T, DeviceFault>, tokio::time::error::Elapsed>,
    ) -> SignerResult<T> {
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(fault)) => Err(self.map_fault(fault, path).await),
            Err(_) => {
                self.session
                    .teardown(&self.connection, "device operation timed out")
                    .await;
                Err(SignerError::DeviceTimeout {
                    operation: operation.to_string(),
                    waited_ms: op_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn map_fault(&self, fault: DeviceFault, path: &DerivationPath) -> SignerError {
        match fault {
            DeviceFault::Transport(reason) => {
                self.session.teardown(&self.connection, &reason).await;
                SignerError::DeviceDisconnected { reason }
            }
            DeviceFault::UserRejected => SignerError::UserRejected {
                path: path.to_string(),
            },
            DeviceFault::App(reason) | DeviceFault::InvalidResponse(reason) => {
                SignerError::DeviceFault { reason }
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.session.inner.busy.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::emulator::EmulatedDevice;

    fn session_with(device: &EmulatedDevice) -> DeviceSession {
        let config = SessionConfig {
            open_timeout_ms: 1_000,
            device_op_timeout_ms: 5_000,
            max_connect_attempts: 3,
            connect_backoff_ms: 10,
            acquire_timeout_ms: 30_000,
        };
        DeviceSession::new(Arc::new(device.clone()), config)
    }

    const WAIT: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_lazy_connect_and_state() {
        let device = EmulatedDevice::new();
        let session = session_with(&device);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(device.open_count(), 0);

        let handle = session.acquire(WAIT).await.unwrap();
        assert_eq!(session.state(), SessionState::Busy);
        drop(handle);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(device.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_after_max_attempts() {
        let device = EmulatedDevice::new();
        device.fail_next_opens(10);
        let session = session_with(&device);

        let err = session.acquire(WAIT).await.err().unwrap();
        assert!(matches!(err, SignerError::DeviceUnavailable { attempts: 3, .. }));
        assert_eq!(session.stats().transport_opens, 3);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_recovers_within_attempts() {
        let device = EmulatedDevice::new();
        device.fail_next_opens(2);
        let session = session_with(&device);

        assert!(session.acquire(WAIT).await.is_ok());
        assert_eq!(session.stats().transport_opens, 3);
        assert_eq!(session.stats().connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout_while_busy() {
        let device = EmulatedDevice::new();
        let session = session_with(&device);
        let _held = session.acquire(WAIT).await.unwrap();

        let err = session.acquire(Duration::from_millis(50)).await.err().unwrap();
        assert!(matches!(err, SignerError::DeviceTimeout { ref operation, .. } if operation == "acquire"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_op_timeout_tears_down() {
        let device = EmulatedDevice::new();
        device.set_latency(Duration::from_secs(60));
        let session = session_with(&device);
        let path = DerivationPath::evm(0, 0);

        let handle = session.acquire(WAIT).await.unwrap();
        let err = handle.sign(&path, b"payload").await.unwrap_err();
        assert!(matches!(err, SignerError::DeviceTimeout { ref operation, .. } if operation == "sign"));
        drop(handle);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.stats().teardowns, 1);
        assert_eq!(device.close_count(), 1);

        device.set_latency(Duration::ZERO);
        let handle = session.acquire(WAIT).await.unwrap();
        handle.sign(&path, b"payload").await.unwrap();
        assert_eq!(device.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_fault_closes_dropped_handle() {
        let device = EmulatedDevice::new();
        let session = session_with(&device);
        device.drop_next_operations(1);

        session
            .run_exclusive(WAIT, |h| {
                async move { h.get_address(&DerivationPath::evm(0, 0), false).await }.boxed()
            })
            .await
            .unwrap();
        assert_eq!(session.stats().retries, 1);
        assert_eq!(device.open_count(), 2);
        assert_eq!(device.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_only_affects_own_connection() {
        let device = EmulatedDevice::new();
        let session = session_with(&device);
        let path = DerivationPath::evm(0, 0);

        let mut handle = session.acquire(WAIT).await.unwrap();
        handle.invalidate("untrusted response").await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(device.close_count(), 1);

        handle.reconnect().await.unwrap();
        let stale = Arc::new(Connection {
            generation: 1,
            device: AsyncMutex::new(Box::new(NeverClosed) as Box<dyn DeviceHandle>),
        });
        session.teardown(&stale, "late teardown").await;

        handle.get_address(&path, false).await.unwrap();
        assert_eq!(session.stats().teardowns, 1);
        assert_eq!(device.open_count(), 2);
        assert_eq!(device.close_count(), 1);
    }

    struct NeverClosed;

    #[async_trait::async_trait]
    impl DeviceHandle for NeverClosed {
        async fn get_address(
            &mut self,
            _path: &DerivationPath,
            _display: bool,
        ) -> Result<DeviceAccount, DeviceFault> {
            Err(DeviceFault::App("unused".to_string()))
        }

        async fn sign(&mut self, _path: &DerivationPath, _message: &[u8]) -> Result<Vec<u8>, DeviceFault> {
            Err(DeviceFault::App("unused".to_string()))
        }

        async fn close(&mut self) -> Result<(), DeviceFault> {
            panic!("a replaced connection must not be closed again");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_rejection_is_not_retried() {
        let device = EmulatedDevice::new();
        device.reject_next_sign();
        let session = session_with(&device);
        let path = DerivationPath::evm(0, 0);

        let err = session
            .run_exclusive(WAIT, |h| {
                let path = path.clone();
                async move { h.sign(&path, b"payload").await }.boxed()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SignerError::UserRejected { .. }));
        assert_eq!(session.stats().retries, 0);
        assert_eq!(device.sign_count(), 1);
        // rejection leaves the connection intact
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_then_reconnect() {
        let device = EmulatedDevice::new();
        let session = session_with(&device);
        drop(session.acquire(WAIT).await.unwrap());

        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(device.close_count(), 1);

        drop(session.acquire(WAIT).await.unwrap());
        assert_eq!(device.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_holder_and_rejects_newcomers() {
        let device = EmulatedDevice::new();
        let session = session_with(&device);
        let held = session.acquire(WAIT).await.unwrap();

        let closer = {
            let session = session.clone();
            tokio::spawn(async move { session.close().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(session.state(), SessionState::Closing);

        let err = session.acquire(WAIT).await.err().unwrap();
        assert_eq!(err, SignerError::SessionClosing);
        assert!(!closer.is_finished());

        drop(held);
        closer.await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forces_reopen() {
        let device = EmulatedDevice::new();
        let session = session_with(&device);
        drop(session.acquire(WAIT).await.unwrap());
        session.reset("untrusted response").await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(device.close_count(), 1);
        drop(session.acquire(WAIT).await.unwrap());
        assert_eq!(device.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_waits_for_holder() {
        let device = EmulatedDevice::new();
        let session = session_with(&device);
        let held = session.acquire(WAIT).await.unwrap();

        let resetting = {
            let session = session.clone();
            tokio::spawn(async move { session.reset("untrusted response").await })
        };
        tokio::task::yield_now().await;
        held.get_address(&DerivationPath::evm(0, 0), false).await.unwrap();
        assert_eq!(device.close_count(), 0);

        drop(held);
        resetting.await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(device.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_sees_close_in_progress() {
        let device = EmulatedDevice::new();
        let session = session_with(&device);
        assert_eq!(session.admit().unwrap(), 0);
        let held = session.acquire(WAIT).await.unwrap();

        let closer = {
            let session = session.clone();
            tokio::spawn(async move { session.close().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(session.admit(), Err(SignerError::SessionClosing));

        drop(held);
        closer.await.unwrap().unwrap();
        assert_eq!(session.admit().unwrap(), 1);
    }
}
