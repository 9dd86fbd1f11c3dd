//! Per-peripheral session: FIFO batch queue plus its execution task

use super::{SessionConfig, SessionEvent};
use crate::command::{
    Batch, BatchBuilder, BatchFailure, BatchId, BatchOutcome, Correlator, InFlight,
    OperationExecutor,
};
use crate::connection::ConnectionManager;
use crate::notify::{NotificationRouter, Subscription};
use crate::transport::GattTransport;
use ble_sequencer_shared::{CharacteristicHandle, ConnectionState, PeripheralAddress, SessionError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

#[derive(Default)]
struct QueueState {
    batches: VecDeque<Batch>,
    running: bool,
    closed: bool,
}

struct SessionInner<T: GattTransport> {
    address: PeripheralAddress,
    runtime: Handle,
    connection: Arc<ConnectionManager<T>>,
    router: Arc<NotificationRouter>,
    executor: OperationExecutor<T>,
    events: broadcast::Sender<SessionEvent>,
    queue: Mutex<QueueState>,
    next_batch: AtomicU64,
}

/// Handle to the session of one peripheral
///
/// Cloning is cheap; all clones drive the same queue and link.
pub struct Session<T: GattTransport> {
    inner: Arc<SessionInner<T>>,
}

impl<T: GattTransport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: GattTransport> Session<T> {
    /// Create an idle session; nothing touches the transport until a batch
    /// or an explicit connect arrives
    pub fn new(
        address: PeripheralAddress,
        transport: Arc<T>,
        config: &SessionConfig,
        runtime: Handle,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let correlator = Correlator::new();
        let router = NotificationRouter::new(address.clone());
        let connection = ConnectionManager::new(
            address.clone(),
            transport.clone(),
            correlator.clone(),
            router.clone(),
            events.clone(),
            config.connect_timeout,
            runtime.clone(),
        );
        let executor = OperationExecutor::new(
            address.clone(),
            transport,
            connection.clone(),
            correlator,
            events.clone(),
            config.operation_timeout,
        );

        Self {
            inner: Arc::new(SessionInner {
                address,
                runtime,
                connection,
                router,
                executor,
                events,
                queue: Mutex::new(QueueState::default()),
                next_batch: AtomicU64::new(1),
            }),
        }
    }

    pub fn address(&self) -> &PeripheralAddress {
        &self.inner.address
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Operation the executor is waiting on right now
    pub fn current_operation(&self) -> Option<InFlight> {
        self.inner.executor.current()
    }

    /// Number of batches waiting behind the one executing
    pub fn queued_batches(&self) -> usize {
        self.inner.lock_queue().batches.len()
    }

    /// Whether the executor task is alive
    pub fn is_running(&self) -> bool {
        self.inner.lock_queue().running
    }

    /// A retired session accepts no more work
    ///
    /// Happens after disposal, and once the link has dropped with nothing
    /// left to execute.
    pub fn is_retired(&self) -> bool {
        let queue = self.inner.lock_queue();
        queue.closed || (!queue.running && self.inner.connection.is_terminal())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Observe notifications of a characteristic
    ///
    /// Delivery to the peripheral side still has to be switched on with an
    /// `enable_notifications` step.
    pub fn subscribe(&self, handle: CharacteristicHandle) -> Subscription {
        self.inner.router.subscribe(handle)
    }

    /// Build a batch and queue it
    ///
    /// Never blocks and never fails: problems surface through the
    /// operation callbacks and `on_failed`.
    pub fn post<B, C, F>(&self, build: B, on_complete: C, on_failed: F) -> BatchId
    where
        B: FnOnce(BatchBuilder) -> BatchBuilder,
        C: FnOnce() + Send + 'static,
        F: FnOnce(usize, SessionError) + Send + 'static,
    {
        self.submit(build(BatchBuilder::new()).build(on_complete, on_failed))
    }

    /// Queue a prepared batch and start the executor if it is idle
    pub fn submit(&self, mut batch: Batch) -> BatchId {
        let id = self.inner.next_batch.fetch_add(1, Ordering::Relaxed);
        batch.assign_id(id);

        let start = {
            let mut queue = self.inner.lock_queue();
            let rejected = if queue.closed {
                Some(SessionError::Cancelled)
            } else if !queue.running && self.inner.connection.is_terminal() {
                Some(SessionError::NotConnected)
            } else {
                None
            };

            if let Some(reason) = rejected {
                drop(queue);
                warn!(
                    "[SESSION] {} batch {} rejected: {}",
                    self.inner.address, id, reason
                );
                self.inner.runtime.spawn(async move { batch.fail_all(reason) });
                return id;
            }

            queue.batches.push_back(batch);
            !std::mem::replace(&mut queue.running, true)
        };

        if start {
            let inner = self.inner.clone();
            self.inner.runtime.spawn(run_queue(inner));
        }
        id
    }

    /// Queue a batch and wait for its outcome
    pub async fn request<B>(&self, build: B) -> Result<(), BatchFailure>
    where
        B: FnOnce(BatchBuilder) -> BatchBuilder,
    {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let failed_tx = tx.clone();

        self.post(
            build,
            move || {
                if let Some(tx) = take(&tx) {
                    let _ = tx.send(Ok(()));
                }
            },
            move |index, reason| {
                if let Some(tx) = take(&failed_tx) {
                    let _ = tx.send(Err(BatchFailure { index, reason }));
                }
            },
        );

        rx.await.unwrap_or(Err(BatchFailure {
            index: 0,
            reason: SessionError::Cancelled,
        }))
    }

    /// Bring the link up outside of any batch
    pub async fn connect(&self) -> Result<(), SessionError> {
        if self.inner.lock_queue().closed {
            return Err(SessionError::Cancelled);
        }
        self.inner.connection.connect().await
    }

    /// Stop accepting work and tear the session down
    ///
    /// The operation in flight fails as `Cancelled`, queued batches are
    /// drained as `Cancelled`, the link and every subscription are released.
    pub fn dispose(&self) {
        let drained = {
            let mut queue = self.inner.lock_queue();
            if queue.closed {
                return;
            }
            queue.closed = true;
            // A running executor drains the queue itself
            if queue.running {
                Vec::new()
            } else {
                queue.batches.drain(..).collect()
            }
        };

        info!("[SESSION] {} disposed", self.inner.address);
        self.inner.connection.release();
        if !drained.is_empty() {
            self.inner.runtime.spawn(async move {
                fail_batches(drained, SessionError::Cancelled);
            });
        }
    }
}

impl<T: GattTransport> SessionInner<T> {
    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Execution task of a session: one batch at a time, in queue order
async fn run_queue<T: GattTransport>(inner: Arc<SessionInner<T>>) {
    debug!("[SESSION] {} executor started", inner.address);

    loop {
        let batch = {
            let mut queue = inner.lock_queue();
            if queue.closed {
                let drained: Vec<_> = queue.batches.drain(..).collect();
                queue.running = false;
                drop(queue);
                fail_batches(drained, SessionError::Cancelled);
                break;
            }
            match queue.batches.pop_front() {
                Some(batch) => batch,
                None => {
                    queue.running = false;
                    break;
                }
            }
        };

        match inner.executor.run_batch(batch).await {
            BatchOutcome::Completed | BatchOutcome::Aborted(_) => continue,
            BatchOutcome::Halted(failure) => {
                warn!(
                    "[SESSION] {} halted: {}",
                    inner.address, failure.reason
                );
                let (drained, reason) = {
                    let mut queue = inner.lock_queue();
                    // Disposal wins over whatever the interrupted operation saw
                    let reason = if queue.closed {
                        SessionError::Cancelled
                    } else {
                        failure.reason
                    };
                    queue.closed = true;
                    queue.running = false;
                    (queue.batches.drain(..).collect::<Vec<_>>(), reason)
                };
                fail_batches(drained, reason);
                break;
            }
        }
    }

    debug!("[SESSION] {} executor idle", inner.address);
}

fn fail_batches(batches: Vec<Batch>, reason: SessionError) {
    for batch in batches {
        debug!("[SESSION] batch {} failed unexecuted: {}", batch.id(), reason);
        batch.fail_all(reason.clone());
    }
}

fn take<V>(slot: &Mutex<Option<V>>) -> Option<V> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::InFlight;
    use crate::session::SessionManager;
    use crate::transport::scripted::{Call, Reply, ScriptedTransport};
    use ble_sequencer_shared::gatt_uuid::CLIENT_CHARACTERISTIC_CONFIGURATION;
    use bytes::Bytes;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;
    type Outcome = oneshot::Receiver<Result<(), BatchFailure>>;

    fn address() -> PeripheralAddress {
        PeripheralAddress::new("C0:FF:EE:00:00:01")
    }

    fn handle(c: &str) -> CharacteristicHandle {
        CharacteristicHandle::parse("fff0", c).unwrap()
    }

    fn setup(script: Vec<Reply>) -> (SessionManager<ScriptedTransport>, Arc<ScriptedTransport>) {
        let transport = Arc::new(
            ScriptedTransport::new([handle("fff1"), handle("fff2")]).with_script(script),
        );
        let manager = SessionManager::new(transport.clone(), SessionConfig::default());
        (manager, transport)
    }

    fn note(log: &Log, label: &'static str) -> impl FnOnce(bool) + Send + 'static {
        let log = log.clone();
        move |ok| log.lock().unwrap().push(format!("{} {}", label, ok))
    }

    /// Batch callbacks that report into a channel
    fn watch() -> (
        Box<dyn FnOnce() + Send>,
        Box<dyn FnOnce(usize, SessionError) + Send>,
        Outcome,
    ) {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let failed = tx.clone();
        (
            Box::new(move || {
                let _ = take(&tx).map(|tx| tx.send(Ok(())));
            }),
            Box::new(move |index, reason| {
                let _ = take(&failed).map(|tx| tx.send(Err(BatchFailure { index, reason })));
            }),
            rx,
        )
    }

    async fn until(mut condition: impl FnMut() -> bool) {
        while !condition() {
            tokio::task::yield_now().await;
        }
    }

    fn writes(transport: &ScriptedTransport) -> usize {
        transport.count_calls(|c| matches!(c, Call::Write { .. }))
    }

    #[tokio::test]
    async fn test_connect_then_write() {
        let (manager, transport) = setup(vec![]);
        let log = Log::default();

        let result = manager
            .request(&address(), |b| {
                b.connect()
                    .write_then(handle("fff1"), vec![0x01], note(&log, "write"))
            })
            .await;

        assert_eq!(result, Ok(()));
        assert_eq!(*log.lock().unwrap(), vec!["write true"]);
        assert_eq!(
            transport.calls(),
            vec![
                Call::Connect(address()),
                Call::Write {
                    handle: handle("fff1"),
                    payload: Bytes::from_static(&[0x01]),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_write_skips_rest_of_batch() {
        let (manager, transport) = setup(vec![Reply::Succeed, Reply::Fail]);
        let log = Log::default();

        let result = manager
            .request(&address(), |b| {
                b.connect()
                    .write_then(handle("fff1"), vec![0x01], note(&log, "first"))
                    .write_then(handle("fff2"), vec![0x02], note(&log, "second"))
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.index, 1);
        assert!(matches!(failure.reason, SessionError::OperationFailed(_)));
        assert_eq!(*log.lock().unwrap(), vec!["first false"]);
        assert_eq!(writes(&transport), 1);

        // Only the batch was aborted; the session keeps going
        let session = manager.session(&address());
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(
            session.request(|b| b.write(handle("fff2"), vec![0x03])).await,
            Ok(())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_transport_times_out() {
        let (manager, transport) = setup(vec![Reply::Succeed, Reply::Silent]);

        let result = manager
            .request(&address(), |b| {
                b.connect()
                    .write(handle("fff1"), vec![0x01])
                    .write(handle("fff2"), vec![0x02])
            })
            .await;

        assert_eq!(
            result,
            Err(BatchFailure {
                index: 1,
                reason: SessionError::OperationTimeout(5000),
            })
        );
        assert_eq!(writes(&transport), 1);
    }

    #[tokio::test]
    async fn test_batches_run_in_submission_order() {
        let delay = Reply::Delay(Duration::from_millis(5));
        let (manager, transport) = setup(vec![delay; 3]);
        let session = manager.session(&address());
        let log = Log::default();

        let (done_a, failed_a, rx_a) = watch();
        let (done_b, failed_b, rx_b) = watch();
        session.post(
            |b| {
                b.connect_then(note(&log, "a:connect"))
                    .write_then(handle("fff1"), vec![0x0a], note(&log, "a:write"))
            },
            done_a,
            failed_a,
        );
        session.post(
            |b| b.write_then(handle("fff2"), vec![0x0b], note(&log, "b:write")),
            done_b,
            failed_b,
        );

        assert_eq!(rx_a.await.unwrap(), Ok(()));
        assert_eq!(rx_b.await.unwrap(), Ok(()));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:connect true", "a:write true", "b:write true"]
        );

        let payloads: Vec<_> = transport
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Write { payload, .. } => Some(payload[0]),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![0x0a, 0x0b]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_operation_in_flight_across_posting_threads() {
        let (manager, transport) = setup(vec![]);
        for _ in 0..16 {
            transport.push_reply(Reply::Delay(Duration::from_millis(2)));
        }
        let manager = Arc::new(manager);

        let mut outcomes = Vec::new();
        let mut threads = Vec::new();
        for i in 0..4u8 {
            let (done, failed, rx) = watch();
            outcomes.push(rx);
            let manager = manager.clone();
            // Posting from threads outside the runtime
            threads.push(std::thread::spawn(move || {
                manager.post(
                    &address(),
                    |b| b.connect().write(handle("fff1"), vec![i]).write(handle("fff2"), vec![i]),
                    done,
                    failed,
                );
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }

        for rx in outcomes {
            assert_eq!(rx.await.unwrap(), Ok(()));
        }
        assert_eq!(writes(&transport), 8);
        assert_eq!(transport.max_in_flight(), 1);
        assert_eq!(transport.count_calls(|c| matches!(c, Call::Connect(_))), 1);
    }

    #[tokio::test]
    async fn test_peripherals_run_independently() {
        let (manager, transport) = setup(vec![Reply::Succeed, Reply::Silent]);
        let first = manager.session(&address());
        let other = PeripheralAddress::new("C0:FF:EE:00:00:02");

        let (done, failed, mut rx_first) = watch();
        first.post(|b| b.connect().write(handle("fff1"), vec![0x01]), done, failed);
        until(|| writes(&transport) == 1).await;

        // The second peripheral is not held up by the silent write
        assert_eq!(
            manager
                .request(&other, |b| b.connect().write(handle("fff2"), vec![0x02]))
                .await,
            Ok(())
        );
        assert!(matches!(
            rx_first.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        assert_eq!(first.current_operation().map(|op| op.index), Some(1));

        first.dispose();
        assert_eq!(
            rx_first.await.unwrap(),
            Err(BatchFailure {
                index: 1,
                reason: SessionError::Cancelled,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_notification_toggle_fails_batch() {
        let (manager, transport) = setup(vec![]);
        transport.stall_local_notifications(true);
        let session = manager.session(&address());

        let result = session
            .request(|b| {
                b.connect()
                    .enable_notifications(handle("fff2"), CLIENT_CHARACTERISTIC_CONFIGURATION)
            })
            .await;
        assert_eq!(
            result,
            Err(BatchFailure {
                index: 1,
                reason: SessionError::OperationTimeout(5000),
            })
        );

        // The queue keeps moving
        assert_eq!(session.request(|b| b.write(handle("fff1"), vec![0x01])).await, Ok(()));
    }

    #[tokio::test]
    async fn test_connect_collapses_and_is_idempotent() {
        let (manager, transport) = setup(vec![Reply::Delay(Duration::from_millis(10))]);
        let session = manager.session(&address());

        let (a, b, c) = tokio::join!(session.connect(), session.connect(), session.connect());
        assert_eq!((a, b, c), (Ok(()), Ok(()), Ok(())));

        assert_eq!(session.connect().await, Ok(()));
        assert_eq!(session.request(|b| b.connect()).await, Ok(()));
        assert_eq!(transport.count_calls(|c| matches!(c, Call::Connect(_))), 1);
    }

    #[tokio::test]
    async fn test_write_before_connect_fails_without_transport_call() {
        let (manager, transport) = setup(vec![]);
        let session = manager.session(&address());

        let first = session.request(|b| b.write(handle("fff1"), vec![0x01])).await;
        assert_eq!(
            first,
            Err(BatchFailure {
                index: 0,
                reason: SessionError::NotConnected,
            })
        );
        assert!(transport.calls().is_empty());

        let second = session
            .request(|b| b.connect().write(handle("fff1"), vec![0x01]))
            .await;
        assert_eq!(second, Ok(()));
    }

    #[tokio::test]
    async fn test_unknown_characteristic() {
        let (manager, transport) = setup(vec![]);
        let unknown = CharacteristicHandle::parse("fff0", "ffff").unwrap();

        let result = manager
            .request(&address(), |b| b.connect().write(unknown, vec![0x01]))
            .await
            .unwrap_err();
        assert_eq!(result.index, 1);
        assert!(matches!(result.reason, SessionError::OperationFailed(_)));
        assert_eq!(writes(&transport), 0);
    }

    #[tokio::test]
    async fn test_failed_connect_fails_whole_queue() {
        let (manager, transport) = setup(vec![Reply::Fail]);
        let session = manager.session(&address());
        let log = Log::default();

        let (done_a, failed_a, rx_a) = watch();
        let (done_b, failed_b, rx_b) = watch();
        session.post(
            |b| b.connect().write_then(handle("fff1"), vec![0x01], note(&log, "a:write")),
            done_a,
            failed_a,
        );
        session.post(
            |b| b.write_then(handle("fff1"), vec![0x02], note(&log, "b:write")),
            done_b,
            failed_b,
        );

        let a = rx_a.await.unwrap().unwrap_err();
        let b = rx_b.await.unwrap().unwrap_err();
        assert_eq!(a.index, 0);
        assert!(matches!(a.reason, SessionError::OperationFailed(_)));
        assert_eq!(b.index, 0);
        assert_eq!(b.reason, a.reason);
        assert_eq!(*log.lock().unwrap(), vec!["a:write false", "b:write false"]);

        assert!(session.is_retired());
        assert_eq!(writes(&transport), 0);
        assert_eq!(transport.count_calls(|c| matches!(c, Call::Connect(_))), 1);
    }

    #[tokio::test]
    async fn test_link_loss_mid_batch() {
        let (manager, transport) = setup(vec![Reply::Succeed, Reply::Silent]);
        let session = manager.session(&address());
        let log = Log::default();

        let (done_a, failed_a, rx_a) = watch();
        let (done_b, failed_b, rx_b) = watch();
        session.post(
            |b| {
                b.connect()
                    .write_then(handle("fff1"), vec![0x01], note(&log, "a:first"))
                    .write_then(handle("fff2"), vec![0x02], note(&log, "a:second"))
            },
            done_a,
            failed_a,
        );
        session.post(
            |b| b.write_then(handle("fff1"), vec![0x03], note(&log, "b:write")),
            done_b,
            failed_b,
        );

        until(|| writes(&transport) == 1).await;
        transport.drop_link(&address());

        assert_eq!(
            rx_a.await.unwrap(),
            Err(BatchFailure {
                index: 1,
                reason: SessionError::LinkLost,
            })
        );
        assert_eq!(
            rx_b.await.unwrap(),
            Err(BatchFailure {
                index: 0,
                reason: SessionError::LinkLost,
            })
        );
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:first false", "a:second false", "b:write false"]
        );
        assert!(session.is_retired());
        assert_eq!(writes(&transport), 1);

        // A fresh session takes over and reconnects
        let fresh = manager.session(&address());
        assert_eq!(fresh.state(), ConnectionState::Idle);
        assert_eq!(fresh.request(|b| b.connect()).await, Ok(()));
        assert_eq!(transport.count_calls(|c| matches!(c, Call::Connect(_))), 2);
    }

    #[tokio::test]
    async fn test_dispose_cancels_everything() {
        let (manager, transport) = setup(vec![Reply::Succeed, Reply::Silent]);
        let session = manager.session(&address());
        let mut subscription = session.subscribe(handle("fff2"));

        let (done_a, failed_a, rx_a) = watch();
        let (done_b, failed_b, rx_b) = watch();
        session.post(|b| b.connect().write(handle("fff1"), vec![0x01]), done_a, failed_a);
        session.post(|b| b.write(handle("fff1"), vec![0x02]), done_b, failed_b);

        until(|| writes(&transport) == 1).await;
        assert_eq!(
            session.current_operation(),
            Some(InFlight {
                batch: 1,
                index: 1,
                label: "write",
            })
        );
        assert_eq!(session.queued_batches(), 1);

        session.dispose();

        assert_eq!(
            rx_a.await.unwrap(),
            Err(BatchFailure {
                index: 1,
                reason: SessionError::Cancelled,
            })
        );
        assert_eq!(
            rx_b.await.unwrap(),
            Err(BatchFailure {
                index: 0,
                reason: SessionError::Cancelled,
            })
        );
        assert_eq!(subscription.recv().await, None);
        assert!(session.is_retired());

        until(|| transport.count_calls(|c| matches!(c, Call::Disconnect(_))) == 1).await;

        // Closed for business
        let late = session.request(|b| b.connect()).await;
        assert_eq!(
            late,
            Err(BatchFailure {
                index: 0,
                reason: SessionError::Cancelled,
            })
        );
        assert_eq!(session.connect().await, Err(SessionError::Cancelled));
    }

    #[tokio::test]
    async fn test_notifications_reach_subscribers() {
        let (manager, transport) = setup(vec![]);
        let session = manager.session(&address());
        let mut subscription = session.subscribe(handle("fff2"));

        let result = session
            .request(|b| {
                b.connect()
                    .enable_notifications(handle("fff2"), CLIENT_CHARACTERISTIC_CONFIGURATION)
            })
            .await;
        assert_eq!(result, Ok(()));
        assert!(transport.calls().contains(&Call::WriteDescriptor {
            handle: handle("fff2"),
            descriptor: CLIENT_CHARACTERISTIC_CONFIGURATION,
            value: Bytes::from_static(&[0x01, 0x00]),
        }));

        let delivered = transport.notify(&address(), handle("fff2"), Bytes::from_static(&[0x10]));
        assert_eq!(delivered, 1);
        assert_eq!(subscription.recv().await, Some(Bytes::from_static(&[0x10])));

        // Other characteristics are not delivered to this subscriber
        transport.notify(&address(), handle("fff1"), Bytes::from_static(&[0x20]));
        assert_eq!(subscription.try_recv(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_completion_is_discarded() {
        let (manager, transport) = setup(vec![
            Reply::Succeed,
            Reply::Silent,
            Reply::Delay(Duration::from_millis(500)),
        ]);
        let session = manager.session(&address());

        let first = session
            .request(|b| {
                b.connect()
                    .write(handle("fff1"), vec![0x01])
                    .timeout(Duration::from_millis(100))
            })
            .await
            .unwrap_err();
        assert_eq!(first.reason, SessionError::OperationTimeout(100));
        let late = transport.take_held();
        assert_eq!(late.len(), 1);

        let (done, failed, rx) = watch();
        session.post(|b| b.write(handle("fff2"), vec![0x02]), done, failed);
        until(|| writes(&transport) == 2).await;

        // The late failure for the first write must not touch the second
        for completion in late {
            completion.complete(false);
        }
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_events_follow_execution() {
        let (manager, _) = setup(vec![]);
        let session = manager.session(&address());
        let mut events = session.subscribe_events();

        session
            .request(|b| b.connect().write(handle("fff1"), vec![0x01]))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                SessionEvent::OperationStarted {
                    batch: 1,
                    index: 0,
                    label: "connect"
                },
                SessionEvent::StateChanged {
                    address: address(),
                    from: ConnectionState::Idle,
                    to: ConnectionState::Connecting,
                },
                SessionEvent::StateChanged {
                    address: address(),
                    from: ConnectionState::Connecting,
                    to: ConnectionState::Connected,
                },
                SessionEvent::OperationCompleted {
                    batch: 1,
                    index: 0,
                    label: "connect"
                },
                SessionEvent::OperationStarted {
                    batch: 1,
                    index: 1,
                    label: "write"
                },
                SessionEvent::OperationCompleted {
                    batch: 1,
                    index: 1,
                    label: "write"
                },
                SessionEvent::BatchCompleted { batch: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn test_manager_registry() {
        let (manager, _) = setup(vec![]);
        let other = PeripheralAddress::new("C0:FF:EE:00:00:02");

        manager.request(&address(), |b| b.connect()).await.unwrap();
        manager.connect(&other).await.unwrap();
        let mut addresses = manager.addresses();
        addresses.sort();
        assert_eq!(addresses, vec![address(), other.clone()]);

        assert!(manager.dispose(&other));
        assert!(!manager.dispose(&other));
        assert!(manager.get(&other).is_none());

        // Dropping the link retires the session; prune forgets it
        manager.transport().drop_link(&address());
        assert!(manager.get(&address()).is_none());
        assert_eq!(manager.prune(), vec![address()]);
        assert!(manager.addresses().is_empty());
    }
}
