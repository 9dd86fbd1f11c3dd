//! Connection manager: one physical link per peripheral
//!
//! Owns the connection state machine of a session. At most one physical
//! connect is in flight; callers that ask for a connection while one is
//! being established wait for the same attempt. The attempt is driven by
//! a task of its own, so a caller that gives up never strands the link in
//! `Connecting`.

use crate::command::{Correlator, Signal};
use crate::notify::NotificationRouter;
use crate::session::SessionEvent;
use crate::transport::{CharacteristicMap, GattTransport, LinkObserver, LinkSink};
use ble_sequencer_shared::{
    CharacteristicHandle, ConnectionState, ConnectionStateMachine, LinkEvent, PeripheralAddress,
    SessionError, TransitionResult,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

type Waiter = oneshot::Sender<Result<(), SessionError>>;

struct LinkState<C> {
    fsm: ConnectionStateMachine,
    waiters: Vec<Waiter>,
    characteristics: Option<CharacteristicMap<C>>,
    released: bool,
}

/// Connection lifecycle of one session
pub struct ConnectionManager<T: GattTransport> {
    address: PeripheralAddress,
    transport: Arc<T>,
    correlator: Arc<Correlator>,
    router: Arc<NotificationRouter>,
    events: broadcast::Sender<SessionEvent>,
    connect_timeout: Duration,
    runtime: Handle,
    link: Mutex<LinkState<T::Characteristic>>,
    this: Weak<Self>,
}

impl<T: GattTransport> ConnectionManager<T> {
    pub fn new(
        address: PeripheralAddress,
        transport: Arc<T>,
        correlator: Arc<Correlator>,
        router: Arc<NotificationRouter>,
        events: broadcast::Sender<SessionEvent>,
        connect_timeout: Duration,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            address,
            transport,
            correlator,
            router,
            events,
            connect_timeout,
            runtime,
            link: Mutex::new(LinkState {
                fsm: ConnectionStateMachine::new(),
                waiters: Vec::new(),
                characteristics: None,
                released: false,
            }),
            this: this.clone(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().fsm.state()
    }

    /// Whether this link can never be used again
    pub fn is_terminal(&self) -> bool {
        self.lock().fsm.is_terminal()
    }

    /// Number of characteristics exposed by the connected peripheral
    pub fn characteristic_count(&self) -> usize {
        self.lock().characteristics.as_ref().map_or(0, |m| m.len())
    }

    /// Bring the link up, or join the attempt already in progress
    ///
    /// Resolves immediately when already connected. A link that has
    /// dropped is never re-established; the caller gets `NotConnected`.
    /// After `release()` every connect fails as `Cancelled`.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let rx = {
            let mut link = self.lock();
            if link.released {
                return Err(SessionError::Cancelled);
            }
            match link.fsm.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => return Err(SessionError::NotConnected),
                ConnectionState::Connecting => {
                    debug!("[CONNECT] {} joining connect in progress", self.address);
                    let (tx, rx) = oneshot::channel();
                    link.waiters.push(tx);
                    rx
                }
                ConnectionState::Idle => {
                    let Some(this) = self.this.upgrade() else {
                        return Err(SessionError::Cancelled);
                    };
                    self.transition(&mut link, LinkEvent::ConnectRequested);
                    let (tx, rx) = oneshot::channel();
                    link.waiters.push(tx);
                    self.runtime.spawn(this.drive_connect());
                    rx
                }
            }
        };

        rx.await.unwrap_or(Err(SessionError::Cancelled))
    }

    /// Native reference of `handle` on the live link
    pub fn resolve(&self, handle: CharacteristicHandle) -> Result<T::Characteristic, SessionError> {
        let link = self.lock();
        if link.fsm.state() != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }

        link.characteristics
            .as_ref()
            .and_then(|map| map.get(&handle))
            .cloned()
            .ok_or_else(|| SessionError::OperationFailed(format!("unknown characteristic {}", handle)))
    }

    /// Tear the link down on purpose
    ///
    /// Pending connect waiters and the awaited completion fail as
    /// `Cancelled`, all notification subscriptions are released. Holds for
    /// an idle link too: it will never connect.
    pub fn release(&self) {
        let (linked, waiters) = {
            let mut link = self.lock();
            link.released = true;
            let linked = matches!(
                link.fsm.state(),
                ConnectionState::Connecting | ConnectionState::Connected
            );
            if linked {
                link.characteristics = None;
                self.transition(&mut link, LinkEvent::Released);
            }
            (linked, std::mem::take(&mut link.waiters))
        };

        for waiter in waiters {
            let _ = waiter.send(Err(SessionError::Cancelled));
        }
        self.correlator.interrupt(Signal::Cancelled);
        self.router.clear();

        if linked {
            self.spawn_disconnect();
        }
    }

    async fn drive_connect(self: Arc<Self>) {
        info!(
            "[CONNECT] {} connecting via {} transport",
            self.address,
            self.transport.name()
        );

        let (done, pending) = self.correlator.arm();
        let observer: Weak<dyn LinkObserver> = self.this.clone();
        let sink = LinkSink::new(self.address.clone(), Arc::downgrade(&self.router), observer);
        let sequence = pending.sequence();

        let result = match self.transport.connect(&self.address, sink, done).await {
            Ok(()) => match pending.wait(self.connect_timeout).await {
                Ok(true) => self
                    .transport
                    .characteristics(&self.address)
                    .await
                    .map_err(|e| SessionError::OperationFailed(format!("service discovery failed: {}", e))),
                Ok(false) => Err(SessionError::OperationFailed("connection handshake failed".into())),
                Err(e) => Err(e),
            },
            Err(e) => {
                self.correlator.disarm(sequence);
                Err(SessionError::TransportUnavailable(e.to_string()))
            }
        };

        self.finish_connect(result);
    }

    fn finish_connect(&self, result: Result<CharacteristicMap<T::Characteristic>, SessionError>) {
        let mut orphaned = false;
        let (waiters, outcome) = {
            let mut link = self.lock();
            let waiters = std::mem::take(&mut link.waiters);
            let connecting = link.fsm.state() == ConnectionState::Connecting;

            let outcome = match result {
                Ok(map) if connecting => {
                    info!(
                        "[CONNECT] {} connected, {} characteristics",
                        self.address,
                        map.len()
                    );
                    link.characteristics = Some(map);
                    self.transition(&mut link, LinkEvent::Established);
                    Ok(())
                }
                Ok(_) => {
                    // The link went away while discovery was still running
                    orphaned = true;
                    Err(SessionError::LinkLost)
                }
                Err(e) => {
                    warn!("[CONNECT] {} connect failed: {}", self.address, e);
                    if connecting {
                        self.transition(&mut link, LinkEvent::ConnectFailed);
                    }
                    Err(e)
                }
            };
            (waiters, outcome)
        };

        if outcome.is_err() {
            self.router.clear();
        }
        if orphaned {
            self.spawn_disconnect();
        }

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn transition(&self, link: &mut LinkState<T::Characteristic>, event: LinkEvent) -> bool {
        let from = link.fsm.state();
        match link.fsm.process_event(event) {
            TransitionResult::Success(to) => {
                debug!("[CONNECT] {} {} -> {}", self.address, from, to);
                let _ = self.events.send(SessionEvent::StateChanged {
                    address: self.address.clone(),
                    from,
                    to,
                });
                true
            }
            TransitionResult::Unchanged(_) => false,
            TransitionResult::Invalid { from, event } => {
                warn!("[CONNECT] {} ignored {:?} while {}", self.address, event, from);
                false
            }
        }
    }

    fn spawn_disconnect(&self) {
        let transport = self.transport.clone();
        let address = self.address.clone();
        self.runtime.spawn(async move {
            transport.disconnect(&address).await;
        });
    }

    fn lock(&self) -> MutexGuard<'_, LinkState<T::Characteristic>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: GattTransport> LinkObserver for ConnectionManager<T> {
    fn link_lost(&self) {
        let lost = {
            let mut link = self.lock();
            match link.fsm.state() {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    link.characteristics = None;
                    self.transition(&mut link, LinkEvent::LinkLost)
                }
                _ => false,
            }
        };

        if lost {
            warn!("[CONNECT] {} link lost", self.address);
            self.correlator.interrupt(Signal::LinkLost);
            self.router.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::scripted::{Call, Reply, ScriptedTransport};

    fn manager(transport: ScriptedTransport) -> (Arc<ConnectionManager<ScriptedTransport>>, Arc<ScriptedTransport>) {
        let transport = Arc::new(transport);
        let address = PeripheralAddress::new("AA:BB:CC:DD:EE:01");
        let (events, _) = broadcast::channel(16);
        let manager = ConnectionManager::new(
            address.clone(),
            transport.clone(),
            Correlator::new(),
            NotificationRouter::new(address),
            events,
            Duration::from_secs(60),
            Handle::current(),
        );
        (manager, transport)
    }

    fn connects(transport: &ScriptedTransport) -> usize {
        transport.count_calls(|c| matches!(c, Call::Connect(_)))
    }

    #[tokio::test]
    async fn test_connect_when_connected_is_immediate() {
        let (manager, transport) = manager(ScriptedTransport::default());

        assert_eq!(manager.connect().await, Ok(()));
        assert_eq!(manager.state(), ConnectionState::Connected);

        assert_eq!(manager.connect().await, Ok(()));
        assert_eq!(connects(&transport), 1);
    }

    #[tokio::test]
    async fn test_concurrent_connects_collapse() {
        let (manager, transport) = manager(
            ScriptedTransport::default().with_script([Reply::Delay(Duration::from_millis(20))]),
        );

        let order = Arc::new(Mutex::new(Vec::new()));
        let callers: Vec<_> = (0..3)
            .map(|i| {
                let manager = manager.clone();
                let order = order.clone();
                tokio::spawn(async move {
                    let result = manager.connect().await;
                    order.lock().unwrap().push(i);
                    result
                })
            })
            .collect();

        for caller in callers {
            assert_eq!(caller.await.unwrap(), Ok(()));
        }
        // Waiters resolve in the order they asked
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(connects(&transport), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_is_terminal() {
        let (manager, transport) = manager(ScriptedTransport::default().with_script([Reply::Fail]));

        let (a, b) = tokio::join!(manager.connect(), manager.connect());
        assert!(matches!(a, Err(SessionError::OperationFailed(_))));
        assert_eq!(a, b);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // No automatic retry
        assert_eq!(manager.connect().await, Err(SessionError::NotConnected));
        assert_eq!(connects(&transport), 1);
    }

    #[tokio::test]
    async fn test_refused_connect() {
        let (manager, _) = manager(ScriptedTransport::default().with_script([Reply::Refuse]));
        assert!(matches!(
            manager.connect().await,
            Err(SessionError::TransportUnavailable(_))
        ));
        assert!(manager.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (manager, _) = manager(ScriptedTransport::default().with_script([Reply::Silent]));
        assert_eq!(
            manager.connect().await,
            Err(SessionError::OperationTimeout(60_000))
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_resolve() {
        let handle = CharacteristicHandle::parse("fff0", "fff1").unwrap();
        let (manager, _) = manager(ScriptedTransport::new([handle]));

        assert_eq!(manager.resolve(handle).err(), Some(SessionError::NotConnected));

        manager.connect().await.unwrap();
        assert_eq!(manager.resolve(handle).unwrap().handle, handle);
        assert_eq!(manager.characteristic_count(), 1);

        let unknown = CharacteristicHandle::parse("fff0", "fff9").unwrap();
        assert!(matches!(
            manager.resolve(unknown),
            Err(SessionError::OperationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_link_loss() {
        let (manager, transport) = manager(ScriptedTransport::default());
        manager.connect().await.unwrap();

        transport.drop_link(&PeripheralAddress::new("AA:BB:CC:DD:EE:01"));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.characteristic_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_after_idle_release_is_cancelled() {
        let (manager, transport) = manager(ScriptedTransport::default());

        manager.release();
        assert_eq!(manager.connect().await, Err(SessionError::Cancelled));
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(connects(&transport), 0);
    }

    #[tokio::test]
    async fn test_release_while_connecting() {
        let (manager, transport) = manager(ScriptedTransport::default().with_script([Reply::Silent]));

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect().await })
        };
        while connects(&transport) == 0 {
            tokio::task::yield_now().await;
        }

        manager.release();
        assert_eq!(waiter.await.unwrap(), Err(SessionError::Cancelled));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        while transport.count_calls(|c| matches!(c, Call::Disconnect(_))) == 0 {
            tokio::task::yield_now().await;
        }
    }
}
