//! In-process transport answering requests from a script
//!
//! Used by the loopback demo and the test suite. Every request is recorded,
//! and each completion-bearing request (connect, characteristic write,
//! descriptor write) consumes the next scripted reply. With an empty script
//! every request succeeds. Completions are delivered from a spawned task,
//! the way a real stack reports from its own thread.

use super::{CharacteristicMap, GattTransport, LinkSink};
use crate::command::Completion;
use anyhow::{bail, Result};
use async_trait::async_trait;
use ble_sequencer_shared::{CharacteristicHandle, PeripheralAddress, Uuid};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// How the transport answers one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Complete with `true`
    Succeed,
    /// Complete with `false`
    Fail,
    /// Complete with `true` after a delay
    Delay(Duration),
    /// Accept the request and never complete it
    Silent,
    /// Reject the request at dispatch
    Refuse,
    /// Accept the request and drop the completion token
    Abandon,
}

/// A recorded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(PeripheralAddress),
    Write {
        handle: CharacteristicHandle,
        payload: Bytes,
    },
    WriteDescriptor {
        handle: CharacteristicHandle,
        descriptor: Uuid,
        value: Bytes,
    },
    SetLocalNotification {
        handle: CharacteristicHandle,
        enable: bool,
    },
    Disconnect(PeripheralAddress),
}

/// Characteristic reference handed out by the scripted transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCharacteristic {
    pub address: PeripheralAddress,
    pub handle: CharacteristicHandle,
}

#[derive(Default)]
pub struct ScriptedTransport {
    catalog: Vec<CharacteristicHandle>,
    script: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<Call>>,
    links: Mutex<HashMap<PeripheralAddress, LinkSink>>,
    held: Mutex<Vec<Completion>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    refuse_local: AtomicBool,
    stall_local: AtomicBool,
}

impl ScriptedTransport {
    /// Transport whose peripherals expose the given characteristics
    pub fn new(catalog: impl IntoIterator<Item = CharacteristicHandle>) -> Self {
        Self {
            catalog: catalog.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_script(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        lock(&self.script).extend(replies);
        self
    }

    pub fn push_reply(&self, reply: Reply) {
        lock(&self.script).push_back(reply);
    }

    /// Reject every local notification toggle
    pub fn refuse_local_notifications(&self, refuse: bool) {
        self.refuse_local.store(refuse, Ordering::SeqCst);
    }

    /// Make every local notification toggle hang forever
    pub fn stall_local_notifications(&self, stall: bool) {
        self.stall_local.store(stall, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn count_calls(&self, filter: impl Fn(&Call) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| filter(c)).count()
    }

    /// Highest number of requests that were outstanding at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Link sink registered by the last connect to `address`
    pub fn link(&self, address: &PeripheralAddress) -> Option<LinkSink> {
        lock(&self.links).get(address).cloned()
    }

    /// Push a notification value up the link of `address`
    pub fn notify(&self, address: &PeripheralAddress, handle: CharacteristicHandle, payload: Bytes) -> usize {
        self.link(address).map_or(0, |link| link.notify(handle, payload))
    }

    /// Drop the link of `address` as if the peripheral went away
    pub fn drop_link(&self, address: &PeripheralAddress) {
        let link = lock(&self.links).remove(address);
        if let Some(link) = link {
            link.disconnected();
        }
    }

    /// Completion tokens of requests answered with `Reply::Silent`
    pub fn take_held(&self) -> Vec<Completion> {
        let held: Vec<_> = lock(&self.held).drain(..).collect();
        self.in_flight.fetch_sub(held.len(), Ordering::SeqCst);
        held
    }

    fn record(&self, call: Call) {
        lock(&self.calls).push(call);
    }

    fn answer(&self, done: Completion) -> Result<()> {
        let reply = lock(&self.script).pop_front().unwrap_or(Reply::Succeed);
        debug!("[SCRIPTED] request {} answered with {:?}", done.sequence(), reply);

        if reply == Reply::Refuse {
            bail!("request refused by script");
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let (success, delay) = match reply {
            Reply::Silent => {
                lock(&self.held).push(done);
                return Ok(());
            }
            Reply::Abandon => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(done);
                return Ok(());
            }
            Reply::Succeed | Reply::Refuse => (true, None),
            Reply::Fail => (false, None),
            Reply::Delay(delay) => (true, Some(delay)),
        };

        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => tokio::task::yield_now().await,
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
            done.complete(success);
        });
        Ok(())
    }
}

#[async_trait]
impl GattTransport for ScriptedTransport {
    type Characteristic = ScriptedCharacteristic;

    async fn connect(&self, address: &PeripheralAddress, link: LinkSink, done: Completion) -> Result<()> {
        self.record(Call::Connect(address.clone()));
        lock(&self.links).insert(address.clone(), link);
        self.answer(done)
    }

    async fn characteristics(
        &self,
        address: &PeripheralAddress,
    ) -> Result<CharacteristicMap<Self::Characteristic>> {
        Ok(self
            .catalog
            .iter()
            .map(|handle| {
                let target = ScriptedCharacteristic {
                    address: address.clone(),
                    handle: *handle,
                };
                (*handle, target)
            })
            .collect())
    }

    async fn write_characteristic(
        &self,
        target: &Self::Characteristic,
        payload: Bytes,
        done: Completion,
    ) -> Result<()> {
        self.record(Call::Write {
            handle: target.handle,
            payload,
        });
        self.answer(done)
    }

    async fn write_descriptor(
        &self,
        target: &Self::Characteristic,
        descriptor: Uuid,
        value: Bytes,
        done: Completion,
    ) -> Result<()> {
        self.record(Call::WriteDescriptor {
            handle: target.handle,
            descriptor,
            value,
        });
        self.answer(done)
    }

    async fn set_local_notification(
        &self,
        _target: &Self::Characteristic,
        handle: CharacteristicHandle,
        enable: bool,
    ) -> Result<()> {
        self.record(Call::SetLocalNotification { handle, enable });
        if self.stall_local.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.refuse_local.load(Ordering::SeqCst) {
            bail!("local notification toggle refused");
        }
        Ok(())
    }

    async fn disconnect(&self, address: &PeripheralAddress) {
        self.record(Call::Disconnect(address.clone()));
        lock(&self.links).remove(address);
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
