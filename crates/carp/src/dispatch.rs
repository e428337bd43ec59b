//! Serialized event dispatch.
//!
//! All protocol work for a set of routers runs on one task. Timer
//! expiries, received advertisements, interface events and administrative
//! commands are queued on a single channel and handled strictly in order,
//! so a router never observes two events at once.
//!
//! [`channel`] hands out the [`CarpHandle`] before the [`Dispatcher`]
//! exists; packet readers can be wired to the handle first and the
//! dispatcher built afterwards.

use crate::error::{CarpError, CarpResult};
use crate::net::Network;
use crate::registry::{AddressBinding, InterfaceEvent, ReceivedAdvertisement, RouterRegistry};
use crate::router::{CarpRequest, RouterSnapshot};
use crate::suppress::SuppressionCounter;
use crate::timer::{TaskTimers, TimerKind};
use crate::types::{CarpOptions, CarpStats, RouterId};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

type Reply<T> = oneshot::Sender<CarpResult<T>>;

/// Units of work processed by the dispatcher
pub(crate) enum Work {
    Timer {
        router: RouterId,
        kind: TimerKind,
        generation: u64,
    },
    Advertisement(ReceivedAdvertisement),
    Interface(InterfaceEvent),
    Command(Command),
    Shutdown(oneshot::Sender<()>),
}

pub(crate) enum Command {
    CreateRouter(oneshot::Sender<RouterId>),
    DestroyRouter(RouterId, Reply<()>),
    SetConfig(RouterId, CarpRequest, Reply<RouterSnapshot>),
    GetConfig(RouterId, bool, Reply<RouterSnapshot>),
    AddAddress(RouterId, IpAddr, Reply<()>),
    RemoveAddress(RouterId, IpAddr, Reply<()>),
    ChangeAddress(RouterId, IpAddr, IpAddr, Reply<()>),
    SetAdminState(RouterId, bool, Reply<()>),
    Addresses(RouterId, Reply<Vec<AddressBinding>>),
    ParentInterface(RouterId, Reply<Option<String>>),
    Stats(oneshot::Sender<CarpStats>),
    Options(oneshot::Sender<CarpOptions>),
    SetOptions(CarpOptions, oneshot::Sender<()>),
    MasterFor(String, IpAddr, oneshot::Sender<bool>),
}

/// Cloneable entry point into a running dispatcher.
#[derive(Clone)]
pub struct CarpHandle {
    tx: mpsc::UnboundedSender<Work>,
    suppression: SuppressionCounter,
}

/// Receiving side of [`channel`], consumed by [`Dispatcher::new`]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Work>,
    tx: mpsc::WeakUnboundedSender<Work>,
    suppression: SuppressionCounter,
}

/// Create a dispatcher channel with its own suppression counter.
pub fn channel() -> (CarpHandle, Inbox) {
    channel_shared(SuppressionCounter::new())
}

/// Create a dispatcher channel that shares `suppression` with others.
pub fn channel_shared(suppression: SuppressionCounter) -> (CarpHandle, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let inbox = Inbox {
        rx,
        tx: tx.downgrade(),
        suppression: suppression.clone(),
    };
    (CarpHandle { tx, suppression }, inbox)
}

impl CarpHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> CarpResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Work::Command(make(reply)))
            .map_err(|_| CarpError::DispatcherClosed)?;
        rx.await.map_err(|_| CarpError::DispatcherClosed)
    }

    pub async fn create_router(&self) -> CarpResult<RouterId> {
        self.request(Command::CreateRouter).await
    }

    pub async fn destroy_router(&self, id: RouterId) -> CarpResult<()> {
        self.request(|r| Command::DestroyRouter(id, r)).await?
    }

    /// Apply a configuration request and return the resulting configuration.
    pub async fn set_config(&self, id: RouterId, request: CarpRequest) -> CarpResult<RouterSnapshot> {
        self.request(|r| Command::SetConfig(id, request, r)).await?
    }

    /// Current configuration; the key is only included when `privileged`.
    pub async fn get_config(&self, id: RouterId, privileged: bool) -> CarpResult<RouterSnapshot> {
        self.request(|r| Command::GetConfig(id, privileged, r)).await?
    }

    pub async fn add_address(&self, id: RouterId, address: IpAddr) -> CarpResult<()> {
        self.request(|r| Command::AddAddress(id, address, r)).await?
    }

    pub async fn remove_address(&self, id: RouterId, address: IpAddr) -> CarpResult<()> {
        self.request(|r| Command::RemoveAddress(id, address, r)).await?
    }

    pub async fn change_address(&self, id: RouterId, from: IpAddr, to: IpAddr) -> CarpResult<()> {
        self.request(|r| Command::ChangeAddress(id, from, to, r)).await?
    }

    pub async fn set_admin_state(&self, id: RouterId, up: bool) -> CarpResult<()> {
        self.request(|r| Command::SetAdminState(id, up, r)).await?
    }

    pub async fn addresses(&self, id: RouterId) -> CarpResult<Vec<AddressBinding>> {
        self.request(|r| Command::Addresses(id, r)).await?
    }

    pub async fn parent_interface(&self, id: RouterId) -> CarpResult<Option<String>> {
        self.request(|r| Command::ParentInterface(id, r)).await?
    }

    pub async fn stats(&self) -> CarpResult<CarpStats> {
        self.request(Command::Stats).await
    }

    pub async fn options(&self) -> CarpResult<CarpOptions> {
        self.request(Command::Options).await
    }

    pub async fn set_options(&self, options: CarpOptions) -> CarpResult<()> {
        self.request(|r| Command::SetOptions(options, r)).await
    }

    /// True if a local router is MASTER for `address` on `interface`.
    pub async fn master_for(&self, interface: &str, address: IpAddr) -> CarpResult<bool> {
        let interface = interface.to_string();
        self.request(|r| Command::MasterFor(interface, address, r))
            .await
    }

    /// Shared preemption suppression counter
    pub fn suppression(&self) -> &SuppressionCounter {
        &self.suppression
    }

    /// Queue a received advertisement. Never blocks.
    pub fn deliver(&self, packet: ReceivedAdvertisement) -> CarpResult<()> {
        self.tx
            .send(Work::Advertisement(packet))
            .map_err(|_| CarpError::DispatcherClosed)
    }

    /// Queue an interface or address change. Never blocks.
    pub fn interface_event(&self, event: InterfaceEvent) -> CarpResult<()> {
        self.tx
            .send(Work::Interface(event))
            .map_err(|_| CarpError::DispatcherClosed)
    }

    /// Stop every router (sending departures where MASTER) and end the
    /// dispatcher loop.
    pub async fn shutdown(&self) -> CarpResult<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Work::Shutdown(done))
            .map_err(|_| CarpError::DispatcherClosed)?;
        rx.await.map_err(|_| CarpError::DispatcherClosed)
    }
}

/// Owns the routers and processes queued work one item at a time.
pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<Work>,
    registry: RouterRegistry<TaskTimers>,
}

impl Dispatcher {
    pub fn new(inbox: Inbox, net: Arc<dyn Network>, options: CarpOptions) -> Self {
        let Inbox {
            rx,
            tx,
            suppression,
        } = inbox;
        let mut registry = RouterRegistry::new(net, TaskTimers::new(tx), suppression);
        registry.set_options(options);
        Self { rx, registry }
    }

    /// Run until [`CarpHandle::shutdown`] or until every handle is dropped.
    pub async fn run(mut self) {
        info!("CARP dispatcher started");

        while let Some(work) = self.rx.recv().await {
            match work {
                Work::Timer {
                    router,
                    kind,
                    generation,
                } => {
                    if self.registry.timers_mut().claim(router, kind, generation) {
                        self.registry.on_timer(router, kind);
                    } else {
                        trace!(%router, ?kind, generation, "stale timer expiry");
                    }
                }
                Work::Advertisement(packet) => self.registry.receive(&packet),
                Work::Interface(event) => {
                    debug!(?event, "interface event");
                    self.registry.handle_event(event);
                }
                Work::Command(command) => self.execute(command),
                Work::Shutdown(done) => {
                    self.registry.shutdown();
                    let _ = done.send(());
                    info!("CARP dispatcher stopped");
                    return;
                }
            }
        }

        self.registry.shutdown();
        info!("CARP dispatcher stopped, all handles dropped");
    }

    fn execute(&mut self, command: Command) {
        let reg = &mut self.registry;
        // A dropped reply receiver only means the caller went away.
        match command {
            Command::CreateRouter(r) => {
                let _ = r.send(reg.create_router());
            }
            Command::DestroyRouter(id, r) => {
                let _ = r.send(reg.destroy_router(id));
            }
            Command::SetConfig(id, request, r) => {
                let _ = r.send(reg.configure(id, &request));
            }
            Command::GetConfig(id, privileged, r) => {
                let _ = r.send(reg.snapshot(id, privileged));
            }
            Command::AddAddress(id, address, r) => {
                let _ = r.send(reg.add_address(id, address));
            }
            Command::RemoveAddress(id, address, r) => {
                let _ = r.send(reg.remove_address(id, address));
            }
            Command::ChangeAddress(id, from, to, r) => {
                let _ = r.send(reg.change_address(id, from, to));
            }
            Command::SetAdminState(id, up, r) => {
                let _ = r.send(reg.set_admin_state(id, up));
            }
            Command::Addresses(id, r) => {
                let _ = r.send(reg.addresses(id));
            }
            Command::ParentInterface(id, r) => {
                let _ = r.send(reg.parent_interface(id));
            }
            Command::Stats(r) => {
                let _ = r.send(reg.stats().clone());
            }
            Command::Options(r) => {
                let _ = r.send(reg.options());
            }
            Command::SetOptions(options, r) => {
                reg.set_options(options);
                let _ = r.send(());
            }
            Command::MasterFor(interface, address, r) => {
                let _ = r.send(reg.master_for(&interface, address));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;
    use crate::net::testing::RecordingNetwork;
    use crate::types::{CarpState, Interval};
    use std::time::Duration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn spawn(net: &Arc<RecordingNetwork>, options: CarpOptions) -> CarpHandle {
        let (handle, inbox) = channel();
        let net: Arc<dyn Network> = net.clone();
        tokio::spawn(Dispatcher::new(inbox, net, options).run());
        handle
    }

    async fn router(handle: &CarpHandle, vhid: u8, skew: u8, vaddr: &str) -> RouterId {
        let id = handle.create_router().await.unwrap();
        let request = CarpRequest {
            vhid: Some(vhid),
            timing: Some(Interval::new(1, skew)),
            key: Some(Authenticator::key_from_passphrase("secret")),
            ..Default::default()
        };
        handle.set_config(id, request).await.unwrap();
        handle.add_address(id, ip(vaddr)).await.unwrap();
        id
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_router_becomes_master() {
        let net = Arc::new(RecordingNetwork::with_address("eth0", "10.0.0.2/24"));
        let handle = spawn(&net, CarpOptions::default());
        let id = router(&handle, 1, 0, "10.0.0.100").await;

        let config = handle.get_config(id, false).await.unwrap();
        assert_eq!(config.state, CarpState::Backup);

        tokio::time::sleep(Duration::from_millis(3100)).await;
        let config = handle.get_config(id, false).await.unwrap();
        assert_eq!(config.state, CarpState::Master);
        assert!(handle.master_for("eth0", ip("10.0.0.100")).await.unwrap());

        tokio::time::sleep(Duration::from_secs(3)).await;
        let stats = handle.stats().await.unwrap();
        assert!(stats.opackets >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_router() {
        let net = Arc::new(RecordingNetwork::default());
        let handle = spawn(&net, CarpOptions::default());

        assert_eq!(
            handle.get_config(RouterId(42), false).await,
            Err(CarpError::UnknownRouter(RouterId(42)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_only_for_privileged() {
        let net = Arc::new(RecordingNetwork::with_address("eth0", "10.0.0.2/24"));
        let handle = spawn(&net, CarpOptions::default());
        let id = router(&handle, 1, 0, "10.0.0.100").await;

        assert!(handle.get_config(id, false).await.unwrap().key.is_none());
        assert_eq!(
            handle.get_config(id, true).await.unwrap().key,
            Some(Authenticator::key_from_passphrase("secret"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_sends_departure_and_closes() {
        let net = Arc::new(RecordingNetwork::with_address("eth0", "10.0.0.2/24"));
        let handle = spawn(&net, CarpOptions {
            preempt: true,
            ..Default::default()
        });
        router(&handle, 1, 0, "10.0.0.100").await;
        net.take();

        handle.shutdown().await.unwrap();

        let sent = net.transmits();
        assert_eq!(sent.len(), 1);
        let departure = crate::packet::Advertisement::decode(&sent[0]).unwrap();
        assert_eq!(departure.advbase, crate::types::CARP_BOW_OUT);

        assert_eq!(handle.create_router().await, Err(CarpError::DispatcherClosed));
        assert!(handle.deliver(ReceivedAdvertisement {
            interface: "eth0".to_string(),
            source: ip("10.0.0.9"),
            ttl: None,
            payload: Vec::new(),
        })
        .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_options_round_trip_through_dispatcher() {
        let net = Arc::new(RecordingNetwork::default());
        let handle = spawn(&net, CarpOptions::default());

        let options = CarpOptions {
            allow: false,
            preempt: true,
            log_bad_packets: false,
        };
        handle.set_options(options).await.unwrap();
        assert_eq!(handle.options().await.unwrap(), options);
    }
}
