//! Virtual router state machine.
//!
//! Transitions:
//! - INIT → MASTER on start when preemption is enabled and nothing is suppressed
//! - INIT → BACKUP on start otherwise
//! - BACKUP → MASTER on master-down expiry, on a slower master when
//!   preempting, or on a master certain to time out
//! - MASTER → BACKUP on an advertisement at least as frequent as our own
//! - any → INIT on stop, link loss or loss of the last active address
//!
//! Every method runs inside the dispatcher and reaches the outside world
//! only through [`RouterEnv`].

use crate::auth::{Authenticator, CarpKey};
use crate::error::{CarpError, CarpResult};
use crate::net::Network;
use crate::packet::Advertisement;
use crate::suppress::SuppressionCounter;
use crate::timer::{TimerKind, Timers};
use crate::types::{
    CARP_BOW_OUT, CARP_DEFAULT_ADVBASE, CARP_MAX_ADVSKEW, CARP_SENDAD_MAX_ERRORS,
    CARP_SENDAD_MIN_SUCCESS, CARP_SUPPRESSED_ADVSKEW, CARP_TTL, CarpOptions, CarpState, CarpStats,
    Family, InterfaceId, Interval, RouterId,
};
use crate::vaddr::{BackingAddress, VirtualAddressSet};
use serde::Serialize;
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Everything a router may touch outside itself during one event.
pub struct RouterEnv<'a> {
    pub net: &'a dyn Network,
    pub timers: &'a mut dyn Timers,
    pub suppression: &'a SuppressionCounter,
    pub options: &'a CarpOptions,
    pub stats: &'a mut CarpStats,

    /// Name of the interface the router is bound to
    pub interface: Option<&'a str>,

    /// Link state of that interface
    pub link_up: bool,

    /// Set when this event took the suppression counter from 0 to 1;
    /// every MASTER must then re-advertise at the suppressed skew.
    pub readvertise_all: bool,
}

impl RouterEnv<'_> {
    fn raise_suppression(&mut self) {
        if self.suppression.increment() == 1 {
            self.readvertise_all = true;
        }
    }
}

/// Administrative configuration request. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarpRequest {
    /// Force a transition on a running router
    pub state: Option<CarpState>,
    pub vhid: Option<u8>,
    pub timing: Option<Interval>,
    pub key: Option<CarpKey>,
}

/// Configuration and state as reported to administrators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterSnapshot {
    pub id: RouterId,
    pub vhid: u8,
    pub advbase: u8,
    pub advskew: u8,
    pub state: CarpState,
    pub admin_up: bool,
    /// Only filled in for privileged queries
    #[serde(skip)]
    pub key: Option<CarpKey>,
}

/// Result of deactivating one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Deactivated {
    pub family: Family,
    /// No active address of `family` is left
    pub family_empty: bool,
    /// No active address is left at all
    pub last: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdKind {
    Regular,
    /// 255/255, tells backups we are leaving; never re-armed
    Departure,
}

/// One CARP group
#[derive(Debug)]
pub struct VirtualRouter {
    id: RouterId,
    vhid: u8,
    advbase: u8,
    advskew: u8,
    state: CarpState,
    admin_up: bool,
    link_suppressed: bool,
    send_errors: u32,
    send_successes: u32,
    auth: Authenticator,
    addresses: VirtualAddressSet,
    interface: Option<InterfaceId>,
}

impl VirtualRouter {
    pub fn new(id: RouterId) -> Self {
        Self {
            id,
            vhid: 0,
            advbase: CARP_DEFAULT_ADVBASE,
            advskew: 0,
            state: CarpState::Init,
            admin_up: false,
            link_suppressed: false,
            send_errors: 0,
            send_successes: 0,
            auth: Authenticator::default(),
            addresses: VirtualAddressSet::new(),
            interface: None,
        }
    }

    pub fn id(&self) -> RouterId {
        self.id
    }

    pub fn vhid(&self) -> u8 {
        self.vhid
    }

    pub fn state(&self) -> CarpState {
        self.state
    }

    pub fn admin_up(&self) -> bool {
        self.admin_up
    }

    pub fn interface(&self) -> Option<InterfaceId> {
        self.interface
    }

    pub fn addresses(&self) -> &VirtualAddressSet {
        &self.addresses
    }

    pub fn send_errors(&self) -> u32 {
        self.send_errors
    }

    pub fn send_successes(&self) -> u32 {
        self.send_successes
    }

    pub fn counter(&self) -> u64 {
        self.auth.counter()
    }

    /// Interval as configured, ignoring ownership and suppression
    pub fn configured_interval(&self) -> Interval {
        Interval::new(self.advbase, self.advskew)
    }

    /// Interval this router competes with: owners run at zero skew and a
    /// suppressed cluster runs at no less than 240.
    pub fn effective_interval(&self, suppression: &SuppressionCounter) -> Interval {
        let mut skew = if self.addresses.has_owner() {
            0
        } else {
            self.advskew
        };
        if suppression.is_suppressed() && skew < CARP_SUPPRESSED_ADVSKEW {
            skew = CARP_SUPPRESSED_ADVSKEW;
        }
        Interval::new(self.advbase, skew)
    }

    pub fn snapshot(&self, with_key: bool) -> RouterSnapshot {
        RouterSnapshot {
            id: self.id,
            vhid: self.vhid,
            advbase: self.advbase,
            advskew: self.advskew,
            state: self.state,
            admin_up: self.admin_up,
            key: with_key.then(|| *self.auth.key()),
        }
    }

    /// Recompute the authentication state over vhid and active addresses.
    pub fn prepare(&mut self) {
        let active = self.addresses.active().map(|v| v.address);
        self.auth.prepare(self.vhid, active);
    }

    /// Bring the router to the state its inputs call for.
    pub fn start(&mut self, env: &mut RouterEnv<'_>) {
        if self.interface.is_none() || env.interface.is_none() {
            self.stop_timers(env);
            self.set_state(CarpState::Init);
            return;
        }

        if !self.is_runnable(env) {
            self.stop_timers(env);
            self.withdraw_routes(env);
            self.set_state(CarpState::Init);
            return;
        }

        match self.state {
            CarpState::Init => {
                if env.options.preempt && !env.suppression.is_suppressed() {
                    info!(router = %self.id, vhid = self.vhid, "INIT -> MASTER (preempting)");
                    self.become_master(env);
                } else {
                    info!(router = %self.id, vhid = self.vhid, "INIT -> BACKUP");
                    self.enter_backup(env);
                }
            }
            CarpState::Backup => {
                env.timers.cancel(self.id, TimerKind::Advertisement);
                self.arm_master_down(env);
            }
            CarpState::Master => {
                let interval = self.effective_interval(env.suppression);
                env.timers
                    .arm(self.id, TimerKind::Advertisement, interval.as_duration());
            }
        }
    }

    /// Leave the group. A hard detach skips the departure advertisement.
    pub fn stop(&mut self, env: &mut RouterEnv<'_>, detach: bool) {
        self.stop_timers(env);

        if !detach && self.state == CarpState::Master {
            self.send_advertisement(env, AdKind::Departure);
        }

        self.withdraw_routes(env);

        if self.link_suppressed {
            env.suppression.decrement();
            self.link_suppressed = false;
        }
        if self.send_errors >= CARP_SENDAD_MAX_ERRORS {
            env.suppression.decrement();
        }
        self.send_errors = 0;
        self.send_successes = 0;

        self.set_state(CarpState::Init);
    }

    /// Advertisement timer expired.
    pub fn on_advertisement_timeout(&mut self, env: &mut RouterEnv<'_>) {
        if self.state != CarpState::Master {
            debug!(router = %self.id, state = %self.state, "advertisement timer outside MASTER");
            return;
        }
        self.send_advertisement(env, AdKind::Regular);
    }

    /// Master-down timer expired.
    pub fn on_master_down_timeout(&mut self, env: &mut RouterEnv<'_>) {
        match self.state {
            CarpState::Backup => {
                info!(router = %self.id, vhid = self.vhid, "BACKUP -> MASTER (master down)");
                self.become_master(env);
            }
            CarpState::Init => {
                warn!(router = %self.id, vhid = self.vhid, "master-down event in INIT state");
            }
            CarpState::Master => {}
        }
    }

    /// Handle an authenticated-or-not advertisement addressed to our vhid.
    pub fn on_advertisement(
        &mut self,
        env: &mut RouterEnv<'_>,
        ad: &Advertisement,
    ) -> CarpResult<()> {
        if ad.vhid != self.vhid {
            return Ok(());
        }
        if !self.auth.verify(ad.counter, &ad.mac) {
            return Err(CarpError::AuthenticationFailure);
        }

        // No replay window: any authenticated counter is adopted.
        self.auth.accept_counter(ad.counter);

        let local = self.effective_interval(env.suppression);
        let remote = ad.interval();

        match self.state {
            CarpState::Init => {}
            CarpState::Master => {
                if remote <= local {
                    info!(
                        router = %self.id,
                        vhid = self.vhid,
                        %remote,
                        %local,
                        "MASTER -> BACKUP (more frequent advertisement received)"
                    );
                    self.enter_backup(env);
                }
            }
            CarpState::Backup => {
                if env.options.preempt && local < remote {
                    info!(router = %self.id, vhid = self.vhid, "BACKUP -> MASTER (preempting a slower master)");
                    self.become_master(env);
                } else if remote.exceeds_master_down(&local) {
                    info!(router = %self.id, vhid = self.vhid, "BACKUP -> MASTER (master timed out)");
                    self.become_master(env);
                } else {
                    self.arm_master_down(env);
                }
            }
        }
        Ok(())
    }

    /// Apply an administrative configuration request.
    ///
    /// `sibling_vhids` are the vhids of the other routers on our interface.
    pub fn configure(
        &mut self,
        env: &mut RouterEnv<'_>,
        request: &CarpRequest,
        sibling_vhids: &[u8],
    ) -> CarpResult<()> {
        if let Some(vhid) = request.vhid {
            if vhid == 0 {
                return Err(CarpError::InvalidParameter("vhid must be between 1 and 255"));
            }
            if sibling_vhids.contains(&vhid) {
                return Err(CarpError::DuplicateVhid(vhid));
            }
        }
        if let Some(timing) = request.timing {
            if timing.skew > CARP_MAX_ADVSKEW {
                return Err(CarpError::InvalidParameter("advskew must be between 0 and 254"));
            }
            if timing.base == 0 && timing.skew == 0 {
                return Err(CarpError::InvalidParameter("advertisement interval must be non-zero"));
            }
        }

        if let Some(target) = request.state {
            if self.admin_up && self.state != CarpState::Init && target != self.state {
                match target {
                    CarpState::Backup => {
                        info!(router = %self.id, vhid = self.vhid, "MASTER -> BACKUP (administrative)");
                        self.enter_backup(env);
                    }
                    CarpState::Master => self.on_master_down_timeout(env),
                    CarpState::Init => {}
                }
            }
        }

        if let Some(vhid) = request.vhid {
            self.vhid = vhid;
        }
        if let Some(timing) = request.timing {
            self.advbase = timing.base;
            self.advskew = timing.skew;
        }
        if let Some(key) = request.key {
            self.auth.set_key(key);
        }
        self.prepare();

        if request.vhid.is_none() && request.timing.is_none() {
            return Err(CarpError::InvalidParameter("neither vhid nor timing supplied"));
        }

        self.start(env);
        Ok(())
    }

    /// Administrative up/down.
    pub fn set_admin_state(&mut self, env: &mut RouterEnv<'_>, up: bool) {
        if up && !self.admin_up {
            self.admin_up = true;
            self.set_state(CarpState::Init);
            self.start(env);
        } else if !up && self.admin_up {
            self.admin_up = false;
            self.stop(env, false);
        }
    }

    /// Link state of the backing interface changed. `env.link_up` already
    /// carries the new state.
    pub fn set_link_state(&mut self, env: &mut RouterEnv<'_>, up: bool) {
        if up {
            self.set_state(CarpState::Init);
            self.start(env);
            if self.link_suppressed {
                env.suppression.decrement();
                self.link_suppressed = false;
            }
        } else {
            self.stop_timers(env);
            self.withdraw_routes(env);
            self.set_state(CarpState::Init);
            if !self.link_suppressed {
                self.link_suppressed = true;
                env.raise_suppression();
            }
        }
    }

    /// Re-send an advertisement right away if MASTER. Used when the
    /// suppression counter first becomes non-zero.
    pub fn readvertise(&mut self, env: &mut RouterEnv<'_>) {
        if self.admin_up && self.state == CarpState::Master {
            self.send_advertisement(env, AdKind::Regular);
        }
    }

    /// Reset to INIT and re-evaluate from scratch.
    pub(crate) fn restart(&mut self, env: &mut RouterEnv<'_>) {
        self.set_state(CarpState::Init);
        self.start(env);
    }

    pub(crate) fn set_admin_flag(&mut self, up: bool) {
        self.admin_up = up;
    }

    pub(crate) fn addresses_mut(&mut self) -> &mut VirtualAddressSet {
        &mut self.addresses
    }

    pub(crate) fn bind(&mut self, interface: InterfaceId) {
        debug_assert!(self.interface.is_none_or(|i| i == interface));
        self.interface = Some(interface);
    }

    pub(crate) fn unbind(&mut self) -> Option<InterfaceId> {
        self.interface.take()
    }

    /// Give `address` a backing, reset to INIT and re-evaluate.
    pub(crate) fn activate_address(
        &mut self,
        env: &mut RouterEnv<'_>,
        address: IpAddr,
        backing: BackingAddress,
        owner: bool,
    ) {
        if let Some(vaddr) = self.addresses.get_mut(&address) {
            vaddr.backing = Some(backing);
            vaddr.owner = owner;
        }
        debug!(router = %self.id, %address, backing = %backing.address, owner, "address activated");

        self.prepare();
        self.set_state(CarpState::Init);
        self.start(env);
    }

    /// Drop the backing of `address`. When it is the last active address
    /// the router is stopped first, so the departure still authenticates.
    pub(crate) fn deactivate_address(
        &mut self,
        env: &mut RouterEnv<'_>,
        address: IpAddr,
    ) -> Option<Deactivated> {
        let vaddr = self.addresses.get(&address)?;
        if !vaddr.is_active() {
            return None;
        }
        let family = vaddr.family();
        let last = self.addresses.active_count() == 1;

        if last {
            self.stop(env, false);
        }

        if let Some(vaddr) = self.addresses.get_mut(&address) {
            if vaddr.routed {
                if let Some(interface) = env.interface {
                    env.net.withdraw_route(address, interface);
                }
                vaddr.routed = false;
            }
            vaddr.backing = None;
            vaddr.owner = false;
        }
        debug!(router = %self.id, %address, "address deactivated");

        self.prepare();

        Some(Deactivated {
            family,
            family_empty: self.addresses.active_count_family(family) == 0,
            last,
        })
    }

    fn is_runnable(&self, env: &RouterEnv<'_>) -> bool {
        self.admin_up && env.link_up && self.vhid > 0 && self.addresses.active_count() > 0
    }

    fn set_state(&mut self, state: CarpState) {
        if self.state != state {
            debug!(router = %self.id, vhid = self.vhid, from = %self.state, to = %state, "state change");
            self.state = state;
        }
    }

    fn become_master(&mut self, env: &mut RouterEnv<'_>) {
        self.set_state(CarpState::Master);
        env.timers.cancel(self.id, TimerKind::MasterDown);
        self.send_advertisement(env, AdKind::Regular);
        self.announce(env);
        self.install_routes(env);
    }

    fn enter_backup(&mut self, env: &mut RouterEnv<'_>) {
        self.set_state(CarpState::Backup);
        env.timers.cancel(self.id, TimerKind::Advertisement);
        self.arm_master_down(env);
        self.withdraw_routes(env);
    }

    fn arm_master_down(&mut self, env: &mut RouterEnv<'_>) {
        let window = self.effective_interval(env.suppression).master_down();
        env.timers.arm(self.id, TimerKind::MasterDown, window);
    }

    fn stop_timers(&mut self, env: &mut RouterEnv<'_>) {
        env.timers.cancel(self.id, TimerKind::Advertisement);
        env.timers.cancel(self.id, TimerKind::MasterDown);
    }

    /// Source of advertisements for `family`: the backing of the lowest
    /// active address of that family.
    fn source(&self, family: Family) -> Option<IpAddr> {
        self.addresses
            .active()
            .find(|v| v.family() == family)
            .and_then(|v| v.backing)
            .map(|b| b.address)
    }

    fn send_advertisement(&mut self, env: &mut RouterEnv<'_>, kind: AdKind) {
        let Some(interface) = env.interface else {
            return;
        };

        let interval = match kind {
            AdKind::Regular => self.effective_interval(env.suppression),
            AdKind::Departure => Interval::new(CARP_BOW_OUT, CARP_BOW_OUT),
        };

        let mut failed = false;
        for family in [Family::Inet, Family::Inet6] {
            let Some(source) = self.source(family) else {
                continue;
            };

            let (counter, mac) = self.auth.generate();
            let ad = Advertisement::new(self.vhid, interval.base, interval.skew, counter, mac);

            match env
                .net
                .transmit(interface, source, family.group(), CARP_TTL, &ad.encode())
            {
                Ok(()) => env.stats.count_output(family),
                Err(e) => {
                    env.stats.oerrors += 1;
                    failed = true;
                    let error = CarpError::TransmitFailure(e.to_string());
                    warn!(router = %self.id, vhid = self.vhid, %family, %error, "advertisement not sent");
                }
            }
        }

        if kind == AdKind::Departure {
            return;
        }

        if failed {
            self.send_errors = self.send_errors.saturating_add(1);
            if self.send_errors == CARP_SENDAD_MAX_ERRORS {
                warn!(router = %self.id, vhid = self.vhid, "too many send errors, suppressing preemption");
                env.raise_suppression();
            }
            self.send_successes = 0;
        } else if self.send_errors >= CARP_SENDAD_MAX_ERRORS {
            self.send_successes = self.send_successes.saturating_add(1);
            if self.send_successes >= CARP_SENDAD_MIN_SUCCESS {
                info!(router = %self.id, vhid = self.vhid, "sending recovered, releasing suppression");
                env.suppression.decrement();
                self.send_errors = 0;
                self.send_successes = 0;
            }
        } else {
            self.send_errors = 0;
        }

        env.timers
            .arm(self.id, TimerKind::Advertisement, interval.as_duration());
    }

    fn announce(&self, env: &mut RouterEnv<'_>) {
        let Some(interface) = env.interface else {
            return;
        };
        for vaddr in self.addresses.active() {
            env.net.announce(interface, vaddr.address);
        }
    }

    fn install_routes(&mut self, env: &mut RouterEnv<'_>) {
        let Some(interface) = env.interface else {
            return;
        };
        for vaddr in self.addresses.iter_mut() {
            if vaddr.is_active() && !vaddr.routed {
                env.net.install_route(vaddr.address, interface);
                vaddr.routed = true;
            }
        }
    }

    fn withdraw_routes(&mut self, env: &mut RouterEnv<'_>) {
        let Some(interface) = env.interface else {
            return;
        };
        for vaddr in self.addresses.iter_mut() {
            if vaddr.routed {
                env.net.withdraw_route(vaddr.address, interface);
                vaddr.routed = false;
            }
        }
    }
}
