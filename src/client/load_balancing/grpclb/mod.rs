/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

//! The grpclb LB policy.
//!
//! grpclb obtains the backend list from a remote look-aside load balancer
//! over a bidirectional `BalanceLoad` stream instead of using the resolved
//! addresses directly.  Resolved addresses tagged with
//! [`LoadBalancerAddress`] identify balancers; the remaining addresses form
//! the fallback backend list, used while no balancer is reachable or when
//! the balancer directs the client to fall back.
//!
//! The per-request pick over the balancer-provided backends is delegated to
//! a child policy (round_robin by default, pick_first via service config);
//! grpclb itself enforces the server list's drop plan, attaches each
//! backend's load-balance token to outgoing requests, and reports aggregated
//! call statistics to the balancer.

mod client_stats;
mod config;
mod picker;

pub mod messages;
pub mod remote_balancer;

#[cfg(test)]
mod test;

pub use picker::LB_TOKEN_METADATA_KEY;

use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::sync::mpsc;

use self::client_stats::LbClientStats;
use self::config::GrpclbConfig;
use self::messages::ServerEntry;
use self::picker::GrpclbPicker;
use self::remote_balancer::{BalancerClient, BalancerTransport};
use crate::client::load_balancing::{
    pick_first, round_robin, ChannelController, LbPolicy, LbPolicyBuilder, LbPolicyOptions,
    LbState, QueuingPicker, Subchannel, SubchannelState, WorkScheduler, GLOBAL_LB_REGISTRY,
};
use crate::client::name_resolution::{
    Address, Endpoint, LoadBalancerAddress, ResolverUpdate,
};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::client::ConnectivityState;
use crate::rt::{BoxedTaskHandle, Runtime};

pub static POLICY_NAME: &str = "grpclb";

/// How long the policy waits for the first server list before serving from
/// the resolver's fallback backends.
pub const DEFAULT_FALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Registers grpclb with the global LB registry, using the provided
/// transport to reach balancers.  The first registration wins.
pub fn reg(transport: Arc<dyn BalancerTransport>) {
    static START: Once = Once::new();
    START.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(GrpclbBuilder::new(transport));
    });
}

pub struct GrpclbBuilder {
    transport: Arc<dyn BalancerTransport>,
    fallback_timeout: Duration,
}

impl GrpclbBuilder {
    pub fn new(transport: Arc<dyn BalancerTransport>) -> Self {
        Self {
            transport,
            fallback_timeout: DEFAULT_FALLBACK_TIMEOUT,
        }
    }

    /// Overrides the initial fallback timeout.  Production deployments keep
    /// the default; tests use a short timeout.
    pub fn with_fallback_timeout(mut self, fallback_timeout: Duration) -> Self {
        self.fallback_timeout = fallback_timeout;
        self
    }
}

impl LbPolicyBuilder for GrpclbBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        // The child policies grpclb delegates to must be resolvable by name.
        pick_first::reg();
        round_robin::reg();
        Box::new(GrpclbPolicy::new(
            self.transport.clone(),
            self.fallback_timeout,
            options,
        ))
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        pick_first::reg();
        round_robin::reg();
        Ok(Some(LbConfig::new(GrpclbConfig::parse(config)?)))
    }
}

// Events posted to the policy's serial context by the balancer client and
// the fallback timer.
pub(crate) enum BalancerEvent {
    // A validated server list from the balancer.
    ServerList(Vec<ServerEntry>),
    // The balancer directed the client to enter fallback.
    Fallback,
    // The balancer stream failed or could not be established.
    StreamDisconnected,
    // The initial fallback timeout elapsed.
    FallbackTimerExpired,
}

// The policy's operating regime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    // No server list and no fallback trigger observed yet; picks queue.
    Initializing,
    // Serving the balancer-provided server list.
    Remote,
    // Serving the resolver's fallback backend list.
    Fallback,
}

pub struct GrpclbPolicy {
    transport: Arc<dyn BalancerTransport>,
    fallback_timeout: Duration,
    work_scheduler: Arc<dyn WorkScheduler>,
    runtime: Arc<dyn Runtime>,
    target: String,

    config: GrpclbConfig,
    child: Option<Box<dyn LbPolicy>>,
    // The child's most recent picker update, re-wrapped on publication.
    child_state: Option<LbState>,

    events_tx: mpsc::UnboundedSender<BalancerEvent>,
    events_rx: mpsc::UnboundedReceiver<BalancerEvent>,

    balancer: Option<BalancerClient>,
    stats: Arc<LbClientStats>,

    mode: Mode,
    server_list: Vec<ServerEntry>,
    tokens: Arc<HashMap<Address, String>>,
    // Cursor into the server list's pick sequence.  Shared with the pickers
    // built for the current list; replaced only when the list changes.
    drop_index: Arc<AtomicUsize>,
    fallback_backends: Vec<Address>,
    fallback_timer: Option<BoxedTaskHandle>,
}

impl GrpclbPolicy {
    fn new(
        transport: Arc<dyn BalancerTransport>,
        fallback_timeout: Duration,
        options: LbPolicyOptions,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            fallback_timeout,
            work_scheduler: options.work_scheduler,
            runtime: options.runtime,
            target: options.target,
            config: GrpclbConfig::default_config(),
            child: None,
            child_state: None,
            events_tx,
            events_rx,
            balancer: None,
            stats: Arc::new(LbClientStats::new()),
            mode: Mode::Initializing,
            server_list: Vec::new(),
            tokens: Arc::new(HashMap::new()),
            drop_index: Arc::new(AtomicUsize::new(0)),
            fallback_backends: Vec::new(),
            fallback_timer: None,
        }
    }

    fn arm_fallback_timer(&mut self) {
        if self.fallback_timer.is_some() {
            return;
        }
        let events = self.events_tx.clone();
        let work_scheduler = self.work_scheduler.clone();
        let runtime = self.runtime.clone();
        let timeout = self.fallback_timeout;
        self.fallback_timer = Some(self.runtime.spawn(Box::pin(async move {
            runtime.sleep(timeout).await;
            if events.send(BalancerEvent::FallbackTimerExpired).is_ok() {
                work_scheduler.schedule_work();
            }
        })));
    }

    fn cancel_fallback_timer(&mut self) {
        if let Some(timer) = self.fallback_timer.take() {
            timer.abort();
        }
    }

    fn child_connectivity(&self) -> ConnectivityState {
        self.child_state
            .as_ref()
            .map(|s| s.connectivity_state)
            .unwrap_or(ConnectivityState::Connecting)
    }

    // The ordered, duplicate-preserving backend address list the child policy
    // should currently be connected to.  Drop entries never reach the child.
    fn target_addresses(&self) -> Vec<Address> {
        match self.mode {
            Mode::Initializing => Vec::new(),
            Mode::Remote => self
                .server_list
                .iter()
                .filter_map(|entry| match entry {
                    ServerEntry::Backend { address, .. } => Some(address.clone()),
                    ServerEntry::Drop { .. } => None,
                })
                .collect(),
            Mode::Fallback => self.fallback_backends.clone(),
        }
    }

    // Feeds the child policy the current target address list, building the
    // child first if needed, and republishes the wrapped picker.
    fn refresh_child(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.mode == Mode::Initializing {
            return;
        }
        let addresses = self.target_addresses();
        if addresses.is_empty() {
            // No usable backend: queue picks until one appears.
            self.child = None;
            let state = LbState {
                connectivity_state: ConnectivityState::Connecting,
                picker: Arc::new(QueuingPicker {}),
            };
            self.child_state = Some(state.clone());
            channel_controller.update_picker(state);
            return;
        }

        if self.child.is_none() {
            self.child = Some(self.config.child_builder.build(LbPolicyOptions {
                work_scheduler: self.work_scheduler.clone(),
                runtime: self.runtime.clone(),
                target: self.target.clone(),
            }));
        }

        let endpoints = addresses
            .into_iter()
            .map(|address| Endpoint {
                addresses: vec![address],
                ..Default::default()
            })
            .collect();
        let update = ResolverUpdate {
            endpoints: Ok(endpoints),
            ..Default::default()
        };

        let mut wrapped = ChildController::new(channel_controller);
        let _ = self
            .child
            .as_mut()
            .unwrap()
            .resolver_update(update, None, &mut wrapped);
        let picker_update = wrapped.picker_update.take();
        self.publish_from_child(picker_update, channel_controller);
    }

    fn publish_from_child(
        &mut self,
        update: Option<LbState>,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(state) = update else {
            return;
        };
        self.child_state = Some(state);
        self.publish_picker(channel_controller);
    }

    // Publishes the current picker: in remote mode with a Ready child the
    // child picker is wrapped with the drop plan, token attachment, and
    // stats recording; in every other case the child's picker (queueing or
    // failing) passes through unchanged, so drops never fire while no
    // backend is usable and fallback picks carry no token.
    fn publish_picker(&mut self, channel_controller: &mut dyn ChannelController) {
        let Some(child_state) = &self.child_state else {
            return;
        };
        let state = if self.mode == Mode::Remote
            && child_state.connectivity_state == ConnectivityState::Ready
            && !self.server_list.is_empty()
        {
            LbState {
                connectivity_state: ConnectivityState::Ready,
                picker: Arc::new(GrpclbPicker::new(
                    self.server_list.clone().into(),
                    self.tokens.clone(),
                    self.drop_index.clone(),
                    child_state.picker.clone(),
                    self.stats.clone(),
                )),
            }
        } else {
            child_state.clone()
        };
        channel_controller.update_picker(state);
    }

    fn handle_server_list(
        &mut self,
        entries: Vec<ServerEntry>,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.cancel_fallback_timer();
        if self.mode == Mode::Remote && entries == self.server_list {
            // A duplicate of the list already being served; the pick
            // sequence continues uninterrupted.
            return;
        }
        if entries != self.server_list {
            tracing::debug!(
                "applying new server list with {} entries ({} drops)",
                entries.len(),
                entries
                    .iter()
                    .filter(|e| matches!(e, ServerEntry::Drop { .. }))
                    .count(),
            );
            self.tokens = Arc::new(
                entries
                    .iter()
                    .filter_map(|entry| match entry {
                        ServerEntry::Backend { address, token } => {
                            Some((address.clone(), token.clone()))
                        }
                        ServerEntry::Drop { .. } => None,
                    })
                    .collect(),
            );
            self.server_list = entries;
            self.drop_index = Arc::new(AtomicUsize::new(0));
        }
        if self.mode != Mode::Remote {
            tracing::info!("exiting fallback, serving balancer-provided backends");
        }
        self.mode = Mode::Remote;
        self.refresh_child(channel_controller);
    }

    fn enter_fallback(&mut self, channel_controller: &mut dyn ChannelController) {
        self.cancel_fallback_timer();
        if self.mode != Mode::Fallback {
            tracing::info!(
                "entering fallback, serving {} resolver-provided backends",
                self.fallback_backends.len()
            );
        }
        self.mode = Mode::Fallback;
        self.refresh_child(channel_controller);
    }
}

impl LbPolicy for GrpclbPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        // A child policy change rebuilds the child below with the current
        // target list; retained addresses keep their connections through the
        // channel's subchannel pool.
        let mut child_kind_changed = false;
        if let Some(config) = config {
            let config = config
                .convert_to::<GrpclbConfig>()
                .map_err(|err| format!("invalid grpclb config: {err}"))?;
            if config.child_builder.name() != self.config.child_builder.name() {
                tracing::debug!(
                    "switching child policy from {} to {}",
                    self.config.child_builder.name(),
                    config.child_builder.name()
                );
                child_kind_changed = true;
                self.child = None;
            }
            self.config = (*config).clone();
        }

        let endpoints = match update.endpoints {
            Ok(endpoints) => endpoints,
            Err(error) => {
                tracing::warn!("grpclb received error from resolver: {error}");
                // Keep serving from the previous state.
                return Err(error.into());
            }
        };

        let mut balancer_addresses = Vec::new();
        let mut fallback_backends = Vec::new();
        for endpoint in endpoints {
            for address in endpoint.addresses {
                if address.attributes.get::<LoadBalancerAddress>().is_some() {
                    balancer_addresses.push(address);
                } else {
                    fallback_backends.push(address);
                }
            }
        }
        self.fallback_backends = fallback_backends;

        if balancer_addresses.is_empty() {
            // The resolver has spoken: there is no balancer to consult.  Use
            // the fallback backends without requesting re-resolution.
            self.balancer = None;
            self.enter_fallback(channel_controller);
            return Ok(());
        }

        match &self.balancer {
            Some(balancer) => balancer.update_addresses(balancer_addresses),
            None => {
                self.balancer = Some(BalancerClient::new(
                    self.transport.clone(),
                    self.target.clone(),
                    balancer_addresses,
                    self.events_tx.clone(),
                    self.work_scheduler.clone(),
                    self.runtime.clone(),
                    self.stats.clone(),
                ));
                if self.mode == Mode::Initializing {
                    self.arm_fallback_timer();
                }
            }
        }

        if child_kind_changed || self.mode == Mode::Fallback {
            // Rebuild the child, or refresh the fallback list it serves.
            self.refresh_child(channel_controller);
        }
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let mut wrapped = ChildController::new(channel_controller);
        child.subchannel_update(subchannel, state, &mut wrapped);
        let picker_update = wrapped.picker_update.take();
        let resolution_requested = wrapped.resolution_requested;
        // In remote mode the backend list comes from the balancer, so the
        // child's re-resolution requests are meaningless to the resolver.
        if resolution_requested && self.mode == Mode::Fallback {
            channel_controller.request_resolution();
        }
        self.publish_from_child(picker_update, channel_controller);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                BalancerEvent::ServerList(entries) => {
                    self.handle_server_list(entries, channel_controller);
                }
                BalancerEvent::Fallback => {
                    self.enter_fallback(channel_controller);
                }
                BalancerEvent::StreamDisconnected => {
                    // The balancer being unreachable only matters once the
                    // backends it gave us stop working too.
                    if self.mode == Mode::Remote
                        && self.child_connectivity() != ConnectivityState::Ready
                    {
                        self.enter_fallback(channel_controller);
                    }
                }
                BalancerEvent::FallbackTimerExpired => {
                    if self.mode == Mode::Initializing {
                        self.enter_fallback(channel_controller);
                    }
                }
            }
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let mut wrapped = ChildController::new(channel_controller);
        child.exit_idle(&mut wrapped);
        let picker_update = wrapped.picker_update.take();
        self.publish_from_child(picker_update, channel_controller);
    }
}

impl Drop for GrpclbPolicy {
    fn drop(&mut self) {
        // Top-down teardown: the balancer client task and the timer are
        // aborted here; subchannels go with the child.
        self.cancel_fallback_timer();
        self.balancer = None;
    }
}

// Wraps the channel controller for calls into the child policy: subchannel
// creation passes through, picker updates and re-resolution requests are
// captured so the policy can re-wrap and filter them.
struct ChildController<'a> {
    inner: &'a mut dyn ChannelController,
    picker_update: Option<LbState>,
    resolution_requested: bool,
}

impl<'a> ChildController<'a> {
    fn new(inner: &'a mut dyn ChannelController) -> Self {
        Self {
            inner,
            picker_update: None,
            resolution_requested: false,
        }
    }
}

impl ChannelController for ChildController<'_> {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        self.inner.new_subchannel(address)
    }

    fn update_picker(&mut self, update: LbState) {
        self.picker_update = Some(update);
    }

    fn request_resolution(&mut self) {
        self.resolution_requested = true;
    }
}
