/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use tonic::metadata::MetadataMap;

use crate::client::load_balancing::{
    same_subchannel, ChannelController, FailingPicker, LbPolicy, LbPolicyBuilder, LbPolicyOptions,
    LbState, Pick, PickResult, Picker, QueuingPicker, Subchannel, SubchannelState,
    GLOBAL_LB_REGISTRY,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};
use crate::client::service_config::LbConfig;
use crate::client::ConnectivityState;
use crate::service::Request;

pub(crate) static POLICY_NAME: &str = "round_robin";
static START: Once = Once::new();

/// Register round robin as an LB policy.
pub fn reg() {
    START.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(RoundRobinBuilder {});
    });
}

#[derive(Debug)]
struct RoundRobinBuilder {}

impl LbPolicyBuilder for RoundRobinBuilder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy::new())
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

// Per-position subchannel bookkeeping.  The address list is kept in the order
// the resolver (or a parent policy) provided it, including duplicates: an
// address appearing k times holds k positions and therefore receives k/n of
// the picks.
struct PositionData {
    subchannel: Arc<dyn Subchannel>,
    state: ConnectivityState,
}

pub(crate) struct RoundRobinPolicy {
    positions: Vec<PositionData>,
    addresses: Vec<Address>,
    last_resolver_error: Option<String>,
    last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
    // The (aggregate state, ready position set) most recently published,
    // used to elide redundant picker updates.
    last_published: Option<(ConnectivityState, Vec<usize>)>,
}

impl RoundRobinPolicy {
    pub(crate) fn new() -> Self {
        Self {
            positions: Vec::new(),
            addresses: Vec::new(),
            last_resolver_error: None,
            last_connection_error: None,
            last_published: None,
        }
    }

    // Flatten the endpoints list by concatenating the ordered list of
    // addresses for each of the endpoints.  Duplicates are deliberately kept.
    fn address_list_from_endpoints(endpoints: &[Endpoint]) -> Vec<Address> {
        endpoints
            .iter()
            .flat_map(|ep| ep.addresses.clone())
            .collect()
    }

    fn ready_positions(&self) -> Vec<usize> {
        self.positions
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == ConnectivityState::Ready)
            .map(|(i, _)| i)
            .collect()
    }

    fn aggregate_state(&self) -> ConnectivityState {
        let mut has_connecting = false;
        for p in &self.positions {
            match p.state {
                ConnectivityState::Ready => return ConnectivityState::Ready,
                ConnectivityState::Connecting | ConnectivityState::Idle => has_connecting = true,
                ConnectivityState::TransientFailure => {}
            }
        }
        if has_connecting {
            ConnectivityState::Connecting
        } else {
            ConnectivityState::TransientFailure
        }
    }

    // Sends an aggregate picker based on the states of all positions, unless
    // nothing pick-relevant changed since the last published picker.
    fn update_picker(&mut self, channel_controller: &mut dyn ChannelController) {
        let aggregate_state = self.aggregate_state();
        let ready = self.ready_positions();
        if self.last_published.as_ref() == Some(&(aggregate_state, ready.clone())) {
            return;
        }

        let picker: Arc<dyn Picker> = match aggregate_state {
            ConnectivityState::Ready => Arc::new(RoundRobinPicker::new(
                ready
                    .iter()
                    .map(|i| self.positions[*i].subchannel.clone())
                    .collect(),
            )),
            ConnectivityState::Connecting | ConnectivityState::Idle => Arc::new(QueuingPicker {}),
            ConnectivityState::TransientFailure => Arc::new(FailingPicker {
                error: format!(
                    "last seen resolver error: {:?}, last seen connection error: {:?}",
                    self.last_resolver_error, self.last_connection_error,
                ),
            }),
        };
        self.last_published = Some((aggregate_state, ready));
        channel_controller.update_picker(LbState {
            connectivity_state: aggregate_state,
            picker,
        });
    }

    // Sets the policy's state to TRANSIENT_FAILURE with a picker returning the
    // error string provided, then requests re-resolution from the channel.
    fn move_to_transient_failure(
        &mut self,
        error: String,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.last_published = Some((ConnectivityState::TransientFailure, vec![]));
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(FailingPicker { error }),
        });
        channel_controller.request_resolution();
    }
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let endpoints = match update.endpoints {
            Ok(endpoints) => endpoints,
            Err(error) => {
                tracing::debug!("round_robin received error from resolver: {error}");
                self.last_resolver_error = Some(error.clone());
                // Enter or stay in TF if there is no good previous update.
                // Otherwise continue using the previous good update.
                if self.positions.is_empty()
                    || self.aggregate_state() == ConnectivityState::TransientFailure
                {
                    let err = format!("received error from name resolver: {error}");
                    self.move_to_transient_failure(err.clone(), channel_controller);
                    return Err(err.into());
                }
                return Err(error.into());
            }
        };

        let new_addresses = Self::address_list_from_endpoints(&endpoints);
        if new_addresses.is_empty() {
            self.positions = Vec::new();
            self.addresses = Vec::new();
            let err = "received empty address list from the name resolver";
            self.last_resolver_error = Some(err.into());
            self.move_to_transient_failure(err.into(), channel_controller);
            return Err(err.into());
        }

        // One subchannel per list position.  Retained addresses keep their
        // underlying connection through the channel's address-keyed pool, so
        // replacing the handles does not sever live transports.
        let mut positions = Vec::with_capacity(new_addresses.len());
        for address in &new_addresses {
            let subchannel = channel_controller.new_subchannel(address);
            subchannel.connect();
            positions.push(PositionData {
                subchannel,
                state: ConnectivityState::Idle,
            });
        }
        self.positions = positions;
        self.addresses = new_addresses;
        self.update_picker(channel_controller);
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        for p in self.positions.iter_mut() {
            if same_subchannel(&p.subchannel, &subchannel) {
                p.state = state.connectivity_state;
                if state.connectivity_state == ConnectivityState::Idle {
                    // Reconnect dropped connections immediately.
                    p.subchannel.connect();
                }
            }
        }
        if let Some(err) = &state.last_connection_error {
            self.last_connection_error = Some(err.clone());
        }
        self.update_picker(channel_controller);
    }

    fn work(&mut self, _channel_controller: &mut dyn ChannelController) {}

    fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {
        for p in &self.positions {
            if p.state == ConnectivityState::Idle {
                p.subchannel.connect();
            }
        }
    }
}

struct RoundRobinPicker {
    subchannels: Vec<Arc<dyn Subchannel>>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    fn new(subchannels: Vec<Arc<dyn Subchannel>>) -> Self {
        let random_index: usize = rand::random_range(..subchannels.len());
        Self {
            subchannels,
            next: AtomicUsize::new(random_index),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        let len = self.subchannels.len();
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % len;
        PickResult::Pick(Pick {
            subchannel: self.subchannels[idx].clone(),
            on_complete: None,
            metadata: MetadataMap::new(),
        })
    }
}
