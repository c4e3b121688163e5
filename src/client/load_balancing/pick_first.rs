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

use std::collections::HashSet;
use std::error::Error;
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

pub(crate) static POLICY_NAME: &str = "pick_first";

pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(Builder {});
    });
}

struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy::new())
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

pub(crate) struct PickFirstPolicy {
    subchannel_list: Option<SubchannelList>,
    selected_subchannel: Option<Arc<dyn Subchannel>>,
    addresses: Vec<Address>,
    last_resolver_error: Option<String>,
    last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
    connectivity_state: ConnectivityState,
}

impl PickFirstPolicy {
    pub(crate) fn new() -> Self {
        Self {
            subchannel_list: None,
            selected_subchannel: None,
            addresses: Vec::new(),
            last_resolver_error: None,
            last_connection_error: None,
            connectivity_state: ConnectivityState::Connecting,
        }
    }

    fn address_list_from_endpoints(&self, endpoints: &[Endpoint]) -> Vec<Address> {
        // Flatten the endpoints list by concatenating the ordered list of
        // addresses for each of the endpoints, removing duplicates.  Order
        // remains significant: connections are attempted front to back.
        let mut addresses: Vec<Address> = endpoints
            .iter()
            .flat_map(|ep| ep.addresses.clone())
            .collect();
        let mut uniques = HashSet::new();
        addresses.retain(|e| uniques.insert(e.clone()));
        addresses
    }

    fn move_to_connecting(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.connectivity_state == ConnectivityState::Connecting {
            return;
        }
        self.connectivity_state = ConnectivityState::Connecting;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        });
    }

    fn move_to_ready(
        &mut self,
        sc: Arc<dyn Subchannel>,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.connectivity_state = ConnectivityState::Ready;
        self.selected_subchannel = Some(sc.clone());
        self.subchannel_list = None;
        self.last_connection_error = None;
        self.last_resolver_error = None;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Ready,
            picker: Arc::new(OneSubchannelPicker { sc }),
        });
    }

    fn move_to_transient_failure(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::TransientFailure;
        let err = format!(
            "last seen resolver error: {:?}, last seen connection error: {:?}",
            self.last_resolver_error, self.last_connection_error,
        );
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(FailingPicker { error: err }),
        });
        channel_controller.request_resolution();
    }
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let endpoints = match update.endpoints {
            Ok(endpoints) => endpoints,
            Err(error) => {
                tracing::debug!("pick_first received error from resolver: {error}");
                self.last_resolver_error = Some(error.clone());
                if self.addresses.is_empty()
                    || self.connectivity_state == ConnectivityState::TransientFailure
                {
                    self.move_to_transient_failure(channel_controller);
                }
                // Continue using the previous good update, if one exists.
                return Err(error.into());
            }
        };

        let new_addresses = self.address_list_from_endpoints(&endpoints);
        if new_addresses.is_empty() {
            self.subchannel_list = None;
            self.selected_subchannel = None;
            self.addresses = Vec::new();
            let err = String::from("received empty address list from the name resolver");
            self.last_resolver_error = Some(err.clone());
            self.move_to_transient_failure(channel_controller);
            channel_controller.request_resolution();
            return Err(err.into());
        }

        // Stick with the currently selected subchannel if its address survived
        // the update.
        if let Some(selected) = &self.selected_subchannel {
            if new_addresses.contains(&selected.address()) {
                self.addresses = new_addresses;
                return Ok(());
            }
        }
        self.selected_subchannel = None;

        let mut list = SubchannelList::new(&new_addresses, channel_controller);
        list.connect_to_next_subchannel();
        self.subchannel_list = Some(list);
        self.addresses = new_addresses;
        self.move_to_connecting(channel_controller);
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        // Any state change for the currently selected subchannel means we are
        // no longer connected; start over from the top of the address list.
        if let Some(selected) = &self.selected_subchannel {
            if same_subchannel(selected, &subchannel)
                && state.connectivity_state != ConnectivityState::Ready
            {
                self.selected_subchannel = None;
                let mut list = SubchannelList::new(&self.addresses.clone(), channel_controller);
                list.connect_to_next_subchannel();
                self.subchannel_list = Some(list);
                self.connectivity_state = ConnectivityState::Idle;
                self.move_to_connecting(channel_controller);
                return;
            }
        }

        let Some(list) = &mut self.subchannel_list else {
            return;
        };
        if !list.contains(&subchannel) {
            return;
        }

        match state.connectivity_state {
            ConnectivityState::Ready => {
                self.move_to_ready(subchannel, channel_controller);
            }
            ConnectivityState::Connecting => {
                self.move_to_connecting(channel_controller);
            }
            ConnectivityState::TransientFailure => {
                self.last_connection_error = state.last_connection_error.clone();
                if !list.connect_to_next_subchannel() {
                    // Every address has failed at least once this pass.
                    self.move_to_transient_failure(channel_controller);
                    self.subchannel_list = None;
                }
            }
            ConnectivityState::Idle => {
                subchannel.connect();
            }
        }
    }

    fn work(&mut self, _channel_controller: &mut dyn ChannelController) {}

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.selected_subchannel.is_some() || self.subchannel_list.is_some() {
            return;
        }
        if self.addresses.is_empty() {
            return;
        }
        let mut list = SubchannelList::new(&self.addresses.clone(), channel_controller);
        list.connect_to_next_subchannel();
        self.subchannel_list = Some(list);
        self.move_to_connecting(channel_controller);
    }
}

// A picker that always returns the same subchannel.
struct OneSubchannelPicker {
    sc: Arc<dyn Subchannel>,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Pick(Pick {
            subchannel: self.sc.clone(),
            on_complete: None,
            metadata: MetadataMap::new(),
        })
    }
}

// A list of subchannels created from the most recent address list, in order.
// Tracks the connection attempt cursor for the current pass.
struct SubchannelList {
    subchannels: Vec<Arc<dyn Subchannel>>,
    current_idx: Option<usize>,
}

impl SubchannelList {
    fn new(addresses: &[Address], channel_controller: &mut dyn ChannelController) -> Self {
        let subchannels = addresses
            .iter()
            .map(|a| channel_controller.new_subchannel(a))
            .collect();
        Self {
            subchannels,
            current_idx: None,
        }
    }

    fn contains(&self, sc: &Arc<dyn Subchannel>) -> bool {
        self.subchannels.iter().any(|s| same_subchannel(s, sc))
    }

    // Initiates a connection attempt to the next subchannel in the list.
    // Returns false once the end of the list has been reached.
    fn connect_to_next_subchannel(&mut self) -> bool {
        let next = match self.current_idx {
            None => 0,
            Some(idx) => idx + 1,
        };
        if next >= self.subchannels.len() {
            return false;
        }
        self.current_idx = Some(next);
        self.subchannels[next].connect();
        true
    }
}
