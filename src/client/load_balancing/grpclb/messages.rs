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

//! In-memory representations of the `grpc.lb.v1` BalanceLoad messages.
//!
//! Wire encoding is the balancer transport's concern; the policy exchanges
//! these values through the [`BalancerTransport`] seam.
//!
//! [`BalancerTransport`]: super::remote_balancer::BalancerTransport

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::client::name_resolution::{Address, TCP_IP_NETWORK_TYPE};

/// A message sent by the client on the BalanceLoad stream.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadBalanceRequest {
    /// The first message on every stream.
    Initial(InitialLoadBalanceRequest),
    /// A periodic client stats report.
    Stats(ClientStats),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialLoadBalanceRequest {
    /// The name of the target service the client wants balancing for.
    pub name: String,
}

/// Aggregated client-side call counts since the last report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub num_calls_started: i64,
    pub num_calls_finished: i64,
    pub num_calls_finished_with_client_failed_to_send: i64,
    pub num_calls_finished_known_received: i64,
    pub calls_finished_with_drop: Vec<ClientStatsPerToken>,
}

impl ClientStats {
    /// Reports whether every counter is zero and the drop list is empty.
    pub fn is_zero(&self) -> bool {
        self.num_calls_started == 0
            && self.num_calls_finished == 0
            && self.num_calls_finished_with_client_failed_to_send == 0
            && self.num_calls_finished_known_received == 0
            && self.calls_finished_with_drop.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatsPerToken {
    pub load_balance_token: String,
    pub num_calls: i64,
}

/// A message received by the client on the BalanceLoad stream.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadBalanceResponse {
    /// The first message on every stream.
    Initial(InitialLoadBalanceResponse),
    /// A replacement backend list.
    ServerList(ServerList),
    /// Directs the client to enter fallback until the next server list.
    Fallback,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialLoadBalanceResponse {
    /// The interval at which the client should report stats.  Zero disables
    /// reporting.
    pub client_stats_report_interval: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerList {
    pub servers: Vec<Server>,
}

/// One slot in a server list.  A drop entry has no address; selecting it
/// fails the request and accounts it under the entry's token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Server {
    /// A raw IPv4 (4 byte) or IPv6 (16 byte) address.
    pub ip_address: Vec<u8>,
    pub port: i32,
    /// Opaque token the backend uses to attribute requests to the balancer
    /// decision that produced them.  Carried on each request as the
    /// `lb-token` metadata header.
    pub load_balance_token: String,
    pub drop: bool,
}

/// A validated server-list slot: either a connectable backend or a drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServerEntry {
    Backend { address: Address, token: String },
    Drop { token: String },
}

impl ServerEntry {
    pub(crate) fn token(&self) -> &str {
        match self {
            ServerEntry::Backend { token, .. } => token,
            ServerEntry::Drop { token } => token,
        }
    }
}

impl ServerList {
    /// Validates the list and converts it into pick-sequence entries.  Any
    /// malformed entry invalidates the whole list; the caller keeps serving
    /// from its previous state in that case.
    pub(crate) fn parse_entries(&self) -> Result<Vec<ServerEntry>, String> {
        self.servers.iter().map(Server::parse_entry).collect()
    }
}

impl Server {
    fn parse_entry(&self) -> Result<ServerEntry, String> {
        if self.drop {
            return Ok(ServerEntry::Drop {
                token: self.load_balance_token.clone(),
            });
        }
        let ip: IpAddr = match self.ip_address.len() {
            4 => {
                let octets: [u8; 4] = self.ip_address.as_slice().try_into().unwrap();
                Ipv4Addr::from(octets).into()
            }
            16 => {
                let octets: [u8; 16] = self.ip_address.as_slice().try_into().unwrap();
                Ipv6Addr::from(octets).into()
            }
            n => return Err(format!("invalid ip address length {n}, want 4 or 16")),
        };
        let port: u16 = self
            .port
            .try_into()
            .map_err(|_| format!("invalid port {}", self.port))?;
        Ok(ServerEntry::Backend {
            address: Address {
                network_type: TCP_IP_NETWORK_TYPE,
                address: SocketAddr::new(ip, port).to_string(),
                ..Default::default()
            },
            token: self.load_balance_token.clone(),
        })
    }
}
