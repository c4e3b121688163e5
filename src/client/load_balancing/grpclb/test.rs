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

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tonic::{async_trait, Status};

use super::messages::{
    ClientStats, InitialLoadBalanceResponse, LoadBalanceRequest, LoadBalanceResponse, Server,
    ServerList,
};
use super::remote_balancer::{BalancerStream, BalancerTransport};
use super::{GrpclbBuilder, DEFAULT_FALLBACK_TIMEOUT, LB_TOKEN_METADATA_KEY};
use crate::attributes::Attributes;
use crate::client::load_balancing::test_utils::{self, TestChannelController, TestEvent, TestWorkScheduler};
use crate::client::load_balancing::{
    CompletedCall, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, PickResult, Subchannel,
    SubchannelState,
};
use crate::client::name_resolution::{Address, Endpoint, LoadBalancerAddress, ResolverUpdate};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::client::ConnectivityState;
use crate::rt::default_runtime;

const TEST_SERVICE_NAME: &str = "backends.test.example.com";
const LB_SERVER_NAME: &str = "lb.server.test.example.com";
const LB_TOKEN: &str = "iamatoken";
const PUMP_TIMEOUT: Duration = Duration::from_secs(10);

const BALANCER0: &str = "10.9.9.1:2000";
const BALANCER1: &str = "10.9.9.2:2000";
const BACKEND0: &str = "10.0.0.1:80";
const BACKEND1: &str = "10.0.0.2:80";
const BACKEND2: &str = "10.0.0.3:80";
const FALLBACK_BACKEND: &str = "10.1.1.1:80";

// ----- fake balancer and transport -----

struct FakeBalancerState {
    stopped: bool,
    // The send side of the currently connected stream, if any.
    stream_tx: Option<mpsc::UnboundedSender<Result<LoadBalanceResponse, Status>>>,
    // Responses pushed while no stream is connected; delivered on the next
    // stream, mirroring how a real balancer serves its current state.
    queued: Vec<LoadBalanceResponse>,
}

/// An in-process stand-in for the remote balancer, serving one BalanceLoad
/// stream at a time.
struct FakeBalancer {
    report_interval: Duration,
    requests_tx: mpsc::UnboundedSender<LoadBalanceRequest>,
    state: Mutex<FakeBalancerState>,
}

impl FakeBalancer {
    fn new(report_interval: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<LoadBalanceRequest>) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let balancer = Arc::new(Self {
            report_interval,
            requests_tx,
            state: Mutex::new(FakeBalancerState {
                stopped: false,
                stream_tx: None,
                queued: Vec::new(),
            }),
        });
        (balancer, requests_rx)
    }

    fn push(&self, response: LoadBalanceResponse) {
        let mut state = self.state.lock().unwrap();
        if let Some(tx) = &state.stream_tx {
            if tx.send(Ok(response.clone())).is_ok() {
                return;
            }
        }
        state.queued.push(response);
    }

    fn send_server_list(&self, servers: Vec<Server>) {
        self.push(LoadBalanceResponse::ServerList(ServerList { servers }));
    }

    fn send_fallback(&self) {
        self.push(LoadBalanceResponse::Fallback);
    }

    /// Terminates the current stream and refuses further connections.
    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        state.stream_tx = None;
    }
}

#[derive(Default)]
struct FakeTransport {
    balancers: Mutex<HashMap<String, Arc<FakeBalancer>>>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::default()
    }

    fn register(&self, address: &str, balancer: Arc<FakeBalancer>) {
        self.balancers
            .lock()
            .unwrap()
            .insert(address.to_string(), balancer);
    }
}

#[async_trait]
impl BalancerTransport for FakeTransport {
    async fn connect(
        &self,
        address: Address,
        server_name: String,
    ) -> Result<Box<dyn BalancerStream>, Status> {
        assert_eq!(server_name, LB_SERVER_NAME);
        let balancer = self
            .balancers
            .lock()
            .unwrap()
            .get(&address.address)
            .cloned()
            .ok_or_else(|| Status::unavailable("connection refused"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = balancer.state.lock().unwrap();
            if state.stopped {
                return Err(Status::unavailable("connection refused"));
            }
            tx.send(Ok(LoadBalanceResponse::Initial(InitialLoadBalanceResponse {
                client_stats_report_interval: balancer.report_interval,
            })))
            .unwrap();
            for response in state.queued.drain(..) {
                tx.send(Ok(response)).unwrap();
            }
            state.stream_tx = Some(tx);
        }
        Ok(Box::new(FakeStream {
            balancer,
            responses: rx,
        }))
    }
}

struct FakeStream {
    balancer: Arc<FakeBalancer>,
    responses: mpsc::UnboundedReceiver<Result<LoadBalanceResponse, Status>>,
}

#[async_trait]
impl BalancerStream for FakeStream {
    async fn send(&mut self, request: LoadBalanceRequest) -> Result<(), Status> {
        if self.balancer.state.lock().unwrap().stopped {
            return Err(Status::unavailable("transport closed"));
        }
        let _ = self.balancer.requests_tx.send(request);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<LoadBalanceResponse>, Status> {
        match self.responses.recv().await {
            Some(Ok(response)) => Ok(Some(response)),
            Some(Err(status)) => Err(status),
            None => Ok(None),
        }
    }
}

// ----- address and server-list helpers -----

fn balancer_address(addr: &str) -> Address {
    Address {
        address: addr.to_string(),
        attributes: Attributes::new().add(LoadBalancerAddress {
            server_name: LB_SERVER_NAME.to_string(),
        }),
        ..Default::default()
    }
}

fn backend_address(addr: &str) -> Address {
    Address {
        address: addr.to_string(),
        ..Default::default()
    }
}

// `addr` must be one of the BACKEND* constants ("a.b.c.d:port").
fn server(addr: &str) -> Server {
    let (ip, port) = addr.split_once(':').unwrap();
    Server {
        ip_address: ip
            .split('.')
            .map(|octet| octet.parse().unwrap())
            .collect(),
        port: port.parse().unwrap(),
        load_balance_token: LB_TOKEN.to_string(),
        drop: false,
    }
}

fn drop_server(token: &str) -> Server {
    Server {
        load_balance_token: token.to_string(),
        drop: true,
        ..Default::default()
    }
}

// ----- test fixture -----

// The outcome of one pick attempt against a published picker.
enum PickOutcome {
    Backend(String),
    Dropped,
    Queued,
    Failed,
}

// Performs one pick and, for successful picks, completes the simulated RPC
// with bytes sent and received so call stats are recorded.
fn do_pick(state: &LbState) -> PickOutcome {
    let req = test_utils::new_request();
    match state.picker.pick(&req) {
        PickResult::Pick(pick) => {
            let addr = pick.subchannel.address().address;
            if let Some(on_complete) = pick.on_complete {
                on_complete(&CompletedCall {
                    bytes_sent: true,
                    bytes_received: true,
                });
            }
            PickOutcome::Backend(addr)
        }
        PickResult::Drop(status) => {
            assert_eq!(status.code(), tonic::Code::Unavailable);
            PickOutcome::Dropped
        }
        PickResult::Queue => PickOutcome::Queued,
        PickResult::Fail(_) => PickOutcome::Failed,
    }
}

fn picks_backend(state: &LbState, addr: &str) -> bool {
    matches!(do_pick(state), PickOutcome::Backend(a) if a == addr)
}

/// Drives a grpclb policy the way the channel would: policy methods are
/// invoked from the test, `ScheduleWork` events trigger `work`, and subchannel
/// connect attempts complete against the set of backends marked up.
struct Fixture {
    policy: Box<dyn LbPolicy>,
    tcc: TestChannelController,
    rx_events: mpsc::UnboundedReceiver<TestEvent>,
    subchannels: Vec<Arc<dyn Subchannel>>,
    up: HashSet<String>,
    saw_resolution_request: bool,
}

impl Fixture {
    fn new(transport: Arc<FakeTransport>, fallback_timeout: Duration) -> Self {
        let (tx_events, rx_events) = mpsc::unbounded_channel();
        let work_scheduler = Arc::new(TestWorkScheduler {
            tx_events: tx_events.clone(),
        });
        let builder =
            GrpclbBuilder::new(transport as Arc<dyn BalancerTransport>).with_fallback_timeout(fallback_timeout);
        let policy = builder.build(LbPolicyOptions {
            work_scheduler,
            runtime: default_runtime(),
            target: TEST_SERVICE_NAME.to_string(),
        });
        Self {
            policy,
            tcc: TestChannelController { tx_events },
            rx_events,
            subchannels: Vec::new(),
            up: HashSet::new(),
            saw_resolution_request: false,
        }
    }

    fn mark_up(&mut self, addrs: &[&str]) {
        for addr in addrs {
            self.up.insert(addr.to_string());
        }
    }

    fn resolver_update(&mut self, addresses: Vec<Address>, config: Option<&LbConfig>) {
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
        let _ = self.policy.resolver_update(update, config, &mut self.tcc);
    }

    // Marks a backend down and fails its existing connections.
    fn stop_backend(&mut self, addr: &str) {
        self.up.remove(addr);
        let failed: Vec<_> = self
            .subchannels
            .iter()
            .filter(|sc| sc.address().address == addr)
            .cloned()
            .collect();
        for sc in failed {
            self.policy.subchannel_update(
                sc,
                &SubchannelState {
                    connectivity_state: ConnectivityState::TransientFailure,
                    last_connection_error: Some(Arc::from(Box::from("backend stopped".to_owned()))),
                },
                &mut self.tcc,
            );
        }
    }

    fn handle_event(&mut self, event: TestEvent) -> Option<LbState> {
        match event {
            TestEvent::ScheduleWork => {
                self.policy.work(&mut self.tcc);
                None
            }
            TestEvent::NewSubchannel(sc) => {
                self.subchannels.push(sc);
                None
            }
            TestEvent::Connect(address) => {
                // Complete the connection attempt against the simulated
                // backend fleet.
                let up = self.up.contains(&address.address);
                let targets: Vec<_> = self
                    .subchannels
                    .iter()
                    .filter(|sc| sc.address().address == address.address)
                    .cloned()
                    .collect();
                for sc in targets {
                    let state = if up {
                        SubchannelState {
                            connectivity_state: ConnectivityState::Ready,
                            last_connection_error: None,
                        }
                    } else {
                        SubchannelState {
                            connectivity_state: ConnectivityState::TransientFailure,
                            last_connection_error: Some(Arc::from(Box::from(
                                "connection refused".to_owned(),
                            ))),
                        }
                    };
                    self.policy.subchannel_update(sc, &state, &mut self.tcc);
                }
                None
            }
            TestEvent::UpdatePicker(state) => Some(state),
            TestEvent::RequestResolution => {
                self.saw_resolution_request = true;
                None
            }
        }
    }

    // Processes events until a published picker satisfies the predicate.
    async fn pump_until_picker(&mut self, mut pred: impl FnMut(&LbState) -> bool) -> LbState {
        let deadline = tokio::time::Instant::now() + PUMP_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.rx_events.recv())
                .await
                .expect("timed out waiting for a matching picker")
                .expect("event channel closed");
            if let Some(state) = self.handle_event(event) {
                if pred(&state) {
                    return state;
                }
            }
        }
    }
}

// Accumulates a stats report into a running total, the way the balancer
// aggregates reports across intervals.
fn merge_stats(total: &mut ClientStats, report: &ClientStats) {
    total.num_calls_started += report.num_calls_started;
    total.num_calls_finished += report.num_calls_finished;
    total.num_calls_finished_with_client_failed_to_send +=
        report.num_calls_finished_with_client_failed_to_send;
    total.num_calls_finished_known_received += report.num_calls_finished_known_received;
    for per_token in &report.calls_finished_with_drop {
        match total
            .calls_finished_with_drop
            .iter_mut()
            .find(|t| t.load_balance_token == per_token.load_balance_token)
        {
            Some(t) => t.num_calls += per_token.num_calls,
            None => total.calls_finished_with_drop.push(per_token.clone()),
        }
    }
    total
        .calls_finished_with_drop
        .sort_by(|a, b| a.load_balance_token.cmp(&b.load_balance_token));
}

// ----- tests -----

#[test]
fn builder_name_and_config() {
    let transport = FakeTransport::new();
    let builder = GrpclbBuilder::new(transport as Arc<dyn BalancerTransport>);
    assert_eq!(builder.name(), "grpclb");

    let config = ParsedJsonLbConfig::new(r#"{"childPolicy":[{"pick_first":{}}]}"#).unwrap();
    assert!(builder.parse_config(&config).unwrap().is_some());

    assert!(ParsedJsonLbConfig::new("not json").is_err());
}

#[tokio::test]
async fn weighted_round_robin_follows_server_list_order() {
    let transport = FakeTransport::new();
    let (balancer, _requests) = FakeBalancer::new(Duration::ZERO);
    transport.register(BALANCER0, balancer.clone());
    balancer.send_server_list(vec![
        server(BACKEND0),
        server(BACKEND0),
        server(BACKEND1),
        server(BACKEND0),
        server(BACKEND1),
    ]);

    let mut f = Fixture::new(transport, DEFAULT_FALLBACK_TIMEOUT);
    f.mark_up(&[BACKEND0, BACKEND1]);
    f.resolver_update(vec![balancer_address(BALANCER0)], None);

    // With every position connected, 20 consecutive picks must contain two
    // full cycles of the duplicated pattern.
    let want = "00101".repeat(2);
    f.pump_until_picker(|state| {
        if state.connectivity_state != ConnectivityState::Ready {
            return false;
        }
        let mut got = String::new();
        for _ in 0..20 {
            match do_pick(state) {
                PickOutcome::Backend(addr) if addr == BACKEND0 => got.push('0'),
                PickOutcome::Backend(addr) if addr == BACKEND1 => got.push('1'),
                _ => return false,
            }
        }
        got.contains(&want)
    })
    .await;
}

#[tokio::test]
async fn drops_cycle_and_index_survives_backend_loss() {
    let transport = FakeTransport::new();
    let (balancer, _requests) = FakeBalancer::new(Duration::ZERO);
    transport.register(BALANCER0, balancer.clone());
    balancer.send_server_list(vec![
        server(BACKEND0),
        server(BACKEND1),
        drop_server(LB_TOKEN),
    ]);

    let mut f = Fixture::new(transport, DEFAULT_FALLBACK_TIMEOUT);
    f.mark_up(&[BACKEND0, BACKEND1]);
    f.resolver_update(vec![balancer_address(BALANCER0)], None);

    // Wait until both backends participate: six consecutive picks then hit
    // both backends and exactly two drops.
    let state = f
        .pump_until_picker(|state| {
            if state.connectivity_state != ConnectivityState::Ready {
                return false;
            }
            let mut backends = HashSet::new();
            let mut drops = 0;
            for _ in 0..6 {
                match do_pick(state) {
                    PickOutcome::Backend(addr) => {
                        backends.insert(addr);
                    }
                    PickOutcome::Dropped => drops += 1,
                    _ => return false,
                }
            }
            backends.len() == 2 && drops == 2
        })
        .await;

    // Align on the pick sequence: advance to just past a drop, then one more
    // successful pick so the cursor is mid-cycle.
    let mut advanced = 0;
    while !matches!(do_pick(&state), PickOutcome::Dropped) {
        advanced += 1;
        assert!(advanced < 4, "no drop within a full cycle");
    }
    assert!(matches!(do_pick(&state), PickOutcome::Backend(_)));

    // Stopping a backend rebuilds the picker but must not reset the drop
    // cursor: the next picks are (backend, drop, backend), not
    // (backend, backend, drop).
    f.stop_backend(BACKEND0);
    let state = f
        .pump_until_picker(|state| state.connectivity_state == ConnectivityState::Ready)
        .await;
    assert!(picks_backend(&state, BACKEND1));
    assert!(matches!(do_pick(&state), PickOutcome::Dropped));
    assert!(picks_backend(&state, BACKEND1));
}

#[tokio::test]
async fn initial_fallback_timeout_then_recovery() {
    // No balancer is registered yet: connection attempts fail.
    let transport = FakeTransport::new();
    let mut f = Fixture::new(transport.clone(), Duration::from_millis(200));
    f.mark_up(&[FALLBACK_BACKEND]);
    f.resolver_update(
        vec![
            balancer_address(BALANCER0),
            backend_address(FALLBACK_BACKEND),
        ],
        None,
    );

    // After the initial fallback timeout, picks are served by the resolver's
    // fallback backend.
    f.pump_until_picker(|state| {
        state.connectivity_state == ConnectivityState::Ready
            && picks_backend(state, FALLBACK_BACKEND)
    })
    .await;

    // The balancer comes up and provides a server list; picks migrate to the
    // balancer-provided backend.
    let (balancer, _requests) = FakeBalancer::new(Duration::ZERO);
    balancer.send_server_list(vec![server(BACKEND0)]);
    transport.register(BALANCER0, balancer);
    f.mark_up(&[BACKEND0]);

    f.pump_until_picker(|state| picks_backend(state, BACKEND0)).await;
}

#[tokio::test]
async fn explicit_fallback_and_return() {
    let transport = FakeTransport::new();
    let (balancer, _requests) = FakeBalancer::new(Duration::ZERO);
    transport.register(BALANCER0, balancer.clone());
    balancer.send_server_list(vec![server(BACKEND0)]);

    let mut f = Fixture::new(transport, DEFAULT_FALLBACK_TIMEOUT);
    f.mark_up(&[BACKEND0, FALLBACK_BACKEND]);
    f.resolver_update(
        vec![
            balancer_address(BALANCER0),
            backend_address(FALLBACK_BACKEND),
        ],
        None,
    );
    f.pump_until_picker(|state| picks_backend(state, BACKEND0)).await;

    // The balancer requests fallback; picks move to the fallback backend
    // while the stream stays up.
    balancer.send_fallback();
    f.pump_until_picker(|state| picks_backend(state, FALLBACK_BACKEND))
        .await;

    // A new server list on the same stream returns the policy to the
    // balancer-provided backends.
    balancer.send_server_list(vec![server(BACKEND0)]);
    f.pump_until_picker(|state| picks_backend(state, BACKEND0)).await;
}

#[tokio::test]
async fn balancer_failover_moves_to_next_address() {
    let transport = FakeTransport::new();
    let (balancer0, _requests0) = FakeBalancer::new(Duration::ZERO);
    transport.register(BALANCER0, balancer0.clone());
    balancer0.send_server_list(vec![server(BACKEND0)]);
    let (balancer1, _requests1) = FakeBalancer::new(Duration::ZERO);
    transport.register(BALANCER1, balancer1.clone());
    balancer1.send_server_list(vec![server(BACKEND1)]);

    let mut f = Fixture::new(transport, DEFAULT_FALLBACK_TIMEOUT);
    f.mark_up(&[BACKEND0, BACKEND1]);
    f.resolver_update(
        vec![balancer_address(BALANCER0), balancer_address(BALANCER1)],
        None,
    );
    f.pump_until_picker(|state| picks_backend(state, BACKEND0)).await;

    // The first balancer dies; the policy reconnects to the second and picks
    // migrate to its backend.
    balancer0.stop();
    f.pump_until_picker(|state| picks_backend(state, BACKEND1)).await;
}

#[tokio::test]
async fn no_balancer_address_enters_fallback_without_reresolution() {
    let transport = FakeTransport::new();
    let (balancer, _requests) = FakeBalancer::new(Duration::ZERO);
    transport.register(BALANCER0, balancer.clone());
    balancer.send_server_list(vec![server(BACKEND0)]);

    let mut f = Fixture::new(transport, DEFAULT_FALLBACK_TIMEOUT);
    f.mark_up(&[BACKEND0, FALLBACK_BACKEND]);

    // Only backend addresses: fallback starts immediately, and the resolver
    // must not be poked just because the balancer set is empty.
    f.resolver_update(vec![backend_address(FALLBACK_BACKEND)], None);
    f.pump_until_picker(|state| picks_backend(state, FALLBACK_BACKEND))
        .await;
    assert!(!f.saw_resolution_request);

    // A later update with a balancer address moves to the balancer's
    // backends.
    f.resolver_update(
        vec![
            balancer_address(BALANCER0),
            backend_address(FALLBACK_BACKEND),
        ],
        None,
    );
    f.pump_until_picker(|state| picks_backend(state, BACKEND0)).await;
}

#[tokio::test]
async fn empty_server_list_queues_picks() {
    let transport = FakeTransport::new();
    let (balancer, _requests) = FakeBalancer::new(Duration::ZERO);
    transport.register(BALANCER0, balancer.clone());
    balancer.send_server_list(vec![server(BACKEND0)]);

    let mut f = Fixture::new(transport, DEFAULT_FALLBACK_TIMEOUT);
    f.mark_up(&[BACKEND0]);
    f.resolver_update(vec![balancer_address(BALANCER0)], None);
    f.pump_until_picker(|state| picks_backend(state, BACKEND0)).await;

    // A list with no usable backend: picks queue until the next list.
    balancer.send_server_list(vec![]);
    f.pump_until_picker(|state| {
        state.connectivity_state == ConnectivityState::Connecting
            && matches!(do_pick(state), PickOutcome::Queued)
    })
    .await;
}

#[tokio::test]
async fn pick_first_child_then_switch_to_round_robin() {
    let transport = FakeTransport::new();
    let (balancer, _requests) = FakeBalancer::new(Duration::ZERO);
    transport.register(BALANCER0, balancer.clone());
    balancer.send_server_list(vec![server(BACKEND0), server(BACKEND1), server(BACKEND2)]);

    let builder = GrpclbBuilder::new(FakeTransport::new() as Arc<dyn BalancerTransport>);
    let pick_first_config = builder
        .parse_config(&ParsedJsonLbConfig::new(r#"{"childPolicy":[{"pick_first":{}}]}"#).unwrap())
        .unwrap()
        .unwrap();
    let round_robin_config = builder
        .parse_config(&ParsedJsonLbConfig::new("{}").unwrap())
        .unwrap()
        .unwrap();

    let mut f = Fixture::new(transport, DEFAULT_FALLBACK_TIMEOUT);
    f.mark_up(&[BACKEND0, BACKEND1, BACKEND2]);
    f.resolver_update(vec![balancer_address(BALANCER0)], Some(&pick_first_config));

    // pick_first sticks to the first address in server-list order, and the
    // backend's token rides on each pick.
    f.pump_until_picker(|state| {
        if state.connectivity_state != ConnectivityState::Ready {
            return false;
        }
        let req = test_utils::new_request();
        for _ in 0..10 {
            match state.picker.pick(&req) {
                PickResult::Pick(pick) => {
                    if pick.subchannel.address().address != BACKEND0 {
                        return false;
                    }
                    assert_eq!(pick.metadata.get(LB_TOKEN_METADATA_KEY).unwrap(), LB_TOKEN);
                }
                _ => return false,
            }
        }
        true
    })
    .await;

    // Switching the child policy to round_robin spreads picks over all
    // backends.
    f.resolver_update(vec![balancer_address(BALANCER0)], Some(&round_robin_config));
    f.pump_until_picker(|state| {
        if state.connectivity_state != ConnectivityState::Ready {
            return false;
        }
        let mut backends = HashSet::new();
        for _ in 0..9 {
            match do_pick(state) {
                PickOutcome::Backend(addr) => {
                    backends.insert(addr);
                }
                _ => return false,
            }
        }
        backends.len() == 3
    })
    .await;
}

#[tokio::test]
async fn stats_reported_with_drops() {
    let transport = FakeTransport::new();
    let (balancer, mut requests) = FakeBalancer::new(Duration::from_millis(100));
    transport.register(BALANCER0, balancer.clone());
    balancer.send_server_list(vec![server(BACKEND0), drop_server(LB_TOKEN)]);

    let mut f = Fixture::new(transport, DEFAULT_FALLBACK_TIMEOUT);
    f.mark_up(&[BACKEND0]);
    f.resolver_update(vec![balancer_address(BALANCER0)], None);

    // The first pick on the freshly installed picker consumes position 0,
    // a backend.  39 more picks alternate drop/backend, for 40 calls total:
    // 20 received and 20 dropped.
    let state = f
        .pump_until_picker(|state| {
            state.connectivity_state == ConnectivityState::Ready
                && picks_backend(state, BACKEND0)
        })
        .await;
    for _ in 0..39 {
        match do_pick(&state) {
            PickOutcome::Backend(_) | PickOutcome::Dropped => {}
            _ => panic!("unexpected pick outcome"),
        }
    }

    let mut total = ClientStats::default();
    let deadline = tokio::time::Instant::now() + PUMP_TIMEOUT;
    loop {
        let request = tokio::time::timeout_at(deadline, requests.recv())
            .await
            .expect("timed out waiting for stats reports")
            .expect("balancer request channel closed");
        if let LoadBalanceRequest::Stats(report) = request {
            merge_stats(&mut total, &report);
        }
        if total.num_calls_finished == 40 {
            break;
        }
    }
    assert_eq!(total.num_calls_started, 40);
    assert_eq!(total.num_calls_finished, 40);
    assert_eq!(total.num_calls_finished_known_received, 20);
    assert_eq!(total.num_calls_finished_with_client_failed_to_send, 0);
    assert_eq!(total.calls_finished_with_drop.len(), 1);
    assert_eq!(total.calls_finished_with_drop[0].load_balance_token, LB_TOKEN);
    assert_eq!(total.calls_finished_with_drop[0].num_calls, 20);

    // Nothing further is reported once the counters are drained: empty
    // reports are suppressed.
    match tokio::time::timeout(Duration::from_millis(250), requests.recv()).await {
        Err(_) => {}
        Ok(Some(LoadBalanceRequest::Stats(report))) => {
            panic!("unexpected stats report after drain: {report:?}")
        }
        Ok(other) => panic!("unexpected balancer request: {other:?}"),
    }
}

#[tokio::test]
async fn stats_single_zero_report_when_idle() {
    let transport = FakeTransport::new();
    let (balancer, mut requests) = FakeBalancer::new(Duration::from_millis(100));
    transport.register(BALANCER0, balancer.clone());

    let mut f = Fixture::new(transport, DEFAULT_FALLBACK_TIMEOUT);
    f.resolver_update(vec![balancer_address(BALANCER0)], None);

    // The stream opens with the initial request naming the channel target.
    let first = tokio::time::timeout(PUMP_TIMEOUT, requests.recv())
        .await
        .expect("timed out waiting for the initial request")
        .unwrap();
    match first {
        LoadBalanceRequest::Initial(initial) => assert_eq!(initial.name, TEST_SERVICE_NAME),
        other => panic!("unexpected first request: {other:?}"),
    }

    // With no RPCs issued, exactly one zero-valued liveness report arrives.
    let second = tokio::time::timeout(PUMP_TIMEOUT, requests.recv())
        .await
        .expect("timed out waiting for the liveness report")
        .unwrap();
    match second {
        LoadBalanceRequest::Stats(report) => assert!(report.is_zero()),
        other => panic!("unexpected second request: {other:?}"),
    }

    // And then silence for at least five reporting intervals.
    match tokio::time::timeout(Duration::from_millis(500), requests.recv()).await {
        Err(_) => {}
        Ok(request) => panic!("unexpected balancer request: {request:?}"),
    }
}
