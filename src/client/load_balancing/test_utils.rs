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

use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::client::load_balancing::{
    ChannelController, LbState, Subchannel, WorkScheduler,
};
use crate::client::name_resolution::Address;
use crate::service::{Message, Request};

#[derive(Debug)]
pub(crate) struct EmptyMessage {}

impl Message for EmptyMessage {
    fn encode(&self, _buf: &mut BytesMut) -> Result<(), String> {
        Ok(())
    }
    fn decode(&mut self, _buf: &Bytes) -> Result<(), String> {
        Ok(())
    }
}

pub(crate) fn new_request() -> Request {
    Request::new(Box::pin(tokio_stream::once(
        Box::new(EmptyMessage {}) as Box<dyn Message>
    )))
}

/// A test subchannel that forwards connect calls to a channel.
/// This allows tests to verify when a subchannel is asked to connect.
pub(crate) struct TestSubchannel {
    address: Address,
    tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl TestSubchannel {
    fn new(address: Address, tx_events: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self { address, tx_events }
    }
}

impl Subchannel for TestSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn connect(&self) {
        let _ = self.tx_events.send(TestEvent::Connect(self.address.clone()));
    }
}

impl Display for TestSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl Debug for TestSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestSubchannel({})", self.address)
    }
}

impl Hash for TestSubchannel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

pub(crate) enum TestEvent {
    NewSubchannel(Arc<dyn Subchannel>),
    UpdatePicker(LbState),
    RequestResolution,
    Connect(Address),
    ScheduleWork,
}

impl Display for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({})", sc.address()),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::Connect(addr) => write!(f, "Connect({})", addr.address),
            Self::ScheduleWork => write!(f, "ScheduleWork"),
        }
    }
}

/// A test channel controller that forwards calls to a channel.  This allows
/// tests to verify when a channel controller is asked to create subchannels or
/// update the picker.
pub(crate) struct TestChannelController {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl ChannelController for TestChannelController {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel: Arc<dyn Subchannel> =
            Arc::new(TestSubchannel::new(address.clone(), self.tx_events.clone()));
        let _ = self
            .tx_events
            .send(TestEvent::NewSubchannel(subchannel.clone()));
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        let _ = self.tx_events.send(TestEvent::UpdatePicker(update));
    }

    fn request_resolution(&mut self) {
        let _ = self.tx_events.send(TestEvent::RequestResolution);
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        let _ = self.tx_events.send(TestEvent::ScheduleWork);
    }
}
