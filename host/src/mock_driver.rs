//! A scripted HCI driver for tests.
//!
//! Feeds pre-recorded controller packets to the host and records what the
//! host writes. Expectations attach a callback to the next command write,
//! which is how tests script controller replies.

extern crate std;

use core::cell::RefCell;
use std::boxed::Box;
use std::vec::Vec;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;

use crate::driver::{Error, ErrorKind, HciDriver, HciPacketKind};

#[derive(Debug)]
pub(crate) struct MockError(ErrorKind);

impl Error for MockError {
    fn kind(&self) -> ErrorKind {
        self.0
    }
}

enum Feed {
    Packet(HciPacketKind, Vec<u8>),
    Close,
}

type Expectation = (Vec<u8>, Box<dyn FnOnce()>);

#[derive(Default)]
struct Recorded {
    commands: Vec<Vec<u8>>,
    acl: Vec<Vec<u8>>,
}

pub(crate) struct MockDriver {
    rx: Channel<NoopRawMutex, Feed, 16>,
    expectations: RefCell<std::collections::VecDeque<Expectation>>,
    recorded: RefCell<Recorded>,
}

impl MockDriver {
    pub(crate) fn new() -> Self {
        Self {
            rx: Channel::new(),
            expectations: RefCell::new(std::collections::VecDeque::new()),
            recorded: RefCell::new(Recorded::default()),
        }
    }

    /// Queue an event packet for the host to read.
    pub(crate) fn feed_event(&self, bytes: &[u8]) {
        unwrap!(self
            .rx
            .try_send(Feed::Packet(HciPacketKind::Event, Vec::from(bytes)))
            .ok());
    }

    /// Queue an ACL data packet for the host to read.
    pub(crate) fn feed_acl(&self, bytes: &[u8]) {
        unwrap!(self
            .rx
            .try_send(Feed::Packet(HciPacketKind::AclData, Vec::from(bytes)))
            .ok());
    }

    /// Fail the next read, as a lost transport would.
    pub(crate) fn close(&self) {
        unwrap!(self.rx.try_send(Feed::Close).ok());
    }

    /// Expect `bytes` as the next command write and run `reply` when it
    /// happens.
    pub(crate) fn expect_command(&self, bytes: &[u8], reply: impl FnOnce() + 'static) {
        self.expectations
            .borrow_mut()
            .push_back((Vec::from(bytes), Box::new(reply)));
    }

    pub(crate) fn written_commands(&self) -> usize {
        self.recorded.borrow().commands.len()
    }

    pub(crate) fn written_acl(&self) -> Vec<Vec<u8>> {
        self.recorded.borrow().acl.clone()
    }

    /// Complete once `count` ACL packets have been written.
    pub(crate) async fn wait_for_acl_written(&self, count: usize) {
        core::future::poll_fn(|_cx| {
            if self.recorded.borrow().acl.len() >= count {
                core::task::Poll::Ready(())
            } else {
                // Relies on the busy-polling test executor.
                core::task::Poll::Pending
            }
        })
        .await
    }
}

impl HciDriver for MockDriver {
    type Error = MockError;

    async fn read(&self, buf: &mut [u8]) -> Result<(HciPacketKind, usize), MockError> {
        match self.rx.receive().await {
            Feed::Packet(kind, bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok((kind, bytes.len()))
            }
            Feed::Close => Err(MockError(ErrorKind::BrokenPipe)),
        }
    }

    async fn write(&self, kind: HciPacketKind, data: &[u8]) -> Result<(), MockError> {
        match kind {
            HciPacketKind::Command => {
                self.recorded.borrow_mut().commands.push(Vec::from(data));
                let expectation = self.expectations.borrow_mut().pop_front();
                if let Some((expected, reply)) = expectation {
                    assert_eq!(data, &expected[..], "unexpected command on the wire");
                    reply();
                }
            }
            HciPacketKind::AclData => {
                self.recorded.borrow_mut().acl.push(Vec::from(data));
            }
            kind => panic!("unexpected {:?} write", kind),
        }
        Ok(())
    }
}
