use event_manager::{EventOps, Events, MutEventSubscriber};
use tracing::error;
use vm_memory::GuestAddressSpace;
use vmm_sys_util::epoll::EventSet;
use vmm_sys_util::eventfd::EventFd;

use super::simple_handler::SimpleHandler;
use crate::devices::virtio::SingleFdSignalQueue;

const TAPFD_DATA: u32 = 10;
const RX_IOEVENT_DATA: u32 = 11;
const TX_IOEVENT_DATA: u32 = 12;

/// Event-loop subscriber gluing the tap fd and the queue ioeventfds to the
/// frame-moving [`SimpleHandler`].
pub struct QueueHandler<M: GuestAddressSpace> {
    pub inner: SimpleHandler<M, SingleFdSignalQueue>,
    pub rx_ioevent: EventFd,
    pub tx_ioevent: EventFd,
}

impl<M: GuestAddressSpace> QueueHandler<M> {
    // An error on the data path means the device is wedged; log it and stop
    // watching everything so the loop does not spin on a broken fd.
    fn handle_error<S: AsRef<str>>(&self, msg: S, ops: &mut EventOps) {
        error!(msg = msg.as_ref(), "net device detached from event loop");

        ops.remove(Events::empty(&self.rx_ioevent))
            .expect("failed to remove rx ioevent");
        ops.remove(Events::empty(&self.tx_ioevent))
            .expect("failed to remove tx ioevent");
        ops.remove(Events::empty(&self.inner.tap))
            .expect("failed to remove tap event");
    }
}

impl<M: GuestAddressSpace> MutEventSubscriber for QueueHandler<M> {
    fn process(&mut self, events: Events, ops: &mut EventOps) {
        if events.event_set() != EventSet::IN {
            self.handle_error("unexpected event_set", ops);
            return;
        }

        match events.data() {
            TAPFD_DATA => {
                if let Err(e) = self.inner.process_tap() {
                    self.handle_error(format!("process tap error {e:?}"), ops);
                }
            }
            RX_IOEVENT_DATA => {
                if self.rx_ioevent.read().is_err() {
                    self.handle_error("rx ioevent read", ops);
                } else if let Err(e) = self.inner.process_rxq() {
                    self.handle_error(format!("process rx error {e:?}"), ops);
                }
            }
            TX_IOEVENT_DATA => {
                if self.tx_ioevent.read().is_err() {
                    self.handle_error("tx ioevent read", ops);
                } else if let Err(e) = self.inner.process_txq() {
                    self.handle_error(format!("process tx error {e:?}"), ops);
                }
            }
            _ => self.handle_error("unexpected data", ops),
        }
    }

    fn init(&mut self, ops: &mut EventOps) {
        ops.add(Events::with_data(
            &self.inner.tap,
            TAPFD_DATA,
            EventSet::IN | EventSet::EDGE_TRIGGERED,
        ))
        .expect("failed to register tap event");

        ops.add(Events::with_data(
            &self.rx_ioevent,
            RX_IOEVENT_DATA,
            EventSet::IN,
        ))
        .expect("failed to register rx ioevent");

        ops.add(Events::with_data(
            &self.tx_ioevent,
            TX_IOEVENT_DATA,
            EventSet::IN,
        ))
        .expect("failed to register tx ioevent");
    }
}
