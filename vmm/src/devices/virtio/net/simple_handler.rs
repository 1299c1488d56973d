use std::cmp;
use std::io::{Read, Write};

use tracing::warn;
use virtio_queue::{DescriptorChain, Queue};
use vm_memory::{Bytes, GuestAddressSpace};

use super::tap::Tap;
use super::{RXQ_INDEX, TXQ_INDEX};
use crate::devices::virtio::{SignalUsedQueue, VirtioError};

// Maximum frame size: 65535 bytes of payload, the 12-byte vnet header, and
// the 14-byte ethernet header, with a bit of headroom.
const MAX_BUFFER_SIZE: usize = 65562;

/// Moves frames between the TAP fd and the RX/TX queues.
///
/// This is the data path of the net device; it runs inside the event loop
/// whenever the tap or one of the queue ioeventfds becomes readable.
pub struct SimpleHandler<M: GuestAddressSpace, S: SignalUsedQueue> {
    pub driver_notify: S,
    pub rxq: Queue<M>,
    pub rxbuf_current: usize,
    pub rxbuf: [u8; MAX_BUFFER_SIZE],
    pub txq: Queue<M>,
    pub txbuf: [u8; MAX_BUFFER_SIZE],
    pub tap: Tap,
}

impl<M: GuestAddressSpace, S: SignalUsedQueue> SimpleHandler<M, S> {
    pub fn new(driver_notify: S, rxq: Queue<M>, txq: Queue<M>, tap: Tap) -> Self {
        SimpleHandler {
            driver_notify,
            rxq,
            rxbuf_current: 0,
            rxbuf: [0u8; MAX_BUFFER_SIZE],
            txq,
            txbuf: [0u8; MAX_BUFFER_SIZE],
            tap,
        }
    }

    // A bogus descriptor chain from a misbehaving driver surfaces as an
    // error here; the queue handler reacts by detaching the device.
    fn write_frame_to_guest(&mut self) -> Result<bool, VirtioError> {
        let num_bytes = self.rxbuf_current;

        let mut chain = match self.rxq.iter()?.next() {
            Some(c) => c,
            None => return Ok(false),
        };

        let mut count = 0;
        let buf = &mut self.rxbuf[..num_bytes];

        while let Some(desc) = chain.next() {
            let left = buf.len() - count;
            if left == 0 {
                break;
            }

            let len = cmp::min(left, desc.len() as usize);
            chain
                .memory()
                .write_slice(&buf[count..count + len], desc.addr())
                .map_err(VirtioError::GuestMemory)?;

            count += len;
        }

        if count != buf.len() {
            // The frame was larger than the chain the driver gave us.
            warn!(frame_len = buf.len(), written = count, "rx frame truncated");
        }

        self.rxq.add_used(chain.head_index(), count as u32)?;
        self.rxbuf_current = 0;

        Ok(true)
    }

    pub fn process_tap(&mut self) -> Result<(), VirtioError> {
        loop {
            if self.rxbuf_current == 0 {
                match self.tap.read(&mut self.rxbuf) {
                    Ok(n) => self.rxbuf_current = n,
                    // The tap is non-blocking; WouldBlock means drained.
                    Err(_) => break,
                }
            }

            if !self.write_frame_to_guest()? && !self.rxq.enable_notification()? {
                break;
            }
        }

        if self.rxq.needs_notification()? {
            self.driver_notify.signal_used_queue(RXQ_INDEX);
        }

        Ok(())
    }

    fn send_frame_from_chain(
        &mut self,
        chain: &mut DescriptorChain<M::T>,
    ) -> Result<u32, VirtioError> {
        let mut count = 0;

        while let Some(desc) = chain.next() {
            let left = self.txbuf.len() - count;
            let len = desc.len() as usize;
            if len > left {
                return Err(VirtioError::FrameTooLarge);
            }

            chain
                .memory()
                .read_slice(&mut self.txbuf[count..count + len], desc.addr())
                .map_err(VirtioError::GuestMemory)?;

            count += len;
        }

        self.tap
            .write(&self.txbuf[..count])
            .map_err(VirtioError::Tap)?;

        Ok(count as u32)
    }

    pub fn process_txq(&mut self) -> Result<(), VirtioError> {
        loop {
            self.txq.disable_notification()?;

            loop {
                // The avail iterator holds a borrow of the queue, so take
                // one owned chain at a time instead of iterating in place.
                let Some(mut chain) = self.txq.iter()?.next() else {
                    break;
                };

                let len = self.send_frame_from_chain(&mut chain)?;
                self.txq.add_used(chain.head_index(), len)?;

                if self.txq.needs_notification()? {
                    self.driver_notify.signal_used_queue(TXQ_INDEX);
                }
            }

            if !self.txq.enable_notification()? {
                return Ok(());
            }
        }
    }

    pub fn process_rxq(&mut self) -> Result<(), VirtioError> {
        self.rxq.disable_notification()?;
        self.process_tap()
    }
}
