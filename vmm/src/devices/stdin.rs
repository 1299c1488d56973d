use std::io::Read;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex};

use event_manager::{EventOps, Events, MutEventSubscriber};
use tracing::warn;
use vmm_sys_util::epoll::EventSet;

use crate::GuestInput;
use crate::devices::serial::SerialConsole;

const INPUT_DATA: u32 = 0;

struct FdWrapper(i32);

impl AsRawFd for FdWrapper {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0
    }
}

/// Forwards bytes from the host-side input (usually a raw-mode stdin) into
/// the guest serial console's receive FIFO.
pub struct StdinForwarder {
    input: Box<dyn GuestInput>,
    serial: Arc<Mutex<SerialConsole>>,
    input_fd: Option<FdWrapper>,
}

impl StdinForwarder {
    pub fn new(input: Box<dyn GuestInput>, serial: Arc<Mutex<SerialConsole>>) -> Self {
        StdinForwarder {
            input,
            serial,
            input_fd: None,
        }
    }
}

impl MutEventSubscriber for StdinForwarder {
    fn process(&mut self, events: Events, ops: &mut EventOps) {
        if events.event_set() != EventSet::IN || events.data() != INPUT_DATA {
            return;
        }

        let mut buf = [0u8; 64];
        match self.input.read(&mut buf) {
            Ok(n) if n > 0 => {
                if let Err(e) = self
                    .serial
                    .lock()
                    .unwrap()
                    .serial
                    .enqueue_raw_bytes(&buf[..n])
                {
                    warn!(error = ?e, "failed to enqueue console input");
                }
            }
            Ok(_) => {
                // EOF: stop watching, the guest keeps running.
                if let Some(fd) = &self.input_fd {
                    ops.remove(Events::empty(fd))
                        .expect("failed to remove console input event");
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to read console input");
            }
        }
    }

    fn init(&mut self, ops: &mut EventOps) {
        let raw_fd = self.input.as_raw_fd();
        self.input_fd = Some(FdWrapper(raw_fd));

        ops.add(Events::with_data(
            self.input_fd.as_ref().unwrap(),
            INPUT_DATA,
            EventSet::IN,
        ))
        .expect("failed to register console input event");
    }
}
