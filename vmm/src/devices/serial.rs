use std::fs::{File, OpenOptions};
use std::io::{self, Write, stdout};
use std::ops::Deref;
use std::path::Path;

use vm_superio::serial::NoEvents;
use vm_superio::{Serial, Trigger};
use vmm_sys_util::eventfd::EventFd;

/// First I/O port of the COM1 range.
pub const SERIAL_PORT_BASE: u16 = 0x3f8;
/// Last I/O port of the COM1 range.
pub const SERIAL_PORT_LAST: u16 = 0x3ff;

/// An eventfd-backed interrupt trigger, so the serial device can raise its
/// IRQ through the irqfd registered with KVM.
pub struct EventFdTrigger(EventFd);

impl Trigger for EventFdTrigger {
    type E = io::Error;

    fn trigger(&self) -> io::Result<()> {
        self.write(1)
    }
}

impl Deref for EventFdTrigger {
    type Target = EventFd;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl EventFdTrigger {
    pub fn new(flag: i32) -> io::Result<Self> {
        Ok(EventFdTrigger(EventFd::new(flag)?))
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(EventFdTrigger((**self).try_clone()?))
    }
}

/// Serial sink that can mirror guest output to stdout and a capture file.
pub struct TeeWriter {
    file: Option<File>,
    stdout: bool,
}

impl TeeWriter {
    pub fn new(file_path: Option<&Path>, use_stdout: bool) -> io::Result<Self> {
        let file = file_path
            .map(|path| {
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(path)
            })
            .transpose()?;

        Ok(TeeWriter {
            file,
            stdout: use_stdout,
        })
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout {
            stdout().write_all(buf)?;
        }

        if let Some(ref mut file) = self.file {
            file.write_all(buf)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout {
            stdout().flush()?;
        }

        if let Some(ref mut file) = self.file {
            file.flush()?;
        }

        Ok(())
    }
}

/// The guest's 16550A console: a `vm-superio` serial device plus the eventfd
/// it uses to interrupt the guest.
pub struct SerialConsole {
    eventfd: EventFdTrigger,
    pub serial: Serial<EventFdTrigger, NoEvents, Box<dyn Write + Send>>,
}

impl SerialConsole {
    pub fn new(out: Box<dyn Write + Send>) -> io::Result<Self> {
        let eventfd = EventFdTrigger::new(libc::EFD_NONBLOCK)?;

        Ok(SerialConsole {
            eventfd: eventfd.try_clone()?,
            serial: Serial::new(eventfd, out),
        })
    }

    /// A clone of the interrupt eventfd, for irqfd registration.
    pub fn eventfd(&self) -> io::Result<EventFd> {
        Ok(self.eventfd.try_clone()?.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn tee_writer_writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial.log");

        let mut writer = TeeWriter::new(Some(path.as_path()), false).unwrap();
        writer.write_all(b"guest says hi\n").unwrap();
        writer.flush().unwrap();

        let mut contents = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "guest says hi\n");
    }

    #[test]
    fn tee_writer_without_sinks_accepts_writes() {
        let mut writer = TeeWriter::new(None, false).unwrap();
        assert_eq!(writer.write(b"dropped").unwrap(), 7);
        writer.flush().unwrap();
    }

    #[test]
    fn trigger_fires_eventfd() {
        let trigger = EventFdTrigger::new(libc::EFD_NONBLOCK).unwrap();
        let clone = trigger.try_clone().unwrap();
        trigger.trigger().unwrap();
        assert_eq!(clone.read().unwrap(), 1);
    }
}
