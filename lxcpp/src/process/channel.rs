//! A blocking pipe-backed channel carrying the §4.12 synchronization
//! protocol. Adapted from the teacher's `process/channel.rs` — same
//! `mio::unix::pipe` plumbing and `to_be_bytes()` framing, generalized
//! from the two-message `ChildReady`/`InitReady` protocol to the full
//! six-step handshake plus the uid/gid mapping request/ack.

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};

use mio::unix::pipe::{self, Receiver, Sender};
use nix::unistd::{self, Pid};

use crate::error::{Error, Result};
use crate::process::message::Message;

pub struct Channel {
    sender: Sender,
    receiver: Receiver,
}

impl Channel {
    pub fn new() -> Result<Self> {
        let (sender, receiver) = pipe::new()?;
        receiver.set_nonblocking(false)?;
        Ok(Self { sender, receiver })
    }

    fn write_message(&mut self, msg: Message) -> Result<()> {
        self.sender.write_all(&(msg as u8).to_be_bytes())?;
        Ok(())
    }

    fn read_message(&mut self, step: u8) -> Result<Message> {
        let mut buf = [0; 1];
        self.receiver
            .read_exact(&mut buf)
            .map_err(|e| Error::HandshakeFailed {
                step,
                reason: e.to_string(),
            })?;
        Ok(Message::from(u8::from_be_bytes(buf)))
    }

    fn expect(&mut self, step: u8, want: Message) -> Result<()> {
        let got = self.read_message(step)?;
        if got == want {
            Ok(())
        } else {
            Err(Error::HandshakeFailed {
                step,
                reason: format!("expected {:?}, got {:?}", want, got),
            })
        }
    }

    pub fn send_guard_ready(&mut self, pid: Pid) -> Result<()> {
        self.write_message(Message::GuardReady)?;
        self.sender.write_all(&pid.as_raw().to_be_bytes())?;
        Ok(())
    }

    pub fn wait_for_guard_ready(&mut self) -> Result<Pid> {
        self.expect(1, Message::GuardReady)?;
        let mut buf = [0; 4];
        self.receiver
            .read_exact(&mut buf)
            .map_err(|e| Error::HandshakeFailed {
                step: 1,
                reason: e.to_string(),
            })?;
        Ok(Pid::from_raw(i32::from_be_bytes(buf)))
    }

    pub fn send_identifier_mapping_request(&mut self) -> Result<()> {
        self.write_message(Message::WriteMapping)
    }

    pub fn wait_for_mapping_request(&mut self) -> Result<()> {
        self.expect(2, Message::WriteMapping)
    }

    pub fn send_mapping_written(&mut self) -> Result<()> {
        self.write_message(Message::MappingWritten)
    }

    pub fn wait_for_mapping_ack(&mut self) -> Result<()> {
        self.expect(2, Message::MappingWritten)
    }

    pub fn send_init_ns_entered(&mut self) -> Result<()> {
        self.write_message(Message::InitNsEntered)
    }

    pub fn wait_for_init_ns_entered(&mut self) -> Result<()> {
        self.expect(3, Message::InitNsEntered)
    }

    pub fn send_init_provisioned(&mut self) -> Result<()> {
        self.write_message(Message::InitProvisioned)
    }

    pub fn wait_for_init_provisioned(&mut self) -> Result<()> {
        self.expect(4, Message::InitProvisioned)
    }

    pub fn send_init_exec(&mut self) -> Result<()> {
        self.write_message(Message::InitExec)
    }

    pub fn wait_for_init_exec(&mut self) -> Result<()> {
        self.expect(5, Message::InitExec)
    }

    pub fn send_init_exited(&mut self) -> Result<()> {
        self.write_message(Message::InitExited)
    }

    pub fn wait_for_init_exited(&mut self) -> Result<()> {
        self.expect(6, Message::InitExited)
    }

    /// Raw fd backing the read half, for callers that need to poll it
    /// alongside other fds (e.g. `lifecycle::wait_for_exit`'s bookkeeping).
    pub fn receiver_fd(&self) -> std::os::unix::io::RawFd {
        self.receiver.as_raw_fd()
    }

    pub fn close_receiver(&self) -> Result<()> {
        unistd::close(self.receiver.as_raw_fd())?;
        Ok(())
    }

    pub fn close_sender(&self) -> Result<()> {
        unistd::close(self.sender.as_raw_fd())?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.close_receiver()?;
        self.close_sender()?;
        Ok(())
    }

    /// Duplicates both ends onto fresh fds. `fork()` would do this for
    /// free via fd-table inheritance; this lets a single process keep an
    /// independent handle to the same pipe without forking, so the host
    /// side of a synchronization channel can retain a read-capable copy
    /// after moving the original into the guard/init closure.
    pub fn try_clone(&self) -> Result<Self> {
        let sender_fd = unistd::dup(self.sender.as_raw_fd())?;
        let receiver_fd = unistd::dup(self.receiver.as_raw_fd())?;
        Ok(Self {
            sender: unsafe { Sender::from_raw_fd(sender_fd) },
            receiver: unsafe { Receiver::from_raw_fd(receiver_fd) },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait;

    #[test]
    fn guard_ready_round_trips_pid() {
        let ch = &mut Channel::new().unwrap();
        match unsafe { unistd::fork().unwrap() } {
            unistd::ForkResult::Parent { child } => {
                let pid = ch.wait_for_guard_ready().unwrap();
                assert_eq!(pid, child);
                wait::waitpid(child, None).unwrap();
            }
            unistd::ForkResult::Child => {
                let pid = unistd::getpid();
                ch.send_guard_ready(pid).unwrap();
                std::process::exit(0);
            }
        };
    }

    #[test]
    fn mapping_handshake_round_trips() {
        let ch = &mut Channel::new().unwrap();
        match unsafe { unistd::fork().unwrap() } {
            unistd::ForkResult::Parent { child } => {
                ch.wait_for_mapping_ack().unwrap();
                wait::waitpid(child, None).unwrap();
            }
            unistd::ForkResult::Child => {
                ch.send_mapping_written().unwrap();
                std::process::exit(0);
            }
        };
    }

    #[test]
    fn closing_sender_makes_waiting_side_error_out() {
        let ch = &mut Channel::new().unwrap();
        match unsafe { unistd::fork().unwrap() } {
            unistd::ForkResult::Parent { child } => {
                ch.close_sender().unwrap();
                let ret = ch.wait_for_guard_ready();
                assert!(ret.is_err());
                wait::waitpid(child, None).unwrap();
            }
            unistd::ForkResult::Child => {
                ch.close_receiver().unwrap();
                std::process::exit(0);
            }
        };
    }
}
