use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Addresses of one tunnel: the server-side pair and the client-side pair,
/// allocated from the configured range in blocks of four.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfIp {
    pub server_local: Ipv4Addr,
    pub server_remote: Ipv4Addr,
    pub client_local: Ipv4Addr,
    pub client_remote: Ipv4Addr,
}

/// The tunnel device consumed by the engine. Concrete TUN/TAP devices are
/// created by an external, per-OS factory; the engine only reads whole
/// inner packets and writes them back.
pub trait TunDevice: Send + Sync {
    /// Reads one inner IP packet. Returns `Error::Closed` after `close`.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;
    /// Writes one inner IP packet.
    fn write(&self, buf: &[u8]) -> Result<usize>;
    fn name(&self) -> &str;
    fn close(&self);
}

/// Creates tunnel devices. `index` makes device names unique per session.
pub trait DeviceFactory: Send + Sync {
    fn create(&self, index: usize, ip: IfIp, mtu: usize) -> Result<Arc<dyn TunDevice>>;
}

/// Runs interface up/down commands. Only invoked around device lifecycle.
pub trait CommandExecutor: Send + Sync {
    fn run(&self, cmd: &str) -> Result<String>;
    fn start(&self, cmd: &str) -> Result<()>;
}

/// An in-memory tunnel device: packets written by a test (or a local
/// loopback) appear on `read`, packets written by the engine are collected
/// for inspection. Backs the test suites and the demo wiring of the
/// service binaries.
pub struct MemoryTun {
    name: String,
    inbound_tx: Sender<Vec<u8>>,
    inbound_rx: Receiver<Vec<u8>>,
    written: Mutex<Vec<Vec<u8>>>,
    written_tx: Sender<Vec<u8>>,
    written_rx: Receiver<Vec<u8>>,
    closed: AtomicBool,
}

impl MemoryTun {
    pub fn new(name: &str) -> Arc<MemoryTun> {
        let (inbound_tx, inbound_rx) = unbounded();
        let (written_tx, written_rx) = unbounded();
        Arc::new(MemoryTun {
            name: name.to_string(),
            inbound_tx,
            inbound_rx,
            written: Mutex::new(Vec::new()),
            written_tx,
            written_rx,
            closed: AtomicBool::new(false),
        })
    }

    /// Makes a packet readable through the device.
    pub fn inject(&self, packet: &[u8]) {
        let _ = self.inbound_tx.send(packet.to_vec());
    }

    /// Blocks until the engine writes a packet, up to `timeout`.
    pub fn take_written(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.written_rx.recv_timeout(timeout).ok()
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }
}

impl TunDevice for MemoryTun {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            match self.inbound_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    return Ok(n);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Closed),
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.written.lock().push(buf.to_vec());
        let _ = self.written_tx.send(buf.to_vec());
        Ok(buf.len())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// A factory producing in-memory devices named `<prefix><index>`.
pub struct MemoryTunFactory {
    prefix: String,
    devices: Mutex<Vec<Arc<MemoryTun>>>,
}

impl MemoryTunFactory {
    pub fn new(prefix: &str) -> Arc<MemoryTunFactory> {
        Arc::new(MemoryTunFactory {
            prefix: prefix.to_string(),
            devices: Mutex::new(Vec::new()),
        })
    }

    /// Devices created so far, in creation order.
    pub fn devices(&self) -> Vec<Arc<MemoryTun>> {
        self.devices.lock().clone()
    }
}

impl DeviceFactory for MemoryTunFactory {
    fn create(&self, index: usize, _ip: IfIp, _mtu: usize) -> Result<Arc<dyn TunDevice>> {
        let device = MemoryTun::new(&format!("{}{}", self.prefix, index));
        self.devices.lock().push(device.clone());
        Ok(device)
    }
}

/// Executes interface commands through the system shell.
pub struct ShellExecutor {
    shell: String,
}

impl ShellExecutor {
    pub fn new(shell: &str) -> ShellExecutor {
        ShellExecutor {
            shell: if shell.is_empty() { "/bin/sh" } else { shell }.to_string(),
        }
    }
}

impl CommandExecutor for ShellExecutor {
    fn run(&self, cmd: &str) -> Result<String> {
        let output = std::process::Command::new(&self.shell)
            .arg("-c")
            .arg(cmd)
            .output()?;
        if !output.status.success() {
            return Err(Error::Validation(format!(
                "command failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn start(&self, cmd: &str) -> Result<()> {
        std::process::Command::new(&self.shell)
            .arg("-c")
            .arg(cmd)
            .spawn()?;
        Ok(())
    }
}
