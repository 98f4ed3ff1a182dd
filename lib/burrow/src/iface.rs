use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;

use loam::logging::{self, Logger};

use crate::cancel::{cancel_pair, CancelToken, Canceller};
use crate::error::{Error, Result};
use crate::message::{Message, MessageType, Payload};
use crate::packet::Decoder;
use crate::sequence::SequencePool;
use crate::tun::{CommandExecutor, DeviceFactory, IfIp, TunDevice};
use parking_lot::Mutex;

#[derive(Clone)]
pub struct IfaceConfig {
    pub mtu: usize,
    /// Endpoint-sequence eviction TTL in seconds; zero disables eviction.
    pub endpoint_ttl: u64,
    /// Shell command templates run at interface up/down. Supported
    /// variables: {{tunnel_dev}}, {{mtu}}, {{client_tunnel_local_ip}},
    /// {{client_tunnel_remote_ip}}, {{server_tunnel_local_ip}},
    /// {{server_tunnel_remote_ip}}.
    pub up_commands: Vec<String>,
    pub down_commands: Vec<String>,
    pub tracing: bool,
}

/// One live tunnel interface: the device plus the channel its reader
/// thread feeds.
pub struct Interface {
    pub device: Arc<dyn TunDevice>,
    pub ip: IfIp,
    canceller: Mutex<Option<Canceller>>,
}

impl Interface {
    pub fn name(&self) -> String {
        self.device.name().to_string()
    }
}

/// Creates tunnel interfaces, runs their up/down commands and pumps
/// outbound packets from the device into the session layer. The reader
/// thread owns the per-endpoint sequence pool, so id assignment needs no
/// locks.
pub struct IfaceAdapter {
    log: Logger,
    cfg: IfaceConfig,
    cmd: Arc<dyn CommandExecutor>,
    factory: Arc<dyn DeviceFactory>,
    decoder: Arc<Decoder>,
}

impl IfaceAdapter {
    pub fn new(
        log: &Logger,
        cfg: IfaceConfig,
        cmd: Arc<dyn CommandExecutor>,
        factory: Arc<dyn DeviceFactory>,
        decoder: Arc<Decoder>,
    ) -> IfaceAdapter {
        IfaceAdapter {
            log: log.new(logging::o!("layer" => "iface")),
            cfg,
            cmd,
            factory,
            decoder,
        }
    }

    /// Creates a device, brings it up and starts the reader thread feeding
    /// `receiver`.
    pub fn create(
        &self,
        index: usize,
        ip: IfIp,
        receiver: Sender<Message>,
        parent: CancelToken,
    ) -> Result<Arc<Interface>> {
        let device = self.factory.create(index, ip, self.cfg.mtu)?;
        let (canceller, token) = cancel_pair();

        let ifc = Arc::new(Interface {
            device,
            ip,
            canceller: Mutex::new(Some(canceller)),
        });

        self.startup(&ifc, true)?;
        self.listen(&ifc, receiver, token, parent);

        logging::info!(self.log, "network interface created";
                       "device" => ifc.name(),
                       "mtu" => self.cfg.mtu,
                       "server_local_ip" => %ip.server_local,
                       "server_remote_ip" => %ip.server_remote,
                       "client_local_ip" => %ip.client_local,
                       "client_remote_ip" => %ip.client_remote);

        Ok(ifc)
    }

    /// Writes one inner packet to the device.
    pub fn write(&self, ifc: &Arc<Interface>, data: &[u8]) -> Result<()> {
        ifc.device.write(data)?;
        Ok(())
    }

    /// Runs the down commands and closes the device; the reader thread
    /// exits on the device's `Closed` error.
    pub fn close(&self, ifc: &Arc<Interface>) -> Result<()> {
        if let Some(canceller) = ifc.canceller.lock().take() {
            canceller.cancel();
        }
        let result = self.startup(ifc, false);
        ifc.device.close();
        result
    }

    fn listen(
        &self,
        ifc: &Arc<Interface>,
        receiver: Sender<Message>,
        token: CancelToken,
        parent: CancelToken,
    ) {
        let device = ifc.device.clone();
        let decoder = self.decoder.clone();
        let log = self.log.new(logging::o!("device" => ifc.name()));
        let mtu = self.cfg.mtu;
        let endpoint_ttl = self.cfg.endpoint_ttl;
        let tracing = self.cfg.tracing;

        logging::debug!(log, "listening network interface");

        thread::spawn(move || {
            let mut sequence = SequencePool::new(endpoint_ttl);
            let mut buf = vec![0u8; mtu];

            loop {
                if token.is_cancelled() || parent.is_cancelled() {
                    return;
                }

                let n = match device.read(&mut buf) {
                    Ok(n) => n,
                    Err(Error::Closed) => return,
                    Err(err) => {
                        logging::error!(log, "interface read error"; "error" => %err);
                        return;
                    }
                };

                let info = match decoder.decode(&buf[..n]) {
                    Ok(info) => info,
                    Err(_) => continue,
                };

                let mut msg = Message::new(MessageType::Data);
                msg.id = sequence.next_id(info.endpoint);
                msg.payload_length = n as u16;
                msg.payload = Payload::Raw(buf[..n].to_vec());
                msg.packet = Some(info);

                if tracing {
                    logging::debug!(log, "read from interface";
                                    "id" => msg.id,
                                    "endpoint" => info.endpoint.0,
                                    "size" => n);
                }

                // Bounded channel: a slow consumer backpressures the reader.
                if receiver.send(msg).is_err() {
                    return;
                }
            }
        });
    }

    fn startup(&self, ifc: &Arc<Interface>, up: bool) -> Result<()> {
        let commands = if up {
            &self.cfg.up_commands
        } else {
            &self.cfg.down_commands
        };

        for template in commands {
            let cmd = self.render(template, ifc);
            match self.cmd.run(&cmd) {
                Ok(_) if up => logging::info!(self.log, "interface up"; "cmd" => cmd),
                Ok(_) => logging::info!(self.log, "interface down"; "cmd" => cmd),
                Err(err) => {
                    logging::error!(self.log, "failed to execute"; "cmd" => cmd, "error" => %err);
                    if up {
                        return Err(err);
                    }
                }
            }
        }

        Ok(())
    }

    fn render(&self, template: &str, ifc: &Arc<Interface>) -> String {
        template
            .replace("{{tunnel_dev}}", &ifc.name())
            .replace("{{mtu}}", &self.cfg.mtu.to_string())
            .replace("{{client_tunnel_local_ip}}", &ifc.ip.client_local.to_string())
            .replace(
                "{{client_tunnel_remote_ip}}",
                &ifc.ip.client_remote.to_string(),
            )
            .replace("{{server_tunnel_local_ip}}", &ifc.ip.server_local.to_string())
            .replace(
                "{{server_tunnel_remote_ip}}",
                &ifc.ip.server_remote.to_string(),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::HashSource;
    use crate::tun::{MemoryTunFactory, ShellExecutor};
    use crossbeam_channel::bounded;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn test_ip() -> IfIp {
        IfIp {
            server_local: Ipv4Addr::new(192, 168, 30, 0),
            server_remote: Ipv4Addr::new(192, 168, 30, 1),
            client_local: Ipv4Addr::new(192, 168, 30, 2),
            client_remote: Ipv4Addr::new(192, 168, 30, 3),
        }
    }

    fn adapter(factory: Arc<MemoryTunFactory>) -> IfaceAdapter {
        IfaceAdapter::new(
            &logging::null(),
            IfaceConfig {
                mtu: 1400,
                endpoint_ttl: 60,
                up_commands: Vec::new(),
                down_commands: Vec::new(),
                tracing: false,
            },
            Arc::new(ShellExecutor::new("")),
            factory,
            Arc::new(Decoder::new(HashSource::Full)),
        )
    }

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut data = vec![0u8; 20];
        data[0] = 0x45;
        data[3] = 20;
        data[9] = 17;
        data[12..16].copy_from_slice(&src);
        data[16..20].copy_from_slice(&dst);
        data
    }

    #[test]
    fn test_reader_assigns_sequential_ids() {
        let factory = MemoryTunFactory::new("bur");
        let adapter = adapter(factory.clone());
        let (tx, rx) = bounded(16);

        let ifc = adapter
            .create(0, test_ip(), tx, CancelToken::detached())
            .unwrap();
        let device = factory.devices()[0].clone();

        let packet = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2]);
        device.inject(&packet);
        device.inject(&packet);

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.endpoint(), second.endpoint());
        assert_eq!(first.payload.raw().unwrap(), &packet[..]);

        adapter.close(&ifc).unwrap();
    }

    #[test]
    fn test_distinct_flows_get_distinct_endpoints() {
        let factory = MemoryTunFactory::new("bur");
        let adapter = adapter(factory.clone());
        let (tx, rx) = bounded(16);

        let ifc = adapter
            .create(0, test_ip(), tx, CancelToken::detached())
            .unwrap();
        let device = factory.devices()[0].clone();

        device.inject(&ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2]));
        device.inject(&ipv4_packet([10, 0, 0, 3], [10, 0, 0, 4]));

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert_ne!(first.endpoint(), second.endpoint());
        // Each flow's counter starts at one.
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 1);

        adapter.close(&ifc).unwrap();
    }

    #[test]
    fn test_malformed_packets_are_skipped() {
        let factory = MemoryTunFactory::new("bur");
        let adapter = adapter(factory.clone());
        let (tx, rx) = bounded(16);

        let ifc = adapter
            .create(0, test_ip(), tx, CancelToken::detached())
            .unwrap();
        let device = factory.devices()[0].clone();

        device.inject(&[0u8; 8]);
        device.inject(&ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2]));

        let msg = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(msg.id, 1);

        adapter.close(&ifc).unwrap();
    }
}
