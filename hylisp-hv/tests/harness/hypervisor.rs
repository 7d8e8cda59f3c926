//! In-process hypervisor with real endpoints.

use hylisp_hv::client::ControlPlaneClient;
use hylisp_hv::config::Config;
use hylisp_hv::control::{ControlPacketRouter, Inject, bind_control_socket};
use hylisp_hv::mapmsg::MapEventMultiplexer;
use hylisp_hv::notify::Notifier;
use hylisp_hv::register::{RegistrationService, SharedSockets};
use hylisp_hv::registry::ControlPlaneRegistry;
use hylisp_hv::tables::Tables;
use nix::poll::PollTimeout;
use std::io;
use std::net::{SocketAddrV4, UdpSocket};
use std::os::unix::net::UnixDatagram;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Injected datagram: source, destination, payload.
pub type Injected = (SocketAddrV4, SocketAddrV4, Vec<u8>);

/// Injector that records instead of sending.
#[derive(Clone, Default)]
pub struct Recorder {
    sent: Arc<Mutex<Vec<Injected>>>,
}

impl Recorder {
    /// Take everything recorded so far.
    pub fn take(&self) -> Vec<Injected> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl Inject for Recorder {
    fn inject(&self, source: SocketAddrV4, destination: SocketAddrV4, payload: &[u8]) -> io::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((source, destination, payload.to_vec()));
        Ok(())
    }
}

pub struct Hypervisor {
    pub dir: TempDir,
    pub config: Config,
    pub tables: Arc<Tables>,
    pub notifier: Arc<Notifier>,
    pub control: Arc<UdpSocket>,
}

impl Hypervisor {
    /// Start the registration service in the background.
    pub fn start(default_port: Option<u16>) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let dir = tempfile::tempdir().expect("Failed to create socket dir");
        let config = Config {
            socket_dir: dir.path().to_path_buf(),
            control_port: 0,
            default_port,
            ..Default::default()
        };

        let control = Arc::new(bind_control_socket(0).expect("Failed to bind control socket"));
        let tables = Arc::new(Tables::with_registry(ControlPlaneRegistry::with_default_port(
            default_port,
        )));
        let notifier = Arc::new(Notifier::new().expect("Failed to create notifier"));

        let service = RegistrationService::bind(
            &config,
            Arc::clone(&tables),
            Arc::clone(&notifier),
            SharedSockets {
                ipv4: Arc::clone(&control),
                ipv6: None,
            },
        )
        .expect("Failed to bind registration endpoint");
        thread::spawn(move || {
            let _ = service.run();
        });

        Hypervisor {
            dir,
            config,
            tables,
            notifier,
            control,
        }
    }

    /// Register a control plane receiving control packets on `port`.
    pub fn connect(&self, port: u16) -> ControlPlaneClient {
        ControlPlaneClient::register(&self.config, port).expect("Registration failed")
    }

    /// Control-packet router on the shared socket, recording injections.
    pub fn control_router(&self) -> (ControlPacketRouter<Recorder>, Recorder) {
        let recorder = Recorder::default();
        let router = ControlPacketRouter::new(
            Arc::clone(&self.control),
            Arc::clone(&self.tables),
            recorder.clone(),
        );
        (router, recorder)
    }

    /// Multiplexer writing to a fake kernel channel; returns the kernel's end.
    pub fn multiplexer(&self) -> (MapEventMultiplexer<UnixDatagram>, UnixDatagram) {
        let (kernel, kernel_peer) = UnixDatagram::pair().expect("Failed to create kernel pair");
        kernel_peer
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mux = MapEventMultiplexer::new(
            Arc::clone(&self.notifier),
            Arc::clone(&self.tables),
            Arc::new(kernel),
        );
        (mux, kernel_peer)
    }

    /// Address control packets should be sent to.
    pub fn control_addr(&self) -> SocketAddrV4 {
        match self.control.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, addr.port()),
            other => panic!("Unexpected control address {other}"),
        }
    }

    /// Wait up to two seconds for registry changes to be signalled. Returns
    /// how many signals were pending.
    pub fn wait_for_signal(&self) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let pending = self.notifier.drain();
            if pending > 0 || Instant::now() >= deadline {
                return pending;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Wait up to two seconds for `cond` to hold.
    pub fn wait_for(&self, cond: impl Fn(&Tables) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond(&self.tables) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond(&self.tables)
    }
}

/// Poll `mux` until its wait set holds `control_planes` channels.
pub fn settle(mux: &mut MapEventMultiplexer<UnixDatagram>, control_planes: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while mux.wait_set().len() != control_planes && Instant::now() < deadline {
        mux.poll_once(PollTimeout::from(100u16)).unwrap();
    }
    assert_eq!(mux.wait_set().len(), control_planes);
}

/// Poll `mux` until it has handled `expected` control-plane messages.
pub fn pump(mux: &mut MapEventMultiplexer<UnixDatagram>, expected: usize) -> usize {
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut handled = 0;
    while handled < expected && Instant::now() < deadline {
        handled += mux.poll_once(PollTimeout::from(100u16)).unwrap();
    }
    handled
}
