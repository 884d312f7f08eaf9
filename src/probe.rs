use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;
use surge_ping::{Client as PingClient, Config as PingConfig, PingIdentifier, PingSequence, ICMP};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::SpeedTestConfig;
use crate::models::{SpeedSample, Status};
use crate::speed::SpeedTester;

/// One-shot reachability and throughput checks.
///
/// None of these surface an error: failures come back as [`Status::Down`]
/// or, for the speed test, as `None`.
pub trait Prober: Send + Sync + 'static {
    fn check_reachable(&self, address: &str, count: u32, timeout: Duration) -> impl Future<Output = Status> + Send;

    fn check_port(&self, address: &str, port: u16, timeout: Duration) -> impl Future<Output = Status> + Send;

    fn measure_speed(&self) -> impl Future<Output = Option<SpeedSample>> + Send;
}

/// ICMP sockets, one per address family. Either may be missing when the
/// process lacks the privilege to open it; pings on that family are DOWN.
#[derive(Default)]
pub struct PingClients {
    v4: Option<PingClient>,
    v6: Option<PingClient>,
}

impl PingClients {
    pub fn open() -> Self {
        Self {
            v4: open_ping_client(ICMP::V4, "ICMPv4"),
            v6: open_ping_client(ICMP::V6, "ICMPv6"),
        }
    }

    fn for_ip(&self, ip: &IpAddr) -> Option<&PingClient> {
        match ip {
            IpAddr::V4(_) => self.v4.as_ref(),
            IpAddr::V6(_) => self.v6.as_ref(),
        }
    }
}

fn open_ping_client(kind: ICMP, label: &str) -> Option<PingClient> {
    match PingClient::new(&PingConfig::builder().kind(kind).build()) {
        Ok(client) => Some(client),
        Err(e) => {
            warn!("Cannot open {} ping socket, reachability on it reports DOWN: {}", label, e);
            None
        }
    }
}

pub struct NetworkProber {
    ping: PingClients,
    dns_resolver: TokioResolver,
    speed: Option<SpeedTester>,
}

impl NetworkProber {
    pub fn new(speed_config: SpeedTestConfig) -> Self {
        let speed = SpeedTester::new(speed_config)
            .inspect_err(|e| warn!("Speed test disabled: {:#}", e))
            .ok();
        Self::with_ping_clients(PingClients::open(), speed)
    }

    pub fn with_ping_clients(ping: PingClients, speed: Option<SpeedTester>) -> Self {
        let dns_resolver = match TokioResolver::builder_tokio() {
            Ok(builder) => builder.build(),
            Err(e) => {
                warn!("System resolver unavailable ({}), using Cloudflare", e);
                TokioResolver::builder_with_config(
                    ResolverConfig::cloudflare(),
                    TokioConnectionProvider::default(),
                )
                .build()
            }
        };
        info!(
            "Prober ready (ICMPv4: {}, ICMPv6: {})",
            ping.v4.is_some(),
            ping.v6.is_some()
        );

        Self { ping, dns_resolver, speed }
    }

    /// First address of `address` that one of the ping sockets can reach.
    async fn resolve(&self, address: &str) -> Result<IpAddr, String> {
        if let Ok(ip) = address.parse::<IpAddr>() {
            return Ok(ip);
        }
        match self.dns_resolver.lookup_ip(address).await {
            Ok(lookup) => lookup
                .iter()
                .find(|ip| self.ping.for_ip(ip).is_some())
                .ok_or_else(|| "No pingable IP Address Found".into()),
            Err(e) => Err(format!("DNS Resolution Failed: {}", e)),
        }
    }

    async fn ping(&self, address: &str, count: u32, timeout: Duration) -> Status {
        let ip = match self.resolve(address).await {
            Ok(ip) => ip,
            Err(e) => {
                debug!("{}: {}", address, e);
                return Status::Down;
            }
        };
        let Some(client) = self.ping.for_ip(&ip) else {
            debug!("{}: no ping socket for {}", address, ip);
            return Status::Down;
        };

        let payload = [0u8; 56];
        let mut pinger = client.pinger(ip, PingIdentifier(rand::random())).await;
        pinger.timeout(timeout);

        for i in 0..count.max(1) {
            match pinger.ping(PingSequence(i as u16), &payload).await {
                Ok((_, latency)) => {
                    debug!("{} replied in {:.1}ms", address, latency.as_secs_f64() * 1000.0);
                    return Status::Up;
                }
                Err(e) => {
                    debug!("{} ping {} failed: {}", address, i, e);
                    if i + 1 < count {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
        Status::Down
    }
}

impl Prober for NetworkProber {
    /// `timeout` bounds the whole check, name resolution included.
    async fn check_reachable(&self, address: &str, count: u32, timeout: Duration) -> Status {
        match tokio::time::timeout(timeout, self.ping(address, count, timeout)).await {
            Ok(status) => status,
            Err(_) => {
                debug!("{} timed out", address);
                Status::Down
            }
        }
    }

    async fn check_port(&self, address: &str, port: u16, timeout: Duration) -> Status {
        match tokio::time::timeout(timeout, TcpStream::connect((address, port))).await {
            Ok(Ok(_)) => Status::Up,
            Ok(Err(e)) => {
                debug!("{}:{} refused: {}", address, port, e);
                Status::Down
            }
            Err(_) => {
                debug!("{}:{} timed out", address, port);
                Status::Down
            }
        }
    }

    async fn measure_speed(&self) -> Option<SpeedSample> {
        let tester = self.speed.as_ref()?;
        match tester.measure().await {
            Ok(t) => Some(SpeedSample::from_bits_per_second(t.download_bps, t.upload_bps)),
            Err(e) => {
                warn!("Speed test failed, keeping previous sample: {:#}", e);
                None
            }
        }
    }
}
