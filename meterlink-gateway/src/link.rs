//! Wireless link management.
//!
//! The [`LinkManager`] asks a [`LinkDriver`] to associate with the access
//! point, then waits for the platform to report the association result and
//! an assigned address. Platform reports arrive asynchronously through a
//! [`LinkNotifier`], usually from a monitor task owned by the driver.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;
use crate::signal::Signal;

/// Link errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Link unavailable")]
    LinkUnavailable,

    #[error("No address assigned before timeout")]
    AddressTimeout,

    #[error("Connect request failed: {0}")]
    Request(String),
}

/// Link state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}

/// Access point credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCredentials {
    pub ssid: String,
    pub passphrase: String,
}

impl std::fmt::Debug for LinkCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkCredentials")
            .field("ssid", &self.ssid)
            .field("passphrase", &"***")
            .finish()
    }
}

#[derive(Debug)]
struct LinkSignals {
    connect: Signal<Result<(), i32>>,
    address: Signal<IpAddr>,
    state: watch::Sender<LinkState>,
}

/// Handle through which the platform reports link events.
#[derive(Debug, Clone)]
pub struct LinkNotifier {
    inner: Arc<LinkSignals>,
}

impl Default for LinkNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkNotifier {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            inner: Arc::new(LinkSignals {
                connect: Signal::new(),
                address: Signal::new(),
                state,
            }),
        }
    }

    /// Association finished; `Err` carries the platform status code.
    pub fn connect_result(&self, result: Result<(), i32>) {
        debug!(?result, "Link association result");
        self.inner.connect.give(result);
    }

    /// An address was assigned to the interface.
    pub fn address_assigned(&self, address: IpAddr) {
        debug!(%address, "Link address assigned");
        self.inner.address.give(address);
    }

    /// The link went down. Pending reports are discarded.
    pub fn disconnected(&self) {
        self.inner.connect.reset();
        self.inner.address.reset();
        let previous = self.inner.state.send_replace(LinkState::Disconnected);
        if previous != LinkState::Disconnected {
            warn!(previous = %previous, "Link lost");
        }
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    fn set_state(&self, state: LinkState) {
        self.inner.state.send_replace(state);
    }
}

/// Platform side of the link.
pub trait LinkDriver {
    /// Start associating. Progress is reported through the [`LinkNotifier`].
    fn request_connect(
        &mut self,
        credentials: &LinkCredentials,
    ) -> impl Future<Output = Result<(), LinkError>>;
}

/// Bounded-retry link establishment.
pub struct LinkManager<D: LinkDriver> {
    driver: D,
    notifier: LinkNotifier,
    policy: RetryPolicy,
    address: Option<IpAddr>,
}

impl<D: LinkDriver> LinkManager<D> {
    /// `policy.timeout` bounds each of the two waits of an attempt.
    pub fn new(driver: D, notifier: LinkNotifier, policy: RetryPolicy) -> Self {
        Self {
            driver,
            notifier,
            policy,
            address: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.notifier.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.notifier.subscribe()
    }

    /// Address from the last successful connect.
    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }

    pub fn notifier(&self) -> &LinkNotifier {
        &self.notifier
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Connect with up to `policy.max_attempts` attempts.
    pub async fn connect(&mut self, credentials: &LinkCredentials) -> Result<(), LinkError> {
        for attempt in self.policy.attempts() {
            self.notifier.inner.connect.reset();
            self.notifier.inner.address.reset();
            self.notifier.set_state(LinkState::Connecting);

            info!(
                ssid = %credentials.ssid,
                attempt,
                max_attempts = self.policy.max_attempts,
                "Connecting link"
            );

            match self.attempt(credentials).await {
                Ok(address) => {
                    self.address = Some(address);
                    self.notifier.set_state(LinkState::Connected);
                    info!(ssid = %credentials.ssid, %address, "Link connected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Link attempt failed");
                }
            }

            if !self.policy.is_last(attempt) {
                tokio::time::sleep(self.policy.delay()).await;
            }
        }

        self.address = None;
        self.notifier.set_state(LinkState::Disconnected);
        warn!(
            ssid = %credentials.ssid,
            attempts = self.policy.max_attempts,
            "Link unavailable after all attempts"
        );
        Err(LinkError::LinkUnavailable)
    }

    async fn attempt(&mut self, credentials: &LinkCredentials) -> Result<IpAddr, LinkError> {
        self.driver.request_connect(credentials).await?;

        match self.notifier.inner.connect.wait(self.policy.timeout()).await {
            Some(Ok(())) => {}
            Some(Err(status)) => {
                warn!(status, "Association rejected");
                return Err(LinkError::LinkUnavailable);
            }
            None => return Err(LinkError::LinkUnavailable),
        }

        self.notifier
            .inner
            .address
            .wait(self.policy.timeout())
            .await
            .ok_or(LinkError::AddressTimeout)
    }
}

/// Linux network interface driver.
///
/// Association is delegated to an external command (for example
/// `nmcli dev wifi connect {ssid} password {psk} ifname {interface}`); a
/// monitor task watches `/sys/class/net/<interface>/operstate` and probes
/// the route table for the source address, reporting edges to the notifier.
pub struct InterfaceLink {
    interface: String,
    command: Vec<String>,
    notifier: LinkNotifier,
    poll_interval: Duration,
    probe: String,
    sysfs_root: PathBuf,
    rearm: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl InterfaceLink {
    pub fn new(interface: impl Into<String>, command: Vec<String>, notifier: LinkNotifier) -> Self {
        Self {
            interface: interface.into(),
            command,
            notifier,
            poll_interval: Duration::from_secs(1),
            probe: "1.1.1.1:53".to_string(),
            sysfs_root: PathBuf::from("/sys/class/net"),
            rearm: Arc::new(AtomicBool::new(false)),
            monitor: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Remote address used to discover the outbound source address.
    pub fn with_probe(mut self, probe: impl Into<String>) -> Self {
        self.probe = probe.into();
        self
    }

    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    /// Association command with placeholders substituted.
    pub fn command_line(&self, credentials: &LinkCredentials) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{ssid}", &credentials.ssid)
                    .replace("{psk}", &credentials.passphrase)
                    .replace("{interface}", &self.interface)
            })
            .collect()
    }

    fn ensure_monitor(&mut self) {
        if self.monitor.as_ref().is_some_and(|m| !m.is_finished()) {
            // Report the current state again to the new attempt.
            self.rearm.store(true, Ordering::SeqCst);
            return;
        }

        let monitor = InterfaceMonitor {
            operstate: self.sysfs_root.join(&self.interface).join("operstate"),
            probe: self.probe.clone(),
            notifier: self.notifier.clone(),
            rearm: self.rearm.clone(),
        };
        let interval = self.poll_interval;
        debug!(interface = %self.interface, "Starting interface monitor");
        self.monitor = Some(tokio::spawn(monitor.run(interval)));
    }
}

impl Drop for InterfaceLink {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

impl LinkDriver for InterfaceLink {
    async fn request_connect(&mut self, credentials: &LinkCredentials) -> Result<(), LinkError> {
        self.ensure_monitor();

        let command = self.command_line(credentials);
        let Some((program, args)) = command.split_first() else {
            debug!(interface = %self.interface, "No association command, waiting for the interface");
            return Ok(());
        };

        let status = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| LinkError::Request(format!("{}: {}", program, e)))?;

        if !status.success() {
            return Err(LinkError::Request(format!("{} exited with {}", program, status)));
        }
        Ok(())
    }
}

struct InterfaceMonitor {
    operstate: PathBuf,
    probe: String,
    notifier: LinkNotifier,
    rearm: Arc<AtomicBool>,
}

impl InterfaceMonitor {
    async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut was_up = false;
        let mut had_address: Option<IpAddr> = None;

        loop {
            ticker.tick().await;

            if self.rearm.swap(false, Ordering::SeqCst) {
                was_up = false;
                had_address = None;
            }

            let up = self.is_up().await;
            let address = if up { self.source_address().await } else { None };

            if up && !was_up {
                self.notifier.connect_result(Ok(()));
            }
            if let Some(address) = address {
                if had_address != Some(address) {
                    self.notifier.address_assigned(address);
                }
            }
            if !up && was_up {
                self.notifier.disconnected();
            }

            was_up = up;
            had_address = address;
        }
    }

    async fn is_up(&self) -> bool {
        match tokio::fs::read_to_string(&self.operstate).await {
            Ok(state) => state.trim() == "up",
            Err(e) => {
                debug!(path = %self.operstate.display(), error = %e, "Cannot read operstate");
                false
            }
        }
    }

    async fn source_address(&self) -> Option<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect(&self.probe).await.ok()?;
        let address = socket.local_addr().ok()?.ip();
        (!address.is_unspecified()).then_some(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{LinkScript, MockLinkDriver};
    use tokio::time::Instant;

    fn credentials() -> LinkCredentials {
        LinkCredentials {
            ssid: "field-ap".to_string(),
            passphrase: "secret".to_string(),
        }
    }

    fn manager(script: LinkScript, policy: RetryPolicy) -> LinkManager<MockLinkDriver> {
        let notifier = LinkNotifier::new();
        let driver = MockLinkDriver::new(notifier.clone(), script);
        LinkManager::new(driver, notifier, policy)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_success() {
        let mut link = manager(LinkScript::Succeed, RetryPolicy::new(10, 5000, 30_000));
        let mut states = link.subscribe();

        link.connect(&credentials()).await.unwrap();

        assert_eq!(link.state(), LinkState::Connected);
        assert!(link.is_connected());
        assert_eq!(link.address(), Some(IpAddr::from([192, 168, 4, 2])));
        assert_eq!(link.driver().requests(), 1);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), LinkState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_signals_exhausts_attempts() {
        let mut link = manager(LinkScript::NeverSignal, RetryPolicy::new(10, 5000, 30_000));
        let start = Instant::now();

        let result = link.connect(&credentials()).await;

        assert_eq!(result, Err(LinkError::LinkUnavailable));
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(link.driver().requests(), 10);
        // 10 result timeouts, 9 pauses between attempts.
        assert!(start.elapsed() >= Duration::from_secs(10 * 30 + 9 * 5));
        assert!(start.elapsed() < Duration::from_secs(10 * 30 + 10 * 5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_address_times_out() {
        let mut link = manager(LinkScript::NoAddress, RetryPolicy::new(2, 1000, 10_000));

        let result = link.connect(&credentials()).await;

        assert_eq!(result, Err(LinkError::LinkUnavailable));
        assert_eq!(link.driver().requests(), 2);
        assert_eq!(link.address(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_association_fails_fast() {
        let mut link = manager(LinkScript::Reject(15), RetryPolicy::new(3, 1000, 30_000));
        let start = Instant::now();

        assert!(link.connect(&credentials()).await.is_err());
        assert_eq!(link.driver().requests(), 3);
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_failure_counts_as_attempt() {
        let mut link = manager(LinkScript::FailRequest, RetryPolicy::new(4, 100, 1000));

        assert_eq!(
            link.connect(&credentials()).await,
            Err(LinkError::LinkUnavailable)
        );
        assert_eq!(link.driver().requests(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_later_attempt() {
        let mut link = manager(LinkScript::NeverSignal, RetryPolicy::new(3, 5000, 30_000));
        let driver = link.driver().clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(32)).await;
            driver.set_script(LinkScript::Succeed);
        });

        link.connect(&credentials()).await.unwrap();

        assert_eq!(link.driver().requests(), 2);
        assert!(link.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_notification_clears_state() {
        let mut link = manager(LinkScript::Succeed, RetryPolicy::new(1, 0, 30_000));
        link.connect(&credentials()).await.unwrap();

        link.notifier().address_assigned(IpAddr::from([10, 0, 0, 1]));
        link.driver().drop_link();

        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(!link.notifier().inner.address.is_raised());
        assert!(!link.notifier().inner.connect.is_raised());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_signal_not_consumed_by_next_attempt() {
        let mut link = manager(LinkScript::NeverSignal, RetryPolicy::new(1, 0, 1000));
        link.notifier().connect_result(Ok(()));
        link.notifier().address_assigned(IpAddr::from([10, 0, 0, 1]));

        assert_eq!(
            link.connect(&credentials()).await,
            Err(LinkError::LinkUnavailable)
        );
    }

    #[test]
    fn test_command_placeholders() {
        let driver = InterfaceLink::new(
            "wlan1",
            vec![
                "nmcli".to_string(),
                "dev".to_string(),
                "wifi".to_string(),
                "connect".to_string(),
                "{ssid}".to_string(),
                "password".to_string(),
                "{psk}".to_string(),
                "ifname".to_string(),
                "{interface}".to_string(),
            ],
            LinkNotifier::new(),
        );

        assert_eq!(
            driver.command_line(&credentials()),
            vec![
                "nmcli", "dev", "wifi", "connect", "field-ap", "password", "secret", "ifname",
                "wlan1"
            ]
        );
    }

    #[test]
    fn test_credentials_debug_hides_passphrase() {
        let text = format!("{:?}", credentials());
        assert!(text.contains("field-ap"));
        assert!(!text.contains("secret"));
    }

    #[tokio::test]
    async fn test_interface_link_reports_operstate_edges() {
        let root = std::env::temp_dir().join(format!("meterlink-sysfs-{}", std::process::id()));
        let iface = root.join("wtest0");
        std::fs::create_dir_all(&iface).unwrap();
        std::fs::write(iface.join("operstate"), "up\n").unwrap();

        let notifier = LinkNotifier::new();
        let driver = InterfaceLink::new("wtest0", Vec::new(), notifier.clone())
            .with_poll_interval(Duration::from_millis(20))
            .with_probe("127.0.0.1:9")
            .with_sysfs_root(&root);
        let mut link = LinkManager::new(driver, notifier, RetryPolicy::new(1, 0, 2000));

        link.connect(&credentials()).await.unwrap();
        assert_eq!(link.address(), Some(IpAddr::from([127, 0, 0, 1])));

        std::fs::write(iface.join("operstate"), "down\n").unwrap();
        let mut states = link.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s == LinkState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        let _ = std::fs::remove_dir_all(&root);
    }
}
