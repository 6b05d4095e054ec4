// E2E Test Framework for the HSU service registry
//
// Registries and service hosts run on their own threads inside the test
// process, talking over loopback TCP with OS-assigned ports.

pub mod assertions;
pub mod services;

use hsu_common::{Address, ServerId, ServiceUid, StopHandle};
use hsu_registry_client::{ClientConfig, RegistryClient};
use hsu_service_registry::{RegistryConfig, RegistryServer};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Update loop tick for registries and hosts.
pub const TICK: Duration = Duration::from_millis(10);

/// Initialize test logging once; `RUST_LOG` overrides the level.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Registry configuration with timings short enough for tests.
pub fn registry_config() -> RegistryConfig {
    let mut config = RegistryConfig::ephemeral("127.0.0.1");
    config.application_timeout = Duration::from_secs(3);
    config.server_timeout = Duration::from_millis(1500);
    config.full_sync_interval = Duration::from_secs(1);
    config.request_timeout = Duration::from_millis(500);
    config
}

/// Client configuration pointed at `registry`.
pub fn client_config(registry: &RegistryHandle) -> ClientConfig {
    let mut config = ClientConfig::for_registry(registry.rpc.clone(), registry.publish.clone());
    config.request_timeout = Duration::from_millis(500);
    config.default_call_timeout_ms = 2000;
    config.proxy_refresh_interval = Duration::from_millis(500);
    config
}

/// A registry server running on its own thread.
pub struct RegistryHandle {
    pub rpc: Address,
    pub publish: Address,
    /// Global id right after start; `None` for a standalone registry.
    pub server_id: Option<ServerId>,
    stop: StopHandle,
    crash: StopHandle,
    thread: Option<JoinHandle<()>>,
}

impl RegistryHandle {
    /// Starts a standalone registry.
    pub fn start(config: RegistryConfig) -> Result<Self, String> {
        let server = RegistryServer::bind(config).map_err(|e| format!("Registry failed to start: {}", e))?;
        Ok(Self::spawn(server))
    }

    /// Starts a registry that joins the pool of `member`.
    pub fn start_joined(config: RegistryConfig, member: &RegistryHandle) -> Result<Self, String> {
        let mut server = RegistryServer::bind(config).map_err(|e| format!("Registry failed to start: {}", e))?;
        server
            .join_pool(&member.rpc, &member.publish)
            .map_err(|e| format!("Join via {} failed: {}", member.rpc, e))?;
        Ok(Self::spawn(server))
    }

    fn spawn(mut server: RegistryServer) -> Self {
        let stop = StopHandle::new();
        let crash = StopHandle::new();
        let rpc = server.rpc_address().clone();
        let publish = server.publish_address().clone();
        let server_id = server.server_id();

        let thread = {
            let stop = stop.clone();
            let crash = crash.clone();
            thread::spawn(move || {
                server.auto_update(TICK, &stop);
                if !crash.is_stopped() {
                    server.shutdown();
                }
            })
        };

        println!("Registry started: rpc={} id={:?}", rpc, server_id);
        Self {
            rpc,
            publish,
            server_id,
            stop,
            crash,
            thread: Some(thread),
        }
    }

    /// Stops the registry without unregistering anything, as if the
    /// process died.
    pub fn kill(mut self) {
        self.crash.stop();
        self.join();
        println!("Registry killed: {}", self.rpc);
    }

    fn join(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RegistryHandle {
    fn drop(&mut self) {
        self.join();
    }
}

/// A service process: a registry client registering objects and serving
/// their calls on its own thread.
pub struct ServiceHost {
    pub uids: Vec<ServiceUid>,
    stop: StopHandle,
    crash: StopHandle,
    thread: Option<JoinHandle<()>>,
}

impl ServiceHost {
    /// Connects a client, runs `setup` to register services, then keeps
    /// the client updating until the host is stopped or killed.
    pub fn start<F>(config: ClientConfig, setup: F) -> Result<Self, String>
    where
        F: FnOnce(&mut RegistryClient) -> hsu_common::Result<Vec<ServiceUid>> + Send + 'static,
    {
        let stop = StopHandle::new();
        let crash = StopHandle::new();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = {
            let stop = stop.clone();
            let crash = crash.clone();
            thread::spawn(move || {
                let mut client = match RegistryClient::connect(config) {
                    Ok(client) => client,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("Host failed to connect: {}", e)));
                        return;
                    }
                };
                match setup(&mut client) {
                    Ok(uids) => {
                        let _ = ready_tx.send(Ok(uids));
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("Host setup failed: {}", e)));
                        return;
                    }
                }
                if let Err(e) = client.auto_update(TICK, &stop) {
                    println!("Host update loop ended: {}", e);
                }
                if !crash.is_stopped() {
                    client.shutdown();
                }
            })
        };

        let uids = ready_rx
            .recv_timeout(Duration::from_secs(10))
            .map_err(|_| "Host did not come up within 10s".to_string())??;
        println!("Service host started: {:?}", uids);
        Ok(Self {
            uids,
            stop,
            crash,
            thread: Some(thread),
        })
    }

    /// Stops the host without unregistering, as if the process died. Its
    /// endpoints close.
    pub fn kill(mut self) {
        self.crash.stop();
        self.join();
        println!("Service host killed: {:?}", self.uids);
    }

    fn join(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServiceHost {
    fn drop(&mut self) {
        self.join();
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(TICK);
    }
}

/// Updates `client` until `condition` holds or `timeout` passes. An update
/// error ends the wait with that error.
pub fn pump_until<F>(client: &mut RegistryClient, timeout: Duration, mut condition: F) -> Result<(), String>
where
    F: FnMut(&mut RegistryClient) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        client.update().map_err(|e| format!("Client update failed: {}", e))?;
        if condition(client) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(format!("Condition not met within {:?}", timeout));
        }
        thread::sleep(TICK);
    }
}

/// Runs a scenario between banners and panics with its error.
pub fn run_scenario<F>(name: &str, scenario: F)
where
    F: FnOnce() -> Result<(), String>,
{
    init_logging();
    println!("\n========================================");
    println!("TEST: {}", name);
    println!("========================================\n");

    match scenario() {
        Ok(()) => {
            println!("\n========================================");
            println!("✓ TEST PASSED: {}", name);
            println!("========================================\n");
        }
        Err(e) => {
            println!("\n========================================");
            println!("✗ TEST FAILED: {}", name);
            println!("Error: {}", e);
            println!("========================================\n");
            panic!("Test failed: {}", e);
        }
    }
}
