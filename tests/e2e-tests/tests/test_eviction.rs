//! Scenario: Application Eviction
//!
//! A host that dies without unregistering stops heartbeating; its
//! services disappear from the directory and from live proxies.

use e2e_tests::assertions::assert_instance_count;
use e2e_tests::services::{EchoService, ECHO_TYPE};
use e2e_tests::{client_config, pump_until, registry_config, run_scenario, RegistryHandle, ServiceHost};
use hsu_registry_client::RegistryClient;
use std::time::Duration;

#[test]
fn test_eviction() {
    run_scenario("Application Eviction", || {
        let mut config = registry_config();
        config.application_timeout = Duration::from_secs(1);
        let registry = RegistryHandle::start(config)?;

        // Step 1: Two instances
        println!("Step 1: Registering two Echo instances in one host...");
        let host = ServiceHost::start(client_config(&registry), |client| {
            let mut uids = Vec::new();
            uids.extend(client.register(None, EchoService::default())?);
            uids.extend(client.register(None, EchoService::default())?);
            Ok(uids)
        })?;
        let mut consumer =
            RegistryClient::connect(client_config(&registry)).map_err(|e| format!("Connect failed: {}", e))?;
        let proxy = consumer
            .get_service_by_type(ECHO_TYPE)
            .map_err(|e| format!("Proxy creation failed: {}", e))?;
        assert_instance_count(&proxy, 2)?;
        println!("✓ Proxy sees {:?}\n", host.uids);

        // Step 2: Host dies, heartbeats stop
        println!("Step 2: Killing the host...");
        host.kill();
        pump_until(&mut consumer, Duration::from_secs(5), |_| proxy.instance_count() == 0)?;
        println!("✓ Proxy emptied after the application timed out\n");

        // Step 3: Directory agrees
        let remaining = consumer
            .find_by_type(ECHO_TYPE)
            .map_err(|e| format!("Lookup failed: {}", e))?;
        if !remaining.is_empty() {
            return Err(format!("Evicted services still listed: {:?}", remaining));
        }
        println!("✓ Directory no longer lists the services\n");

        consumer.shutdown();
        Ok(())
    });
}
