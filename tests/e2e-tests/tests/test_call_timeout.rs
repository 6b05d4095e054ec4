//! Scenario: Call Timeout
//!
//! A call to an instance whose process died fails with a timeout error
//! shortly after the configured timeout, not later.

use e2e_tests::assertions::{assert_call_timed_out, assert_reply};
use e2e_tests::services::{EchoService, ECHO_TYPE};
use e2e_tests::{client_config, pump_until, registry_config, run_scenario, RegistryHandle, ServiceHost};
use hsu_common::Value;
use hsu_registry_client::RegistryClient;
use std::time::{Duration, Instant};

#[test]
fn test_call_timeout() {
    run_scenario("Call Timeout", || {
        let registry = RegistryHandle::start(registry_config())?;
        let host = ServiceHost::start(client_config(&registry), |client| {
            Ok(client.register(None, EchoService::default())?.into_iter().collect())
        })?;

        // Step 1: Working proxy
        println!("Step 1: Calling a live instance...");
        let mut consumer =
            RegistryClient::connect(client_config(&registry)).map_err(|e| format!("Connect failed: {}", e))?;
        let proxy = consumer
            .get_service_by_type(ECHO_TYPE)
            .map_err(|e| format!("Proxy creation failed: {}", e))?;
        pump_until(&mut consumer, Duration::from_secs(5), |_| proxy.instance_count() == 1)?;
        assert_reply(proxy.call("Ping", vec![]), Value::from("pong"))?;
        println!("✓ Instance answers\n");

        // Step 2: Kill the host, its registration stays behind
        println!("Step 2: Killing the host without unregistering...");
        host.kill();
        println!("✓ Host killed\n");

        // Step 3: The call fails within its timeout
        println!("Step 3: Calling with a 300ms timeout...");
        let started = Instant::now();
        let result = proxy.call_with_timeout("Ping", 300, vec![]);
        assert_call_timed_out(result, started.elapsed(), Duration::from_millis(300 + 700))?;
        println!("✓ Call timed out after {:?}\n", started.elapsed());

        consumer.shutdown();
        Ok(())
    });
}
