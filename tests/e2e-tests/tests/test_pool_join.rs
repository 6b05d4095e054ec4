//! Scenario: Pool Join
//!
//! A service registered at one registry becomes visible and callable
//! through another registry that joined the pool later.

use e2e_tests::assertions::{assert_found_with_origin, assert_reply};
use e2e_tests::services::{EchoService, ECHO_TYPE};
use e2e_tests::{client_config, pump_until, registry_config, run_scenario, wait_until, RegistryHandle, ServiceHost};
use hsu_common::{ServerId, ServiceUid, Value};
use hsu_registry_client::RegistryClient;
use std::time::Duration;

#[test]
fn test_pool_join() {
    run_scenario("Pool Join", || {
        // Step 1: Register at A while it is still standalone
        println!("Step 1: Registering a service at standalone A...");
        let a = RegistryHandle::start(registry_config())?;
        let host = ServiceHost::start(client_config(&a), |client| {
            Ok(client.register(Some("echo-pooled"), EchoService::default())?.into_iter().collect())
        })?;
        println!("✓ Service registered\n");

        // Step 2: B joins, receiving A's directory
        println!("Step 2: Joining B to A...");
        let b = RegistryHandle::start_joined(registry_config(), &a)?;
        if b.server_id != Some(ServerId::new(2)) {
            return Err(format!("Expected B to get id 2, got {:?}", b.server_id));
        }
        println!("✓ B joined as 2\n");

        // Step 3: Lookup and call through B
        println!("Step 3: Looking up and calling through B...");
        let mut consumer =
            RegistryClient::connect(client_config(&b)).map_err(|e| format!("Connect failed: {}", e))?;
        let uid = ServiceUid::new("echo-pooled");
        if !wait_until(Duration::from_secs(5), || matches!(consumer.find_by_uid(&uid), Ok(Some(_)))) {
            return Err("Service never became visible through B".to_string());
        }
        let found = consumer.find_by_uid(&uid).map_err(|e| format!("Lookup failed: {}", e))?;
        assert_found_with_origin(found, ServerId::FIRST)?;

        let proxy = consumer
            .get_service_by_type(ECHO_TYPE)
            .map_err(|e| format!("Proxy creation failed: {}", e))?;
        pump_until(&mut consumer, Duration::from_secs(5), |_| proxy.instance_count() == 1)?;
        assert_reply(proxy.call("Echo", vec![Value::from("via B")]), Value::from("via B"))?;
        println!("✓ Service reachable through B\n");

        consumer.shutdown();
        drop(host);
        Ok(())
    });
}
