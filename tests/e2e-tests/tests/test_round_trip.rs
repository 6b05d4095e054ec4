//! Scenario: Round Trip
//!
//! A consumer asks for a type proxy before any instance exists, a host then
//! registers one, and the consumer calls it and receives its events.

use e2e_tests::assertions::{assert_instance_count, assert_reply};
use e2e_tests::services::{EchoService, ECHO_TYPE};
use e2e_tests::{client_config, pump_until, registry_config, run_scenario, RegistryHandle, ServiceHost};
use hsu_common::Value;
use hsu_registry_client::RegistryClient;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[test]
fn test_round_trip() {
    run_scenario("Round Trip", || {
        let registry = RegistryHandle::start(registry_config())?;

        // Step 1: Proxy before any instance is registered
        println!("Step 1: Creating a type proxy with no instances...");
        let mut consumer =
            RegistryClient::connect(client_config(&registry)).map_err(|e| format!("Connect failed: {}", e))?;
        let proxy = consumer
            .get_service_by_type(ECHO_TYPE)
            .map_err(|e| format!("Proxy creation failed: {}", e))?;
        assert_instance_count(&proxy, 0)?;
        println!("✓ Empty proxy created\n");

        // Step 2: Register an instance in another client
        println!("Step 2: Registering an Echo instance...");
        let host = ServiceHost::start(client_config(&registry), |client| {
            let uid = client.register(Some("echo-1"), EchoService::default())?;
            Ok(uid.into_iter().collect())
        })?;
        if host.uids.len() != 1 {
            return Err(format!("Expected one registered uid, got {:?}", host.uids));
        }
        pump_until(&mut consumer, Duration::from_secs(5), |_| proxy.instance_count() == 1)?;
        println!("✓ Proxy picked up the new instance\n");

        // Step 3: Calls
        println!("Step 3: Calling through the proxy...");
        assert_reply(proxy.call("Ping", vec![]), Value::from("pong"))?;
        assert_reply(proxy.call("Echo", vec![Value::Int(42)]), Value::Int(42))?;
        match proxy.call("Missing", vec![]) {
            Err(hsu_common::Error::MethodNotCallable { .. }) => {}
            other => return Err(format!("Expected MethodNotCallable, got {:?}", other)),
        }
        println!("✓ Calls answered\n");

        // Step 4: Events
        println!("Step 4: Subscribing and raising an event...");
        let received = Arc::new(Mutex::new(Vec::new()));
        {
            let received = received.clone();
            proxy
                .subscribe(move |event| received.lock().unwrap().push(event.payload.clone()))
                .map_err(|e| format!("Subscribe failed: {}", e))?;
        }
        // The subscription needs a moment to reach the publisher.
        pump_until(&mut consumer, Duration::from_secs(5), |_| {
            let _ = proxy.call("Announce", vec![Value::from("hello")]);
            !received.lock().unwrap().is_empty()
        })?;
        if received.lock().unwrap()[0] != Value::from("hello") {
            return Err(format!("Unexpected event payloads: {:?}", received.lock().unwrap()));
        }
        println!("✓ Event delivered\n");

        // Step 5: Graceful stop unregisters
        println!("Step 5: Stopping the host...");
        drop(host);
        pump_until(&mut consumer, Duration::from_secs(5), |_| proxy.instance_count() == 0)?;
        println!("✓ Instance removed from the proxy\n");

        consumer.shutdown();
        Ok(())
    });
}
