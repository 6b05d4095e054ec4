//! Scenario: Registry Failover
//!
//! Three pooled registries; the one a client uses dies. The client moves
//! to the surviving alternate with the highest id and keeps working.

use e2e_tests::services::EchoService;
use e2e_tests::{client_config, pump_until, registry_config, run_scenario, wait_until, RegistryHandle, ServiceHost};
use hsu_common::{ServerId, ServiceUid};
use hsu_registry_client::RegistryClient;
use std::time::Duration;

#[test]
fn test_failover() {
    run_scenario("Registry Failover", || {
        // Step 1: Pool of three
        println!("Step 1: Starting registries A, B and C...");
        let a = RegistryHandle::start(registry_config())?;
        let b = RegistryHandle::start_joined(registry_config(), &a)?;
        let c = RegistryHandle::start_joined(registry_config(), &a)?;
        if b.server_id != Some(ServerId::new(2)) || c.server_id != Some(ServerId::new(3)) {
            return Err(format!("Unexpected ids: B={:?} C={:?}", b.server_id, c.server_id));
        }
        println!("✓ Pool formed: A=1, B=2, C=3\n");

        // Step 2: Clients on A
        println!("Step 2: Connecting a host and a consumer to A...");
        let host = ServiceHost::start(client_config(&a), |client| {
            Ok(client.register(Some("echo-failover"), EchoService::default())?.into_iter().collect())
        })?;
        let mut consumer =
            RegistryClient::connect(client_config(&a)).map_err(|e| format!("Connect failed: {}", e))?;
        let alternates: Vec<ServerId> = consumer.alternates().iter().map(|alt| alt.server_id).collect();
        if alternates != vec![ServerId::new(1), ServerId::new(2), ServerId::new(3)] {
            return Err(format!("Unexpected alternates: {:?}", alternates));
        }
        println!("✓ Consumer knows alternates {:?}\n", alternates);

        // Step 3: Kill A
        println!("Step 3: Killing registry A...");
        a.kill();
        pump_until(&mut consumer, Duration::from_secs(10), |client| {
            client.registry_server_id() == Some(ServerId::new(3))
        })?;
        println!("✓ Consumer failed over to C\n");

        // Step 4: Directory still reachable through C
        println!("Step 4: Looking up the service through C...");
        let uid = ServiceUid::new("echo-failover");
        let found = wait_until(Duration::from_secs(10), || {
            let _ = consumer.update();
            matches!(consumer.find_by_uid(&uid), Ok(Some(_)))
        });
        if !found {
            return Err("Service not found through C after failover".to_string());
        }
        consumer.update().map_err(|e| format!("Update after failover failed: {}", e))?;
        println!("✓ Service found, client healthy\n");

        drop(host);
        consumer.shutdown();
        drop((b, c));
        Ok(())
    });
}
