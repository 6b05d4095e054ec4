//! Scenario: Concurrent Registration
//!
//! Applications registering at two pooled registries at the same moment
//! must still get pool-unique application ids.

use e2e_tests::{client_config, registry_config, run_scenario, RegistryHandle};
use hsu_common::ApplicationId;
use hsu_registry_client::RegistryClient;
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

const ROUNDS: usize = 5;

#[test]
fn test_concurrent_registration() {
    run_scenario("Concurrent Registration", || {
        // Step 1: Pool of two
        println!("Step 1: Starting registries A and B...");
        let a = RegistryHandle::start(registry_config())?;
        let b = RegistryHandle::start_joined(registry_config(), &a)?;
        println!("✓ Pool of two ready\n");

        // Step 2: Register one application at each registry at once
        println!("Step 2: Registering at A and B simultaneously, {} rounds...", ROUNDS);
        let mut seen = BTreeSet::new();
        for round in 0..ROUNDS {
            let barrier = Arc::new(Barrier::new(2));
            let threads: Vec<_> = [client_config(&a), client_config(&b)]
                .into_iter()
                .map(|config| {
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || -> Result<ApplicationId, String> {
                        barrier.wait();
                        let client =
                            RegistryClient::connect(config).map_err(|e| format!("Connect failed: {}", e))?;
                        let application = client.application();
                        client.shutdown();
                        Ok(application)
                    })
                })
                .collect();

            for thread in threads {
                let application = thread
                    .join()
                    .map_err(|_| "Registration thread panicked".to_string())??;
                if !seen.insert(application) {
                    return Err(format!("Round {}: application id {} handed out twice", round, application));
                }
            }
        }
        println!("✓ {} distinct application ids\n", seen.len());

        drop(b);
        drop(a);
        Ok(())
    });
}
