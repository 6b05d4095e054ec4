//! Custom assertions for E2E tests

use hsu_common::{Error, ServerId, ServiceRecord, Value};
use hsu_registry_client::ServiceProxy;
use std::time::Duration;

/// Assert that a call returned `expected`
pub fn assert_reply(result: hsu_common::Result<Value>, expected: Value) -> Result<(), String> {
    match result {
        Ok(value) if value == expected => Ok(()),
        Ok(value) => Err(format!("Expected reply {}, got {}", expected, value)),
        Err(e) => Err(format!("Expected reply {}, call failed: {}", expected, e)),
    }
}

/// Assert that a call timed out, and did so within `budget`
pub fn assert_call_timed_out(result: hsu_common::Result<Value>, elapsed: Duration, budget: Duration) -> Result<(), String> {
    match result {
        Err(Error::CallTimeout { .. }) if elapsed <= budget => Ok(()),
        Err(Error::CallTimeout { .. }) => Err(format!(
            "Call timed out after {:?}, expected within {:?}",
            elapsed, budget
        )),
        Err(e) => Err(format!("Expected a call timeout, got: {}", e)),
        Ok(value) => Err(format!("Expected a call timeout, got reply {}", value)),
    }
}

/// Assert that a proxy is backed by exactly `expected` instances
pub fn assert_instance_count(proxy: &ServiceProxy, expected: usize) -> Result<(), String> {
    let actual = proxy.instance_count();
    if actual == expected {
        Ok(())
    } else {
        Err(format!(
            "Proxy for {} has {} instance(s), expected {}: {:#?}",
            proxy.service_type(),
            actual,
            expected,
            proxy.instances()
        ))
    }
}

/// Assert that a lookup found a record stamped by `origin`
pub fn assert_found_with_origin(found: Option<ServiceRecord>, origin: ServerId) -> Result<(), String> {
    match found {
        Some(record) if record.origin == Some(origin) => Ok(()),
        Some(record) => Err(format!(
            "Record {} has origin {:?}, expected {}",
            record.uid, record.origin, origin
        )),
        None => Err("Service was not found".to_string()),
    }
}
