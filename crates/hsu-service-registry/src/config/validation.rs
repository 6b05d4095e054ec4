use super::*;
use anyhow::{anyhow, Result};

/// Validate the complete configuration
pub fn validate_config(config: &RegistryConfig) -> Result<()> {
    validate_endpoints(config)?;
    validate_timing(config)?;

    if let Some(ref join) = config.join {
        validate_join(join)?;
    }

    Ok(())
}

fn validate_endpoints(config: &RegistryConfig) -> Result<()> {
    if config.rpc_address == config.publish_address && config.rpc_address.port().is_some() {
        return Err(anyhow!(
            "RPC and publish endpoints must differ, both are {}",
            config.rpc_address
        ));
    }

    if let Some(ref host) = config.advertise_host {
        if host.is_empty() || host == "*" || host == "0.0.0.0" {
            return Err(anyhow!("Advertise host must be reachable, got: {:?}", host));
        }
    }

    Ok(())
}

fn validate_timing(config: &RegistryConfig) -> Result<()> {
    if config.application_timeout.as_millis() < 3 {
        return Err(anyhow!("Application timeout must be at least 3ms"));
    }

    if config.server_timeout.as_millis() < 3 {
        return Err(anyhow!("Server timeout must be at least 3ms"));
    }

    if config.full_sync_interval.is_zero() {
        return Err(anyhow!("Full sync interval must be greater than 0"));
    }

    if config.request_timeout.is_zero() {
        return Err(anyhow!("Request timeout must be greater than 0"));
    }

    if config.max_proposal_rounds == 0 {
        return Err(anyhow!("Max proposal rounds must be greater than 0"));
    }

    Ok(())
}

fn validate_join(join: &JoinConfig) -> Result<()> {
    if join.rpc_address.is_wildcard_host() || join.publish_address.is_wildcard_host() {
        return Err(anyhow!(
            "Join addresses must name a reachable host, got {} / {}",
            join.rpc_address,
            join.publish_address
        ));
    }

    if join.rpc_address.port().is_none() && join.rpc_address.uses_ports() {
        return Err(anyhow!("Join address needs a fixed port: {}", join.rpc_address));
    }

    Ok(())
}
