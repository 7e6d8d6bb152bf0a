//! Component configuration
//!
//! Plain structs with defaults and validation; serde derives let a front
//! end load them from configuration files.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VmError};

/// Configuration for a TLB instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlbConfig {
    /// Number of sets
    pub num_sets: usize,
    /// Ways per set
    pub num_ways: usize,
    /// Page size in bytes, a power of two
    pub page_size: u64,
    /// Requests serviced per pipeline stage per cycle
    pub num_req_per_cycle: usize,
    /// Outstanding misses tracked at once
    pub mshr_capacity: usize,
    /// Buffered messages per port
    pub port_capacity: usize,
}

impl Default for TlbConfig {
    fn default() -> Self {
        Self {
            num_sets: 64,
            num_ways: 4,
            page_size: 4096,
            num_req_per_cycle: 4,
            mshr_capacity: 4,
            port_capacity: 16,
        }
    }
}

impl TlbConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() {
            return Err(VmError::InvalidConfig(format!(
                "TLB page size {} is not a power of two",
                self.page_size
            )));
        }
        for (name, value) in [
            ("num_sets", self.num_sets),
            ("num_ways", self.num_ways),
            ("num_req_per_cycle", self.num_req_per_cycle),
            ("mshr_capacity", self.mshr_capacity),
            ("port_capacity", self.port_capacity),
        ] {
            if value == 0 {
                return Err(VmError::InvalidConfig(format!("TLB {name} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Configuration for the MMU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmuConfig {
    /// log2 of the page size
    pub log2_page_size: u64,
    /// Cycles a page walk takes
    pub page_walk_latency: u32,
    /// Walks admitted concurrently
    pub max_requests_in_flight: usize,
    /// Transactions the migration queue holds
    pub migration_queue_size: usize,
    /// Buffered messages per port
    pub port_capacity: usize,
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            log2_page_size: 12,
            page_walk_latency: 100,
            max_requests_in_flight: 16,
            migration_queue_size: 4096,
            port_capacity: 16,
        }
    }
}

impl MmuConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.log2_page_size == 0 || self.log2_page_size > 30 {
            return Err(VmError::InvalidConfig(format!(
                "log2_page_size {} out of range",
                self.log2_page_size
            )));
        }
        for (name, value) in [
            ("max_requests_in_flight", self.max_requests_in_flight),
            ("migration_queue_size", self.migration_queue_size),
            ("port_capacity", self.port_capacity),
        ] {
            if value == 0 {
                return Err(VmError::InvalidConfig(format!("MMU {name} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Configuration for one device's physical memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Bytes of physical memory, a power of two
    pub storage_size: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            storage_size: 4 << 30,
        }
    }
}

impl DeviceConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage_size == 0 || !self.storage_size.is_power_of_two() {
            return Err(VmError::InvalidConfig(format!(
                "device storage size {:#x} must be a non-zero power of two",
                self.storage_size
            )));
        }
        Ok(())
    }
}

/// Configuration for the migration coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// log2 of the page size
    pub log2_page_size: u64,
    /// Buffered messages per port
    pub port_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            log2_page_size: 12,
            port_capacity: 16,
        }
    }
}

impl CoordinatorConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.port_capacity == 0 {
            return Err(VmError::InvalidConfig(
                "coordinator port_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        TlbConfig::default().validate().unwrap();
        MmuConfig::default().validate().unwrap();
        CoordinatorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_page_size() {
        let cfg = TlbConfig {
            page_size: 1000,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_field_rejected() {
        let cfg = TlbConfig {
            num_ways: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = MmuConfig {
            max_requests_in_flight: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_round_trips_through_serde() {
        let cfg = TlbConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: TlbConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.num_sets, cfg.num_sets);
    }
}
