// ABOUTME: Resource sampling for running executions
// ABOUTME: Wraps sysinfo behind a sampler trait so monitoring stays optional and testable

use chrono::Utc;
use parking_lot::Mutex;
use sysinfo::System;

use crate::model::ResourceUsage;

/// Source of CPU and memory samples; `None` means the tick is skipped
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Option<ResourceUsage>;
}

/// Host-wide sampler backed by sysinfo
pub struct SystemSampler {
    system: Mutex<System>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> Option<ResourceUsage> {
        let mut system = self.system.lock();
        system.refresh_cpu_all();
        system.refresh_memory();

        let cpu_percent = system.global_cpu_usage();
        if !cpu_percent.is_finite() {
            return None;
        }

        Some(ResourceUsage {
            cpu_percent,
            memory_bytes: system.used_memory(),
            sampled_at: Some(Utc::now()),
        })
    }
}
