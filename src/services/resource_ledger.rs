//! Resource ledger.
//!
//! Tracks per-resource-type usage against configured limits. A task's
//! allocations are made all-or-nothing: if any request does not fit, the
//! ones already granted for that task are rolled back before returning.
//!
//! The ledger is a plain value; callers serialize access through the lock
//! that guards the owning scheduler state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::domain::errors::{OrchestrationError, OrchestrationResult};
use crate::domain::models::{ResourceAllocation, ResourceLimits, ResourceRequirement, ResourceType};

/// One resource request within an atomic allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationRequest {
    /// Resource to draw from.
    pub resource_type: ResourceType,
    /// Amount to reserve.
    pub amount: f64,
    /// Provider ids the reservation is tied to.
    pub handles: Vec<String>,
}

impl AllocationRequest {
    /// Request with no handles.
    pub const fn new(resource_type: ResourceType, amount: f64) -> Self {
        Self {
            resource_type,
            amount,
            handles: Vec::new(),
        }
    }

    /// Tie the reservation to a provider id.
    #[must_use]
    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handles.push(handle.into());
        self
    }
}

impl From<&ResourceRequirement> for AllocationRequest {
    fn from(req: &ResourceRequirement) -> Self {
        Self::new(req.resource_type, req.amount)
    }
}

/// Usage of one resource type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilization {
    /// Amount reserved.
    pub used: f64,
    /// Configured capacity.
    pub limit: f64,
    /// `used` over `limit`, in percent.
    pub percent: f64,
}

/// Capacity accounting per resource type, with per-task allocations.
#[derive(Debug, Clone)]
pub struct ResourceLedger {
    limits: HashMap<ResourceType, f64>,
    usage: HashMap<ResourceType, f64>,
    allocations: HashMap<String, Vec<ResourceAllocation>>,
}

impl ResourceLedger {
    /// Empty ledger with the configured limits.
    pub fn new(limits: &ResourceLimits) -> Self {
        let limits = ResourceType::ALL
            .iter()
            .map(|rt| (*rt, limits.get(*rt)))
            .collect();
        let usage = ResourceType::ALL.iter().map(|rt| (*rt, 0.0)).collect();
        Self {
            limits,
            usage,
            allocations: HashMap::new(),
        }
    }

    /// Capacity of one resource type.
    pub fn limit(&self, resource_type: ResourceType) -> f64 {
        self.limits.get(&resource_type).copied().unwrap_or(0.0)
    }

    /// Amount currently reserved.
    pub fn usage(&self, resource_type: ResourceType) -> f64 {
        self.usage.get(&resource_type).copied().unwrap_or(0.0)
    }

    /// Capacity left, never negative.
    pub fn available(&self, resource_type: ResourceType) -> f64 {
        (self.limit(resource_type) - self.usage(resource_type)).max(0.0)
    }

    /// Admission check against the static limit only.
    pub fn within_static_limit(&self, requirement: &ResourceRequirement) -> bool {
        requirement.amount >= 0.0 && requirement.amount <= self.limit(requirement.resource_type)
    }

    /// Allocate every request for `task_id` or none of them.
    pub fn allocate_all(
        &mut self,
        task_id: &str,
        requests: &[AllocationRequest],
        expires_at: Option<DateTime<Utc>>,
    ) -> OrchestrationResult<Vec<ResourceAllocation>> {
        let mut granted = Vec::with_capacity(requests.len());

        for request in requests {
            match self.allocate_one(task_id, request, expires_at) {
                Ok(allocation) => granted.push(allocation),
                Err(e) => {
                    for allocation in &granted {
                        self.credit(allocation);
                    }
                    return Err(e);
                }
            }
        }

        self.allocations
            .entry(task_id.to_string())
            .or_default()
            .extend(granted.iter().cloned());
        Ok(granted)
    }

    fn allocate_one(
        &mut self,
        task_id: &str,
        request: &AllocationRequest,
        expires_at: Option<DateTime<Utc>>,
    ) -> OrchestrationResult<ResourceAllocation> {
        let available = self.available(request.resource_type);
        if request.amount > available {
            return Err(OrchestrationError::Scheduling(format!(
                "insufficient {}: requested {}, available {}",
                request.resource_type, request.amount, available
            )));
        }

        *self.usage.entry(request.resource_type).or_insert(0.0) += request.amount;

        Ok(ResourceAllocation {
            allocation_id: Uuid::new_v4(),
            task_id: task_id.to_string(),
            resource_type: request.resource_type,
            allocated_amount: request.amount,
            allocated_resources: request.handles.clone(),
            allocated_at: Utc::now(),
            expires_at,
        })
    }

    fn credit(&mut self, allocation: &ResourceAllocation) {
        let used = self.usage.entry(allocation.resource_type).or_insert(0.0);
        *used = (*used - allocation.allocated_amount).max(0.0);
    }

    /// Release everything `task_id` holds. Idempotent.
    pub fn release_task(&mut self, task_id: &str) -> Vec<ResourceAllocation> {
        let released = self.allocations.remove(task_id).unwrap_or_default();
        for allocation in &released {
            self.credit(allocation);
        }
        released
    }

    /// Live allocations held by a task.
    pub fn allocations_for(&self, task_id: &str) -> &[ResourceAllocation] {
        self.allocations.get(task_id).map_or(&[], Vec::as_slice)
    }

    /// Sum of live allocations of one type.
    pub fn live_total(&self, resource_type: ResourceType) -> f64 {
        self.allocations
            .values()
            .flatten()
            .filter(|a| a.resource_type == resource_type)
            .map(|a| a.allocated_amount)
            .sum()
    }

    /// Usage of every resource type.
    pub fn utilization(&self) -> BTreeMap<ResourceType, ResourceUtilization> {
        ResourceType::ALL
            .iter()
            .map(|rt| {
                let used = self.usage(*rt);
                let limit = self.limit(*rt);
                let percent = if limit > 0.0 { used / limit * 100.0 } else { 0.0 };
                (*rt, ResourceUtilization { used, limit, percent })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_compute(limit: f64) -> ResourceLedger {
        ResourceLedger::new(&ResourceLimits {
            compute: limit,
            ..ResourceLimits::default()
        })
    }

    #[test]
    fn test_allocate_and_release() {
        let mut ledger = ledger_with_compute(100.0);
        let granted = ledger
            .allocate_all("t1", &[AllocationRequest::new(ResourceType::Compute, 60.0)], None)
            .unwrap();
        assert_eq!(granted.len(), 1);
        assert_eq!(ledger.usage(ResourceType::Compute), 60.0);

        let second = ledger.allocate_all("t2", &[AllocationRequest::new(ResourceType::Compute, 60.0)], None);
        assert!(second.is_err());
        assert_eq!(ledger.usage(ResourceType::Compute), 60.0);

        assert_eq!(ledger.release_task("t1").len(), 1);
        assert_eq!(ledger.usage(ResourceType::Compute), 0.0);
        assert!(ledger.release_task("t1").is_empty());
    }

    #[test]
    fn test_partial_failure_rolls_back() {
        let mut ledger = ledger_with_compute(100.0);
        let requests = [
            AllocationRequest::new(ResourceType::Agent, 1.0).with_handle("p1"),
            AllocationRequest::new(ResourceType::Memory, 10.0),
            AllocationRequest::new(ResourceType::Compute, 500.0),
        ];

        let result = ledger.allocate_all("t1", &requests, None);
        assert!(matches!(result, Err(OrchestrationError::Scheduling(_))));
        for rt in ResourceType::ALL {
            assert_eq!(ledger.usage(rt), 0.0, "{rt} leaked");
        }
        assert!(ledger.allocations_for("t1").is_empty());
    }

    #[test]
    fn test_static_limit_check() {
        let ledger = ledger_with_compute(100.0);
        assert!(ledger.within_static_limit(&ResourceRequirement::new(ResourceType::Compute, 100.0)));
        assert!(!ledger.within_static_limit(&ResourceRequirement::new(ResourceType::Compute, 100.5)));
        assert!(!ledger.within_static_limit(&ResourceRequirement::new(ResourceType::Compute, -1.0)));
    }

    #[test]
    fn test_utilization_percent() {
        let mut ledger = ledger_with_compute(200.0);
        ledger
            .allocate_all("t1", &[AllocationRequest::new(ResourceType::Compute, 50.0)], None)
            .unwrap();
        let util = ledger.utilization();
        assert!((util[&ResourceType::Compute].percent - 25.0).abs() < 1e-9);
        assert_eq!(util[&ResourceType::Agent].used, 0.0);
        assert_eq!(ledger.live_total(ResourceType::Compute), 50.0);
    }
}
