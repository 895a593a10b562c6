use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Cancellation/modification terms attached to a resource. Owned by the
/// catalog collaborator; read-only from the engine's perspective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Full refund when cancelling at least this many hours before check-in.
    pub free_window_hours: i64,
    /// Partial refund window, inclusive at the threshold.
    pub partial_window_hours: i64,
    /// Percentage refunded inside the partial window (0..=100).
    pub partial_refund_pct: u8,
    pub change_fee_cents: i64,
    /// Modifications are rejected closer to check-in than this.
    pub modify_until_hours: i64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            free_window_hours: 48,
            partial_window_hours: 24,
            partial_refund_pct: 50,
            change_fee_cents: 0,
            modify_until_hours: 48,
        }
    }
}

/// Read-only policy lookup boundary.
pub trait PolicyStore: Send + Sync {
    /// Policy for a resource; `None` when the catalog has no entry.
    fn policy(&self, resource_id: Ulid) -> Option<Policy>;
}

/// In-memory policy store with a fallback default.
pub struct MemoryPolicyStore {
    policies: DashMap<Ulid, Policy>,
    default: Policy,
}

impl MemoryPolicyStore {
    pub fn new(default: Policy) -> Self {
        Self {
            policies: DashMap::new(),
            default,
        }
    }

    pub fn set(&self, resource_id: Ulid, policy: Policy) {
        self.policies.insert(resource_id, policy);
    }
}

impl PolicyStore for MemoryPolicyStore {
    fn policy(&self, resource_id: Ulid) -> Option<Policy> {
        Some(
            self.policies
                .get(&resource_id)
                .map(|e| e.value().clone())
                .unwrap_or_else(|| self.default.clone()),
        )
    }
}
