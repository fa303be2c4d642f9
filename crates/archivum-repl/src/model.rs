//! Request and response items of a reconstruction call.

use serde::{Deserialize, Serialize};

use crate::TenantId;

/// One (tenant, category) pair to catch up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructionRequestItem {
    /// Category name, matched case-insensitively.
    pub category: String,
    /// Tenant to reconstruct. Ignored for graph categories.
    pub tenant: TenantId,
    /// Start after this sequence instead of the stored offset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Maximum number of entries to apply.
    pub limit: u32,
}

impl ReconstructionRequestItem {
    /// Item resuming from the stored offset.
    pub fn new(category: impl Into<String>, tenant: TenantId, limit: u32) -> Self {
        Self {
            category: category.into(),
            tenant,
            offset: None,
            limit,
        }
    }

    /// Start after `offset` instead of the stored offset.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Item outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// The batch was applied and the offset advanced.
    #[serde(rename = "OK")]
    Ok,
    /// Nothing was committed for this item.
    #[serde(rename = "KO")]
    Ko,
}

/// Result of one request item, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructionResponseItem {
    /// Tenant actually processed.
    pub tenant: TenantId,
    /// Category as requested.
    pub category: String,
    /// Offset after the call.
    pub offset: u64,
    /// OK or KO.
    pub status: Status,
}

impl ReconstructionResponseItem {
    /// Successful outcome.
    pub fn ok(tenant: TenantId, category: impl Into<String>, offset: u64) -> Self {
        Self {
            tenant,
            category: category.into(),
            offset,
            status: Status::Ok,
        }
    }

    /// Failed outcome.
    pub fn ko(tenant: TenantId, category: impl Into<String>, offset: u64) -> Self {
        Self {
            tenant,
            category: category.into(),
            offset,
            status: Status::Ko,
        }
    }

    /// True for an OK item.
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let items: Vec<ReconstructionRequestItem> = serde_json::from_value(json!([
            {"category": "unit", "tenant": 10, "limit": 100},
            {"category": "OBJECTGROUP", "tenant": 10, "offset": 42, "limit": 5}
        ]))
        .unwrap();
        assert_eq!(items[0], ReconstructionRequestItem::new("unit", 10, 100));
        assert_eq!(items[1].offset, Some(42));
    }

    #[test]
    fn test_negative_limit_is_rejected() {
        let parsed: Result<ReconstructionRequestItem, _> =
            serde_json::from_value(json!({"category": "UNIT", "tenant": 0, "limit": -1}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_response_wire_format() {
        let ok = ReconstructionResponseItem::ok(0, "UNIT", 3);
        let ko = ReconstructionResponseItem::ko(1, "FOO", 0);
        assert_eq!(
            serde_json::to_value([ok, ko]).unwrap(),
            json!([
                {"tenant": 0, "category": "UNIT", "offset": 3, "status": "OK"},
                {"tenant": 1, "category": "FOO", "offset": 0, "status": "KO"}
            ])
        );
    }
}
