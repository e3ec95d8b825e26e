use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The authenticated caller, as established by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: i64,
    pub is_admin: bool,
}

impl Actor {
    pub fn user(id: i64) -> Self {
        Self {
            id,
            is_admin: false,
        }
    }

    pub fn admin(id: i64) -> Self {
        Self { id, is_admin: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Available,
    InUse,
    Unavailable,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Available => "available",
            ResourceStatus::InUse => "in_use",
            ResourceStatus::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Cancelled,
    Expired,
    PendingApproval,
    Rejected,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
            ReservationStatus::PendingApproval => "pending_approval",
            ReservationStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WaitlistStatus {
    Waiting,
    Offered,
    Fulfilled,
    Expired,
    Cancelled,
}

impl WaitlistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitlistStatus::Waiting => "waiting",
            WaitlistStatus::Offered => "offered",
            WaitlistStatus::Fulfilled => "fulfilled",
            WaitlistStatus::Expired => "expired",
            WaitlistStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ReservationConfirmed,
    ReservationCancelled,
    ReservationReminder,
    ResourceAvailable,
    SystemAnnouncement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceFrequency {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceEndType {
    Never,
    OnDate,
    AfterCount,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
    /// Hours before a reservation start at which a reminder fires.
    pub reminder_hours: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Resource {
    pub id: i64,
    pub name: String,
    /// Admin-controlled hard kill switch; orthogonal to `status`.
    pub available: bool,
    pub status: ResourceStatus,
    pub unavailable_since: Option<DateTime<Utc>>,
    pub unavailable_reason: Option<String>,
    pub auto_reset_hours: i64,
    pub requires_approval: bool,
    pub default_approver_id: Option<i64>,
    /// JSON-encoded set of tag strings; use [`Resource::tags`].
    pub tags: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// Tag set, order-insensitive.
    pub fn tags(&self) -> BTreeSet<String> {
        serde_json::from_str(&self.tags).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reservation {
    pub id: i64,
    pub user_id: i64,
    pub resource_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub recurrence_rule_id: Option<i64>,
    /// First occurrence of the series, for recurring instances.
    pub parent_reservation_id: Option<i64>,
    pub is_recurring_instance: bool,
    pub reminder_sent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecurrenceRuleRow {
    pub id: i64,
    pub frequency: RecurrenceFrequency,
    pub interval: i64,
    /// JSON-encoded list of weekday numbers (0 = Monday), weekly rules only.
    pub days_of_week: Option<String>,
    pub end_type: RecurrenceEndType,
    pub end_date: Option<DateTime<Utc>>,
    pub occurrence_count: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApprovalRequest {
    pub id: i64,
    pub reservation_id: i64,
    pub approver_id: i64,
    pub status: ApprovalStatus,
    pub request_message: Option<String>,
    pub response_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WaitlistEntry {
    pub id: i64,
    pub resource_id: i64,
    pub user_id: i64,
    pub desired_start: DateTime<Utc>,
    pub desired_end: DateTime<Utc>,
    pub flexible_time: bool,
    pub status: WaitlistStatus,
    /// 1-based queue position; dense across `waiting` entries per resource.
    pub position: i64,
    pub offered_at: Option<DateTime<Utc>>,
    pub offer_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Webhook {
    pub id: i64,
    pub owner_user_id: i64,
    pub url: String,
    /// URL-safe signing secret; shown once at creation/regeneration.
    pub secret: String,
    /// JSON-encoded list of subscribed event-type strings.
    pub events: String,
    pub is_active: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn subscribed_events(&self) -> Vec<String> {
        serde_json::from_str(&self.events).unwrap_or_default()
    }

    pub fn is_subscribed(&self, event_type: &str) -> bool {
        self.subscribed_events().iter().any(|e| e == event_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookDelivery {
    pub id: i64,
    pub webhook_id: i64,
    pub event_type: String,
    /// Exact wire body that is (re)sent on every attempt.
    pub payload: String,
    pub status: DeliveryStatus,
    pub status_code: Option<i64>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReservationHistoryEntry {
    pub id: i64,
    pub reservation_id: i64,
    pub action: String,
    pub user_id: Option<i64>,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_resource() -> Resource {
        Resource {
            id: 1,
            name: "Room A".into(),
            available: true,
            status: ResourceStatus::Available,
            unavailable_since: None,
            unavailable_reason: None,
            auto_reset_hours: 24,
            requires_approval: false,
            default_approver_id: None,
            tags: "[]".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn resource_tags_parse_as_set() {
        let resource = Resource {
            tags: r#"["beamer","large","beamer"]"#.into(),
            ..base_resource()
        };
        let tags = resource.tags();
        assert_eq!(tags.len(), 2);
        assert!(tags.contains("beamer"));
        assert!(tags.contains("large"));
    }

    #[test]
    fn malformed_tags_fall_back_to_empty() {
        let resource = Resource {
            tags: "not json".into(),
            ..base_resource()
        };
        assert!(resource.tags().is_empty());
    }

    #[test]
    fn webhook_subscription_check() {
        let webhook = Webhook {
            id: 1,
            owner_user_id: 1,
            url: "https://example.com/hook".into(),
            secret: "s".into(),
            events: r#"["reservation.created","waitlist.offer"]"#.into(),
            is_active: true,
            description: None,
            created_at: Utc::now(),
        };
        assert!(webhook.is_subscribed("reservation.created"));
        assert!(!webhook.is_subscribed("reservation.cancelled"));
    }

    #[test]
    fn status_strings_match_wire_form() {
        assert_eq!(
            ReservationStatus::PendingApproval.as_str(),
            "pending_approval"
        );
        assert_eq!(ResourceStatus::InUse.as_str(), "in_use");
        assert_eq!(WaitlistStatus::Waiting.as_str(), "waiting");
    }
}
