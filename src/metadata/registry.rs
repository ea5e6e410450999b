//! Built-in field definitions for the engine's system data views.
//!
//! System views (`_Sent`, `_Open`, ...) have no destination object behind them,
//! so their columns cannot be fetched live.

use super::{FieldDefinition, FieldType};

type FieldSpec = (&'static str, FieldType, Option<u32>);

const TRACKING_EVENT: &[FieldSpec] = &[
    ("AccountID", FieldType::Number, None),
    ("OYBAccountID", FieldType::Number, None),
    ("JobID", FieldType::Number, None),
    ("ListID", FieldType::Number, None),
    ("BatchID", FieldType::Number, None),
    ("SubscriberID", FieldType::Number, None),
    ("SubscriberKey", FieldType::Text, Some(254)),
    ("EventDate", FieldType::Date, None),
    ("Domain", FieldType::Text, Some(128)),
    ("TriggererSendDefinitionObjectID", FieldType::Text, Some(36)),
    ("TriggeredSendCustomerKey", FieldType::Text, Some(36)),
];

const SENT: &[FieldSpec] = TRACKING_EVENT;

const OPEN: &[FieldSpec] = &[("IsUnique", FieldType::Boolean, None)];

const CLICK: &[FieldSpec] = &[
    ("URL", FieldType::Text, Some(900)),
    ("LinkName", FieldType::Text, Some(1024)),
    ("LinkContent", FieldType::Text, Some(4000)),
    ("IsUnique", FieldType::Boolean, None),
];

const BOUNCE: &[FieldSpec] = &[
    ("BounceCategoryID", FieldType::Number, None),
    ("BounceCategory", FieldType::Text, Some(50)),
    ("BounceSubcategoryID", FieldType::Number, None),
    ("BounceSubcategory", FieldType::Text, Some(50)),
    ("BounceTypeID", FieldType::Number, None),
    ("BounceType", FieldType::Text, Some(50)),
    ("SMTPBounceReason", FieldType::Text, Some(4000)),
    ("SMTPMessage", FieldType::Text, Some(4000)),
    ("SMTPCode", FieldType::Number, None),
    ("IsUnique", FieldType::Boolean, None),
];

const UNSUBSCRIBE: &[FieldSpec] = &[("IsUnique", FieldType::Boolean, None)];

const COMPLAINT: &[FieldSpec] = &[("IsUnique", FieldType::Boolean, None)];

const JOB: &[FieldSpec] = &[
    ("JobID", FieldType::Number, None),
    ("EmailID", FieldType::Number, None),
    ("AccountID", FieldType::Number, None),
    ("AccountUserID", FieldType::Number, None),
    ("FromName", FieldType::Text, Some(130)),
    ("FromEmail", FieldType::EmailAddress, Some(100)),
    ("SchedTime", FieldType::Date, None),
    ("PickupTime", FieldType::Date, None),
    ("DeliveredTime", FieldType::Date, None),
    ("EventID", FieldType::Text, Some(50)),
    ("IsMultipart", FieldType::Boolean, None),
    ("JobType", FieldType::Text, Some(50)),
    ("JobStatus", FieldType::Text, Some(50)),
    ("ModifiedBy", FieldType::Number, None),
    ("ModifiedDate", FieldType::Date, None),
    ("EmailName", FieldType::Text, Some(100)),
    ("EmailSubject", FieldType::Text, Some(200)),
    ("IsWrapped", FieldType::Boolean, None),
    ("TestEmailAddr", FieldType::Text, Some(128)),
    ("Category", FieldType::Text, Some(100)),
    ("BccEmail", FieldType::Text, Some(100)),
    ("OriginalSchedTime", FieldType::Date, None),
    ("CreatedDate", FieldType::Date, None),
    ("CharacterSet", FieldType::Text, Some(30)),
    ("IPAddress", FieldType::Text, Some(50)),
    ("SendType", FieldType::Text, Some(128)),
    ("SuppressTracking", FieldType::Boolean, None),
    ("SendClassificationType", FieldType::Text, Some(32)),
    ("SendClassification", FieldType::Text, Some(36)),
    ("EmailSendDefinition", FieldType::Text, Some(36)),
    ("DeduplicateByEmail", FieldType::Boolean, None),
    ("TriggererSendDefinitionObjectID", FieldType::Text, Some(36)),
    ("TriggeredSendCustomerKey", FieldType::Text, Some(36)),
];

const SUBSCRIBERS: &[FieldSpec] = &[
    ("SubscriberID", FieldType::Number, None),
    ("DateUndeliverable", FieldType::Date, None),
    ("DateJoined", FieldType::Date, None),
    ("DateUnsubscribed", FieldType::Date, None),
    ("Domain", FieldType::Text, Some(254)),
    ("EmailAddress", FieldType::EmailAddress, Some(254)),
    ("BounceCount", FieldType::Number, None),
    ("SubscriberKey", FieldType::Text, Some(254)),
    ("SubscriberType", FieldType::Text, Some(100)),
    ("Status", FieldType::Text, Some(12)),
    ("Locale", FieldType::Text, Some(12)),
];

const LIST_SUBSCRIBERS: &[FieldSpec] = &[
    ("AddedBy", FieldType::Number, None),
    ("AddMethod", FieldType::Text, Some(17)),
    ("CreatedDate", FieldType::Date, None),
    ("DateUnsubscribed", FieldType::Date, None),
    ("EmailAddress", FieldType::EmailAddress, Some(254)),
    ("ListID", FieldType::Number, None),
    ("ListName", FieldType::Text, Some(50)),
    ("ListType", FieldType::Text, Some(16)),
    ("Status", FieldType::Text, Some(12)),
    ("SubscriberID", FieldType::Number, None),
    ("SubscriberKey", FieldType::Text, Some(254)),
    ("SubscriberType", FieldType::Text, Some(100)),
];

const JOURNEY: &[FieldSpec] = &[
    ("VersionID", FieldType::Text, Some(36)),
    ("JourneyID", FieldType::Text, Some(36)),
    ("JourneyName", FieldType::Text, Some(200)),
    ("VersionNumber", FieldType::Number, None),
    ("CreatedDate", FieldType::Date, None),
    ("LastPublishedDate", FieldType::Date, None),
    ("ModifiedDate", FieldType::Date, None),
    ("JourneyStatus", FieldType::Text, Some(100)),
];

const JOURNEY_ACTIVITY: &[FieldSpec] = &[
    ("VersionID", FieldType::Text, Some(36)),
    ("ActivityID", FieldType::Text, Some(36)),
    ("ActivityName", FieldType::Text, Some(200)),
    ("ActivityExternalKey", FieldType::Text, Some(200)),
    ("JourneyActivityObjectID", FieldType::Text, Some(36)),
    ("ActivityType", FieldType::Text, Some(512)),
];

const BUSINESS_UNIT_UNSUBSCRIBES: &[FieldSpec] = &[
    ("BusinessUnitID", FieldType::Number, None),
    ("SubscriberID", FieldType::Number, None),
    ("SubscriberKey", FieldType::Text, Some(254)),
    ("UnsubDateUTC", FieldType::Date, None),
    ("UnsubReason", FieldType::Text, Some(100)),
];

/// Names of every built-in system view.
pub const SYSTEM_TABLES: &[&str] = &[
    "_Sent",
    "_Open",
    "_Click",
    "_Bounce",
    "_Unsubscribe",
    "_Complaint",
    "_Job",
    "_Subscribers",
    "_ListSubscribers",
    "_Journey",
    "_JourneyActivity",
    "_BusinessUnitUnsubscribes",
];

/// Returns true if `name` refers to a built-in system view.
pub fn is_system_table(name: &str) -> bool {
    SYSTEM_TABLES.iter().any(|t| t.eq_ignore_ascii_case(name))
}

/// Returns the fields of a system view, or `None` for ordinary tables.
pub fn system_fields(name: &str) -> Option<Vec<FieldDefinition>> {
    let canonical = SYSTEM_TABLES
        .iter()
        .find(|t| t.eq_ignore_ascii_case(name))?;

    // Event views share the tracking columns and append their own.
    let specs: Vec<FieldSpec> = match *canonical {
        "_Sent" => SENT.to_vec(),
        "_Open" => [TRACKING_EVENT, OPEN].concat(),
        "_Click" => [TRACKING_EVENT, CLICK].concat(),
        "_Bounce" => [TRACKING_EVENT, BOUNCE].concat(),
        "_Unsubscribe" => [TRACKING_EVENT, UNSUBSCRIBE].concat(),
        "_Complaint" => [TRACKING_EVENT, COMPLAINT].concat(),
        "_Job" => JOB.to_vec(),
        "_Subscribers" => SUBSCRIBERS.to_vec(),
        "_ListSubscribers" => LIST_SUBSCRIBERS.to_vec(),
        "_Journey" => JOURNEY.to_vec(),
        "_JourneyActivity" => JOURNEY_ACTIVITY.to_vec(),
        "_BusinessUnitUnsubscribes" => BUSINESS_UNIT_UNSUBSCRIBES.to_vec(),
        _ => return None,
    };

    Some(
        specs
            .into_iter()
            .map(|(name, field_type, max_length)| FieldDefinition {
                max_length,
                ..FieldDefinition::new(name, field_type)
            })
            .collect(),
    )
}
