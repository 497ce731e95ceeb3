//! Unit tests for the Identifiers module
//!
//! Tests cover identifier creation, parsing, conversion, and display formatting.

use core_kernel::{
    AccountId, UserId, TicketId, TimerId, TimeEntryId, TicketAddonId,
    InvoiceId, LineItemId, PaymentId, BillingRateId, TaxConfigurationId,
    BillingSettingId,
};
use uuid::Uuid;

mod time_entry_id_tests {
    use super::*;

    #[test]
    fn test_new_generates_unique_ids() {
        let id1 = TimeEntryId::new();
        let id2 = TimeEntryId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_new_v7_generates_time_ordered_ids() {
        let id1 = TimeEntryId::new_v7();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let id2 = TimeEntryId::new_v7();
        let uuid1: Uuid = id1.into();
        let uuid2: Uuid = id2.into();
        assert!(uuid1 < uuid2);
    }

    #[test]
    fn test_from_uuid() {
        let uuid = Uuid::new_v4();
        let id = TimeEntryId::from_uuid(uuid);
        assert_eq!(*id.as_uuid(), uuid);
    }

    #[test]
    fn test_from_str_with_and_without_prefix() {
        let original = TimeEntryId::new();
        let with_prefix: TimeEntryId = original.to_string().parse().unwrap();
        let bare: TimeEntryId = original.as_uuid().to_string().parse().unwrap();
        assert_eq!(original, with_prefix);
        assert_eq!(original, bare);
    }

    #[test]
    fn test_json_serialization_is_transparent() {
        let id = TimeEntryId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
        let deserialized: TimeEntryId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }
}

mod prefixes {
    use super::*;

    #[test]
    fn test_collaborator_prefixes() {
        assert_eq!(AccountId::prefix(), "ACC");
        assert_eq!(UserId::prefix(), "USR");
        assert_eq!(TicketId::prefix(), "TKT");
    }

    #[test]
    fn test_work_tracking_prefixes() {
        assert_eq!(TimerId::prefix(), "TMR");
        assert_eq!(TimeEntryId::prefix(), "TE");
        assert_eq!(TicketAddonId::prefix(), "ADD");
    }

    #[test]
    fn test_invoicing_prefixes() {
        assert_eq!(InvoiceId::prefix(), "INV");
        assert_eq!(LineItemId::prefix(), "LI");
        assert_eq!(PaymentId::prefix(), "PAY");
        assert_eq!(BillingRateId::prefix(), "RATE");
        assert_eq!(TaxConfigurationId::prefix(), "TAX");
        assert_eq!(BillingSettingId::prefix(), "BST");
    }

    #[test]
    fn test_display_uses_prefix() {
        assert!(InvoiceId::new().to_string().starts_with("INV-"));
        assert!(PaymentId::new().to_string().starts_with("PAY-"));
    }

    #[test]
    fn test_invalid_string_fails_to_parse() {
        let parsed = "INV-not-a-uuid".parse::<InvoiceId>();
        assert!(parsed.is_err());
    }
}
