// Test-specific lint overrides: property tests use unwrap/expect freely.
#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Property-based tests for the signaling wire envelopes.
//!
//! Uses proptest to verify:
//! 1. User-id validation accepts exactly the ids within bounds.
//! 2. Arbitrary text never causes a panic in `decode` (returns `Err`
//!    gracefully).
//! 3. Client envelopes with arbitrary ids and payloads survive a
//!    serialize → decode round-trip.
//! 4. The decode classification never mislabels a recognized type as
//!    unknown.

use beacon_proto::envelope::{
    self, ClientEnvelope, DecodeError, MAX_USER_ID_LEN, validate_user_id,
};
use proptest::prelude::*;

/// Strategy for ids within the accepted bounds.
fn arb_valid_user_id() -> impl Strategy<Value = String> {
    "[^\x00]{1,50}"
}

/// Strategy for arbitrary JSON-safe payload strings.
fn arb_payload_text() -> impl Strategy<Value = String> {
    ".{0,256}"
}

proptest! {
    /// Ids of 1..=MAX_USER_ID_LEN characters always validate.
    #[test]
    fn ids_within_bounds_validate(id in arb_valid_user_id()) {
        prop_assert!(id.chars().count() <= MAX_USER_ID_LEN);
        prop_assert!(validate_user_id(&id).is_ok());
    }

    /// Ids longer than the cap always fail, regardless of content.
    #[test]
    fn ids_over_bounds_fail(id in proptest::string::string_regex(".{51,80}").unwrap()) {
        prop_assume!(id.chars().count() > MAX_USER_ID_LEN);
        prop_assert!(validate_user_id(&id).is_err());
    }

    /// Arbitrary text never panics the decoder — malformed input is an Err.
    #[test]
    fn arbitrary_text_decode_no_panic(text in ".{0,512}") {
        let _ = envelope::decode(&text);
    }

    /// A register envelope with any valid id and payload round-trips
    /// through JSON.
    #[test]
    fn register_round_trip(id in arb_valid_user_id(), name in arb_payload_text()) {
        let text = serde_json::json!({
            "type": "register",
            "userId": id,
            "userInfo": {"name": name},
        })
        .to_string();
        let decoded = envelope::decode(&text).expect("decode should succeed");
        match decoded {
            ClientEnvelope::Register { user_id, user_info } => {
                prop_assert_eq!(user_id, id);
                let user_info = user_info.expect("userInfo present");
                prop_assert_eq!(user_info["name"].as_str(), Some(name.as_str()));
            }
            other => prop_assert!(false, "expected Register, got {:?}", other),
        }
    }

    /// An offer envelope preserves its opaque payload through decoding.
    #[test]
    fn offer_payload_is_opaque(target in arb_valid_user_id(), sdp in arb_payload_text()) {
        let text = serde_json::json!({
            "type": "offer",
            "targetUserId": target,
            "payload": {"sdp": sdp},
        })
        .to_string();
        let decoded = envelope::decode(&text).expect("decode should succeed");
        match decoded {
            ClientEnvelope::Offer { target_user_id, payload } => {
                prop_assert_eq!(target_user_id, target);
                prop_assert_eq!(payload["sdp"].as_str(), Some(sdp.as_str()));
            }
            other => prop_assert!(false, "expected Offer, got {:?}", other),
        }
    }

    /// Objects with an unrecognized tag are classified UnknownType, never
    /// Malformed — the relay must stay silent for them.
    #[test]
    fn unrecognized_tags_are_classified(tag in "[a-z][a-z-]{0,20}") {
        prop_assume!(!matches!(
            tag.as_str(),
            "register" | "offer" | "answer" | "ice-candidate" | "message"
                | "contact-request" | "contact-accepted" | "get-online-users" | "ping"
        ));
        let text = serde_json::json!({"type": tag}).to_string();
        match envelope::decode(&text) {
            Err(DecodeError::UnknownType(t)) => prop_assert_eq!(t, tag),
            other => prop_assert!(false, "expected UnknownType, got {:?}", other),
        }
    }
}
