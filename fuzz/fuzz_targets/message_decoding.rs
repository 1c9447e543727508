#![no_main]

//! Fuzz target for inbound bus message decoding.
//!
//! Every record a consumer loop reads goes through these decoders before
//! anything else touches it. Arbitrary bytes must produce either a value or
//! an error, never a panic.

use chrono::{TimeZone, Utc};
use libfuzzer_sys::fuzz_target;
use notify_core::{topics, DlqErrorMessage, NotificationMessage};
use notify_delivery::channels::{EmailPayload, WebhookPayload};

fuzz_target!(|data: &[u8]| {
    fuzz_message_decoding(data);
});

fn fuzz_message_decoding(data: &[u8]) {
    if let Ok(message) = NotificationMessage::decode(data) {
        // A decoded envelope must re-encode and decode to the same record.
        if let Ok(encoded) = message.encode() {
            let again = NotificationMessage::decode(&encoded);
            assert!(again.is_ok_and(|m| m.notification == message.notification));
        }
        let _ = notify_core::Notification::from(message.notification);
    }

    // The dlq report must accept any payload bytes.
    let at = Utc.timestamp_millis_opt(0).single().unwrap_or_else(Utc::now);
    let report = DlqErrorMessage::deserialization(topics::SEND, 0, 0, data, at);
    assert!(report.encode().is_ok());

    if let Ok(raw) = std::str::from_utf8(data) {
        let _ = EmailPayload::parse(raw);
        let _ = WebhookPayload::parse(raw);
    }
}
