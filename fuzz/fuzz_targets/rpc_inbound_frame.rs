#![no_main]

use libfuzzer_sys::fuzz_target;
use tabletop_rpc::{classify_inbound_frame, normalize_tool_call_result, InboundFrame};

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    match classify_inbound_frame(value.clone()) {
        InboundFrame::Response { outcome, .. } => {
            let _ = outcome.into_result("fuzz");
        }
        InboundFrame::Notification { method } | InboundFrame::ServerRequest { method, .. } => {
            assert!(value.get("method").is_some());
            let _ = method;
        }
        InboundFrame::Unrecognized { reason } => assert!(!reason.is_empty()),
    }
    let flagged = value
        .get("isError")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    assert_eq!(normalize_tool_call_result(value).is_error, flagged);
});
