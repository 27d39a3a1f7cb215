#![no_main]

use libfuzzer_sys::fuzz_target;

use clawgate::server::ws::frames::{
    classify, decode_text_frame, truncate_close_reason, ConnectParams, FrameRejection,
    MAX_JSON_DEPTH, MAX_PAYLOAD_BYTES,
};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Small limits as well as the defaults, so the size and depth guards
    // both get exercised.
    for (max_payload, max_depth) in [(MAX_PAYLOAD_BYTES, MAX_JSON_DEPTH), (64, 4)] {
        match decode_text_frame(text, max_payload, max_depth) {
            Ok(request) => {
                assert!(!request.id.is_empty());
                let _ = classify(&request.method);
                if let Some(params) = request.params {
                    let _ = serde_json::from_value::<ConnectParams>(params);
                }
            }
            Err(FrameRejection::Close(reason)) => {
                assert!(truncate_close_reason(&reason).len() <= 123);
            }
            Err(FrameRejection::Reply { .. }) => {}
        }
    }

    assert!(truncate_close_reason(text).len() <= 123);
});
