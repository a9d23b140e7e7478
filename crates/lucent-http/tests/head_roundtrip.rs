use lucent_http::{parse_request_head, parse_response_head};
use proptest::collection::vec;
use proptest::prelude::*;

fn header_pairs() -> impl Strategy<Value = Vec<(String, String)>> {
    vec(
        ("[A-Za-z][A-Za-z0-9-]{0,11}", "[A-Za-z0-9_.-]{0,16}"),
        0..6,
    )
}

proptest! {
    #[test]
    fn request_head_parse_is_encode_stable(
        method in "[A-Z]{3,7}",
        path in "/[a-z0-9/]{0,16}",
        headers in header_pairs(),
    ) {
        let mut raw = format!("{method} {path} HTTP/1.1\r\n");
        for (name, value) in &headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        raw.push_str("\r\n");

        let parsed = parse_request_head(raw.as_bytes()).expect("parse generated head");
        prop_assert_eq!(&parsed.method, &method);
        prop_assert_eq!(&parsed.target, &path);
        prop_assert_eq!(parsed.headers.len(), headers.len());

        let reparsed = parse_request_head(&parsed.encode()).expect("reparse encoded head");
        prop_assert_eq!(parsed, reparsed);
    }

    #[test]
    fn response_head_parse_is_encode_stable(
        status in 100_u16..600,
        reason in "[A-Za-z][A-Za-z ]{0,14}[A-Za-z]",
        headers in header_pairs(),
    ) {
        prop_assume!(!reason.contains("  "));

        let mut raw = format!("HTTP/1.1 {status} {reason}\r\n");
        for (name, value) in &headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        raw.push_str("\r\n");

        let parsed = parse_response_head(raw.as_bytes()).expect("parse generated head");
        prop_assert_eq!(parsed.status, status);
        prop_assert_eq!(&parsed.reason, &reason);

        let reparsed = parse_response_head(&parsed.encode()).expect("reparse encoded head");
        prop_assert_eq!(parsed, reparsed);
    }
}
