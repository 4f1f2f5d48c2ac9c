use std::sync::OnceLock;

const DEFAULT_PREVIEW_BYTES: usize = 256;

static WIRE_TRACE: OnceLock<bool> = OnceLock::new();
static PREVIEW_BYTES: OnceLock<usize> = OnceLock::new();

/// `TANDEM_WIRE_TRACE=1` logs every gateway frame under the `wire` target.
pub fn wire_trace_enabled() -> bool {
    *WIRE_TRACE.get_or_init(|| {
        std::env::var("TANDEM_WIRE_TRACE")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    })
}

pub fn wire_trace_payload_preview(payload: &str) -> String {
    let limit = *PREVIEW_BYTES.get_or_init(|| {
        std::env::var("TANDEM_WIRE_TRACE_PREVIEW_BYTES")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_PREVIEW_BYTES)
    });
    truncate_preview(payload, limit)
}

fn truncate_preview(payload: &str, limit: usize) -> String {
    if payload.len() <= limit {
        return payload.to_string();
    }
    let mut end = limit;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(+{} bytes)", &payload[..end], payload.len() - end)
}

#[cfg(test)]
mod tests {
    use super::truncate_preview;

    #[test]
    fn short_payloads_pass_through() {
        assert_eq!(truncate_preview(r#"{"type":"ping"}"#, 256), r#"{"type":"ping"}"#);
    }

    #[test]
    fn long_payloads_are_cut_on_a_char_boundary() {
        let preview = truncate_preview("héllo", 2);
        assert_eq!(preview, "h...(+5 bytes)");
    }
}
