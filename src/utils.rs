//! Small stateless helpers shared across components.

use rand::distributions::{Distribution, Uniform};

/// The reserved device name telemetry is rewritten to when it originates
/// from the gateway's own random self-identity connector name (spec §3,
/// §4.3 step 1).
pub const SELF_DEVICE_NAME: &str = "currentThingsBoardGateway";

/// Generates the gateway's random 64-character lowercase identity used to
/// recognize self-originated telemetry (spec §3).
pub fn generate_gateway_name() -> String {
    let mut rng = rand::thread_rng();
    let dist = Uniform::from(b'a'..=b'z');
    (0..64).map(|_| dist.sample(&mut rng) as char).collect()
}

/// Millisecond Unix timestamp, the unit every `ts` field in this crate uses.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_name_is_64_lowercase_ascii() {
        crate::test_log::init();
        let name = generate_gateway_name();
        assert_eq!(name.len(), 64);
        assert!(name.chars().all(|c| c.is_ascii_lowercase()));
    }
}
