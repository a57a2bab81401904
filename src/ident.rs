//! Wire-compatible identifier and signature generation.
//!
//! The marketplace web client generates these values in JavaScript; the
//! formats are load-bearing (the backend rejects frames with ids it does not
//! recognize), so they are reproduced here exactly.

use md5::{Digest, Md5};
use rand::Rng;

/// Fixed h5 application key; acts as the signing key for mtop requests.
pub const MTOP_APP_KEY: &str = "34839810";

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Message id for an outgoing frame: random 0..1000 prefix, millisecond
/// timestamp, literal " 0" suffix.
pub fn generate_mid() -> String {
    let prefix = rand::thread_rng().gen_range(0..1000);
    format!("{}{} 0", prefix, now_millis())
}

/// Client-side uuid for an outgoing chat message.
pub fn generate_uuid() -> String {
    format!("-{}1", now_millis())
}

/// Device id derived deterministically from the owner id: a UUIDv4-shaped
/// string seeded from MD5(user_id), suffixed with the user id itself. The
/// same account always registers with the same device id.
pub fn device_id_for(user_id: &str) -> String {
    let digest = Md5::digest(user_id.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();

    let mut chars: Vec<char> = hex.chars().collect();
    // Force version and variant nibbles so the shape is a valid v4 uuid.
    chars[12] = '4';
    chars[16] = match chars[16] {
        '0' | '4' | '8' | 'c' => '8',
        '1' | '5' | '9' | 'd' => '9',
        '2' | '6' | 'a' | 'e' => 'a',
        _ => 'b',
    };

    let s: String = chars.into_iter().collect();
    format!(
        "{}-{}-{}-{}-{}-{}",
        &s[0..8],
        &s[8..12],
        &s[12..16],
        &s[16..20],
        &s[20..32],
        user_id
    )
}

/// mtop request signature: MD5 over `token&timestamp&app_key&payload`,
/// lowercase hex.
pub fn sign_request(timestamp: &str, token: &str, payload: &str) -> String {
    let input = format!("{}&{}&{}&{}", token, timestamp, MTOP_APP_KEY, payload);
    let digest = Md5::digest(input.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
