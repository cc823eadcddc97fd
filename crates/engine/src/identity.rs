//! Directory key helpers used to bind a device identity

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use uuid::Uuid;

use crate::directory::GroupRecord;

/// Required username length in bytes; the username is a group-id prefix
pub const USERNAME_LEN: usize = 16;

/// Replace characters that are structural in key encoding
pub fn escape_key(value: &str) -> String {
    value.replace(['@', '$'], "X")
}

/// Device id for hardware-identified devices.
///
/// The system identifier (canonical byte order) repeated three times,
/// base64-encoded with `+` and `/` mapped to `@` and `$`.
pub fn amt_node_id(system_id: &Uuid) -> String {
    let id = system_id.as_bytes();
    let mut raw = Vec::with_capacity(id.len() * 3);
    for _ in 0..3 {
        raw.extend_from_slice(id);
    }
    STANDARD.encode(raw).replace('+', "@").replace('/', "$")
}

pub fn device_key(domain: &str, node_id: &str) -> String {
    format!("node/{}/{}", domain, node_id)
}

pub fn group_key(domain: &str, group_id: &str) -> String {
    format!("mesh/{}/{}", domain, group_id)
}

/// First group whose id starts with `username`, compared after escaping both sides
pub fn match_group<'a>(groups: &'a [GroupRecord], username: &str) -> Option<&'a GroupRecord> {
    let wanted = escape_key(username);
    groups.iter().find(|group| {
        let id = group.id.rsplit('/').next().unwrap_or_default();
        escape_key(id).starts_with(&wanted)
    })
}
