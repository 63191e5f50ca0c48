//! Fuzz testing harnesses for treesync.
//!
//! These targets can be used with cargo-fuzz or other fuzzing frameworks.
//! Each one either returns normally or panics on a broken invariant.

use treesync_codec::{from_cbor, from_json_str, to_cbor};
use treesync_core::{Cache, Path, TreeNode};
use treesync_protocol::{InboundMessage, OutboundRequest};

/// Fuzz target for inbound frame decoding.
///
/// Arbitrary bytes must either fail to decode or survive an encode/decode
/// cycle unchanged.
pub fn fuzz_inbound_frame(data: &[u8]) {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(message) = InboundMessage::decode(text) {
        let again = InboundMessage::decode(&message.encode());
        assert_eq!(again.as_ref(), Ok(&message), "inbound frame roundtrip mismatch");
    }
}

/// Fuzz target for outbound frame decoding.
pub fn fuzz_outbound_frame(data: &[u8]) {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(request) = OutboundRequest::decode(text) {
        let again = OutboundRequest::decode(&request.encode());
        assert_eq!(again.as_ref(), Ok(&request), "outbound frame roundtrip mismatch");
    }
}

/// Fuzz target for path parsing.
pub fn fuzz_path_parse(data: &[u8]) {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(path) = Path::parse(text) {
        assert_eq!(Path::parse(&path.to_string()).as_ref(), Ok(&path));
    }
}

/// Fuzz target for JSON and snapshot decoding. Must never panic.
pub fn fuzz_value_decode(data: &[u8]) {
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = from_json_str(text);
    }
    if let Ok(value) = from_cbor(data) {
        let _ = to_cbor(&value);
    }
    let _ = Cache::from_snapshot(data);
}

/// Fuzz target for cache mutations.
///
/// Bytes are read in groups of three: an opcode, a path selector and a
/// value selector. The structural invariants are checked after each step.
pub fn fuzz_cache_operations(data: &[u8]) {
    const SEGMENTS: [&str; 4] = ["a", "b", "1", "10"];
    let mut cache = Cache::new();

    for chunk in data.chunks_exact(3) {
        let (op, path_bits, value_bits) = (chunk[0], chunk[1], chunk[2]);
        let depth = usize::from(path_bits & 0x3);
        let segments = (0..depth).map(|i| SEGMENTS[usize::from(path_bits >> (2 + 2 * i)) & 0x3]);
        let Ok(path) = Path::from_segments(segments) else {
            continue;
        };
        let value = match value_bits % 5 {
            0 => treesync_codec::Value::Null,
            1 => treesync_codec::Value::Bool(value_bits & 0x80 != 0),
            2 => treesync_codec::Value::Number(f64::from(value_bits)),
            3 => treesync_codec::Value::object([(
                SEGMENTS[usize::from(value_bits >> 6)],
                treesync_codec::Value::from(i32::from(value_bits)),
            )]),
            _ => treesync_codec::Value::object([(
                SEGMENTS[usize::from(value_bits >> 6)],
                treesync_codec::Value::Null,
            )]),
        };

        if op & 1 == 0 {
            cache.put(&path, &value);
        } else {
            cache.merge(&path, &value);
        }
        if let Err(err) = check_cache(&cache) {
            panic!("cache invariant broken after {op:#04x} at {path}: {err}");
        }
    }
}

/// Checks the structural invariants of a cache.
///
/// - No internal node is empty and no child is null
/// - Every child map is balanced and sorted
/// - Cached hashes match a tree rebuilt from scratch
///
/// # Errors
///
/// Returns a description of the first violation found.
pub fn check_cache(cache: &Cache) -> Result<(), String> {
    check_node(cache.root(), &Path::root())?;
    let rebuilt = TreeNode::from_value(&cache.root().to_value());
    if rebuilt.hash() != cache.root().hash() {
        return Err("cached root hash differs from a fresh rebuild".to_string());
    }
    Ok(())
}

fn check_node(node: &TreeNode, at: &Path) -> Result<(), String> {
    let Some(children) = node.children() else {
        return Ok(());
    };
    if children.is_empty() {
        return Err(format!("empty internal node at {at}"));
    }
    children.assert_valid().map_err(|e| format!("at {at}: {e}"))?;
    for (key, child) in children {
        let path = at.child(key.as_str()).map_err(|e| e.to_string())?;
        if child.is_null() {
            return Err(format!("null child at {path}"));
        }
        check_node(child, &path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_targets_accept_garbage() {
        fuzz_inbound_frame(b"");
        fuzz_inbound_frame(b"\xff\xfe");
        fuzz_inbound_frame(br#"{"t":"d","a":"p","b":{"p":"/a","d":{"x":1}}}"#);
        fuzz_inbound_frame(br#"{"t":"r","r":4,"s":"ok"}"#);
        fuzz_outbound_frame(br#"{"r":1,"a":"l","b":{"p":"/a"}}"#);
        fuzz_outbound_frame(br#"{"r":-1}"#);
    }

    #[test]
    fn path_target_accepts_garbage() {
        fuzz_path_parse(b"/a/b/");
        fuzz_path_parse(b"/a/.b");
        fuzz_path_parse(b"////");
    }

    #[test]
    fn value_target_accepts_garbage() {
        fuzz_value_decode(b"");
        fuzz_value_decode(b"{\"a\":[1,2,{}]}");
        fuzz_value_decode(&[0xa1, 0x61, 0x61, 0xf5]);
        fuzz_value_decode(&[0xff, 0x00, 0x13]);
    }

    #[test]
    fn cache_target_runs() {
        let data: Vec<u8> = (0u8..=255).collect();
        fuzz_cache_operations(&data);
        fuzz_cache_operations(&data.iter().rev().copied().collect::<Vec<_>>());
    }
}
