//! Cross-implementation test vectors for treesync.
//!
//! Content hashes travel between client and server, so every
//! implementation has to produce these exact strings.

use treesync_codec::from_json_str;
use treesync_core::TreeNode;

/// A JSON input and the base64 hash of the tree built from it.
#[derive(Debug, Clone, Copy)]
pub struct HashVector {
    /// Unique identifier for this vector.
    pub id: &'static str,
    /// Input document.
    pub json: &'static str,
    /// Expected hash, `None` when the document is null.
    pub expected: Option<&'static str>,
}

impl HashVector {
    /// Computes the hash of [`HashVector::json`].
    ///
    /// # Panics
    ///
    /// Panics if the vector's JSON is malformed.
    pub fn compute(&self) -> Option<String> {
        let value = from_json_str(self.json).expect("vector JSON is valid");
        TreeNode::from_value(&value).hash().map(|h| h.to_base64())
    }
}

/// Hash vectors covering every node type and the key order rules.
pub fn hash_vectors() -> Vec<HashVector> {
    vec![
        HashVector {
            id: "bool_true",
            json: "true",
            expected: Some("E5z61QM0lN/U2WsOnusszCTkR8M="),
        },
        HashVector {
            id: "bool_false",
            json: "false",
            expected: Some("aSSNoqcS4oQwJ2xxH20rvpp3zP0="),
        },
        HashVector {
            id: "number_one",
            json: "1",
            expected: Some("YPVfR2bXt/lcDjiQZ8pOkAd3qkQ="),
        },
        HashVector {
            id: "number_zero",
            json: "0",
            expected: Some("7ysMph9WPitGP7poMnMHMVPtUlI="),
        },
        HashVector {
            id: "number_negative_fraction",
            json: "-0.5",
            expected: Some("/r6we9NY8SVfOWrAH6omHfBJtYA="),
        },
        HashVector {
            id: "string",
            json: r#""hello""#,
            expected: Some("z6sRbrNLwbHX5fdjpvsTtWgXUFc="),
        },
        HashVector {
            id: "string_empty",
            json: r#""""#,
            expected: Some("Ki0Xy0V6morg0TO3Sxi/jwugYDQ="),
        },
        HashVector {
            id: "object_unsorted",
            json: r#"{"b":2,"a":1}"#,
            expected: Some("AUZnXhNqrfbznYVxcCvNpzpjvTU="),
        },
        HashVector {
            id: "object_sorted",
            json: r#"{"a":1,"b":2}"#,
            expected: Some("AUZnXhNqrfbznYVxcCvNpzpjvTU="),
        },
        HashVector {
            id: "integer_keys_first",
            json: r#"{"a":"x","10":"y","9":"z"}"#,
            expected: Some("0PfQFXDHkLsttHTKmYhWJoUq9/c="),
        },
        HashVector {
            id: "nested_null_collapses",
            json: r#"{"a":{"b":null}}"#,
            expected: None,
        },
        HashVector {
            id: "array",
            json: r#"[1,"two",false]"#,
            expected: Some("Fhn9Q1Krj4fEzG50f2UalI+p21g="),
        },
        HashVector {
            id: "nested_object",
            json: r#"{"users":{"u1":{"name":"ada","age":36}}}"#,
            expected: Some("zeziEiOFvx6LznaprsA5sVJfhD8="),
        },
    ]
}

/// Segments in ascending segment order.
pub fn sorted_segments() -> Vec<&'static str> {
    vec!["-10", "-1", "0", "1", "2", "10", "100", "+1", "-", "01a", "A", "a", "b", "z~"]
}
