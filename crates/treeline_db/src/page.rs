//! Opaque continuation tokens for child listings.
//!
//! A token is the URL-safe base64 of the last returned row's sort key.
//! Resuming returns rows strictly after that key, so replaying a token
//! yields the same page as long as the listed parent is unchanged.

use crate::error::{DbError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use treeline_protocol::RowSortKey;

pub fn encode_token(key: &RowSortKey) -> Result<String> {
    let json = serde_json::to_vec(key)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

pub fn decode_token(token: &str) -> Result<RowSortKey> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|e| DbError::invalid_token(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| DbError::invalid_token(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_survives_unicode_names() {
        let key = RowSortKey {
            rank: 1,
            name: "résumé 2024.pdf".to_string(),
            path: "/docs/résumé 2024.pdf".to_string(),
        };
        let token = encode_token(&key).unwrap();
        assert!(!token.contains('/'));
        assert_eq!(decode_token(&token).unwrap(), key);
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        assert!(matches!(
            decode_token("not a token!"),
            Err(DbError::InvalidPageToken(_))
        ));
        let not_json = URL_SAFE_NO_PAD.encode(b"hello");
        assert!(matches!(
            decode_token(&not_json),
            Err(DbError::InvalidPageToken(_))
        ));
    }
}
