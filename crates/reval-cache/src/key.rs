//! Cache key derivation.
//!
//! A key identifies one logical request's cache slot:
//!
//! ```text
//! GET https://api.example.com/users/1
//! POST https://api.example.com/search sha256:9f86d0...
//! ```
//!
//! Bodies are canonicalized with JCS (RFC 8785) before hashing, so two JSON
//! objects that differ only in member order share a key.

use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CacheError, CacheResult};

/// Caller-supplied key deriver, overriding [`derive_key`] for one request.
pub type KeyFn = Arc<dyn Fn(&Method, &str, Option<&Value>) -> CacheResult<String> + Send + Sync>;

/// Default key derivation from method, URL and optional JSON body.
pub fn derive_key(method: &Method, url: &str, body: Option<&Value>) -> CacheResult<String> {
    match body {
        None | Some(Value::Null) => Ok(format!("{} {}", method.as_str(), url)),
        Some(body) => {
            let canonical = serde_jcs::to_string(body).map_err(|e| CacheError::Encoding {
                message: format!("failed to canonicalize request body: {}", e),
            })?;
            Ok(format!(
                "{} {} {}",
                method.as_str(),
                url,
                body_digest(canonical.as_bytes())
            ))
        }
    }
}

fn body_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_without_body() {
        let key = derive_key(&Method::GET, "https://api.test/users/1", None).unwrap();
        assert_eq!(key, "GET https://api.test/users/1");
    }

    #[test]
    fn test_null_body_same_as_none() {
        let a = derive_key(&Method::GET, "https://api.test/a", None).unwrap();
        let b = derive_key(&Method::GET, "https://api.test/a", Some(&Value::Null)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_object_body_order_independent() {
        let a = json!({"query": "rust", "page": 2, "filters": {"lang": "en", "since": 2020}});
        let b = json!({"filters": {"since": 2020, "lang": "en"}, "page": 2, "query": "rust"});

        let ka = derive_key(&Method::POST, "https://api.test/search", Some(&a)).unwrap();
        let kb = derive_key(&Method::POST, "https://api.test/search", Some(&b)).unwrap();
        assert_eq!(ka, kb);
        assert!(ka.starts_with("POST https://api.test/search sha256:"));
    }

    #[test]
    fn test_distinct_bodies_distinct_keys() {
        let a = json!({"query": "rust"});
        let b = json!({"query": "go"});

        let ka = derive_key(&Method::POST, "https://api.test/search", Some(&a)).unwrap();
        let kb = derive_key(&Method::POST, "https://api.test/search", Some(&b)).unwrap();
        assert_ne!(ka, kb);
    }

    #[test]
    fn test_method_disambiguates() {
        let get = derive_key(&Method::GET, "https://api.test/a", None).unwrap();
        let delete = derive_key(&Method::DELETE, "https://api.test/a", None).unwrap();
        assert_ne!(get, delete);
    }
}
