use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use lucent_http::RequestHead;

use crate::config::ProxyAuthenticator;
use crate::ProxyError;

/// Basic proxy authentication over a `user1:pass1|user2:pass2` credential
/// list, validating the `Proxy-Authorization` header.
#[derive(Debug, Clone)]
pub struct BasicProxyAuth {
    credentials: HashMap<String, String>,
}

impl BasicProxyAuth {
    pub fn new(credentials: &str) -> Result<Self, ProxyError> {
        let mut parsed = HashMap::new();
        for entry in credentials.split('|') {
            let Some((user, password)) = entry.split_once(':') else {
                return Err(ProxyError::InvalidConfig(format!(
                    "invalid proxy auth entry: {entry}"
                )));
            };
            parsed.insert(user.to_string(), password.to_string());
        }
        Ok(Self {
            credentials: parsed,
        })
    }

    pub fn validate(&self, request: &RequestHead) -> Result<(), String> {
        let Some(value) = request.headers.get("Proxy-Authorization") else {
            return Err("missing authentication".to_string());
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return Err("unsupported authentication scheme".to_string());
        };
        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|_| "malformed authorization header".to_string())?;
        let decoded =
            String::from_utf8(decoded).map_err(|_| "malformed authorization header".to_string())?;
        let Some((user, password)) = decoded.split_once(':') else {
            return Err("malformed credentials".to_string());
        };
        match self.credentials.get(user) {
            Some(expected) if expected == password => Ok(()),
            _ => Err("invalid credentials".to_string()),
        }
    }

    pub fn into_authenticator(self) -> ProxyAuthenticator {
        Arc::new(move |request: &RequestHead| self.validate(request))
    }
}
