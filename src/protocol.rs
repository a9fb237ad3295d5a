//! Wire encoding of the authentication handshake.
//!
//! The agent's first sub-stream carries exactly one [`AuthRequest`] frame and
//! receives one [`AuthResponse`] frame back. Payloads are ASCII; the frame
//! layer (4-byte length prefix) is handled by [`crate::framing`].

/// Requested-hostname sentinel asking the server to allocate one.
pub const AUTO_HOSTNAME: &str = "AUTO";

/// Handshake sent by the agent on its first sub-stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRequest {
    pub token: String,
    /// Requested hostname, or [`AUTO_HOSTNAME`] / empty for server-assigned.
    pub hostname: String,
}

impl AuthRequest {
    pub fn new(token: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            hostname: hostname.into(),
        }
    }

    /// True when the agent leaves hostname selection to the server.
    pub fn wants_auto(&self) -> bool {
        self.hostname.is_empty() || self.hostname == AUTO_HOSTNAME
    }

    pub fn encode(&self) -> Vec<u8> {
        format!("AUTHTOKEN:{}\nHOSTNAME:{}\n", self.token, self.hostname).into_bytes()
    }

    /// Line-oriented decode: split on `\n`, each non-empty line splits on the
    /// first `:` into key/value. Unknown keys are ignored; missing keys leave
    /// the field empty. Lines without a `:` are skipped.
    pub fn decode(payload: &[u8]) -> Self {
        let mut msg = Self::default();
        let text = String::from_utf8_lossy(payload);
        for line in text.split('\n') {
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key {
                "AUTHTOKEN" => msg.token = value.to_string(),
                "HOSTNAME" => msg.hostname = value.to_string(),
                _ => {}
            }
        }
        msg
    }
}

/// Server's verdict on an [`AuthRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    /// Handshake accepted; carries the assigned hostname.
    Ok(String),
    /// Handshake rejected; carries a human-readable reason.
    Fail(String),
}

impl AuthResponse {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            AuthResponse::Ok(hostname) => format!("OK:{hostname}").into_bytes(),
            AuthResponse::Fail(reason) => format!("FAIL:{reason}").into_bytes(),
        }
    }

    /// Any payload starting with `OK:` is success; everything else is a
    /// failure whose reason is the remainder after an optional `FAIL:` prefix.
    pub fn decode(payload: &[u8]) -> Self {
        if let Some(hostname) = payload.strip_prefix(b"OK:") {
            return AuthResponse::Ok(String::from_utf8_lossy(hostname).into_owned());
        }
        let reason = payload.strip_prefix(b"FAIL:").unwrap_or(payload);
        AuthResponse::Fail(String::from_utf8_lossy(reason).into_owned())
    }
}
